//! Pending request bookkeeping and coalescing.
//!
//! One [`PendingRequest`] exists per identifier with a fetch in flight. Later
//! requests for the same identifier join it as extra consumers instead of
//! starting another fetch. The table is plain data; the loader guards it
//! with a mutex and never invokes completions while holding that lock.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::time::Instant;

use tracing::{trace, warn};

use super::scheduler::{JobHandle, panic_message};
use crate::domain::entities::{
    Completion, ImageId, LoadOutcome, ResolvedImage, Target, TargetId, TargetRef,
};
use crate::domain::errors::LoadError;

/// One caller's interest in an identifier.
#[derive(Debug)]
pub struct Consumer {
    target: Option<TargetRef>,
    completion: Option<Completion>,
    destination: Option<PathBuf>,
    registered_at: Instant,
}

impl Consumer {
    /// Creates a consumer bound to an optional target.
    #[must_use]
    pub fn new(
        target: Option<&Target>,
        completion: Option<Completion>,
        destination: Option<PathBuf>,
    ) -> Self {
        Self {
            target: target.map(Target::downgrade),
            completion,
            destination,
            registered_at: Instant::now(),
        }
    }

    fn target_id(&self) -> Option<TargetId> {
        self.target.as_ref().map(TargetRef::id)
    }

    fn is_bound_to(&self, target: TargetId) -> bool {
        self.target_id() == Some(target)
    }

    fn is_disposed(&self) -> bool {
        self.target.as_ref().is_some_and(|t| !t.is_alive())
    }
}

/// Identifies one generation of pending request for an identifier.
///
/// A request cancelled and re-registered while its old job is still
/// winding down gets a new token; the old job's result is then ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(u64);

/// Result of [`RequestTable::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First consumer: the caller must start the fetch.
    NewFetch(RequestToken),
    /// Joined a fetch already in flight.
    Joined,
    /// Same target already waiting; its registration was refreshed in place.
    Refreshed,
}

impl Registration {
    /// Returns true only for the registration that must start the fetch.
    #[must_use]
    pub const fn is_new_fetch(&self) -> bool {
        matches!(self, Self::NewFetch(_))
    }
}

#[derive(Debug)]
struct PendingRequest {
    token: RequestToken,
    consumers: Vec<Consumer>,
    job: Option<JobHandle>,
}

/// Consumers removed from the table together with the fetch they awaited.
#[derive(Debug)]
pub struct Drained {
    id: ImageId,
    consumers: Vec<Consumer>,
}

impl Drained {
    /// Destination paths requested by the drained consumers, deduplicated.
    #[must_use]
    pub fn destinations(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for path in self.consumers.iter().filter_map(|c| c.destination.clone()) {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }

    /// Number of drained consumers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    /// Returns true if nobody was waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Invokes every completion in registration order and returns how many
    /// returned normally.
    ///
    /// Consumers whose target has been disposed are skipped. A panicking
    /// completion is logged and does not stop delivery to the rest.
    pub fn deliver(self, resolution: &Result<ResolvedImage, LoadError>) -> usize {
        let mut delivered = 0;
        for consumer in self.consumers {
            if consumer.is_disposed() {
                trace!(id = %self.id, "Skipping consumer with disposed target");
                continue;
            }
            let target = consumer.target_id();
            let Some(completion) = consumer.completion else {
                continue;
            };
            let waited = consumer.registered_at.elapsed();
            trace!(
                id = %self.id,
                waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                "Delivering load outcome"
            );
            let outcome = LoadOutcome::resolved(self.id.clone(), resolution, target);
            match catch_unwind(AssertUnwindSafe(|| completion.complete(outcome))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(id = %self.id, %message, "Load completion panicked");
                }
            }
        }
        delivered
    }
}

/// Pending requests keyed by identifier.
#[derive(Debug, Default)]
pub struct RequestTable {
    entries: HashMap<ImageId, PendingRequest>,
    next_token: u64,
}

impl RequestTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `consumer` to the pending set for `id`, creating it if absent.
    ///
    /// A consumer whose target already waits on `id` replaces the earlier
    /// registration's completion and destination but keeps its position.
    pub fn register(&mut self, id: &ImageId, consumer: Consumer) -> Registration {
        if let Some(entry) = self.entries.get_mut(id) {
            if let Some(target) = consumer.target_id()
                && let Some(existing) = entry.consumers.iter_mut().find(|c| c.is_bound_to(target))
            {
                existing.completion = consumer.completion;
                if consumer.destination.is_some() {
                    existing.destination = consumer.destination;
                }
                existing.target = consumer.target;
                trace!(id = %id, target = %target, "Refreshed pending consumer");
                return Registration::Refreshed;
            }
            entry.consumers.push(consumer);
            trace!(id = %id, consumers = entry.consumers.len(), "Joined pending request");
            return Registration::Joined;
        }

        self.next_token += 1;
        let token = RequestToken(self.next_token);
        self.entries.insert(
            id.clone(),
            PendingRequest {
                token,
                consumers: vec![consumer],
                job: None,
            },
        );
        trace!(id = %id, "Created pending request");
        Registration::NewFetch(token)
    }

    /// Records the job serving the request `token`. Returns false if stale.
    pub fn attach_job(&mut self, id: &ImageId, token: RequestToken, job: JobHandle) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if entry.token == token => {
                entry.job = Some(job);
                true
            }
            _ => false,
        }
    }

    /// Returns true if `token` is still the live request for `id`.
    #[must_use]
    pub fn is_current(&self, id: &ImageId, token: RequestToken) -> bool {
        self.entries.get(id).is_some_and(|e| e.token == token)
    }

    /// Destination paths of everyone currently waiting on `id`.
    #[must_use]
    pub fn destinations(&self, id: &ImageId) -> Vec<PathBuf> {
        self.entries
            .get(id)
            .map(|e| {
                e.consumers
                    .iter()
                    .filter_map(|c| c.destination.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes the request `token` for `id` and hands back its consumers.
    pub fn drain(&mut self, id: &ImageId, token: RequestToken) -> Option<Drained> {
        if !self.is_current(id, token) {
            return None;
        }
        let entry = self.entries.remove(id)?;
        Some(Drained {
            id: id.clone(),
            consumers: entry.consumers,
        })
    }

    /// Removes the request `token` for `id` without notifying anyone.
    pub fn discard(&mut self, id: &ImageId, token: RequestToken) -> bool {
        if self.is_current(id, token) {
            self.entries.remove(id);
            true
        } else {
            false
        }
    }

    /// Removes every consumer bound to `target`. Returns the jobs of
    /// requests left with no consumers; those requests are gone.
    pub fn cancel_for_target(&mut self, target: TargetId) -> Vec<JobHandle> {
        let mut orphaned = Vec::new();
        self.entries.retain(|id, entry| {
            let before = entry.consumers.len();
            entry.consumers.retain(|c| !c.is_bound_to(target));
            if entry.consumers.len() != before {
                trace!(id = %id, target = %target, "Cancelled consumers for target");
            }
            if entry.consumers.is_empty() {
                orphaned.extend(entry.job.take());
                false
            } else {
                true
            }
        });
        orphaned
    }

    /// Removes every consumer of `id`. Returns the request's job, if any.
    pub fn cancel_for_id(&mut self, id: &ImageId) -> Option<JobHandle> {
        let entry = self.entries.remove(id)?;
        trace!(id = %id, consumers = entry.consumers.len(), "Cancelled pending request");
        entry.job
    }

    /// Removes the consumers of `id` bound to `target`. Returns the
    /// request's job if that left the request with no consumers.
    pub fn cancel_for_id_and_target(
        &mut self,
        id: &ImageId,
        target: TargetId,
    ) -> Option<JobHandle> {
        let entry = self.entries.get_mut(id)?;
        entry.consumers.retain(|c| !c.is_bound_to(target));
        if entry.consumers.is_empty() {
            return self.cancel_for_id(id);
        }
        None
    }

    /// Empties the table, returning every job that was serving it.
    pub fn clear(&mut self) -> Vec<JobHandle> {
        self.entries
            .drain()
            .filter_map(|(_, entry)| entry.job)
            .collect()
    }

    /// Returns true if a request for `id` is pending.
    #[must_use]
    pub fn contains(&self, id: &ImageId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of consumers waiting on `id`.
    #[must_use]
    pub fn consumer_count(&self, id: &ImageId) -> usize {
        self.entries.get(id).map_or(0, |e| e.consumers.len())
    }

    /// Number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
