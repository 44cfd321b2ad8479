//! Bounded job scheduler for image loads.
//!
//! Each submission reserves its place in a FIFO admission queue before the
//! job task is even spawned, so start order is submission order regardless
//! of how the runtime polls tasks. A job then races three things: its own
//! work, its deadline (counted from submission, so queue time is included)
//! and its cancel signal. Whichever wins decides the [`JobResult`] handed to
//! the job's completion hook. Losing branches are dropped, which interrupts
//! in-flight I/O and gives the job's slot to the next one in line.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::domain::errors::LoadError;

/// Outcome of a scheduled job.
pub type JobResult<T> = Result<T, JobError>;

/// Why a job produced no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The deadline passed, either while queued or while running.
    #[error("job exceeded its {}ms deadline", .0.as_millis())]
    TimedOut(Duration),
    /// The job's handle was cancelled.
    #[error("job cancelled")]
    Cancelled,
    /// The job's work panicked.
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl From<JobError> for LoadError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::TimedOut(after) => Self::Timeout { after },
            JobError::Cancelled => Self::Cancelled,
            JobError::Panicked(message) => Self::worker(message),
        }
    }
}

#[derive(Debug)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cancellable handle to a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: u64,
    state: Arc<CancelState>,
}

impl JobHandle {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Returns the scheduler-assigned job number.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Cancels the job. Queued jobs never start; running jobs are dropped
    /// at their next suspension point. Idempotent.
    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::SeqCst) {
            // notify_one stores a permit, so a job not yet polled still sees it.
            self.state.notify.notify_one();
            trace!(job = self.id, "Job cancelled");
        }
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct AdmissionState {
    running: usize,
    waiting: VecDeque<oneshot::Sender<Slot>>,
}

/// FIFO gate allowing at most `capacity` jobs to run at once.
#[derive(Debug)]
struct Admission {
    capacity: usize,
    state: Mutex<AdmissionState>,
}

impl Admission {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(AdmissionState::default()),
        })
    }

    /// Takes a free slot now, or a place at the back of the queue.
    fn reserve(self: &Arc<Self>) -> Reservation {
        let mut state = self.state.lock();
        if state.running < self.capacity {
            state.running += 1;
            Reservation::Admitted(Slot::new(self.clone()))
        } else {
            let (tx, rx) = oneshot::channel();
            state.waiting.push_back(tx);
            Reservation::Queued(rx)
        }
    }

    /// Passes a freed slot to the oldest live waiter, or returns it.
    fn release(self: &Arc<Self>) {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                match state.waiting.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        state.running = state.running.saturating_sub(1);
                        return;
                    }
                }
            };
            // Sent outside the lock: a rejected slot is disarmed, never dropped armed.
            match waiter.send(Slot::new(self.clone())) {
                Ok(()) => return,
                Err(mut slot) => slot.disarm(),
            }
        }
    }

    fn running(&self) -> usize {
        self.state.lock().running
    }

    fn queued(&self) -> usize {
        self.state
            .lock()
            .waiting
            .iter()
            .filter(|w| !w.is_closed())
            .count()
    }
}

/// A running job's claim on one admission slot. Released on drop.
#[derive(Debug)]
struct Slot {
    admission: Option<Arc<Admission>>,
}

impl Slot {
    const fn new(admission: Arc<Admission>) -> Self {
        Self {
            admission: Some(admission),
        }
    }

    fn disarm(&mut self) {
        self.admission = None;
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            admission.release();
        }
    }
}

enum Reservation {
    Unbounded,
    Admitted(Slot),
    Queued(oneshot::Receiver<Slot>),
}

impl Reservation {
    async fn admitted(self) -> Option<Slot> {
        match self {
            Self::Unbounded => None,
            Self::Admitted(slot) => Some(slot),
            // A closed queue can only mean its bound was replaced; run unbounded.
            Self::Queued(rx) => rx.await.ok(),
        }
    }
}

#[derive(Debug)]
struct Limits {
    max_concurrent: usize,
    timeout: Option<Duration>,
    admission: Option<Arc<Admission>>,
}

impl Limits {
    fn new(max_concurrent: usize, timeout: Option<Duration>) -> Self {
        Self {
            max_concurrent,
            timeout: timeout.filter(|t| !t.is_zero()),
            admission: (max_concurrent > 0).then(|| Admission::new(max_concurrent)),
        }
    }
}

/// Bounded worker pool with per-job deadlines.
///
/// `max_concurrent == 0` means unbounded. A zero or absent timeout means
/// no deadline. Limit changes apply to jobs submitted afterwards.
pub struct Scheduler {
    runtime: Handle,
    limits: RwLock<Limits>,
    next_id: AtomicU64,
}

impl Scheduler {
    /// Creates a scheduler that spawns jobs onto `runtime`.
    #[must_use]
    pub fn new(runtime: Handle, max_concurrent: usize, timeout: Option<Duration>) -> Self {
        Self {
            runtime,
            limits: RwLock::new(Limits::new(max_concurrent, timeout)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the concurrency bound, 0 if unbounded.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.limits.read().max_concurrent
    }

    /// Replaces the concurrency bound for future submissions.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let mut limits = self.limits.write();
        let timeout = limits.timeout;
        *limits = Limits::new(max_concurrent, timeout);
        debug!(max_concurrent, "Scheduler concurrency updated");
    }

    /// Returns the per-job deadline, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.limits.read().timeout
    }

    /// Replaces the per-job deadline for future submissions.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.limits.write().timeout = timeout.filter(|t| !t.is_zero());
        debug!(?timeout, "Scheduler timeout updated");
    }

    /// Returns the number of admitted jobs under the current bound.
    #[must_use]
    pub fn running(&self) -> usize {
        self.limits
            .read()
            .admission
            .as_ref()
            .map_or(0, |a| a.running())
    }

    /// Returns the number of jobs waiting for a slot under the current bound.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.limits
            .read()
            .admission
            .as_ref()
            .map_or(0, |a| a.queued())
    }

    /// Submits `work`; `on_done` receives its result exactly once, on the
    /// job's task, whatever the outcome.
    pub fn submit<T, W, D, DF>(&self, work: W, on_done: D) -> JobHandle
    where
        T: Send + 'static,
        W: Future<Output = T> + Send + 'static,
        D: FnOnce(JobResult<T>) -> DF + Send + 'static,
        DF: Future<Output = ()> + Send + 'static,
    {
        let submitted = Instant::now();
        let (reservation, timeout) = {
            let limits = self.limits.read();
            let reservation = limits
                .admission
                .as_ref()
                .map_or(Reservation::Unbounded, Admission::reserve);
            (reservation, limits.timeout)
        };
        let handle = JobHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = handle.state.clone();
        let job = handle.id;
        let deadline = timeout.map(|t| (submitted + t, t));

        trace!(job, ?timeout, "Job submitted");

        self.runtime.spawn(async move {
            let result = run_job(job, work, reservation, deadline, &cancel).await;
            on_done(result).await;
        });

        handle
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("limits", &*self.limits.read())
            .finish_non_exhaustive()
    }
}

async fn run_job<T, W>(
    job: u64,
    work: W,
    reservation: Reservation,
    deadline: Option<(Instant, Duration)>,
    cancel: &CancelState,
) -> JobResult<T>
where
    W: Future<Output = T> + Send,
{
    let admitted = async move {
        let _slot = reservation.admitted().await;
        trace!(job, "Job started");
        AssertUnwindSafe(work)
            .catch_unwind()
            .await
            .map_err(|panic| JobError::Panicked(panic_message(panic.as_ref())))
    };

    let bounded = async move {
        match deadline {
            Some((at, after)) => tokio::time::timeout_at(at, admitted)
                .await
                .map_err(|_| JobError::TimedOut(after))?,
            None => admitted.await,
        }
    };

    let result = tokio::select! {
        biased;
        () = cancel.notify.notified() => Err(JobError::Cancelled),
        result = bounded => result,
    };

    match &result {
        Ok(_) => trace!(job, "Job finished"),
        Err(JobError::Panicked(message)) => warn!(job, %message, "Job panicked"),
        Err(e) => debug!(job, error = %e, "Job stopped"),
    }
    result
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
