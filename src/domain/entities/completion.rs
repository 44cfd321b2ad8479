//! Completion delivery for load consumers.

use tokio::sync::mpsc;
use tracing::trace;

use super::image::LoadOutcome;

type Callback = Box<dyn FnOnce(LoadOutcome) + Send + 'static>;

/// Receives the outcome of one load registration, at most once.
///
/// Prefer [`Completion::channel`]: outcomes are posted to a channel the
/// caller drains on its own task. [`Completion::new`] runs the callback on
/// whichever thread finishes the load.
pub struct Completion(Callback);

impl Completion {
    /// Wraps a callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(LoadOutcome) + Send + 'static,
    {
        Self(Box::new(callback))
    }

    /// Posts the outcome to `tx`. A closed receiver drops it silently.
    #[must_use]
    pub fn channel(tx: mpsc::UnboundedSender<LoadOutcome>) -> Self {
        Self::new(move |outcome| {
            if let Err(e) = tx.send(outcome) {
                trace!(id = %e.0.id, "Completion receiver gone, dropping outcome");
            }
        })
    }

    pub(crate) fn complete(self, outcome: LoadOutcome) {
        (self.0)(outcome);
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

impl From<mpsc::UnboundedSender<LoadOutcome>> for Completion {
    fn from(tx: mpsc::UnboundedSender<LoadOutcome>) -> Self {
        Self::channel(tx)
    }
}
