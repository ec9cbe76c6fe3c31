use std::time::Duration;

/// What the runtime should do with a key after a reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile the key again after `duration`, even without a change
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Wait for the next watch event or resync
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Requeue delay, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}
