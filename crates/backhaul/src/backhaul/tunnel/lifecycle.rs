use tokio_util::sync::CancellationToken;

/// Stop/completion signal pair shared by every long-running tunnel actor.
///
/// `close` requests a stop and then waits until the actor's run loop has
/// dropped its [`DoneGuard`].
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    stop: CancellationToken,
    done: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observed by the run loop.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Fires the completion signal when dropped.
    pub fn guard(&self) -> DoneGuard {
        DoneGuard {
            done: self.done.clone(),
        }
    }

    /// Signal stop and block until the run loop has fully unwound.
    pub async fn close(&self) {
        self.stop.cancel();
        self.done.cancelled().await;
    }
}

#[derive(Debug)]
pub struct DoneGuard {
    done: CancellationToken,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.done.cancel();
    }
}
