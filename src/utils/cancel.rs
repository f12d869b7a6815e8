//! Cancellation handles.
//!
//! One handle per request, shared between the pipeline, any in-flight
//! upstream call and the stream pump. Dropping a cancelled stream closes
//! the underlying HTTP connection so providers stop generating tokens.

use tokio_util::sync::CancellationToken;

/// Cheap-to-clone cancellation handle backed by a [`CancellationToken`].
#[derive(Clone, Debug)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Request cancellation. Anything observing this handle stops as soon
    /// as possible.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once cancellation is requested; for `select!`-style waits.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Create a standalone cancel handle that can be shared across tasks.
/// One handle serves as the single abort signal for a whole pipeline run.
pub fn new_cancel_handle() -> CancelHandle {
    CancelHandle { token: CancellationToken::new() }
}
