//! Handle passed into every managed operation.

use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
pub(crate) type CleanupHook = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// Cancellation, partial results and cleanup registration for one execution.
///
/// Cloning is cheap; every clone refers to the same execution. Cleanup hooks
/// run only when the execution is cancelled or times out.
#[derive(Clone)]
pub struct ExecutionScope {
    token: CancellationToken,
    allow_partial_results: bool,
    partials: Arc<Mutex<Vec<Value>>>,
    cleanups: Arc<Mutex<Vec<CleanupHook>>>,
}

impl std::fmt::Debug for ExecutionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionScope")
            .field("cancelled", &self.token.is_cancelled())
            .field("partials", &self.partials.lock().len())
            .field("cleanups", &self.cleanups.lock().len())
            .finish()
    }
}

impl ExecutionScope {
    pub fn new(token: CancellationToken, allow_partial_results: bool) -> Self {
        Self {
            token,
            allow_partial_results,
            partials: Arc::new(Mutex::new(Vec::new())),
            cleanups: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Token for a nested sub-operation. Cancelled with this scope, never the
    /// other way round.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Keep an interim result. Returns false when partial results are disabled.
    pub fn push_partial(&self, value: Value) -> bool {
        if !self.allow_partial_results {
            return false;
        }
        self.partials.lock().push(value);
        true
    }

    pub fn partial_results(&self) -> Vec<Value> {
        self.partials.lock().clone()
    }

    /// Register a release step for a resource the operation acquired.
    pub fn on_cleanup<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.cleanups
            .lock()
            .push(Box::new(move || Box::pin(hook()) as CleanupFuture));
    }

    pub(crate) fn take_partials(&self) -> Vec<Value> {
        std::mem::take(&mut *self.partials.lock())
    }

    pub(crate) fn take_cleanups(&self) -> Vec<CleanupHook> {
        std::mem::take(&mut *self.cleanups.lock())
    }
}
