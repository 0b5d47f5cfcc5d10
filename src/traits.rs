use async_trait::async_trait;

use crate::error::FetchError;
use crate::error::TransportError;
use crate::types::ProgressSink;
use crate::types::TransportRequest;
use crate::types::TransportResponse;

/// For types that are in charge of talking to the remote store.
///
/// A transport only has to deliver a status code and a body. Abort, timeout and network errors are all collapsed into
/// a [`TransportError`]; anything that produced a status code, even a failing one, is a response.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: TransportRequest, progress: ProgressSink)
        -> Result<TransportResponse, TransportError>;
}

/// Pluggable logger. Every event is also emitted with `tracing`; an observer is for those who want to react to them
/// programmatically.
///
/// Observers are never called while internal locks are held, so it's safe to call back into the manager.
pub trait Observer: Send + Sync + 'static {
    fn on_warning(&self, _message: &str) {}
    fn on_error(&self, _error: &FetchError) {}
    fn on_debug(&self, _message: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}
