use std::future::Future;

use session_core::{ConnectionEvent, CredentialState, InstanceId};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to open transport session: {0}")]
    Open(String),
    #[error("transport teardown failed: {0}")]
    Teardown(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Control surface of one live transport session.
///
/// Both calls are best-effort; the controller bounds them with a timeout and
/// ignores their errors.
pub trait TransportHandle: Send + Sync + 'static {
    fn request_logout(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// An opened session: its handle plus the event stream it feeds.
///
/// The stream ending without a `Closed` event is read as an unexplained closure.
#[derive(Debug)]
pub struct TransportSession<H> {
    pub handle: H,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// Protocol implementation owning the wire session to the messaging network.
pub trait Transport: Send + Sync + 'static {
    type Handle: TransportHandle;

    fn open(
        &self,
        instance_id: &InstanceId,
        credentials: CredentialState,
    ) -> impl Future<Output = Result<TransportSession<Self::Handle>, TransportError>> + Send;
}
