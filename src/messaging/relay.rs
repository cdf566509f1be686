use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::messaging::endpoint::EndpointInfo;
use crate::messaging::message::Message;
use crate::util::backoff::RecoverablePredicate;


#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PrepareResponse {
    pub ice_servers: Vec<IceServer>,
}

/// The stateless request/response relay that all messages travel through. Cancelling a call is
///  done by dropping its future.
///
/// Implementations carry each message as the bytes of [Message::ser] and turn received bytes
///  back into messages with [Message::try_deser].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RelayClient: Send + Sync + 'static {
    /// bootstrap call, returns media connection configuration
    async fn prepare(&self) -> anyhow::Result<PrepareResponse>;

    /// The relay may piggyback messages for the sender on the response.
    async fn send(&self, msg: Message) -> anyhow::Result<Vec<Message>>;

    /// long poll for messages addressed to `info`, returning an empty list when `timeout` passes
    ///  without messages
    async fn recv(&self, info: EndpointInfo, timeout: Duration) -> anyhow::Result<Vec<Message>>;
}


#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RelayErrorCode {
    Canceled,
    Unknown,
    InvalidArgument,
    Malformed,
    DeadlineExceeded,
    NotFound,
    BadRoute,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl RelayErrorCode {
    /// Codes that will not go away by retrying the same request
    pub fn is_fatal(&self) -> bool {
        use RelayErrorCode::*;
        matches!(self, PermissionDenied | InvalidArgument | Aborted | BadRoute | DataLoss | Malformed | NotFound | Unauthenticated)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("relay call failed with {code:?}: {message}")]
pub struct RelayError {
    pub code: RelayErrorCode,
    pub message: String,
}

impl RelayError {
    pub fn new(code: RelayErrorCode, message: impl Into<String>) -> RelayError {
        RelayError {
            code,
            message: message.into(),
        }
    }
}

/// Treats [RelayError]s with a fatal code as unrecoverable, everything else (including timeouts
///  and errors from other layers) as recoverable.
pub fn is_recoverable_relay_error(e: &anyhow::Error) -> bool {
    match e.downcast_ref::<RelayError>() {
        Some(relay_error) => !relay_error.code.is_fatal(),
        None => true,
    }
}

pub fn default_recoverable_predicate() -> RecoverablePredicate {
    Arc::new(is_recoverable_relay_error)
}
