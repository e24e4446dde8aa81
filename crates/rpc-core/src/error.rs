use std::time::Duration;

use thiserror::Error;

/// Wire-stable classification of a remote or local failure.
///
/// This is the taxonomy from the error handling design: a small `Copy` tag
/// that round-trips on an `Error` message, independent of whatever
/// [`std::error::Error`] the local side actually raised.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Malformed frame, duplicate id, oversize message. Always fatal.
    ProtocolViolation,
    /// The transport read or write failed. Always fatal.
    TransportFailure,
    /// The call queue was at capacity when the request arrived.
    TooManyRequests,
    /// An authorization attribute denied the call.
    Unauthorized,
    /// The invoked API method raised.
    InvocationError,
    /// Cooperative cancellation, local or peer-initiated.
    Canceled,
    /// The peer closed a stream with an error.
    RemoteStreamError,
    /// The session is being or has been disposed.
    Disposed,
}

impl ErrorKind {
    /// Whether an error of this kind should escalate to fatal session shutdown
    /// by default (`InvocationError` only escalates when
    /// `disconnect_on_api_error` is set, which callers check separately).
    pub fn is_fatal_by_default(self) -> bool {
        matches!(self, Self::ProtocolViolation | Self::TransportFailure)
    }
}

/// Wire representation of a remote exception: round-trips `kind` + `message`
/// plus an optional opaque payload blob, per the `Error` message format.
#[derive(Clone, Debug)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    pub payload: Option<Vec<u8>>,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            payload: None,
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Errors raised by the processor itself (not wire-carried remote errors).
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transport failed: {0}")]
    Transport(#[source] std::io::Error),

    #[error("message of {len} bytes exceeds max_message_length of {limit} bytes")]
    MessageTooLarge { len: usize, limit: usize },

    #[error("too many requests: call queue is at capacity ({capacity})")]
    TooManyRequests { capacity: usize },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("method `{method}` raised: {source}")]
    Invocation {
        method: String,
        #[source]
        source: RemoteError,
    },

    #[error("operation canceled")]
    Canceled,

    #[error("remote stream error: {0}")]
    RemoteStream(#[source] RemoteError),

    #[error("processor is disposed")]
    Disposed,

    #[error("duplicate id {0}: a pending entry already exists")]
    DuplicateId(u64),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("response for id {id} carried a value but the request declared wants_return=false")]
    UnexpectedReturnValue { id: u64 },

    #[error("internal channel closed unexpectedly")]
    ChannelClosed,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("event `{0}` is already registered")]
    EventAlreadyRegistered(String),
}

impl ProcessorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) | Self::DuplicateId(_) | Self::UnexpectedReturnValue { .. } => {
                ErrorKind::ProtocolViolation
            }
            Self::Transport(_) => ErrorKind::TransportFailure,
            Self::MessageTooLarge { .. } => ErrorKind::TransportFailure,
            Self::TooManyRequests { .. } => ErrorKind::TooManyRequests,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Invocation { .. } => ErrorKind::InvocationError,
            Self::Canceled => ErrorKind::Canceled,
            Self::RemoteStream(_) => ErrorKind::RemoteStreamError,
            Self::Disposed => ErrorKind::Disposed,
            Self::Timeout(_) => ErrorKind::Canceled,
            Self::ChannelClosed => ErrorKind::Disposed,
            Self::Codec(_) => ErrorKind::ProtocolViolation,
            // Never wire-carried: rejected synchronously by register_event.
            Self::EventAlreadyRegistered(_) => ErrorKind::ProtocolViolation,
        }
    }

    pub fn to_remote(&self) -> RemoteError {
        RemoteError::new(self.kind(), self.to_string())
    }

    pub fn disposed() -> Self {
        Self::Disposed
    }
}

impl From<RemoteError> for ProcessorError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            ErrorKind::Canceled => Self::Canceled,
            ErrorKind::Disposed => Self::Disposed,
            ErrorKind::RemoteStreamError => Self::RemoteStream(err),
            ErrorKind::TooManyRequests => Self::TooManyRequests { capacity: 0 },
            ErrorKind::Unauthorized => Self::Unauthorized(err.message),
            _ => Self::Invocation {
                method: String::new(),
                source: err,
            },
        }
    }
}
