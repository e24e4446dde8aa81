use crate::error::{ErrorKind, RemoteError};

/// A message id, minted by the side that sends the message it correlates.
/// Strictly increasing and unique for the lifetime of a session, per side.
pub type MessageId = u64;

/// A stream id, minted by the side that starts the stream.
pub type StreamId = u64;

/// A scope id, minted by the owning side's scope manager.
pub type ScopeId = u64;

/// An opaque argument/return value blob produced or consumed by the
/// pluggable serializer collaborator. `rpc-core` never looks inside it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawBlob(pub Vec<u8>);

impl RawBlob {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A reference to a method, as understood by the reflection collaborator.
/// `rpc-core` treats it as an opaque string for routing purposes.
pub type MethodRef = String;

/// Placeholder marking where a stream-valued argument sits in an argument
/// blob list; carried alongside the blob it replaces so the call engine can
/// splice in a live [`crate::stream::IncomingStream`] handle before binding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamPlaceholder {
    pub argument_index: usize,
    pub stream_id: StreamId,
}

/// The kind-specific payload of a [`Message`].
#[derive(Clone, Debug)]
pub enum Payload {
    Request {
        method: MethodRef,
        serializer_id: u32,
        arguments: Vec<RawBlob>,
        stream_args: Vec<StreamPlaceholder>,
        wants_return: bool,
    },
    Response {
        serializer_id: u32,
        value: Option<RawBlob>,
        stream_return: Option<StreamId>,
    },
    Error {
        error: RemoteError,
    },
    Cancel {
        target_id: MessageId,
    },
    Event {
        name: String,
        args: Option<RawBlob>,
        waiting: bool,
    },
    StreamStart {
        stream_id: StreamId,
    },
    StreamChunk {
        stream_id: StreamId,
        bytes: Vec<u8>,
    },
    StreamCloseLocal {
        stream_id: StreamId,
        error: Option<RemoteError>,
    },
    StreamCloseRemote {
        stream_id: StreamId,
    },
    ScopeTrigger {
        scope_id: ScopeId,
        key: Option<String>,
    },
    ScopeDiscarded {
        scope_id: ScopeId,
    },
    ScopeEvent {
        scope_id: ScopeId,
        bytes: Vec<u8>,
    },
}

impl Payload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Request { .. } => "Request",
            Self::Response { .. } => "Response",
            Self::Error { .. } => "Error",
            Self::Cancel { .. } => "Cancel",
            Self::Event { .. } => "Event",
            Self::StreamStart { .. } => "StreamStart",
            Self::StreamChunk { .. } => "StreamChunk",
            Self::StreamCloseLocal { .. } => "StreamCloseLocal",
            Self::StreamCloseRemote { .. } => "StreamCloseRemote",
            Self::ScopeTrigger { .. } => "ScopeTrigger",
            Self::ScopeDiscarded { .. } => "ScopeDiscarded",
            Self::ScopeEvent { .. } => "ScopeEvent",
        }
    }
}

/// A single framed message, as decoded from or destined for the transport.
///
/// `id` is `None` only for fire-and-forget `Event`s (`waiting = false`); every
/// other kind that the peer may reference by correlation carries one, and it
/// is assigned on send if absent.
#[derive(Clone, Debug)]
pub struct Message {
    pub id: Option<MessageId>,
    pub peer_protocol_version: u8,
    pub payload: Payload,
}

impl Message {
    pub fn new(id: Option<MessageId>, peer_protocol_version: u8, payload: Payload) -> Self {
        Self {
            id,
            peer_protocol_version,
            payload,
        }
    }

    /// Outbound messages that the peer may reference by id must carry one;
    /// this mints it from the given counter if still absent.
    pub fn ensure_id(&mut self, next_id: &std::sync::atomic::AtomicU64) -> MessageId {
        if let Some(id) = self.id {
            return id;
        }
        let id = next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.id = Some(id);
        id
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.payload {
            Payload::Error { error } => Some(error.kind),
            _ => None,
        }
    }
}

/// Outbound priority attached to a message on the egress queue. Higher values
/// are written first; ties broken ascending by enqueue time, then descending
/// by message id.
pub type Priority = i32;

/// Named priority bands referenced by [`crate::options::Priorities`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PriorityBands {
    pub event: Priority,
    pub rpc: Priority,
    pub stream: Priority,
}

impl Default for PriorityBands {
    fn default() -> Self {
        Self {
            event: 5,
            rpc: 10,
            stream: 0,
        }
    }
}
