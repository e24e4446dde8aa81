//! `rpc-core`: the transport-agnostic, codec-agnostic core of a
//! bidirectional, message-oriented RPC runtime.
//!
//! A [`Processor`](processor::Processor) owns one session over a pair of
//! `AsyncRead`/`AsyncWrite` halves: it frames and multiplexes outbound
//! `Request`s, `Event`s, and stream chunks against inbound ones, correlating
//! replies by id, while staying ignorant of the concrete transport, wire
//! serializer, and API-reflection layer an embedder plugs in at the trait
//! boundaries this crate defines.
//!
//! Module map:
//! - [`message`] — the wire message model (`Message`, `Payload`, ids).
//! - [`codec`] — frame encoding (`FrameCodec`, the bundled `WireCodec`).
//! - [`transport`] — the `AsyncRead`/`AsyncWrite` transport contract.
//! - [`ingress`] / [`egress`] — the bounded, backpressured message pump.
//! - [`router`] — dispatches one decoded message to its owning subsystem.
//! - [`call`] — inbound `Request` authorization and invocation.
//! - [`request`] — outbound `Request` correlation.
//! - [`event`] — named event raise/handle, with optional wait-for-ack.
//! - [`scope`] — long-lived, peer-addressable resource registries.
//! - [`stream`] — chunked, flow-controlled byte stream transfer.
//! - [`lifecycle`] — the fatal-exception, first-wins shutdown policy.
//! - [`processor`] — wires all of the above into one running session.

pub mod call;
pub mod codec;
pub mod egress;
pub mod error;
pub mod event;
pub mod ingress;
pub mod lifecycle;
pub mod message;
pub mod options;
pub mod outbound;
pub mod processor;
pub mod request;
pub mod router;
pub mod scope;
pub mod stream;
pub mod transport;

pub use call::{ApiMethod, CallContext, CallEngine, MethodRegistry};
pub use codec::{FrameCodec, WireCodec};
pub use error::{ErrorKind, ProcessorError, RemoteError};
pub use event::{EventHandler, EventRegistry};
pub use lifecycle::FatalState;
pub use message::{Message, MessageId, MethodRef, Payload, PriorityBands, RawBlob, ScopeId, StreamId};
pub use options::ProcessorOptions;
pub use outbound::Outbound;
pub use processor::{HeartbeatMonitor, Processor};
pub use request::{RequestArgs, RequestEngine, RequestOutcome};
pub use scope::{ScopeDisposal, ScopeManager, ScopeOptions, ScopeRecord, ScopeValue};
pub use stream::{
    ByteSource, Compressor, Decompressor, IncomingStream, OutgoingStream, Passthrough,
    StreamManager, StreamOutbound,
};
