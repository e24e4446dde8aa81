//! Stream transfer: chunked, flow-controlled delivery of opaque byte
//! streams carried alongside RPC arguments and return values.
//!
//! Flow control is credit-of-1, driven entirely by the existing stream
//! payload kinds (there is no dedicated ack message): the consumer sends
//! `StreamStart` once to open the stream and again every time it wants
//! another chunk; the producer holds a [`Semaphore`] permit per `StreamStart`
//! received and only reads/sends a chunk once it has acquired one. Inbound
//! `StreamChunk` and `StreamCloseLocal` are delivered straight to the bound
//! [`IncomingStream`]'s sink, decompressing first if configured.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorKind, ProcessorError, RemoteError};
use crate::message::{Payload, StreamId};

/// Where an outgoing stream's bytes come from.
pub type ByteSource = Box<dyn AsyncRead + Unpin + Send>;

/// A compressor/decompressor pair: the pluggable compression codec
/// collaborator. `rpc-core` ships only [`Passthrough`]; a real codec plugs
/// in by implementing both traits.
pub trait Compressor: Send + Sync + 'static {
    fn compress_chunk(&self, input: &[u8]) -> Vec<u8>;
}

pub trait Decompressor: Send + Sync + 'static {
    fn decompress_chunk(&self, input: &[u8]) -> Vec<u8>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;
impl Compressor for Passthrough {
    fn compress_chunk(&self, input: &[u8]) -> Vec<u8> {
        input.to_vec()
    }
}
impl Decompressor for Passthrough {
    fn decompress_chunk(&self, input: &[u8]) -> Vec<u8> {
        input.to_vec()
    }
}

/// Sink the stream manager uses to put a stream-protocol message on the
/// wire, keeping this module ignorant of the egress queue and message id
/// allocation. Hand-rolled rather than built on an `async fn`-in-trait, so
/// it stays usable behind `Arc<dyn StreamOutbound>`.
pub trait StreamOutbound: Send + Sync + 'static {
    fn send_stream_payload<'a>(
        &'a self,
        payload: Payload,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProcessorError>> + Send + 'a>>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutgoingStreamState {
    New,
    Started,
    Completed,
    Failed,
    Canceled,
}

/// Producer-side state machine: `New -> Started -> (Chunking)* ->
/// Completed | Failed | Canceled`.
pub struct OutgoingStream {
    pub id: StreamId,
    source: Mutex<ByteSource>,
    compressor: Arc<dyn Compressor>,
    credit: Arc<Semaphore>,
    state: Mutex<OutgoingStreamState>,
    pub cancellation: CancellationToken,
    remote_canceled: AtomicBool,
}

impl OutgoingStream {
    pub fn new(id: StreamId, source: ByteSource, compressor: Arc<dyn Compressor>) -> Arc<Self> {
        Arc::new(Self {
            id,
            source: Mutex::new(source),
            compressor,
            credit: Arc::new(Semaphore::new(0)),
            state: Mutex::new(OutgoingStreamState::New),
            cancellation: CancellationToken::new(),
            remote_canceled: AtomicBool::new(false),
        })
    }

    pub async fn state(&self) -> OutgoingStreamState {
        *self.state.lock().await
    }

    /// A `StreamStart` arrived (initial open, or a repeat request for the
    /// next chunk): grant one unit of credit.
    pub fn grant_credit(&self) {
        self.credit.add_permits(1);
    }

    /// Peer requested cancellation: stop accepting more reads.
    pub fn remote_cancel(&self) {
        self.remote_canceled.store(true, Ordering::SeqCst);
        self.cancellation.cancel();
    }

    /// Drives the stream to completion: waits for credit, reads one chunk,
    /// sends it, and repeats until a short read (EOF), an error, or
    /// cancellation. Intended to run as a single background task per stream.
    pub async fn run(self: Arc<Self>, max_chunk_size: usize, outbound: Arc<dyn StreamOutbound>) {
        {
            let mut state = self.state.lock().await;
            if *state == OutgoingStreamState::New {
                *state = OutgoingStreamState::Started;
            }
        }
        loop {
            let acquired = tokio::select! {
                _ = self.cancellation.cancelled() => None,
                permit = self.credit.acquire() => permit.ok(),
            };
            let Some(permit) = acquired else {
                self.finish(OutgoingStreamState::Canceled, &outbound, None).await;
                return;
            };
            permit.forget();

            let mut buf = vec![0u8; max_chunk_size];
            let read = {
                let mut source = self.source.lock().await;
                source.read(&mut buf).await
            };
            match read {
                Ok(0) => {
                    // The prior real read may have returned exactly
                    // `max_chunk_size` bytes, which the consumer can't tell
                    // apart from "more data follows" until it sees a short
                    // chunk. Send an empty chunk so it always observes one.
                    if let Err(err) = outbound
                        .send_stream_payload(Payload::StreamChunk {
                            stream_id: self.id,
                            bytes: Vec::new(),
                        })
                        .await
                    {
                        warn!("stream {} eof chunk send failed: {err}", self.id);
                        self.finish(OutgoingStreamState::Failed, &outbound, Some(err.to_remote()))
                            .await;
                        return;
                    }
                    self.finish(OutgoingStreamState::Completed, &outbound, None).await;
                    return;
                }
                Ok(n) => {
                    buf.truncate(n);
                    let bytes = self.compressor.compress_chunk(&buf);
                    if let Err(err) = outbound
                        .send_stream_payload(Payload::StreamChunk {
                            stream_id: self.id,
                            bytes,
                        })
                        .await
                    {
                        warn!("stream {} chunk send failed: {err}", self.id);
                        self.finish(OutgoingStreamState::Failed, &outbound, Some(err.to_remote()))
                            .await;
                        return;
                    }
                    if n < max_chunk_size {
                        self.finish(OutgoingStreamState::Completed, &outbound, None).await;
                        return;
                    }
                }
                Err(io_err) => {
                    let remote = RemoteError::new(ErrorKind::InvocationError, io_err.to_string());
                    self.finish(OutgoingStreamState::Failed, &outbound, Some(remote)).await;
                    return;
                }
            }
        }
    }

    async fn finish(
        &self,
        terminal: OutgoingStreamState,
        outbound: &Arc<dyn StreamOutbound>,
        error: Option<RemoteError>,
    ) {
        {
            let mut state = self.state.lock().await;
            if matches!(
                *state,
                OutgoingStreamState::Completed
                    | OutgoingStreamState::Failed
                    | OutgoingStreamState::Canceled
            ) {
                return;
            }
            *state = terminal;
        }
        if terminal != OutgoingStreamState::Completed {
            let _ = outbound
                .send_stream_payload(Payload::StreamCloseLocal {
                    stream_id: self.id,
                    error,
                })
                .await;
        }
    }
}

#[derive(Debug)]
enum IncomingItem {
    Chunk(Vec<u8>),
    RemoteClosed(Option<RemoteError>),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IncomingStreamState {
    New,
    Started,
    Completed,
    Canceled,
    RemoteFailed,
}

/// Consumer-side state machine: `New -> Started -> (Receiving)* ->
/// Completed | Canceled | RemoteFailed`.
pub struct IncomingStream {
    pub id: StreamId,
    decompressor: Arc<dyn Decompressor>,
    max_chunk_size: usize,
    items: Mutex<mpsc::Receiver<IncomingItem>>,
    sender: mpsc::Sender<IncomingItem>,
    started: AtomicBool,
    state: Mutex<IncomingStreamState>,
    last_remote_exception: Mutex<Option<RemoteError>>,
}

impl IncomingStream {
    pub fn new(id: StreamId, max_chunk_size: usize, decompressor: Arc<dyn Decompressor>) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(1);
        Arc::new(Self {
            id,
            decompressor,
            max_chunk_size,
            items: Mutex::new(receiver),
            sender,
            started: AtomicBool::new(false),
            state: Mutex::new(IncomingStreamState::New),
            last_remote_exception: Mutex::new(None),
        })
    }

    pub async fn state(&self) -> IncomingStreamState {
        *self.state.lock().await
    }

    /// Delivered by the router for an inbound `StreamChunk`.
    pub async fn on_chunk(&self, bytes: Vec<u8>) -> Result<(), ProcessorError> {
        if bytes.len() > self.max_chunk_size {
            return Err(ProcessorError::Protocol(format!(
                "stream {} chunk of {} bytes exceeds negotiated max {}",
                self.id,
                bytes.len(),
                self.max_chunk_size
            )));
        }
        let decompressed = self.decompressor.decompress_chunk(&bytes);
        // Backpressure point: this blocks the router's per-message task
        // until the consumer drains the previous chunk, which is the
        // receiver-side half of the credit-of-1 flow control.
        let _ = self.sender.send(IncomingItem::Chunk(decompressed)).await;
        Ok(())
    }

    /// Delivered by the router for an inbound `StreamCloseLocal` (the peer's
    /// outgoing stream failed or the peer canceled its send). Sets
    /// `last_remote_exception` and marks EOF, so the consumer's next read
    /// raises rather than hanging forever.
    pub async fn on_remote_close(&self, error: Option<RemoteError>) {
        *self.last_remote_exception.lock().await = error.clone();
        let _ = self.sender.send(IncomingItem::RemoteClosed(error)).await;
    }

    pub async fn last_remote_exception(&self) -> Option<RemoteError> {
        self.last_remote_exception.lock().await.clone()
    }

    /// Reads the next chunk, requesting it from the peer first if this is
    /// the first read or the previous chunk indicated more data follows.
    /// Returns `Ok(None)` at end of stream.
    pub async fn read_next_chunk(
        self: &Arc<Self>,
        outbound: &dyn StreamOutbound,
    ) -> Result<Option<Vec<u8>>, ProcessorError> {
        {
            let mut state = self.state.lock().await;
            if matches!(
                *state,
                IncomingStreamState::Completed
                    | IncomingStreamState::Canceled
                    | IncomingStreamState::RemoteFailed
            ) {
                return Ok(None);
            }
            if *state == IncomingStreamState::New {
                *state = IncomingStreamState::Started;
            }
        }
        if !self.started.swap(true, Ordering::SeqCst) {
            outbound
                .send_stream_payload(Payload::StreamStart { stream_id: self.id })
                .await?;
        }

        let item = {
            let mut items = self.items.lock().await;
            items.recv().await
        };

        match item {
            None => {
                *self.state.lock().await = IncomingStreamState::Canceled;
                Ok(None)
            }
            Some(IncomingItem::RemoteClosed(error)) => {
                *self.state.lock().await = IncomingStreamState::RemoteFailed;
                match error {
                    Some(err) => Err(ProcessorError::RemoteStream(err)),
                    None => Ok(None),
                }
            }
            Some(IncomingItem::Chunk(bytes)) => {
                let short = bytes.len() < self.max_chunk_size;
                if short {
                    *self.state.lock().await = IncomingStreamState::Completed;
                } else {
                    // More data expected: request the next chunk.
                    outbound
                        .send_stream_payload(Payload::StreamStart { stream_id: self.id })
                        .await?;
                }
                Ok(Some(bytes))
            }
        }
    }

    /// Consumer-initiated cancellation: notify the peer and mark local EOF.
    pub async fn cancel(&self, outbound: &dyn StreamOutbound) {
        {
            let mut state = self.state.lock().await;
            if matches!(
                *state,
                IncomingStreamState::Completed
                    | IncomingStreamState::Canceled
                    | IncomingStreamState::RemoteFailed
            ) {
                return;
            }
            *state = IncomingStreamState::Canceled;
        }
        let _ = outbound
            .send_stream_payload(Payload::StreamCloseRemote { stream_id: self.id })
            .await;
        let _ = self.sender.try_send(IncomingItem::RemoteClosed(None));
    }
}

/// Owns every live stream for one processor, keyed by id, and mints new
/// outgoing stream ids.
pub struct StreamManager {
    next_id: AtomicU64,
    outgoing: Mutex<HashMap<StreamId, Arc<OutgoingStream>>>,
    incoming: Mutex<HashMap<StreamId, Arc<IncomingStream>>>,
    max_stream_count: usize,
}

impl StreamManager {
    pub fn new(max_stream_count: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            outgoing: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
            max_stream_count,
        }
    }

    pub fn streams_enabled(&self) -> bool {
        self.max_stream_count > 0
    }

    pub async fn start_outgoing(
        &self,
        source: ByteSource,
        compressor: Arc<dyn Compressor>,
    ) -> Result<Arc<OutgoingStream>, ProcessorError> {
        let mut guard = self.outgoing.lock().await;
        if guard.len() >= self.max_stream_count {
            return Err(ProcessorError::TooManyRequests {
                capacity: self.max_stream_count,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let stream = OutgoingStream::new(id, source, compressor);
        guard.insert(id, stream.clone());
        Ok(stream)
    }

    pub async fn register_incoming(
        &self,
        id: StreamId,
        max_chunk_size: usize,
        decompressor: Arc<dyn Decompressor>,
    ) -> Arc<IncomingStream> {
        let stream = IncomingStream::new(id, max_chunk_size, decompressor);
        self.incoming.lock().await.insert(id, stream.clone());
        stream
    }

    pub async fn outgoing(&self, id: StreamId) -> Option<Arc<OutgoingStream>> {
        self.outgoing.lock().await.get(&id).cloned()
    }

    pub async fn incoming(&self, id: StreamId) -> Option<Arc<IncomingStream>> {
        self.incoming.lock().await.get(&id).cloned()
    }

    pub async fn remove_outgoing(&self, id: StreamId) {
        self.outgoing.lock().await.remove(&id);
    }

    pub async fn remove_incoming(&self, id: StreamId) {
        self.incoming.lock().await.remove(&id);
    }

    /// Routes an inbound stream-kind payload to the matching stream.
    /// Unknown stream ids are dropped with a debug log: the stream may have
    /// already finished and been reaped.
    pub async fn handle_payload(&self, payload: Payload) -> Result<(), ProcessorError> {
        match payload {
            Payload::StreamStart { stream_id } => {
                if let Some(stream) = self.outgoing(stream_id).await {
                    stream.grant_credit();
                } else {
                    debug!("StreamStart for unknown outgoing stream {stream_id}");
                }
            }
            Payload::StreamChunk { stream_id, bytes } => {
                if let Some(stream) = self.incoming(stream_id).await {
                    stream.on_chunk(bytes).await?;
                } else {
                    debug!("StreamChunk for unknown incoming stream {stream_id}");
                }
            }
            Payload::StreamCloseLocal { stream_id, error } => {
                if let Some(stream) = self.incoming(stream_id).await {
                    stream.on_remote_close(error).await;
                } else {
                    debug!("StreamCloseLocal for unknown incoming stream {stream_id}");
                }
            }
            Payload::StreamCloseRemote { stream_id } => {
                if let Some(stream) = self.outgoing(stream_id).await {
                    stream.remote_cancel();
                } else {
                    debug!("StreamCloseRemote for unknown outgoing stream {stream_id}");
                }
            }
            other => {
                return Err(ProcessorError::Protocol(format!(
                    "StreamManager received non-stream payload {}",
                    other.kind_name()
                )))
            }
        }
        Ok(())
    }

    pub async fn dispose_all(&self) {
        let outgoing: Vec<_> = self.outgoing.lock().await.values().cloned().collect();
        for stream in outgoing {
            stream.cancellation.cancel();
        }
        self.incoming.lock().await.clear();
        self.outgoing.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingOutbound {
        sent: StdMutex<Vec<Payload>>,
    }

    impl StreamOutbound for RecordingOutbound {
        fn send_stream_payload<'a>(
            &'a self,
            payload: Payload,
        ) -> Pin<Box<dyn Future<Output = Result<(), ProcessorError>> + Send + 'a>> {
            self.sent.lock().unwrap().push(payload);
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn outgoing_stream_completes_on_short_read() {
        let source: ByteSource = Box::new(std::io::Cursor::new(b"hi".to_vec()));
        let stream = OutgoingStream::new(1, source, Arc::new(Passthrough));
        stream.grant_credit();
        let outbound = Arc::new(RecordingOutbound {
            sent: StdMutex::new(Vec::new()),
        });
        stream.clone().run(64, outbound.clone()).await;
        assert_eq!(stream.state().await, OutgoingStreamState::Completed);
        let sent = outbound.sent.lock().unwrap();
        assert!(matches!(sent[0], Payload::StreamChunk { .. }));
    }

    #[tokio::test]
    async fn outgoing_stream_sends_an_empty_chunk_when_length_is_an_exact_multiple_of_chunk_size() {
        // The real read of the last 4 bytes returns a full chunk
        // (n == max_chunk_size), which on its own looks identical to the
        // consumer as "more data follows". Without an explicit EOF marker
        // the consumer re-requests forever.
        let source: ByteSource = Box::new(std::io::Cursor::new(vec![1u8, 2, 3, 4]));
        let stream = OutgoingStream::new(1, source, Arc::new(Passthrough));
        stream.grant_credit();
        stream.grant_credit();
        let outbound = Arc::new(RecordingOutbound {
            sent: StdMutex::new(Vec::new()),
        });
        stream.clone().run(4, outbound.clone()).await;
        assert_eq!(stream.state().await, OutgoingStreamState::Completed);
        let sent = outbound.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], Payload::StreamChunk { bytes, .. } if bytes.len() == 4));
        assert!(matches!(&sent[1], Payload::StreamChunk { bytes, .. } if bytes.is_empty()));
    }

    #[tokio::test]
    async fn incoming_stream_reassembles_full_payload_and_detects_eof() {
        let incoming = IncomingStream::new(7, 4, Arc::new(Passthrough));
        let outbound = Arc::new(RecordingOutbound {
            sent: StdMutex::new(Vec::new()),
        });

        incoming.on_chunk(vec![1, 2, 3, 4]).await.unwrap();
        let first = incoming.read_next_chunk(outbound.as_ref()).await.unwrap();
        assert_eq!(first, Some(vec![1, 2, 3, 4]));

        incoming.on_chunk(vec![5]).await.unwrap();
        let second = incoming.read_next_chunk(outbound.as_ref()).await.unwrap();
        assert_eq!(second, Some(vec![5]));
        assert_eq!(incoming.state().await, IncomingStreamState::Completed);

        let sent = outbound.sent.lock().unwrap();
        let starts = sent
            .iter()
            .filter(|p| matches!(p, Payload::StreamStart { .. }))
            .count();
        assert_eq!(starts, 2, "one StreamStart for the open, one for the next chunk");
    }

    #[tokio::test]
    async fn remote_close_surfaces_as_remote_stream_error_on_next_read() {
        let incoming = IncomingStream::new(9, 4, Arc::new(Passthrough));
        let outbound = Arc::new(RecordingOutbound {
            sent: StdMutex::new(Vec::new()),
        });
        incoming
            .on_remote_close(Some(RemoteError::new(ErrorKind::InvocationError, "boom")))
            .await;
        let err = incoming.read_next_chunk(outbound.as_ref()).await.unwrap_err();
        assert!(matches!(err, ProcessorError::RemoteStream(_)));
        assert_eq!(incoming.state().await, IncomingStreamState::RemoteFailed);
    }
}
