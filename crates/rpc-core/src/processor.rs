//! The processor: wires the ingress/egress queues, router, and the call,
//! request, event, scope, and stream subsystems into one running session
//! over a caller-supplied transport.
//!
//! Construction mirrors the stdio JSON-RPC transport's shape: an async
//! constructor spawns the reader, writer, and worker tasks and returns a
//! handle holding their `JoinHandle`s, which `Drop` aborts if `shutdown()`
//! was never called.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::call::{CallEngine, MethodRegistry};
use crate::codec::FrameCodec;
use crate::egress::{run_writer, EgressQueue};
use crate::error::ProcessorError;
use crate::event::{EventHandler, EventRegistry};
use crate::ingress::{run_reader, IngressQueue};
use crate::lifecycle::FatalState;
use crate::message::{Message, Payload, Priority, RawBlob, ScopeId, StreamId};
use crate::options::ProcessorOptions;
use crate::outbound::Outbound;
use crate::request::{RequestArgs, RequestEngine, RequestOutcome};
use crate::router::Router;
use crate::scope::{ScopeDisposal, ScopeManager, ScopeOptions, ScopeRecord, ScopeValue};
use crate::stream::{
    ByteSource, Compressor, Decompressor, IncomingStream, OutgoingStream, StreamManager,
    StreamOutbound,
};

/// An external collaborator polled on `heartbeat_interval`. The core only
/// drives the timer; it has no opinion on what a tick means.
pub trait HeartbeatMonitor: Send + Sync + 'static {
    fn on_tick<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// The egress queue wrapped as both [`Outbound`] (plain messages) and
/// [`StreamOutbound`] (stream-protocol payloads), so the request/call/event
/// engines and the stream manager share one send path and one session
/// cancellation token.
struct EgressSink {
    egress: Arc<EgressQueue>,
    session_cancel: CancellationToken,
    rpc_version: u8,
    stream_priority: Priority,
}

impl Outbound for EgressSink {
    fn send(
        &self,
        message: Message,
        priority: Priority,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProcessorError>> + Send + '_>> {
        Box::pin(async move {
            let rx = self
                .egress
                .enqueue(message, priority, self.session_cancel.clone())
                .await;
            rx.await.unwrap_or(Err(ProcessorError::ChannelClosed))
        })
    }
}

impl StreamOutbound for EgressSink {
    fn send_stream_payload<'a>(
        &'a self,
        payload: Payload,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProcessorError>> + Send + 'a>> {
        let message = Message::new(None, self.rpc_version, payload);
        self.send(message, self.stream_priority)
    }
}

/// A running bidirectional RPC session. Construct with [`Processor::spawn`]
/// over any split transport; drop or call [`Processor::shutdown`] to tear it
/// down.
pub struct Processor {
    options: ProcessorOptions,
    next_id: AtomicU64,
    egress: Arc<EgressQueue>,
    requests: Arc<RequestEngine>,
    calls: Arc<CallEngine>,
    events: Arc<EventRegistry>,
    scopes: Arc<ScopeManager>,
    streams: Arc<StreamManager>,
    fatal: FatalState,
    sink: Arc<EgressSink>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Processor {
    /// Spawns a full session over `reader`/`writer` (the split halves of a
    /// transport) using `codec` to frame messages and `methods` to resolve
    /// inbound `Request`s.
    pub fn spawn<R, W, C>(
        reader: R,
        writer: W,
        codec: Arc<C>,
        methods: MethodRegistry,
        options: ProcessorOptions,
        heartbeat: Option<Arc<dyn HeartbeatMonitor>>,
    ) -> Arc<Self>
    where
        R: crate::transport::TransportReader,
        W: crate::transport::TransportWriter,
        C: FrameCodec,
    {
        let session_cancel = CancellationToken::new();
        let fatal = FatalState::new(session_cancel.clone());
        let egress = Arc::new(EgressQueue::new(options.egress_capacity));
        let sink = Arc::new(EgressSink {
            egress: egress.clone(),
            session_cancel: session_cancel.clone(),
            rpc_version: options.rpc_version,
            stream_priority: options.priorities.stream,
        });

        let requests = Arc::new(RequestEngine::new(options.request_queue_size));
        let calls = Arc::new(CallEngine::new(options.call_queue_size, Arc::new(methods)));
        let events = Arc::new(EventRegistry::new());
        let scopes = Arc::new(ScopeManager::new());
        let streams = Arc::new(StreamManager::new(options.max_stream_count));

        let router = Router {
            requests: requests.clone(),
            calls: calls.clone(),
            events: events.clone(),
            scopes: scopes.clone(),
            streams: streams.clone(),
            outbound: sink.clone() as Arc<dyn Outbound>,
            session_cancel: session_cancel.clone(),
            fatal: fatal.clone(),
            priorities: options.priorities,
            disconnect_on_api_error: options.disconnect_on_api_error,
            max_chunk_size: options.max_chunk_size,
        };

        let mut tasks = Vec::new();

        let writer_fatal = fatal.clone();
        let writer_cancel = session_cancel.clone();
        tasks.push(tokio::spawn({
            let egress = egress.clone();
            let codec = codec.clone();
            let max_len = options.max_message_length;
            let flush = options.flush_after_each;
            async move {
                run_writer(egress, writer, codec, max_len, flush).await;
                // run_writer also returns when the queue is closed by a
                // graceful shutdown; only escalate if that wasn't why.
                if !writer_cancel.is_cancelled() {
                    writer_fatal.report_fatal(ProcessorError::Transport(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "egress writer stopped",
                    )));
                }
            }
        }));

        let ingress = Arc::new(IngressQueue::new(options.ingress_capacity));
        let reader_fatal = fatal.clone();
        tasks.push(tokio::spawn({
            let sender = ingress.sender();
            let max_len = options.max_message_length;
            async move {
                if let Err(err) = run_reader(reader, codec, sender, max_len).await {
                    reader_fatal.report_fatal(err);
                }
            }
        }));

        for _ in 0..options.ingress_workers.max(1) {
            let ingress = ingress.clone();
            let router = router.clone();
            let cancel = session_cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        message = ingress.dequeue() => match message {
                            Some(message) => router.spawn_dispatch(message),
                            None => return,
                        },
                    }
                }
            }));
        }

        for _ in 0..options.call_workers.max(1) {
            tasks.push(tokio::spawn(calls.clone().run_worker(
                streams.clone(),
                sink.clone() as Arc<dyn Outbound>,
                sink.clone() as Arc<dyn StreamOutbound>,
                options.priorities.rpc,
                options.disconnect_on_api_error,
                options.max_chunk_size,
                fatal.clone(),
            )));
        }

        if let (Some(interval), Some(monitor)) = (options.heartbeat_interval, heartbeat) {
            let cancel = session_cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => monitor.on_tick().await,
                    }
                }
            }));
        }

        Arc::new(Self {
            options,
            next_id: AtomicU64::new(1),
            egress,
            requests,
            calls,
            events,
            scopes,
            streams,
            fatal,
            sink,
            tasks: Mutex::new(tasks),
        })
    }

    /// A cancellation token for one outbound call: a child of the session
    /// token, so session shutdown cancels it too, but canceling it back does
    /// not touch the session or any sibling call.
    pub fn child_cancellation(&self) -> CancellationToken {
        self.fatal.session_cancellation().child_token()
    }

    /// Sends a `Request` and awaits the correlated reply. `cancel` is local
    /// to this one call; cancelling it notifies the peer with `Cancel` and
    /// fails this call alone. Use [`Self::child_cancellation`] to get one
    /// linked to session shutdown as well.
    pub async fn send_request(
        &self,
        args: RequestArgs,
        cancel: CancellationToken,
    ) -> Result<RequestOutcome, ProcessorError> {
        self.requests
            .send_request(
                &self.next_id,
                args,
                self.options.priorities.rpc,
                self.sink.as_ref(),
                cancel,
            )
            .await
    }

    /// Raises a named event at the peer.
    pub async fn raise_event(
        &self,
        name: impl Into<String>,
        args: Option<RawBlob>,
        wait: bool,
    ) -> Result<(), ProcessorError> {
        self.events
            .raise_event(
                &self.next_id,
                name,
                args,
                wait,
                self.options.priorities.event,
                self.sink.as_ref(),
            )
            .await
    }

    pub async fn register_event(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ProcessorError> {
        self.events.register_event(name, handler).await
    }

    pub async fn create_scope(
        &self,
        value: ScopeValue,
        options: ScopeOptions,
    ) -> Result<Arc<ScopeRecord>, ProcessorError> {
        self.scopes.create_local(value, options).await
    }

    /// Disposes a locally-owned scope and, if its options say so, tells the
    /// peer via `ScopeDiscarded`.
    pub async fn dispose_scope(&self, id: ScopeId) -> Option<ScopeDisposal> {
        let disposal = self.scopes.dispose_local(id).await?;
        if disposal.inform_peer {
            let _ = self
                .sink
                .send(
                    Message::new(None, self.options.rpc_version, Payload::ScopeDiscarded { scope_id: id }),
                    self.options.priorities.rpc,
                )
                .await;
        }
        Some(disposal)
    }

    /// Starts sending `source` to the peer as a new outgoing stream and
    /// returns the handle driving it; its `id` is what the caller attaches
    /// to the `Request`/`Response` argument it belongs to.
    pub async fn open_stream(
        &self,
        source: ByteSource,
        compressor: Arc<dyn Compressor>,
    ) -> Result<Arc<OutgoingStream>, ProcessorError> {
        let stream = self.streams.start_outgoing(source, compressor).await?;
        tokio::spawn(stream.clone().run(
            self.options.max_chunk_size,
            self.sink.clone() as Arc<dyn StreamOutbound>,
        ));
        Ok(stream)
    }

    /// Registers `stream_id` (named by an inbound `Request`'s `stream_args`
    /// or a `Response`'s `stream_return`) as a readable incoming stream.
    pub async fn bind_incoming_stream(
        &self,
        stream_id: StreamId,
        decompressor: Arc<dyn Decompressor>,
    ) -> Arc<IncomingStream> {
        self.streams
            .register_incoming(stream_id, self.options.max_chunk_size, decompressor)
            .await
    }

    pub fn is_stopped_exceptional(&self) -> bool {
        self.fatal.is_stopped_exceptional()
    }

    pub fn last_exception(&self) -> Option<String> {
        self.fatal.last_exception()
    }

    /// Graceful teardown: cancels the session, fails every pending
    /// request/event/call as disposed, discards scopes and streams, closes
    /// the egress queue, and aborts all background tasks.
    pub async fn shutdown(&self) {
        self.fatal.session_cancellation().cancel();
        self.requests.dispose_all().await;
        self.calls.dispose_all().await;
        self.events.dispose_all().await;
        self.scopes.dispose_all().await;
        self.streams.dispose_all().await;
        self.egress.close().await;
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        } else {
            warn!("Processor dropped while shutdown() was mid-flight");
        }
    }
}
