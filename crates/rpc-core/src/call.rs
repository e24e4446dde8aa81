//! Inbound call engine: authorizes and invokes a locally
//! registered API method for each incoming `Request`, then replies with a
//! `Response` or `Error`.
//!
//! The pending-call table mirrors the request engine's pending-table
//! pattern; dispatch itself follows the ingress queue's bounded
//! producer/many-consumer shape (a `tokio::mpsc` channel drained by
//! `call_workers` background tasks).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ErrorKind, ProcessorError, RemoteError};
use crate::lifecycle::FatalState;
use crate::message::{Message, MessageId, MethodRef, Payload, Priority, RawBlob, StreamPlaceholder};
use crate::outbound::Outbound;
use crate::stream::{IncomingStream, StreamManager, StreamOutbound};

/// Per-call collaborator boundary: the core only sees a
/// resolved method as "authorize, then invoke", never the reflection layer
/// that produced it. Hand-rolled async-fn-in-trait, as elsewhere, to stay
/// `dyn`-safe.
pub trait ApiMethod: Send + Sync + 'static {
    fn wants_return_value(&self) -> bool {
        true
    }

    /// Evaluates every authorization attribute declared on the method.
    fn authorize<'a>(
        &'a self,
        ctx: &'a CallContext,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        let _ = ctx;
        Box::pin(async { true })
    }

    fn invoke<'a>(
        &'a self,
        ctx: &'a CallContext,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RawBlob>, RemoteError>> + Send + 'a>>;
}

/// Name-to-method lookup, the reflection layer's one interface the core
/// depends on.
pub type MethodRegistry = HashMap<MethodRef, Arc<dyn ApiMethod>>;

/// Everything an invoked method sees: its arguments, any bound incoming
/// streams, the merged (session ∧ per-call) cancellation token, and the
/// stream-protocol sink a method needs to drive those streams (`StreamStart`
/// requests go out on `read_next_chunk`).
pub struct CallContext {
    pub method: MethodRef,
    pub serializer_id: u32,
    pub arguments: Vec<RawBlob>,
    pub streams: Vec<(usize, Arc<IncomingStream>)>,
    pub cancellation: CancellationToken,
    pub stream_outbound: Arc<dyn StreamOutbound>,
}

struct PendingCallEntry {
    call_cancel: CancellationToken,
}

struct QueuedCall {
    id: MessageId,
    method: MethodRef,
    serializer_id: u32,
    arguments: Vec<RawBlob>,
    stream_args: Vec<StreamPlaceholder>,
    wants_return: bool,
    cancel: CancellationToken,
}

pub struct CallEngine {
    pending: Arc<Mutex<HashMap<MessageId, Arc<PendingCallEntry>>>>,
    queue_tx: mpsc::Sender<QueuedCall>,
    queue_rx: Arc<Mutex<mpsc::Receiver<QueuedCall>>>,
    capacity: usize,
    methods: Arc<MethodRegistry>,
}

impl CallEngine {
    pub fn new(capacity: usize, methods: Arc<MethodRegistry>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            capacity: capacity.max(1),
            methods,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Routes an inbound `Request`: registers it pending, then enqueues for
    /// a worker to pick up. Sends a non-fatal error reply itself on id
    /// collision or queue overflow.
    pub async fn handle_request(
        &self,
        id: MessageId,
        method: MethodRef,
        serializer_id: u32,
        arguments: Vec<RawBlob>,
        stream_args: Vec<StreamPlaceholder>,
        wants_return: bool,
        session_cancel: CancellationToken,
        outbound: &dyn Outbound,
        priority: Priority,
    ) {
        let call_cancel = session_cancel.child_token();
        {
            let mut guard = self.pending.lock().await;
            if guard.contains_key(&id) {
                let _ = outbound
                    .send(
                        error_response(id, ErrorKind::ProtocolViolation, "duplicate request id"),
                        priority,
                    )
                    .await;
                return;
            }
            guard.insert(id, Arc::new(PendingCallEntry { call_cancel: call_cancel.clone() }));
        }

        let queued = QueuedCall {
            id,
            method,
            serializer_id,
            arguments,
            stream_args,
            wants_return,
            cancel: call_cancel,
        };
        if self.queue_tx.try_send(queued).is_err() {
            self.pending.lock().await.remove(&id);
            let _ = outbound
                .send(
                    error_response_with_capacity(id, self.capacity),
                    priority,
                )
                .await;
        }
    }

    /// Delivered by the router for an inbound `Cancel` targeting a pending
    /// call id. Fires that call's merged token; the response, once sent by
    /// the worker, will carry a `Canceled` error.
    pub async fn handle_cancel(&self, target_id: MessageId) {
        if let Some(entry) = self.pending.lock().await.get(&target_id) {
            entry.call_cancel.cancel();
        }
    }

    /// One worker loop: dequeues a call, binds incoming streams, authorizes,
    /// invokes, and always sends a terminal reply. Run several of these
    /// concurrently (`call_workers`) to bound invocation parallelism.
    pub async fn run_worker(
        self: Arc<Self>,
        streams: Arc<StreamManager>,
        outbound: Arc<dyn Outbound>,
        stream_outbound: Arc<dyn StreamOutbound>,
        priority: Priority,
        disconnect_on_api_error: bool,
        max_chunk_size: usize,
        fatal: FatalState,
    ) {
        loop {
            let queued = {
                let mut rx = self.queue_rx.lock().await;
                match rx.recv().await {
                    Some(q) => q,
                    None => return,
                }
            };
            let id = queued.id;
            let result = self
                .process_one(
                    queued,
                    &streams,
                    outbound.as_ref(),
                    stream_outbound.clone(),
                    priority,
                    max_chunk_size,
                )
                .await;
            self.pending.lock().await.remove(&id);

            if let Err(err) = result {
                if disconnect_on_api_error && matches!(err.kind(), ErrorKind::InvocationError) {
                    fatal.report_fatal(err);
                }
            }
        }
    }

    async fn process_one(
        &self,
        queued: QueuedCall,
        streams: &Arc<StreamManager>,
        outbound: &dyn Outbound,
        stream_outbound: Arc<dyn StreamOutbound>,
        priority: Priority,
        max_chunk_size: usize,
    ) -> Result<(), ProcessorError> {
        let QueuedCall {
            id,
            method,
            serializer_id,
            arguments,
            stream_args,
            wants_return,
            cancel,
        } = queued;

        let Some(api_method) = self.methods.get(&method).cloned() else {
            let _ = outbound
                .send(
                    error_response(id, ErrorKind::ProtocolViolation, format!("unknown method `{method}`")),
                    priority,
                )
                .await;
            return Ok(());
        };

        let mut bound_streams = Vec::with_capacity(stream_args.len());
        for placeholder in stream_args {
            let incoming = streams
                .register_incoming(
                    placeholder.stream_id,
                    max_chunk_size,
                    Arc::new(crate::stream::Passthrough),
                )
                .await;
            bound_streams.push((placeholder.argument_index, incoming));
        }

        let ctx = CallContext {
            method: method.clone(),
            serializer_id,
            arguments,
            streams: bound_streams,
            cancellation: cancel.clone(),
            stream_outbound,
        };

        if !api_method.authorize(&ctx).await {
            let _ = outbound
                .send(error_response(id, ErrorKind::Unauthorized, "unauthorized"), priority)
                .await;
            return Ok(());
        }

        let invocation = tokio::select! {
            _ = cancel.cancelled() => Err(RemoteError::new(ErrorKind::Canceled, "call canceled")),
            result = api_method.invoke(&ctx) => result,
        };

        match invocation {
            Ok(value) => {
                let value = if wants_return && api_method.wants_return_value() { value } else { None };
                let _ = outbound
                    .send(
                        Message::new(
                            Some(id),
                            0,
                            Payload::Response {
                                serializer_id,
                                value,
                                stream_return: None,
                            },
                        ),
                        priority,
                    )
                    .await;
                Ok(())
            }
            Err(remote) => {
                let escalate = remote.kind == ErrorKind::InvocationError;
                let _ = outbound
                    .send(Message::new(Some(id), 0, Payload::Error { error: remote.clone() }), priority)
                    .await;
                if escalate {
                    Err(ProcessorError::Invocation { method, source: remote })
                } else {
                    Ok(())
                }
            }
        }
    }

    pub async fn dispose_all(&self) {
        let mut guard = self.pending.lock().await;
        for (_, entry) in guard.drain() {
            entry.call_cancel.cancel();
        }
    }
}

fn error_response(id: MessageId, kind: ErrorKind, message: impl Into<String>) -> Message {
    Message::new(Some(id), 0, Payload::Error { error: RemoteError::new(kind, message) })
}

fn error_response_with_capacity(id: MessageId, capacity: usize) -> Message {
    error_response(
        id,
        ErrorKind::TooManyRequests,
        format!("call queue is at capacity ({capacity})"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Echo;
    impl ApiMethod for Echo {
        fn invoke<'a>(
            &'a self,
            ctx: &'a CallContext,
        ) -> Pin<Box<dyn Future<Output = Result<Option<RawBlob>, RemoteError>> + Send + 'a>> {
            let value = ctx.arguments.first().cloned();
            Box::pin(async move { Ok(value) })
        }
    }

    struct DeclinesReturnValue;
    impl ApiMethod for DeclinesReturnValue {
        fn wants_return_value(&self) -> bool {
            false
        }
        fn invoke<'a>(
            &'a self,
            _ctx: &'a CallContext,
        ) -> Pin<Box<dyn Future<Output = Result<Option<RawBlob>, RemoteError>> + Send + 'a>> {
            Box::pin(async { Ok(Some(RawBlob(vec![1, 2, 3]))) })
        }
    }

    struct Denied;
    impl ApiMethod for Denied {
        fn authorize<'a>(
            &'a self,
            _ctx: &'a CallContext,
        ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
            Box::pin(async { false })
        }
        fn invoke<'a>(
            &'a self,
            _ctx: &'a CallContext,
        ) -> Pin<Box<dyn Future<Output = Result<Option<RawBlob>, RemoteError>> + Send + 'a>> {
            Box::pin(async { Ok(None) })
        }
    }

    struct RecordingOutbound {
        sent: StdMutex<Vec<Message>>,
    }
    impl Outbound for RecordingOutbound {
        fn send(
            &self,
            message: Message,
            _priority: Priority,
        ) -> Pin<Box<dyn Future<Output = Result<(), ProcessorError>> + Send + '_>> {
            self.sent.lock().unwrap().push(message);
            Box::pin(async { Ok(()) })
        }
    }
    impl StreamOutbound for RecordingOutbound {
        fn send_stream_payload<'a>(
            &'a self,
            _payload: Payload,
        ) -> Pin<Box<dyn Future<Output = Result<(), ProcessorError>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn methods(entries: Vec<(&str, Arc<dyn ApiMethod>)>) -> Arc<MethodRegistry> {
        Arc::new(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[tokio::test]
    async fn successful_call_replies_with_the_returned_value() {
        let engine = Arc::new(CallEngine::new(4, methods(vec![("echo", Arc::new(Echo))])));
        let outbound = Arc::new(RecordingOutbound { sent: StdMutex::new(Vec::new()) });
        let streams = Arc::new(StreamManager::new(4));
        let fatal = FatalState::new(CancellationToken::new());

        let worker = tokio::spawn(engine.clone().run_worker(
            streams,
            outbound.clone(),
            outbound.clone(),
            10,
            false,
            1024,
            fatal,
        ));

        engine
            .handle_request(
                1,
                "echo".into(),
                0,
                vec![RawBlob(vec![7, 7])],
                vec![],
                true,
                CancellationToken::new(),
                outbound.as_ref(),
                10,
            )
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        worker.abort();
        let sent = outbound.sent.lock().unwrap();
        assert!(matches!(
            &sent[0].payload,
            Payload::Response { value: Some(v), .. } if v.0 == vec![7, 7]
        ));
        assert_eq!(engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn unauthorized_method_replies_with_unauthorized_error() {
        let engine = Arc::new(CallEngine::new(4, methods(vec![("secret", Arc::new(Denied))])));
        let outbound = Arc::new(RecordingOutbound { sent: StdMutex::new(Vec::new()) });
        let streams = Arc::new(StreamManager::new(4));
        let fatal = FatalState::new(CancellationToken::new());
        let worker = tokio::spawn(engine.clone().run_worker(
            streams,
            outbound.clone(),
            outbound.clone(),
            10,
            false,
            1024,
            fatal,
        ));

        engine
            .handle_request(1, "secret".into(), 0, vec![], vec![], true, CancellationToken::new(), outbound.as_ref(), 10)
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        worker.abort();

        let sent = outbound.sent.lock().unwrap();
        assert!(matches!(
            &sent[0].payload,
            Payload::Error { error } if error.kind == ErrorKind::Unauthorized
        ));
    }

    #[tokio::test]
    async fn a_method_declaring_no_return_value_discards_it_even_if_the_caller_wants_one() {
        let engine = Arc::new(CallEngine::new(4, methods(vec![("quiet", Arc::new(DeclinesReturnValue))])));
        let outbound = Arc::new(RecordingOutbound { sent: StdMutex::new(Vec::new()) });
        let streams = Arc::new(StreamManager::new(4));
        let fatal = FatalState::new(CancellationToken::new());

        let worker = tokio::spawn(engine.clone().run_worker(
            streams,
            outbound.clone(),
            outbound.clone(),
            10,
            false,
            1024,
            fatal,
        ));

        engine
            .handle_request(1, "quiet".into(), 0, vec![], vec![], true, CancellationToken::new(), outbound.as_ref(), 10)
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        worker.abort();

        let sent = outbound.sent.lock().unwrap();
        assert!(matches!(&sent[0].payload, Payload::Response { value: None, .. }));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_as_protocol_violation() {
        let engine = Arc::new(CallEngine::new(4, methods(vec![("echo", Arc::new(Echo))])));
        let outbound = Arc::new(RecordingOutbound { sent: StdMutex::new(Vec::new()) });

        engine
            .handle_request(1, "echo".into(), 0, vec![], vec![], true, CancellationToken::new(), outbound.as_ref(), 10)
            .await;
        engine
            .handle_request(1, "echo".into(), 0, vec![], vec![], true, CancellationToken::new(), outbound.as_ref(), 10)
            .await;

        let sent = outbound.sent.lock().unwrap();
        assert!(matches!(
            &sent[0].payload,
            Payload::Error { error } if error.kind == ErrorKind::ProtocolViolation
        ));
    }
}
