//! Outbound request engine: sends a `Request`, correlates the
//! matching `Response`/`Error`/local cancellation, and resolves exactly once.
//!
//! Grounded on the stdio JSON-RPC client's pending-table pattern (a
//! `next_id` counter plus `Arc<Mutex<HashMap<id, oneshot::Sender<...>>>>`),
//! generalized from a single `Value` result to `rpc-core`'s opaque
//! [`RawBlob`] plus an optional returned stream id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{ProcessorError, RemoteError};
use crate::message::{Message, MessageId, MethodRef, Payload, Priority, RawBlob, StreamId, StreamPlaceholder};
use crate::outbound::Outbound;

type PendingResult = Result<(Option<RawBlob>, Option<StreamId>), ProcessorError>;

struct PendingEntry {
    wants_return: bool,
    reply: oneshot::Sender<PendingResult>,
}

type Pending = Arc<Mutex<HashMap<MessageId, PendingEntry>>>;

/// What a completed request produced: a plain return value, a stream handle
/// to register with the stream manager, or both absent for a void call.
#[derive(Debug, Default)]
pub struct RequestOutcome {
    pub value: Option<RawBlob>,
    pub stream: Option<StreamId>,
}

/// The arguments of one outbound `Request`, already fully prepared (stream
/// placeholders included, since minting their ids is the caller's job via
/// the stream manager).
pub struct RequestArgs {
    pub method: MethodRef,
    pub serializer_id: u32,
    pub arguments: Vec<RawBlob>,
    pub stream_args: Vec<StreamPlaceholder>,
    pub wants_return: bool,
}

pub struct RequestEngine {
    pending: Pending,
    /// Bounds how many request *sends* may be in flight at once — held only
    /// from just before the `Request` is handed to `outbound.send` until
    /// that send attempt completes. Awaiting the correlated reply afterward
    /// does not hold a permit, so the number of pending awaits is unbounded
    /// by this.
    send_permits: Semaphore,
    max_in_flight_sends: usize,
}

impl RequestEngine {
    pub fn new(max_in_flight_sends: usize) -> Self {
        let max_in_flight_sends = max_in_flight_sends.max(1);
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            send_permits: Semaphore::new(max_in_flight_sends),
            max_in_flight_sends,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Sends the request and awaits the correlated response, racing the
    /// given cancellation token. On local cancellation, best-effort notifies
    /// the peer with a `Cancel` message before returning `Err(Canceled)`.
    ///
    /// `next_id` is the processor-wide outbound id counter:
    /// requests and waiting events share one id space so the router can
    /// unambiguously tell which table a `Response`/`Error` belongs to.
    pub async fn send_request(
        &self,
        next_id: &AtomicU64,
        args: RequestArgs,
        priority: Priority,
        outbound: &dyn Outbound,
        cancel: CancellationToken,
    ) -> Result<RequestOutcome, ProcessorError> {
        let permit = self.send_permits.try_acquire().map_err(|_| ProcessorError::TooManyRequests {
            capacity: self.max_in_flight_sends,
        })?;

        let id = next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id,
            PendingEntry {
                wants_return: args.wants_return,
                reply: tx,
            },
        );

        let message = Message::new(
            Some(id),
            0,
            Payload::Request {
                method: args.method,
                serializer_id: args.serializer_id,
                arguments: args.arguments,
                stream_args: args.stream_args,
                wants_return: args.wants_return,
            },
        );

        let sent = outbound.send(message, priority).await;
        drop(permit);
        if let Err(err) = sent {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.pending.lock().await.remove(&id);
                let _ = outbound.send(
                    Message::new(None, 0, Payload::Cancel { target_id: id }),
                    priority,
                ).await;
                Err(ProcessorError::Canceled)
            }
            result = rx => match result {
                Ok(Ok((value, stream))) => Ok(RequestOutcome { value, stream }),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(ProcessorError::ChannelClosed),
            },
        }
    }

    /// Delivered by the router for an inbound `Response`, if `id` is one of
    /// ours. The request and waiting-event id spaces are shared, so the
    /// router tries both tables; this returns `false` when the id isn't a
    /// pending request so the router can fall through.
    ///
    /// A value-bearing response for a request that declared
    /// `wants_return=false` is a protocol violation and fails the caller
    /// with [`ProcessorError::UnexpectedReturnValue`] instead of the value.
    pub async fn handle_response(&self, id: MessageId, value: Option<RawBlob>, stream: Option<StreamId>) -> bool {
        if let Some(entry) = self.pending.lock().await.remove(&id) {
            let outcome = if !entry.wants_return && value.is_some() {
                Err(ProcessorError::UnexpectedReturnValue { id })
            } else {
                Ok((value, stream))
            };
            let _ = entry.reply.send(outcome);
            true
        } else {
            false
        }
    }

    /// Delivered by the router for an inbound `Error`, if `id` is one of
    /// ours; see [`Self::handle_response`] for the fallthrough contract.
    pub async fn handle_error(&self, id: MessageId, error: RemoteError) -> bool {
        if let Some(entry) = self.pending.lock().await.remove(&id) {
            let _ = entry.reply.send(Err(ProcessorError::from(error)));
            true
        } else {
            false
        }
    }

    /// Fails every pending request as disposed. Called during shutdown.
    pub async fn dispose_all(&self) {
        let mut guard = self.pending.lock().await;
        for (_, entry) in guard.drain() {
            let _ = entry.reply.send(Err(ProcessorError::Disposed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;

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

    fn args() -> RequestArgs {
        RequestArgs {
            method: "add".into(),
            serializer_id: 0,
            arguments: vec![RawBlob(vec![1, 2])],
            stream_args: vec![],
            wants_return: true,
        }
    }

    #[tokio::test]
    async fn response_resolves_the_matching_pending_request() {
        let engine = Arc::new(RequestEngine::new(8));
        let ids = Arc::new(AtomicU64::new(1));
        let outbound = Arc::new(RecordingOutbound {
            sent: StdMutex::new(Vec::new()),
        });

        let engine2 = engine.clone();
        let outbound2 = outbound.clone();
        let ids2 = ids.clone();
        let handle = tokio::spawn(async move {
            engine2
                .send_request(ids2.as_ref(), args(), 10, outbound2.as_ref(), CancellationToken::new())
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let sent_id = outbound.sent.lock().unwrap()[0].id.unwrap();
        engine
            .handle_response(sent_id, Some(RawBlob(vec![9])), None)
            .await;

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.value, Some(RawBlob(vec![9])));
    }

    #[tokio::test]
    async fn cancellation_notifies_peer_and_fails_locally() {
        let engine = Arc::new(RequestEngine::new(8));
        let ids = Arc::new(AtomicU64::new(1));
        let outbound = Arc::new(RecordingOutbound {
            sent: StdMutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();

        let engine2 = engine.clone();
        let outbound2 = outbound.clone();
        let cancel2 = cancel.clone();
        let ids2 = ids.clone();
        let handle = tokio::spawn(async move {
            engine2
                .send_request(ids2.as_ref(), args(), 10, outbound2.as_ref(), cancel2)
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ProcessorError::Canceled)));

        let sent = outbound.sent.lock().unwrap();
        assert!(sent
            .iter()
            .any(|m| matches!(m.payload, Payload::Cancel { .. })));
        assert_eq!(engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn send_stage_at_capacity_is_rejected() {
        let engine = RequestEngine::new(1);
        let outbound = RecordingOutbound {
            sent: StdMutex::new(Vec::new()),
        };
        let cancel = CancellationToken::new();
        // Hold the only send-stage permit, as if a send were in flight.
        let _permit = engine.send_permits.try_acquire().unwrap();

        let ids = AtomicU64::new(1);
        let err = engine
            .send_request(&ids, args(), 10, &outbound, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::TooManyRequests { .. }));
    }

    #[tokio::test]
    async fn pending_awaits_are_not_bounded_by_the_send_stage_capacity() {
        // Capacity of 1 at the send stage, but the send itself resolves
        // immediately (RecordingOutbound never awaits), so nothing here ever
        // contends for the one permit; all three requests land in the
        // pending table at once while none has been answered yet.
        let engine = Arc::new(RequestEngine::new(1));
        let outbound = Arc::new(RecordingOutbound {
            sent: StdMutex::new(Vec::new()),
        });
        let ids = Arc::new(AtomicU64::new(1));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let engine = engine.clone();
            let outbound = outbound.clone();
            let ids = ids.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .send_request(ids.as_ref(), args(), 10, outbound.as_ref(), CancellationToken::new())
                    .await
            }));
        }

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(engine.pending_count().await, 3);

        for id in 1..=3u64 {
            engine.handle_response(id, Some(RawBlob(vec![1])), None).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn a_value_bearing_response_to_a_void_request_fails_the_caller() {
        let engine = Arc::new(RequestEngine::new(8));
        let ids = Arc::new(AtomicU64::new(1));
        let outbound = Arc::new(RecordingOutbound {
            sent: StdMutex::new(Vec::new()),
        });

        let mut void_args = args();
        void_args.wants_return = false;

        let engine2 = engine.clone();
        let outbound2 = outbound.clone();
        let ids2 = ids.clone();
        let handle = tokio::spawn(async move {
            engine2
                .send_request(ids2.as_ref(), void_args, 10, outbound2.as_ref(), CancellationToken::new())
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let sent_id = outbound.sent.lock().unwrap()[0].id.unwrap();
        engine
            .handle_response(sent_id, Some(RawBlob(vec![9])), None)
            .await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ProcessorError::UnexpectedReturnValue { id } if id == sent_id));
    }
}
