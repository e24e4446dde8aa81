//! Event subsystem: named handlers raised by the peer, with
//! an optional wait-for-ack mode that behaves like a request.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ErrorKind, ProcessorError, RemoteError};
use crate::message::{Message, MessageId, Payload, Priority, RawBlob};
use crate::outbound::Outbound;

/// A locally registered event handler. Hand-rolled async-fn-in-trait so it
/// stays usable behind `Arc<dyn EventHandler>`.
pub trait EventHandler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        args: Option<&'a RawBlob>,
        cancellation: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), RemoteError>> + Send + 'a>>;
}

struct EventEntry {
    handler: Arc<dyn EventHandler>,
    raise_count: AtomicU64,
    first_raised: Mutex<Option<Instant>>,
    last_raised: Mutex<Option<Instant>>,
}

/// Registrations, keyed by name (unique within a processor).
pub struct EventRegistry {
    handlers: Mutex<HashMap<String, Arc<EventEntry>>>,
    waiting: Mutex<HashMap<MessageId, oneshot::Sender<Result<(), RemoteError>>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Duplicate names fail without mutating existing state.
    pub async fn register_event(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ProcessorError> {
        let name = name.into();
        let mut guard = self.handlers.lock().await;
        if guard.contains_key(&name) {
            return Err(ProcessorError::EventAlreadyRegistered(name));
        }
        guard.insert(
            name,
            Arc::new(EventEntry {
                handler,
                raise_count: AtomicU64::new(0),
                first_raised: Mutex::new(None),
                last_raised: Mutex::new(None),
            }),
        );
        Ok(())
    }

    pub async fn raise_count(&self, name: &str) -> Option<u64> {
        let guard = self.handlers.lock().await;
        guard.get(name).map(|e| e.raise_count.load(Ordering::SeqCst))
    }

    /// Raises the named event at the peer. With `wait=false`, sends a
    /// fire-and-forget `Event` message with no id. With `wait=true`, mints an
    /// id from the processor-wide outbound counter (shared with the request
    /// engine), registers a pending waiter, and awaits the peer's
    /// `Response`/`Error`.
    pub async fn raise_event(
        &self,
        next_id: &AtomicU64,
        name: impl Into<String>,
        args: Option<RawBlob>,
        wait: bool,
        priority: Priority,
        outbound: &dyn Outbound,
    ) -> Result<(), ProcessorError> {
        let name = name.into();
        if !wait {
            outbound
                .send(
                    Message::new(None, 0, Payload::Event { name, args, waiting: false }),
                    priority,
                )
                .await?;
            return Ok(());
        }

        let id = next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.insert(id, tx);

        let message = Message::new(Some(id), 0, Payload::Event { name, args, waiting: true });
        if let Err(err) = outbound.send(message, priority).await {
            self.waiting.lock().await.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(remote)) => Err(ProcessorError::from(remote)),
            Err(_) => Err(ProcessorError::ChannelClosed),
        }
    }

    /// Delivered by the router for an inbound `Event`. Unknown names are
    /// silently dropped. Handler errors in waiting mode produce an `Error`
    /// reply; in non-waiting mode they are logged and otherwise ignored.
    pub async fn handle_inbound(
        &self,
        id: Option<MessageId>,
        name: &str,
        args: Option<RawBlob>,
        waiting: bool,
        cancellation: CancellationToken,
        outbound: &dyn Outbound,
        priority: Priority,
    ) {
        let Some(entry) = self.handlers.lock().await.get(name).cloned() else {
            return;
        };

        entry.raise_count.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        {
            let mut first = entry.first_raised.lock().await;
            if first.is_none() {
                *first = Some(now);
            }
        }
        *entry.last_raised.lock().await = Some(now);

        let result = entry.handler.handle(args.as_ref(), cancellation).await;

        if waiting {
            let Some(id) = id else {
                warn!("event `{name}` raised with waiting=true but no id");
                return;
            };
            let reply = match result {
                Ok(()) => Message::new(
                    Some(id),
                    0,
                    Payload::Response { serializer_id: 0, value: None, stream_return: None },
                ),
                Err(error) => Message::new(Some(id), 0, Payload::Error { error }),
            };
            let _ = outbound.send(reply, priority).await;
        } else if let Err(error) = result {
            warn!("event `{name}` handler failed (non-waiting, ignored): {error}");
        }
    }

    /// Delivered by the router for an inbound `Response`/`Error`, once the
    /// request engine has confirmed `id` isn't one of its own pending
    /// requests (the two share an id space; see [`crate::request::RequestEngine::handle_response`]).
    pub async fn handle_response(&self, id: MessageId, result: Result<(), RemoteError>) -> bool {
        if let Some(tx) = self.waiting.lock().await.remove(&id) {
            let _ = tx.send(result);
            true
        } else {
            false
        }
    }

    pub async fn dispose_all(&self) {
        let mut guard = self.waiting.lock().await;
        for (_, tx) in guard.drain() {
            let _ = tx.send(Err(RemoteError::new(ErrorKind::Disposed, "processor disposed")));
        }
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::Mutex as StdMutex;

    struct Immediate;
    impl EventHandler for Immediate {
        fn handle<'a>(
            &'a self,
            _args: Option<&'a RawBlob>,
            _cancellation: CancellationToken,
        ) -> Pin<Box<dyn Future<Output = Result<(), RemoteError>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
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

    #[tokio::test]
    async fn second_registration_under_the_same_name_fails_without_mutating_state() {
        let registry = EventRegistry::new();
        registry.register_event("ping", Arc::new(Immediate)).await.unwrap();
        let err = registry
            .register_event("ping", Arc::new(Immediate))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::EventAlreadyRegistered(_)));
        assert_eq!(registry.raise_count("ping").await, Some(0));
    }

    #[tokio::test]
    async fn waiting_raise_resolves_once_the_handler_replies() {
        let registry = Arc::new(EventRegistry::new());
        registry.register_event("ping", Arc::new(Immediate)).await.unwrap();
        let outbound = Arc::new(RecordingOutbound { sent: StdMutex::new(Vec::new()) });
        let ids = Arc::new(AtomicU64::new(1));

        let registry2 = registry.clone();
        let outbound2 = outbound.clone();
        let ids2 = ids.clone();
        let raise = tokio::spawn(async move {
            registry2
                .raise_event(ids2.as_ref(), "ping", None, true, 5, outbound2.as_ref())
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let id = outbound.sent.lock().unwrap()[0].id.unwrap();
        // Simulates the peer's reply to the Event we just raised; in a real
        // session this would be a different processor's registry.
        registry
            .handle_inbound(Some(id), "ping", None, true, CancellationToken::new(), outbound.as_ref(), 5)
            .await;
        let reply_id = outbound.sent.lock().unwrap()[1].id.unwrap();
        assert!(registry.handle_response(reply_id, Ok(())).await);

        raise.await.unwrap().unwrap();
        assert_eq!(registry.raise_count("ping").await, Some(1));
    }

    #[tokio::test]
    async fn unknown_event_name_is_silently_dropped() {
        let registry = EventRegistry::new();
        let outbound = RecordingOutbound { sent: StdMutex::new(Vec::new()) };
        registry
            .handle_inbound(None, "nope", None, false, CancellationToken::new(), &outbound, 5)
            .await;
        assert!(outbound.sent.lock().unwrap().is_empty());
    }
}
