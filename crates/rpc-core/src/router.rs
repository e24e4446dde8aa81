//! Message router: dispatches one deserialized inbound
//! message to the subsystem that owns its kind. Every dispatch runs as its
//! own spawned task so a handler that itself needs the write lock (to send
//! a reply) never blocks the ingress drain loop behind it.

use std::sync::Arc;

use tracing::warn;

use crate::call::CallEngine;
use crate::error::ProcessorError;
use crate::event::EventRegistry;
use crate::lifecycle::FatalState;
use crate::message::{Message, MessageId, Payload, PriorityBands};
use crate::outbound::Outbound;
use crate::request::RequestEngine;
use crate::scope::ScopeManager;
use crate::stream::StreamManager;
use tokio_util::sync::CancellationToken;

/// Everything a single dispatch needs. Cloned (cheaply, via the `Arc`s
/// inside) into each per-message task.
#[derive(Clone)]
pub struct Router {
    pub requests: Arc<RequestEngine>,
    pub calls: Arc<CallEngine>,
    pub events: Arc<EventRegistry>,
    pub scopes: Arc<ScopeManager>,
    pub streams: Arc<StreamManager>,
    pub outbound: Arc<dyn Outbound>,
    pub session_cancel: CancellationToken,
    pub fatal: FatalState,
    pub priorities: PriorityBands,
    pub disconnect_on_api_error: bool,
    pub max_chunk_size: usize,
}

impl Router {
    /// Spawns the per-message handling task. Call once per dequeued
    /// message from an ingress worker loop.
    pub fn spawn_dispatch(&self, message: Message) {
        let router = self.clone();
        tokio::spawn(async move {
            if let Err(err) = router.dispatch(message).await {
                if err.kind().is_fatal_by_default() {
                    router.fatal.report_fatal(err);
                } else {
                    warn!("non-fatal error handling inbound message: {err}");
                }
            }
        });
    }

    async fn dispatch(&self, message: Message) -> Result<(), ProcessorError> {
        let Message { id, payload, .. } = message;
        match payload {
            Payload::Request {
                method,
                serializer_id,
                arguments,
                stream_args,
                wants_return,
            } => {
                let id = require_id(id, "Request")?;
                self.calls
                    .handle_request(
                        id,
                        method,
                        serializer_id,
                        arguments,
                        stream_args,
                        wants_return,
                        self.session_cancel.clone(),
                        self.outbound.as_ref(),
                        self.priorities.rpc,
                    )
                    .await;
                Ok(())
            }
            Payload::Response { value, stream_return, .. } => {
                let id = require_id(id, "Response")?;
                if !self.requests.handle_response(id, value, stream_return).await {
                    self.events.handle_response(id, Ok(())).await;
                }
                Ok(())
            }
            Payload::Error { error } => {
                let id = require_id(id, "Error")?;
                if !self.requests.handle_error(id, error.clone()).await {
                    self.events.handle_response(id, Err(error)).await;
                }
                Ok(())
            }
            Payload::Cancel { target_id } => {
                self.calls.handle_cancel(target_id).await;
                Ok(())
            }
            Payload::Event { name, args, waiting } => {
                self.events
                    .handle_inbound(
                        id,
                        &name,
                        args,
                        waiting,
                        self.session_cancel.child_token(),
                        self.outbound.as_ref(),
                        self.priorities.event,
                    )
                    .await;
                Ok(())
            }
            stream_payload @ (Payload::StreamStart { .. }
            | Payload::StreamChunk { .. }
            | Payload::StreamCloseLocal { .. }
            | Payload::StreamCloseRemote { .. }) => self.streams.handle_payload(stream_payload).await,
            Payload::ScopeTrigger { scope_id, .. } => {
                // The scope's value itself travels with the Request/Response
                // argument it's attached to (via insert_remote); this only
                // tells us the peer has finished constructing it.
                if self.scopes.get_remote(scope_id).await.is_none() {
                    warn!("ScopeTrigger for scope {scope_id} before it was registered");
                }
                Ok(())
            }
            Payload::ScopeDiscarded { scope_id } => {
                let _ = self.scopes.dispose_remote(scope_id).await;
                Ok(())
            }
            Payload::ScopeEvent { scope_id, bytes } => {
                self.scopes.deliver_event(scope_id, bytes).await;
                Ok(())
            }
        }
    }
}

fn require_id(id: Option<MessageId>, kind: &'static str) -> Result<MessageId, ProcessorError> {
    id.ok_or_else(|| ProcessorError::Protocol(format!("{kind} message arrived without an id")))
}
