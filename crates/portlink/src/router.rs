//! Inbound dispatch: progress, terminal responses and reverse calls.
//!
//! The router sees every decoded inbound message first, in channel delivery
//! order. Progress goes to the invocation's sink, terminal responses settle the
//! pending table, and reverse calls run on their own task so a slow handler
//! never stalls the event loop or any request's timer.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::bridge::channel::ChannelSender;
use crate::bridge::protocol::{Event, ReverseCallId, WireMessage};
use crate::error::SerializedError;
use crate::pending::PendingTable;

/// Computes the answer to a peer-initiated reverse call.
#[async_trait]
pub trait ReverseCallHandler: Send + Sync + 'static {
    async fn call(&self, payload: Value) -> Result<Value, SerializedError>;
}

#[async_trait]
impl<F, Fut> ReverseCallHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, SerializedError>> + Send + 'static,
{
    async fn call(&self, payload: Value) -> Result<Value, SerializedError> {
        (self)(payload).await
    }
}

/// Handlers for reverse calls, keyed by method name.
#[derive(Clone, Default)]
pub struct ReverseCallRegistry {
    handlers: Arc<DashMap<String, Arc<dyn ReverseCallHandler>>>,
}

impl ReverseCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, method: impl Into<String>, handler: Arc<dyn ReverseCallHandler>) {
        let method = method.into();
        if self.handlers.insert(method.clone(), handler).is_some() {
            tracing::debug!(%method, "Replaced reverse-call handler");
        }
    }

    pub fn unregister(&self, method: &str) -> bool {
        self.handlers.remove(method).is_some()
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn ReverseCallHandler>> {
        self.handlers.get(method).map(|entry| Arc::clone(entry.value()))
    }

    pub fn methods(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl std::fmt::Debug for ReverseCallRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseCallRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

pub(crate) struct Router {
    registry: ReverseCallRegistry,
    replies: ChannelSender,
}

impl Router {
    pub(crate) fn new(registry: ReverseCallRegistry, replies: ChannelSender) -> Self {
        Self { registry, replies }
    }

    pub(crate) fn route(&self, value: Value, table: &mut PendingTable) {
        let message = match WireMessage::decode(value) {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!("Ignoring message of unknown kind");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed message");
                return;
            }
        };

        match message {
            WireMessage::Event(Event::Progress { sequence, args }) => {
                tracing::trace!(sequence, args = args.len(), "Progress");
                if !table.progress(sequence, args) {
                    tracing::debug!(sequence, "Progress for unknown invocation or no sink");
                }
            }
            WireMessage::Response(response) => {
                let sequence = response.sequence;
                if table.resolve(sequence, response.into_result()) {
                    tracing::trace!(sequence, "Invocation settled");
                } else {
                    tracing::debug!(sequence, "Discarding response for settled or unknown invocation");
                }
            }
            WireMessage::Event(Event::ReverseCall {
                id,
                method,
                payload,
            }) => self.dispatch_reverse_call(id, method, payload),
            WireMessage::Event(Event::ReverseCallResponse { id, .. }) => {
                tracing::warn!(id, "Unexpected reverse-call response; this side issues none");
            }
            WireMessage::Request(request) => {
                tracing::warn!(
                    action = %request.action,
                    sequence = request.sequence,
                    "Peer sent a request; only reverse calls are served on this side"
                );
            }
        }
    }

    fn dispatch_reverse_call(&self, id: ReverseCallId, method: String, payload: Value) {
        let Some(handler) = self.registry.get(&method) else {
            tracing::warn!(id, %method, "No handler for reverse call");
            let err = SerializedError::new("UnknownMethod", format!("no handler for {method}"));
            if self.replies.send(Event::reverse_failure(id, &err)).is_err() {
                tracing::debug!(id, "Channel closed before reverse-call reply");
            }
            return;
        };

        tracing::debug!(id, %method, "Dispatching reverse call");
        let replies = self.replies.clone();
        tokio::spawn(async move {
            let reply = match handler.call(payload).await {
                Ok(result) => Event::reverse_success(id, result),
                Err(err) => {
                    tracing::debug!(id, %method, error = %err, "Reverse call failed");
                    Event::reverse_failure(id, &err)
                }
            };
            if replies.send(reply).is_err() {
                tracing::debug!(id, %method, "Channel closed before reverse-call reply");
            }
        });
    }
}
