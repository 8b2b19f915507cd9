//! Serving side of the protocol.
//!
//! Runs wherever requests are answered: the worker thread, or a native helper
//! reading stdin. Answers the version query itself, hands every other request
//! to a [`RequestHandler`] on its own task, and lets handlers stream progress
//! and call back into the requesting side.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::bridge::channel::{Channel, ChannelSender};
use crate::bridge::protocol::{
    Event, GET_VERSION, Request, Response, ReverseCallId, SequenceId, WireMessage, settle,
};
use crate::error::{Result, RpcError, SerializedError};
use crate::handshake::SUPPORTED_VERSION;

pub const DEFAULT_REVERSE_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Answers requests for one action namespace.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        action: &str,
        params: Value,
        ctx: RequestContext,
    ) -> std::result::Result<Value, SerializedError>;
}

#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Reported in reply to `get_version`.
    pub version: u32,
    pub reverse_call_timeout: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            version: SUPPORTED_VERSION,
            reverse_call_timeout: DEFAULT_REVERSE_CALL_TIMEOUT,
        }
    }
}

impl PeerOptions {
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_reverse_call_timeout(mut self, timeout: Duration) -> Self {
        self.reverse_call_timeout = timeout;
        self
    }
}

/// Per-request handle given to a [`RequestHandler`].
#[derive(Clone)]
pub struct RequestContext {
    sequence: SequenceId,
    sender: ChannelSender,
    reverse: ReverseCaller,
}

impl RequestContext {
    pub fn sequence(&self) -> SequenceId {
        self.sequence
    }

    /// Emit a non-terminal progress message for this request.
    pub fn progress(&self, args: Vec<Value>) -> Result<()> {
        self.sender.send(Event::Progress {
            sequence: self.sequence,
            args,
        })
    }

    /// Ask the requesting side to compute something and await its answer.
    pub async fn reverse_call(&self, method: &str, payload: Value) -> Result<Value> {
        self.reverse.call(method, payload).await
    }
}

/// Issues reverse calls and correlates their responses by [`ReverseCallId`].
#[derive(Clone)]
pub struct ReverseCaller {
    inner: Arc<ReverseCallerInner>,
}

struct ReverseCallerInner {
    next_id: AtomicU64,
    pending: DashMap<ReverseCallId, oneshot::Sender<Result<Value>>>,
    sender: ChannelSender,
    timeout: Duration,
}

impl ReverseCaller {
    pub fn new(sender: ChannelSender, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ReverseCallerInner {
                next_id: AtomicU64::new(0),
                pending: DashMap::new(),
                sender,
                timeout,
            }),
        }
    }

    pub async fn call(&self, method: &str, payload: Value) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        let event = Event::ReverseCall {
            id,
            method: method.to_string(),
            payload,
        };
        if let Err(e) = self.inner.sender.send(event) {
            self.inner.pending.remove(&id);
            return Err(e);
        }
        tracing::debug!(id, %method, "Reverse call sent");

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => {
                self.inner.pending.remove(&id);
                tracing::warn!(id, %method, "Reverse call timed out");
                Err(RpcError::timeout(method, self.inner.timeout))
            }
        }
    }

    /// Settle a pending call. Unknown ids (timed out, never issued) are
    /// reported as `false`.
    pub fn complete(&self, id: ReverseCallId, result: Option<Value>, error: Option<Value>) -> bool {
        let Some((_, tx)) = self.inner.pending.remove(&id) else {
            return false;
        };
        let _ = tx.send(settle(result, error));
        true
    }

    /// Fail every outstanding call with `Disconnected`.
    pub fn fail_all(&self) -> usize {
        let ids: Vec<ReverseCallId> = self.inner.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.inner.pending.remove(&id) {
                let _ = tx.send(Err(RpcError::Disconnected));
                failed += 1;
            }
        }
        failed
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}

/// Serve requests arriving on `channel` until it closes.
pub async fn serve<H: RequestHandler>(mut channel: Channel, handler: Arc<H>, options: PeerOptions) {
    let peer = channel.peer().to_string();
    let sender = channel.sender();
    let reverse = ReverseCaller::new(sender.clone(), options.reverse_call_timeout);
    let mut tasks = JoinSet::new();

    tracing::info!(%peer, version = options.version, "Serving");

    loop {
        tokio::select! {
            inbound = channel.recv() => match inbound {
                Some(value) => match WireMessage::decode(value) {
                    Ok(Some(WireMessage::Request(request))) => {
                        if request.action == GET_VERSION {
                            answer_version(&sender, request.sequence, options.version);
                        } else {
                            let ctx = RequestContext {
                                sequence: request.sequence,
                                sender: sender.clone(),
                                reverse: reverse.clone(),
                            };
                            tasks.spawn(run_handler(Arc::clone(&handler), request, ctx));
                        }
                    }
                    Ok(Some(WireMessage::Event(Event::ReverseCallResponse { id, result, error }))) => {
                        if !reverse.complete(id, result, error) {
                            tracing::debug!(id, "Discarding response for unknown reverse call");
                        }
                    }
                    Ok(Some(other)) => {
                        tracing::warn!(received = ?other,"Unexpected message on serving side");
                    }
                    Ok(None) => tracing::debug!("Ignoring message of unknown kind"),
                    Err(e) => tracing::warn!(error = %e, "Dropping malformed message"),
                },
                None => break,
            },

            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Request task failed");
                }
            }
        }
    }

    let failed = reverse.fail_all();
    let running = tasks.len();
    // Handlers still running observe Disconnected and finish on their own.
    tasks.detach_all();
    tracing::info!(%peer, failed_reverse_calls = failed, running, "Channel closed, stopped serving");
}

fn answer_version(sender: &ChannelSender, sequence: SequenceId, version: u32) {
    tracing::debug!(sequence, version, "Answering version query");
    if sender
        .send(Response::success(sequence, json!({ "version": version })))
        .is_err()
    {
        tracing::debug!(sequence, "Channel closed before version reply");
    }
}

async fn run_handler<H: RequestHandler>(handler: Arc<H>, request: Request, ctx: RequestContext) {
    let Request {
        action,
        params,
        sequence,
    } = request;
    let sender = ctx.sender.clone();

    tracing::debug!(sequence, %action, "Handling request");
    let outcome = AssertUnwindSafe(handler.handle(&action, params, ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            tracing::error!(sequence, %action, "Request handler panicked");
            Err(SerializedError::new(
                "PanicError",
                format!("handler for {action} panicked"),
            ))
        });

    let response = match outcome {
        Ok(data) => Response::success(sequence, data),
        Err(err) => {
            tracing::debug!(sequence, %action, error = %err, "Request failed");
            Response::failure(sequence, &err)
        }
    };
    if sender.send(response).is_err() {
        tracing::debug!(sequence, %action, "Channel closed before response");
    }
}
