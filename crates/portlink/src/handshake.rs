//! Version handshake and the shared connection attempt.
//!
//! A session runs at most one connection attempt at a time. The attempt is
//! spawned as its own task and wrapped in a [`HandshakeFuture`]; every caller
//! of `ensure_ready` while it is in flight awaits a clone of the same future
//! and observes the same settled outcome.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;

use crate::bridge::protocol::VersionReply;
use crate::error::{Result, RpcError};

/// Protocol version this side speaks.
pub const SUPPORTED_VERSION: u32 = 1;

/// Shared, at-most-one-in-flight connection attempt. Resolves to the
/// negotiated remote version. Immutable once settled.
#[derive(Clone)]
pub struct HandshakeFuture {
    inner: Shared<BoxFuture<'static, Result<u32>>>,
}

impl HandshakeFuture {
    /// Run `attempt` on its own task so it makes progress even if every
    /// waiter goes away.
    pub(crate) fn spawn<F>(attempt: F) -> Self
    where
        F: Future<Output = Result<u32>> + Send + 'static,
    {
        let task = tokio::spawn(attempt);
        let inner = async move {
            task.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "Handshake task failed");
                Err(RpcError::Disconnected)
            })
        }
        .boxed()
        .shared();
        Self { inner }
    }

    /// Outcome, if the attempt has already settled.
    pub fn peek(&self) -> Option<&Result<u32>> {
        self.inner.peek()
    }

    /// Number of live handles (the session's own plus every waiter).
    pub fn waiters(&self) -> usize {
        self.inner.strong_count().unwrap_or(0)
    }
}

impl Future for HandshakeFuture {
    type Output = Result<u32>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl std::fmt::Debug for HandshakeFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeFuture")
            .field("settled", &self.peek().is_some())
            .finish()
    }
}

/// Extract the version from a `get_version` response payload.
pub fn parse_version(data: Value) -> Result<u32> {
    serde_json::from_value::<VersionReply>(data)
        .map(|reply| reply.version)
        .map_err(|e| RpcError::protocol(format!("invalid get_version reply: {e}")))
}

/// The peer must speak exactly our version.
pub fn check_version(reported: u32, supported: u32) -> Result<u32> {
    if reported == supported {
        Ok(reported)
    } else {
        Err(RpcError::UnsupportedVersion {
            reported,
            supported,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parses_version_reply() {
        assert_eq!(parse_version(json!({"version": 1})).unwrap(), 1);
        assert!(matches!(
            parse_version(json!({"v": 1})),
            Err(RpcError::Protocol(_))
        ));
        assert!(matches!(parse_version(Value::Null), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn version_mismatch_reports_both_sides() {
        assert_eq!(check_version(1, 1), Ok(1));
        assert_eq!(
            check_version(2, 1),
            Err(RpcError::UnsupportedVersion {
                reported: 2,
                supported: 1
            })
        );
    }

    #[tokio::test]
    async fn all_waiters_observe_one_attempt() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handshake = HandshakeFuture::spawn(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok::<u32, RpcError>(1)
        });

        let waiters: Vec<_> = (0..5).map(|_| handshake.clone()).collect();
        let results = futures::future::join_all(waiters).await;

        assert!(results.iter().all(|r| *r == Ok(1)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(handshake.peek(), Some(&Ok(1)));
    }

    #[tokio::test]
    async fn panicking_attempt_settles_as_disconnected() {
        let handshake = HandshakeFuture::spawn(async {
            if true {
                panic!("boom");
            }
            Ok::<u32, RpcError>(1)
        });
        assert_eq!(handshake.await, Err(RpcError::Disconnected));
    }
}
