//! Pending-invocation table.
//!
//! Owned by a connection's event loop; nothing else touches it, so it needs no
//! lock. Each entry owns a oneshot completion (settling consumes it, so an
//! entry can never settle twice) and a key into the shared timer queue.

use std::collections::HashMap;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::poll_fn;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::time::{DelayQueue, delay_queue};

use crate::bridge::protocol::SequenceId;
use crate::error::{Result, RpcError};

/// Receives the `args` of every progress message for one invocation.
pub type ProgressSink = mpsc::UnboundedSender<Vec<Value>>;

/// Single-resolution completion slot handed back to the caller.
pub type Completion = oneshot::Sender<Result<Value>>;

struct PendingInvocation {
    action: String,
    timeout: Duration,
    completion: Completion,
    timer: delay_queue::Key,
    progress: Option<ProgressSink>,
}

impl PendingInvocation {
    fn settle(self, sequence: SequenceId, result: Result<Value>) {
        if self.completion.send(result).is_err() {
            tracing::trace!(sequence, action = %self.action, "Caller dropped before settlement");
        }
    }
}

pub struct PendingTable {
    entries: HashMap<SequenceId, PendingInvocation>,
    timers: DelayQueue<SequenceId>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            timers: DelayQueue::new(),
        }
    }

    pub fn insert(
        &mut self,
        sequence: SequenceId,
        action: impl Into<String>,
        timeout: Duration,
        completion: Completion,
        progress: Option<ProgressSink>,
    ) {
        let timer = self.timers.insert(sequence, timeout);
        let previous = self.entries.insert(
            sequence,
            PendingInvocation {
                action: action.into(),
                timeout,
                completion,
                timer,
                progress,
            },
        );
        // Sequence ids come from a monotone per-session counter.
        debug_assert!(previous.is_none(), "sequence id {sequence} reused");
    }

    /// Settle an entry with its terminal outcome.
    ///
    /// Returns `false` when the id is unknown: already settled, timed out, or
    /// never issued. Such late arrivals are discarded.
    pub fn resolve(&mut self, sequence: SequenceId, result: Result<Value>) -> bool {
        let Some(entry) = self.entries.remove(&sequence) else {
            return false;
        };
        self.timers.remove(&entry.timer);
        entry.settle(sequence, result);
        true
    }

    /// Forward progress to the entry's sink. Never settles the entry.
    pub fn progress(&self, sequence: SequenceId, args: Vec<Value>) -> bool {
        let Some(entry) = self.entries.get(&sequence) else {
            return false;
        };
        match entry.progress {
            Some(ref sink) => sink.send(args).is_ok(),
            None => false,
        }
    }

    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<Option<SequenceId>> {
        match self.timers.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let sequence = expired.into_inner();
                if let Some(entry) = self.entries.remove(&sequence) {
                    tracing::debug!(
                        sequence,
                        action = %entry.action,
                        timeout_ms = entry.timeout.as_millis() as u64,
                        "Invocation timed out"
                    );
                    let err = RpcError::timeout(entry.action.clone(), entry.timeout);
                    entry.settle(sequence, Err(err));
                }
                Poll::Ready(Some(sequence))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Wait for the next deadline and reject its entry with `Timeout`.
    pub async fn expired(&mut self) -> Option<SequenceId> {
        poll_fn(|cx| self.poll_expired(cx)).await
    }

    /// Reject every entry with `err` and clear the table.
    pub fn reject_all(&mut self, err: RpcError) -> usize {
        let count = self.entries.len();
        for (sequence, entry) in self.entries.drain() {
            entry.settle(sequence, Err(err.clone()));
        }
        self.timers.clear();
        count
    }

    pub fn contains(&self, sequence: SequenceId) -> bool {
        self.entries.contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn insert(table: &mut PendingTable, sequence: SequenceId, timeout_ms: u64) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        table.insert(sequence, "parse_text", Duration::from_millis(timeout_ms), tx, None);
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_settles_exactly_once() {
        let mut table = PendingTable::new();
        let mut rx = insert(&mut table, 7, 5000);

        assert!(table.resolve(7, Ok(json!({"ok": true}))));
        assert!(!table.resolve(7, Ok(json!("again"))));
        assert!(table.is_empty());

        assert_eq!(rx.try_recv().unwrap().unwrap(), json!({"ok": true}));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_rejects_with_timeout_and_forgets_id() {
        let mut table = PendingTable::new();
        let rx = insert(&mut table, 7, 5000);

        assert_eq!(table.expired().await, Some(7));
        assert!(!table.contains(7));
        assert_eq!(
            rx.await.unwrap(),
            Err(RpcError::timeout("parse_text", Duration::from_millis(5000)))
        );

        // Late arrival is discarded.
        assert!(!table.resolve(7, Ok(json!(null))));
    }

    #[tokio::test(start_paused = true)]
    async fn late_arrival_does_not_disturb_other_entries() {
        let mut table = PendingTable::new();
        let _early = insert(&mut table, 1, 100);
        let mut later = insert(&mut table, 2, 10_000);

        assert_eq!(table.expired().await, Some(1));
        assert!(!table.resolve(1, Ok(json!("late"))));

        assert!(table.contains(2));
        assert!(later.try_recv().is_err());
        assert!(table.resolve(2, Ok(json!("on time"))));
        assert_eq!(later.await.unwrap().unwrap(), json!("on time"));
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_entry_timer_never_fires() {
        let mut table = PendingTable::new();
        let _rx = insert(&mut table, 1, 100);
        assert!(table.resolve(1, Ok(json!(1))));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(table.expired().await, None);
    }

    #[tokio::test]
    async fn reject_all_empties_table() {
        let mut table = PendingTable::new();
        let receivers: Vec<_> = (0..4).map(|seq| insert(&mut table, seq, 5000)).collect();

        assert_eq!(table.reject_all(RpcError::Disconnected), 4);
        assert!(table.is_empty());
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(RpcError::Disconnected));
        }
    }

    #[tokio::test]
    async fn progress_reaches_sink_without_settling() {
        let mut table = PendingTable::new();
        let (tx, mut rx) = oneshot::channel();
        let (sink, mut progress) = mpsc::unbounded_channel();
        table.insert(3, "importDictionary", Duration::from_secs(60), tx, Some(sink));

        assert!(table.progress(3, vec![json!({"index": 1})]));
        assert!(!table.progress(99, vec![]));

        assert_eq!(progress.recv().await.unwrap(), vec![json!({"index": 1})]);
        assert!(table.contains(3));
        assert!(rx.try_recv().is_err());
    }
}
