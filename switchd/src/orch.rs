//! The orchestration base: per-table consumers with last-write-wins pending
//! maps, and the `Orch` trait every reconciler implements.

use std::task::{Context, Poll};

use indexmap::IndexMap;
use tracing::debug;

use switchd_db::{KeyOpFieldValues, TableSubscription};

/// How an orchestrator disposed of one pending row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Applied; erase the row.
    Success,
    /// Malformed input; log and erase, no retry.
    Invalid,
    /// A dependency is missing; leave the row pending for the next wake.
    NeedRetry,
    /// Not applicable by policy; erase without touching hardware.
    Ignore,
}

/// Per-consumer buffer of unapplied rows, keyed by row key. A newer row for
/// the same key replaces the older one: the map holds the latest intent, not
/// a log.
pub type PendingMap = IndexMap<String, KeyOpFieldValues, ahash::RandomState>;

/// One table's ingestion state: the subscription to its change notifications
/// and the pending map the owning orchestrator works through.
pub struct Consumer {
    subscription: TableSubscription,
    priority: i32,
    pending: PendingMap,
    closed: bool,
}

impl Consumer {
    pub fn new(subscription: TableSubscription, priority: i32) -> Self {
        Consumer {
            subscription,
            priority,
            pending: PendingMap::default(),
            closed: false,
        }
    }

    pub fn table(&self) -> &str {
        self.subscription.table_name()
    }

    /// Priority within the owning orchestrator; higher processes first, ties
    /// broken by table name.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Folds one notification into the pending map; the latest row for a key
    /// wins regardless of operation.
    pub fn ingest(&mut self, row: KeyOpFieldValues) {
        self.pending.insert(row.key.clone(), row);
    }

    /// Pulls every currently available notification off the subscription.
    pub fn drain(&mut self) {
        while let Some(row) = self.subscription.try_recv() {
            self.ingest(row);
        }
    }

    /// Polls the subscription, folding the first available notification into
    /// the pending map. Pending forever once the datastore side is gone.
    pub fn poll_readable(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.closed {
            return Poll::Pending;
        }
        match self.subscription.poll_recv(cx) {
            Poll::Ready(Some(row)) => {
                self.ingest(row);
                Poll::Ready(())
            }
            Poll::Ready(None) => {
                debug!(table = self.table(), "table subscription closed");
                self.closed = true;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }

    pub fn pending(&self) -> &PendingMap {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut PendingMap {
        &mut self.pending
    }
}

/// An orchestrator: owns the reconciliation state for one or more tables and
/// works through a consumer's pending map row by row.
///
/// `process` must be idempotent: running it again over the same pending rows
/// must not produce new external effects beyond those of rows that already
/// succeeded. Rows classified [`TaskStatus::NeedRetry`] stay pending until
/// they succeed or a newer row replaces them.
pub trait Orch {
    fn name(&self) -> &'static str;

    fn process(&mut self, consumer: &mut Consumer);
}
