//! Reviewer notifications for quarantined letters.
//!
//! Delivery is fire-and-forget: a notifier never returns an error to the
//! caller, and a failed send is only logged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::item::ItemId;

/// A quarantine alert for human reviewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineNotice {
    pub item_id: ItemId,
    pub reason: String,
    pub score: i32,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_quarantine(&self, item_id: ItemId, reason: &str, score: i32);
}

/// Writes alerts to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_quarantine(&self, item_id: ItemId, reason: &str, score: i32) {
        tracing::warn!(item_id = %item_id, score, reason, "Letter quarantined for review");
    }
}

/// Forwards alerts over a tokio channel to whatever drains it.
pub struct ChannelNotifier {
    tx: mpsc::Sender<QuarantineNotice>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<QuarantineNotice>) -> Self {
        Self { tx }
    }

    /// Build a notifier together with its receiving end.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<QuarantineNotice>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify_quarantine(&self, item_id: ItemId, reason: &str, score: i32) {
        let notice = QuarantineNotice {
            item_id,
            reason: reason.to_string(),
            score,
        };
        if let Err(e) = self.tx.try_send(notice) {
            tracing::warn!(item_id = %item_id, "Dropping quarantine notice: {e}");
        }
    }
}

/// Used when no reviewer channel is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_quarantine(&self, _item_id: ItemId, _reason: &str, _score: i32) {}
}
