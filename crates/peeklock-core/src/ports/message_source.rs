//! MessageSource port - peek-lock キューの transport 抽象
//!
//! 接続・認証・シリアライズは実装側の責務です。
//! コアが必要とするのは fetch / complete / renew_lock の三つだけです。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{MessageHandle, Result};

/// A lease-based ("peek-lock") message queue.
///
/// Error contract:
/// - `LeaseExpired` when the lock behind a handle is gone (lapsed, or the
///   message was redelivered under a new token).
/// - `ResourceDisposed` once the source has been closed.
/// - `Transport` for anything else.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Retrieve up to `max_count` ready messages, locked for this consumer.
    /// May return fewer, including none.
    async fn fetch(&self, max_count: usize) -> Result<Vec<MessageHandle>>;

    /// Mark a message permanently processed and remove it from the queue.
    async fn complete(&self, message: &MessageHandle) -> Result<()>;

    /// Extend the lock on a message. Returns the new expiry.
    async fn renew_lock(&self, message: &MessageHandle) -> Result<DateTime<Utc>>;
}
