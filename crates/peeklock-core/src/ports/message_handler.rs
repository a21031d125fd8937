//! MessageHandler port - business logic の入口

use async_trait::async_trait;

use crate::app::lease_guard::LeaseWatch;
use crate::domain::{MessageHandle, Result};

/// Business handler invoked once per locked message.
///
/// The handler may run for longer than the queue's lock duration; the
/// pipeline keeps the lock alive meanwhile. Long handlers should check
/// `lease.is_lost()` (or race `lease.lost()`) and give up early when the
/// lock is gone, since the message will be redelivered anyway.
///
/// Blocking work belongs in `tokio::task::spawn_blocking`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &MessageHandle, lease: &LeaseWatch) -> Result<()>;
}
