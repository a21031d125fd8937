//! Message state machine for the in-memory source.

use serde::{Deserialize, Serialize};

/// State transitions:
/// - Available -> Locked -> Completed
/// - Available -> Locked -> Available (lock lapsed, message is redelivered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    /// Visible to `fetch`.
    Available,

    /// Held by one consumer under a lock token.
    Locked,

    /// Removed from the queue for good.
    Completed,
}
