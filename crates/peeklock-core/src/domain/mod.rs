//! Domain model (IDs, messages, lease state, errors).

pub mod errors;
pub mod ids;
pub mod message;
pub mod state;

pub use self::errors::{ConsumerError, ErrorKind, Result};
pub use self::ids::{Id, IdMarker, LockToken, MessageId};
pub use self::message::MessageHandle;
pub use self::state::{LeaseState, StopReason};
