//! In-memory peek-lock source: state management and `MessageSource` implementation.

mod record;
mod source;
mod state;

pub use record::MessageRecord;
pub use source::InMemoryMessageSource;
pub use state::MessageState;
