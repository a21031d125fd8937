//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! キューの transport、business handler、エラー通知先、時刻、ID 生成は
//! すべて trait として外から注入します（グローバルな singleton は持たない）。

pub mod clock;
pub mod error_sink;
pub mod id_generator;
pub mod message_handler;
pub mod message_source;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::error_sink::{ErrorOrigin, ErrorSink, TracingErrorSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::message_handler::MessageHandler;
pub use self::message_source::MessageSource;
