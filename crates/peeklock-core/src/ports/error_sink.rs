//! ErrorSink port - 診断用のエラー通知
//!
//! 個々のメッセージ処理の外で起きた transport 障害（fetch 失敗など）を受け取ります。
//! 純粋に診断用で、フロー制御には影響しません。

use crate::domain::ConsumerError;

/// Where a reported error was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    Fetch,
    Complete,
}

impl std::fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorOrigin::Fetch => f.write_str("fetch"),
            ErrorOrigin::Complete => f.write_str("complete"),
        }
    }
}

pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &ConsumerError, origin: ErrorOrigin);
}

/// Default sink: log and move on.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, error: &ConsumerError, origin: ErrorOrigin) {
        tracing::error!(%origin, kind = ?error.kind(), "transport_error: {}", error);
    }
}

impl<F> ErrorSink for F
where
    F: Fn(&ConsumerError, ErrorOrigin) + Send + Sync,
{
    fn report(&self, error: &ConsumerError, origin: ErrorOrigin) {
        self(error, origin)
    }
}
