//! Errors - エラー型と分類
//!
//! `ConsumerError` は消費ループ全体で共有するエラー型です。
//! `ErrorKind` は運用上の分類で、呼び出し側が variant を全部 match せずに
//! 「設定ミス / lease 喪失 / シャットダウン / 一時障害 / handler 失敗」を判別できます。

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// ErrorKind は実行エラーの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 構築時のパラメータ不正（即時失敗）
    Configuration,
    /// lease が失われた（complete してはいけない）
    Lease,
    /// 破棄済みリソースやキャンセル（シャットダウン中は無害）
    Shutdown,
    /// transport の一時障害
    Transient,
    /// business handler の失敗
    Handler,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsumerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("lease expired: {0}")]
    LeaseExpired(String),

    #[error("resource disposed: {0}")]
    ResourceDisposed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("handler failed: {0}")]
    Handler(String),
}

impl ConsumerError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn lease_expired(msg: impl Into<String>) -> Self {
        Self::LeaseExpired(msg.into())
    }

    pub fn resource_disposed(msg: impl Into<String>) -> Self {
        Self::ResourceDisposed(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::Configuration,
            Self::LeaseExpired(_) => ErrorKind::Lease,
            Self::ResourceDisposed(_) | Self::Cancelled(_) => ErrorKind::Shutdown,
            Self::Transport(_) => ErrorKind::Transient,
            Self::Handler(_) => ErrorKind::Handler,
        }
    }

    /// True for errors the controller may swallow while tearing down.
    pub fn is_benign_shutdown(&self) -> bool {
        self.kind() == ErrorKind::Shutdown
    }
}
