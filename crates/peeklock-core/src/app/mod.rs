//! App - アプリケーション層
//!
//! ports を組み合わせて消費ループを実装します。
//!
//! # 主要コンポーネント
//! - **AdmissionController**: 同時処理数の上限と pull 要求の発行
//! - **LeaseGuard**: 処理中メッセージの lock 延長
//! - **ReceivePipeline**: pull 要求 → fetch → handler → complete → slot 返却
//! - **ConsumerBuilder / Consumer**: 構築と起動・停止

pub mod admission;
pub mod builder;
pub mod consumer;
pub mod lease_guard;
pub mod pipeline;

pub use self::admission::{
    AdmissionController, AdmissionSnapshot, PullRequest, RunExit, SlotPermit, WorkRequests,
};
pub use self::builder::{BuildError, ConsumerBuilder};
pub use self::consumer::{Consumer, ConsumerHandle};
pub use self::lease_guard::{DEFAULT_RENEW_INTERVAL, LeaseGuard, LeaseOptions, LeaseWatch};
pub use self::pipeline::{ProcessOutcome, ReceivePipeline};
