//! peeklock-core
//!
//! Admission-controlled peek-lock message consumption.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, message, state, errors）
//! - **ports**: 抽象化レイヤー（MessageSource, MessageHandler, ErrorSink, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（admission, lease_guard, pipeline, consumer, builder）
//! - **impls**: 実装（InMemoryMessageSource など開発用）
//! - **config**: ConsumerConfig（JSON / serde）
//! - **observability**: tracing の初期化と状態ビュー

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;

#[cfg(test)]
mod test_support;

pub use app::{
    AdmissionController, BuildError, Consumer, ConsumerBuilder, ConsumerHandle, LeaseGuard,
    LeaseWatch, RunExit,
};
pub use config::ConsumerConfig;
pub use domain::{ConsumerError, ErrorKind, MessageHandle, Result};
pub use impls::InMemoryMessageSource;
pub use ports::{MessageHandler, MessageSource};
