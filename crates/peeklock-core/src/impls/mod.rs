//! Impls - 実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryMessageSource**: peek-lock セマンティクスを持つ開発用キュー
//!
//! 本番用のブローカー接続は別クレートに置く想定です。

pub mod memory;

pub use self::memory::InMemoryMessageSource;
