//! State - lease guard の状態
//!
//! # 状態遷移
//! - Created → Active → Stopped
//! - Created → Stopped（auto renew なしで停止した場合）
//! - Stopped は終端。Active に戻ることはない

use serde::{Deserialize, Serialize};

/// Why a lease guard stopped renewing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// 明示的な stop / drop
    Released,
    /// consumer のキャンセルスコープが発火した
    Cancelled,
    /// renew が失敗した（lease はもう自分のものではない）
    LeaseLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseState {
    Created,
    Active,
    Stopped(StopReason),
}

impl LeaseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LeaseState::Stopped(_))
    }

    pub fn is_lost(self) -> bool {
        matches!(self, LeaseState::Stopped(StopReason::LeaseLost))
    }

    /// Apply a transition, refusing to leave the terminal state.
    ///
    /// Returns `true` if the state changed.
    pub fn transition(&mut self, next: LeaseState) -> bool {
        if self.is_terminal() || *self == next {
            return false;
        }
        if next == LeaseState::Created {
            return false;
        }
        *self = next;
        true
    }
}
