//! LeaseGuard - 処理中メッセージの lock を延長し続ける
//!
//! peek-lock の lock 期間は有限なので、長い handler の間に期限が切れると
//! キューがメッセージを再配信してしまいます。LeaseGuard は一定間隔で
//! `renew_lock` を呼び、guard が drop されるまで lock を保持します。
//!
//! # 設計原則
//! - renew は同時に一つまで（実行中の tick はスキップ、溜め込まない）
//! - renew 失敗で clock は止まり、失敗は `LeaseWatch` から handler に見える
//! - drop で必ず clock を止める（finalizer に頼らない）
//! - 外からの停止は `LeaseOptions::cancel` で明示的に渡す

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::domain::{ConsumerError, LeaseState, MessageHandle, Result, StopReason};
use crate::ports::MessageSource;

pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(8);

#[derive(Debug, Clone)]
pub struct LeaseOptions {
    pub auto_renew: bool,
    pub renew_interval: Duration,
    /// Cancelling this stops renewal with `StopReason::Cancelled`.
    pub cancel: CancellationToken,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            auto_renew: true,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }
}

struct LeaseShared {
    source: Arc<dyn MessageSource>,
    message: OnceLock<MessageHandle>,
    renewing: Arc<tokio::sync::Mutex<()>>,
    state: watch::Sender<LeaseState>,
    failure: Mutex<Option<ConsumerError>>,
    stop: CancellationToken,
    attempts: AtomicU64,
}

impl LeaseShared {
    fn transition(&self, next: LeaseState) -> bool {
        self.state.send_if_modified(|state| state.transition(next))
    }

    fn on_tick(self: &Arc<Self>) {
        if self.message.get().is_none() {
            tracing::trace!("lease_tick_without_message");
            return;
        }
        let Ok(in_flight) = Arc::clone(&self.renewing).try_lock_owned() else {
            tracing::trace!("lease_tick_skipped: renewal in flight");
            return;
        };

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let _in_flight = in_flight;
            // The failure is already recorded and visible via LeaseWatch.
            let _ = shared.renew().await;
        });
    }

    async fn renew(&self) -> Result<()> {
        let message = self
            .message
            .get()
            .ok_or_else(|| ConsumerError::invalid_argument("lease guard has no message"))?;
        if self.stop.is_cancelled() {
            return Ok(());
        }

        self.attempts.fetch_add(1, Ordering::Relaxed);
        match self.source.renew_lock(message).await {
            Ok(locked_until) => {
                tracing::debug!(message_id = %message.id(), %locked_until, "lock_renewed");
                Ok(())
            }
            Err(e) => {
                self.stop.cancel();
                // LeaseLost と failure は同じロック区間で更新する
                let lost = {
                    let mut failure = self
                        .failure
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    let lost = self.transition(LeaseState::Stopped(StopReason::LeaseLost));
                    if lost {
                        *failure = Some(e.clone());
                    }
                    lost
                };
                if lost {
                    tracing::error!(message_id = %message.id(), "lock_renewal_failed: {}", e);
                } else {
                    // Owner already stopped the guard; a late failure is expected.
                    tracing::debug!(message_id = %message.id(), "late_renewal_failed: {}", e);
                }
                Err(e)
            }
        }
    }
}

/// Keeps one message's lock alive until stopped or dropped.
///
/// Must be created inside a tokio runtime when `auto_renew` is set.
pub struct LeaseGuard {
    shared: Arc<LeaseShared>,
    clock: Option<JoinHandle<()>>,
}

impl LeaseGuard {
    pub fn new(source: Arc<dyn MessageSource>, auto_renew: bool) -> Self {
        Self::with_options(
            source,
            LeaseOptions {
                auto_renew,
                ..LeaseOptions::default()
            },
        )
    }

    pub fn with_options(source: Arc<dyn MessageSource>, options: LeaseOptions) -> Self {
        let (state, _) = watch::channel(LeaseState::Created);
        let shared = Arc::new(LeaseShared {
            source,
            message: OnceLock::new(),
            renewing: Arc::new(tokio::sync::Mutex::new(())),
            state,
            failure: Mutex::new(None),
            stop: CancellationToken::new(),
            attempts: AtomicU64::new(0),
        });

        let clock = if options.auto_renew {
            shared.transition(LeaseState::Active);
            Some(spawn_clock(
                Arc::clone(&shared),
                options.renew_interval,
                options.cancel,
            ))
        } else {
            None
        };

        Self { shared, clock }
    }

    /// Attach the message whose lock is extended. Only the first call wins.
    pub fn set_message(&self, message: MessageHandle) -> Result<()> {
        let id = message.id();
        self.shared.message.set(message).map_err(|_| {
            ConsumerError::invalid_argument(format!("lease guard already holds a message ({id})"))
        })
    }

    pub fn message(&self) -> Option<&MessageHandle> {
        self.shared.message.get()
    }

    pub fn state(&self) -> LeaseState {
        *self.shared.state.borrow()
    }

    pub fn failure(&self) -> Option<ConsumerError> {
        self.shared
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of renew calls issued so far.
    pub fn renewal_attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::Relaxed)
    }

    pub fn watch(&self) -> LeaseWatch {
        LeaseWatch {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Disable the renewal clock. Safe to call any number of times.
    pub fn stop(&self) {
        self.shared.stop.cancel();
        if self
            .shared
            .transition(LeaseState::Stopped(StopReason::Released))
            && let Some(message) = self.shared.message.get()
        {
            tracing::trace!(message_id = %message.id(), "lease_released");
        }
    }

    /// Stop and release the clock now instead of at end of scope.
    pub fn dispose(self) {}
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.stop();
        if let Some(clock) = self.clock.take() {
            clock.abort();
        }
    }
}

impl fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("message_id", &self.message().map(|m| m.id()))
            .field("state", &self.state())
            .field("renewal_attempts", &self.renewal_attempts())
            .finish()
    }
}

fn spawn_clock(
    shared: Arc<LeaseShared>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shared.stop.cancelled() => break,
                _ = cancel.cancelled() => {
                    shared.stop.cancel();
                    shared.transition(LeaseState::Stopped(StopReason::Cancelled));
                    break;
                }
                _ = ticker.tick() => shared.on_tick(),
            }
        }
    })
}

/// Read-only view of a guard's state for the owning handler.
#[derive(Clone)]
pub struct LeaseWatch {
    shared: Arc<LeaseShared>,
}

impl LeaseWatch {
    pub fn state(&self) -> LeaseState {
        *self.shared.state.borrow()
    }

    pub fn is_lost(&self) -> bool {
        self.state().is_lost()
    }

    pub fn failure(&self) -> Option<ConsumerError> {
        self.shared
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Resolves once the lease is lost; never resolves if the guard stops
    /// for any other reason. Meant to be raced against handler work.
    pub async fn lost(&self) -> ConsumerError {
        let mut rx = self.shared.state.subscribe();
        let lost = matches!(rx.wait_for(|state| state.is_terminal()).await, Ok(state) if state.is_lost());
        if !lost {
            std::future::pending::<()>().await;
        }
        self.failure()
            .unwrap_or_else(|| ConsumerError::lease_expired("lease lost"))
    }
}

impl fmt::Debug for LeaseWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseWatch")
            .field("state", &self.state())
            .finish()
    }
}
