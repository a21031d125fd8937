//! AdmissionController - 同時処理数の上限管理
//!
//! # フロー
//! 1. `acquire()` で slot を一つ確保（空きがなければ待つ / キャンセルで即失敗）
//! 2. 確保した slot を一つ持った `PullRequest` を consumer に送る
//! 3. consumer はメッセージを fetch し、各メッセージに slot を一つずつ持たせる
//! 4. 処理が終わって slot が drop されると、待っている `acquire()` が再開する
//!
//! 解放 → 再 pull の連鎖は `run()` の中のループで回すので、再帰は発生しません。
//! 一回の解放につき pull はちょうど一回（サイズ 1）です。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::domain::{ConsumerError, Result};

/// Ownership of one unit of processing capacity.
///
/// Dropping the permit returns the slot to the pool, so every exit path of a
/// handler (success, error, panic) releases exactly once.
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
}

impl SlotPermit {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        Self { _permit: permit }
    }

    /// Explicitly give the slot back.
    pub fn release(self) {}
}

impl fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPermit").finish_non_exhaustive()
    }
}

/// Demand for new messages: one entry per slot that just became free.
#[derive(Debug)]
pub struct PullRequest {
    slots: Vec<SlotPermit>,
}

impl PullRequest {
    fn single(permit: SlotPermit) -> Self {
        Self {
            slots: vec![permit],
        }
    }

    /// How many messages the consumer may fetch for this request.
    pub fn available_slots(&self) -> usize {
        self.slots.len()
    }

    /// Take one slot to hand to a fetched message.
    pub fn take_slot(&mut self) -> Option<SlotPermit> {
        self.slots.pop()
    }
}

/// The single consumer side of the controller's work requests.
#[derive(Debug)]
pub struct WorkRequests {
    rx: mpsc::Receiver<PullRequest>,
}

impl WorkRequests {
    pub async fn recv(&mut self) -> Option<PullRequest> {
        self.rx.recv().await
    }
}

/// Why `run()` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunExit {
    Cancelled,
    /// `stop_on_failure` tripped.
    Halted,
    /// The slot pool was closed.
    Disposed,
    /// `WorkRequests` was dropped.
    ConsumerGone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionSnapshot {
    pub capacity: usize,
    pub available: usize,
    pub in_flight: usize,
    pub halted: bool,
    pub cancelled: bool,
}

/// Bounds concurrent handlers to a fixed capacity and pulls only what fits.
pub struct AdmissionController {
    capacity: usize,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    halt: CancellationToken,
    halted: AtomicBool,
    stop_on_failure: bool,
    work_tx: mpsc::Sender<PullRequest>,
}

impl AdmissionController {
    /// Create a controller and the receiver its pull requests go to.
    ///
    /// Fails with `InvalidArgument` when `capacity` is zero.
    pub fn new(
        capacity: usize,
        cancel: CancellationToken,
        stop_on_failure: bool,
    ) -> Result<(Self, WorkRequests)> {
        if capacity == 0 {
            return Err(ConsumerError::invalid_argument(
                "capacity must be greater than zero",
            ));
        }
        if capacity > Semaphore::MAX_PERMITS {
            return Err(ConsumerError::invalid_argument(format!(
                "capacity {capacity} exceeds {}",
                Semaphore::MAX_PERMITS
            )));
        }

        // Every queued request holds a permit, so `capacity` bounds the backlog.
        let (work_tx, rx) = mpsc::channel(capacity);
        let controller = Self {
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
            cancel,
            halt: CancellationToken::new(),
            halted: AtomicBool::new(false),
            stop_on_failure,
            work_tx,
        };
        Ok((controller, WorkRequests { rx }))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let available = self.available();
        AdmissionSnapshot {
            capacity: self.capacity,
            available,
            in_flight: self.capacity.saturating_sub(available),
            halted: self.is_halted(),
            cancelled: self.cancel.is_cancelled(),
        }
    }

    /// Claim one slot, waiting until one is free.
    ///
    /// Cancellation wins over a free slot: once the token fires this fails
    /// with `Cancelled` and claims nothing.
    pub async fn acquire(&self) -> Result<SlotPermit> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(ConsumerError::cancelled("slot acquisition"))
            }
            permit = Arc::clone(&self.slots).acquire_owned() => permit
                .map(SlotPermit::new)
                .map_err(|_| ConsumerError::resource_disposed("slot pool closed")),
        }
    }

    /// Dispatch loop: one `PullRequest` per claimed slot until stopped.
    ///
    /// With all capacity free this issues `capacity` requests back to back;
    /// afterwards each released slot yields exactly one more request.
    /// Shutdown races (cancel, close, consumer dropped) end the loop quietly.
    pub async fn run(&self) -> RunExit {
        tracing::info!(capacity = self.capacity, "admission_started");

        let exit = loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break RunExit::Cancelled,
                _ = self.halt.cancelled() => break RunExit::Halted,
                acquired = self.acquire() => match acquired {
                    Ok(permit) => permit,
                    Err(ConsumerError::Cancelled(_)) => break RunExit::Cancelled,
                    Err(e) => {
                        tracing::debug!("slot_pool_unavailable: {}", e);
                        break RunExit::Disposed;
                    }
                },
            };

            if self.work_tx.send(PullRequest::single(permit)).await.is_err() {
                // The request (and its permit) was dropped with the error.
                break RunExit::ConsumerGone;
            }
            tracing::trace!(available = self.available(), "pull_requested");
        };

        tracing::info!(?exit, in_flight = self.in_flight(), "admission_stopped");
        exit
    }

    /// Return a slot. The dispatch loop re-offers it immediately.
    pub fn release(&self, permit: SlotPermit) {
        permit.release();
        tracing::trace!(available = self.available(), "slot_released");
    }

    /// Record a handler failure. With `stop_on_failure` this halts all
    /// future pulls; in-flight work still drains.
    ///
    /// Returns `true` if this call halted the controller.
    pub fn report_failure(&self, error: &ConsumerError) -> bool {
        if !self.stop_on_failure {
            return false;
        }
        if self.halted.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::warn!(kind = ?error.kind(), "admission_halted: {}", error);
        self.halt.cancel();
        true
    }

    /// Tear the slot pool down. Pending `acquire` calls fail with
    /// `ResourceDisposed`; releasing outstanding permits stays harmless.
    pub fn close(&self) {
        self.slots.close();
    }
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .field("halted", &self.is_halted())
            .field("stop_on_failure", &self.stop_on_failure)
            .finish()
    }
}
