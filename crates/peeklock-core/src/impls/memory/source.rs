//! In-memory peek-lock source implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};

use super::{MessageRecord, MessageState};
use crate::domain::{ConsumerError, MessageHandle, MessageId, Result};
use crate::observability::SourceCounts;
use crate::ports::{Clock, IdGenerator, MessageSource, SystemClock, UlidGenerator};

pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(5);

struct SourceState {
    /// All message records (single source of truth).
    records: HashMap<MessageId, MessageRecord>,

    /// Ready queue (MessageIds only).
    ready: VecDeque<MessageId>,
}

impl SourceState {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    /// Move messages whose lock lapsed back to the ready queue.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let mut expired: Vec<MessageId> = self
            .records
            .values()
            .filter(|record| record.lock_expired(now))
            .map(|record| record.id)
            .collect();
        // ULIDs sort by enqueue time, so older messages come back first.
        expired.sort();

        for id in expired {
            if let Some(record) = self.records.get_mut(&id) {
                tracing::debug!(message_id = %id, delivery_count = record.delivery_count, "lock_lapsed");
                record.unlock();
                self.ready.push_back(id);
            }
        }
    }

    fn counts(&self) -> SourceCounts {
        let mut counts = SourceCounts::default();
        for record in self.records.values() {
            match record.state {
                MessageState::Available => counts.available += 1,
                MessageState::Locked => counts.locked += 1,
                MessageState::Completed => counts.completed += 1,
            }
        }
        counts
    }
}

/// In-memory queue with peek-lock semantics, for development and tests.
///
/// - `fetch` locks messages for `lock_duration`; an unrenewed lock lapses
///   and the message is redelivered under a new token.
/// - `complete` / `renew_lock` require the current, unexpired token.
pub struct InMemoryMessageSource {
    state: Arc<Mutex<SourceState>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
    lock_duration: chrono::Duration,
    receive_wait: Duration,
    closed: AtomicBool,
}

impl InMemoryMessageSource {
    pub fn new(lock_duration: Duration) -> Self {
        Self::with_clock(lock_duration, Arc::new(SystemClock))
    }

    pub fn with_clock(lock_duration: Duration, clock: Arc<dyn Clock>) -> Self {
        let lock_duration = chrono::Duration::from_std(lock_duration)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            state: Arc::new(Mutex::new(SourceState::new())),
            notify: Arc::new(Notify::new()),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
            lock_duration,
            receive_wait: DEFAULT_RECEIVE_WAIT,
            closed: AtomicBool::new(false),
        }
    }

    /// How long `fetch` waits for the first message before returning empty.
    pub fn with_receive_wait(mut self, receive_wait: Duration) -> Self {
        self.receive_wait = receive_wait;
        self
    }

    /// Enqueue a message body.
    pub async fn send(&self, body: impl Into<Vec<u8>>) -> Result<MessageId> {
        self.ensure_open()?;
        let id = self.ids.generate_message_id();
        {
            let mut state = self.state.lock().await;
            state
                .records
                .insert(id, MessageRecord::new(id, body.into(), self.clock.now()));
            state.ready.push_back(id);
        }
        self.notify.notify_one();
        Ok(id)
    }

    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<MessageId> {
        let body = serde_json::to_vec(value)
            .map_err(|e| ConsumerError::invalid_argument(format!("json encode: {e}")))?;
        self.send(body).await
    }

    pub async fn counts(&self) -> SourceCounts {
        self.state.lock().await.counts()
    }

    /// Dispose the source. Every later call fails with `ResourceDisposed`,
    /// including fetches that are currently waiting.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ConsumerError::resource_disposed("message source closed"));
        }
        Ok(())
    }

    fn lock_batch(&self, state: &mut SourceState, max_count: usize) -> Vec<MessageHandle> {
        let now = self.clock.now();
        state.reclaim_expired(now);

        let mut batch = Vec::with_capacity(max_count.min(state.ready.len()));
        while batch.len() < max_count {
            let Some(id) = state.ready.pop_front() else {
                break;
            };
            let Some(record) = state.records.get_mut(&id) else {
                continue;
            };
            if record.state != MessageState::Available {
                continue;
            }
            let token = self.ids.generate_lock_token();
            batch.push(record.lock(token, now + self.lock_duration));
        }
        batch
    }

    /// Look up the record behind `message` and check its lock is still live.
    fn held_record<'a>(
        &self,
        state: &'a mut SourceState,
        message: &MessageHandle,
    ) -> Result<&'a mut MessageRecord> {
        let now = self.clock.now();
        let record = state
            .records
            .get_mut(&message.id())
            .ok_or_else(|| ConsumerError::lease_expired(format!("unknown message {}", message.id())))?;
        if !record.is_held_by(message.lock_token(), now) {
            return Err(ConsumerError::lease_expired(format!(
                "lock {} on {} is no longer held",
                message.lock_token(),
                message.id()
            )));
        }
        Ok(record)
    }
}

#[async_trait]
impl MessageSource for InMemoryMessageSource {
    async fn fetch(&self, max_count: usize) -> Result<Vec<MessageHandle>> {
        if max_count == 0 {
            return Err(ConsumerError::invalid_argument("max_count must be positive"));
        }
        let deadline = tokio::time::Instant::now() + self.receive_wait;

        loop {
            self.ensure_open()?;
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                let batch = self.lock_batch(&mut state, max_count);
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            // Wait for a send, a close, or the receive window to end.
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep_until(deadline) => {
                    self.ensure_open()?;
                    return Ok(Vec::new());
                }
            }
        }
    }

    async fn complete(&self, message: &MessageHandle) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let record = self.held_record(&mut state, message)?;
        record.mark_completed();
        Ok(())
    }

    async fn renew_lock(&self, message: &MessageHandle) -> Result<DateTime<Utc>> {
        self.ensure_open()?;
        let until = self.clock.now() + self.lock_duration;
        let mut state = self.state.lock().await;
        let record = self.held_record(&mut state, message)?;
        record.extend(until);
        Ok(until)
    }
}
