//! Hand-written `MessageSource` double shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{ConsumerError, LockToken, MessageHandle, MessageId, Result};
use crate::ports::MessageSource;

pub(crate) fn sample_message() -> MessageHandle {
    message_with_body(br#"{"name":"test"}"#)
}

pub(crate) fn message_with_body(body: &[u8]) -> MessageHandle {
    let now = Utc::now();
    MessageHandle::new(
        MessageId::generate(),
        LockToken::generate(),
        body.to_vec(),
        1,
        now,
        now + chrono::Duration::seconds(30),
    )
}

/// Source whose behaviour is scripted per test.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    renew_delay: Duration,
    renew_error: Mutex<Option<ConsumerError>>,
    complete_error: Mutex<Option<ConsumerError>>,
    fetch_errors: Mutex<VecDeque<ConsumerError>>,
    pending: Mutex<VecDeque<MessageHandle>>,
    completed: Mutex<Vec<MessageId>>,
    renewals: AtomicUsize,
    renewing: AtomicUsize,
    renew_peak: AtomicUsize,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_renew_delay(mut self, delay: Duration) -> Self {
        self.renew_delay = delay;
        self
    }

    pub(crate) fn with_messages(self, messages: impl IntoIterator<Item = MessageHandle>) -> Self {
        self.pending.lock().unwrap().extend(messages);
        self
    }

    pub(crate) fn fail_renewals(&self, error: ConsumerError) {
        *self.renew_error.lock().unwrap() = Some(error);
    }

    pub(crate) fn fail_completes(&self, error: ConsumerError) {
        *self.complete_error.lock().unwrap() = Some(error);
    }

    pub(crate) fn fail_next_fetch(&self, error: ConsumerError) {
        self.fetch_errors.lock().unwrap().push_back(error);
    }

    pub(crate) fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    pub(crate) fn renew_peak(&self) -> usize {
        self.renew_peak.load(Ordering::SeqCst)
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn completed(&self) -> Vec<MessageId> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn fetch(&self, max_count: usize) -> Result<Vec<MessageHandle>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.fetch_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut pending = self.pending.lock().unwrap();
        let take = max_count.min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    async fn complete(&self, message: &MessageHandle) -> Result<()> {
        if let Some(error) = self.complete_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.completed.lock().unwrap().push(message.id());
        Ok(())
    }

    async fn renew_lock(&self, message: &MessageHandle) -> Result<DateTime<Utc>> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        let now = self.renewing.fetch_add(1, Ordering::SeqCst) + 1;
        self.renew_peak.fetch_max(now, Ordering::SeqCst);

        if !self.renew_delay.is_zero() {
            tokio::time::sleep(self.renew_delay).await;
        }
        self.renewing.fetch_sub(1, Ordering::SeqCst);

        match self.renew_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(message.locked_until() + chrono::Duration::seconds(30)),
        }
    }
}
