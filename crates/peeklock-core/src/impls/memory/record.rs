//! Message record: body + delivery metadata.

use chrono::{DateTime, Utc};

use super::MessageState;
use crate::domain::{LockToken, MessageHandle, MessageId};

/// Single source of truth for one message.
///
/// The ready queue only holds `MessageId`s; all transitions happen here.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: MessageId,
    pub body: Vec<u8>,
    pub state: MessageState,

    /// Number of times the message has been handed out.
    pub delivery_count: u32,

    /// Current lock (only while `Locked`).
    pub lock_token: Option<LockToken>,
    pub locked_until: Option<DateTime<Utc>>,

    pub enqueued_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(id: MessageId, body: Vec<u8>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            body,
            state: MessageState::Available,
            delivery_count: 0,
            lock_token: None,
            locked_until: None,
            enqueued_at: now,
        }
    }

    /// Hand the message out under a fresh lock.
    pub fn lock(&mut self, token: LockToken, until: DateTime<Utc>) -> MessageHandle {
        self.state = MessageState::Locked;
        self.delivery_count += 1;
        self.lock_token = Some(token);
        self.locked_until = Some(until);
        MessageHandle::new(
            self.id,
            token,
            self.body.clone(),
            self.delivery_count,
            self.enqueued_at,
            until,
        )
    }

    /// Does `token` still hold a live lock at `now`?
    pub fn is_held_by(&self, token: LockToken, now: DateTime<Utc>) -> bool {
        self.state == MessageState::Locked
            && self.lock_token == Some(token)
            && self.locked_until.is_some_and(|until| until > now)
    }

    pub fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == MessageState::Locked && self.locked_until.is_none_or(|until| until <= now)
    }

    /// Lock lapsed: make the message visible again.
    pub fn unlock(&mut self) {
        self.state = MessageState::Available;
        self.lock_token = None;
        self.locked_until = None;
    }

    pub fn extend(&mut self, until: DateTime<Utc>) {
        self.locked_until = Some(until);
    }

    pub fn mark_completed(&mut self) {
        self.state = MessageState::Completed;
        self.lock_token = None;
        self.locked_until = None;
    }
}
