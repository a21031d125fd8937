//! Message handle handed out by a `MessageSource`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::errors::{ConsumerError, Result};
use super::ids::{LockToken, MessageId};

/// One locked delivery of a message.
///
/// Design:
/// - The source owns the message; this handle is only valid for one
///   processing attempt (the `lock_token` identifies that attempt).
/// - `locked_until` is informational. The source is the authority on
///   whether the lock is still held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHandle {
    id: MessageId,
    lock_token: LockToken,
    body: Vec<u8>,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
    locked_until: DateTime<Utc>,
}

impl MessageHandle {
    pub fn new(
        id: MessageId,
        lock_token: LockToken,
        body: Vec<u8>,
        delivery_count: u32,
        enqueued_at: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            lock_token,
            body,
            delivery_count,
            enqueued_at,
            locked_until,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn lock_token(&self) -> LockToken {
        self.lock_token
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as UTF-8 text, lossily converted.
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Decode a JSON body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ConsumerError::handler(format!("json decode {}: {e}", self.id)))
    }

    /// 1 on first delivery, incremented on each redelivery.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn locked_until(&self) -> DateTime<Utc> {
        self.locked_until
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Greeting {
        name: String,
    }

    fn handle(body: &[u8]) -> MessageHandle {
        let now = Utc::now();
        MessageHandle::new(
            MessageId::generate(),
            LockToken::generate(),
            body.to_vec(),
            1,
            now,
            now,
        )
    }

    #[test]
    fn decodes_json_body() {
        let msg = handle(br#"{"name":"peeklock"}"#);
        let greeting: Greeting = msg.decode().unwrap();
        assert_eq!(greeting.name, "peeklock");
    }

    #[test]
    fn decode_failure_is_a_handler_error() {
        let msg = handle(b"not json");
        let err = msg.decode::<Greeting>().unwrap_err();
        assert!(matches!(err, ConsumerError::Handler(_)));
    }

    #[test]
    fn body_str_is_lossy() {
        let msg = handle(&[b'o', b'k', 0xff]);
        assert!(msg.body_str().starts_with("ok"));
    }
}
