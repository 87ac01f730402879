use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a message within its channel; the idempotency key for jobs and assignments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    pub channel: String,
    pub message_id: i64,
}

impl MessageKey {
    pub fn new(channel: impl Into<String>, message_id: i64) -> Self {
        Self {
            channel: channel.into(),
            message_id,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.message_id)
    }
}

/// One observed channel message, upserted in place on edit or re-observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub channel: String,
    pub message_id: i64,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_forward: bool,
    #[serde(default)]
    pub is_reply: bool,
    #[serde(default)]
    pub reply_to_message_id: Option<i64>,
    #[serde(default = "Utc::now")]
    pub first_seen_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl RawMessage {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.channel.clone(), self.message_id)
    }

    /// Timestamp of the content as currently stored: the edit time if edited, else the send time.
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.edited_at.unwrap_or(self.sent_at)
    }

    /// Replies point at a message in the same channel.
    pub fn parent_key(&self) -> Option<MessageKey> {
        if !self.is_reply {
            return None;
        }
        self.reply_to_message_id
            .map(|id| MessageKey::new(self.channel.clone(), id))
    }

    /// True when `incoming` carries content newer than `self` by edit timestamp.
    pub fn is_superseded_by(&self, incoming: &RawMessage) -> bool {
        match (self.edited_at, incoming.edited_at) {
            (None, Some(_)) => true,
            (Some(current), Some(next)) => next > current,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(edited_at: Option<DateTime<Utc>>) -> RawMessage {
        let sent = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        RawMessage {
            channel: "sgtutors".into(),
            message_id: 42,
            text: "P5 Maths".into(),
            sent_at: sent,
            edited_at,
            is_forward: false,
            is_reply: false,
            reply_to_message_id: None,
            first_seen_at: sent,
            last_seen_at: sent,
            meta: serde_json::Value::Null,
        }
    }

    #[test]
    fn edit_timestamp_must_strictly_advance() {
        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).single().unwrap();
        assert!(raw(None).is_superseded_by(&raw(Some(t1))));
        assert!(raw(Some(t1)).is_superseded_by(&raw(Some(t2))));
        assert!(!raw(Some(t2)).is_superseded_by(&raw(Some(t1))));
        assert!(!raw(Some(t1)).is_superseded_by(&raw(Some(t1))));
        assert!(!raw(Some(t1)).is_superseded_by(&raw(None)));
    }

    #[test]
    fn parent_key_requires_reply_flag() {
        let mut msg = raw(None);
        msg.reply_to_message_id = Some(7);
        assert_eq!(msg.parent_key(), None);
        msg.is_reply = true;
        assert_eq!(msg.parent_key(), Some(MessageKey::new("sgtutors", 7)));
        assert_eq!(msg.key().to_string(), "sgtutors:42");
    }
}
