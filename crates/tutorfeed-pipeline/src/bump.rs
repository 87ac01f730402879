use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use tutorfeed_core::MessageKey;
use tutorfeed_storage::{AssignmentStore, BumpOutcome, RawStore};

/// Refreshes an assignment's freshness metadata when its post gets a reply.
#[derive(Clone)]
pub struct Bumper {
    raw: Arc<dyn RawStore>,
    assignments: Arc<dyn AssignmentStore>,
    min_interval: Duration,
}

impl Bumper {
    pub fn new(
        raw: Arc<dyn RawStore>,
        assignments: Arc<dyn AssignmentStore>,
        min_interval: Duration,
    ) -> Self {
        Self {
            raw,
            assignments,
            min_interval,
        }
    }

    /// A parent that was never stored, or never became an assignment, is a no-op.
    pub async fn bump(&self, parent: &MessageKey, now: DateTime<Utc>) -> Result<BumpOutcome> {
        let parent_raw = self
            .raw
            .get_raw(parent)
            .await
            .with_context(|| format!("loading reply parent {parent}"))?;
        if parent_raw.is_none() {
            info!(
                channel = %parent.channel,
                message_id = parent.message_id,
                "reply parent not in raw store, nothing to bump"
            );
            return Ok(BumpOutcome::NotFound);
        }

        let outcome = self
            .assignments
            .bump(parent, now, self.min_interval)
            .await
            .with_context(|| format!("bumping {parent}"))?;
        match outcome {
            BumpOutcome::Bumped { bump_count } => info!(
                channel = %parent.channel,
                message_id = parent.message_id,
                bump_count,
                "assignment bumped"
            ),
            BumpOutcome::Throttled => debug!(
                channel = %parent.channel,
                message_id = parent.message_id,
                "bump throttled"
            ),
            BumpOutcome::NotFound => info!(
                channel = %parent.channel,
                message_id = parent.message_id,
                "reply parent has no assignment, nothing to bump"
            ),
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tutorfeed_core::RawMessage;
    use tutorfeed_storage::{MemoryStore, QueueSettings};

    fn raw(message_id: i64) -> RawMessage {
        let sent = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        RawMessage {
            channel: "sgtutors".into(),
            message_id,
            text: "Sec 4 Physics, $45/hr".into(),
            sent_at: sent,
            edited_at: None,
            is_forward: false,
            is_reply: false,
            reply_to_message_id: None,
            first_seen_at: sent,
            last_seen_at: sent,
            meta: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn missing_parent_or_assignment_is_not_an_error() {
        let store = Arc::new(MemoryStore::new(QueueSettings::new("v1")));
        let bumper = Bumper::new(store.clone(), store.clone(), Duration::hours(6));
        let key = MessageKey::new("sgtutors", 1);

        assert_eq!(bumper.bump(&key, Utc::now()).await.unwrap(), BumpOutcome::NotFound);

        store.upsert_raw(&raw(1)).await.unwrap();
        assert_eq!(bumper.bump(&key, Utc::now()).await.unwrap(), BumpOutcome::NotFound);
    }
}
