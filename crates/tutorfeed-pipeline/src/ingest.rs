use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use tutorfeed_core::{EnqueueResult, RawMessage};
use tutorfeed_storage::{JobQueue, RawStore, RawUpsert};

/// Parse newline-delimited JSON messages. Blank lines are ignored.
pub fn parse_jsonl(text: &str) -> Result<Vec<RawMessage>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<RawMessage>(line)
                .with_context(|| format!("parsing message on line {}", idx + 1))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub inserted: usize,
    pub edited: usize,
    pub unchanged: usize,
    /// Jobs created or re-queued.
    pub enqueued: usize,
}

/// Stores incoming messages and enqueues extraction work for new or edited text.
#[derive(Clone)]
pub struct Ingestor {
    raw: Arc<dyn RawStore>,
    queue: Arc<dyn JobQueue>,
}

impl Ingestor {
    pub fn new(raw: Arc<dyn RawStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { raw, queue }
    }

    /// An edit re-queues the job even if it already finished; a re-delivery of the
    /// same text leaves the queue alone.
    pub async fn observe(&self, message: &RawMessage) -> Result<(RawUpsert, Option<EnqueueResult>)> {
        let key = message.key();
        let upsert = self
            .raw
            .upsert_raw(message)
            .await
            .with_context(|| format!("storing raw message {key}"))?;
        let enqueued = match upsert {
            RawUpsert::Inserted => Some(self.queue.enqueue(&key, false).await),
            RawUpsert::Edited => Some(self.queue.enqueue(&key, true).await),
            RawUpsert::Unchanged => None,
        }
        .transpose()
        .with_context(|| format!("enqueueing {key}"))?;
        debug!(
            channel = %key.channel,
            message_id = key.message_id,
            upsert = ?upsert,
            enqueued = ?enqueued,
            "message observed"
        );
        Ok((upsert, enqueued))
    }

    pub async fn ingest_all(&self, messages: &[RawMessage]) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();
        for message in messages {
            let (upsert, enqueued) = self.observe(message).await?;
            match upsert {
                RawUpsert::Inserted => summary.inserted += 1,
                RawUpsert::Edited => summary.edited += 1,
                RawUpsert::Unchanged => summary.unchanged += 1,
            }
            if enqueued.is_some_and(|result| result.is_new_work()) {
                summary.enqueued += 1;
            }
        }
        info!(
            inserted = summary.inserted,
            edited = summary.edited,
            unchanged = summary.unchanged,
            enqueued = summary.enqueued,
            "ingest finished"
        );
        Ok(summary)
    }

    /// Enqueue stored messages seen since `since` that have no job for the current
    /// pipeline version. Finished jobs are left alone.
    pub async fn backfill(&self, since: DateTime<Utc>, limit: i64) -> Result<usize> {
        let messages = self
            .raw
            .raw_seen_since(since, limit)
            .await
            .context("listing raw messages for backfill")?;
        let mut enqueued = 0;
        for message in &messages {
            let key = message.key();
            let result = self
                .queue
                .enqueue(&key, false)
                .await
                .with_context(|| format!("enqueueing {key}"))?;
            if result.is_new_work() {
                enqueued += 1;
            }
        }
        info!(scanned = messages.len(), enqueued, since = %since, "backfill finished");
        Ok(enqueued)
    }
}
