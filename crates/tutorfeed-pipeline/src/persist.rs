use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;
use tutorfeed_core::{AssignmentDraft, CanonicalAssignment};
use tutorfeed_storage::{AssignmentStore, PersistOutcome};

use crate::merge::merge_draft;

/// Downstream notification after a record is written. Runs in the background; an error
/// is logged and never reaches the job that wrote the record.
#[async_trait]
pub trait PersistHook: Send + Sync {
    async fn on_persisted(&self, record: &CanonicalAssignment, created: bool) -> Result<()>;
}

#[derive(Default)]
pub struct NoopPersistHook;

#[async_trait]
impl PersistHook for NoopPersistHook {
    async fn on_persisted(&self, _record: &CanonicalAssignment, _created: bool) -> Result<()> {
        Ok(())
    }
}

/// Merge-then-upsert keyed by the draft's originating message.
#[derive(Clone)]
pub struct Persister {
    store: Arc<dyn AssignmentStore>,
}

impl Persister {
    pub fn new(store: Arc<dyn AssignmentStore>) -> Self {
        Self { store }
    }

    pub async fn persist(&self, draft: &AssignmentDraft) -> Result<PersistOutcome> {
        let key = draft.key();
        let outcome = self
            .store
            .merge_upsert(&key, &|existing| merge_draft(existing, draft))
            .await
            .with_context(|| format!("persisting assignment for {key}"))?;

        let result = match &outcome {
            PersistOutcome::Created(_) => "created",
            PersistOutcome::Updated(_) => "updated",
            PersistOutcome::Kept(_) => "kept",
        };
        debug!(
            channel = %key.channel,
            message_id = key.message_id,
            assignment_id = outcome.record().map(|r| r.id),
            result,
            "assignment persisted"
        );
        Ok(outcome)
    }
}
