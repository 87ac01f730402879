use anyhow::{Context, Result};
use tutorfeed_core::{ExtractionJob, SkipReason};
use tutorfeed_storage::JobQueue;

fn one_line(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{cut}...")
}

fn job_line(job: &ExtractionJob) -> String {
    format!("- `{}` job {} attempts={}", job.key(), job.id, job.attempt)
}

/// Markdown summary separating jobs that need a human (terminal failures) from
/// content correctly recognised as not being an assignment.
pub fn triage_markdown(
    pipeline_version: &str,
    counts: &tutorfeed_core::StatusCounts,
    failed: &[ExtractionJob],
    non_assignment: &[ExtractionJob],
) -> String {
    let mut lines = vec!["# Extraction Triage".to_string(), String::new()];
    lines.push(format!("Pipeline version: `{pipeline_version}`"));
    lines.push(String::new());
    lines.push("| status | jobs |".to_string());
    lines.push("|---|---|".to_string());
    for (label, n) in [
        ("pending", counts.pending),
        ("processing", counts.processing),
        ("ok", counts.ok),
        ("skipped", counts.skipped),
        ("failed", counts.failed),
        ("total", counts.total()),
    ] {
        lines.push(format!("| {label} | {n} |"));
    }

    lines.push(String::new());
    lines.push(format!("## Needs review ({})", failed.len()));
    lines.push(String::new());
    if failed.is_empty() {
        lines.push("- none".to_string());
    }
    for job in failed {
        let code = job.error_code.as_deref().unwrap_or("unknown");
        let error = job
            .last_error
            .as_deref()
            .map(|e| one_line(e, 160))
            .unwrap_or_default();
        lines.push(format!("{} code=`{code}` {error}", job_line(job)).trim_end().to_string());
    }

    lines.push(String::new());
    lines.push(format!("## Non-assignment ({})", non_assignment.len()));
    lines.push(String::new());
    if non_assignment.is_empty() {
        lines.push("- none".to_string());
    }
    for job in non_assignment {
        lines.push(job_line(job));
    }
    lines.join("\n")
}

pub async fn triage_report(
    queue: &dyn JobQueue,
    pipeline_version: &str,
    limit: i64,
) -> Result<String> {
    let counts = queue.status_counts().await.context("loading job status counts")?;
    let failed = queue.failed_jobs(limit).await.context("loading failed jobs")?;
    let non_assignment = queue
        .skipped_jobs(SkipReason::NonAssignment, limit)
        .await
        .context("loading non-assignment skips")?;
    Ok(triage_markdown(pipeline_version, &counts, &failed, &non_assignment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tutorfeed_core::{FailureKind, JobFailure, JobOutcome, MessageKey};
    use tutorfeed_storage::{MemoryStore, QueueSettings};

    #[tokio::test]
    async fn failures_and_non_assignments_are_listed_separately() {
        let mut settings = QueueSettings::new("v1");
        settings.max_attempts = 1;
        let store = Arc::new(MemoryStore::new(settings));
        store.enqueue(&MessageKey::new("sgtutors", 1), false).await.unwrap();
        store.enqueue(&MessageKey::new("sgtutors", 2), false).await.unwrap();

        for job in store.claim_batch("w1", 10).await.unwrap() {
            let outcome = if job.message_id == 1 {
                JobOutcome::failed(JobFailure::new(
                    FailureKind::Timeout,
                    "timeout",
                    "model call timed out\nafter 45s",
                ))
            } else {
                JobOutcome::skipped(SkipReason::NonAssignment)
            };
            store.complete(&job, &outcome).await.unwrap();
        }

        let report = triage_report(store.as_ref(), "v1", 20).await.unwrap();
        assert!(report.starts_with("# Extraction Triage"));
        assert!(report.contains("| failed | 1 |"));
        assert!(report.contains("| skipped | 1 |"));

        let (review, skipped) = report.split_once("## Non-assignment").unwrap();
        assert!(review.contains("`sgtutors:1`"));
        assert!(review.contains("code=`timeout` model call timed out after 45s"));
        assert!(skipped.contains("`sgtutors:2`"));
        assert!(!skipped.contains("sgtutors:1"));
    }

    #[test]
    fn empty_sections_say_none() {
        let report = triage_markdown("v1", &Default::default(), &[], &[]);
        assert!(report.contains("## Needs review (0)\n\n- none"));
        assert!(report.contains("## Non-assignment (0)\n\n- none"));
    }
}
