use std::str::FromStr;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use tutorfeed_core::{
    AcademicRequest, AssignmentKind, AssignmentStatus, CanonicalAssignment, CompleteResult,
    DuplicateGroup, DuplicateMember, EnqueueResult, ExtractionJob, JobOutcome, JobStatus,
    LearningMode, Level, Location, MessageKey, Provenance, RateRange, RawMessage, SkipReason,
    StatusCounts, TimeWindow, TutorTypeRate,
};

use crate::{
    AssignmentStore, BumpOutcome, DuplicateStore, FailureTransition, GroupPlan, JobQueue,
    MergeDecision, MergeFn, PersistOutcome, QueueSettings, RawStore, RawUpsert,
};

#[derive(Debug, Clone)]
pub struct PgStoreOptions {
    pub max_connections: u32,
    pub acquire_timeout: StdDuration,
    pub statement_timeout: Option<StdDuration>,
}

impl Default for PgStoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: StdDuration::from_secs(5),
            statement_timeout: Some(StdDuration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    settings: QueueSettings,
}

impl PgStore {
    pub async fn connect(
        database_url: &str,
        options: &PgStoreOptions,
        settings: QueueSettings,
    ) -> Result<Self> {
        let mut connect = PgConnectOptions::from_str(database_url).context("invalid database url")?;
        if let Some(timeout) = options.statement_timeout {
            connect = connect.options([("statement_timeout", format!("{}ms", timeout.as_millis()))]);
        }
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect_with(connect)
            .await
            .context("failed to connect to postgres")?;
        Ok(Self::from_pool(pool, settings))
    }

    pub fn from_pool(pool: PgPool, settings: QueueSettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to apply migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    fn stale_after_secs(&self) -> f64 {
        secs_f64(self.settings.stale_after)
    }
}

fn secs_f64(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .with_context(|| format!("column {column} holds {raw:?}"))
}

fn parse_optional_column<T>(row: &PgRow, column: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|v| {
        v.parse::<T>()
            .with_context(|| format!("column {column} holds {v:?}"))
    })
    .transpose()
}

fn raw_from_row(row: &PgRow) -> Result<RawMessage> {
    Ok(RawMessage {
        channel: row.try_get("channel")?,
        message_id: row.try_get("message_id")?,
        text: row.try_get("text")?,
        sent_at: row.try_get("sent_at")?,
        edited_at: row.try_get("edited_at")?,
        is_forward: row.try_get("is_forward")?,
        is_reply: row.try_get("is_reply")?,
        reply_to_message_id: row.try_get("reply_to_message_id")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        meta: row.try_get("meta")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<ExtractionJob> {
    Ok(ExtractionJob {
        id: row.try_get("id")?,
        channel: row.try_get("channel")?,
        message_id: row.try_get("message_id")?,
        pipeline_version: row.try_get("pipeline_version")?,
        status: parse_column::<JobStatus>(row, "status")?,
        attempt: row.try_get("attempt")?,
        generation: row.try_get("generation")?,
        claimed_at: row.try_get("claimed_at")?,
        claimed_by: row.try_get("claimed_by")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        skip_reason: parse_optional_column::<SkipReason>(row, "skip_reason")?,
        error_code: row.try_get("error_code")?,
        last_error: row.try_get("last_error")?,
        result_meta: row.try_get("result_meta")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn assignment_from_row(row: &PgRow) -> Result<CanonicalAssignment> {
    let academic_requests: Json<Vec<AcademicRequest>> = row.try_get("academic_requests")?;
    let tutor_types: Json<Vec<TutorTypeRate>> = row.try_get("tutor_types")?;
    let time_availability: Json<Vec<TimeWindow>> = row.try_get("time_availability")?;
    let provenance: Json<std::collections::BTreeMap<String, Provenance>> =
        row.try_get("provenance")?;

    Ok(CanonicalAssignment {
        id: row.try_get("id")?,
        channel: row.try_get("channel")?,
        message_id: row.try_get("message_id")?,
        status: parse_column::<AssignmentStatus>(row, "status")?,
        kind: parse_column::<AssignmentKind>(row, "kind")?,
        assignment_code: row.try_get("assignment_code")?,
        subjects: row.try_get("subjects")?,
        level: parse_optional_column::<Level>(row, "level")?,
        specific_grade: row.try_get("specific_grade")?,
        stream: row.try_get("stream")?,
        academic_requests: academic_requests.0,
        rate: RateRange::new(row.try_get("rate_min")?, row.try_get("rate_max")?),
        tutor_types: tutor_types.0,
        time_availability: time_availability.0,
        learning_mode: parse_optional_column::<LearningMode>(row, "learning_mode")?,
        location: Location {
            address: row.try_get("address")?,
            postal_code: row.try_get("postal_code")?,
            region: row.try_get("region")?,
            nearest_mrt: row.try_get("nearest_mrt")?,
        },
        summary: row.try_get("summary")?,
        remarks: row.try_get("remarks")?,
        schedule_text: row.try_get("schedule_text")?,
        raw_text: row.try_get("raw_text")?,
        duplicate_group_id: row.try_get("duplicate_group_id")?,
        is_primary: row.try_get("is_primary")?,
        duplicate_confidence: row.try_get("duplicate_confidence")?,
        quality_flags: row.try_get("quality_flags")?,
        provenance: provenance.0,
        display_observed_at: row.try_get("display_observed_at")?,
        pipeline_version: row.try_get("pipeline_version")?,
        published_at: row.try_get("published_at")?,
        source_edited_at: row.try_get("source_edited_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        last_bumped_at: row.try_get("last_bumped_at")?,
        bump_count: row.try_get("bump_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RawStore for PgStore {
    async fn upsert_raw(&self, raw: &RawMessage) -> Result<RawUpsert> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO raw_messages
                (channel, message_id, text, sent_at, edited_at, is_forward, is_reply,
                 reply_to_message_id, first_seen_at, last_seen_at, meta)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (channel, message_id) DO NOTHING
            RETURNING message_id
            "#,
        )
        .bind(&raw.channel)
        .bind(raw.message_id)
        .bind(&raw.text)
        .bind(raw.sent_at)
        .bind(raw.edited_at)
        .bind(raw.is_forward)
        .bind(raw.is_reply)
        .bind(raw.reply_to_message_id)
        .bind(raw.first_seen_at)
        .bind(raw.last_seen_at)
        .bind(&raw.meta)
        .fetch_optional(&mut *tx)
        .await?;
        if inserted.is_some() {
            tx.commit().await?;
            return Ok(RawUpsert::Inserted);
        }

        let row = sqlx::query(
            r#"
            SELECT * FROM raw_messages
             WHERE channel = $1 AND message_id = $2
             FOR UPDATE
            "#,
        )
        .bind(&raw.channel)
        .bind(raw.message_id)
        .fetch_one(&mut *tx)
        .await?;
        let existing = raw_from_row(&row)?;
        let last_seen_at = existing.last_seen_at.max(raw.last_seen_at);

        let outcome = if existing.is_superseded_by(raw) {
            sqlx::query(
                r#"
                UPDATE raw_messages
                   SET text = $3,
                       edited_at = $4,
                       is_forward = $5,
                       is_reply = $6,
                       reply_to_message_id = $7,
                       last_seen_at = $8,
                       meta = $9
                 WHERE channel = $1 AND message_id = $2
                "#,
            )
            .bind(&raw.channel)
            .bind(raw.message_id)
            .bind(&raw.text)
            .bind(raw.edited_at)
            .bind(raw.is_forward)
            .bind(raw.is_reply)
            .bind(raw.reply_to_message_id)
            .bind(last_seen_at)
            .bind(&raw.meta)
            .execute(&mut *tx)
            .await?;
            RawUpsert::Edited
        } else {
            sqlx::query(
                "UPDATE raw_messages SET last_seen_at = $3 WHERE channel = $1 AND message_id = $2",
            )
            .bind(&raw.channel)
            .bind(raw.message_id)
            .bind(last_seen_at)
            .execute(&mut *tx)
            .await?;
            RawUpsert::Unchanged
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_raw(&self, key: &MessageKey) -> Result<Option<RawMessage>> {
        let row = sqlx::query("SELECT * FROM raw_messages WHERE channel = $1 AND message_id = $2")
            .bind(&key.channel)
            .bind(key.message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(raw_from_row).transpose()
    }

    async fn raw_seen_since(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<RawMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM raw_messages
             WHERE last_seen_at >= $1
             ORDER BY last_seen_at, channel, message_id
             LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(raw_from_row).collect()
    }
}

#[async_trait]
impl JobQueue for PgStore {
    async fn enqueue(&self, key: &MessageKey, force: bool) -> Result<EnqueueResult> {
        let version = &self.settings.pipeline_version;
        let created: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO extraction_jobs (channel, message_id, pipeline_version)
            VALUES ($1, $2, $3)
            ON CONFLICT (channel, message_id, pipeline_version) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&key.channel)
        .bind(key.message_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(id) = created {
            return Ok(EnqueueResult::Created(id));
        }

        if force {
            let id: i64 = sqlx::query_scalar(
                r#"
                UPDATE extraction_jobs
                   SET status = 'pending',
                       attempt = 0,
                       generation = generation + 1,
                       claimed_at = NULL,
                       claimed_by = NULL,
                       next_attempt_at = NULL,
                       skip_reason = NULL,
                       error_code = NULL,
                       last_error = NULL,
                       completed_at = NULL,
                       updated_at = NOW()
                 WHERE channel = $1 AND message_id = $2 AND pipeline_version = $3
                RETURNING id
                "#,
            )
            .bind(&key.channel)
            .bind(key.message_id)
            .bind(version)
            .fetch_one(&self.pool)
            .await?;
            return Ok(EnqueueResult::Requeued(id));
        }

        let row = sqlx::query(
            r#"
            SELECT id, status FROM extraction_jobs
             WHERE channel = $1 AND message_id = $2 AND pipeline_version = $3
            "#,
        )
        .bind(&key.channel)
        .bind(key.message_id)
        .bind(version)
        .fetch_one(&self.pool)
        .await?;
        let id: i64 = row.try_get("id")?;
        match parse_column::<JobStatus>(&row, "status")? {
            JobStatus::Pending | JobStatus::Processing => Ok(EnqueueResult::AlreadyQueued(id)),
            _ => Ok(EnqueueResult::AlreadyProcessed(id)),
        }
    }

    async fn claim_batch(&self, worker_id: &str, limit: i64) -> Result<Vec<ExtractionJob>> {
        let rows = sqlx::query(
            r#"
            WITH next_jobs AS (
                SELECT id
                  FROM extraction_jobs
                 WHERE pipeline_version = $1
                   AND attempt < $2
                   AND (
                        (status = 'pending'
                         AND (next_attempt_at IS NULL OR next_attempt_at <= NOW()))
                     OR (status = 'processing'
                         AND claimed_at < NOW() - make_interval(secs => $3))
                   )
                 ORDER BY COALESCE(next_attempt_at, created_at), id
                 LIMIT $4
                 FOR UPDATE SKIP LOCKED
            )
            UPDATE extraction_jobs j
               SET attempt = CASE WHEN j.status = 'processing' THEN j.attempt + 1 ELSE j.attempt END,
                   status = 'processing',
                   claimed_at = NOW(),
                   claimed_by = $5,
                   updated_at = NOW()
              FROM next_jobs
             WHERE j.id = next_jobs.id
            RETURNING j.*
            "#,
        )
        .bind(&self.settings.pipeline_version)
        .bind(self.settings.max_attempts)
        .bind(self.stale_after_secs())
        .bind(limit)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        jobs.sort_by_key(|j| (j.next_attempt_at.unwrap_or(j.created_at), j.id));
        debug!(worker_id, claimed = jobs.len(), "claimed extraction jobs");
        Ok(jobs)
    }

    async fn complete(&self, job: &ExtractionJob, outcome: &JobOutcome) -> Result<CompleteResult> {
        let now = Utc::now();
        let mut status = JobStatus::Ok;
        let mut attempt = job.attempt;
        let mut next_attempt_at: Option<DateTime<Utc>> = None;
        let mut skip_reason: Option<&'static str> = None;
        let mut error_code: Option<&str> = None;
        let mut last_error: Option<&str> = None;
        let mut completed_at = Some(now);

        match outcome {
            JobOutcome::Ok { .. } => {}
            JobOutcome::Skipped { reason, .. } => {
                status = JobStatus::Skipped;
                skip_reason = Some(reason.as_str());
            }
            JobOutcome::Failed { failure, .. } => {
                error_code = Some(&failure.code);
                last_error = Some(&failure.message);
                match self
                    .settings
                    .failure_transition(job.attempt, failure.retryable(), now)
                {
                    FailureTransition::Retry {
                        attempt: next,
                        next_attempt_at: at,
                    } => {
                        status = JobStatus::Pending;
                        attempt = next;
                        next_attempt_at = Some(at);
                        completed_at = None;
                    }
                    FailureTransition::Terminal { attempt: next } => {
                        status = JobStatus::Failed;
                        attempt = next;
                    }
                }
            }
        }

        let updated = sqlx::query(
            r#"
            UPDATE extraction_jobs
               SET status = $1,
                   attempt = $2,
                   next_attempt_at = $3,
                   claimed_at = CASE WHEN $1 = 'pending' THEN NULL ELSE claimed_at END,
                   claimed_by = CASE WHEN $1 = 'pending' THEN NULL ELSE claimed_by END,
                   skip_reason = $4,
                   error_code = $5,
                   last_error = $6,
                   result_meta = $7,
                   completed_at = $8,
                   updated_at = NOW()
             WHERE id = $9
               AND status = 'processing'
               AND claimed_by = $10
               AND generation = $11
               AND attempt = $12
            "#,
        )
        .bind(status.as_str())
        .bind(attempt)
        .bind(next_attempt_at)
        .bind(skip_reason)
        .bind(error_code)
        .bind(last_error)
        .bind(outcome.meta())
        .bind(completed_at)
        .bind(job.id)
        .bind(&job.claimed_by)
        .bind(job.generation)
        .bind(job.attempt)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(CompleteResult::Stale);
        }
        Ok(CompleteResult::Applied(status))
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE extraction_jobs
               SET attempt = attempt + 1,
                   status = CASE WHEN attempt + 1 >= $2 THEN 'failed' ELSE 'pending' END,
                   error_code = CASE WHEN attempt + 1 >= $2 THEN 'stale_exhausted' ELSE error_code END,
                   completed_at = CASE WHEN attempt + 1 >= $2 THEN NOW() ELSE NULL END,
                   next_attempt_at = NULL,
                   claimed_at = NULL,
                   claimed_by = NULL,
                   updated_at = NOW()
             WHERE pipeline_version = $1
               AND status = 'processing'
               AND (claimed_at IS NULL OR claimed_at < NOW() - make_interval(secs => $3))
            "#,
        )
        .bind(&self.settings.pipeline_version)
        .bind(self.settings.max_attempts)
        .bind(secs_f64(older_than))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_job(&self, key: &MessageKey) -> Result<Option<ExtractionJob>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM extraction_jobs
             WHERE channel = $1 AND message_id = $2 AND pipeline_version = $3
            "#,
        )
        .bind(&key.channel)
        .bind(key.message_id)
        .bind(&self.settings.pipeline_version)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn failed_jobs(&self, limit: i64) -> Result<Vec<ExtractionJob>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM extraction_jobs
             WHERE pipeline_version = $1 AND status = 'failed'
             ORDER BY updated_at DESC
             LIMIT $2
            "#,
        )
        .bind(&self.settings.pipeline_version)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn skipped_jobs(&self, reason: SkipReason, limit: i64) -> Result<Vec<ExtractionJob>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM extraction_jobs
             WHERE pipeline_version = $1 AND status = 'skipped' AND skip_reason = $2
             ORDER BY updated_at DESC
             LIMIT $3
            "#,
        )
        .bind(&self.settings.pipeline_version)
        .bind(reason.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
              FROM extraction_jobs
             WHERE pipeline_version = $1
             GROUP BY status
            "#,
        )
        .bind(&self.settings.pipeline_version)
        .fetch_all(&self.pool)
        .await?;
        let mut counts = StatusCounts::default();
        for row in &rows {
            let n: i64 = row.try_get("n")?;
            counts.add(parse_column::<JobStatus>(row, "status")?, n.max(0) as u64);
        }
        Ok(counts)
    }
}

async fn write_assignment(
    tx: &mut Transaction<'_, Postgres>,
    record: &CanonicalAssignment,
) -> Result<(CanonicalAssignment, bool)> {
    let row = sqlx::query(
        r#"
        INSERT INTO assignments
            (channel, message_id, status, kind, assignment_code, subjects, level,
             specific_grade, stream, academic_requests, rate_min, rate_max, tutor_types,
             time_availability, learning_mode, address, postal_code, region, nearest_mrt,
             summary, remarks, schedule_text, raw_text, duplicate_group_id, is_primary,
             duplicate_confidence, quality_flags, provenance, display_observed_at,
             pipeline_version, published_at, source_edited_at, last_seen_at, last_bumped_at,
             bump_count)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32,
                $33, $34, $35)
        ON CONFLICT (channel, message_id) DO UPDATE SET
            status = EXCLUDED.status,
            kind = EXCLUDED.kind,
            assignment_code = EXCLUDED.assignment_code,
            subjects = EXCLUDED.subjects,
            level = EXCLUDED.level,
            specific_grade = EXCLUDED.specific_grade,
            stream = EXCLUDED.stream,
            academic_requests = EXCLUDED.academic_requests,
            rate_min = EXCLUDED.rate_min,
            rate_max = EXCLUDED.rate_max,
            tutor_types = EXCLUDED.tutor_types,
            time_availability = EXCLUDED.time_availability,
            learning_mode = EXCLUDED.learning_mode,
            address = EXCLUDED.address,
            postal_code = EXCLUDED.postal_code,
            region = EXCLUDED.region,
            nearest_mrt = EXCLUDED.nearest_mrt,
            summary = EXCLUDED.summary,
            remarks = EXCLUDED.remarks,
            schedule_text = EXCLUDED.schedule_text,
            raw_text = EXCLUDED.raw_text,
            quality_flags = EXCLUDED.quality_flags,
            provenance = EXCLUDED.provenance,
            display_observed_at = EXCLUDED.display_observed_at,
            pipeline_version = EXCLUDED.pipeline_version,
            published_at = EXCLUDED.published_at,
            source_edited_at = EXCLUDED.source_edited_at,
            last_seen_at = GREATEST(assignments.last_seen_at, EXCLUDED.last_seen_at),
            last_bumped_at = GREATEST(assignments.last_bumped_at, EXCLUDED.last_bumped_at),
            bump_count = GREATEST(assignments.bump_count, EXCLUDED.bump_count),
            updated_at = NOW()
        RETURNING *, (xmax = 0) AS inserted
        "#,
    )
    .bind(&record.channel)
    .bind(record.message_id)
    .bind(record.status.as_str())
    .bind(record.kind.as_str())
    .bind(&record.assignment_code)
    .bind(&record.subjects)
    .bind(record.level.map(|l| l.as_str()))
    .bind(&record.specific_grade)
    .bind(&record.stream)
    .bind(Json(&record.academic_requests))
    .bind(record.rate.min)
    .bind(record.rate.max)
    .bind(Json(&record.tutor_types))
    .bind(Json(&record.time_availability))
    .bind(record.learning_mode.map(|m| m.as_str()))
    .bind(&record.location.address)
    .bind(&record.location.postal_code)
    .bind(&record.location.region)
    .bind(&record.location.nearest_mrt)
    .bind(&record.summary)
    .bind(&record.remarks)
    .bind(&record.schedule_text)
    .bind(&record.raw_text)
    .bind(record.duplicate_group_id)
    .bind(record.is_primary)
    .bind(record.duplicate_confidence)
    .bind(&record.quality_flags)
    .bind(Json(&record.provenance))
    .bind(record.display_observed_at)
    .bind(&record.pipeline_version)
    .bind(record.published_at)
    .bind(record.source_edited_at)
    .bind(record.last_seen_at)
    .bind(record.last_bumped_at)
    .bind(record.bump_count)
    .fetch_one(&mut **tx)
    .await
    .context("failed to upsert assignment")?;

    let inserted: bool = row.try_get("inserted")?;
    Ok((assignment_from_row(&row)?, inserted))
}

#[async_trait]
impl AssignmentStore for PgStore {
    async fn merge_upsert(&self, key: &MessageKey, merge: &MergeFn<'_>) -> Result<PersistOutcome> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key.to_string())
            .execute(&mut *tx)
            .await?;

        // Row lock: bump and expiry are plain UPDATEs and must wait for this merge.
        let existing = sqlx::query(
            "SELECT * FROM assignments WHERE channel = $1 AND message_id = $2 FOR UPDATE",
        )
        .bind(&key.channel)
        .bind(key.message_id)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(assignment_from_row)
        .transpose()?;

        match merge(existing.clone()) {
            MergeDecision::Keep => {
                tx.commit().await?;
                Ok(PersistOutcome::Kept(existing))
            }
            MergeDecision::Write(record) => {
                if record.key() != *key {
                    bail!("merge for {key} produced a record for {}", record.key());
                }
                let (written, inserted) = write_assignment(&mut tx, &record).await?;
                tx.commit().await?;
                if inserted {
                    Ok(PersistOutcome::Created(written))
                } else {
                    Ok(PersistOutcome::Updated(written))
                }
            }
        }
    }

    async fn get_assignment(&self, key: &MessageKey) -> Result<Option<CanonicalAssignment>> {
        let row = sqlx::query("SELECT * FROM assignments WHERE channel = $1 AND message_id = $2")
            .bind(&key.channel)
            .bind(key.message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(assignment_from_row).transpose()
    }

    async fn get_assignment_by_id(&self, id: i64) -> Result<Option<CanonicalAssignment>> {
        let row = sqlx::query("SELECT * FROM assignments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(assignment_from_row).transpose()
    }

    async fn bump(
        &self,
        key: &MessageKey,
        now: DateTime<Utc>,
        min_interval: Duration,
    ) -> Result<BumpOutcome> {
        let bumped: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE assignments
               SET last_seen_at = GREATEST(last_seen_at, $3),
                   last_bumped_at = $3,
                   bump_count = bump_count + 1,
                   updated_at = NOW()
             WHERE channel = $1
               AND message_id = $2
               AND (last_bumped_at IS NULL OR last_bumped_at <= $3 - make_interval(secs => $4))
            RETURNING bump_count
            "#,
        )
        .bind(&key.channel)
        .bind(key.message_id)
        .bind(now)
        .bind(secs_f64(min_interval))
        .fetch_optional(&self.pool)
        .await?;
        if let Some(bump_count) = bumped {
            return Ok(BumpOutcome::Bumped { bump_count });
        }

        let exists: Option<i64> =
            sqlx::query_scalar("SELECT id FROM assignments WHERE channel = $1 AND message_id = $2")
                .bind(&key.channel)
                .bind(key.message_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(match exists {
            Some(_) => BumpOutcome::Throttled,
            None => BumpOutcome::NotFound,
        })
    }

    async fn open_published_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CanonicalAssignment>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM assignments
             WHERE status = 'open' AND published_at >= $1
             ORDER BY published_at DESC
             LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(assignment_from_row).collect()
    }

    async fn expire_unseen(&self, last_seen_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE assignments
               SET status = 'expired', updated_at = NOW()
             WHERE status = 'open' AND last_seen_at < $1
            "#,
        )
        .bind(last_seen_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn assignment_count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assignments")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }
}

impl PgStore {
    async fn load_group(&self, group_id: i64) -> Result<Option<DuplicateGroup>> {
        let Some(row) = sqlx::query("SELECT * FROM duplicate_groups WHERE id = $1")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let members = sqlx::query(
            r#"
            SELECT assignment_id, confidence, is_primary
              FROM duplicate_group_members
             WHERE group_id = $1
             ORDER BY assignment_id
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|m| -> Result<DuplicateMember> {
            Ok(DuplicateMember {
                assignment_id: m.try_get("assignment_id")?,
                confidence: m.try_get("confidence")?,
                is_primary: m.try_get("is_primary")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        Ok(Some(DuplicateGroup {
            id: row.try_get("id")?,
            primary_assignment_id: row.try_get("primary_assignment_id")?,
            members,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}

#[async_trait]
impl DuplicateStore for PgStore {
    async fn group_for_assignment(&self, assignment_id: i64) -> Result<Option<DuplicateGroup>> {
        let group_id: Option<i64> = sqlx::query_scalar(
            "SELECT group_id FROM duplicate_group_members WHERE assignment_id = $1",
        )
        .bind(assignment_id)
        .fetch_optional(&self.pool)
        .await?;
        match group_id {
            Some(id) => self.load_group(id).await,
            None => Ok(None),
        }
    }

    async fn save_group(&self, plan: &GroupPlan) -> Result<DuplicateGroup> {
        let mut tx = self.pool.begin().await?;

        let group_id: i64 = match plan.group_id {
            Some(id) => sqlx::query_scalar(
                r#"
                UPDATE duplicate_groups
                   SET primary_assignment_id = $2, updated_at = NOW()
                 WHERE id = $1
                RETURNING id
                "#,
            )
            .bind(id)
            .bind(plan.primary_assignment_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("duplicate group {id} no longer exists"))?,
            None => sqlx::query_scalar(
                "INSERT INTO duplicate_groups (primary_assignment_id) VALUES ($1) RETURNING id",
            )
            .bind(plan.primary_assignment_id)
            .fetch_one(&mut *tx)
            .await?,
        };

        for absorbed in &plan.absorbed_group_ids {
            sqlx::query("DELETE FROM duplicate_groups WHERE id = $1")
                .bind(absorbed)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM duplicate_group_members WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;

        for member in &plan.members {
            sqlx::query(
                r#"
                INSERT INTO duplicate_group_members (group_id, assignment_id, confidence, is_primary)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (assignment_id) DO UPDATE SET
                    group_id = EXCLUDED.group_id,
                    confidence = EXCLUDED.confidence,
                    is_primary = EXCLUDED.is_primary
                "#,
            )
            .bind(group_id)
            .bind(member.assignment_id)
            .bind(member.confidence)
            .bind(member.is_primary)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                r#"
                UPDATE assignments
                   SET duplicate_group_id = $2,
                       is_primary = $3,
                       duplicate_confidence = $4,
                       updated_at = NOW()
                 WHERE id = $1
                "#,
            )
            .bind(member.assignment_id)
            .bind(group_id)
            .bind(member.is_primary)
            .bind(member.confidence)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.load_group(group_id)
            .await?
            .ok_or_else(|| anyhow!("duplicate group {group_id} vanished after save"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;
    use tutorfeed_core::{FailureKind, JobFailure};

    static SEQ: AtomicU64 = AtomicU64::new(0);

    /// Channel and pipeline version unique to one test run, so tests share a database safely.
    fn unique(prefix: &str) -> String {
        format!(
            "{prefix}-{}-{}",
            Utc::now().timestamp_micros(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Store on `DATABASE_URL`, or `None` when no database is configured.
    async fn test_store(max_attempts: i32) -> Option<PgStore> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set, skipping postgres test");
            return None;
        };
        let mut settings = QueueSettings::new(unique("v"));
        settings.max_attempts = max_attempts;
        settings.retry_backoff.base_delay = StdDuration::ZERO;
        let store = PgStore::connect(&url, &PgStoreOptions::default(), settings)
            .await
            .unwrap();
        store.migrate().await.unwrap();
        Some(store)
    }

    fn record(channel: &str, message_id: i64) -> CanonicalAssignment {
        let at = Utc::now() - Duration::hours(1);
        CanonicalAssignment {
            id: 0,
            channel: channel.into(),
            message_id,
            status: AssignmentStatus::Open,
            kind: AssignmentKind::Academic,
            assignment_code: Some("T1234".into()),
            subjects: vec!["Maths".into()],
            level: Some(Level::Primary),
            specific_grade: Some("P5".into()),
            stream: None,
            academic_requests: Vec::new(),
            rate: RateRange::new(Some(30.0), Some(40.0)),
            tutor_types: Vec::new(),
            time_availability: Vec::new(),
            learning_mode: None,
            location: Location::default(),
            summary: Some("P5 Maths at Bishan".into()),
            remarks: None,
            schedule_text: None,
            raw_text: "P5 Maths at Bishan, $30-40/hr".into(),
            duplicate_group_id: None,
            is_primary: false,
            duplicate_confidence: None,
            quality_flags: Vec::new(),
            provenance: BTreeMap::new(),
            display_observed_at: at,
            pipeline_version: "v1".into(),
            published_at: at,
            source_edited_at: None,
            last_seen_at: at,
            last_bumped_at: None,
            bump_count: 0,
            created_at: at,
            updated_at: at,
        }
    }

    async fn insert(store: &PgStore, record: CanonicalAssignment) -> CanonicalAssignment {
        store
            .merge_upsert(&record.key(), &|_| MergeDecision::Write(record.clone()))
            .await
            .unwrap()
            .record()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn concurrent_claims_never_overlap() {
        let Some(store) = test_store(3).await else { return };
        let channel = unique("claims");
        for id in 0..20 {
            store.enqueue(&MessageKey::new(channel.clone(), id), false).await.unwrap();
        }
        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.claim_batch("a", 15).await.unwrap() })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.claim_batch("b", 15).await.unwrap() })
        };
        let a = a.await.unwrap();
        let b = b.await.unwrap();
        assert_eq!(a.len() + b.len(), 20);
        let ids_a: HashSet<_> = a.iter().map(|j| j.id).collect();
        assert!(b.iter().all(|j| !ids_a.contains(&j.id)));
        assert!(a.iter().chain(&b).all(|j| j.status == JobStatus::Processing));
    }

    #[tokio::test]
    async fn forced_enqueue_discards_in_flight_completion() {
        let Some(store) = test_store(3).await else { return };
        let key = MessageKey::new(unique("force"), 1);
        store.enqueue(&key, false).await.unwrap();
        let claimed = store.claim_batch("w1", 1).await.unwrap().remove(0);

        assert!(matches!(store.enqueue(&key, false).await.unwrap(), EnqueueResult::AlreadyQueued(_)));
        assert!(matches!(store.enqueue(&key, true).await.unwrap(), EnqueueResult::Requeued(_)));

        let outcome = JobOutcome::Ok { meta: serde_json::json!({}) };
        assert_eq!(store.complete(&claimed, &outcome).await.unwrap(), CompleteResult::Stale);
        let job = store.get_job(&key).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.generation, claimed.generation + 1);

        let reclaimed = store.claim_batch("w2", 1).await.unwrap().remove(0);
        assert_eq!(
            store.complete(&reclaimed, &outcome).await.unwrap(),
            CompleteResult::Applied(JobStatus::Ok)
        );
    }

    #[tokio::test]
    async fn retryable_failure_returns_to_pending_until_exhausted() {
        let Some(store) = test_store(2).await else { return };
        let key = MessageKey::new(unique("retry"), 1);
        store.enqueue(&key, false).await.unwrap();
        let failure = JobOutcome::failed(JobFailure::new(FailureKind::Timeout, "timeout", "slow"));

        let job = store.claim_batch("w", 1).await.unwrap().remove(0);
        assert_eq!(
            store.complete(&job, &failure).await.unwrap(),
            CompleteResult::Applied(JobStatus::Pending)
        );
        let job = store.claim_batch("w", 1).await.unwrap().remove(0);
        assert_eq!(job.attempt, 1);
        assert_eq!(
            store.complete(&job, &failure).await.unwrap(),
            CompleteResult::Applied(JobStatus::Failed)
        );
        assert!(store.claim_batch("w", 1).await.unwrap().is_empty());
        assert_eq!(store.failed_jobs(10).await.unwrap()[0].error_code.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn requeue_stale_exhausts_abandoned_claims() {
        let Some(store) = test_store(1).await else { return };
        let key = MessageKey::new(unique("stale"), 1);
        store.enqueue(&key, false).await.unwrap();
        let claimed = store.claim_batch("w1", 1).await.unwrap().remove(0);
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        assert_eq!(store.requeue_stale(Duration::milliseconds(10)).await.unwrap(), 1);
        let job = store.get_job(&key).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code.as_deref(), Some("stale_exhausted"));

        let outcome = JobOutcome::Ok { meta: serde_json::json!({}) };
        assert_eq!(store.complete(&claimed, &outcome).await.unwrap(), CompleteResult::Stale);
    }

    #[tokio::test]
    async fn merge_upsert_keeps_one_row_per_message() {
        let Some(store) = test_store(3).await else { return };
        let channel = unique("merge");
        let created = insert(&store, record(&channel, 7)).await;
        assert!(created.id > 0);

        let again = store
            .merge_upsert(&created.key(), &|existing| {
                let mut next = existing.unwrap_or_else(|| record(&channel, 7));
                next.summary = Some("P5 Maths at Bishan, weekends".into());
                MergeDecision::Write(next)
            })
            .await
            .unwrap();
        assert!(matches!(again, PersistOutcome::Updated(_)));
        assert_eq!(again.record().unwrap().id, created.id);

        let kept = store
            .merge_upsert(&created.key(), &|_| MergeDecision::Keep)
            .await
            .unwrap();
        assert!(matches!(kept, PersistOutcome::Kept(Some(_))));
        let stored = store.get_assignment(&created.key()).await.unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("P5 Maths at Bishan, weekends"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bump_during_merge_is_not_lost() {
        let Some(store) = test_store(3).await else { return };
        let created = insert(&store, record(&unique("bump"), 1)).await;
        let key = created.key();

        let read = Arc::new(Notify::new());
        let merging = {
            let store = store.clone();
            let read = read.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let merge = |existing: Option<CanonicalAssignment>| {
                    read.notify_one();
                    std::thread::sleep(StdDuration::from_millis(300));
                    let mut next = existing.unwrap_or_else(|| record(&key.channel, key.message_id));
                    next.remarks = Some("female tutor preferred".into());
                    MergeDecision::Write(next)
                };
                store.merge_upsert(&key, &merge).await.unwrap()
            })
        };

        read.notified().await;
        let bumped = store
            .bump(&key, Utc::now(), Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(bumped, BumpOutcome::Bumped { bump_count: 1 });
        merging.await.unwrap();

        let stored = store.get_assignment(&key).await.unwrap().unwrap();
        assert_eq!(stored.bump_count, 1);
        assert!(stored.last_bumped_at.is_some());
        assert_eq!(stored.remarks.as_deref(), Some("female tutor preferred"));
    }

    #[tokio::test]
    async fn save_group_absorbs_other_groups() {
        let Some(store) = test_store(3).await else { return };
        let channel = unique("dup");
        let a = insert(&store, record(&channel, 1)).await.id;
        let b = insert(&store, record(&channel, 2)).await.id;
        let c = insert(&store, record(&channel, 3)).await.id;
        let member = |id: i64, primary: bool| DuplicateMember {
            assignment_id: id,
            confidence: if primary { None } else { Some(0.9) },
            is_primary: primary,
        };

        let first = store
            .save_group(&GroupPlan {
                group_id: None,
                absorbed_group_ids: Vec::new(),
                primary_assignment_id: a,
                members: vec![member(a, true), member(b, false)],
            })
            .await
            .unwrap();
        let second = store
            .save_group(&GroupPlan {
                group_id: None,
                absorbed_group_ids: Vec::new(),
                primary_assignment_id: c,
                members: vec![member(c, true)],
            })
            .await
            .unwrap();

        let merged = store
            .save_group(&GroupPlan {
                group_id: Some(first.id),
                absorbed_group_ids: vec![second.id],
                primary_assignment_id: a,
                members: vec![member(a, true), member(b, false), member(c, false)],
            })
            .await
            .unwrap();
        assert_eq!(merged.id, first.id);
        assert_eq!(merged.members.len(), 3);
        assert!(store.load_group(second.id).await.unwrap().is_none());

        let moved = store.get_assignment_by_id(c).await.unwrap().unwrap();
        assert_eq!(moved.duplicate_group_id, Some(first.id));
        assert!(!moved.is_primary);
        assert_eq!(
            store.group_for_assignment(c).await.unwrap().map(|g| g.id),
            Some(first.id)
        );
    }
}
