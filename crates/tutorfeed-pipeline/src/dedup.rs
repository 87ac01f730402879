use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use strsim::sorensen_dice;
use tokio::sync::Mutex;
use tracing::{debug, info};
use tutorfeed_core::{CanonicalAssignment, DuplicateMember, RateRange};
use tutorfeed_storage::{AssignmentStore, DuplicateStore, GroupPlan};

use crate::config::DEFAULT_CHANNEL_QUALITY;

const CODE_WEIGHT: f64 = 0.35;
const RATE_WEIGHT: f64 = 0.20;
const TEXT_WEIGHT: f64 = 0.30;
const TIME_WEIGHT: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupConfig {
    /// At or above this score two records join one group.
    pub high_confidence: f64,
    /// Scores between this and `high_confidence` are logged for review only.
    pub review_threshold: f64,
    pub lookback: Duration,
    pub candidate_limit: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            high_confidence: 0.82,
            review_threshold: 0.70,
            lookback: Duration::hours(72),
            candidate_limit: 200,
        }
    }
}

pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Alphabetic and numeric runs, so `TA-1234` and `ta1234` tokenize alike.
fn code_tokens(code: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let mut current = String::new();
    let mut digits = false;
    for c in code.to_ascii_lowercase().chars() {
        if !c.is_ascii_alphanumeric() {
            if !current.is_empty() {
                tokens.insert(std::mem::take(&mut current));
            }
            continue;
        }
        if !current.is_empty() && c.is_ascii_digit() != digits {
            tokens.insert(std::mem::take(&mut current));
        }
        digits = c.is_ascii_digit();
        current.push(c);
    }
    if !current.is_empty() {
        tokens.insert(current);
    }
    tokens
}

fn digit_run(code: &str) -> String {
    code.chars().filter(char::is_ascii_digit).collect()
}

fn code_similarity(a: Option<&str>, b: Option<&str>) -> Option<f64> {
    let (a, b) = (a?, b?);
    let (na, nb) = (normalize_key_fragment(a).replace(' ', ""), normalize_key_fragment(b).replace(' ', ""));
    if na.is_empty() || nb.is_empty() {
        return None;
    }
    if na == nb {
        return Some(1.0);
    }
    let (da, db) = (digit_run(a), digit_run(b));
    if da.len() >= 3 && da == db {
        return Some(0.9);
    }
    let (ta, tb) = (code_tokens(a), code_tokens(b));
    let union = ta.union(&tb).count();
    if union == 0 {
        return None;
    }
    Some(ta.intersection(&tb).count() as f64 / union as f64)
}

/// 1.0 for equal midpoints, falling to 0.0 at a 50% relative difference.
fn rate_similarity(a: &RateRange, b: &RateRange) -> Option<f64> {
    let (ma, mb) = (a.midpoint()?, b.midpoint()?);
    let scale = ma.abs().max(mb.abs());
    if scale == 0.0 {
        return Some(1.0);
    }
    let relative = (ma - mb).abs() / scale;
    Some((1.0 - relative / 0.5).clamp(0.0, 1.0))
}

fn text_similarity(a: &str, b: &str) -> Option<f64> {
    let (na, nb) = (normalize_key_fragment(a), normalize_key_fragment(b));
    if na.is_empty() || nb.is_empty() {
        return None;
    }
    Some(sorensen_dice(&na, &nb))
}

fn time_similarity(a: DateTime<Utc>, b: DateTime<Utc>, lookback: Duration) -> Option<f64> {
    let window = lookback.num_seconds();
    if window <= 0 {
        return None;
    }
    let gap = (a - b).num_seconds().abs();
    Some((1.0 - gap as f64 / window as f64).clamp(0.0, 1.0))
}

/// Per-component scores and the weighted total. Missing components are left out and the
/// remaining weights renormalized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Similarity {
    pub code: Option<f64>,
    pub rate: Option<f64>,
    pub text: Option<f64>,
    pub time: Option<f64>,
    pub score: f64,
}

impl Similarity {
    pub fn between(a: &CanonicalAssignment, b: &CanonicalAssignment, lookback: Duration) -> Self {
        let code = code_similarity(a.assignment_code.as_deref(), b.assignment_code.as_deref());
        let rate = rate_similarity(&a.rate, &b.rate);
        let text = text_similarity(&a.raw_text, &b.raw_text);
        let time = time_similarity(a.published_at, b.published_at, lookback);

        let parts = [
            (code, CODE_WEIGHT),
            (rate, RATE_WEIGHT),
            (text, TEXT_WEIGHT),
            (time, TIME_WEIGHT),
        ];
        let (weighted, total) = parts
            .iter()
            .filter_map(|(value, weight)| value.map(|v| (v * weight, *weight)))
            .fold((0.0, 0.0), |(sum, weights), (v, w)| (sum + v, weights + w));
        let score = if total > 0.0 { weighted / total } else { 0.0 };

        Self {
            code,
            rate,
            text,
            time,
            score,
        }
    }
}

/// Earliest posting, then the higher channel quality, then the lower id.
pub(crate) fn primary_order(
    a: &CanonicalAssignment,
    b: &CanonicalAssignment,
    quality: &dyn Fn(&str) -> f64,
) -> Ordering {
    a.published_at
        .cmp(&b.published_at)
        .then_with(|| {
            quality(&b.channel)
                .partial_cmp(&quality(&a.channel))
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    /// The record is gone or no longer open.
    Skipped,
    NoMatch { best: Option<f64> },
    Grouped {
        group_id: i64,
        primary_assignment_id: i64,
        members: usize,
    },
}

/// Groups cross-channel reposts of the same assignment. Runs off the job's critical path.
pub struct DuplicateDetector {
    assignments: Arc<dyn AssignmentStore>,
    duplicates: Arc<dyn DuplicateStore>,
    config: DedupConfig,
    channel_quality: BTreeMap<String, f64>,
    // Serializes group planning in this process; persistence never takes it.
    planning: Mutex<()>,
}

impl DuplicateDetector {
    pub fn new(
        assignments: Arc<dyn AssignmentStore>,
        duplicates: Arc<dyn DuplicateStore>,
        config: DedupConfig,
        channel_quality: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            assignments,
            duplicates,
            config,
            channel_quality,
            planning: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    fn quality(&self, channel: &str) -> f64 {
        self.channel_quality
            .get(channel)
            .copied()
            .unwrap_or(DEFAULT_CHANNEL_QUALITY)
    }

    fn is_candidate(&self, record: &CanonicalAssignment, other: &CanonicalAssignment) -> bool {
        if other.id == record.id || other.key() == record.key() || !other.is_open() {
            return false;
        }
        if (other.published_at - record.published_at).abs() > self.config.lookback {
            return false;
        }
        let shares_subject = other.subjects.iter().any(|s| record.subjects.contains(s));
        let shares_level = matches!((record.level, other.level), (Some(a), Some(b)) if a == b);
        if !shares_subject && !shares_level {
            return false;
        }
        match (&record.location.region, &other.location.region) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    pub async fn candidates(&self, record: &CanonicalAssignment) -> Result<Vec<CanonicalAssignment>> {
        let since = record.published_at - self.config.lookback;
        let recent = self
            .assignments
            .open_published_since(since, self.config.candidate_limit)
            .await
            .context("loading duplicate candidates")?;
        Ok(recent
            .into_iter()
            .filter(|other| self.is_candidate(record, other))
            .collect())
    }

    pub async fn detect(&self, assignment_id: i64) -> Result<DedupOutcome> {
        let _planning = self.planning.lock().await;

        let Some(record) = self
            .assignments
            .get_assignment_by_id(assignment_id)
            .await
            .with_context(|| format!("loading assignment {assignment_id}"))?
        else {
            return Ok(DedupOutcome::Skipped);
        };
        if !record.is_open() {
            return Ok(DedupOutcome::Skipped);
        }

        let mut best: Option<f64> = None;
        let mut matched: Vec<CanonicalAssignment> = Vec::new();
        for other in self.candidates(&record).await? {
            let similarity = Similarity::between(&record, &other, self.config.lookback);
            best = Some(best.map_or(similarity.score, |b| b.max(similarity.score)));
            if similarity.score >= self.config.high_confidence {
                matched.push(other);
            } else if similarity.score >= self.config.review_threshold {
                info!(
                    assignment_id = record.id,
                    other_id = other.id,
                    score = similarity.score,
                    "possible duplicate below grouping threshold"
                );
            }
        }
        if matched.is_empty() {
            debug!(assignment_id = record.id, best, "no duplicate match");
            return Ok(DedupOutcome::NoMatch { best });
        }

        // Every group touched by this record or its matches folds into one.
        let mut group_ids = BTreeSet::new();
        let mut member_ids: BTreeSet<i64> = BTreeSet::new();
        member_ids.insert(record.id);
        for id in std::iter::once(record.id).chain(matched.iter().map(|m| m.id)) {
            member_ids.insert(id);
            if let Some(group) = self
                .duplicates
                .group_for_assignment(id)
                .await
                .with_context(|| format!("loading duplicate group of assignment {id}"))?
            {
                group_ids.insert(group.id);
                member_ids.extend(group.member_ids());
            }
        }

        let mut members: Vec<CanonicalAssignment> = Vec::with_capacity(member_ids.len());
        for id in member_ids {
            if id == record.id {
                members.push(record.clone());
                continue;
            }
            if let Some(member) = self
                .assignments
                .get_assignment_by_id(id)
                .await
                .with_context(|| format!("loading duplicate member {id}"))?
            {
                members.push(member);
            }
        }

        let quality = |channel: &str| self.quality(channel);
        members.sort_by(|a, b| primary_order(a, b, &quality));
        let Some(primary) = members.first().cloned() else {
            return Ok(DedupOutcome::NoMatch { best });
        };

        let plan_members = members
            .iter()
            .map(|member| DuplicateMember {
                assignment_id: member.id,
                confidence: (member.id != primary.id).then(|| {
                    Similarity::between(member, &primary, self.config.lookback).score
                }),
                is_primary: member.id == primary.id,
            })
            .collect::<Vec<_>>();

        let mut group_ids = group_ids.into_iter();
        let plan = GroupPlan {
            group_id: group_ids.next(),
            absorbed_group_ids: group_ids.collect(),
            primary_assignment_id: primary.id,
            members: plan_members,
        };
        let group = self
            .duplicates
            .save_group(&plan)
            .await
            .context("saving duplicate group")?;

        info!(
            assignment_id = record.id,
            group_id = group.id,
            primary_assignment_id = group.primary_assignment_id,
            members = group.members.len(),
            "duplicate group updated"
        );
        Ok(DedupOutcome::Grouped {
            group_id: group.id,
            primary_assignment_id: group.primary_assignment_id,
            members: group.members.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tutorfeed_core::{AssignmentKind, AssignmentStatus, Level, Location, MessageKey};
    use tutorfeed_storage::{MemoryStore, MergeDecision, QueueSettings};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    fn record(channel: &str, code: Option<&str>, rate: (f64, f64), text: &str, published_at: DateTime<Utc>) -> CanonicalAssignment {
        CanonicalAssignment {
            id: 0,
            channel: channel.into(),
            message_id: 1,
            status: AssignmentStatus::Open,
            kind: AssignmentKind::Academic,
            assignment_code: code.map(str::to_string),
            subjects: vec!["Maths".into()],
            level: Some(Level::Primary),
            specific_grade: Some("P5".into()),
            stream: None,
            academic_requests: Vec::new(),
            rate: RateRange::new(Some(rate.0), Some(rate.1)),
            tutor_types: Vec::new(),
            time_availability: Vec::new(),
            learning_mode: None,
            location: Location {
                region: Some("Central".into()),
                ..Location::default()
            },
            summary: None,
            remarks: None,
            schedule_text: None,
            raw_text: text.into(),
            duplicate_group_id: None,
            is_primary: false,
            duplicate_confidence: None,
            quality_flags: Vec::new(),
            provenance: BTreeMap::new(),
            display_observed_at: published_at,
            pipeline_version: "v1".into(),
            published_at,
            source_edited_at: None,
            last_seen_at: published_at,
            last_bumped_at: None,
            bump_count: 0,
            created_at: published_at,
            updated_at: published_at,
        }
    }

    async fn insert(store: &MemoryStore, record: CanonicalAssignment) -> i64 {
        let key = MessageKey::new(record.channel.clone(), record.message_id);
        store
            .merge_upsert(&key, &|_| MergeDecision::Write(record.clone()))
            .await
            .unwrap()
            .record()
            .unwrap()
            .id
    }

    const TEXT_A: &str = "Job Code T1234: P5 Maths at Bishan, $30-40/hr, Tue/Thu evenings";
    const TEXT_B: &str = "[T1234] P5 Maths @ Bishan | $30-40 per hour | Tue & Thu evening";

    #[test]
    fn code_similarity_tiers() {
        assert_eq!(code_similarity(Some("T1234"), Some("t-1234")), Some(1.0));
        assert_eq!(code_similarity(Some("T1234"), Some("AB1234")), Some(0.9));
        assert_eq!(code_similarity(Some("T1234"), Some("T9876")), Some(1.0 / 3.0));
        assert_eq!(code_similarity(None, Some("T1")), None);
    }

    #[test]
    fn missing_components_renormalize() {
        let a = record("a", None, (30.0, 40.0), TEXT_A, t0());
        let b = record("b", None, (30.0, 40.0), TEXT_A, t0());
        let s = Similarity::between(&a, &b, Duration::hours(72));
        assert_eq!(s.code, None);
        assert!((s.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn near_identical_reposts_score_high_and_unrelated_low() {
        let lookback = Duration::hours(72);
        let a = record("a", Some("T1234"), (30.0, 40.0), TEXT_A, t0());
        let b = record("b", Some("T1234"), (30.0, 40.0), TEXT_B, t0() + Duration::hours(1));
        let c = record(
            "c",
            Some("Z5521"),
            (70.0, 90.0),
            "JC2 H2 Chemistry, Jurong West, weekends only",
            t0() + Duration::hours(60),
        );
        assert!(Similarity::between(&a, &b, lookback).score >= 0.82);
        assert!(Similarity::between(&a, &c, lookback).score < 0.5);
    }

    #[test]
    fn primary_tie_breaks() {
        let quality = |channel: &str| if channel == "premium" { 0.9 } else { 0.5 };
        let mut a = record("basic", None, (30.0, 40.0), TEXT_A, t0());
        a.id = 1;
        let mut b = record("premium", None, (30.0, 40.0), TEXT_A, t0());
        b.id = 2;
        assert_eq!(primary_order(&a, &b, &quality), Ordering::Greater);

        let mut earlier = record("basic", None, (30.0, 40.0), TEXT_A, t0() - Duration::minutes(1));
        earlier.id = 3;
        assert_eq!(primary_order(&earlier, &b, &quality), Ordering::Less);

        let mut c = record("basic", None, (30.0, 40.0), TEXT_A, t0());
        c.id = 4;
        assert_eq!(primary_order(&a, &c, &quality), Ordering::Less);
    }

    #[tokio::test]
    async fn reposts_join_one_group_with_earliest_primary() {
        let store = Arc::new(MemoryStore::new(QueueSettings::new("v1")));
        let detector = DuplicateDetector::new(store.clone(), store.clone(), DedupConfig::default(), BTreeMap::new());

        let first = insert(&store, record("agency_a", Some("T1234"), (30.0, 40.0), TEXT_A, t0())).await;
        let second = insert(
            &store,
            record("agency_b", Some("T1234"), (30.0, 40.0), TEXT_B, t0() + Duration::hours(2)),
        )
        .await;

        assert_eq!(detector.detect(first).await.unwrap(), DedupOutcome::Grouped {
            group_id: 1,
            primary_assignment_id: first,
            members: 2,
        });
        let stored_second = store.get_assignment_by_id(second).await.unwrap().unwrap();
        assert_eq!(stored_second.duplicate_group_id, Some(1));
        assert!(!stored_second.is_primary);
        assert!(stored_second.duplicate_confidence.unwrap() >= 0.82);

        // An even earlier repost found later takes over as primary of the same group.
        let earliest = insert(
            &store,
            record("agency_c", Some("T-1234"), (30.0, 40.0), TEXT_A, t0() - Duration::hours(1)),
        )
        .await;
        let outcome = detector.detect(earliest).await.unwrap();
        assert_eq!(outcome, DedupOutcome::Grouped {
            group_id: 1,
            primary_assignment_id: earliest,
            members: 3,
        });
        assert_eq!(store.all_groups().await.len(), 1);
    }

    #[tokio::test]
    async fn unrelated_or_other_region_records_are_not_grouped() {
        let store = Arc::new(MemoryStore::new(QueueSettings::new("v1")));
        let detector = DuplicateDetector::new(store.clone(), store.clone(), DedupConfig::default(), BTreeMap::new());

        let a = insert(&store, record("agency_a", Some("T1234"), (30.0, 40.0), TEXT_A, t0())).await;
        let mut elsewhere = record("agency_b", Some("T1234"), (30.0, 40.0), TEXT_B, t0());
        elsewhere.location.region = Some("West".into());
        insert(&store, elsewhere).await;
        let mut stale = record("agency_c", Some("T1234"), (30.0, 40.0), TEXT_A, t0() - Duration::hours(100));
        stale.location.region = None;
        insert(&store, stale).await;

        assert_eq!(detector.detect(a).await.unwrap(), DedupOutcome::NoMatch { best: None });
        assert!(store.all_groups().await.is_empty());
        assert_eq!(detector.detect(999).await.unwrap(), DedupOutcome::Skipped);
    }
}
