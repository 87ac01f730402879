use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tutorfeed_core::BackoffPolicy;
use tutorfeed_extract::{BreakerConfig, ExtractorSettings, LlmClientConfig};
use tutorfeed_storage::QueueSettings;

use crate::dedup::DedupConfig;

const ENV_PREFIX: &str = "TUTORFEED_";

/// Score used for channels missing from `channel_quality`.
pub const DEFAULT_CHANNEL_QUALITY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Persist anyway, flagging hard failures on the record.
    Report,
    /// Fail the job on the first hard failure.
    Enforce,
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValidationMode::Report => "report",
            ValidationMode::Enforce => "enforce",
        })
    }
}

impl FromStr for ValidationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" => Ok(ValidationMode::Report),
            "enforce" => Ok(ValidationMode::Enforce),
            other => bail!("unknown validation mode {other:?}, expected report or enforce"),
        }
    }
}

/// Everything the pipeline needs, loaded once at startup and handed to components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline_version: String,
    pub worker_id: String,
    pub max_attempts: i32,
    pub batch_size: i64,
    pub poll_interval_ms: u64,
    pub stale_after_secs: u64,
    pub retry_base_secs: u64,
    pub retry_max_secs: u64,
    pub breaker_threshold: u32,
    pub breaker_window_secs: u64,
    pub breaker_cooldown_secs: u64,
    pub extract_timeout_secs: u64,
    pub extract_retry_budget: usize,
    pub min_bump_interval_secs: i64,
    pub dedup_high_confidence: f64,
    pub dedup_review_threshold: f64,
    pub dedup_lookback_hours: i64,
    pub dedup_candidate_limit: i64,
    pub validation_mode: ValidationMode,
    pub assignment_expiry_days: i64,
    pub sweep_cron: String,
    pub database_url: Option<String>,
    pub llm_base_url: String,
    pub llm_model: String,
    #[serde(skip_serializing)]
    pub llm_api_key: Option<String>,
    pub taxonomy_path: Option<PathBuf>,
    pub channel_quality: BTreeMap<String, f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_version: "2026-10-v1".to_string(),
            worker_id: format!("worker-{}", std::process::id()),
            max_attempts: 3,
            batch_size: 10,
            poll_interval_ms: 2_000,
            stale_after_secs: 600,
            retry_base_secs: 30,
            retry_max_secs: 1_800,
            breaker_threshold: 5,
            breaker_window_secs: 60,
            breaker_cooldown_secs: 120,
            extract_timeout_secs: 45,
            extract_retry_budget: 1,
            min_bump_interval_secs: 6 * 60 * 60,
            dedup_high_confidence: 0.82,
            dedup_review_threshold: 0.70,
            dedup_lookback_hours: 72,
            dedup_candidate_limit: 200,
            validation_mode: ValidationMode::Report,
            assignment_expiry_days: 14,
            sweep_cron: "0 */5 * * * *".to_string(),
            database_url: None,
            llm_base_url: LlmClientConfig::default().base_url,
            llm_model: LlmClientConfig::default().model,
            llm_api_key: None,
            taxonomy_path: None,
            channel_quality: BTreeMap::new(),
        }
    }
}

/// Parse `channel=score,channel=score`. Scores must be within 0..=1.
pub fn parse_channel_quality(raw: &str) -> Result<BTreeMap<String, f64>> {
    let mut out = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (channel, score) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("channel quality entry {pair:?} is not channel=score"))?;
        let score: f64 = score
            .trim()
            .parse()
            .with_context(|| format!("parsing quality score for channel {channel:?}"))?;
        if !(0.0..=1.0).contains(&score) {
            bail!("quality score {score} for channel {channel:?} is outside 0..=1");
        }
        out.insert(channel.trim().to_string(), score);
    }
    Ok(out)
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| anyhow!("invalid value {raw:?} for {name}: {err}"))
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(Self::default(), |key| std::env::var(key).ok())
    }

    /// Defaults, overlaid by the YAML file if given, overlaid by the environment.
    pub fn load(yaml_path: Option<&Path>) -> Result<Self> {
        let base = match yaml_path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        Self::from_lookup(base, |key| std::env::var(key).ok())
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Apply environment overrides from `lookup` on top of `base`.
    pub fn from_lookup(base: Self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = base;
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty());

        macro_rules! override_parsed {
            ($field:ident, $name:literal) => {
                if let Some(raw) = var($name) {
                    config.$field = parse_var(concat!("TUTORFEED_", $name), &raw)?;
                }
            };
        }

        if let Some(v) = var("PIPELINE_VERSION") {
            config.pipeline_version = v.trim().to_string();
        }
        if let Some(v) = var("WORKER_ID") {
            config.worker_id = v.trim().to_string();
        }
        override_parsed!(max_attempts, "MAX_ATTEMPTS");
        override_parsed!(batch_size, "BATCH_SIZE");
        override_parsed!(poll_interval_ms, "POLL_INTERVAL_MS");
        override_parsed!(stale_after_secs, "STALE_AFTER_SECS");
        override_parsed!(retry_base_secs, "RETRY_BASE_SECS");
        override_parsed!(retry_max_secs, "RETRY_MAX_SECS");
        override_parsed!(breaker_threshold, "BREAKER_THRESHOLD");
        override_parsed!(breaker_window_secs, "BREAKER_WINDOW_SECS");
        override_parsed!(breaker_cooldown_secs, "BREAKER_COOLDOWN_SECS");
        override_parsed!(extract_timeout_secs, "EXTRACT_TIMEOUT_SECS");
        override_parsed!(extract_retry_budget, "EXTRACT_RETRY_BUDGET");
        override_parsed!(min_bump_interval_secs, "MIN_BUMP_INTERVAL_SECS");
        override_parsed!(dedup_high_confidence, "DEDUP_HIGH_CONFIDENCE");
        override_parsed!(dedup_review_threshold, "DEDUP_REVIEW_THRESHOLD");
        override_parsed!(dedup_lookback_hours, "DEDUP_LOOKBACK_HOURS");
        override_parsed!(dedup_candidate_limit, "DEDUP_CANDIDATE_LIMIT");
        override_parsed!(validation_mode, "VALIDATION_MODE");
        override_parsed!(assignment_expiry_days, "ASSIGNMENT_EXPIRY_DAYS");
        if let Some(v) = var("SWEEP_CRON") {
            config.sweep_cron = v.trim().to_string();
        }
        if let Some(v) = var("LLM_BASE_URL") {
            config.llm_base_url = v.trim().to_string();
        }
        if let Some(v) = var("LLM_MODEL") {
            config.llm_model = v.trim().to_string();
        }
        if let Some(v) = var("TAXONOMY_PATH") {
            config.taxonomy_path = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = var("CHANNEL_QUALITY") {
            config.channel_quality = parse_channel_quality(&v).context("parsing TUTORFEED_CHANNEL_QUALITY")?;
        }

        if let Some(v) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            config.database_url = Some(v);
        }
        if let Some(v) = lookup("OPENAI_API_KEY").filter(|v| !v.trim().is_empty()) {
            config.llm_api_key = Some(v);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline_version.trim().is_empty() {
            bail!("pipeline version must not be empty");
        }
        if self.max_attempts < 1 {
            bail!("max_attempts must be at least 1, got {}", self.max_attempts);
        }
        if self.batch_size < 1 {
            bail!("batch_size must be at least 1, got {}", self.batch_size);
        }
        if self.breaker_threshold < 1 {
            bail!("breaker_threshold must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.dedup_high_confidence)
            || !(0.0..=1.0).contains(&self.dedup_review_threshold)
        {
            bail!("dedup thresholds must be within 0..=1");
        }
        if self.dedup_review_threshold > self.dedup_high_confidence {
            bail!(
                "dedup review threshold {} exceeds high-confidence threshold {}",
                self.dedup_review_threshold,
                self.dedup_high_confidence
            );
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    pub fn min_bump_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_bump_interval_secs)
    }

    pub fn assignment_expiry(&self) -> chrono::Duration {
        chrono::Duration::days(self.assignment_expiry_days)
    }

    pub fn retry_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.max_attempts.max(1) as usize,
            Duration::from_secs(self.retry_base_secs),
            Duration::from_secs(self.retry_max_secs),
        )
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            pipeline_version: self.pipeline_version.clone(),
            max_attempts: self.max_attempts,
            stale_after: self.stale_after(),
            retry_backoff: self.retry_backoff(),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_threshold,
            window: Duration::from_secs(self.breaker_window_secs),
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
        }
    }

    pub fn extractor_settings(&self) -> ExtractorSettings {
        ExtractorSettings {
            timeout: Duration::from_secs(self.extract_timeout_secs),
            retry: BackoffPolicy::new(
                self.extract_retry_budget,
                Duration::from_secs(2),
                Duration::from_secs(15),
            ),
        }
    }

    pub fn llm_client_config(&self) -> LlmClientConfig {
        LlmClientConfig {
            base_url: self.llm_base_url.clone(),
            model: self.llm_model.clone(),
            api_key: self.llm_api_key.clone(),
            request_timeout: Duration::from_secs(self.extract_timeout_secs),
            ..LlmClientConfig::default()
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            high_confidence: self.dedup_high_confidence,
            review_threshold: self.dedup_review_threshold,
            lookback: chrono::Duration::hours(self.dedup_lookback_hours),
            candidate_limit: self.dedup_candidate_limit,
        }
    }

    pub fn channel_quality(&self, channel: &str) -> f64 {
        self.channel_quality
            .get(channel)
            .copied()
            .unwrap_or(DEFAULT_CHANNEL_QUALITY)
    }
}
