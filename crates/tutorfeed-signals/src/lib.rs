//! Rule-based signals parsed straight from message text, independent of the model.

mod academic;
mod availability;
mod location;
mod rates;
mod taxonomy;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use tutorfeed_core::{AcademicRequest, LearningMode, Level, RateRange, TimeWindow, TutorTypeRate};

pub use academic::AcademicSignals;
pub use location::region_for_postal;
pub use rates::RateSignals;
pub use taxonomy::{SubjectEntry, SubjectHit, Taxonomy};

pub const CRATE_NAME: &str = "tutorfeed-signals";

/// Messages longer than this are not parsed; real postings are a few KiB at most.
pub const MAX_TEXT_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid signal pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("text is {0} bytes, limit is {MAX_TEXT_BYTES}")]
    TextTooLong(usize),
    #[error("signal parsing panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Signals {
    /// False when parsing failed; every other field is then empty.
    pub ok: bool,
    pub error: Option<String>,
    pub subjects: Vec<String>,
    pub levels: Vec<Level>,
    pub specific_grades: Vec<String>,
    pub streams: Vec<String>,
    pub academic_requests: Vec<AcademicRequest>,
    pub ambiguous: bool,
    pub tutor_types: Vec<TutorTypeRate>,
    pub rate: RateRange,
    pub time_availability: Vec<TimeWindow>,
    pub assignment_code: Option<String>,
    pub postal_code: Option<String>,
    pub region: Option<String>,
    pub learning_mode: Option<LearningMode>,
    pub closed_marker: bool,
}

impl Signals {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Level of the first request, falling back to the first level mentioned.
    pub fn level(&self) -> Option<Level> {
        self.academic_requests
            .iter()
            .find_map(|r| r.level)
            .or_else(|| self.levels.first().copied())
    }

    pub fn specific_grade(&self) -> Option<&str> {
        self.academic_requests
            .iter()
            .find_map(|r| r.specific_grade.as_deref())
            .or_else(|| self.specific_grades.first().map(String::as_str))
    }

    pub fn stream(&self) -> Option<&str> {
        self.academic_requests
            .iter()
            .find_map(|r| r.stream.as_deref())
            .or_else(|| self.streams.first().map(String::as_str))
    }

    /// Anything that identifies academic content: a subject, level or grade.
    pub fn has_academic_content(&self) -> bool {
        !self.subjects.is_empty() || !self.levels.is_empty() || !self.specific_grades.is_empty()
    }
}

#[derive(Debug)]
pub struct SignalBuilder {
    taxonomy: Arc<Taxonomy>,
    academic: academic::AcademicParser,
    rates: rates::RateParser,
    availability: availability::AvailabilityParser,
    location: location::LocationParser,
    code: Regex,
    hash_code: Regex,
    closed_upper: Regex,
    closed_phrase: Regex,
}

impl SignalBuilder {
    pub fn new(taxonomy: Arc<Taxonomy>) -> Result<Self, SignalError> {
        Ok(Self {
            taxonomy,
            academic: academic::AcademicParser::new()?,
            rates: rates::RateParser::new()?,
            availability: availability::AvailabilityParser::new()?,
            location: location::LocationParser::new()?,
            code: Regex::new(
                r"(?im)(?:\b(?:job|assignment|assgn|tuition)\s*(?:code|id|no\.?|number|#)|^\s*(?:code|ref(?:erence)?(?:\s*no\.?)?))\s*[:#.\-]?\s*#?\s*([a-z]{0,4}\s?\d{2,8}[a-z]?)\b",
            )?,
            hash_code: Regex::new(r"(?:^|\s)#([A-Za-z]{0,4}\d{3,8})\b")?,
            closed_upper: Regex::new(r"\b(?:TAKEN|CLOSED|FILLED)\b")?,
            closed_phrase: Regex::new(
                r"(?i)\b(?:assignment|job|post|slot)\s+(?:has\s+been\s+|is\s+)?(?:taken|closed|filled)\b",
            )?,
        })
    }

    pub fn with_embedded_taxonomy() -> anyhow::Result<Self> {
        Ok(Self::new(Arc::new(Taxonomy::embedded()?))?)
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Parse `text`. Never fails outward: errors and panics come back as `ok == false`.
    pub fn build(&self, text: &str) -> Signals {
        match catch_unwind(AssertUnwindSafe(|| self.try_build(text))) {
            Ok(Ok(signals)) => signals,
            Ok(Err(err)) => {
                warn!(error = %err, "signal parsing failed");
                Signals::failed(err.to_string())
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let err = SignalError::Panicked(message);
                warn!(error = %err, "signal parsing panicked");
                Signals::failed(err.to_string())
            }
        }
    }

    fn try_build(&self, text: &str) -> Result<Signals, SignalError> {
        if text.len() > MAX_TEXT_BYTES {
            return Err(SignalError::TextTooLong(text.len()));
        }
        let lowered = text.to_ascii_lowercase();

        let academic = self.academic.parse(text, &lowered, &self.taxonomy);
        let rates = self.rates.parse(&lowered);
        let postal_code = self.location.postal_code(text);
        let region = postal_code
            .as_deref()
            .and_then(region_for_postal)
            .map(str::to_string);

        Ok(Signals {
            ok: true,
            error: None,
            subjects: academic.subjects,
            levels: academic.levels,
            specific_grades: academic.grades,
            streams: academic.streams,
            academic_requests: academic.requests,
            ambiguous: academic.ambiguous,
            tutor_types: rates.tutor_types,
            rate: rates.rate,
            time_availability: self.availability.parse(text),
            assignment_code: self.assignment_code(text),
            postal_code,
            region,
            learning_mode: self.location.learning_mode(&lowered),
            closed_marker: self.closed_upper.is_match(text) || self.closed_phrase.is_match(text),
        })
    }

    fn assignment_code(&self, text: &str) -> Option<String> {
        let raw = self
            .code
            .captures(text)
            .or_else(|| self.hash_code.captures(text))
            .and_then(|caps| caps.get(1))?;
        Some(
            raw.as_str()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_ascii_uppercase(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> SignalBuilder {
        SignalBuilder::with_embedded_taxonomy().unwrap()
    }

    const POSTING: &str = "Job Code: T1234\n\
        P4 English and P6 Math\n\
        Location: 520123 (Tampines)\n\
        Rate: PT $30-35/hr, FT $40-45/hr\n\
        Availability: Sat 2pm-4pm\n\
        Home tuition";

    #[test]
    fn full_posting() {
        let signals = builder().build(POSTING);
        assert!(signals.ok);
        assert_eq!(signals.assignment_code.as_deref(), Some("T1234"));
        assert_eq!(signals.academic_requests.len(), 2);
        assert_eq!(signals.academic_requests[1].subjects, vec!["Maths"]);
        assert_eq!(signals.level(), Some(Level::Primary));
        assert_eq!(signals.specific_grade(), Some("P4"));
        assert_eq!(signals.postal_code.as_deref(), Some("520123"));
        assert_eq!(signals.region.as_deref(), Some("East"));
        assert_eq!(signals.tutor_types.len(), 2);
        assert_eq!(signals.rate, RateRange::new(Some(30.0), Some(45.0)));
        assert_eq!(signals.time_availability.len(), 1);
        assert_eq!(signals.learning_mode, Some(LearningMode::FaceToFace));
        assert!(!signals.closed_marker);
    }

    #[test]
    fn article_a_reads_as_maths_for_primary_posts() {
        let signals = builder().build("Looking for a maths tutor for my P5 son, Bishan, $40/hr");
        assert_eq!(signals.subjects, vec!["Maths"]);
        assert_eq!(signals.level(), Some(Level::Primary));
    }

    #[test]
    fn closed_markers() {
        let b = builder();
        assert!(b.build("[TAKEN] P5 Maths").closed_marker);
        assert!(b.build("This assignment has been taken, thanks").closed_marker);
        assert!(!b.build("Student is taking PSLE this year").closed_marker);
    }

    #[test]
    fn hash_style_codes() {
        assert_eq!(builder().build("#AB5521 Sec 2 Maths").assignment_code.as_deref(), Some("AB5521"));
        assert_eq!(builder().build("Postal code: 520123").assignment_code, None);
    }

    #[test]
    fn oversized_text_reports_failure_instead_of_erroring() {
        let signals = builder().build(&"x".repeat(MAX_TEXT_BYTES + 1));
        assert!(!signals.ok);
        assert!(signals.error.unwrap().contains("limit"));
        assert!(signals.subjects.is_empty());
    }
}
