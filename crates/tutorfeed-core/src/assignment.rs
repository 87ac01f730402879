use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MessageKey, UnknownVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    PreSchool,
    Primary,
    Secondary,
    JuniorCollege,
    Ib,
    Igcse,
    Polytechnic,
    University,
    Adult,
}

impl Level {
    pub const ALL: [Level; 9] = [
        Level::PreSchool,
        Level::Primary,
        Level::Secondary,
        Level::JuniorCollege,
        Level::Ib,
        Level::Igcse,
        Level::Polytechnic,
        Level::University,
        Level::Adult,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::PreSchool => "pre_school",
            Level::Primary => "primary",
            Level::Secondary => "secondary",
            Level::JuniorCollege => "junior_college",
            Level::Ib => "ib",
            Level::Igcse => "igcse",
            Level::Polytechnic => "polytechnic",
            Level::University => "university",
            Level::Adult => "adult",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Level::PreSchool => "Pre-School",
            Level::Primary => "Primary",
            Level::Secondary => "Secondary",
            Level::JuniorCollege => "Junior College",
            Level::Ib => "IB",
            Level::Igcse => "IGCSE",
            Level::Polytechnic => "Polytechnic",
            Level::University => "University",
            Level::Adult => "Adult",
        }
    }

    /// Level implied by a grade such as `P4`, `Sec 3`, `JC1` or `K2`.
    ///
    /// The whole string must be a grade: a prefix plus a digit in that level's range.
    /// Anything else (`N2 Street`, `S3`, `K9`) implies nothing.
    pub fn for_grade(grade: &str) -> Option<Level> {
        let compact: String = grade
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        let digit_after = |prefixes: &[&str], range: std::ops::RangeInclusive<char>| {
            prefixes.iter().any(|prefix| {
                compact.strip_prefix(prefix).is_some_and(|rest| {
                    let mut chars = rest.chars();
                    matches!((chars.next(), chars.next()), (Some(d), None) if range.contains(&d))
                })
            })
        };
        if digit_after(&["PRIMARY", "PRI", "P"], '1'..='6') {
            Some(Level::Primary)
        } else if digit_after(&["SECONDARY", "SEC"], '1'..='5') {
            Some(Level::Secondary)
        } else if digit_after(&["JC"], '1'..='2') {
            Some(Level::JuniorCollege)
        } else if digit_after(&["KINDERGARTEN", "NURSERY", "K", "N"], '1'..='2') {
            Some(Level::PreSchool)
        } else {
            None
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Level {
    type Err = UnknownVariant;

    /// Accepts the storage form (`junior_college`) or a loose label (`Junior College`, `JC`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s
            .trim()
            .to_ascii_lowercase()
            .replace(['-', ' '], "_");
        let level = match norm.as_str() {
            "pre_school" | "preschool" | "kindergarten" | "nursery" => Level::PreSchool,
            "primary" | "pri" => Level::Primary,
            "secondary" | "sec" => Level::Secondary,
            "junior_college" | "jc" => Level::JuniorCollege,
            "ib" => Level::Ib,
            "igcse" => Level::Igcse,
            "polytechnic" | "poly" => Level::Polytechnic,
            "university" | "uni" => Level::University,
            "adult" => Level::Adult,
            _ => return Err(UnknownVariant::new("level", s)),
        };
        Ok(level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Open,
    Closed,
    Expired,
    Hidden,
    Deleted,
}

impl AssignmentStatus {
    pub const ALL: [AssignmentStatus; 6] = [
        AssignmentStatus::Pending,
        AssignmentStatus::Open,
        AssignmentStatus::Closed,
        AssignmentStatus::Expired,
        AssignmentStatus::Hidden,
        AssignmentStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Pending => "pending",
            AssignmentStatus::Open => "open",
            AssignmentStatus::Closed => "closed",
            AssignmentStatus::Expired => "expired",
            AssignmentStatus::Hidden => "hidden",
            AssignmentStatus::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AssignmentStatus::Deleted)
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AssignmentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("assignment status", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TutorType {
    PartTime,
    FullTime,
    ExMoeTeacher,
    MoeTeacher,
}

impl TutorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TutorType::PartTime => "part_time",
            TutorType::FullTime => "full_time",
            TutorType::ExMoeTeacher => "ex_moe_teacher",
            TutorType::MoeTeacher => "moe_teacher",
        }
    }
}

impl FromStr for TutorType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s
            .trim()
            .to_ascii_lowercase()
            .replace(['-', ' '], "_");
        let tutor_type = match norm.as_str() {
            "part_time" | "pt" | "part_timer" => TutorType::PartTime,
            "full_time" | "ft" | "full_timer" => TutorType::FullTime,
            "ex_moe_teacher" | "ex_moe" | "ex_school_teacher" => TutorType::ExMoeTeacher,
            "moe_teacher" | "moe" | "current_moe" | "school_teacher" => TutorType::MoeTeacher,
            _ => return Err(UnknownVariant::new("tutor type", s)),
        };
        Ok(tutor_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningMode {
    Online,
    FaceToFace,
    Hybrid,
}

impl LearningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningMode::Online => "online",
            LearningMode::FaceToFace => "face_to_face",
            LearningMode::Hybrid => "hybrid",
        }
    }
}

impl FromStr for LearningMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s
            .trim()
            .to_ascii_lowercase()
            .replace(['-', ' '], "_");
        match norm.as_str() {
            "online" => Ok(LearningMode::Online),
            "face_to_face" | "f2f" | "physical" | "home" => Ok(LearningMode::FaceToFace),
            "hybrid" => Ok(LearningMode::Hybrid),
            _ => Err(UnknownVariant::new("learning mode", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentKind {
    #[default]
    Academic,
    NonAcademic,
}

impl AssignmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentKind::Academic => "academic",
            AssignmentKind::NonAcademic => "non_academic",
        }
    }
}

impl FromStr for AssignmentKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "academic" => Ok(AssignmentKind::Academic),
            "non_academic" => Ok(AssignmentKind::NonAcademic),
            _ => Err(UnknownVariant::new("assignment kind", s)),
        }
    }
}

/// Hourly rate bounds in SGD; either side may be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RateRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl RateRange {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn midpoint(&self) -> Option<f64> {
        match (self.min, self.max) {
            (Some(lo), Some(hi)) => Some((lo + hi) / 2.0),
            (Some(v), None) | (None, Some(v)) => Some(v),
            (None, None) => None,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        let non_negative = self.min.map_or(true, |v| v.is_finite() && v >= 0.0)
            && self.max.map_or(true, |v| v.is_finite() && v >= 0.0);
        let ordered = match (self.min, self.max) {
            (Some(lo), Some(hi)) => lo <= hi,
            _ => true,
        };
        non_negative && ordered
    }

    /// Smallest range covering both.
    pub fn span(&self, other: &RateRange) -> RateRange {
        fn pick(a: Option<f64>, b: Option<f64>, f: fn(f64, f64) -> f64) -> Option<f64> {
            match (a, b) {
                (Some(x), Some(y)) => Some(f(x, y)),
                (x, None) => x,
                (None, y) => y,
            }
        }
        RateRange {
            min: pick(self.min, other.min, f64::min),
            max: pick(self.max, other.max, f64::max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TutorTypeRate {
    pub tutor_type: TutorType,
    #[serde(default)]
    pub rate: RateRange,
}

/// One (level, grade, stream) context paired with the subjects requested for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcademicRequest {
    pub level: Option<Level>,
    pub specific_grade: Option<String>,
    pub stream: Option<String>,
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub days: Vec<String>,
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
    pub note: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub region: Option<String>,
    pub nearest_mrt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    Model,
    Deterministic,
}

/// Where a field value came from and when the underlying text was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: FieldSource,
    pub observed_at: DateTime<Utc>,
}

impl Provenance {
    /// Deterministic outranks model; within a source the later observation wins.
    pub fn rank(&self) -> (FieldSource, DateTime<Utc>) {
        (self.source, self.observed_at)
    }
}

/// Candidate field value with optional provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub provenance: Option<Provenance>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            provenance: None,
        }
    }

    pub fn observed(value: T, source: FieldSource, observed_at: DateTime<Utc>) -> Self {
        Self {
            value: Some(value),
            provenance: Some(Provenance {
                source,
                observed_at,
            }),
        }
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }
}

/// Candidate built from one extraction run, before it is merged into the canonical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentDraft {
    pub channel: String,
    pub message_id: i64,
    pub pipeline_version: String,
    pub published_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub kind: AssignmentKind,
    pub assignment_code: Field<String>,
    pub subjects: Field<Vec<String>>,
    pub level: Field<Level>,
    pub specific_grade: Field<String>,
    pub stream: Field<String>,
    pub academic_requests: Field<Vec<AcademicRequest>>,
    pub rate: Field<RateRange>,
    pub tutor_types: Field<Vec<TutorTypeRate>>,
    pub time_availability: Field<Vec<TimeWindow>>,
    pub learning_mode: Field<LearningMode>,
    pub postal_code: Field<String>,
    pub region: Field<String>,
    pub address: Option<String>,
    pub nearest_mrt: Option<String>,
    pub summary: Option<String>,
    pub remarks: Option<String>,
    pub schedule_text: Option<String>,
    pub raw_text: String,
    /// Text says the post is taken/closed.
    pub closed_marker: bool,
    pub quality_flags: Vec<String>,
}

impl AssignmentDraft {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.channel.clone(), self.message_id)
    }
}

/// The persisted record for one real-world assignment, keyed by its originating message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalAssignment {
    /// Store-assigned surrogate id; 0 until first written.
    pub id: i64,
    pub channel: String,
    pub message_id: i64,
    pub status: AssignmentStatus,
    pub kind: AssignmentKind,
    pub assignment_code: Option<String>,
    pub subjects: Vec<String>,
    pub level: Option<Level>,
    pub specific_grade: Option<String>,
    pub stream: Option<String>,
    pub academic_requests: Vec<AcademicRequest>,
    pub rate: RateRange,
    pub tutor_types: Vec<TutorTypeRate>,
    pub time_availability: Vec<TimeWindow>,
    pub learning_mode: Option<LearningMode>,
    pub location: Location,
    pub summary: Option<String>,
    pub remarks: Option<String>,
    pub schedule_text: Option<String>,
    pub raw_text: String,
    pub duplicate_group_id: Option<i64>,
    pub is_primary: bool,
    pub duplicate_confidence: Option<f64>,
    pub quality_flags: Vec<String>,
    /// Per structured field, the provenance of the value currently held.
    pub provenance: BTreeMap<String, Provenance>,
    /// Observation time of the extraction that last wrote the free-text fields.
    pub display_observed_at: DateTime<Utc>,
    pub pipeline_version: String,
    pub published_at: DateTime<Utc>,
    pub source_edited_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
    pub last_bumped_at: Option<DateTime<Utc>>,
    pub bump_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalAssignment {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.channel.clone(), self.message_id)
    }

    pub fn is_open(&self) -> bool {
        self.status == AssignmentStatus::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parses_labels_and_grades() {
        assert_eq!("Junior College".parse::<Level>(), Ok(Level::JuniorCollege));
        assert_eq!("pre-school".parse::<Level>(), Ok(Level::PreSchool));
        assert!("grad school".parse::<Level>().is_err());
        assert_eq!(Level::for_grade("P4"), Some(Level::Primary));
        assert_eq!(Level::for_grade("Sec 3"), Some(Level::Secondary));
        assert_eq!(Level::for_grade("JC2"), Some(Level::JuniorCollege));
        assert_eq!(Level::for_grade("K1"), Some(Level::PreSchool));
        assert_eq!(Level::for_grade("Primary 6"), Some(Level::Primary));
        assert_eq!(Level::for_grade("N2 Street"), None);
        assert_eq!(Level::for_grade("S3"), None);
        assert_eq!(Level::for_grade("K9"), None);
        assert_eq!(Level::for_grade("P12"), None);
    }

    #[test]
    fn rate_range_checks() {
        assert!(RateRange::new(Some(30.0), Some(40.0)).is_well_formed());
        assert!(!RateRange::new(Some(50.0), Some(40.0)).is_well_formed());
        assert!(!RateRange::new(Some(-1.0), None).is_well_formed());
        assert_eq!(RateRange::new(Some(30.0), Some(40.0)).midpoint(), Some(35.0));
        let span = RateRange::new(Some(30.0), Some(35.0)).span(&RateRange::new(Some(40.0), Some(60.0)));
        assert_eq!(span, RateRange::new(Some(30.0), Some(60.0)));
    }

    #[test]
    fn deterministic_outranks_model_regardless_of_time() {
        let early = DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z").unwrap().with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z").unwrap().with_timezone(&Utc);
        let det = Provenance { source: FieldSource::Deterministic, observed_at: early };
        let model = Provenance { source: FieldSource::Model, observed_at: late };
        assert!(det.rank() > model.rank());
    }
}
