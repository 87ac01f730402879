use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use tutorfeed_core::{AssignmentDraft, AssignmentKind, LearningMode, Level};
use tutorfeed_signals::Signals;

use crate::config::ValidationMode;

/// Posts shorter than this are usually fragments or follow-ups.
const SHORT_TEXT_CHARS: usize = 40;

/// Hard failures. In enforce mode the first one fails the job without retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    #[error("academic assignment has no subjects")]
    MissingSubjects,
    #[error("academic assignment has no level or grade")]
    MissingLevel,
    #[error("rate range is negative or inverted")]
    InvalidRateRange,
    #[error("tutor type rate is negative or inverted")]
    InvalidTutorRate,
    #[error("post has no text")]
    MissingText,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::MissingSubjects => "missing_subjects",
            ValidationCode::MissingLevel => "missing_level",
            ValidationCode::InvalidRateRange => "invalid_rate_range",
            ValidationCode::InvalidTutorRate => "invalid_tutor_rate",
            ValidationCode::MissingText => "missing_text",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub hard: Vec<ValidationCode>,
    pub warnings: Vec<&'static str>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.hard.is_empty() && self.warnings.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Validator {
    mode: ValidationMode,
}

impl Validator {
    pub fn new(mode: ValidationMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// `model_subjects` are the model's subjects after taxonomy mapping.
    pub fn check(
        &self,
        draft: &AssignmentDraft,
        signals: &Signals,
        model_subjects: &[String],
    ) -> ValidationReport {
        let mut report = ValidationReport::default();

        if draft.raw_text.trim().is_empty() {
            report.hard.push(ValidationCode::MissingText);
        }
        if draft.kind == AssignmentKind::Academic {
            let no_subjects = draft.subjects.value.as_ref().map_or(true, Vec::is_empty);
            if no_subjects {
                report.hard.push(ValidationCode::MissingSubjects);
            }
            if !draft.level.is_present() && !draft.specific_grade.is_present() {
                report.hard.push(ValidationCode::MissingLevel);
            }
        }
        if draft.rate.value.is_some_and(|r| !r.is_well_formed()) {
            report.hard.push(ValidationCode::InvalidRateRange);
        }
        let bad_tutor_rate = draft
            .tutor_types
            .value
            .as_ref()
            .is_some_and(|types| types.iter().any(|t| !t.rate.is_well_formed()));
        if bad_tutor_rate {
            report.hard.push(ValidationCode::InvalidTutorRate);
        }

        if let (Some(level), Some(grade)) = (draft.level.value, draft.specific_grade.value.as_deref()) {
            if Level::for_grade(grade).is_some_and(|implied| implied != level) {
                report.warnings.push("level_grade_mismatch");
            }
        }
        if draft.raw_text.trim().chars().count() < SHORT_TEXT_CHARS {
            report.warnings.push("short_text");
        }
        if draft.rate.value.map_or(true, |r| r.is_empty()) {
            report.warnings.push("missing_rate");
        }
        let has_location = draft.postal_code.is_present()
            || draft.region.is_present()
            || draft.address.is_some()
            || draft.nearest_mrt.is_some()
            || draft.learning_mode.value == Some(LearningMode::Online);
        if !has_location {
            report.warnings.push("missing_location");
        }
        if signals.ambiguous {
            report.warnings.push("ambiguous_subjects");
        }
        if !signals.ok {
            report.warnings.push("signals_failed");
        }
        if !signals.subjects.is_empty() && !model_subjects.is_empty() {
            let disagree = model_subjects.iter().any(|s| !signals.subjects.contains(s))
                || signals.subjects.iter().any(|s| !model_subjects.contains(s));
            if disagree {
                report.warnings.push("model_subject_disagreement");
            }
        }

        report
    }

    /// Record the report on the draft. Returns the blocking code in enforce mode.
    pub fn apply(
        &self,
        draft: &mut AssignmentDraft,
        report: &ValidationReport,
    ) -> Result<(), ValidationCode> {
        if let Some(code) = report.hard.first() {
            if self.mode == ValidationMode::Enforce {
                return Err(*code);
            }
            warn!(
                channel = %draft.channel,
                message_id = draft.message_id,
                codes = ?report.hard,
                "hard validation failures persisted in report mode"
            );
        }
        for code in &report.hard {
            draft.quality_flags.push(format!("hard:{}", code.as_str()));
        }
        for warning in &report.warnings {
            draft.quality_flags.push((*warning).to_string());
        }
        draft.quality_flags.sort();
        draft.quality_flags.dedup();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tutorfeed_core::{Field, FieldSource, RateRange, TutorType, TutorTypeRate};

    fn draft(text: &str) -> AssignmentDraft {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        AssignmentDraft {
            channel: "sgtutors".into(),
            message_id: 1,
            pipeline_version: "v1".into(),
            published_at: at,
            edited_at: None,
            observed_at: at,
            last_seen_at: at,
            kind: AssignmentKind::Academic,
            assignment_code: Field::empty(),
            subjects: Field::observed(vec!["Maths".into()], FieldSource::Deterministic, at),
            level: Field::observed(Level::Primary, FieldSource::Deterministic, at),
            specific_grade: Field::observed("P5".into(), FieldSource::Deterministic, at),
            stream: Field::empty(),
            academic_requests: Field::empty(),
            rate: Field::observed(RateRange::new(Some(30.0), Some(40.0)), FieldSource::Model, at),
            tutor_types: Field::empty(),
            time_availability: Field::empty(),
            learning_mode: Field::empty(),
            postal_code: Field::observed("570123".into(), FieldSource::Deterministic, at),
            region: Field::empty(),
            address: None,
            nearest_mrt: None,
            summary: None,
            remarks: None,
            schedule_text: None,
            raw_text: text.into(),
            closed_marker: false,
            quality_flags: Vec::new(),
        }
    }

    fn ok_signals() -> Signals {
        Signals {
            ok: true,
            subjects: vec!["Maths".into()],
            ..Signals::default()
        }
    }

    const TEXT: &str = "P5 Maths at Bishan 570123, $30-40/hr, weekday evenings";

    #[test]
    fn complete_draft_is_clean() {
        let report = Validator::new(ValidationMode::Enforce).check(&draft(TEXT), &ok_signals(), &["Maths".into()]);
        assert!(report.is_clean(), "{report:?}");
    }

    #[test]
    fn academic_drafts_need_subjects_and_level() {
        let mut d = draft(TEXT);
        d.subjects = Field::empty();
        d.level = Field::empty();
        d.specific_grade = Field::empty();
        let report = Validator::new(ValidationMode::Report).check(&d, &ok_signals(), &[]);
        assert_eq!(report.hard, vec![ValidationCode::MissingSubjects, ValidationCode::MissingLevel]);

        d.kind = AssignmentKind::NonAcademic;
        let report = Validator::new(ValidationMode::Report).check(&d, &ok_signals(), &[]);
        assert!(report.hard.is_empty());
    }

    #[test]
    fn malformed_rates_are_hard_failures() {
        let mut d = draft(TEXT);
        let at = d.observed_at;
        d.rate = Field::observed(RateRange::new(Some(50.0), Some(20.0)), FieldSource::Model, at);
        d.tutor_types = Field::observed(
            vec![TutorTypeRate {
                tutor_type: TutorType::PartTime,
                rate: RateRange::new(Some(-5.0), None),
            }],
            FieldSource::Model,
            at,
        );
        let report = Validator::new(ValidationMode::Report).check(&d, &ok_signals(), &[]);
        assert_eq!(
            report.hard,
            vec![ValidationCode::InvalidRateRange, ValidationCode::InvalidTutorRate]
        );
    }

    #[test]
    fn soft_warnings_do_not_block() {
        let mut d = draft("Sec 2 Maths");
        d.specific_grade.value = Some("Sec 2".into());
        d.rate = Field::empty();
        d.postal_code = Field::empty();
        let signals = Signals {
            ambiguous: true,
            ..ok_signals()
        };
        let validator = Validator::new(ValidationMode::Enforce);
        let report = validator.check(&d, &signals, &["Physics".into()]);
        assert!(report.hard.is_empty());
        assert_eq!(
            report.warnings,
            vec![
                "level_grade_mismatch",
                "short_text",
                "missing_rate",
                "missing_location",
                "ambiguous_subjects",
                "model_subject_disagreement"
            ]
        );
        validator.apply(&mut d, &report).unwrap();
        assert!(d.quality_flags.contains(&"short_text".to_string()));
    }

    #[test]
    fn enforce_blocks_and_report_flags() {
        let mut d = draft(TEXT);
        d.subjects = Field::empty();
        let report = Validator::new(ValidationMode::Report).check(&d, &ok_signals(), &[]);

        let err = Validator::new(ValidationMode::Enforce)
            .apply(&mut d.clone(), &report)
            .unwrap_err();
        assert_eq!(err, ValidationCode::MissingSubjects);
        assert_eq!(err.to_string(), "academic assignment has no subjects");

        Validator::new(ValidationMode::Report).apply(&mut d, &report).unwrap();
        assert_eq!(d.quality_flags, vec!["hard:missing_subjects".to_string()]);
    }
}
