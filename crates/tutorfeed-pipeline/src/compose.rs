use std::sync::Arc;

use tutorfeed_core::{
    AcademicRequest, AssignmentDraft, Field, FieldSource, RateRange, RawMessage, TutorTypeRate,
};
use tutorfeed_extract::ModelExtraction;
use tutorfeed_signals::{region_for_postal, Signals, Taxonomy};

/// Builds the candidate record for one extraction run, taking each structured field from
/// the deterministic signals when they found it and from the model otherwise.
pub struct Composer {
    taxonomy: Arc<Taxonomy>,
}

fn pick<T>(
    deterministic: Option<T>,
    model: Option<T>,
    observed_at: chrono::DateTime<chrono::Utc>,
) -> Field<T> {
    match (deterministic, model) {
        (Some(value), _) => Field::observed(value, FieldSource::Deterministic, observed_at),
        (None, Some(value)) => Field::observed(value, FieldSource::Model, observed_at),
        (None, None) => Field::empty(),
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

fn is_postal_code(s: &str) -> bool {
    s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit())
}

impl Composer {
    pub fn new(taxonomy: Arc<Taxonomy>) -> Self {
        Self { taxonomy }
    }

    /// Model subject names mapped onto the taxonomy, unknown names kept as written.
    pub fn canonical_subjects(&self, subjects: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let trimmed = subject.trim();
            if trimmed.is_empty() {
                continue;
            }
            let name = self
                .taxonomy
                .canonical(trimmed)
                .map(str::to_string)
                .unwrap_or_else(|| trimmed.to_string());
            if !out.contains(&name) {
                out.push(name);
            }
        }
        out
    }

    pub fn compose(
        &self,
        raw: &RawMessage,
        signals: &Signals,
        model: &ModelExtraction,
        pipeline_version: &str,
    ) -> AssignmentDraft {
        let at = raw.observed_at();
        let model_subjects = self.canonical_subjects(&model.subjects);

        // Only fall back to a model-built request when the text named no subject at all;
        // subjects found without context stay ambiguous.
        let model_request = if signals.subjects.is_empty()
            && !model_subjects.is_empty()
            && (model.level.is_some() || model.specific_grade.is_some())
        {
            Some(vec![AcademicRequest {
                level: model.level,
                specific_grade: model.specific_grade.clone(),
                stream: model.stream.clone(),
                subjects: model_subjects.clone(),
            }])
        } else {
            None
        };

        let model_rate = RateRange::new(model.rate_min, model.rate_max);
        let model_tutor_types = model
            .tutor_types
            .iter()
            .map(|t| TutorTypeRate {
                tutor_type: *t,
                rate: RateRange::default(),
            })
            .collect::<Vec<_>>();
        let model_postal = model
            .postal_code
            .as_deref()
            .map(str::trim)
            .filter(|p| is_postal_code(p))
            .map(str::to_string);
        let model_region = model_postal
            .as_deref()
            .and_then(region_for_postal)
            .map(str::to_string);

        AssignmentDraft {
            channel: raw.channel.clone(),
            message_id: raw.message_id,
            pipeline_version: pipeline_version.to_string(),
            published_at: raw.sent_at,
            edited_at: raw.edited_at,
            observed_at: at,
            last_seen_at: raw.last_seen_at,
            kind: model.kind,
            assignment_code: pick(
                signals.assignment_code.clone(),
                model.assignment_code.clone(),
                at,
            ),
            subjects: pick(
                non_empty(signals.subjects.clone()),
                non_empty(model_subjects),
                at,
            ),
            level: pick(signals.level(), model.level, at),
            specific_grade: pick(
                signals.specific_grade().map(str::to_string),
                model.specific_grade.clone(),
                at,
            ),
            stream: pick(
                signals.stream().map(str::to_string),
                model.stream.clone(),
                at,
            ),
            academic_requests: pick(
                non_empty(signals.academic_requests.clone()),
                model_request,
                at,
            ),
            rate: pick(
                (!signals.rate.is_empty()).then_some(signals.rate),
                (!model_rate.is_empty()).then_some(model_rate),
                at,
            ),
            tutor_types: pick(
                non_empty(signals.tutor_types.clone()),
                non_empty(model_tutor_types),
                at,
            ),
            time_availability: pick(non_empty(signals.time_availability.clone()), None, at),
            learning_mode: pick(signals.learning_mode, model.learning_mode, at),
            postal_code: pick(signals.postal_code.clone(), model_postal, at),
            region: pick(signals.region.clone(), model_region, at),
            address: model.address.clone(),
            nearest_mrt: model.nearest_mrt.clone(),
            summary: model.summary.clone(),
            remarks: model.remarks.clone(),
            schedule_text: model.schedule_text.clone(),
            raw_text: raw.text.clone(),
            closed_marker: signals.closed_marker,
            quality_flags: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tutorfeed_core::{Level, TutorType};
    use tutorfeed_signals::SignalBuilder;

    fn raw(text: &str) -> RawMessage {
        let sent = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        RawMessage {
            channel: "sgtutors".into(),
            message_id: 5,
            text: text.into(),
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

    fn setup() -> (SignalBuilder, Composer) {
        let builder = SignalBuilder::with_embedded_taxonomy().unwrap();
        let composer = Composer::new(Arc::new(Taxonomy::embedded().unwrap()));
        (builder, composer)
    }

    #[test]
    fn deterministic_values_win_over_model_values() {
        let (builder, composer) = setup();
        let msg = raw("Job Code: T1234\nP4 English and P6 Math\nRate: $30-40/hr");
        let signals = builder.build(&msg.text);
        let model = ModelExtraction {
            assignment_code: Some("X9".into()),
            subjects: vec!["Science".into()],
            level: Some(Level::Secondary),
            rate_min: Some(60.0),
            rate_max: Some(70.0),
            summary: Some("Two primary kids".into()),
            ..ModelExtraction::default()
        };
        let draft = composer.compose(&msg, &signals, &model, "v1");

        assert_eq!(draft.assignment_code.value.as_deref(), Some("T1234"));
        assert_eq!(draft.subjects.value, Some(vec!["English".to_string(), "Maths".to_string()]));
        assert_eq!(
            draft.subjects.provenance.unwrap().source,
            FieldSource::Deterministic
        );
        assert_eq!(draft.level.value, Some(Level::Primary));
        assert_eq!(draft.rate.value, Some(RateRange::new(Some(30.0), Some(40.0))));
        assert_eq!(draft.academic_requests.value.as_ref().map(Vec::len), Some(2));
        assert_eq!(draft.summary.as_deref(), Some("Two primary kids"));
    }

    #[test]
    fn model_fills_gaps_the_text_rules_miss() {
        let (builder, composer) = setup();
        let msg = raw("Tutor needed for my son, pays well, near 560231");
        let signals = builder.build(&msg.text);
        let model = ModelExtraction {
            subjects: vec!["additional maths".into(), "A Maths".into()],
            level: Some(Level::Secondary),
            specific_grade: Some("Sec 3".into()),
            rate_min: Some(45.0),
            rate_max: Some(45.0),
            tutor_types: vec![TutorType::FullTime],
            ..ModelExtraction::default()
        };
        let draft = composer.compose(&msg, &signals, &model, "v1");

        assert_eq!(draft.subjects.value, Some(vec!["A Maths".to_string()]));
        assert_eq!(draft.subjects.provenance.unwrap().source, FieldSource::Model);
        assert_eq!(draft.level.provenance.unwrap().source, FieldSource::Model);
        let requests = draft.academic_requests.value.unwrap();
        assert_eq!(requests[0].specific_grade.as_deref(), Some("Sec 3"));
        assert_eq!(draft.tutor_types.value.unwrap()[0].tutor_type, TutorType::FullTime);
        assert_eq!(draft.postal_code.provenance.unwrap().source, FieldSource::Deterministic);
    }

    #[test]
    fn ambiguous_text_subjects_get_no_guessed_request() {
        let (builder, composer) = setup();
        let msg = raw("Looking for a Chemistry tutor, weekends");
        let signals = builder.build(&msg.text);
        assert!(signals.ambiguous);
        let model = ModelExtraction {
            subjects: vec!["Chemistry".into()],
            level: Some(Level::JuniorCollege),
            ..ModelExtraction::default()
        };
        let draft = composer.compose(&msg, &signals, &model, "v1");
        assert!(draft.academic_requests.value.is_none());
        assert_eq!(draft.subjects.value, Some(vec!["Chemistry".to_string()]));
    }

    #[test]
    fn invalid_model_postal_codes_are_dropped() {
        let (builder, composer) = setup();
        let msg = raw("Sec 1 Maths at Bedok");
        let signals = builder.build(&msg.text);
        let model = ModelExtraction {
            postal_code: Some("Bedok North".into()),
            ..ModelExtraction::default()
        };
        let draft = composer.compose(&msg, &signals, &model, "v1");
        assert!(draft.postal_code.value.is_none());
        assert!(draft.region.value.is_none());
    }
}
