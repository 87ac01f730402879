use std::collections::BTreeMap;

use tutorfeed_core::{
    AssignmentDraft, AssignmentStatus, CanonicalAssignment, Field, Location, Provenance, RateRange,
};
use tutorfeed_storage::MergeDecision;

/// A canonical field a draft value can be written into.
trait Slot {
    type Value: Clone;

    fn is_filled(&self) -> bool;
    fn fill(&mut self, value: Self::Value);
}

impl<T: Clone> Slot for Option<T> {
    type Value = T;

    fn is_filled(&self) -> bool {
        self.is_some()
    }

    fn fill(&mut self, value: T) {
        *self = Some(value);
    }
}

impl<T: Clone> Slot for Vec<T> {
    type Value = Vec<T>;

    fn is_filled(&self) -> bool {
        !self.is_empty()
    }

    fn fill(&mut self, value: Vec<T>) {
        *self = value;
    }
}

impl Slot for RateRange {
    type Value = RateRange;

    fn is_filled(&self) -> bool {
        !self.is_empty()
    }

    fn fill(&mut self, value: RateRange) {
        *self = value;
    }
}

/// Write `incoming` over `slot` unless the held value outranks it. An empty incoming value
/// never clears a filled slot.
fn merge_field<S: Slot>(
    slot: &mut S,
    name: &str,
    incoming: &Field<S::Value>,
    provenance: &mut BTreeMap<String, Provenance>,
) {
    let (Some(value), Some(prov)) = (&incoming.value, incoming.provenance) else {
        return;
    };
    let held = if slot.is_filled() {
        provenance.get(name).map(Provenance::rank)
    } else {
        None
    };
    if held.map_or(true, |rank| prov.rank() >= rank) {
        slot.fill(value.clone());
        provenance.insert(name.to_string(), prov);
    }
}

fn empty_record(draft: &AssignmentDraft) -> CanonicalAssignment {
    CanonicalAssignment {
        id: 0,
        channel: draft.channel.clone(),
        message_id: draft.message_id,
        status: AssignmentStatus::Open,
        kind: draft.kind,
        assignment_code: None,
        subjects: Vec::new(),
        level: None,
        specific_grade: None,
        stream: None,
        academic_requests: Vec::new(),
        rate: RateRange::default(),
        tutor_types: Vec::new(),
        time_availability: Vec::new(),
        learning_mode: None,
        location: Location::default(),
        summary: None,
        remarks: None,
        schedule_text: None,
        raw_text: String::new(),
        duplicate_group_id: None,
        is_primary: false,
        duplicate_confidence: None,
        quality_flags: Vec::new(),
        provenance: BTreeMap::new(),
        display_observed_at: draft.observed_at,
        pipeline_version: draft.pipeline_version.clone(),
        published_at: draft.published_at,
        source_edited_at: draft.edited_at,
        last_seen_at: draft.last_seen_at,
        last_bumped_at: None,
        bump_count: 0,
        created_at: draft.observed_at,
        updated_at: draft.observed_at,
    }
}

/// Conservative merge of one extraction into the stored record for the same message.
///
/// Structured fields keep whichever value has the highest `(source, observed_at)` rank, so
/// the result does not depend on the order racing edits complete in. Free-text fields
/// follow the newest observation outright. Deleted records are never touched.
pub fn merge_draft(existing: Option<CanonicalAssignment>, draft: &AssignmentDraft) -> MergeDecision {
    if existing
        .as_ref()
        .is_some_and(|record| record.status.is_terminal())
    {
        return MergeDecision::Keep;
    }

    let mut record = existing
        .clone()
        .unwrap_or_else(|| empty_record(draft));
    let prov = &mut record.provenance;

    merge_field(&mut record.assignment_code, "assignment_code", &draft.assignment_code, prov);
    merge_field(&mut record.subjects, "subjects", &draft.subjects, prov);
    merge_field(&mut record.level, "level", &draft.level, prov);
    merge_field(&mut record.specific_grade, "specific_grade", &draft.specific_grade, prov);
    merge_field(&mut record.stream, "stream", &draft.stream, prov);
    merge_field(&mut record.academic_requests, "academic_requests", &draft.academic_requests, prov);
    merge_field(&mut record.rate, "rate", &draft.rate, prov);
    merge_field(&mut record.tutor_types, "tutor_types", &draft.tutor_types, prov);
    merge_field(&mut record.time_availability, "time_availability", &draft.time_availability, prov);
    merge_field(&mut record.learning_mode, "learning_mode", &draft.learning_mode, prov);
    merge_field(&mut record.location.postal_code, "postal_code", &draft.postal_code, prov);
    merge_field(&mut record.location.region, "region", &draft.region, prov);

    if draft.observed_at >= record.display_observed_at {
        record.display_observed_at = draft.observed_at;
        record.kind = draft.kind;
        record.summary = draft.summary.clone();
        record.remarks = draft.remarks.clone();
        record.schedule_text = draft.schedule_text.clone();
        record.location.address = draft.address.clone();
        record.location.nearest_mrt = draft.nearest_mrt.clone();
        record.raw_text = draft.raw_text.clone();
        record.quality_flags = draft.quality_flags.clone();
        record.pipeline_version = draft.pipeline_version.clone();
    }

    let is_new_edit = match (draft.edited_at, record.source_edited_at) {
        (Some(incoming), Some(held)) => incoming > held,
        (Some(_), None) => true,
        (None, _) => false,
    };
    record.published_at = record.published_at.min(draft.published_at);
    record.source_edited_at = record.source_edited_at.max(draft.edited_at);
    record.last_seen_at = record.last_seen_at.max(draft.last_seen_at);

    if draft.closed_marker {
        record.status = AssignmentStatus::Closed;
    } else if record.status == AssignmentStatus::Expired && is_new_edit {
        record.status = AssignmentStatus::Open;
    }

    match existing {
        Some(stored) if stored == record => MergeDecision::Keep,
        _ => MergeDecision::Write(record),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use tutorfeed_core::{AssignmentKind, FieldSource, Level};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    fn draft(observed_at: DateTime<Utc>) -> AssignmentDraft {
        AssignmentDraft {
            channel: "sgtutors".into(),
            message_id: 1,
            pipeline_version: "v1".into(),
            published_at: t0(),
            edited_at: (observed_at > t0()).then_some(observed_at),
            observed_at,
            last_seen_at: observed_at,
            kind: AssignmentKind::Academic,
            assignment_code: Field::empty(),
            subjects: Field::empty(),
            level: Field::empty(),
            specific_grade: Field::empty(),
            stream: Field::empty(),
            academic_requests: Field::empty(),
            rate: Field::empty(),
            tutor_types: Field::empty(),
            time_availability: Field::empty(),
            learning_mode: Field::empty(),
            postal_code: Field::empty(),
            region: Field::empty(),
            address: None,
            nearest_mrt: None,
            summary: None,
            remarks: None,
            schedule_text: None,
            raw_text: "P5 Maths".into(),
            closed_marker: false,
            quality_flags: Vec::new(),
        }
    }

    fn write(decision: MergeDecision) -> CanonicalAssignment {
        match decision {
            MergeDecision::Write(record) => record,
            MergeDecision::Keep => panic!("expected a write"),
        }
    }

    fn subjects(names: &[&str], source: FieldSource, at: DateTime<Utc>) -> Field<Vec<String>> {
        Field::observed(names.iter().map(|s| s.to_string()).collect(), source, at)
    }

    #[test]
    fn new_record_takes_draft_values() {
        let mut d = draft(t0());
        d.subjects = subjects(&["Maths"], FieldSource::Deterministic, t0());
        d.level = Field::observed(Level::Primary, FieldSource::Model, t0());
        d.summary = Some("P5 maths".into());
        let record = write(merge_draft(None, &d));
        assert_eq!(record.status, AssignmentStatus::Open);
        assert_eq!(record.subjects, vec!["Maths"]);
        assert_eq!(record.level, Some(Level::Primary));
        assert_eq!(record.provenance["level"].source, FieldSource::Model);
        assert_eq!(record.summary.as_deref(), Some("P5 maths"));
    }

    #[test]
    fn identical_rerun_keeps_stored_record() {
        let mut d = draft(t0());
        d.subjects = subjects(&["Maths"], FieldSource::Deterministic, t0());
        let stored = write(merge_draft(None, &d));
        assert_eq!(merge_draft(Some(stored), &d), MergeDecision::Keep);
    }

    #[test]
    fn deterministic_value_survives_newer_model_value() {
        let mut first = draft(t0());
        first.subjects = subjects(&["Maths"], FieldSource::Deterministic, t0());
        let stored = write(merge_draft(None, &first));

        let later = t0() + Duration::hours(1);
        let mut second = draft(later);
        second.subjects = subjects(&["Science"], FieldSource::Model, later);
        second.summary = Some("updated".into());
        let record = write(merge_draft(Some(stored), &second));
        assert_eq!(record.subjects, vec!["Maths"]);
        assert_eq!(record.summary.as_deref(), Some("updated"));
    }

    #[test]
    fn racing_edits_converge_in_either_order() {
        let base = write(merge_draft(None, &draft(t0())));
        let e1 = {
            let at = t0() + Duration::minutes(5);
            let mut d = draft(at);
            d.subjects = subjects(&["English"], FieldSource::Deterministic, at);
            d.summary = Some("first edit".into());
            d
        };
        let e2 = {
            let at = t0() + Duration::minutes(9);
            let mut d = draft(at);
            d.subjects = subjects(&["Chemistry"], FieldSource::Deterministic, at);
            d.summary = Some("second edit".into());
            d
        };

        let a = write(merge_draft(Some(write(merge_draft(Some(base.clone()), &e1))), &e2));
        let b_mid = write(merge_draft(Some(base), &e2));
        let b = match merge_draft(Some(b_mid.clone()), &e1) {
            MergeDecision::Keep => b_mid,
            MergeDecision::Write(record) => record,
        };
        assert_eq!(a.subjects, b.subjects);
        assert_eq!(a.subjects, vec!["Chemistry"]);
        assert_eq!(a.summary, b.summary);
        assert_eq!(a.source_edited_at, b.source_edited_at);
    }

    #[test]
    fn empty_incoming_never_clears() {
        let mut d = draft(t0());
        d.rate = Field::observed(RateRange::new(Some(30.0), Some(40.0)), FieldSource::Model, t0());
        let stored = write(merge_draft(None, &d));
        let later = draft(t0() + Duration::hours(2));
        let record = write(merge_draft(Some(stored), &later));
        assert_eq!(record.rate, RateRange::new(Some(30.0), Some(40.0)));
    }

    #[test]
    fn status_rules() {
        let mut stored = write(merge_draft(None, &draft(t0())));
        stored.status = AssignmentStatus::Deleted;
        assert_eq!(
            merge_draft(Some(stored.clone()), &draft(t0() + Duration::hours(1))),
            MergeDecision::Keep
        );

        stored.status = AssignmentStatus::Expired;
        let record = write(merge_draft(Some(stored.clone()), &draft(t0() + Duration::hours(1))));
        assert_eq!(record.status, AssignmentStatus::Open);

        let mut closing = draft(t0() + Duration::hours(2));
        closing.closed_marker = true;
        stored.status = AssignmentStatus::Open;
        let record = write(merge_draft(Some(stored), &closing));
        assert_eq!(record.status, AssignmentStatus::Closed);
    }

    #[test]
    fn timestamps_and_bump_metadata() {
        let mut stored = write(merge_draft(None, &draft(t0())));
        stored.bump_count = 2;
        stored.last_bumped_at = Some(t0() + Duration::days(1));
        stored.last_seen_at = t0() + Duration::days(1);
        stored.duplicate_group_id = Some(7);

        let edit = draft(t0() + Duration::hours(3));
        let record = write(merge_draft(Some(stored), &edit));
        assert_eq!(record.published_at, t0());
        assert_eq!(record.source_edited_at, Some(t0() + Duration::hours(3)));
        assert_eq!(record.last_seen_at, t0() + Duration::days(1));
        assert_eq!(record.bump_count, 2);
        assert_eq!(record.duplicate_group_id, Some(7));
    }
}
