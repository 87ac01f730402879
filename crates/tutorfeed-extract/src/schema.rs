use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tutorfeed_core::{AssignmentKind, LearningMode, Level, TutorType};

use crate::ExtractError;

/// Fields the model is asked to fill. Values are coerced leniently: numbers may arrive as
/// `"$35"`, lists as comma-separated strings, and placeholders like `"N/A"` mean absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelExtraction {
    pub is_assignment: bool,
    pub kind: AssignmentKind,
    pub assignment_code: Option<String>,
    pub subjects: Vec<String>,
    pub level: Option<Level>,
    pub specific_grade: Option<String>,
    pub stream: Option<String>,
    pub rate_min: Option<f64>,
    pub rate_max: Option<f64>,
    pub rate_text: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub nearest_mrt: Option<String>,
    pub learning_mode: Option<LearningMode>,
    pub tutor_types: Vec<TutorType>,
    pub schedule_text: Option<String>,
    pub student_gender: Option<String>,
    pub remarks: Option<String>,
    pub summary: Option<String>,
}

impl Default for ModelExtraction {
    fn default() -> Self {
        Self {
            is_assignment: true,
            kind: AssignmentKind::Academic,
            assignment_code: None,
            subjects: Vec::new(),
            level: None,
            specific_grade: None,
            stream: None,
            rate_min: None,
            rate_max: None,
            rate_text: None,
            address: None,
            postal_code: None,
            nearest_mrt: None,
            learning_mode: None,
            tutor_types: Vec::new(),
            schedule_text: None,
            student_gender: None,
            remarks: None,
            summary: None,
        }
    }
}

const PLACEHOLDERS: [&str; 7] = ["", "null", "none", "n/a", "na", "nil", "unknown"];

fn text(value: Option<&Value>) -> Option<String> {
    let s = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| text(Some(v)))
            .collect::<Vec<_>>()
            .join(", "),
        _ => return None,
    };
    if PLACEHOLDERS.contains(&s.to_ascii_lowercase().as_str()) {
        None
    } else {
        Some(s)
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| *c != ',').collect();
            let start = cleaned.find(|c: char| c.is_ascii_digit())?;
            let digits: String = cleaned[start..]
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            digits.trim_end_matches('.').parse().ok()
        }
        _ => None,
    }
}

fn list(value: Option<&Value>) -> Vec<String> {
    let items: Vec<String> = match value {
        Some(Value::Array(items)) => items.iter().filter_map(|v| text(Some(v))).collect(),
        Some(Value::String(s)) => s
            .split([',', '/', ';', '\n'])
            .filter_map(|part| text(Some(&Value::String(part.to_string()))))
            .collect(),
        _ => Vec::new(),
    };
    let mut unique: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !unique.iter().any(|u| u.eq_ignore_ascii_case(&item)) {
            unique.push(item);
        }
    }
    unique
}

fn boolean(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" => true,
            "false" | "no" | "n" => false,
            _ => default,
        },
        Some(Value::Number(n)) => n.as_f64().map_or(default, |v| v != 0.0),
        _ => default,
    }
}

impl ModelExtraction {
    pub fn from_value(value: &Value) -> Result<Self, ExtractError> {
        let obj: &Map<String, Value> = value
            .as_object()
            .ok_or_else(|| ExtractError::Parse("model output is not an object".into()))?;
        let get = |key: &str| obj.get(key);

        let kind = match text(get("kind")).map(|k| k.to_ascii_lowercase().replace(['-', ' '], "_")) {
            Some(k) if k == "non_academic" => AssignmentKind::NonAcademic,
            _ => AssignmentKind::Academic,
        };

        Ok(Self {
            is_assignment: boolean(get("is_assignment"), true),
            kind,
            assignment_code: text(get("assignment_code")),
            subjects: list(get("subjects")),
            level: text(get("level")).and_then(|l| l.parse().ok()),
            specific_grade: text(get("specific_grade")),
            stream: text(get("stream")),
            rate_min: number(get("rate_min")),
            rate_max: number(get("rate_max")),
            rate_text: text(get("rate_text")),
            address: text(get("address")),
            postal_code: text(get("postal_code")),
            nearest_mrt: text(get("nearest_mrt")),
            learning_mode: text(get("learning_mode")).and_then(|m| m.parse().ok()),
            tutor_types: list(get("tutor_types"))
                .iter()
                .filter_map(|t| t.parse().ok())
                .collect(),
            schedule_text: text(get("schedule_text")),
            student_gender: text(get("student_gender")),
            remarks: text(get("remarks")),
            summary: text(get("summary")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerces_loose_values() {
        let extraction = ModelExtraction::from_value(&json!({
            "is_assignment": "yes",
            "kind": "academic",
            "subjects": "Maths, Science / maths",
            "level": "Primary",
            "specific_grade": "P5",
            "rate_min": "$35/hr",
            "rate_max": 45,
            "postal_code": 520123,
            "learning_mode": "face-to-face",
            "tutor_types": ["Part-Time", "ex-MOE", "astronaut"],
            "remarks": "N/A",
        }))
        .unwrap();

        assert!(extraction.is_assignment);
        assert_eq!(extraction.subjects, vec!["Maths", "Science"]);
        assert_eq!(extraction.level, Some(Level::Primary));
        assert_eq!(extraction.rate_min, Some(35.0));
        assert_eq!(extraction.rate_max, Some(45.0));
        assert_eq!(extraction.postal_code.as_deref(), Some("520123"));
        assert_eq!(extraction.learning_mode, Some(LearningMode::FaceToFace));
        assert_eq!(
            extraction.tutor_types,
            vec![TutorType::PartTime, TutorType::ExMoeTeacher]
        );
        assert_eq!(extraction.remarks, None);
    }

    #[test]
    fn missing_fields_default_to_an_academic_assignment() {
        let extraction = ModelExtraction::from_value(&json!({})).unwrap();
        assert_eq!(extraction, ModelExtraction::default());
    }

    #[test]
    fn non_assignment_and_non_academic() {
        let extraction = ModelExtraction::from_value(&json!({
            "is_assignment": false,
            "kind": "Non-Academic",
            "level": "grad school",
        }))
        .unwrap();
        assert!(!extraction.is_assignment);
        assert_eq!(extraction.kind, AssignmentKind::NonAcademic);
        assert_eq!(extraction.level, None);
    }

    #[test]
    fn rejects_non_objects() {
        assert!(ModelExtraction::from_value(&json!(["Maths"])).is_err());
    }
}
