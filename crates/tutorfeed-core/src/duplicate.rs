use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateMember {
    pub assignment_id: i64,
    /// Similarity against the group primary; `None` for the primary itself.
    pub confidence: Option<f64>,
    pub is_primary: bool,
}

/// Assignments believed to describe the same opportunity, with one designated primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: i64,
    pub primary_assignment_id: i64,
    pub members: Vec<DuplicateMember>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DuplicateGroup {
    pub fn member_ids(&self) -> Vec<i64> {
        self.members.iter().map(|m| m.assignment_id).collect()
    }

    pub fn contains(&self, assignment_id: i64) -> bool {
        self.members.iter().any(|m| m.assignment_id == assignment_id)
    }
}
