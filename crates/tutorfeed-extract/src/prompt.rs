use crate::ChatMessage;

/// Recorded with every extraction so results can be traced to the prompt that produced them.
pub const PROMPT_VERSION: &str = "assignment-extract-v4";

pub const SYSTEM_PROMPT: &str = r#"You extract structured data from Singapore tuition assignment posts broadcast by tuition agencies.

Reply with a single JSON object and nothing else. Use exactly these keys:
- is_assignment (boolean): false for adverts, announcements, tutor profiles, "assignment taken" notices without details, and chatter.
- kind: "academic" or "non_academic" (music, sports, art, coding bootcamps and similar are non_academic).
- assignment_code (string or null): the agency's job or assignment code, as written.
- subjects (array of strings): subject names as written, e.g. "English", "A Maths", "Chemistry".
- level (string or null): one of "Pre-School", "Primary", "Secondary", "Junior College", "IB", "IGCSE", "Polytechnic", "University", "Adult".
- specific_grade (string or null): normalized grade such as "P4", "Sec 3", "JC1", "K2".
- stream (string or null): "IP", "Express", "NA", "NT", "G1"-"G3", "H1"-"H3", "HL" or "SL".
- rate_min, rate_max (numbers or null): hourly rate in SGD. Use the same number for both when a single rate is given.
- rate_text (string or null): the rate exactly as written.
- address (string or null), postal_code (string or null, 6 digits), nearest_mrt (string or null).
- learning_mode (string or null): "online", "face_to_face" or "hybrid".
- tutor_types (array of strings): any of "part_time", "full_time", "ex_moe_teacher", "moe_teacher".
- schedule_text (string or null): availability exactly as written.
- student_gender (string or null), remarks (string or null).
- summary (string or null): one sentence describing the assignment.

Never invent values. Use null or an empty array when the post does not say."#;

#[derive(Debug, Clone, Copy)]
pub struct FewShot {
    pub post: &'static str,
    pub answer: &'static str,
}

pub const FEW_SHOTS: [FewShot; 3] = [
    FewShot {
        post: "Job Code: T2291\nSec 3 Express A Maths\nLocation: 560231 (Ang Mo Kio MRT)\nRate: PT $35-40/hr | FT $45-50/hr\nAvailability: Tue/Thu after 6pm\nFemale student, prefers patient tutor",
        answer: r#"{"is_assignment":true,"kind":"academic","assignment_code":"T2291","subjects":["A Maths"],"level":"Secondary","specific_grade":"Sec 3","stream":"Express","rate_min":35,"rate_max":50,"rate_text":"PT $35-40/hr | FT $45-50/hr","address":null,"postal_code":"560231","nearest_mrt":"Ang Mo Kio MRT","learning_mode":"face_to_face","tutor_types":["part_time","full_time"],"schedule_text":"Tue/Thu after 6pm","student_gender":"female","remarks":"prefers patient tutor","summary":"Sec 3 Express A Maths home tuition near Ang Mo Kio."}"#,
    },
    FewShot {
        post: "Online Piano lessons for adult beginner, Grade 1 ABRSM. $50/hr. Weekends.",
        answer: r#"{"is_assignment":true,"kind":"non_academic","assignment_code":null,"subjects":["Piano"],"level":"Adult","specific_grade":null,"stream":null,"rate_min":50,"rate_max":50,"rate_text":"$50/hr","address":null,"postal_code":null,"nearest_mrt":null,"learning_mode":"online","tutor_types":[],"schedule_text":"Weekends","student_gender":null,"remarks":"Grade 1 ABRSM","summary":"Online piano lessons for an adult beginner."}"#,
    },
    FewShot {
        post: "Join our tutor pool today! Register at our website to receive assignments first.",
        answer: r#"{"is_assignment":false,"kind":"academic","assignment_code":null,"subjects":[],"level":null,"specific_grade":null,"stream":null,"rate_min":null,"rate_max":null,"rate_text":null,"address":null,"postal_code":null,"nearest_mrt":null,"learning_mode":null,"tutor_types":[],"schedule_text":null,"student_gender":null,"remarks":null,"summary":null}"#,
    },
];

/// System prompt, few-shot pairs, then the post to extract.
pub fn build_messages(text: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2 + FEW_SHOTS.len() * 2);
    messages.push(ChatMessage::system(SYSTEM_PROMPT));
    for shot in FEW_SHOTS {
        messages.push(ChatMessage::user(shot.post));
        messages.push(ChatMessage::assistant(shot.answer));
    }
    messages.push(ChatMessage::user(text));
    messages
}
