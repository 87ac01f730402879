//! Best-effort repair of near-valid JSON returned by the model.

use serde_json::Value;

use crate::ExtractError;

/// Strip markdown code fences, including a leading sentence before the fence.
pub fn strip_code_blocks(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[open + 3..];
    let after = after.strip_prefix("json").unwrap_or(after);
    let body = match after.rfind("```") {
        Some(close) => &after[..close],
        None => after,
    };
    body.trim()
}

fn outermost_object(text: &str) -> &str {
    let Some(start) = text.find('{') else {
        return text;
    };
    match text.rfind('}') {
        Some(end) if end > start => &text[start..=end],
        _ => &text[start..],
    }
}

fn trim_trailing_comma(out: &mut String) {
    let len = out.trim_end().len();
    out.truncate(len);
    if out.ends_with(',') {
        out.pop();
    }
}

fn flush_word(out: &mut String, word: &mut String) {
    if word.is_empty() {
        return;
    }
    match word.as_str() {
        "True" => out.push_str("true"),
        "False" => out.push_str("false"),
        "None" | "NULL" | "Null" => out.push_str("null"),
        other => out.push_str(other),
    }
    word.clear();
}

/// Rewrite `raw` into something more likely to parse: cut to the outermost object,
/// normalize curly quotes and Python literals, drop trailing commas, and close any
/// string, array or object left open by a truncated reply.
pub fn repair_json(raw: &str) -> String {
    let body = outermost_object(strip_code_blocks(raw))
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    let mut out = String::with_capacity(body.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut word = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in body.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch.is_ascii_alphabetic() {
            word.push(ch);
            continue;
        }
        flush_word(&mut out, &mut word);
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '{' => {
                closers.push('}');
                out.push(ch);
            }
            '[' => {
                closers.push(']');
                out.push(ch);
            }
            '}' | ']' => {
                // Stray closers with nothing open are dropped.
                if !closers.contains(&ch) {
                    continue;
                }
                trim_trailing_comma(&mut out);
                while let Some(closer) = closers.pop() {
                    if closer == ch {
                        break;
                    }
                    out.push(closer);
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    flush_word(&mut out, &mut word);

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    trim_trailing_comma(&mut out);
    if out.ends_with(':') {
        out.push_str(" null");
    }
    while let Some(closer) = closers.pop() {
        trim_trailing_comma(&mut out);
        out.push(closer);
    }
    out
}

/// Parse model output as a JSON object, repairing it if the direct parse fails.
/// Returns the value and whether repair was needed.
pub fn parse_lenient(raw: &str) -> Result<(Value, bool), ExtractError> {
    let stripped = strip_code_blocks(raw);
    if stripped.is_empty() {
        return Err(ExtractError::Empty);
    }
    let (value, repaired) = match serde_json::from_str::<Value>(stripped) {
        Ok(value) => (value, false),
        Err(first) => {
            let fixed = repair_json(stripped);
            let value = serde_json::from_str::<Value>(&fixed).map_err(|second| {
                ExtractError::Parse(format!("{first}; after repair: {second}"))
            })?;
            (value, true)
        }
    };
    if !value.is_object() {
        return Err(ExtractError::Parse(format!(
            "expected a JSON object, got {}",
            match value {
                Value::Array(_) => "an array",
                Value::String(_) => "a string",
                Value::Number(_) => "a number",
                Value::Bool(_) => "a boolean",
                _ => "null",
            }
        )));
    }
    Ok((value, repaired))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_fences_and_leading_prose() {
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("Sure! Here it is:\n```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_blocks("{}"), "{}");
    }

    #[test]
    fn clean_json_is_not_marked_repaired() {
        let (value, repaired) = parse_lenient(r#"{"subjects": ["Maths"]}"#).unwrap();
        assert!(!repaired);
        assert_eq!(value, json!({"subjects": ["Maths"]}));
    }

    #[test]
    fn repairs_python_literals_and_trailing_commas() {
        let raw = "{\"is_assignment\": True, \"level\": None, \"subjects\": [\"Maths\", \"Science\",],}";
        let (value, repaired) = parse_lenient(raw).unwrap();
        assert!(repaired);
        assert_eq!(
            value,
            json!({"is_assignment": true, "level": null, "subjects": ["Maths", "Science"]})
        );
    }

    #[test]
    fn closes_truncated_output() {
        let (value, _) = parse_lenient(r#"{"subjects": ["Maths", "Sci"#).unwrap();
        assert_eq!(value, json!({"subjects": ["Maths", "Sci"]}));

        let (value, _) = parse_lenient(r#"{"summary": "P5 maths", "rate_min":"#).unwrap();
        assert_eq!(value, json!({"summary": "P5 maths", "rate_min": null}));
    }

    #[test]
    fn normalizes_curly_quotes_and_surrounding_text() {
        let raw = "Result: {\u{201c}level\u{201d}: \u{201c}Primary\u{201d}} hope this helps";
        let (value, _) = parse_lenient(raw).unwrap();
        assert_eq!(value, json!({"level": "Primary"}));
    }

    #[test]
    fn words_inside_strings_are_untouched() {
        let (value, _) = parse_lenient("{\"remarks\": \"None of the True tutors\",}").unwrap();
        assert_eq!(value["remarks"], "None of the True tutors");
    }

    #[test]
    fn hopeless_output_is_a_parse_error() {
        assert!(matches!(parse_lenient("I cannot help with that."), Err(ExtractError::Parse(_))));
        assert!(matches!(parse_lenient("[1, 2]"), Err(ExtractError::Parse(_))));
        assert_eq!(parse_lenient("   "), Err(ExtractError::Empty));
    }
}
