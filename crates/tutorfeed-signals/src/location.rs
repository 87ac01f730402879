use regex::Regex;
use tutorfeed_core::LearningMode;

/// Coarse region for the first two digits (postal sector) of a Singapore postal code.
pub fn region_for_postal(postal_code: &str) -> Option<&'static str> {
    let sector: u32 = postal_code.get(..2)?.parse().ok()?;
    let region = match sector {
        1..=37 => "Central",
        38..=52 | 81 => "East",
        53..=55 | 79 | 80 | 82 => "North-East",
        56..=59 => "Central",
        60..=71 => "West",
        72..=78 => "North",
        _ => return None,
    };
    Some(region)
}

#[derive(Debug)]
pub(crate) struct LocationParser {
    digits: Regex,
    online: Regex,
    in_person: Regex,
    hybrid: Regex,
}

impl LocationParser {
    pub(crate) fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            digits: Regex::new(r"\d+")?,
            online: Regex::new(r"\b(online|zoom|google meet|virtual|remote)\b")?,
            in_person: Regex::new(
                r"\b(face[- ]to[- ]face|f2f|home tuition|home-based|physical|in[- ]person|at (?:student'?s )?home)\b",
            )?,
            hybrid: Regex::new(r"\b(hybrid|online (?:and|or|/) (?:physical|f2f|face[- ]to[- ]face))\b")?,
        })
    }

    /// First six-digit run with a valid sector. Longer digit runs (phone numbers) never match.
    pub(crate) fn postal_code(&self, text: &str) -> Option<String> {
        self.digits
            .find_iter(text)
            .map(|m| m.as_str())
            .filter(|d| d.len() == 6)
            .find(|d| region_for_postal(d).is_some())
            .map(str::to_string)
    }

    pub(crate) fn learning_mode(&self, lowered: &str) -> Option<LearningMode> {
        if self.hybrid.is_match(lowered) {
            return Some(LearningMode::Hybrid);
        }
        match (self.online.is_match(lowered), self.in_person.is_match(lowered)) {
            (true, true) => Some(LearningMode::Hybrid),
            (true, false) => Some(LearningMode::Online),
            (false, true) => Some(LearningMode::FaceToFace),
            (false, false) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postal_code_and_region() {
        let parser = LocationParser::new().unwrap();
        assert_eq!(parser.postal_code("Blk 123 Tampines St 11 S(520123)").as_deref(), Some("520123"));
        assert_eq!(parser.postal_code("Call 91234567 or 98765432"), None);
        assert_eq!(parser.postal_code("ref 990001"), None);
        assert_eq!(region_for_postal("520123"), Some("East"));
        assert_eq!(region_for_postal("730888"), Some("North"));
        assert_eq!(region_for_postal("640123"), Some("West"));
        assert_eq!(region_for_postal("018956"), Some("Central"));
    }

    #[test]
    fn learning_mode_detection() {
        let parser = LocationParser::new().unwrap();
        assert_eq!(parser.learning_mode("lessons via zoom"), Some(LearningMode::Online));
        assert_eq!(parser.learning_mode("home tuition at bishan"), Some(LearningMode::FaceToFace));
        assert_eq!(parser.learning_mode("online or physical, hybrid ok"), Some(LearningMode::Hybrid));
        assert_eq!(parser.learning_mode("p5 maths"), None);
    }
}
