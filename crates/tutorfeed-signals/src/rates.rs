use regex::Regex;
use tutorfeed_core::{RateRange, TutorType, TutorTypeRate};

/// Hourly rates outside this band are treated as something else (fees per month, ids).
const PLAUSIBLE_HOURLY: std::ops::RangeInclusive<f64> = 10.0..=400.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateSignals {
    pub tutor_types: Vec<TutorTypeRate>,
    /// Span of every rate found, typed or not.
    pub rate: RateRange,
}

pub(crate) fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
            out.push(v);
        }
    }
    out
}

fn tutor_type_for(word: &str) -> Option<TutorType> {
    if word.starts_with("ex") {
        Some(TutorType::ExMoeTeacher)
    } else if word.contains("moe") || word.contains("school") {
        Some(TutorType::MoeTeacher)
    } else if word.starts_with("part") || word == "pt" {
        Some(TutorType::PartTime)
    } else if word.starts_with("full") || word == "ft" {
        Some(TutorType::FullTime)
    } else {
        None
    }
}

#[derive(Debug)]
pub(crate) struct RateParser {
    tutor_type: Regex,
    dollar: Regex,
    hourly: Regex,
}

impl RateParser {
    pub(crate) fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            tutor_type: Regex::new(
                r"\b(ex[- ]?moe(?:\s+teachers?)?|ex[- ]?school\s+teachers?|current\s+moe(?:\s+teachers?)?|moe(?:\s+teachers?)?|part[- ]?time(?:rs?)?|pt|full[- ]?time(?:rs?)?|ft)\b",
            )?,
            dollar: Regex::new(
                r"(?:\$|\bsgd\s?)\s*\d{1,3}(?:\.\d{1,2})?(?:\s*(?:-|–|~|to)\s*(?:\$|sgd\s?)?\s*\d{1,3}(?:\.\d{1,2})?)?",
            )?,
            hourly: Regex::new(
                r"\b\d{1,3}(?:\.\d{1,2})?(?:\s*(?:-|–|~|to)\s*\d{1,3}(?:\.\d{1,2})?)?\s*(?:/\s*h(?:ou)?rs?\b|/\s*h\b|per\s+h(?:ou)?r\b|p/h\b|ph\b)",
            )?,
        })
    }

    fn rates_in_line(&self, line: &str) -> Vec<RateRange> {
        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut rates = Vec::new();
        for m in self.dollar.find_iter(line).chain(self.hourly.find_iter(line)) {
            if spans.iter().any(|(s, e)| m.start() < *e && *s < m.end()) {
                continue;
            }
            spans.push((m.start(), m.end()));
            let nums: Vec<f64> = extract_numbers(m.as_str())
                .into_iter()
                .filter(|v| PLAUSIBLE_HOURLY.contains(v))
                .collect();
            let Some(&first) = nums.first() else { continue };
            let second = nums.get(1).copied().unwrap_or(first);
            rates.push((m.start(), RateRange::new(Some(first.min(second)), Some(first.max(second)))));
        }
        rates.sort_by_key(|(start, _)| *start);
        rates.into_iter().map(|(_, r)| r).collect()
    }

    fn types_in_line(&self, line: &str) -> Vec<TutorType> {
        let mut types = Vec::new();
        for m in self.tutor_type.find_iter(line) {
            if let Some(t) = tutor_type_for(m.as_str()) {
                if !types.contains(&t) {
                    types.push(t);
                }
            }
        }
        types
    }

    /// Pair tutor types with rates line by line. A line naming types but no rate hands
    /// them to the next line that has rates and no types of its own.
    pub(crate) fn parse(&self, lowered: &str) -> RateSignals {
        let mut typed: Vec<TutorTypeRate> = Vec::new();
        let mut overall = RateRange::default();
        let mut pending: Vec<TutorType> = Vec::new();

        let assign = |types: &[TutorType], rates: &[RateRange], typed: &mut Vec<TutorTypeRate>| {
            if rates.len() == types.len() {
                for (t, r) in types.iter().zip(rates) {
                    typed.push(TutorTypeRate { tutor_type: *t, rate: *r });
                }
            } else {
                let span = rates
                    .iter()
                    .fold(RateRange::default(), |acc, r| acc.span(r));
                for t in types {
                    typed.push(TutorTypeRate { tutor_type: *t, rate: span });
                }
            }
        };

        for line in lowered.lines() {
            let types = self.types_in_line(line);
            let rates = self.rates_in_line(line);
            for r in &rates {
                overall = overall.span(r);
            }

            match (types.is_empty(), rates.is_empty()) {
                (false, false) => {
                    assign(&pending, &[], &mut typed);
                    pending.clear();
                    assign(&types, &rates, &mut typed);
                }
                (false, true) => {
                    assign(&pending, &[], &mut typed);
                    pending = types;
                }
                (true, false) if !pending.is_empty() => {
                    assign(&pending, &rates, &mut typed);
                    pending.clear();
                }
                _ => {}
            }
        }
        assign(&pending, &[], &mut typed);

        let mut merged: Vec<TutorTypeRate> = Vec::new();
        for entry in typed {
            match merged.iter_mut().find(|m| m.tutor_type == entry.tutor_type) {
                Some(existing) => existing.rate = existing.rate.span(&entry.rate),
                None => merged.push(entry),
            }
        }

        RateSignals {
            tutor_types: merged,
            rate: overall,
        }
    }
}
