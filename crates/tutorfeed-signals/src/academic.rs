//! Level, grade and stream tokens, and their segmentation into academic requests.

use regex::Regex;
use tutorfeed_core::{AcademicRequest, Level};

use crate::taxonomy::Taxonomy;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Grade { grade: String, level: Level },
    Level(Level),
    Stream { stream: String, implies: Option<Level> },
    Subject {
        name: String,
        /// Reading to fall back to outside a secondary context.
        article_reading: Option<String>,
    },
}

#[derive(Debug)]
struct Positioned {
    start: usize,
    end: usize,
    token: Token,
}

/// Everything academic found in one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcademicSignals {
    pub requests: Vec<AcademicRequest>,
    /// All subjects mentioned, in text order, context or not.
    pub subjects: Vec<String>,
    pub levels: Vec<Level>,
    pub grades: Vec<String>,
    pub streams: Vec<String>,
    /// Some subject appeared before any level, grade or stream.
    pub ambiguous: bool,
    pub unplaced_subjects: Vec<String>,
}

#[derive(Debug, Default)]
struct Context {
    level: Option<Level>,
    grade: Option<String>,
    stream: Option<String>,
    subjects: Vec<String>,
}

impl Context {
    fn into_request(self) -> Option<AcademicRequest> {
        if self.subjects.is_empty() {
            return None;
        }
        Some(AcademicRequest {
            level: self.level,
            specific_grade: self.grade,
            stream: self.stream,
            subjects: self.subjects,
        })
    }
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

#[derive(Debug)]
pub(crate) struct AcademicParser {
    grade: Regex,
    level: Regex,
    stream: Regex,
}

impl AcademicParser {
    pub(crate) fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            grade: Regex::new(
                r"\b(?:(?:primary|pri|p)\s*(?P<p>[1-6])|(?:secondary|sec)\s*(?P<s>[1-5])|jc\s*(?P<j>[12])|(?:kindergarten|kinder)\s*(?P<k>[12])|nursery\s*(?P<n>[12])|(?P<kn>[kn])(?P<kn_n>[12]))\b",
            )?,
            level: Regex::new(
                r"\b(pre[- ]?school|kindergarten|nursery|primary|pri|secondary|sec|o[- ]levels?|junior college|jc|a[- ]levels?|igcse|ib|polytechnic|poly|university|uni|adult)\b",
            )?,
            stream: Regex::new(
                r"\b(ip|integrated programme|express|normal academic|normal technical|na|nt|g[1-3]|h[1-3]|hl|sl)\b",
            )?,
        })
    }

    fn tokens(&self, text: &str, lowered: &str, taxonomy: &Taxonomy) -> Vec<Positioned> {
        let mut tokens: Vec<Positioned> = Vec::new();
        let overlaps = |tokens: &[Positioned], start: usize, end: usize| {
            tokens.iter().any(|t| start < t.end && t.start < end)
        };

        for hit in taxonomy.find(lowered) {
            let article_reading = hit
                .article_reading
                .filter(|_| !written_as_subject(text, hit.start, hit.end));
            tokens.push(Positioned {
                start: hit.start,
                end: hit.end,
                token: Token::Subject {
                    name: hit.name,
                    article_reading,
                },
            });
        }

        // Bare `k1`/`n2` also occur in addresses; start offsets of those kept tentatively.
        let mut bare_preschool = Vec::new();
        for caps in self.grade.captures_iter(lowered) {
            let Some(whole) = caps.get(0) else { continue };
            if overlaps(&tokens, whole.start(), whole.end()) {
                continue;
            }
            let (grade, level) = if let Some(n) = caps.name("p") {
                (format!("P{}", n.as_str()), Level::Primary)
            } else if let Some(n) = caps.name("s") {
                (format!("Sec {}", n.as_str()), Level::Secondary)
            } else if let Some(n) = caps.name("j") {
                (format!("JC{}", n.as_str()), Level::JuniorCollege)
            } else if let Some(n) = caps.name("k") {
                (format!("K{}", n.as_str()), Level::PreSchool)
            } else if let Some(n) = caps.name("n") {
                (format!("N{}", n.as_str()), Level::PreSchool)
            } else if let (Some(prefix), Some(n)) = (caps.name("kn"), caps.name("kn_n")) {
                bare_preschool.push(whole.start());
                (
                    format!("{}{}", prefix.as_str().to_ascii_uppercase(), n.as_str()),
                    Level::PreSchool,
                )
            } else {
                continue;
            };
            tokens.push(Positioned {
                start: whole.start(),
                end: whole.end(),
                token: Token::Grade { grade, level },
            });
        }

        for m in self.level.find_iter(lowered) {
            if overlaps(&tokens, m.start(), m.end()) {
                continue;
            }
            let word = m.as_str();
            let level = if word.starts_with("o") && word.contains("level") {
                Level::Secondary
            } else if word.starts_with("a") && word.contains("level") {
                Level::JuniorCollege
            } else if word.starts_with("adult") {
                Level::Adult
            } else {
                match word.parse::<Level>() {
                    Ok(level) => level,
                    Err(_) => continue,
                }
            };
            tokens.push(Positioned {
                start: m.start(),
                end: m.end(),
                token: Token::Level(level),
            });
        }

        for m in self.stream.find_iter(lowered) {
            if overlaps(&tokens, m.start(), m.end()) {
                continue;
            }
            let (stream, implies) = normalize_stream(m.as_str());
            tokens.push(Positioned {
                start: m.start(),
                end: m.end(),
                token: Token::Stream { stream, implies },
            });
        }

        tokens.sort_by_key(|t| t.start);
        if bare_preschool.is_empty() {
            return tokens;
        }

        // A bare preschool grade stands when preschool is named elsewhere or a subject follows it.
        let preschool_named = tokens
            .iter()
            .any(|t| t.token == Token::Level(Level::PreSchool));
        let mut kept: Vec<Positioned> = Vec::with_capacity(tokens.len());
        let mut iter = tokens.into_iter().peekable();
        while let Some(t) = iter.next() {
            if bare_preschool.contains(&t.start) && !preschool_named {
                let subject_follows = iter.peek().is_some_and(|next| {
                    matches!(next.token, Token::Subject { .. })
                        && lowered
                            .get(t.end..next.start)
                            .is_some_and(|gap| gap.chars().all(|c| c.is_whitespace() || c == ','))
                });
                if !subject_follows {
                    continue;
                }
            }
            kept.push(t);
        }
        kept
    }

    /// Walk tokens in text order. A new context starts whenever level, grade or stream
    /// changes after subjects were collected for the current one.
    /// `lowered` must be `text.to_ascii_lowercase()` so byte offsets line up.
    pub(crate) fn parse(&self, text: &str, lowered: &str, taxonomy: &Taxonomy) -> AcademicSignals {
        let mut out = AcademicSignals::default();
        let mut current: Option<Context> = None;

        let flush = |ctx: Option<Context>, out: &mut AcademicSignals| {
            if let Some(request) = ctx.and_then(Context::into_request) {
                out.requests.push(request);
            }
        };

        for Positioned { token, .. } in self.tokens(text, lowered, taxonomy) {
            match token {
                Token::Grade { grade, level } => {
                    push_unique(&mut out.levels, level);
                    push_unique(&mut out.grades, grade.clone());
                    let carried_stream = current
                        .as_ref()
                        .filter(|c| c.level == Some(level) && c.subjects.is_empty())
                        .and_then(|c| c.stream.clone());
                    flush(current.take(), &mut out);
                    current = Some(Context {
                        level: Some(level),
                        grade: Some(grade),
                        stream: carried_stream,
                        subjects: Vec::new(),
                    });
                }
                Token::Level(level) => {
                    push_unique(&mut out.levels, level);
                    let same_level_open = current
                        .as_ref()
                        .is_some_and(|c| c.level == Some(level) && c.subjects.is_empty());
                    if same_level_open {
                        continue;
                    }
                    flush(current.take(), &mut out);
                    current = Some(Context {
                        level: Some(level),
                        ..Context::default()
                    });
                }
                Token::Stream { stream, implies } => {
                    let ctx_level = current.as_ref().and_then(|c| c.level);
                    if matches!(stream.as_str(), "NA" | "NT")
                        && ctx_level != Some(Level::Secondary)
                    {
                        continue;
                    }
                    push_unique(&mut out.streams, stream.clone());
                    match current.as_mut() {
                        Some(ctx) if ctx.subjects.is_empty() => {
                            ctx.stream = Some(stream);
                            if ctx.level.is_none() {
                                ctx.level = implies;
                            }
                        }
                        Some(ctx) => {
                            let next = Context {
                                level: ctx.level.or(implies),
                                grade: ctx.grade.clone(),
                                stream: Some(stream),
                                subjects: Vec::new(),
                            };
                            flush(current.replace(next), &mut out);
                        }
                        None => {
                            current = Some(Context {
                                level: implies,
                                stream: Some(stream),
                                ..Context::default()
                            });
                        }
                    }
                }
                Token::Subject {
                    name,
                    article_reading,
                } => {
                    let secondary = current
                        .as_ref()
                        .is_some_and(|c| c.level == Some(Level::Secondary));
                    let name = match article_reading {
                        Some(reading) if !secondary => reading,
                        _ => name,
                    };
                    push_unique(&mut out.subjects, name.clone());
                    match current.as_mut() {
                        Some(ctx) => push_unique(&mut ctx.subjects, name),
                        None => {
                            out.ambiguous = true;
                            push_unique(&mut out.unplaced_subjects, name);
                        }
                    }
                }
            }
        }
        flush(current.take(), &mut out);
        out
    }
}

/// "A Maths" with both words capitalized, away from the start of a sentence.
fn written_as_subject(text: &str, start: usize, end: usize) -> bool {
    let Some(original) = text.get(start..end) else {
        return false;
    };
    let mut words = original.split_whitespace();
    let capitalized = words.next() == Some("A")
        && words
            .next()
            .and_then(|w| w.chars().next())
            .is_some_and(|c| c.is_ascii_uppercase());
    let sentence_start = text
        .get(..start)
        .unwrap_or_default()
        .trim_end_matches([' ', '\t'])
        .chars()
        .last()
        .map_or(true, |c| matches!(c, '\n' | '.' | '!' | '?'));
    capitalized && !sentence_start
}

fn normalize_stream(word: &str) -> (String, Option<Level>) {
    match word {
        "ip" | "integrated programme" => ("IP".to_string(), Some(Level::Secondary)),
        "express" => ("Express".to_string(), Some(Level::Secondary)),
        "na" | "normal academic" => ("NA".to_string(), Some(Level::Secondary)),
        "nt" | "normal technical" => ("NT".to_string(), Some(Level::Secondary)),
        "hl" | "sl" => (word.to_ascii_uppercase(), Some(Level::Ib)),
        w if w.starts_with('g') => (w.to_ascii_uppercase(), Some(Level::Secondary)),
        w if w.starts_with('h') => (w.to_ascii_uppercase(), Some(Level::JuniorCollege)),
        w => (w.to_ascii_uppercase(), None),
    }
}
