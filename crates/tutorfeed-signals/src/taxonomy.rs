use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

const EMBEDDED_TAXONOMY: &str = include_str!("../../../rules/subjects.yaml");

#[derive(Debug, Clone, Deserialize)]
pub struct SubjectEntry {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TaxonomyFile {
    version: u32,
    subjects: Vec<SubjectEntry>,
}

/// A subject mention found in lowercased text, as byte offsets into that text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectHit {
    pub start: usize,
    pub end: usize,
    pub name: String,
    /// Set when the alias starts with the word `a` and the remainder is itself an alias:
    /// the subject the text names if that `a` is only the article ("a maths tutor").
    pub article_reading: Option<String>,
}

/// Canonical subject names and the aliases that resolve to them.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    version: u32,
    subjects: Vec<SubjectEntry>,
    /// (alias, subject index), longest alias first.
    ordered: Vec<(String, usize)>,
    lookup: HashMap<String, usize>,
}

fn normalize_alias(alias: &str) -> String {
    alias
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
}

impl Taxonomy {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: TaxonomyFile = serde_yaml::from_str(yaml).context("parsing subject taxonomy")?;
        if file.subjects.is_empty() {
            bail!("subject taxonomy v{} has no subjects", file.version);
        }

        let mut lookup = HashMap::new();
        for (idx, entry) in file.subjects.iter().enumerate() {
            for alias in std::iter::once(&entry.name).chain(entry.aliases.iter()) {
                let alias = normalize_alias(alias);
                if alias.is_empty() {
                    continue;
                }
                if let Some(prev) = lookup.insert(alias.clone(), idx) {
                    if prev != idx {
                        bail!(
                            "alias {alias:?} maps to both {} and {}",
                            file.subjects[prev].name,
                            entry.name
                        );
                    }
                }
            }
        }

        let mut ordered: Vec<(String, usize)> =
            lookup.iter().map(|(a, idx)| (a.clone(), *idx)).collect();
        ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Ok(Self {
            version: file.version,
            subjects: file.subjects,
            ordered,
            lookup,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("loading {}", path.display()))
    }

    /// The taxonomy compiled into the binary from `rules/subjects.yaml`.
    pub fn embedded() -> Result<Self> {
        Self::from_yaml_str(EMBEDDED_TAXONOMY)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn subject_names(&self) -> impl Iterator<Item = &str> {
        self.subjects.iter().map(|s| s.name.as_str())
    }

    /// Resolve a free-form subject name (e.g. from the model) to its canonical form.
    pub fn canonical(&self, name: &str) -> Option<&str> {
        self.lookup
            .get(&normalize_alias(name))
            .map(|idx| self.subjects[*idx].name.as_str())
    }

    /// Whole-word alias matches in `lowered` (ASCII-lowercased text), longest alias first,
    /// non-overlapping, returned in text order.
    pub fn find(&self, lowered: &str) -> Vec<SubjectHit> {
        let bytes = lowered.as_bytes();
        let mut hits: Vec<SubjectHit> = Vec::new();

        for (alias, idx) in &self.ordered {
            for (start, matched) in lowered.match_indices(alias.as_str()) {
                let end = start + matched.len();
                let bounded_left = start == 0 || !is_word_byte(bytes[start - 1]);
                let bounded_right = end == bytes.len() || !is_word_byte(bytes[end]);
                if !bounded_left || !bounded_right {
                    continue;
                }
                if hits.iter().any(|h| start < h.end && h.start < end) {
                    continue;
                }
                let article_reading = alias
                    .strip_prefix("a ")
                    .and_then(|rest| self.lookup.get(rest))
                    .filter(|other| *other != idx)
                    .map(|other| self.subjects[*other].name.clone());
                hits.push(SubjectHit {
                    start,
                    end,
                    name: self.subjects[*idx].name.clone(),
                    article_reading,
                });
            }
        }

        hits.sort_by_key(|h| h.start);
        hits
    }
}
