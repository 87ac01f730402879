use tutorfeed_core::{MessageKey, RawMessage, SkipReason};

/// What the worker does with a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Skip(SkipReason),
    /// Finish as skipped (reply) after refreshing the parent's freshness metadata.
    Bump { parent: MessageKey },
    Extract,
}

impl RouteDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteDecision::Skip(_) => "skip",
            RouteDecision::Bump { .. } => "bump",
            RouteDecision::Extract => "extract",
        }
    }
}

/// Decide from the stored raw row alone. Edits take the `Extract` path like new posts.
pub fn route(raw: Option<&RawMessage>) -> RouteDecision {
    let Some(raw) = raw else {
        return RouteDecision::Skip(SkipReason::RawMissing);
    };
    if raw.is_forward {
        return RouteDecision::Skip(SkipReason::Forward);
    }
    if raw.is_reply {
        return match raw.parent_key() {
            Some(parent) => RouteDecision::Bump { parent },
            None => RouteDecision::Skip(SkipReason::Reply),
        };
    }
    if raw.text.trim().is_empty() {
        return RouteDecision::Skip(SkipReason::EmptyText);
    }
    RouteDecision::Extract
}
