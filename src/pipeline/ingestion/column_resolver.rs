//! Header resolution for exports whose column names vary between studies.
//!
//! Matching runs in three passes and the first hit wins:
//! exact (case-insensitive, trimmed) → substring → domain synonym.

use std::fmt;

/// A column concept the pipeline knows how to look for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Concept {
    Site,
    Country,
    Region,
    Query,
    AdverseEvent,
    Missing,
}

impl Concept {
    /// Broader clinical vocabulary used as a last resort, matched by substring
    pub fn synonyms(&self) -> &'static [&'static str] {
        match self {
            Concept::Site => &["center", "loc", "stn", "investigator", "hosp", "medical", "point"],
            Concept::Country => &["nation", "ctry", "geo", "territory", "market"],
            Concept::Region => &[],
            Concept::Query => &["clarification", "discrepancy", "flag", "question", "dc", "pending"],
            Concept::AdverseEvent => &["safety", "serious", "event", "adverse", "ae", "harm"],
            Concept::Missing => &["gap", "lost", "null", "void", "empty", "unavailable"],
        }
    }
}

impl fmt::Display for Concept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Concept::Site => "site",
            Concept::Country => "country",
            Concept::Region => "region",
            Concept::Query => "query",
            Concept::AdverseEvent => "adverse_event",
            Concept::Missing => "missing",
        };
        write!(f, "{}", name)
    }
}

/// Which pass produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    Exact,
    Substring,
    Synonym,
}

/// A resolved header together with the pass that found it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedColumn {
    /// Index of the header within the header row
    pub index: usize,
    /// The header text exactly as it appears in the source
    pub header: String,
    pub matched_by: MatchKind,
}

/// Resolve `concept` against `headers`, returning the matching header's position.
///
/// Ties are broken by alias order first, then by header order. Never fails;
/// `None` means the concept is absent from this table.
pub fn resolve(concept: Concept, aliases: &[&str], headers: &[String]) -> Option<ResolvedColumn> {
    let lowered: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();
    let hit = |index: usize, matched_by: MatchKind| ResolvedColumn {
        index,
        header: headers[index].clone(),
        matched_by,
    };

    for alias in aliases {
        let alias = alias.trim().to_lowercase();
        if let Some(i) = lowered.iter().position(|h| *h == alias) {
            return Some(hit(i, MatchKind::Exact));
        }
    }

    for alias in aliases {
        let alias = alias.trim().to_lowercase();
        if alias.is_empty() {
            continue;
        }
        if let Some(i) = lowered.iter().position(|h| h.contains(&alias)) {
            return Some(hit(i, MatchKind::Substring));
        }
    }

    for synonym in concept.synonyms() {
        if let Some(i) = lowered.iter().position(|h| h.contains(synonym)) {
            return Some(hit(i, MatchKind::Synonym));
        }
    }

    None
}

/// Convenience wrapper returning only the header text
pub fn resolve_column(concept: Concept, aliases: &[&str], headers: &[String]) -> Option<String> {
    resolve(concept, aliases, headers).map(|r| r.header)
}
