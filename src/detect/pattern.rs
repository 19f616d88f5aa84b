//! Known error/incident signatures.
//!
//! The library is ordered: lower priority numbers are tried first and equal
//! priorities keep registration order. The first signature that matches a
//! record wins.

use crate::detect::{AnomalyCandidate, DetectorKind};
use crate::features::FeatureSet;
use crate::record::Record;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature '{id}' has an invalid pattern: {source}")]
    InvalidPattern {
        id: String,
        #[source]
        source: regex::Error,
    },

    #[error("signature '{id}' weight {weight} is outside [0, 1]")]
    InvalidWeight { id: String, weight: f64 },

    #[error("duplicate signature id '{0}'")]
    DuplicateId(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Matcher {
    Regex {
        pattern: String,
    },
    Literal {
        text: String,
        #[serde(default)]
        case_insensitive: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub id: String,
    pub name: String,
    pub matcher: Matcher,
    /// Lower runs first.
    pub priority: i32,
    /// Base severity weight in `[0, 1]`.
    pub weight: f64,
    pub category: String,
}

enum CompiledMatcher {
    Regex(Regex),
    Literal { needle: String, case_insensitive: bool },
}

impl CompiledMatcher {
    fn find(&self, text: &str) -> Option<String> {
        match self {
            CompiledMatcher::Regex(re) => re.find(text).map(|m| m.as_str().to_string()),
            CompiledMatcher::Literal {
                needle,
                case_insensitive: true,
            } => text.to_lowercase().contains(needle.as_str()).then(|| needle.clone()),
            CompiledMatcher::Literal { needle, .. } => {
                text.contains(needle.as_str()).then(|| needle.clone())
            }
        }
    }
}

struct Entry {
    signature: Signature,
    matcher: CompiledMatcher,
}

/// Compiled, ordered signature library. Read-only once built; shared across jobs.
pub struct SignatureLibrary {
    entries: Vec<Entry>,
}

impl SignatureLibrary {
    pub fn new(signatures: Vec<Signature>) -> Result<Self, SignatureError> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(signatures.len());

        for signature in signatures {
            if !seen.insert(signature.id.clone()) {
                return Err(SignatureError::DuplicateId(signature.id));
            }
            if !(0.0..=1.0).contains(&signature.weight) {
                return Err(SignatureError::InvalidWeight {
                    id: signature.id,
                    weight: signature.weight,
                });
            }
            let matcher = match &signature.matcher {
                Matcher::Regex { pattern } => {
                    let re = Regex::new(pattern).map_err(|source| SignatureError::InvalidPattern {
                        id: signature.id.clone(),
                        source,
                    })?;
                    CompiledMatcher::Regex(re)
                }
                Matcher::Literal {
                    text,
                    case_insensitive,
                } => CompiledMatcher::Literal {
                    needle: if *case_insensitive {
                        text.to_lowercase()
                    } else {
                        text.clone()
                    },
                    case_insensitive: *case_insensitive,
                },
            };
            entries.push(Entry { signature, matcher });
        }

        // Stable: equal priorities keep registration order.
        entries.sort_by_key(|e| e.signature.priority);
        Ok(Self { entries })
    }

    /// The compiled built-in library.
    pub fn builtin() -> Self {
        Self::new(default_signatures()).expect("built-in signature library is valid")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Signatures in match order.
    pub fn signatures(&self) -> impl Iterator<Item = &Signature> {
        self.entries.iter().map(|e| &e.signature)
    }

    /// First signature matching `text`, with the matched excerpt.
    pub fn first_match(&self, text: &str) -> Option<(&Signature, String)> {
        self.entries
            .iter()
            .find_map(|e| e.matcher.find(text).map(|m| (&e.signature, m)))
    }
}

pub struct PatternDetector<'a> {
    library: &'a SignatureLibrary,
}

impl<'a> PatternDetector<'a> {
    pub fn new(library: &'a SignatureLibrary) -> Self {
        Self { library }
    }

    /// One candidate per matching record. `features` must be extracted from
    /// `records` in the same order.
    pub fn detect(&self, records: &[Record], features: &FeatureSet) -> Vec<AnomalyCandidate> {
        let found: Vec<AnomalyCandidate> = records
            .iter()
            .zip(&features.vectors)
            .filter_map(|(record, vector)| {
                let (signature, matched) = self.library.first_match(&record.raw_text)?;
                Some(AnomalyCandidate {
                    record_id: record.id.clone(),
                    related_records: Vec::new(),
                    detector_kind: DetectorKind::Pattern,
                    category: vector.category.clone(),
                    raw_score: signature.weight,
                    evidence: serde_json::json!({
                        "signature_id": signature.id,
                        "signature_name": signature.name,
                        "signature_category": signature.category,
                        "matched": matched,
                    }),
                    rationale: None,
                })
            })
            .collect();
        info!(records = records.len(), matches = found.len(), signatures = self.library.len(), "pattern matching complete");
        found
    }
}

fn regex_sig(id: &str, name: &str, pattern: &str, priority: i32, weight: f64, category: &str) -> Signature {
    Signature {
        id: id.to_string(),
        name: name.to_string(),
        matcher: Matcher::Regex {
            pattern: pattern.to_string(),
        },
        priority,
        weight,
        category: category.to_string(),
    }
}

/// The signature library shipped with the engine.
pub fn default_signatures() -> Vec<Signature> {
    vec![
        regex_sig("oom", "Out of memory", r"(?i)\b(out of memory|oom[- ]?kill(ed|er)?|cannot allocate memory|memory allocation failed)\b", 10, 0.9, "resource"),
        regex_sig("panic", "Process crash", r"(?i)\b(panic(ked)?|segmentation fault|segfault|core dumped|fatal error)\b", 10, 0.85, "crash"),
        regex_sig("disk-full", "Disk full", r"(?i)\b(no space left on device|disk (is )?full|quota exceeded)\b", 20, 0.8, "resource"),
        regex_sig("auth-failure", "Authentication failure", r"(?i)\b(authentication failed|invalid credentials|permission denied|unauthorized)\b", 30, 0.55, "security"),
        regex_sig("conn-refused", "Connection refused", r"(?i)\bconnection (refused|reset)\b", 40, 0.6, "network"),
        regex_sig("timeout", "Timeout", r"(?i)\b(timed? ?out|deadline exceeded)\b", 40, 0.5, "network"),
        regex_sig("service-unavailable", "Service unavailable", r"(?i)\b(service unavailable|bad gateway|gateway timeout)\b", 50, 0.55, "availability"),
        regex_sig("deadlock", "Deadlock", r"(?i)\bdeadlock( detected)?\b", 50, 0.7, "database"),
        regex_sig("exception", "Unhandled exception", r"(Traceback \(most recent call last\)|\bUnhandled exception\b|\bException in thread\b)", 60, 0.5, "application"),
        regex_sig("rate-limit", "Rate limit exceeded", r"(?i)\b(rate limit exceeded|too many requests)\b", 70, 0.4, "availability"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{default_grouping, FeatureExtractor};
    use chrono::Utc;

    fn literal(id: &str, text: &str, priority: i32, weight: f64) -> Signature {
        Signature {
            id: id.to_string(),
            name: id.to_string(),
            matcher: Matcher::Literal {
                text: text.to_string(),
                case_insensitive: true,
            },
            priority,
            weight,
            category: "test".to_string(),
        }
    }

    #[test]
    fn test_builtin_library_compiles() {
        let library = SignatureLibrary::builtin();
        assert_eq!(library.len(), default_signatures().len());
        let (sig, _) = library.first_match("ERROR dial tcp: connection refused").unwrap();
        assert_eq!(sig.id, "conn-refused");
        assert!(library.first_match("GET /health 200").is_none());
    }

    #[test]
    fn test_priority_then_registration_order() {
        let library = SignatureLibrary::new(vec![
            literal("late", "failed", 5, 0.3),
            literal("first-registered", "disk", 1, 0.4),
            literal("second-registered", "disk", 1, 0.9),
        ])
        .unwrap();
        let (sig, matched) = library.first_match("Disk write FAILED").unwrap();
        assert_eq!(sig.id, "first-registered");
        assert_eq!(matched, "disk");
        let order: Vec<&str> = library.signatures().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["first-registered", "second-registered", "late"]);
    }

    #[test]
    fn test_invalid_signatures_rejected() {
        let bad_regex = regex_sig("broken", "broken", "(unclosed", 1, 0.5, "x");
        assert!(matches!(
            SignatureLibrary::new(vec![bad_regex]),
            Err(SignatureError::InvalidPattern { .. })
        ));
        assert!(matches!(
            SignatureLibrary::new(vec![literal("w", "x", 1, 1.5)]),
            Err(SignatureError::InvalidWeight { .. })
        ));
        assert!(matches!(
            SignatureLibrary::new(vec![literal("d", "x", 1, 0.1), literal("d", "y", 2, 0.1)]),
            Err(SignatureError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_detector_scores_with_signature_weight() {
        let now = Utc::now();
        let records = vec![
            Record::new("a", now, "app", "worker panicked at index out of bounds"),
            Record::new("b", now, "app", "request served"),
            Record::new("c", now, "app", "kernel: Out of memory: Killed process 4121"),
        ];
        let features = FeatureExtractor::new(default_grouping()).extract(&records).unwrap();
        let library = SignatureLibrary::builtin();
        let found = PatternDetector::new(&library).detect(&records, &features);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].record_id, "a");
        assert_eq!(found[0].raw_score, 0.85);
        assert_eq!(found[0].evidence["signature_id"], "panic");
        assert_eq!(found[1].record_id, "c");
        assert_eq!(found[1].evidence["signature_id"], "oom");
        assert_eq!(found[1].category, features.vectors[2].category);
    }
}
