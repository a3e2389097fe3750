//! Matching rules deciding whether a registry candidate names a localized artist.
//!
//! Everything here is a pure function of its inputs: the same localized name
//! and candidate list always produce the same outcome, so decisions can be
//! cached and tested without a network.

use std::collections::BTreeSet;

use crate::lookup::LookupCandidate;
use crate::protocol::ResolutionStatus;

pub const DEFAULT_MIN_SCORE: u8 = 80;

/// Writing-system family used as cross-script evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScriptFamily {
    Latin,
    Kana,
    Han,
    Hangul,
    Cyrillic,
    Greek,
    Other,
}

/// Why no candidate was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    NoCandidates,
    NoEvidence,
    Ambiguous,
}

impl NotFoundReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoCandidates => "no_candidates",
            Self::NoEvidence => "no_evidence",
            Self::Ambiguous => "ambiguous",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched {
        canonical_name: String,
        registry_id: String,
        status: ResolutionStatus,
    },
    NotFound(NotFoundReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EvidenceTier {
    None,
    CrossScript,
    Exact,
}

/// Selects the canonical name for a localized artist among lookup candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchingEngine {
    min_score: u8,
}

impl Default for MatchingEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SCORE)
    }
}

impl MatchingEngine {
    /// `min_score` is the lowest registry score accepted without exact name evidence.
    pub fn new(min_score: u8) -> Self {
        Self { min_score }
    }

    pub fn resolve(&self, localized_name: &str, candidates: &[LookupCandidate]) -> MatchOutcome {
        if candidates.is_empty() {
            return MatchOutcome::NotFound(NotFoundReason::NoCandidates);
        }

        let localized_key = comparison_key(localized_name);
        let localized_scripts = script_families(localized_name);

        let exact: Vec<&LookupCandidate> = candidates
            .iter()
            .filter(|candidate| {
                evidence_tier(&localized_key, &localized_scripts, candidate) == EvidenceTier::Exact
            })
            .collect();
        if let Some(best_score) = exact.iter().map(|candidate| candidate.score).max() {
            let best: Vec<&LookupCandidate> = exact
                .into_iter()
                .filter(|candidate| candidate.score == best_score)
                .collect();
            let first = best[0];
            let first_key = comparison_key(&first.primary_name);
            if best
                .iter()
                .any(|candidate| comparison_key(&candidate.primary_name) != first_key)
            {
                return MatchOutcome::NotFound(NotFoundReason::Ambiguous);
            }
            return matched(localized_name, first);
        }

        let Some(top) = top_ranked(candidates) else {
            return MatchOutcome::NotFound(NotFoundReason::Ambiguous);
        };
        if top.score < self.min_score {
            return MatchOutcome::NotFound(NotFoundReason::NoEvidence);
        }
        match evidence_tier(&localized_key, &localized_scripts, top) {
            EvidenceTier::CrossScript => matched(localized_name, top),
            EvidenceTier::Exact | EvidenceTier::None => {
                MatchOutcome::NotFound(NotFoundReason::NoEvidence)
            }
        }
    }
}

/// Decides identical vs different for a localized/canonical name pair.
pub fn classify(localized_name: &str, canonical_name: &str) -> ResolutionStatus {
    if comparison_key(localized_name) == comparison_key(canonical_name) {
        ResolutionStatus::MatchedIdentical
    } else {
        ResolutionStatus::MatchedDifferent
    }
}

/// Case-folds and strips everything but letters and digits.
///
/// Full-width ASCII forms are folded to ASCII first, so `ＹＥＳ` and `yes`
/// normalize the same way.
pub fn normalize(value: &str) -> String {
    let mut normalized = String::with_capacity(value.len());
    for ch in value.chars().map(fold_full_width) {
        for lowered in ch.to_lowercase() {
            if lowered.is_alphanumeric() {
                normalized.push(lowered);
            }
        }
    }
    normalized
}

/// Script families of the letters in `value`. Digits and punctuation carry none.
pub fn script_families(value: &str) -> BTreeSet<ScriptFamily> {
    value
        .chars()
        .map(fold_full_width)
        .filter_map(script_family)
        .collect()
}

fn comparison_key(value: &str) -> String {
    let normalized = normalize(value);
    if normalized.is_empty() {
        value.trim().to_lowercase()
    } else {
        normalized
    }
}

fn fold_full_width(ch: char) -> char {
    match ch {
        '\u{FF01}'..='\u{FF5E}' => char::from_u32(ch as u32 - 0xFEE0).unwrap_or(ch),
        '\u{3000}' => ' ',
        _ => ch,
    }
}

fn script_family(ch: char) -> Option<ScriptFamily> {
    match ch {
        'a'..='z' | 'A'..='Z' | '\u{00C0}'..='\u{024F}' | '\u{1E00}'..='\u{1EFF}' => {
            Some(ScriptFamily::Latin)
        }
        '\u{3040}'..='\u{30FF}' | '\u{31F0}'..='\u{31FF}' | '\u{FF66}'..='\u{FF9F}' => {
            // The katakana middle dot is a separator, not a letter.
            (ch != '\u{30FB}').then_some(ScriptFamily::Kana)
        }
        '\u{3400}'..='\u{4DBF}' | '\u{4E00}'..='\u{9FFF}' | '\u{F900}'..='\u{FAFF}' | '\u{3005}' => {
            Some(ScriptFamily::Han)
        }
        '\u{1100}'..='\u{11FF}' | '\u{3130}'..='\u{318F}' | '\u{AC00}'..='\u{D7AF}' => {
            Some(ScriptFamily::Hangul)
        }
        '\u{0400}'..='\u{04FF}' => Some(ScriptFamily::Cyrillic),
        '\u{0370}'..='\u{03FF}' => Some(ScriptFamily::Greek),
        _ if ch.is_alphabetic() => Some(ScriptFamily::Other),
        _ => None,
    }
}

fn candidate_names(candidate: &LookupCandidate) -> impl Iterator<Item = &str> {
    std::iter::once(candidate.primary_name.as_str())
        .chain(candidate.aliases.iter().map(String::as_str))
}

fn evidence_tier(
    localized_key: &str,
    localized_scripts: &BTreeSet<ScriptFamily>,
    candidate: &LookupCandidate,
) -> EvidenceTier {
    if candidate_names(candidate).any(|name| comparison_key(name) == localized_key) {
        return EvidenceTier::Exact;
    }
    if localized_scripts.is_empty() {
        return EvidenceTier::None;
    }
    let shares_script = candidate_names(candidate)
        .any(|name| !script_families(name).is_disjoint(localized_scripts));
    if shares_script {
        EvidenceTier::None
    } else {
        EvidenceTier::CrossScript
    }
}

/// Highest-scored candidate, or `None` when the top score is shared.
fn top_ranked(candidates: &[LookupCandidate]) -> Option<&LookupCandidate> {
    let best_score = candidates.iter().map(|candidate| candidate.score).max()?;
    let mut top = candidates
        .iter()
        .filter(|candidate| candidate.score == best_score);
    let first = top.next()?;
    if top.next().is_some() {
        return None;
    }
    Some(first)
}

fn matched(localized_name: &str, candidate: &LookupCandidate) -> MatchOutcome {
    let status = classify(localized_name, &candidate.primary_name);
    let canonical_name = match status {
        ResolutionStatus::MatchedIdentical => localized_name.to_string(),
        _ => candidate.primary_name.clone(),
    };
    MatchOutcome::Matched {
        canonical_name,
        registry_id: candidate.registry_id.clone(),
        status,
    }
}
