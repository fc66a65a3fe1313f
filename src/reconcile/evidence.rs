// SPDX-License-Identifier: MIT
//! Evidence model and the pure matching passes.
//!
//! Pass 1 looks for a task id written verbatim in the evidence title/path.
//! Pass 2 (only when pass 1 finds nothing) scores the evidence title against
//! open task titles with a fuzzy matcher, normalized by each title's
//! self-match score so the threshold is length-independent.

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A candidate survives the fuzzy pass at or above this normalized score.
pub const FUZZY_THRESHOLD: f64 = 0.6;

static TASK_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bT-\d+\b").expect("static pattern"));

/// Pre-extracted evidence from the external source. Consumed, never
/// produced, by this core; document parsing is the source's problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvidence {
    /// Opaque reference back into the evidence source (path, URL, id).
    pub source_ref: String,
    /// Extracted title/path text — the pass-1 search space.
    pub title: String,
    /// Extracted body text.
    pub body: String,
}

/// Distinct task ids embedded in the evidence title, in order of appearance.
pub fn embedded_task_ids(evidence: &CompletionEvidence) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    TASK_ID_RE
        .find_iter(&evidence.title)
        .map(|m| m.as_str().to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Normalized fuzzy score of `task_title` inside `evidence_title` (0..1).
fn normalized_score(matcher: &SkimMatcherV2, evidence_title: &str, task_title: &str) -> f64 {
    let Some(self_score) = matcher.fuzzy_match(task_title, task_title) else {
        return 0.0;
    };
    if self_score <= 0 {
        return 0.0;
    }
    match matcher.fuzzy_match(evidence_title, task_title) {
        Some(score) => score as f64 / self_score as f64,
        None => 0.0,
    }
}

/// Open-task candidates at or above [`FUZZY_THRESHOLD`], best first, ties on
/// task id for determinism.
pub fn fuzzy_candidates(
    evidence_title: &str,
    open_tasks: &[(String, String)],
) -> Vec<(String, f64)> {
    let matcher = SkimMatcherV2::default();
    let mut hits: Vec<(String, f64)> = open_tasks
        .iter()
        .filter_map(|(id, title)| {
            let score = normalized_score(&matcher, evidence_title, title);
            (score >= FUZZY_THRESHOLD).then(|| (id.clone(), score))
        })
        .collect();
    hits.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    hits
}
