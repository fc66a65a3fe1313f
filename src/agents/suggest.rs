//! Weighted agent-to-task suggestion scoring.
//!
//! Four independently normalized (0..1) factors with fixed weights summing
//! to 1.0. Pure and deterministic: repeated calls against unchanged state
//! return an identical ordering, ties break on agent id.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::agents::model::{Agent, AgentStatus};
use crate::tasks::model::Task;

pub const WEIGHT_SPECIALIZATION: f64 = 0.35;
pub const WEIGHT_EPIC_HISTORY: f64 = 0.25;
pub const WEIGHT_IDLE_RECENCY: f64 = 0.20;
pub const WEIGHT_ESTIMATION: f64 = 0.20;

/// Per-factor normalized scores for one candidate.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub specialization: f64,
    pub epic_history: f64,
    pub idle_recency: f64,
    pub estimation: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuggestedAgent {
    pub agent_id: String,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Skill tags the task asks for: its own tags when present, otherwise
/// tokens inferred from the title and epic label.
pub(crate) fn required_tags(task: &Task) -> HashSet<String> {
    let explicit = task.tag_list();
    if !explicit.is_empty() {
        return explicit.into_iter().map(|t| t.to_lowercase()).collect();
    }
    let mut inferred: HashSet<String> = task
        .title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(|w| w.to_lowercase())
        .collect();
    if let Some(ref epic) = task.epic {
        inferred.insert(epic.to_lowercase());
    }
    inferred
}

pub(crate) fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.union(b).count();
    inter as f64 / union as f64
}

/// Estimation-accuracy track record: 1.0 at a perfect actual/estimated ratio,
/// falling off linearly; agents with no history score a neutral 0.5.
pub(crate) fn estimation_accuracy(ratio: Option<f64>) -> f64 {
    match ratio {
        None => 0.5,
        Some(r) => (1.0 - (r - 1.0).abs()).clamp(0.0, 1.0),
    }
}

/// Rank all Idle agents for the task. Agents in any other state are skipped;
/// an empty slice (not an error) comes back when nobody is Idle.
///
/// `epic_completed` maps agent id → number of tasks that agent completed in
/// the task's epic; `now` anchors idle-duration measurement.
pub fn rank(
    task: &Task,
    agents: &[Agent],
    epic_completed: &HashMap<String, i64>,
    now: i64,
) -> Vec<SuggestedAgent> {
    let wanted = required_tags(task);

    let idle: Vec<&Agent> = agents
        .iter()
        .filter(|a| a.status == AgentStatus::Idle)
        .collect();
    if idle.is_empty() {
        return Vec::new();
    }

    let max_idle = idle
        .iter()
        .map(|a| (now - a.last_status_change).max(0))
        .max()
        .unwrap_or(0);
    let max_epic = idle
        .iter()
        .map(|a| epic_completed.get(&a.id).copied().unwrap_or(0))
        .max()
        .unwrap_or(0);

    let mut ranked: Vec<SuggestedAgent> = idle
        .into_iter()
        .map(|agent| {
            let tags: HashSet<String> = agent
                .tag_list()
                .into_iter()
                .map(|t| t.to_lowercase())
                .collect();

            let specialization = jaccard(&wanted, &tags);
            let epic_history = if max_epic == 0 {
                0.0
            } else {
                epic_completed.get(&agent.id).copied().unwrap_or(0) as f64 / max_epic as f64
            };
            // Favor agents idle longest, to spread load.
            let idle_recency = if max_idle == 0 {
                0.0
            } else {
                (now - agent.last_status_change).max(0) as f64 / max_idle as f64
            };
            let estimation = estimation_accuracy(agent.est_ratio_avg);

            let score = WEIGHT_SPECIALIZATION * specialization
                + WEIGHT_EPIC_HISTORY * epic_history
                + WEIGHT_IDLE_RECENCY * idle_recency
                + WEIGHT_ESTIMATION * estimation;

            SuggestedAgent {
                agent_id: agent.id.clone(),
                score,
                breakdown: ScoreBreakdown {
                    specialization,
                    epic_history,
                    idle_recency,
                    estimation,
                },
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.agent_id.cmp(&b.agent_id))
    });
    ranked
}
