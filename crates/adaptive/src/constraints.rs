//! Converts sampled rankings into safe, stable layouts.
//!
//! The sampler is free to propose any ordering; this layer decides how
//! much of it the user actually sees. Rules run in a fixed precedence and
//! the first match wins; a blocked move holds the feature at its baseline
//! position. A cycle that blocks more than half of its arms is judged
//! unstable and reverts to the baseline order outright.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use pulseboard_core::{AdaptationAction, AdaptationConfig, PlanContext};

use crate::arms::BanditArm;
use crate::store::AdaptationDecisionLog;

/// Bookkeeping the planner must persist for a granted move.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub feature_key: String,
    pub action: AdaptationAction,
}

/// Result of one constraint evaluation cycle.
#[derive(Debug, Clone)]
pub struct ConstraintOutcome {
    pub order: Vec<String>,
    pub actions: HashMap<String, AdaptationAction>,
    pub constraints_applied: Vec<String>,
    pub decisions: Vec<AdaptationDecisionLog>,
    pub mutations: Vec<PendingMutation>,
    pub safety_valve: bool,
}

struct Candidate {
    feature: String,
    baseline: usize,
    sampled: f64,
    sort_key: f64,
    rank: usize,
    action: AdaptationAction,
    pinned: bool,
    constraint: Option<&'static str>,
}

pub struct ConstraintEngine {
    config: Arc<AdaptationConfig>,
}

impl ConstraintEngine {
    pub fn new(config: Arc<AdaptationConfig>) -> Self {
        Self { config }
    }

    /// Evaluate one decision cycle. Pure with respect to storage: granted
    /// moves come back as [`PendingMutation`]s for the caller to persist,
    /// so a cancelled plan leaves no partial state.
    pub fn evaluate(
        &self,
        ctx: &PlanContext,
        now: DateTime<Utc>,
        sampled: &HashMap<String, f64>,
        arms: &HashMap<String, BanditArm>,
    ) -> ConstraintOutcome {
        let mut constraints_applied = Vec::new();

        // Candidate set: the configured feature order, restricted to arms
        // we actually have. Baseline position is the index within that
        // restricted order.
        let mut candidates: Vec<Candidate> = self
            .config
            .default_order
            .iter()
            .filter(|f| arms.contains_key(*f))
            .enumerate()
            .map(|(baseline, feature)| {
                let raw = sampled.get(feature).copied();
                let valid = raw.map(|v| v.is_finite()).unwrap_or(false);
                Candidate {
                    feature: feature.clone(),
                    baseline,
                    sampled: raw.filter(|v| v.is_finite()).unwrap_or(0.0),
                    // Unreadable samples sort to the bottom and are later
                    // degraded to `maintained` instead of aborting the cycle.
                    sort_key: if valid { raw.unwrap_or(0.0) } else { f64::MIN },
                    rank: 0,
                    action: AdaptationAction::Maintained,
                    pinned: true,
                    constraint: if valid { None } else { Some("evaluation_error") },
                }
            })
            .collect();

        let total = candidates.len();
        if total == 0 {
            return ConstraintOutcome {
                order: Vec::new(),
                actions: HashMap::new(),
                constraints_applied,
                decisions: Vec::new(),
                mutations: Vec::new(),
                safety_valve: false,
            };
        }

        // Candidate order: sampled value descending, ties by baseline
        // position so equal evidence never reshuffles the layout.
        candidates.sort_by(|a, b| {
            b.sort_key
                .partial_cmp(&a.sort_key)
                .unwrap_or(Ordering::Equal)
                .then(a.baseline.cmp(&b.baseline))
        });
        for (rank, candidate) in candidates.iter_mut().enumerate() {
            candidate.rank = rank;
        }

        let mut blocked = 0usize;
        let mut promotions_granted = 0usize;
        let mut demotions_granted = 0usize;

        for candidate in candidates.iter_mut() {
            if candidate.constraint == Some("evaluation_error") {
                blocked += 1;
                constraints_applied.push(format!(
                    "evaluation_error: '{}' could not be evaluated, holding baseline position {}",
                    candidate.feature, candidate.baseline
                ));
                continue;
            }

            let arm = &arms[&candidate.feature];
            match candidate.rank.cmp(&candidate.baseline) {
                Ordering::Equal => {
                    // Already in place; nothing to grant or block.
                }
                Ordering::Less => {
                    // Promotion attempt.
                    if let Some(last) = arm.last_promoted {
                        if now.signed_duration_since(last)
                            < Duration::hours(self.config.promotion_cooldown_hours)
                        {
                            candidate.constraint = Some("promotion_cooldown");
                            blocked += 1;
                            constraints_applied.push(format!(
                                "promotion_cooldown: '{}' was promoted within the last {}h",
                                candidate.feature, self.config.promotion_cooldown_hours
                            ));
                            continue;
                        }
                    }
                    if promotions_granted >= self.config.max_promotions_per_cycle {
                        candidate.constraint = Some("promotion_budget");
                        blocked += 1;
                        constraints_applied.push(format!(
                            "promotion_budget: cycle already granted {} promotions",
                            promotions_granted
                        ));
                        continue;
                    }
                    candidate.action = AdaptationAction::Promoted;
                    candidate.pinned = false;
                    promotions_granted += 1;
                }
                Ordering::Greater => {
                    // Demotion attempt.
                    if arm.is_critical {
                        candidate.constraint = Some("critical_feature");
                        blocked += 1;
                        constraints_applied.push(format!(
                            "critical_feature: '{}' held at baseline position {}",
                            candidate.feature, candidate.baseline
                        ));
                        continue;
                    }
                    if let Some(last) = arm.last_demoted {
                        if now.signed_duration_since(last)
                            < Duration::hours(self.config.demotion_cooldown_hours)
                        {
                            candidate.constraint = Some("demotion_cooldown");
                            blocked += 1;
                            constraints_applied.push(format!(
                                "demotion_cooldown: '{}' was demoted within the last {}h",
                                candidate.feature, self.config.demotion_cooldown_hours
                            ));
                            continue;
                        }
                    }
                    if demotions_granted >= self.config.max_demotions_per_cycle {
                        candidate.constraint = Some("demotion_budget");
                        blocked += 1;
                        constraints_applied.push(format!(
                            "demotion_budget: cycle already granted {} demotions",
                            demotions_granted
                        ));
                        continue;
                    }
                    let variance = arm.variance();
                    if variance > self.config.confidence_threshold {
                        candidate.constraint = Some("low_confidence");
                        blocked += 1;
                        constraints_applied.push(format!(
                            "low_confidence: '{}' posterior variance {:.3} exceeds {:.3}",
                            candidate.feature, variance, self.config.confidence_threshold
                        ));
                        continue;
                    }
                    candidate.action = AdaptationAction::Demoted;
                    candidate.pinned = false;
                    demotions_granted += 1;
                }
            }
        }

        // Safety valve: a cycle that fights the constraints this hard is
        // unstable; show the baseline instead and keep the audit trail.
        if blocked * 2 > total {
            constraints_applied.push(format!(
                "safety_valve: {} of {} arms constrained, reverting to baseline order",
                blocked, total
            ));
            return self.baseline_outcome(ctx, now, candidates, arms, constraints_applied);
        }

        // Assemble the final order: pinned features hold their baseline
        // slot, granted moves fill the remaining slots in candidate order.
        // A granted move whose landing slot would drag a critical feature
        // below baseline is converted to a pin and the layout recomputed.
        let positions = loop {
            let positions = assemble_positions(&candidates);
            let violation = candidates.iter().position(|c| {
                arms[&c.feature].is_critical && !c.pinned && positions[&c.feature] > c.baseline
            });
            match violation {
                Some(idx) => {
                    let candidate = &mut candidates[idx];
                    candidate.pinned = true;
                    candidate.action = AdaptationAction::Maintained;
                    candidate.constraint = Some("critical_feature");
                    constraints_applied.push(format!(
                        "critical_feature: '{}' held at baseline position {}",
                        candidate.feature, candidate.baseline
                    ));
                }
                None => break positions,
            }
        };

        let mut order = vec![String::new(); total];
        for candidate in &candidates {
            order[positions[&candidate.feature]] = candidate.feature.clone();
        }

        let mut actions = HashMap::with_capacity(total);
        let mut decisions = Vec::with_capacity(total);
        let mut mutations = Vec::new();
        for candidate in &candidates {
            let arm = &arms[&candidate.feature];
            actions.insert(candidate.feature.clone(), candidate.action);
            decisions.push(decision_row(ctx, now, candidate, arm, positions[&candidate.feature]));
            if matches!(
                candidate.action,
                AdaptationAction::Promoted | AdaptationAction::Demoted
            ) {
                mutations.push(PendingMutation {
                    feature_key: candidate.feature.clone(),
                    action: candidate.action,
                });
            }
        }

        ConstraintOutcome {
            order,
            actions,
            constraints_applied,
            decisions,
            mutations,
            safety_valve: false,
        }
    }

    /// Baseline fallback used by the safety valve: decision rows still
    /// record the blocked attempts for audit, but nothing is mutated.
    fn baseline_outcome(
        &self,
        ctx: &PlanContext,
        now: DateTime<Utc>,
        mut candidates: Vec<Candidate>,
        arms: &HashMap<String, BanditArm>,
        constraints_applied: Vec<String>,
    ) -> ConstraintOutcome {
        candidates.sort_by_key(|c| c.baseline);
        let order: Vec<String> = candidates.iter().map(|c| c.feature.clone()).collect();

        let mut actions = HashMap::with_capacity(candidates.len());
        let mut decisions = Vec::with_capacity(candidates.len());
        for candidate in candidates.iter_mut() {
            // Moves that had been granted did not survive the valve.
            if !candidate.pinned {
                candidate.action = AdaptationAction::Maintained;
                candidate.constraint = Some("safety_valve");
                candidate.pinned = true;
            }
            let arm = &arms[&candidate.feature];
            actions.insert(candidate.feature.clone(), AdaptationAction::Maintained);
            decisions.push(decision_row(ctx, now, candidate, arm, candidate.baseline));
        }

        ConstraintOutcome {
            order,
            actions,
            constraints_applied,
            decisions,
            mutations: Vec::new(),
            safety_valve: true,
        }
    }
}

fn assemble_positions(candidates: &[Candidate]) -> HashMap<String, usize> {
    let total = candidates.len();
    let mut slots: Vec<Option<&str>> = vec![None; total];
    for candidate in candidates {
        if candidate.pinned {
            slots[candidate.baseline] = Some(&candidate.feature);
        }
    }
    // Floating candidates arrive in rank order because `candidates` is
    // sorted by rank.
    let mut floating = candidates.iter().filter(|c| !c.pinned);
    for slot in slots.iter_mut() {
        if slot.is_none() {
            if let Some(candidate) = floating.next() {
                *slot = Some(&candidate.feature);
            }
        }
    }
    slots
        .into_iter()
        .enumerate()
        .filter_map(|(pos, feature)| feature.map(|f| (f.to_string(), pos)))
        .collect()
}

fn decision_row(
    ctx: &PlanContext,
    now: DateTime<Utc>,
    candidate: &Candidate,
    arm: &BanditArm,
    new_position: usize,
) -> AdaptationDecisionLog {
    AdaptationDecisionLog {
        id: Uuid::new_v4(),
        user_id: ctx.user_id.clone(),
        context_hash: ctx.context_hash(),
        feature_key: candidate.feature.clone(),
        action: candidate.action,
        sampled_value: candidate.sampled,
        alpha_before: arm.alpha,
        beta_before: arm.beta,
        old_position: candidate.baseline,
        new_position,
        constraint_applied: candidate.constraint.map(|c| c.to_string()),
        decided_at: now,
    }
}
