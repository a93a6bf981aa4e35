//! Plan generation — the facade the serving layer calls.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pulseboard_core::{AdaptResult, AdaptationAction, AdaptationConfig, PlanContext};

use crate::arms::{ArmKey, BanditArm};
use crate::constraints::{ConstraintEngine, ConstraintOutcome};
use crate::feedback::FeedbackRecorder;
use crate::holdout::{HoldoutCohort, HoldoutManager, LiftReport};
use crate::priors::{aggregate_priors, PriorAggregation, PriorProvider, TransferPrior};
use crate::regret::{RegretAnalyzer, RegretReport};
use crate::sampler::ThompsonSampler;
use crate::store::{AdaptationDecisionLog, AdaptiveStore};

/// One personalized layout, ready for the serving layer to render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutPlan {
    pub user_id: String,
    pub context_hash: String,
    pub order: Vec<String>,
    pub actions: HashMap<String, AdaptationAction>,
    pub sampled_values: HashMap<String, f64>,
    pub constraints_applied: Vec<String>,
    pub explanation: String,
    pub cohort: HoldoutCohort,
    pub generated_at: DateTime<Utc>,
}

/// Per-feature summary for dashboards and support tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureStats {
    pub feature_key: String,
    pub context_hash: String,
    pub expected_value: f64,
    pub confidence_interval_lower: f64,
    pub confidence_interval_upper: f64,
    pub total_interactions: u64,
    pub total_successes: u64,
    pub promotion_count: u64,
    pub demotion_count: u64,
    pub is_critical: bool,
}

/// The self-adaptive decision engine: prior transfer, Thompson sampling,
/// constraint enforcement, feedback, and regret tracking behind one
/// surface.
pub struct AdaptiveLayoutEngine {
    config: Arc<AdaptationConfig>,
    store: Arc<dyn AdaptiveStore>,
    provider: Arc<PriorProvider>,
    sampler: ThompsonSampler,
    constraints: ConstraintEngine,
    recorder: FeedbackRecorder,
    holdout: HoldoutManager,
    regret: RegretAnalyzer,
}

impl AdaptiveLayoutEngine {
    pub fn new(config: AdaptationConfig, store: Arc<dyn AdaptiveStore>) -> AdaptResult<Self> {
        Self::build(config, store, ThompsonSampler::new())
    }

    /// Engine with a deterministic sampler, for reproducible tests.
    pub fn with_seed(
        config: AdaptationConfig,
        store: Arc<dyn AdaptiveStore>,
        seed: u64,
    ) -> AdaptResult<Self> {
        Self::build(config, store, ThompsonSampler::with_seed(seed))
    }

    fn build(
        config: AdaptationConfig,
        store: Arc<dyn AdaptiveStore>,
        sampler: ThompsonSampler,
    ) -> AdaptResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        // Statically configured specialty priors become store rows so the
        // ordinary fallback chain sees them; aggregated rows, once the
        // batch job has produced any, take precedence by already existing.
        let now = Utc::now();
        for (specialty, features) in &config.specialty_priors {
            for (feature_key, seed) in features {
                if store.specialty_prior(specialty, feature_key)?.is_none() {
                    let mut prior = TransferPrior::for_specialty(
                        specialty.clone(),
                        feature_key.clone(),
                        seed.alpha,
                        seed.beta,
                        now,
                    );
                    prior.total_users = config.min_specialty_users;
                    store.put_prior(prior)?;
                }
            }
        }

        let provider = Arc::new(PriorProvider::new(config.clone(), store.clone()));
        let engine = Self {
            constraints: ConstraintEngine::new(config.clone()),
            recorder: FeedbackRecorder::new(config.clone(), store.clone(), provider.clone()),
            holdout: HoldoutManager::new(config.clone()),
            regret: RegretAnalyzer::new(config.clone(), store.clone()),
            provider,
            sampler,
            store,
            config,
        };
        tracing::info!(
            features = engine.config.default_order.len(),
            critical = engine.config.critical_features.len(),
            "adaptive layout engine initialised"
        );
        Ok(engine)
    }

    /// Produce one personalized layout for the given context.
    ///
    /// Everything before the persist step is read-only, so a call
    /// abandoned mid-cycle leaves no partial state behind.
    pub fn generate_plan(&self, ctx: &PlanContext) -> AdaptResult<LayoutPlan> {
        let now = Utc::now();

        if self.holdout.assign_cohort(&ctx.user_id) == HoldoutCohort::Control {
            return Ok(self.baseline_plan(ctx, now));
        }

        let experience_days = self.provider.experience_days(&ctx.user_id, now)?;

        let mut arms: HashMap<String, BanditArm> = HashMap::new();
        let mut params: Vec<(String, f64, f64)> = Vec::with_capacity(self.config.default_order.len());
        for feature_key in &self.config.default_order {
            let mut arm = self.provider.get_or_init(ctx, feature_key)?;
            if !arm.is_valid() {
                tracing::warn!(
                    user_id = %ctx.user_id,
                    feature_key = %feature_key,
                    alpha = arm.alpha,
                    beta = arm.beta,
                    "corrupted arm reset to uniform"
                );
                arm = self
                    .store
                    .update_arm(&arm.key(), &mut |a| a.reset_to_uniform(Utc::now()))?;
            }
            let blended =
                self.provider
                    .blended_params(&arm, ctx.specialty.as_deref(), experience_days);
            params.push((feature_key.clone(), blended.alpha, blended.beta));
            arms.insert(feature_key.clone(), arm);
        }

        let sampled = self.sampler.sample_all(&params);
        let ConstraintOutcome {
            order,
            actions,
            constraints_applied,
            decisions,
            mutations,
            safety_valve,
        } = self.constraints.evaluate(ctx, now, &sampled, &arms);

        for mutation in &mutations {
            let key = ArmKey::new(&ctx.user_id, &mutation.feature_key, ctx.context_hash());
            self.store.update_arm(&key, &mut |arm| match mutation.action {
                AdaptationAction::Promoted => arm.record_promotion(now),
                AdaptationAction::Demoted => arm.record_demotion(now),
                AdaptationAction::Maintained => {}
            })?;
        }

        let promoted = mutations
            .iter()
            .filter(|m| m.action == AdaptationAction::Promoted)
            .count();
        let demoted = mutations.len() - promoted;
        let blocked = decisions
            .iter()
            .filter(|d| d.constraint_applied.is_some())
            .count();
        self.store.append_decisions(decisions)?;

        // One regret observation per cycle: the chosen arm is the feature
        // granted the top slot, the optimal arm the best posterior mean.
        if let Some(chosen_feature) = order.first() {
            let chosen_reward = arms[chosen_feature].expected_value();
            let (optimal_feature, optimal_reward) = self
                .config
                .default_order
                .iter()
                .filter_map(|f| arms.get(f).map(|a| (f.clone(), a.expected_value())))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .unwrap_or_else(|| (chosen_feature.clone(), chosen_reward));
            self.regret.record_decision(
                ctx,
                chosen_feature,
                chosen_reward,
                &optimal_feature,
                optimal_reward,
            )?;
        }

        let explanation = format!(
            "Thompson Sampling ranked '{}' first for context {} ({} promoted, {} demoted, {} held by constraints{})",
            order.first().map(String::as_str).unwrap_or("-"),
            ctx.context_hash(),
            promoted,
            demoted,
            blocked,
            if safety_valve {
                "; safety valve reverted to baseline"
            } else {
                ""
            }
        );
        tracing::debug!(
            user_id = %ctx.user_id,
            context = %ctx.context_hash(),
            promoted,
            demoted,
            blocked,
            safety_valve,
            "plan generated"
        );

        Ok(LayoutPlan {
            user_id: ctx.user_id.clone(),
            context_hash: ctx.context_hash(),
            order,
            actions,
            sampled_values: sampled,
            constraints_applied,
            explanation,
            cohort: HoldoutCohort::Adaptive,
            generated_at: now,
        })
    }

    /// Report one interaction outcome for a feature the user engaged
    /// with (or ignored).
    pub fn record_feedback(
        &self,
        ctx: &PlanContext,
        feature_key: &str,
        success: bool,
        weight: Option<f64>,
    ) -> AdaptResult<BanditArm> {
        let arm = self
            .recorder
            .record_feedback(ctx, feature_key, success, weight.unwrap_or(1.0))?;
        let cohort = self.holdout.assign_cohort(&ctx.user_id);
        self.holdout
            .record_outcome(ctx.specialty.as_deref(), cohort, success);
        Ok(arm)
    }

    /// Per-feature belief summary for one user, across contexts.
    pub fn arm_stats(&self, user_id: &str) -> AdaptResult<Vec<FeatureStats>> {
        let mut stats: Vec<FeatureStats> = self
            .store
            .arms_snapshot()?
            .into_iter()
            .filter(|arm| arm.user_id == user_id)
            .map(|arm| {
                let expected = arm.expected_value();
                let spread = 1.96 * arm.variance().sqrt();
                FeatureStats {
                    expected_value: expected,
                    confidence_interval_lower: (expected - spread).max(0.0),
                    confidence_interval_upper: (expected + spread).min(1.0),
                    total_interactions: arm.total_interactions,
                    total_successes: arm.total_successes,
                    promotion_count: arm.promotion_count,
                    demotion_count: arm.demotion_count,
                    is_critical: arm.is_critical,
                    feature_key: arm.feature_key,
                    context_hash: arm.context_hash,
                }
            })
            .collect();
        stats.sort_by(|a, b| {
            a.context_hash
                .cmp(&b.context_hash)
                .then(a.feature_key.cmp(&b.feature_key))
        });
        Ok(stats)
    }

    pub fn regret_report(&self, user_id: &str) -> AdaptResult<RegretReport> {
        self.regret.analyze(user_id)
    }

    pub fn decision_log(&self, user_id: &str) -> AdaptResult<Vec<AdaptationDecisionLog>> {
        self.store.decisions_for_user(user_id)
    }

    pub fn adaptation_lift(&self, specialty: Option<&str>) -> LiftReport {
        self.holdout.report(specialty)
    }

    /// Recompute transfer priors from the current arm population. Meant
    /// to be driven by the external periodic scheduler.
    pub fn run_prior_aggregation(&self) -> AdaptResult<PriorAggregation> {
        aggregate_priors(self.store.as_ref())
    }

    fn baseline_plan(&self, ctx: &PlanContext, now: DateTime<Utc>) -> LayoutPlan {
        let order = self.config.default_order.clone();
        let actions = order
            .iter()
            .map(|f| (f.clone(), AdaptationAction::Maintained))
            .collect();
        LayoutPlan {
            user_id: ctx.user_id.clone(),
            context_hash: ctx.context_hash(),
            order,
            actions,
            sampled_values: HashMap::new(),
            constraints_applied: Vec::new(),
            explanation: "Holdout control cohort: baseline order, no adaptation".to_string(),
            cohort: HoldoutCohort::Control,
            generated_at: now,
        }
    }
}
