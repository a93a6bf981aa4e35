//! Cold-start/warm-start prior transfer.
//!
//! New users start from aggregated belief (specialty-level when enough
//! users back it, global otherwise, uniform as the last resort) and are
//! blended toward their own posterior over the warm-start window. The
//! blend only affects sampling parameters; stored personal state keeps
//! accumulating from real feedback untouched.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pulseboard_core::{AdaptResult, AdaptationConfig, PlanContext};

use crate::arms::{ArmKey, BanditArm};
use crate::store::AdaptiveStore;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Aggregated belief shared across users, recomputed by a periodic batch
/// job ([`aggregate_priors`]); the live path only reads these rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferPrior {
    pub feature_key: String,
    /// `None` marks the global scope.
    pub specialty: Option<String>,
    pub alpha_prior: f64,
    pub beta_prior: f64,
    pub total_users: u64,
    pub total_interactions: u64,
    pub total_successes: u64,
    pub last_updated: DateTime<Utc>,
}

impl TransferPrior {
    pub fn global(
        feature_key: impl Into<String>,
        alpha_prior: f64,
        beta_prior: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            feature_key: feature_key.into(),
            specialty: None,
            alpha_prior,
            beta_prior,
            total_users: 0,
            total_interactions: 0,
            total_successes: 0,
            last_updated: now,
        }
    }

    pub fn for_specialty(
        specialty: impl Into<String>,
        feature_key: impl Into<String>,
        alpha_prior: f64,
        beta_prior: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            specialty: Some(specialty.into()),
            ..Self::global(feature_key, alpha_prior, beta_prior, now)
        }
    }

    pub fn is_valid(&self) -> bool {
        self.alpha_prior.is_finite()
            && self.beta_prior.is_finite()
            && self.alpha_prior > 0.0
            && self.beta_prior > 0.0
    }
}

/// Where sampling parameters came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorSource {
    Specialty,
    Global,
    Uniform,
    Blended,
    Personal,
}

/// Parameters actually fed to the sampler for one arm, tagged with their
/// provenance and the prior's share of the mix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlendedParams {
    pub alpha: f64,
    pub beta: f64,
    pub source: PriorSource,
    pub prior_weight: f64,
}

// ---------------------------------------------------------------------------
// PriorProvider
// ---------------------------------------------------------------------------

/// Resolves seed parameters for new arms and sampling parameters for the
/// warm-start window.
pub struct PriorProvider {
    config: Arc<AdaptationConfig>,
    store: Arc<dyn AdaptiveStore>,
}

impl PriorProvider {
    pub fn new(config: Arc<AdaptationConfig>, store: Arc<dyn AdaptiveStore>) -> Self {
        Self { config, store }
    }

    /// Return the arm for `(user, feature, context)`, creating it from the
    /// prior fallback chain when absent.
    ///
    /// A storage failure on the arm lookup itself propagates (the serving
    /// layer decides whether planning from nothing is acceptable); prior
    /// lookup failures only degrade the seed to uniform.
    pub fn get_or_init(&self, ctx: &PlanContext, feature_key: &str) -> AdaptResult<BanditArm> {
        let key = ArmKey::new(&ctx.user_id, feature_key, ctx.context_hash());
        if let Some(arm) = self.store.get_arm(&key)? {
            return Ok(arm);
        }

        let (alpha, beta, source) = self.seed_params(ctx.specialty.as_deref(), feature_key);
        let arm = BanditArm::new(
            key,
            alpha,
            beta,
            self.config.is_critical(feature_key),
            Utc::now(),
        );
        tracing::debug!(
            user_id = %ctx.user_id,
            feature_key,
            source = ?source,
            alpha,
            beta,
            "arm created from prior"
        );
        self.store.put_arm(arm)
    }

    /// Seed fallback chain: qualified specialty prior → global prior →
    /// uniform Beta(1,1). Never fails.
    pub fn seed_params(
        &self,
        specialty: Option<&str>,
        feature_key: &str,
    ) -> (f64, f64, PriorSource) {
        if let Some(specialty) = specialty {
            match self.store.specialty_prior(specialty, feature_key) {
                Ok(Some(prior))
                    if prior.is_valid() && prior.total_users >= self.config.min_specialty_users =>
                {
                    return (prior.alpha_prior, prior.beta_prior, PriorSource::Specialty);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        specialty,
                        feature_key,
                        error = %err,
                        "specialty prior lookup failed, falling through"
                    );
                }
            }
        }

        match self.store.global_prior(feature_key) {
            Ok(Some(prior)) if prior.is_valid() => {
                (prior.alpha_prior, prior.beta_prior, PriorSource::Global)
            }
            Ok(_) => (1.0, 1.0, PriorSource::Uniform),
            Err(err) => {
                tracing::warn!(
                    feature_key,
                    error = %err,
                    "global prior lookup failed, seeding uniform"
                );
                (1.0, 1.0, PriorSource::Uniform)
            }
        }
    }

    /// Days since the user's first recorded interaction, floored at zero.
    pub fn experience_days(&self, user_id: &str, now: DateTime<Utc>) -> AdaptResult<f64> {
        Ok(self
            .store
            .first_interaction_at(user_id)?
            .map(|first| ((now - first).num_seconds() as f64 / 86_400.0).max(0.0))
            .unwrap_or(0.0))
    }

    /// Sampling parameters for one arm given the user's tenure.
    ///
    /// Cold start (< `cold_start_days`): prior only, weight 1.0. Warm
    /// start: linear blend whose prior share decays from
    /// `warm_start_prior_weight` to zero across the window. Afterwards the
    /// personal posterior is used unmodified.
    pub fn blended_params(
        &self,
        arm: &BanditArm,
        specialty: Option<&str>,
        experience_days: f64,
    ) -> BlendedParams {
        if experience_days >= self.config.warm_start_days {
            return BlendedParams {
                alpha: arm.alpha,
                beta: arm.beta,
                source: PriorSource::Personal,
                prior_weight: 0.0,
            };
        }

        let (prior_alpha, prior_beta, prior_source) =
            self.seed_params(specialty, &arm.feature_key);

        if experience_days < self.config.cold_start_days {
            return BlendedParams {
                alpha: prior_alpha,
                beta: prior_beta,
                source: prior_source,
                prior_weight: 1.0,
            };
        }

        let progress = (experience_days - self.config.cold_start_days)
            / (self.config.warm_start_days - self.config.cold_start_days);
        let prior_weight = self.config.warm_start_prior_weight * (1.0 - progress);
        let personal_weight = 1.0 - prior_weight;
        BlendedParams {
            alpha: prior_weight * prior_alpha + personal_weight * arm.alpha,
            beta: prior_weight * prior_beta + personal_weight * arm.beta,
            source: PriorSource::Blended,
            prior_weight,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch aggregation
// ---------------------------------------------------------------------------

/// Outcome of one aggregation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorAggregation {
    pub arms_scanned: usize,
    pub global_rows: usize,
    pub specialty_rows: usize,
    pub computed_at: DateTime<Utc>,
}

#[derive(Default)]
struct PriorAccumulator {
    weighted_alpha: f64,
    weighted_beta: f64,
    weight: f64,
    users: std::collections::HashSet<String>,
    interactions: u64,
    successes: u64,
}

impl PriorAccumulator {
    fn add(&mut self, arm: &BanditArm) {
        let weight = arm.total_interactions as f64;
        self.weighted_alpha += weight * arm.alpha;
        self.weighted_beta += weight * arm.beta;
        self.weight += weight;
        self.users.insert(arm.user_id.clone());
        self.interactions += arm.total_interactions;
        self.successes += arm.total_successes;
    }

    fn into_prior(
        self,
        feature_key: String,
        specialty: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<TransferPrior> {
        if self.weight <= 0.0 {
            return None;
        }
        Some(TransferPrior {
            feature_key,
            specialty,
            alpha_prior: self.weighted_alpha / self.weight,
            beta_prior: self.weighted_beta / self.weight,
            total_users: self.users.len() as u64,
            total_interactions: self.interactions,
            total_successes: self.successes,
            last_updated: now,
        })
    }
}

/// Recompute global and specialty [`TransferPrior`] rows from all arm
/// snapshots: interaction-weighted mean of personal alpha/beta, totals
/// summed. Arms with no interactions carry no learned signal and are
/// skipped. The periodic scheduler that invokes this lives outside the
/// core.
pub fn aggregate_priors(store: &dyn AdaptiveStore) -> AdaptResult<PriorAggregation> {
    let arms = store.arms_snapshot()?;
    let now = Utc::now();

    let mut by_feature: HashMap<String, PriorAccumulator> = HashMap::new();
    let mut by_specialty: HashMap<(String, String), PriorAccumulator> = HashMap::new();

    for arm in &arms {
        if arm.total_interactions == 0 || !arm.is_valid() {
            continue;
        }
        by_feature
            .entry(arm.feature_key.clone())
            .or_default()
            .add(arm);

        // context_hash is "{specialty}:{bucket}"; "any" means unknown.
        if let Some(specialty) = arm.context_hash.split(':').next().filter(|s| *s != "any") {
            by_specialty
                .entry((specialty.to_string(), arm.feature_key.clone()))
                .or_default()
                .add(arm);
        }
    }

    let mut global_rows = 0;
    for (feature_key, acc) in by_feature {
        if let Some(prior) = acc.into_prior(feature_key, None, now) {
            store.put_prior(prior)?;
            global_rows += 1;
        }
    }

    let mut specialty_rows = 0;
    for ((specialty, feature_key), acc) in by_specialty {
        if let Some(prior) = acc.into_prior(feature_key, Some(specialty), now) {
            store.put_prior(prior)?;
            specialty_rows += 1;
        }
    }

    tracing::info!(
        arms_scanned = arms.len(),
        global_rows,
        specialty_rows,
        "transfer priors recomputed"
    );

    Ok(PriorAggregation {
        arms_scanned: arms.len(),
        global_rows,
        specialty_rows,
        computed_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use pulseboard_core::TimeOfDayBucket;

    fn make_provider(store: Arc<InMemoryStore>) -> PriorProvider {
        PriorProvider::new(Arc::new(AdaptationConfig::default()), store)
    }

    fn cardiology_ctx(user: &str) -> PlanContext {
        PlanContext::new(user)
            .with_specialty("cardiology")
            .with_time_of_day(TimeOfDayBucket::Morning)
    }

    #[test]
    fn test_specialty_prior_seeds_new_arm() {
        let store = Arc::new(InMemoryStore::new());
        let mut prior =
            TransferPrior::for_specialty("cardiology", "vitals", 2.0, 1.0, Utc::now());
        prior.total_users = 5;
        store.put_prior(prior).unwrap();

        let provider = make_provider(store);
        let arm = provider.get_or_init(&cardiology_ctx("new-user"), "vitals").unwrap();
        assert_eq!(arm.alpha, 2.0);
        assert_eq!(arm.beta, 1.0);
        assert!((arm.expected_value() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_thin_specialty_prior_falls_back_to_global() {
        let store = Arc::new(InMemoryStore::new());
        let mut thin = TransferPrior::for_specialty("cardiology", "vitals", 9.0, 1.0, Utc::now());
        thin.total_users = 2; // below min_specialty_users
        store.put_prior(thin).unwrap();
        store
            .put_prior(TransferPrior::global("vitals", 3.0, 2.0, Utc::now()))
            .unwrap();

        let provider = make_provider(store);
        let (alpha, beta, source) = provider.seed_params(Some("cardiology"), "vitals");
        assert_eq!((alpha, beta), (3.0, 2.0));
        assert_eq!(source, PriorSource::Global);
    }

    #[test]
    fn test_no_priors_seed_uniform() {
        let store = Arc::new(InMemoryStore::new());
        let provider = make_provider(store);
        let (alpha, beta, source) = provider.seed_params(Some("oncology"), "imaging");
        assert_eq!((alpha, beta), (1.0, 1.0));
        assert_eq!(source, PriorSource::Uniform);
    }

    #[test]
    fn test_cold_start_uses_prior_only() {
        let store = Arc::new(InMemoryStore::new());
        store
            .put_prior(TransferPrior::global("vitals", 4.0, 2.0, Utc::now()))
            .unwrap();
        let provider = make_provider(store.clone());

        let mut arm = BanditArm::new(
            ArmKey::new("u1", "vitals", "any:morning"),
            10.0,
            1.0,
            false,
            Utc::now(),
        );
        arm.total_interactions = 9;

        let blended = provider.blended_params(&arm, None, 3.0);
        assert_eq!(blended.source, PriorSource::Global);
        assert_eq!(blended.prior_weight, 1.0);
        assert_eq!((blended.alpha, blended.beta), (4.0, 2.0));
    }

    #[test]
    fn test_warm_start_blend_arithmetic() {
        let store = Arc::new(InMemoryStore::new());
        store
            .put_prior(TransferPrior::global("vitals", 4.0, 2.0, Utc::now()))
            .unwrap();
        let provider = make_provider(store.clone());

        let arm = BanditArm::new(
            ArmKey::new("u1", "vitals", "any:morning"),
            10.0,
            2.0,
            false,
            Utc::now(),
        );

        // Day 7: progress 0, prior_weight 0.7.
        let at_start = provider.blended_params(&arm, None, 7.0);
        assert_eq!(at_start.source, PriorSource::Blended);
        assert!((at_start.prior_weight - 0.7).abs() < 1e-12);
        assert!((at_start.alpha - (0.7 * 4.0 + 0.3 * 10.0)).abs() < 1e-12);
        assert!((at_start.beta - (0.7 * 2.0 + 0.3 * 2.0)).abs() < 1e-12);

        // Day 18.5: progress 0.5, prior_weight 0.35.
        let midway = provider.blended_params(&arm, None, 18.5);
        assert!((midway.prior_weight - 0.35).abs() < 1e-12);
        assert!((midway.alpha - (0.35 * 4.0 + 0.65 * 10.0)).abs() < 1e-12);
    }

    #[test]
    fn test_experienced_user_is_unblended() {
        let store = Arc::new(InMemoryStore::new());
        store
            .put_prior(TransferPrior::global("vitals", 4.0, 2.0, Utc::now()))
            .unwrap();
        let provider = make_provider(store.clone());

        let arm = BanditArm::new(
            ArmKey::new("u1", "vitals", "any:morning"),
            10.0,
            2.0,
            false,
            Utc::now(),
        );
        let blended = provider.blended_params(&arm, None, 30.0);
        assert_eq!(blended.source, PriorSource::Personal);
        assert_eq!((blended.alpha, blended.beta), (10.0, 2.0));
        assert_eq!(blended.prior_weight, 0.0);
    }

    #[test]
    fn test_aggregation_recomputes_rows() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();

        // Two cardiology users with learned state, one untouched arm.
        for (user, alpha, interactions) in [("u1", 5.0, 10_u64), ("u2", 3.0, 10)] {
            let mut arm = BanditArm::new(
                ArmKey::new(user, "vitals", "cardiology:morning"),
                alpha,
                1.0,
                false,
                now,
            );
            arm.total_interactions = interactions;
            arm.total_successes = interactions / 2;
            store.put_arm(arm).unwrap();
        }
        store
            .put_arm(BanditArm::new(
                ArmKey::new("u3", "vitals", "cardiology:morning"),
                1.0,
                1.0,
                false,
                now,
            ))
            .unwrap();

        let summary = aggregate_priors(store.as_ref()).unwrap();
        assert_eq!(summary.arms_scanned, 3);
        assert_eq!(summary.global_rows, 1);
        assert_eq!(summary.specialty_rows, 1);

        let prior = store.specialty_prior("cardiology", "vitals").unwrap().unwrap();
        assert_eq!(prior.total_users, 2);
        assert_eq!(prior.total_interactions, 20);
        // Equal weights, so the mean of 5.0 and 3.0.
        assert!((prior.alpha_prior - 4.0).abs() < 1e-12);
    }
}
