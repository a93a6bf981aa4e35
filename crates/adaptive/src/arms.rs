//! Per-(user, feature, context) Beta-distribution belief state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of one arm: a feature competing for visibility for one user
/// in one context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArmKey {
    pub user_id: String,
    pub feature_key: String,
    pub context_hash: String,
}

impl ArmKey {
    pub fn new(
        user_id: impl Into<String>,
        feature_key: impl Into<String>,
        context_hash: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            feature_key: feature_key.into(),
            context_hash: context_hash.into(),
        }
    }
}

/// Belief about one feature's value to one user in one context, with the
/// promotion/demotion bookkeeping the constraint engine needs.
///
/// Invariant: `alpha > 0` and `beta > 0` at all times, so
/// `expected_value()` stays inside (0, 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditArm {
    pub user_id: String,
    pub feature_key: String,
    pub context_hash: String,
    pub alpha: f64,
    pub beta: f64,
    pub is_critical: bool,
    pub last_promoted: Option<DateTime<Utc>>,
    pub last_demoted: Option<DateTime<Utc>>,
    pub promotion_count: u64,
    pub demotion_count: u64,
    pub total_interactions: u64,
    pub total_successes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BanditArm {
    pub fn new(key: ArmKey, alpha: f64, beta: f64, is_critical: bool, now: DateTime<Utc>) -> Self {
        Self {
            user_id: key.user_id,
            feature_key: key.feature_key,
            context_hash: key.context_hash,
            alpha,
            beta,
            is_critical,
            last_promoted: None,
            last_demoted: None,
            promotion_count: 0,
            demotion_count: 0,
            total_interactions: 0,
            total_successes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> ArmKey {
        ArmKey::new(
            self.user_id.clone(),
            self.feature_key.clone(),
            self.context_hash.clone(),
        )
    }

    pub fn expected_value(&self) -> f64 {
        let denom = self.alpha + self.beta;
        if denom <= 0.0 {
            0.5
        } else {
            self.alpha / denom
        }
    }

    /// Posterior variance αβ / ((α+β)²(α+β+1)). Shrinks as evidence
    /// accumulates, which is what decays exploration over time.
    pub fn variance(&self) -> f64 {
        let total = self.alpha + self.beta;
        if total <= 0.0 {
            return 0.25;
        }
        (self.alpha * self.beta) / (total.powi(2) * (total + 1.0))
    }

    pub fn is_valid(&self) -> bool {
        self.alpha.is_finite() && self.beta.is_finite() && self.alpha > 0.0 && self.beta > 0.0
    }

    /// Recovery path for a corrupted record: the engine must never sample
    /// from an invalid distribution, so the belief restarts at uniform.
    pub fn reset_to_uniform(&mut self, now: DateTime<Utc>) {
        self.alpha = 1.0;
        self.beta = 1.0;
        self.updated_at = now;
    }

    pub fn apply_success(&mut self, weight: f64, success_weight: f64, now: DateTime<Utc>) {
        self.alpha += weight * success_weight;
        self.total_successes += 1;
        self.total_interactions += 1;
        self.updated_at = now;
    }

    pub fn apply_failure(&mut self, weight: f64, failure_weight: f64, now: DateTime<Utc>) {
        self.beta += weight * failure_weight;
        self.total_interactions += 1;
        self.updated_at = now;
    }

    pub fn record_promotion(&mut self, now: DateTime<Utc>) {
        self.last_promoted = Some(now);
        self.promotion_count += 1;
        self.updated_at = now;
    }

    pub fn record_demotion(&mut self, now: DateTime<Utc>) {
        self.last_demoted = Some(now);
        self.demotion_count += 1;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_arm(alpha: f64, beta: f64) -> BanditArm {
        BanditArm::new(
            ArmKey::new("u1", "vitals", "cardiology:morning"),
            alpha,
            beta,
            false,
            Utc::now(),
        )
    }

    #[test]
    fn test_expected_value_in_open_interval() {
        let arm = make_arm(1.0, 1.0);
        assert!(arm.expected_value() > 0.0 && arm.expected_value() < 1.0);
        let skewed = make_arm(100.0, 1.0);
        assert!(skewed.expected_value() > 0.0 && skewed.expected_value() < 1.0);
    }

    #[test]
    fn test_variance_matches_formula() {
        let arm = make_arm(2.0, 3.0);
        let expected = (2.0 * 3.0) / (5.0_f64.powi(2) * 6.0);
        assert!((arm.variance() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_variance_shrinks_with_evidence() {
        let fresh = make_arm(1.0, 1.0);
        let seasoned = make_arm(50.0, 50.0);
        assert!(seasoned.variance() < fresh.variance());
    }

    #[test]
    fn test_success_updates_alpha_only() {
        let mut arm = make_arm(1.0, 1.0);
        arm.apply_success(1.0, 1.0, Utc::now());
        assert_eq!(arm.alpha, 2.0);
        assert_eq!(arm.beta, 1.0);
        assert_eq!(arm.total_interactions, 1);
        assert_eq!(arm.total_successes, 1);
    }

    #[test]
    fn test_failure_updates_beta_at_half_weight() {
        let mut arm = make_arm(1.0, 1.0);
        arm.apply_failure(1.0, 0.5, Utc::now());
        assert_eq!(arm.alpha, 1.0);
        assert_eq!(arm.beta, 1.5);
        assert_eq!(arm.total_interactions, 1);
        assert_eq!(arm.total_successes, 0);
    }

    #[test]
    fn test_reset_to_uniform_repairs_corruption() {
        let mut arm = make_arm(-3.0, 0.0);
        assert!(!arm.is_valid());
        arm.reset_to_uniform(Utc::now());
        assert!(arm.is_valid());
        assert_eq!(arm.alpha, 1.0);
        assert_eq!(arm.beta, 1.0);
    }
}
