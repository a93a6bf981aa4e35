//! Applies observed interaction outcomes to arm state.

use std::sync::Arc;

use chrono::Utc;

use pulseboard_core::{AdaptError, AdaptResult, AdaptationConfig, PlanContext};

use crate::arms::{ArmKey, BanditArm};
use crate::priors::PriorProvider;
use crate::store::AdaptiveStore;

/// Records success/failure outcomes against the owning arm.
///
/// The update is a single row-scoped read-modify-write: either the whole
/// alpha/beta/counter change lands, or none of it does.
pub struct FeedbackRecorder {
    config: Arc<AdaptationConfig>,
    store: Arc<dyn AdaptiveStore>,
    provider: Arc<PriorProvider>,
}

impl FeedbackRecorder {
    pub fn new(
        config: Arc<AdaptationConfig>,
        store: Arc<dyn AdaptiveStore>,
        provider: Arc<PriorProvider>,
    ) -> Self {
        Self {
            config,
            store,
            provider,
        }
    }

    /// Apply one outcome. Successes add `weight × success_weight` to
    /// alpha; failures add `weight × failure_weight` to beta. With the
    /// default weights a failure moves the belief half as far as a
    /// success; the asymmetry is intentional and load-bearing.
    pub fn record_feedback(
        &self,
        ctx: &PlanContext,
        feature_key: &str,
        success: bool,
        weight: f64,
    ) -> AdaptResult<BanditArm> {
        if self.config.baseline_position(feature_key).is_none() {
            return Err(AdaptError::UnknownFeature(feature_key.to_string()));
        }

        self.provider.get_or_init(ctx, feature_key)?;

        let key = ArmKey::new(&ctx.user_id, feature_key, ctx.context_hash());
        let success_weight = self.config.success_weight;
        let failure_weight = self.config.failure_weight;
        let arm = self.store.update_arm(&key, &mut |arm| {
            let now = Utc::now();
            if success {
                arm.apply_success(weight, success_weight, now);
            } else {
                arm.apply_failure(weight, failure_weight, now);
            }
        })?;

        tracing::debug!(
            user_id = %ctx.user_id,
            feature_key,
            success,
            weight,
            alpha = arm.alpha,
            beta = arm.beta,
            "feedback recorded"
        );
        Ok(arm)
    }
}
