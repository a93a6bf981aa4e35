//! Regret analysis over the append-only decision logs.
//!
//! Quantifies how much reward the bandit leaves on the table and whether
//! its exploration is decaying the way the Beta-variance argument says it
//! should. Reads logs only; never touches arm state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pulseboard_core::{AdaptResult, AdaptationConfig, PlanContext};

use crate::store::AdaptiveStore;

/// One decision-and-outcome pair.
///
/// `optimal_feature` is estimated from the bandit's own posterior means
/// at decision time; no independent ground-truth reward exists in a live
/// deployment, so field regret is partially self-referential. That is a
/// known estimation limit, not something to correct for here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegretObservation {
    pub id: Uuid,
    pub user_id: String,
    pub context_hash: String,
    pub chosen_feature: String,
    pub optimal_feature: String,
    pub chosen_reward: f64,
    pub optimal_reward: f64,
    pub instantaneous_regret: f64,
    pub cumulative_regret: f64,
    pub observed_at: DateTime<Utc>,
}

/// Input to [`AdaptiveStore::append_regret`]; the store assigns the
/// cumulative total under the user's row lock.
#[derive(Debug, Clone)]
pub struct RegretSample {
    pub user_id: String,
    pub context_hash: String,
    pub chosen_feature: String,
    pub optimal_feature: String,
    pub chosen_reward: f64,
    pub optimal_reward: f64,
    pub instantaneous_regret: f64,
}

/// Summary of one user's regret trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegretReport {
    pub user_id: String,
    pub total_rounds: usize,
    pub cumulative_regret: f64,
    pub average_regret: f64,
    pub optimal_selection_rate: f64,
    pub theoretical_bound: f64,
    pub within_bound: bool,
    pub converged: bool,
    /// 1-based round at which the cumulative-regret slope first settled
    /// below the threshold, if it has.
    pub convergence_round: Option<usize>,
    pub computed_at: DateTime<Utc>,
}

pub struct RegretAnalyzer {
    config: Arc<AdaptationConfig>,
    store: Arc<dyn AdaptiveStore>,
}

impl RegretAnalyzer {
    pub fn new(config: Arc<AdaptationConfig>, store: Arc<dyn AdaptiveStore>) -> Self {
        Self { config, store }
    }

    /// Record one decision outcome. Instantaneous regret is clamped at
    /// zero: choosing better than the current estimate of optimal is not
    /// negative regret.
    pub fn record_decision(
        &self,
        ctx: &PlanContext,
        chosen_feature: &str,
        chosen_reward: f64,
        optimal_feature: &str,
        optimal_reward: f64,
    ) -> AdaptResult<RegretObservation> {
        let instantaneous = (optimal_reward - chosen_reward).max(0.0);
        self.store.append_regret(RegretSample {
            user_id: ctx.user_id.clone(),
            context_hash: ctx.context_hash(),
            chosen_feature: chosen_feature.to_string(),
            optimal_feature: optimal_feature.to_string(),
            chosen_reward,
            optimal_reward,
            instantaneous_regret: instantaneous,
        })
    }

    /// Bayesian regret reference for Thompson Sampling, `C·√(K·T·ln T)`.
    /// A sanity yardstick for tests and reports, never an enforced limit.
    pub fn theoretical_bound(&self, arm_count: usize, rounds: usize) -> f64 {
        if arm_count == 0 || rounds < 2 {
            return 0.0;
        }
        let k = arm_count as f64;
        let t = rounds as f64;
        self.config.regret_bound_constant * (k * t * t.ln()).sqrt()
    }

    /// First round (1-based) at which the cumulative series has settled:
    /// a sliding window whose slope drops below the threshold and stays
    /// below it for the required number of subsequent windows.
    pub fn convergence_round(&self, cumulative: &[f64]) -> Option<usize> {
        let window = self.config.regret_window;
        let stable = self.config.regret_stable_windows;
        let threshold = self.config.regret_slope_threshold;
        if cumulative.len() < window {
            return None;
        }

        let slopes: Vec<f64> = cumulative
            .windows(window)
            .map(|w| (w[window - 1] - w[0]) / (window as f64 - 1.0))
            .collect();

        for start in 0..slopes.len() {
            if start + stable >= slopes.len() {
                return None;
            }
            let settled = slopes[start..=start + stable].iter().all(|s| *s < threshold);
            if settled {
                return Some(start + window);
            }
        }
        None
    }

    /// Analyze one user's full observation sequence.
    pub fn analyze(&self, user_id: &str) -> AdaptResult<RegretReport> {
        let observations = self.store.regrets_for_user(user_id)?;
        let total_rounds = observations.len();

        let cumulative_regret = observations
            .last()
            .map(|o| o.cumulative_regret)
            .unwrap_or(0.0);
        let average_regret = if total_rounds > 0 {
            cumulative_regret / total_rounds as f64
        } else {
            0.0
        };
        let optimal_hits = observations
            .iter()
            .filter(|o| o.chosen_feature == o.optimal_feature)
            .count();
        let optimal_selection_rate = if total_rounds > 0 {
            optimal_hits as f64 / total_rounds as f64
        } else {
            0.0
        };

        let series: Vec<f64> = observations.iter().map(|o| o.cumulative_regret).collect();
        let convergence_round = self.convergence_round(&series);
        let theoretical_bound =
            self.theoretical_bound(self.config.default_order.len(), total_rounds);

        Ok(RegretReport {
            user_id: user_id.to_string(),
            total_rounds,
            cumulative_regret,
            average_regret,
            optimal_selection_rate,
            theoretical_bound,
            within_bound: cumulative_regret <= theoretical_bound || total_rounds < 2,
            converged: convergence_round.is_some(),
            convergence_round,
            computed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn make_analyzer() -> (RegretAnalyzer, Arc<InMemoryStore>) {
        let config = Arc::new(AdaptationConfig::default());
        let store = Arc::new(InMemoryStore::new());
        (RegretAnalyzer::new(config, store.clone()), store)
    }

    fn record(analyzer: &RegretAnalyzer, chosen: &str, chosen_r: f64, optimal: &str, optimal_r: f64) {
        analyzer
            .record_decision(&PlanContext::new("u1"), chosen, chosen_r, optimal, optimal_r)
            .unwrap();
    }

    #[test]
    fn test_always_optimal_means_zero_regret() {
        let (analyzer, _store) = make_analyzer();
        for _ in 0..30 {
            record(&analyzer, "vitals", 0.8, "vitals", 0.8);
        }

        let report = analyzer.analyze("u1").unwrap();
        assert_eq!(report.total_rounds, 30);
        assert_eq!(report.cumulative_regret, 0.0);
        assert_eq!(report.optimal_selection_rate, 1.0);
        assert!(report.within_bound);
    }

    #[test]
    fn test_cumulative_regret_is_non_decreasing() {
        let (analyzer, store) = make_analyzer();
        let rewards = [0.3, 0.8, 0.5, 0.8, 0.1];
        for chosen_reward in rewards {
            record(&analyzer, "imaging", chosen_reward, "vitals", 0.8);
        }

        let observations = store.regrets_for_user("u1").unwrap();
        let mut previous = 0.0;
        for obs in &observations {
            assert!(obs.cumulative_regret >= previous);
            previous = obs.cumulative_regret;
        }
        assert!((previous - (0.5 + 0.3 + 0.7)).abs() < 1e-12);
    }

    #[test]
    fn test_better_than_optimal_clamps_to_zero() {
        let (analyzer, store) = make_analyzer();
        record(&analyzer, "vitals", 0.9, "imaging", 0.7);
        let obs = &store.regrets_for_user("u1").unwrap()[0];
        assert_eq!(obs.instantaneous_regret, 0.0);
    }

    #[test]
    fn test_theoretical_bound_shape() {
        let (analyzer, _store) = make_analyzer();
        assert_eq!(analyzer.theoretical_bound(10, 0), 0.0);
        assert_eq!(analyzer.theoretical_bound(10, 1), 0.0);

        let b100 = analyzer.theoretical_bound(10, 100);
        let expected = 1.5 * (10.0 * 100.0 * (100.0_f64).ln()).sqrt();
        assert!((b100 - expected).abs() < 1e-9);
        assert!(analyzer.theoretical_bound(10, 400) > b100);
    }

    #[test]
    fn test_convergence_detected_after_plateau() {
        let (analyzer, _store) = make_analyzer();
        // Steep growth for 30 rounds, then flat: slope settles to zero.
        let mut series = Vec::new();
        let mut total = 0.0;
        for round in 0..80 {
            if round < 30 {
                total += 0.5;
            }
            series.push(total);
        }

        let converged_at = analyzer.convergence_round(&series).unwrap();
        // The first window fully inside the plateau starts at round 30.
        assert!(converged_at >= 30);
        assert!(converged_at < 60);
    }

    #[test]
    fn test_steady_growth_never_converges() {
        let (analyzer, _store) = make_analyzer();
        let series: Vec<f64> = (0..100).map(|i| i as f64 * 0.5).collect();
        assert!(analyzer.convergence_round(&series).is_none());
    }

    #[test]
    fn test_short_series_has_no_verdict() {
        let (analyzer, _store) = make_analyzer();
        let series = vec![0.0; 10];
        assert!(analyzer.convergence_round(&series).is_none());
    }
}
