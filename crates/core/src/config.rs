use serde::Deserialize;
use std::collections::HashMap;

use crate::error::{AdaptError, AdaptResult};

/// Root application configuration. Loaded from environment variables
/// with the prefix `PULSEBOARD__` and TOML config files.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub adaptation: AdaptationConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            adaptation: AdaptationConfig::default(),
        }
    }
}

// ─── Adaptation Config ──────────────────────────────────────────────────

/// Static prior parameters for one feature, configurable per specialty.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PriorSeed {
    pub alpha: f64,
    pub beta: f64,
}

/// Every tunable of the adaptive layout engine, constructed once and
/// passed in immutably. Cooldowns and budgets bound how fast the layout
/// may drift; the weight pair encodes the exploration-favoring update
/// asymmetry (failures penalized at half the rate successes are rewarded).
#[derive(Debug, Clone, Deserialize)]
pub struct AdaptationConfig {
    #[serde(default = "default_promotion_cooldown_hours")]
    pub promotion_cooldown_hours: i64,
    #[serde(default = "default_demotion_cooldown_hours")]
    pub demotion_cooldown_hours: i64,
    #[serde(default = "default_max_promotions_per_cycle")]
    pub max_promotions_per_cycle: usize,
    #[serde(default = "default_max_demotions_per_cycle")]
    pub max_demotions_per_cycle: usize,
    /// Posterior-variance ceiling above which a demotion is too uncertain
    /// to grant.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_success_weight")]
    pub success_weight: f64,
    #[serde(default = "default_failure_weight")]
    pub failure_weight: f64,
    /// Feature keys that may never land below their baseline position.
    #[serde(default = "default_critical_features")]
    pub critical_features: Vec<String>,
    /// Baseline dashboard order; also the candidate feature set.
    #[serde(default = "default_feature_order")]
    pub default_order: Vec<String>,
    /// Static specialty → feature → prior parameters, seeded into the
    /// store at engine construction when no aggregated row exists yet.
    #[serde(default)]
    pub specialty_priors: HashMap<String, HashMap<String, PriorSeed>>,
    /// Minimum distinct users behind a specialty prior before it is
    /// trusted over the global one.
    #[serde(default = "default_min_specialty_users")]
    pub min_specialty_users: u64,
    #[serde(default = "default_cold_start_days")]
    pub cold_start_days: f64,
    #[serde(default = "default_warm_start_days")]
    pub warm_start_days: f64,
    /// Prior weight at the start of the warm-start window; decays
    /// linearly to zero by `warm_start_days`.
    #[serde(default = "default_warm_start_prior_weight")]
    pub warm_start_prior_weight: f64,
    #[serde(default = "default_regret_window")]
    pub regret_window: usize,
    #[serde(default = "default_regret_slope_threshold")]
    pub regret_slope_threshold: f64,
    #[serde(default = "default_regret_stable_windows")]
    pub regret_stable_windows: usize,
    /// C in the Bayesian regret reference bound C·√(K·T·ln T).
    #[serde(default = "default_regret_bound_constant")]
    pub regret_bound_constant: f64,
    #[serde(default = "default_holdout_enabled")]
    pub holdout_enabled: bool,
    #[serde(default = "default_holdout_percentage")]
    pub holdout_percentage: f64,
}

fn default_promotion_cooldown_hours() -> i64 { 24 }
fn default_demotion_cooldown_hours() -> i64 { 168 }
fn default_max_promotions_per_cycle() -> usize { 3 }
fn default_max_demotions_per_cycle() -> usize { 1 }
fn default_confidence_threshold() -> f64 { 0.1 }
fn default_success_weight() -> f64 { 1.0 }
fn default_failure_weight() -> f64 { 0.5 }
fn default_min_specialty_users() -> u64 { 3 }
fn default_cold_start_days() -> f64 { 7.0 }
fn default_warm_start_days() -> f64 { 30.0 }
fn default_warm_start_prior_weight() -> f64 { 0.7 }
fn default_regret_window() -> usize { 20 }
fn default_regret_slope_threshold() -> f64 { 0.1 }
fn default_regret_stable_windows() -> usize { 5 }
fn default_regret_bound_constant() -> f64 { 1.5 }
fn default_holdout_enabled() -> bool { false }
fn default_holdout_percentage() -> f64 { 0.1 }

fn default_critical_features() -> Vec<String> {
    ["allergies", "safety_alerts", "medications", "vitals"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_feature_order() -> Vec<String> {
    [
        "patient_summary",
        "safety_alerts",
        "allergies",
        "medications",
        "vitals",
        "lab_results",
        "imaging",
        "clinical_notes",
        "orders",
        "care_team",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            promotion_cooldown_hours: default_promotion_cooldown_hours(),
            demotion_cooldown_hours: default_demotion_cooldown_hours(),
            max_promotions_per_cycle: default_max_promotions_per_cycle(),
            max_demotions_per_cycle: default_max_demotions_per_cycle(),
            confidence_threshold: default_confidence_threshold(),
            success_weight: default_success_weight(),
            failure_weight: default_failure_weight(),
            critical_features: default_critical_features(),
            default_order: default_feature_order(),
            specialty_priors: HashMap::new(),
            min_specialty_users: default_min_specialty_users(),
            cold_start_days: default_cold_start_days(),
            warm_start_days: default_warm_start_days(),
            warm_start_prior_weight: default_warm_start_prior_weight(),
            regret_window: default_regret_window(),
            regret_slope_threshold: default_regret_slope_threshold(),
            regret_stable_windows: default_regret_stable_windows(),
            regret_bound_constant: default_regret_bound_constant(),
            holdout_enabled: default_holdout_enabled(),
            holdout_percentage: default_holdout_percentage(),
        }
    }
}

impl AdaptationConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> AdaptResult<()> {
        if self.default_order.is_empty() {
            return Err(AdaptError::Config("default_order must not be empty".into()));
        }
        for feature in &self.critical_features {
            if !self.default_order.contains(feature) {
                return Err(AdaptError::Config(format!(
                    "critical feature '{}' is not in default_order",
                    feature
                )));
            }
        }
        if self.success_weight <= 0.0 || self.failure_weight <= 0.0 {
            return Err(AdaptError::Config(
                "success_weight and failure_weight must be positive".into(),
            ));
        }
        if self.cold_start_days >= self.warm_start_days {
            return Err(AdaptError::Config(
                "cold_start_days must be below warm_start_days".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.warm_start_prior_weight) {
            return Err(AdaptError::Config(
                "warm_start_prior_weight must be in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.holdout_percentage) {
            return Err(AdaptError::Config(
                "holdout_percentage must be in [0, 1]".into(),
            ));
        }
        if self.regret_window < 2 {
            return Err(AdaptError::Config("regret_window must be at least 2".into()));
        }
        Ok(())
    }

    pub fn is_critical(&self, feature: &str) -> bool {
        self.critical_features.iter().any(|f| f == feature)
    }

    /// Baseline position of a feature, or `None` when it is not a
    /// candidate at all.
    pub fn baseline_position(&self, feature: &str) -> Option<usize> {
        self.default_order.iter().position(|f| f == feature)
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("PULSEBOARD")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AdaptationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.promotion_cooldown_hours, 24);
        assert_eq!(config.demotion_cooldown_hours, 168);
        assert_eq!(config.max_promotions_per_cycle, 3);
        assert_eq!(config.max_demotions_per_cycle, 1);
        assert_eq!(config.success_weight, 1.0);
        assert_eq!(config.failure_weight, 0.5);
    }

    #[test]
    fn test_critical_features_are_candidates() {
        let config = AdaptationConfig::default();
        for feature in &config.critical_features {
            assert!(config.baseline_position(feature).is_some());
        }
    }

    #[test]
    fn test_rejects_critical_feature_outside_order() {
        let config = AdaptationConfig {
            critical_features: vec!["telemetry".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_positive_weights() {
        let config = AdaptationConfig {
            failure_weight: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
