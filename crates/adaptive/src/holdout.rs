//! Holdout control cohort — measures whether adaptation actually helps.
//!
//! A stable fraction of users always sees the baseline layout. Comparing
//! their interaction success rate against the adaptive cohort gives the
//! lift attributable to the engine, with a two-proportion z-test for
//! significance.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use pulseboard_core::AdaptationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldoutCohort {
    Adaptive,
    Control,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiftReport {
    pub specialty: String,
    pub adaptive_successes: u64,
    pub adaptive_total: u64,
    pub adaptive_rate: f64,
    pub control_successes: u64,
    pub control_total: u64,
    pub control_rate: f64,
    pub absolute_lift: f64,
    pub relative_lift: f64,
    pub p_value: f64,
    pub is_significant: bool,
    pub computed_at: DateTime<Utc>,
}

pub struct HoldoutManager {
    config: Arc<AdaptationConfig>,
    adaptive_data: DashMap<String, (u64, u64)>,
    control_data: DashMap<String, (u64, u64)>,
}

impl HoldoutManager {
    pub fn new(config: Arc<AdaptationConfig>) -> Self {
        Self {
            config,
            adaptive_data: DashMap::new(),
            control_data: DashMap::new(),
        }
    }

    /// Deterministic cohort assignment: the same user lands in the same
    /// bucket on every call.
    pub fn assign_cohort(&self, user_id: &str) -> HoldoutCohort {
        if !self.config.holdout_enabled {
            return HoldoutCohort::Adaptive;
        }
        let bucket = (hash_user(user_id) % 100) as f64 / 100.0;
        if bucket < self.config.holdout_percentage {
            HoldoutCohort::Control
        } else {
            HoldoutCohort::Adaptive
        }
    }

    pub fn record_outcome(&self, specialty: Option<&str>, cohort: HoldoutCohort, success: bool) {
        let data = match cohort {
            HoldoutCohort::Adaptive => &self.adaptive_data,
            HoldoutCohort::Control => &self.control_data,
        };
        data.entry(specialty.unwrap_or("all").to_string())
            .and_modify(|(total, successes)| {
                *total += 1;
                if success {
                    *successes += 1;
                }
            })
            .or_insert(if success { (1, 1) } else { (1, 0) });
    }

    pub fn report(&self, specialty: Option<&str>) -> LiftReport {
        let key = specialty.unwrap_or("all");
        let (a_total, a_succ) = self.adaptive_data.get(key).map(|d| *d).unwrap_or((0, 0));
        let (c_total, c_succ) = self.control_data.get(key).map(|d| *d).unwrap_or((0, 0));

        let a_rate = if a_total > 0 {
            a_succ as f64 / a_total as f64
        } else {
            0.0
        };
        let c_rate = if c_total > 0 {
            c_succ as f64 / c_total as f64
        } else {
            0.0
        };

        let absolute_lift = a_rate - c_rate;
        let relative_lift = if c_rate > 0.0 {
            absolute_lift / c_rate
        } else {
            0.0
        };
        let p_value = two_proportion_z_test(a_succ, a_total, c_succ, c_total);

        LiftReport {
            specialty: key.to_string(),
            adaptive_successes: a_succ,
            adaptive_total: a_total,
            adaptive_rate: a_rate,
            control_successes: c_succ,
            control_total: c_total,
            control_rate: c_rate,
            absolute_lift,
            relative_lift,
            p_value,
            is_significant: p_value < 0.05,
            computed_at: Utc::now(),
        }
    }
}

fn hash_user(user_id: &str) -> u64 {
    // FNV-1a keeps assignment stable across restarts without any stored
    // cohort table.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in user_id.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn two_proportion_z_test(x1: u64, n1: u64, x2: u64, n2: u64) -> f64 {
    if n1 == 0 || n2 == 0 {
        return 1.0;
    }
    let p1 = x1 as f64 / n1 as f64;
    let p2 = x2 as f64 / n2 as f64;
    let p = (x1 + x2) as f64 / (n1 + n2) as f64;
    let se = (p * (1.0 - p) * (1.0 / n1 as f64 + 1.0 / n2 as f64)).sqrt();
    if se == 0.0 {
        return 1.0;
    }
    let z = (p1 - p2).abs() / se;
    // Approximate p-value from z-score using error function approximation
    let t = 1.0 / (1.0 + 0.2316419 * z);
    let d = 0.3989422804014327;
    let p_val = d
        * (-z * z / 2.0).exp()
        * (t * (0.3193815
            + t * (-0.3565638 + t * (1.781478 + t * (-1.821256 + t * 1.330274)))));
    2.0 * p_val
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_manager(enabled: bool, percentage: f64) -> HoldoutManager {
        HoldoutManager::new(Arc::new(AdaptationConfig {
            holdout_enabled: enabled,
            holdout_percentage: percentage,
            ..Default::default()
        }))
    }

    #[test]
    fn test_disabled_holdout_keeps_everyone_adaptive() {
        let manager = make_manager(false, 0.5);
        for i in 0..50 {
            let user = format!("user-{}", i);
            assert_eq!(manager.assign_cohort(&user), HoldoutCohort::Adaptive);
        }
    }

    #[test]
    fn test_assignment_is_stable_per_user() {
        let manager = make_manager(true, 0.3);
        for i in 0..50 {
            let user = format!("user-{}", i);
            let first = manager.assign_cohort(&user);
            for _ in 0..5 {
                assert_eq!(manager.assign_cohort(&user), first);
            }
        }
    }

    #[test]
    fn test_full_holdout_puts_everyone_in_control() {
        let manager = make_manager(true, 1.0);
        for i in 0..20 {
            let user = format!("user-{}", i);
            assert_eq!(manager.assign_cohort(&user), HoldoutCohort::Control);
        }
    }

    #[test]
    fn test_lift_report_compares_cohorts() {
        let manager = make_manager(true, 0.1);
        // Adaptive cohort converts at 0.8, control at 0.4.
        for i in 0..100 {
            manager.record_outcome(Some("cardiology"), HoldoutCohort::Adaptive, i % 5 != 0);
            manager.record_outcome(Some("cardiology"), HoldoutCohort::Control, i % 5 < 2);
        }

        let report = manager.report(Some("cardiology"));
        assert_eq!(report.adaptive_total, 100);
        assert_eq!(report.control_total, 100);
        assert!((report.adaptive_rate - 0.8).abs() < 1e-12);
        assert!((report.control_rate - 0.4).abs() < 1e-12);
        assert!((report.absolute_lift - 0.4).abs() < 1e-12);
        assert!((report.relative_lift - 1.0).abs() < 1e-12);
        assert!(report.p_value < 0.05);
        assert!(report.is_significant);
    }

    #[test]
    fn test_empty_cohorts_are_not_significant() {
        let manager = make_manager(true, 0.1);
        let report = manager.report(None);
        assert_eq!(report.p_value, 1.0);
        assert!(!report.is_significant);
    }
}
