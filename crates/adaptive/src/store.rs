//! Storage boundary for arms, priors, and the append-only decision and
//! regret logs.
//!
//! The engine talks to a [`AdaptiveStore`] trait so the serving layer can
//! plug in its durable backend; [`InMemoryStore`] is the in-process
//! implementation used by tests and single-node deployments. All storage
//! is keyed `DashMap`s, and per-arm mutation happens under the map's
//! entry lock, which is what makes `update_arm` a row-scoped
//! read-modify-write rather than a lost-update race.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pulseboard_core::{AdaptError, AdaptResult, AdaptationAction};

use crate::arms::{ArmKey, BanditArm};
use crate::priors::TransferPrior;
use crate::regret::{RegretObservation, RegretSample};

/// One append-only audit row per arm per decision cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationDecisionLog {
    pub id: Uuid,
    pub user_id: String,
    pub context_hash: String,
    pub feature_key: String,
    pub action: AdaptationAction,
    pub sampled_value: f64,
    pub alpha_before: f64,
    pub beta_before: f64,
    pub old_position: usize,
    pub new_position: usize,
    pub constraint_applied: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Durable-store boundary consumed by the engine.
///
/// Implementations must make `update_arm` atomic per arm row (optimistic
/// retry or row-level locking both qualify) and must compute the
/// cumulative total inside `append_regret` under the user's row lock so
/// the series stays monotone under concurrent appends.
pub trait AdaptiveStore: Send + Sync {
    fn get_arm(&self, key: &ArmKey) -> AdaptResult<Option<BanditArm>>;

    /// Insert the arm if absent; on a concurrent race the first writer
    /// wins and the existing row is returned.
    fn put_arm(&self, arm: BanditArm) -> AdaptResult<BanditArm>;

    /// Row-scoped atomic read-modify-write of one arm.
    fn update_arm(
        &self,
        key: &ArmKey,
        mutate: &mut dyn FnMut(&mut BanditArm),
    ) -> AdaptResult<BanditArm>;

    /// Snapshot of every arm, for batch aggregation jobs.
    fn arms_snapshot(&self) -> AdaptResult<Vec<BanditArm>>;

    /// When this user first interacted with the system (first arm
    /// creation), if ever.
    fn first_interaction_at(&self, user_id: &str) -> AdaptResult<Option<DateTime<Utc>>>;

    fn global_prior(&self, feature_key: &str) -> AdaptResult<Option<TransferPrior>>;

    fn specialty_prior(
        &self,
        specialty: &str,
        feature_key: &str,
    ) -> AdaptResult<Option<TransferPrior>>;

    /// Upsert a prior row; the scope is taken from `prior.specialty`.
    fn put_prior(&self, prior: TransferPrior) -> AdaptResult<()>;

    fn append_decisions(&self, rows: Vec<AdaptationDecisionLog>) -> AdaptResult<()>;

    fn decisions_for_user(&self, user_id: &str) -> AdaptResult<Vec<AdaptationDecisionLog>>;

    /// Append one regret observation, assigning its cumulative total from
    /// the user's running series.
    fn append_regret(&self, sample: RegretSample) -> AdaptResult<RegretObservation>;

    fn regrets_for_user(&self, user_id: &str) -> AdaptResult<Vec<RegretObservation>>;
}

/// In-process store. Every map is sharded by key, so unrelated users and
/// arms never contend.
#[derive(Default)]
pub struct InMemoryStore {
    arms: DashMap<ArmKey, BanditArm>,
    first_seen: DashMap<String, DateTime<Utc>>,
    global_priors: DashMap<String, TransferPrior>,
    specialty_priors: DashMap<(String, String), TransferPrior>,
    decisions: DashMap<String, Vec<AdaptationDecisionLog>>,
    regrets: DashMap<String, Vec<RegretObservation>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdaptiveStore for InMemoryStore {
    fn get_arm(&self, key: &ArmKey) -> AdaptResult<Option<BanditArm>> {
        Ok(self.arms.get(key).map(|a| a.clone()))
    }

    fn put_arm(&self, arm: BanditArm) -> AdaptResult<BanditArm> {
        self.first_seen
            .entry(arm.user_id.clone())
            .or_insert(arm.created_at);
        let entry = self.arms.entry(arm.key()).or_insert(arm);
        Ok(entry.clone())
    }

    fn update_arm(
        &self,
        key: &ArmKey,
        mutate: &mut dyn FnMut(&mut BanditArm),
    ) -> AdaptResult<BanditArm> {
        let mut entry = self.arms.get_mut(key).ok_or_else(|| {
            AdaptError::Storage(format!(
                "arm not found: user={} feature={} context={}",
                key.user_id, key.feature_key, key.context_hash
            ))
        })?;
        mutate(entry.value_mut());
        Ok(entry.clone())
    }

    fn arms_snapshot(&self) -> AdaptResult<Vec<BanditArm>> {
        Ok(self.arms.iter().map(|e| e.value().clone()).collect())
    }

    fn first_interaction_at(&self, user_id: &str) -> AdaptResult<Option<DateTime<Utc>>> {
        Ok(self.first_seen.get(user_id).map(|t| *t))
    }

    fn global_prior(&self, feature_key: &str) -> AdaptResult<Option<TransferPrior>> {
        Ok(self.global_priors.get(feature_key).map(|p| p.clone()))
    }

    fn specialty_prior(
        &self,
        specialty: &str,
        feature_key: &str,
    ) -> AdaptResult<Option<TransferPrior>> {
        Ok(self
            .specialty_priors
            .get(&(specialty.to_string(), feature_key.to_string()))
            .map(|p| p.clone()))
    }

    fn put_prior(&self, prior: TransferPrior) -> AdaptResult<()> {
        match &prior.specialty {
            Some(specialty) => {
                self.specialty_priors
                    .insert((specialty.clone(), prior.feature_key.clone()), prior);
            }
            None => {
                self.global_priors.insert(prior.feature_key.clone(), prior);
            }
        }
        Ok(())
    }

    fn append_decisions(&self, rows: Vec<AdaptationDecisionLog>) -> AdaptResult<()> {
        for row in rows {
            self.decisions
                .entry(row.user_id.clone())
                .or_default()
                .push(row);
        }
        Ok(())
    }

    fn decisions_for_user(&self, user_id: &str) -> AdaptResult<Vec<AdaptationDecisionLog>> {
        Ok(self
            .decisions
            .get(user_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    fn append_regret(&self, sample: RegretSample) -> AdaptResult<RegretObservation> {
        // The entry guard is held across the read of the previous total
        // and the push, keeping the cumulative series monotone.
        let mut rows = self.regrets.entry(sample.user_id.clone()).or_default();
        let previous = rows.last().map(|r| r.cumulative_regret).unwrap_or(0.0);
        let observation = RegretObservation {
            id: Uuid::new_v4(),
            user_id: sample.user_id,
            context_hash: sample.context_hash,
            chosen_feature: sample.chosen_feature,
            optimal_feature: sample.optimal_feature,
            chosen_reward: sample.chosen_reward,
            optimal_reward: sample.optimal_reward,
            instantaneous_regret: sample.instantaneous_regret,
            cumulative_regret: previous + sample.instantaneous_regret,
            observed_at: Utc::now(),
        };
        rows.push(observation.clone());
        Ok(observation)
    }

    fn regrets_for_user(&self, user_id: &str) -> AdaptResult<Vec<RegretObservation>> {
        Ok(self
            .regrets
            .get(user_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_arm(user: &str, feature: &str) -> BanditArm {
        BanditArm::new(
            ArmKey::new(user, feature, "any:morning"),
            1.0,
            1.0,
            false,
            Utc::now(),
        )
    }

    #[test]
    fn test_put_arm_first_writer_wins() {
        let store = InMemoryStore::new();
        let mut first = make_arm("u1", "vitals");
        first.alpha = 2.0;
        store.put_arm(first).unwrap();

        let second = make_arm("u1", "vitals");
        let winner = store.put_arm(second).unwrap();
        assert_eq!(winner.alpha, 2.0, "existing row must survive the race");
    }

    #[test]
    fn test_update_arm_missing_row_is_storage_error() {
        let store = InMemoryStore::new();
        let key = ArmKey::new("ghost", "vitals", "any:morning");
        let result = store.update_arm(&key, &mut |arm| arm.alpha += 1.0);
        assert!(matches!(result, Err(AdaptError::Storage(_))));
    }

    #[test]
    fn test_first_interaction_tracked_at_arm_creation() {
        let store = InMemoryStore::new();
        assert!(store.first_interaction_at("u1").unwrap().is_none());

        let arm = make_arm("u1", "vitals");
        let created = arm.created_at;
        store.put_arm(arm).unwrap();
        assert_eq!(store.first_interaction_at("u1").unwrap(), Some(created));

        // A later arm does not move the first-seen timestamp.
        store.put_arm(make_arm("u1", "imaging")).unwrap();
        assert_eq!(store.first_interaction_at("u1").unwrap(), Some(created));
    }

    #[test]
    fn test_regret_cumulative_is_running_total() {
        let store = InMemoryStore::new();
        for regret in [0.2, 0.0, 0.3] {
            store
                .append_regret(RegretSample {
                    user_id: "u1".into(),
                    context_hash: "any:morning".into(),
                    chosen_feature: "vitals".into(),
                    optimal_feature: "imaging".into(),
                    chosen_reward: 0.5,
                    optimal_reward: 0.5 + regret,
                    instantaneous_regret: regret,
                })
                .unwrap();
        }
        let rows = store.regrets_for_user("u1").unwrap();
        let cumulative: Vec<f64> = rows.iter().map(|r| r.cumulative_regret).collect();
        assert_eq!(cumulative, vec![0.2, 0.2, 0.5]);
    }

    #[test]
    fn test_priors_scoped_by_specialty() {
        let store = InMemoryStore::new();
        store
            .put_prior(TransferPrior::global("vitals", 3.0, 1.0, Utc::now()))
            .unwrap();
        store
            .put_prior(TransferPrior::for_specialty(
                "cardiology",
                "vitals",
                5.0,
                1.0,
                Utc::now(),
            ))
            .unwrap();

        assert_eq!(store.global_prior("vitals").unwrap().unwrap().alpha_prior, 3.0);
        assert_eq!(
            store
                .specialty_prior("cardiology", "vitals")
                .unwrap()
                .unwrap()
                .alpha_prior,
            5.0
        );
        assert!(store.specialty_prior("oncology", "vitals").unwrap().is_none());
    }
}
