//! Self-adaptive dashboard layout engine — per-user Thompson Sampling
//! over Beta beliefs, prior transfer for cold/warm starts, a safety
//! constraint layer, and regret analysis for convergence validation.

pub mod arms;
pub mod constraints;
pub mod feedback;
pub mod holdout;
pub mod planner;
pub mod priors;
pub mod regret;
pub mod sampler;
pub mod store;

pub use arms::{ArmKey, BanditArm};
pub use constraints::{ConstraintEngine, ConstraintOutcome};
pub use feedback::FeedbackRecorder;
pub use holdout::{HoldoutCohort, HoldoutManager, LiftReport};
pub use planner::{AdaptiveLayoutEngine, FeatureStats, LayoutPlan};
pub use priors::{aggregate_priors, BlendedParams, PriorProvider, PriorSource, TransferPrior};
pub use regret::{RegretAnalyzer, RegretObservation, RegretReport};
pub use sampler::ThompsonSampler;
pub use store::{AdaptationDecisionLog, AdaptiveStore, InMemoryStore};
