pub mod config;
pub mod error;
pub mod types;

pub use config::{AdaptationConfig, AppConfig, PriorSeed};
pub use error::{AdaptError, AdaptResult};
pub use types::{AdaptationAction, PlanContext, TimeOfDayBucket};
