use serde::{Deserialize, Serialize};

/// Coarse time-of-day bucket used to partition bandit statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDayBucket {
    #[default]
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDayBucket {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            6..=11 => Self::Morning,
            12..=17 => Self::Afternoon,
            18..=22 => Self::Evening,
            _ => Self::Night,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Morning => "morning",
            Self::Afternoon => "afternoon",
            Self::Evening => "evening",
            Self::Night => "night",
        }
    }
}

/// Resolved request context for one plan or feedback call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanContext {
    pub user_id: String,
    pub specialty: Option<String>,
    pub time_of_day: TimeOfDayBucket,
    pub workflow_state: Option<String>,
}

impl PlanContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            specialty: None,
            time_of_day: TimeOfDayBucket::default(),
            workflow_state: None,
        }
    }

    pub fn with_specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialty = Some(specialty.into());
        self
    }

    pub fn with_time_of_day(mut self, bucket: TimeOfDayBucket) -> Self {
        self.time_of_day = bucket;
        self
    }

    /// Grouping key under which a user's bandit statistics are partitioned.
    pub fn context_hash(&self) -> String {
        let specialty = self.specialty.as_deref().unwrap_or("any");
        format!("{}:{}", specialty.to_lowercase(), self.time_of_day.as_str())
    }
}

/// What the constraint engine decided for one feature in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationAction {
    Promoted,
    Demoted,
    Maintained,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_buckets_cover_all_hours() {
        assert_eq!(TimeOfDayBucket::from_hour(7), TimeOfDayBucket::Morning);
        assert_eq!(TimeOfDayBucket::from_hour(13), TimeOfDayBucket::Afternoon);
        assert_eq!(TimeOfDayBucket::from_hour(20), TimeOfDayBucket::Evening);
        assert_eq!(TimeOfDayBucket::from_hour(2), TimeOfDayBucket::Night);
        assert_eq!(TimeOfDayBucket::from_hour(23), TimeOfDayBucket::Night);
    }

    #[test]
    fn test_context_hash_includes_specialty_and_bucket() {
        let ctx = PlanContext::new("u1")
            .with_specialty("Cardiology")
            .with_time_of_day(TimeOfDayBucket::Morning);
        assert_eq!(ctx.context_hash(), "cardiology:morning");

        let anon = PlanContext::new("u2").with_time_of_day(TimeOfDayBucket::Night);
        assert_eq!(anon.context_hash(), "any:night");
    }
}
