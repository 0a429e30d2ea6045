use std::time::Duration;
use thiserror::Error;

/// Errors raised by the scoring and ranking core.
///
/// A duplicate activity is deliberately absent: re-recording the same
/// `(user, activity type, resource)` is reported through
/// [`crate::activity::RecordOutcome::Duplicate`], not as a failure.
#[derive(Debug, Error)]
pub enum RankError {
    /// Unknown activity type, missing weight or malformed badge ranges
    #[error("configuration error: {0}")]
    Configuration(String),

    /// `total_points` no longer equals the sum of the category buckets
    #[error("aggregation drift for user {user_id}: total {total} != category sum {category_sum}")]
    AggregationDrift {
        user_id: String,
        total: i64,
        category_sum: i64,
    },

    /// A ranking pass did not finish within its budget
    #[error("rank refresh exceeded its {0:?} budget")]
    RankEngineTimeout(Duration),

    /// A ranking pass died before producing a result
    #[error("rank refresh aborted: {0}")]
    RefreshAborted(String),

    #[error("event journal I/O error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("event journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RankError {
    pub fn config(msg: impl Into<String>) -> Self {
        RankError::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RankError>;
