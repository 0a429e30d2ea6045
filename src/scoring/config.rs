use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::activity::ActivityType;
use crate::error::{RankError, Result};

/// Main scoring configuration.
///
/// Maps each activity type to the points it is worth. Keys are the
/// snake_case activity names; they are checked by
/// [`validate_scoring`](super::validate_scoring) rather than by the parser so
/// every typo is reported at once.
///
/// Example YAML:
/// ```yaml
/// scoring:
///   weights:
///     paper_upload: 10
///     review_written: 15
///     post_created: 5
///     ticket_created: 3
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScoringConfig {
    #[serde(default)]
    pub weights: BTreeMap<String, i64>,
}

const DEFAULT_WEIGHTS: [(ActivityType, i64); 12] = [
    (ActivityType::PaperUpload, 10),
    (ActivityType::PaperDownloaded, 2),
    (ActivityType::PaperMarkedHelpful, 2),
    (ActivityType::ReviewWritten, 15),
    (ActivityType::ReviewQualityBonus, 5),
    (ActivityType::ReviewMarkedHelpful, 1),
    (ActivityType::PostCreated, 5),
    (ActivityType::PostLiked, 3),
    (ActivityType::PostCommentReceived, 1),
    (ActivityType::PostPopularBonus, 7),
    (ActivityType::TicketCreated, 3),
    (ActivityType::TicketResolved, 10),
];

impl Default for ScoringConfig {
    fn default() -> Self {
        let weights = DEFAULT_WEIGHTS
            .iter()
            .map(|(t, w)| (t.as_str().to_string(), *w))
            .collect();

        Self { weights }
    }
}

/// Resolved per-activity weights, looked up once when an activity is recorded.
///
/// Activity types with no configured weight are not worth zero: looking
/// them up is a configuration error.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTable {
    weights: HashMap<ActivityType, i64>,
}

impl WeightTable {
    /// Build from a config. Unknown activity names are rejected; call
    /// `validate_scoring` first to get every problem at once.
    pub fn from_config(config: &ScoringConfig) -> Result<Self> {
        let mut weights = HashMap::new();
        for (name, weight) in &config.weights {
            let kind: ActivityType = name.parse()?;
            weights.insert(kind, *weight);
        }
        Ok(Self { weights })
    }

    pub fn weight_for(&self, kind: ActivityType) -> Result<i64> {
        self.weights.get(&kind).copied().ok_or_else(|| {
            RankError::config(format!("no weight configured for activity type '{}'", kind))
        })
    }
}

impl Default for WeightTable {
    fn default() -> Self {
        Self {
            weights: DEFAULT_WEIGHTS.into_iter().collect(),
        }
    }
}
