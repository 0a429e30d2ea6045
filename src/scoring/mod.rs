pub mod aggregator;
pub mod badges;
pub mod config;
pub mod validation;

pub use aggregator::{ScoreAggregator, UserContribution};
pub use badges::{default_badge_rules, AdminRole, Badge, BadgeProgress, BadgeRule, BadgeTable};
pub use config::{ScoringConfig, WeightTable};
pub use validation::{validate_badges, validate_scoring};
