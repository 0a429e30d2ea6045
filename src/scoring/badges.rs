use serde::{Deserialize, Serialize};

use super::validation::validate_badges;
use crate::error::{RankError, Result};

/// One contribution tier: `[min_points, max_points)`; the last tier has no
/// upper bound.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BadgeRule {
    pub min_points: i64,
    #[serde(default)]
    pub max_points: Option<i64>,
    pub icon: String,
    pub color: String,
    pub label: String,
}

impl BadgeRule {
    fn new(min_points: i64, max_points: Option<i64>, icon: &str, color: &str, label: &str) -> Self {
        Self {
            min_points,
            max_points,
            icon: icon.to_string(),
            color: color.to_string(),
            label: label.to_string(),
        }
    }

    pub fn contains(&self, points: i64) -> bool {
        points >= self.min_points && self.max_points.map_or(true, |max| points < max)
    }

    pub fn badge(&self) -> Badge {
        Badge {
            icon: self.icon.clone(),
            color: self.color.clone(),
            label: self.label.clone(),
        }
    }
}

/// Badge as rendered on a leaderboard entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    pub icon: String,
    pub color: String,
    pub label: String,
}

pub fn default_badge_rules() -> Vec<BadgeRule> {
    vec![
        BadgeRule::new(0, Some(50), "🥉", "bronze", "Bronze"),
        BadgeRule::new(50, Some(200), "🥈", "silver", "Silver"),
        BadgeRule::new(200, Some(1000), "🥇", "gold", "Gold"),
        BadgeRule::new(1000, Some(5000), "💠", "blue", "Platinum"),
        BadgeRule::new(5000, None, "💎", "purple", "Diamond"),
    ]
}

/// Administrator overlay, layered on top of the contribution badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminRole {
    Admin,
    SuperAdmin,
}

impl AdminRole {
    pub fn badge(&self) -> Badge {
        match self {
            AdminRole::Admin => Badge {
                icon: "🛡️".to_string(),
                color: "red".to_string(),
                label: "Admin".to_string(),
            },
            AdminRole::SuperAdmin => Badge {
                icon: "👑".to_string(),
                color: "amber".to_string(),
                label: "Super Admin".to_string(),
            },
        }
    }
}

/// Where a point total sits relative to the tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BadgeProgress {
    pub current: Badge,
    pub next: Option<Badge>,
    /// Points still needed for `next`; `None` at the top tier.
    pub points_to_next: Option<i64>,
    /// Points earned inside the current tier.
    pub points_in_tier: i64,
}

/// Validated, ordered badge tiers covering `[0, ∞)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BadgeTable {
    rules: Vec<BadgeRule>,
}

impl BadgeTable {
    /// Fails fast on gaps, overlaps or a bounded last tier.
    pub fn new(rules: Vec<BadgeRule>) -> Result<Self> {
        validate_badges(&rules).map_err(|errors| RankError::config(errors.join("; ")))?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[BadgeRule] {
        &self.rules
    }

    fn index_for(&self, points: i64) -> usize {
        // Validated tiers are contiguous from zero, so the first tier whose
        // upper bound exceeds `points` is the unique match.
        self.rules
            .iter()
            .position(|r| r.max_points.map_or(true, |max| points < max))
            .unwrap_or(self.rules.len() - 1)
    }

    pub fn rule_for(&self, points: i64) -> &BadgeRule {
        &self.rules[self.index_for(points)]
    }

    pub fn badge_for(&self, points: i64) -> Badge {
        self.rule_for(points).badge()
    }

    pub fn progress(&self, points: i64) -> BadgeProgress {
        let idx = self.index_for(points);
        let current = &self.rules[idx];
        let next = self.rules.get(idx + 1);
        BadgeProgress {
            current: current.badge(),
            next: next.map(BadgeRule::badge),
            points_to_next: next.map(|n| n.min_points - points),
            points_in_tier: points - current.min_points,
        }
    }
}

impl Default for BadgeTable {
    fn default() -> Self {
        Self {
            rules: default_badge_rules(),
        }
    }
}
