use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::scoring::{AdminRole, Badge, BadgeTable, UserContribution};

/// Community role granted outside this engine and only rendered here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GamificationRole {
    ContentCurator,
    CommunityModerator,
    TechSupport,
    CampusAmbassador,
}

impl GamificationRole {
    pub fn label(&self) -> &'static str {
        match self {
            GamificationRole::ContentCurator => "Content Curator",
            GamificationRole::CommunityModerator => "Community Mod",
            GamificationRole::TechSupport => "Tech Support",
            GamificationRole::CampusAmbassador => "Ambassador",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            GamificationRole::ContentCurator => "🎯",
            GamificationRole::CommunityModerator => "👥",
            GamificationRole::TechSupport => "🛠️",
            GamificationRole::CampusAmbassador => "🎓",
        }
    }
}

/// One row of the external role source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleGrant {
    pub user_id: String,
    #[serde(default)]
    pub admin: Option<AdminRole>,
    #[serde(default)]
    pub gamification_role: Option<GamificationRole>,
}

/// Read-only lookup of admin and gamification roles by user.
#[derive(Debug, Clone, Default)]
pub struct RoleDirectory {
    grants: HashMap<String, RoleGrant>,
}

impl RoleDirectory {
    /// Later grants for the same user replace earlier ones.
    pub fn new(grants: impl IntoIterator<Item = RoleGrant>) -> Self {
        Self {
            grants: grants
                .into_iter()
                .map(|g| (g.user_id.clone(), g))
                .collect(),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<&RoleGrant> {
        self.grants.get(user_id)
    }

    pub fn admin_role(&self, user_id: &str) -> Option<AdminRole> {
        self.get(user_id).and_then(|g| g.admin)
    }

    pub fn gamification_role(&self, user_id: &str) -> Option<GamificationRole> {
        self.get(user_id).and_then(|g| g.gamification_role)
    }
}

/// Badge and role decoration for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub badge: Badge,
    /// Admin overlay, shown alongside `badge`.
    pub admin_badge: Option<Badge>,
    pub gamification_role: Option<GamificationRole>,
}

impl Assignment {
    pub fn is_admin(&self) -> bool {
        self.admin_badge.is_some()
    }
}

/// Maps point totals to badges and merges in externally granted roles.
#[derive(Debug, Clone, Default)]
pub struct BadgeAssigner {
    badges: BadgeTable,
    roles: RoleDirectory,
}

impl BadgeAssigner {
    pub fn new(badges: BadgeTable, roles: RoleDirectory) -> Self {
        Self { badges, roles }
    }

    pub fn badges(&self) -> &BadgeTable {
        &self.badges
    }

    pub fn assign(&self, user_id: &str, total_points: i64) -> Assignment {
        Assignment {
            badge: self.badges.badge_for(total_points),
            admin_badge: self.roles.admin_role(user_id).map(|r| r.badge()),
            gamification_role: self.roles.gamification_role(user_id),
        }
    }

    pub fn assign_contribution(&self, contribution: &UserContribution) -> Assignment {
        self.assign(&contribution.user_id, contribution.total_points)
    }
}
