use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::activity::{ActivityEvent, Category, EventStore};
use crate::error::RankError;
use crate::scoring::{ScoreAggregator, UserContribution};

/// Which point total a leaderboard ranks by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankCategory {
    #[default]
    Overall,
    Papers,
    Reviews,
    Community,
    Helpdesk,
}

impl RankCategory {
    /// The category bucket ranked, or `None` for the overall total.
    pub fn bucket(&self) -> Option<Category> {
        match self {
            RankCategory::Overall => None,
            RankCategory::Papers => Some(Category::Papers),
            RankCategory::Reviews => Some(Category::Reviews),
            RankCategory::Community => Some(Category::Community),
            RankCategory::Helpdesk => Some(Category::Helpdesk),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self.bucket() {
            None => "overall",
            Some(c) => c.as_str(),
        }
    }
}

impl fmt::Display for RankCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RankCategory {
    type Err = RankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "overall" => Ok(RankCategory::Overall),
            "papers" => Ok(RankCategory::Papers),
            "reviews" => Ok(RankCategory::Reviews),
            "community" => Ok(RankCategory::Community),
            "helpdesk" => Ok(RankCategory::Helpdesk),
            other => Err(RankError::config(format!(
                "unknown leaderboard category '{}' (expected overall, papers, reviews, community or helpdesk)",
                other
            ))),
        }
    }
}

/// Selects the users and the point total a leaderboard ranks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Scope {
    pub category: RankCategory,
    pub campus_id: Option<String>,
    pub department_id: Option<String>,
    /// Inclusive lower bound on `occurred_at`.
    pub window_start: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `occurred_at`.
    pub window_end: Option<DateTime<Utc>>,
}

impl Scope {
    pub fn overall() -> Self {
        Self::default()
    }

    pub fn category(category: RankCategory) -> Self {
        Self {
            category,
            ..Self::default()
        }
    }

    pub fn with_campus(mut self, campus_id: impl Into<String>) -> Self {
        self.campus_id = Some(campus_id.into());
        self
    }

    pub fn with_department(mut self, department_id: impl Into<String>) -> Self {
        self.department_id = Some(department_id.into());
        self
    }

    pub fn with_window(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.window_start = start;
        self.window_end = end;
        self
    }

    pub fn is_windowed(&self) -> bool {
        self.window_start.is_some() || self.window_end.is_some()
    }

    /// Canonical form used as the snapshot cache key.
    pub fn cache_key(&self) -> String {
        let window = |t: &Option<DateTime<Utc>>| t.map_or_else(|| "*".to_string(), |t| t.to_rfc3339());
        format!(
            "{}|campus={}|dept={}|from={}|to={}",
            self.category,
            self.campus_id.as_deref().unwrap_or("*"),
            self.department_id.as_deref().unwrap_or("*"),
            window(&self.window_start),
            window(&self.window_end),
        )
    }

    pub fn matches_location(&self, campus_id: &str, department_id: &str) -> bool {
        self.campus_id.as_deref().map_or(true, |c| c == campus_id)
            && self.department_id.as_deref().map_or(true, |d| d == department_id)
    }

    /// Whether a change to this user's all-time totals can affect this scope.
    pub fn contains(&self, contribution: &UserContribution) -> bool {
        self.matches_location(&contribution.campus_id, &contribution.department_id)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.category)?;
        if let Some(campus) = &self.campus_id {
            write!(f, " · campus {}", campus)?;
        }
        if let Some(dept) = &self.department_id {
            write!(f, " · dept {}", dept)?;
        }
        if self.is_windowed() {
            let fmt_t = |t: &Option<DateTime<Utc>>| t.map_or_else(|| "…".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
            write!(f, " · {} → {}", fmt_t(&self.window_start), fmt_t(&self.window_end))?;
        }
        Ok(())
    }
}

/// A user eligible for a scoped ranking, with the value to rank by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub user_id: String,
    pub campus_id: String,
    pub department_id: String,
    pub rank_key: i64,
    /// Latest activity in the ranked category; earlier wins ties.
    pub last_activity_at: Option<DateTime<Utc>>,
    pub total_points: i64,
    pub breakdown: BTreeMap<Category, i64>,
    /// All-time total the badge tier is chosen from.
    pub badge_points: i64,
}

/// Candidates from all-time totals.
pub fn resolve_all_time(scope: &Scope, contributions: &[UserContribution]) -> Vec<Candidate> {
    contributions
        .iter()
        .filter(|c| scope.contains(c))
        .filter_map(|c| {
            let (rank_key, last_activity_at) = match scope.category.bucket() {
                None => (c.total_points, c.last_activity_at),
                Some(cat) => (c.points_in(cat), c.last_activity_in(cat)),
            };
            if scope.category.bucket().is_some() && rank_key == 0 {
                return None;
            }
            Some(Candidate {
                user_id: c.user_id.clone(),
                campus_id: c.campus_id.clone(),
                department_id: c.department_id.clone(),
                rank_key,
                last_activity_at,
                total_points: c.total_points,
                breakdown: c.points_by_category.clone(),
                badge_points: c.total_points,
            })
        })
        .collect()
}

/// Candidates from raw event weights inside the scope's window. Location
/// filters apply to the campus/department recorded on each event.
pub fn resolve_windowed(scope: &Scope, events: &[ActivityEvent]) -> Vec<Candidate> {
    struct Acc {
        candidate: Candidate,
        latest_any: DateTime<Utc>,
    }

    let bucket = scope.category.bucket();
    let mut by_user: HashMap<&str, Acc> = HashMap::new();

    for event in events {
        if !scope.matches_location(&event.campus_id, &event.department_id) {
            continue;
        }
        let acc = by_user.entry(event.user_id.as_str()).or_insert_with(|| Acc {
            candidate: Candidate {
                user_id: event.user_id.clone(),
                campus_id: event.campus_id.clone(),
                department_id: event.department_id.clone(),
                rank_key: 0,
                last_activity_at: None,
                total_points: 0,
                breakdown: BTreeMap::new(),
                badge_points: 0,
            },
            latest_any: event.occurred_at,
        });

        let c = &mut acc.candidate;
        let category = event.category();
        *c.breakdown.entry(category).or_insert(0) += event.weight;
        c.total_points += event.weight;
        if event.occurred_at >= acc.latest_any {
            acc.latest_any = event.occurred_at;
            c.campus_id = event.campus_id.clone();
            c.department_id = event.department_id.clone();
        }
        if bucket.map_or(true, |b| b == category) {
            c.rank_key += event.weight;
            c.last_activity_at = Some(
                c.last_activity_at
                    .map_or(event.occurred_at, |t| t.max(event.occurred_at)),
            );
        }
    }

    by_user
        .into_values()
        .map(|acc| {
            let mut c = acc.candidate;
            c.badge_points = c.total_points;
            c
        })
        .filter(|c| bucket.is_none() || c.rank_key != 0)
        .collect()
}

/// Candidate set for `scope`: all-time scopes read the aggregator,
/// windowed scopes sum event weights straight from the store.
pub fn resolve(scope: &Scope, aggregator: &ScoreAggregator, store: &EventStore) -> Vec<Candidate> {
    if scope.is_windowed() {
        let events = store.events_in_window(scope.window_start, scope.window_end);
        let mut candidates = resolve_windowed(scope, &events);
        for c in &mut candidates {
            if let Some(all_time) = aggregator.get(&c.user_id) {
                c.badge_points = all_time.total_points;
            }
        }
        candidates
    } else {
        resolve_all_time(scope, &aggregator.snapshot())
    }
}
