use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::activity::{ActivityEvent, ActivityType, Category, EventCursor, EventStore};
use crate::error::{RankError, Result};

/// All-time point totals for one user.
///
/// `total_points` always equals the sum of `points_by_category`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserContribution {
    pub user_id: String,
    /// Campus and department of the user's latest event.
    pub campus_id: String,
    pub department_id: String,
    pub points_by_category: BTreeMap<Category, i64>,
    pub total_points: i64,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_activity_by_category: BTreeMap<Category, DateTime<Utc>>,
    pub activity_counts: BTreeMap<ActivityType, u32>,
    #[serde(skip)]
    latest: Option<EventCursor>,
}

impl UserContribution {
    pub fn new(user_id: &str, campus_id: &str, department_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            campus_id: campus_id.to_string(),
            department_id: department_id.to_string(),
            points_by_category: BTreeMap::new(),
            total_points: 0,
            last_activity_at: None,
            last_activity_by_category: BTreeMap::new(),
            activity_counts: BTreeMap::new(),
            latest: None,
        }
    }

    pub fn points_in(&self, category: Category) -> i64 {
        self.points_by_category.get(&category).copied().unwrap_or(0)
    }

    pub fn last_activity_in(&self, category: Category) -> Option<DateTime<Utc>> {
        self.last_activity_by_category.get(&category).copied()
    }

    pub fn category_sum(&self) -> i64 {
        self.points_by_category.values().sum()
    }

    pub fn is_consistent(&self) -> bool {
        self.total_points == self.category_sum()
    }

    pub fn count_of(&self, kind: ActivityType) -> u32 {
        self.activity_counts.get(&kind).copied().unwrap_or(0)
    }

    /// Fold one event in at the weight it was recorded with. Sums and
    /// maxima make the result independent of arrival order;
    /// campus/department follow the latest `(occurred_at, id)`.
    fn fold(&mut self, event: &ActivityEvent) {
        let category = event.category();
        *self.points_by_category.entry(category).or_insert(0) += event.weight;
        self.total_points += event.weight;
        *self.activity_counts.entry(event.activity_type).or_insert(0) += 1;

        self.last_activity_at = Some(
            self.last_activity_at
                .map_or(event.occurred_at, |t| t.max(event.occurred_at)),
        );
        let slot = self
            .last_activity_by_category
            .entry(category)
            .or_insert(event.occurred_at);
        *slot = (*slot).max(event.occurred_at);

        let cursor = event.cursor();
        if self.latest.map_or(true, |c| cursor > c) {
            self.latest = Some(cursor);
            self.campus_id = event.campus_id.clone();
            self.department_id = event.department_id.clone();
        }
    }
}

struct UserState {
    contribution: UserContribution,
    applied: HashSet<u64>,
}

impl UserState {
    fn new(event: &ActivityEvent) -> Self {
        Self {
            contribution: UserContribution::new(
                &event.user_id,
                &event.campus_id,
                &event.department_id,
            ),
            applied: HashSet::new(),
        }
    }
}

/// Maintains `UserContribution` from applied events.
///
/// Points come from `ActivityEvent::weight`, fixed when the event was
/// recorded, so the all-time totals and a windowed sum over the same events
/// always agree. Same-user updates are serialized by a per-user mutex; the
/// map itself is sharded so different users never contend on one lock.
#[derive(Default)]
pub struct ScoreAggregator {
    users: DashMap<String, Arc<Mutex<UserState>>>,
}

fn lock(state: &Mutex<UserState>) -> MutexGuard<'_, UserState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScoreAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, event: &ActivityEvent) -> Arc<Mutex<UserState>> {
        // Clone the Arc out so the shard guard is released before locking.
        let entry = self
            .users
            .entry(event.user_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(UserState::new(event))));
        Arc::clone(entry.value())
    }

    /// Add an event's weight to its user's totals. Re-applying an event id
    /// that is already counted leaves the totals unchanged.
    pub fn apply(&self, event: &ActivityEvent) -> UserContribution {
        let slot = self.slot(event);
        let mut state = lock(&slot);
        if !state.applied.insert(event.id) {
            debug!(user_id = %event.user_id, event_id = event.id, "event already applied");
            return state.contribution.clone();
        }
        state.contribution.fold(event);
        state.contribution.clone()
    }

    /// Recompute a user's totals from the store's full history, replacing
    /// the incremental state. Returns `None` if the user has no events.
    pub fn rebuild(&self, user_id: &str, store: &EventStore) -> Option<UserContribution> {
        let Some(slot) = self.users.get(user_id).map(|s| Arc::clone(s.value())) else {
            return self.rebuild_untracked(user_id, store);
        };

        // Hold the user lock while reading history so an apply racing with
        // the rebuild either lands in the history or waits for the swap.
        let mut state = lock(&slot);
        let events = store.events_for_user(user_id);
        let Some(first) = events.first() else {
            drop(state);
            self.users.remove(user_id);
            return None;
        };

        let mut fresh = UserState::new(first);
        for event in &events {
            fresh.applied.insert(event.id);
            fresh.contribution.fold(event);
        }
        *state = fresh;
        Some(state.contribution.clone())
    }

    fn rebuild_untracked(&self, user_id: &str, store: &EventStore) -> Option<UserContribution> {
        store
            .events_for_user(user_id)
            .iter()
            .map(|event| self.apply(event))
            .last()
    }

    /// Check the conservation invariant for one user.
    pub fn verify(&self, user_id: &str) -> Result<()> {
        let Some(slot) = self.users.get(user_id).map(|s| Arc::clone(s.value())) else {
            return Ok(());
        };
        let state = lock(&slot);
        let c = &state.contribution;
        if c.is_consistent() {
            Ok(())
        } else {
            Err(RankError::AggregationDrift {
                user_id: c.user_id.clone(),
                total: c.total_points,
                category_sum: c.category_sum(),
            })
        }
    }

    /// Replay the whole store, e.g. on startup; returns the number applied.
    pub fn backfill(&self, store: &EventStore) -> usize {
        let mut applied = 0;
        for event in store.list_since(None) {
            self.apply(&event);
            applied += 1;
        }
        applied
    }

    pub fn get(&self, user_id: &str) -> Option<UserContribution> {
        let slot = self.users.get(user_id).map(|s| Arc::clone(s.value()))?;
        let contribution = lock(&slot).contribution.clone();
        Some(contribution)
    }

    /// Point-in-time copy of every user's totals for ranking.
    pub fn snapshot(&self) -> Vec<UserContribution> {
        let slots: Vec<_> = self.users.iter().map(|e| e.value().clone()).collect();
        slots.iter().map(|s| lock(s).contribution.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn corrupt_total(&self, user_id: &str, delta: i64) {
        if let Some(slot) = self.users.get(user_id).map(|s| Arc::clone(s.value())) {
            lock(&slot).contribution.total_points += delta;
        }
    }
}
