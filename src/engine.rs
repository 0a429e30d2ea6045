//! Wires the event store, aggregator, badge assigner and snapshot cache
//! into the operations producers and consumers call.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::activity::{ActivityRecord, ActivityType, EventStore, NewActivity, RecordOutcome};
use crate::config::Config;
use crate::error::{RankError, Result};
use crate::leaderboard::{
    my_rank, rank_entries, resolve, BadgeAssigner, LeaderboardEntry, LeaderboardPage, MyRank,
    Page, RoleDirectory, Scope, SnapshotCache, SnapshotSettings, SnapshotSource,
};
use crate::scoring::{BadgeProgress, BadgeTable, ScoreAggregator, UserContribution, WeightTable};

/// Read side shared with the snapshot cache's blocking refresh tasks.
pub struct RankContext {
    store: Arc<EventStore>,
    aggregator: Arc<ScoreAggregator>,
    assigner: Arc<BadgeAssigner>,
}

impl SnapshotSource for RankContext {
    fn compute(&self, scope: &Scope) -> Vec<LeaderboardEntry> {
        rank_entries(resolve(scope, &self.aggregator, &self.store), &self.assigner)
    }
}

pub struct Engine {
    /// Resolves a weight once, at record time; the event carries it after.
    weights: WeightTable,
    context: Arc<RankContext>,
    cache: Arc<SnapshotCache<RankContext>>,
}

impl Engine {
    /// Assemble an engine over `store` and warm the aggregator from it.
    pub fn new(
        store: EventStore,
        weights: WeightTable,
        assigner: BadgeAssigner,
        settings: SnapshotSettings,
    ) -> Self {
        let context = Arc::new(RankContext {
            store: Arc::new(store),
            aggregator: Arc::new(ScoreAggregator::new()),
            assigner: Arc::new(assigner),
        });
        let applied = context.aggregator.backfill(&context.store);
        if applied > 0 {
            info!(events = applied, users = context.aggregator.len(), "backfilled contributions");
        }
        let cache = SnapshotCache::new(Arc::clone(&context), settings);
        Self {
            weights,
            context,
            cache,
        }
    }

    /// Build everything from a loaded config, opening the journal under its
    /// data directory.
    pub fn open(config: &Config) -> Result<Self> {
        let weights = WeightTable::from_config(&config.scoring)?;
        let badges = BadgeTable::new(config.badges.clone())?;
        let roles = RoleDirectory::new(config.roles.iter().cloned());
        let settings = config
            .cache
            .settings()
            .map_err(|errors| RankError::config(errors.join("; ")))?;
        let store = EventStore::open(&config.journal_path())?;
        Ok(Self::new(store, weights, BadgeAssigner::new(badges, roles), settings))
    }

    pub fn store(&self) -> &EventStore {
        &self.context.store
    }

    pub fn aggregator(&self) -> &ScoreAggregator {
        &self.context.aggregator
    }

    pub fn cache(&self) -> &Arc<SnapshotCache<RankContext>> {
        &self.cache
    }

    /// Record one producer activity and fold it into the user's totals.
    ///
    /// A repeat of an existing `(user, type, resource)` returns
    /// [`RecordOutcome::Duplicate`] and awards nothing.
    pub fn record_activity(&self, record: ActivityRecord) -> Result<RecordOutcome> {
        let kind: ActivityType = record.activity_type.parse().inspect_err(|e| {
            warn!(user_id = %record.user_id, resource_id = %record.resource_id, error = %e, "rejected activity");
        })?;
        let weight = self.weights.weight_for(kind).inspect_err(|e| {
            warn!(user_id = %record.user_id, activity_type = %kind, error = %e, "rejected activity");
        })?;

        let outcome = self.store().record(NewActivity {
            user_id: record.user_id,
            campus_id: record.campus_id,
            department_id: record.department_id,
            activity_type: kind,
            resource_id: record.resource_id,
            weight,
            occurred_at: record.occurred_at,
        })?;
        if outcome.is_duplicate() {
            return Ok(outcome);
        }

        let event = outcome.event();
        let before = self.aggregator().get(&event.user_id);
        let mut after = self.aggregator().apply(event);
        if let Err(drift) = self.aggregator().verify(&event.user_id) {
            warn!(error = %drift, "repairing contribution from event history");
            if let Some(rebuilt) = self.aggregator().rebuild(&event.user_id, self.store()) {
                after = rebuilt;
            }
        }
        self.cache.note_change(before.as_ref(), &after);
        debug!(user_id = %event.user_id, event_id = event.id, total = after.total_points, "activity recorded");
        Ok(outcome)
    }

    /// Record a batch. Every record gets its own result; a failure never
    /// stops the rest of the batch.
    pub fn ingest(&self, batch: Vec<ActivityRecord>) -> Vec<Result<RecordOutcome>> {
        batch
            .into_iter()
            .map(|record| self.record_activity(record))
            .collect()
    }

    /// A page of the ranked list for `scope`. Stale snapshots are served
    /// while they refresh in the background; a first computation that runs
    /// past the refresh budget fails with [`RankError::RankEngineTimeout`].
    pub async fn leaderboard(&self, scope: &Scope, page: Page) -> Result<LeaderboardPage> {
        self.cache.get(scope, page).await
    }

    /// The user's standing in `scope`, counted directly rather than read
    /// from a materialized list. `None` if the user is not ranked there.
    pub fn my_rank(&self, user_id: &str, scope: &Scope) -> Option<MyRank> {
        let candidates = resolve(scope, self.aggregator(), self.store());
        my_rank(&candidates, user_id)
    }

    pub fn contribution(&self, user_id: &str) -> Option<UserContribution> {
        self.aggregator().get(user_id)
    }

    /// Tier progress for the user's all-time total; unknown users sit at zero.
    pub fn progress(&self, user_id: &str) -> BadgeProgress {
        let points = self.contribution(user_id).map_or(0, |c| c.total_points);
        self.context.assigner.badges().progress(points)
    }

    /// Recompute a user's totals from history and count the change against
    /// cached scopes if anything moved.
    pub fn rebuild(&self, user_id: &str) -> Option<UserContribution> {
        let before = self.aggregator().get(user_id);
        let after = self.aggregator().rebuild(user_id, self.store());
        if let Some(after) = &after {
            if before.as_ref() != Some(after) {
                info!(user_id, total = after.total_points, "contribution rebuilt");
                self.cache.note_change(before.as_ref(), after);
            }
        }
        after
    }

    /// Rewrite the event journal; returns the number of events kept.
    pub fn compact(&self) -> Result<usize> {
        self.store().compact()
    }
}
