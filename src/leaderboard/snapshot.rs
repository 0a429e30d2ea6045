//! Materialized leaderboards with a serve-stale-while-refreshing contract.
//!
//! Each all-time scope moves through `Missing → Fresh → Stale → Refreshing →
//! Fresh`. A missing scope is computed while the reader waits, because there
//! is nothing to serve yet. Once cached, readers always get the last snapshot
//! straight away; a stale snapshot triggers one background refresh. Every
//! computation runs on the blocking pool within a time budget. Windowed
//! scopes are computed per request and never cached.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::rank::{LeaderboardEntry, Page};
use super::scope::Scope;
use crate::error::{RankError, Result};
use crate::scoring::UserContribution;

/// Produces the full ranked list for a scope. Runs on the blocking pool.
pub trait SnapshotSource: Send + Sync + 'static {
    fn compute(&self, scope: &Scope) -> Vec<LeaderboardEntry>;
}

/// Staleness policy for cached all-time scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSettings {
    /// Age after which a snapshot is stale.
    pub refresh_interval: Duration,
    /// Point-changing events inside a scope after which it is stale.
    pub change_threshold: u64,
    /// Longest a background refresh may run before it is abandoned.
    pub refresh_budget: Duration,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5 * 60),
            change_threshold: 25,
            refresh_budget: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Missing,
    Fresh,
    Stale,
    Refreshing,
}

/// A point-in-time ranked list for one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub scope: Scope,
    pub entries: Vec<LeaderboardEntry>,
    pub computed_at: DateTime<Utc>,
}

/// What `leaderboard(scope, page)` returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardPage {
    pub entries: Vec<LeaderboardEntry>,
    pub total_candidates: usize,
    pub scope: Scope,
    pub computed_at: DateTime<Utc>,
    /// Served from a snapshot already due for refresh.
    pub stale: bool,
}

impl LeaderboardPage {
    fn from_snapshot(snapshot: &Snapshot, page: Page, stale: bool) -> Self {
        Self {
            entries: page.slice(&snapshot.entries).to_vec(),
            total_candidates: snapshot.entries.len(),
            scope: snapshot.scope.clone(),
            computed_at: snapshot.computed_at,
            stale,
        }
    }
}

struct CacheEntry {
    snapshot: Arc<Snapshot>,
    refreshed_at: Instant,
    /// Changes noted since `snapshot` was taken.
    pending_changes: u64,
    /// Monotonic change counter, used to carry over changes that arrive
    /// while a refresh is running.
    changes_seen: u64,
    stale: bool,
    refreshing: bool,
}

impl CacheEntry {
    fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
            refreshed_at: Instant::now(),
            pending_changes: 0,
            changes_seen: 0,
            stale: false,
            refreshing: false,
        }
    }

    fn is_due(&self, settings: &SnapshotSettings) -> bool {
        self.stale
            || self.refreshed_at.elapsed() >= settings.refresh_interval
            || self.pending_changes >= settings.change_threshold
    }

    fn state(&self, settings: &SnapshotSettings) -> SnapshotState {
        if self.refreshing {
            SnapshotState::Refreshing
        } else if self.is_due(settings) {
            SnapshotState::Stale
        } else {
            SnapshotState::Fresh
        }
    }
}

/// Scope-keyed snapshot cache. Only this type writes ranked output.
pub struct SnapshotCache<S: SnapshotSource> {
    source: Arc<S>,
    settings: SnapshotSettings,
    entries: DashMap<String, CacheEntry>,
}

impl<S: SnapshotSource> SnapshotCache<S> {
    pub fn new(source: Arc<S>, settings: SnapshotSettings) -> Arc<Self> {
        Arc::new(Self {
            source,
            settings,
            entries: DashMap::new(),
        })
    }

    pub fn settings(&self) -> &SnapshotSettings {
        &self.settings
    }

    fn compute(&self, scope: &Scope) -> Snapshot {
        let started = Instant::now();
        let entries = self.source.compute(scope);
        debug!(scope = %scope, candidates = entries.len(), elapsed = ?started.elapsed(), "ranked scope");
        Snapshot {
            scope: scope.clone(),
            entries,
            computed_at: Utc::now(),
        }
    }

    pub fn state(&self, scope: &Scope) -> SnapshotState {
        match self.entries.get(&scope.cache_key()) {
            None => SnapshotState::Missing,
            Some(entry) => entry.state(&self.settings),
        }
    }

    /// Serve a page. Never waits on a background refresh.
    ///
    /// A missing or windowed scope has nothing to serve yet, so it is
    /// computed under the refresh budget and a timeout is returned as
    /// [`RankError::RankEngineTimeout`]. Outside a tokio runtime a due
    /// snapshot is refreshed inline instead of in the background.
    pub async fn get(self: &Arc<Self>, scope: &Scope, page: Page) -> Result<LeaderboardPage> {
        if scope.is_windowed() {
            let snapshot = self.refresh(scope).await?;
            return Ok(LeaderboardPage::from_snapshot(&snapshot, page, false));
        }

        let served = match self.entries.get_mut(&scope.cache_key()) {
            Some(mut entry) => {
                let due = entry.is_due(&self.settings);
                if due {
                    entry.stale = true;
                }
                let spawn = due && !entry.refreshing;
                if spawn {
                    entry.refreshing = true;
                }
                Some((Arc::clone(&entry.snapshot), due, spawn))
            }
            None => None,
        };

        match served {
            Some((snapshot, stale, spawn)) => {
                if spawn {
                    match Handle::try_current() {
                        Ok(handle) => {
                            self.spawn_refresh(&handle, scope.clone());
                        }
                        Err(_) => {
                            let fresh = self.refresh(scope).await?;
                            return Ok(LeaderboardPage::from_snapshot(&fresh, page, false));
                        }
                    }
                } else {
                    debug!(scope = %scope, stale, "snapshot cache hit");
                }
                Ok(LeaderboardPage::from_snapshot(&snapshot, page, stale))
            }
            None => {
                let snapshot = self.refresh(scope).await?;
                Ok(LeaderboardPage::from_snapshot(&snapshot, page, false))
            }
        }
    }

    /// Run `compute` on the blocking pool, abandoning it after the refresh
    /// budget. Without a runtime there is no pool, so it runs on the caller.
    async fn compute_bounded(self: &Arc<Self>, scope: &Scope) -> Result<Snapshot> {
        if Handle::try_current().is_err() {
            return Ok(self.compute(scope));
        }

        let this = Arc::clone(self);
        let task_scope = scope.clone();
        let task = tokio::task::spawn_blocking(move || this.compute(&task_scope));
        match tokio::time::timeout(self.settings.refresh_budget, task).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(join_err)) => Err(RankError::RefreshAborted(join_err.to_string())),
            Err(_) => Err(RankError::RankEngineTimeout(self.settings.refresh_budget)),
        }
    }

    /// Recompute `scope` within the refresh budget and store it.
    ///
    /// On timeout the previous snapshot stays in place, marked stale, and
    /// the next read or scheduled cycle tries again. Windowed scopes are
    /// computed the same way but never stored.
    pub async fn refresh(self: &Arc<Self>, scope: &Scope) -> Result<Arc<Snapshot>> {
        if scope.is_windowed() {
            return self.compute_bounded(scope).await.map(Arc::new).inspect_err(|e| {
                warn!(scope = %scope, error = %e, "windowed leaderboard failed");
            });
        }
        let key = scope.cache_key();
        let changes_at_start = self.entries.get(&key).map(|e| e.changes_seen);

        match self.compute_bounded(scope).await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                let mut entry = self
                    .entries
                    .entry(key)
                    .or_insert_with(|| CacheEntry::new((*snapshot).clone()));
                // An entry another reader stored meanwhile keeps what it has
                // counted since; ours may predate those changes.
                let missed = match changes_at_start {
                    Some(start) => entry.changes_seen.saturating_sub(start),
                    None => entry.pending_changes,
                };
                entry.snapshot = Arc::clone(&snapshot);
                entry.refreshed_at = Instant::now();
                entry.pending_changes = missed;
                entry.stale = missed >= self.settings.change_threshold;
                entry.refreshing = false;
                info!(scope = %scope, candidates = snapshot.entries.len(), "leaderboard snapshot refreshed");
                Ok(snapshot)
            }
            Err(e) => {
                if let Some(mut entry) = self.entries.get_mut(&key) {
                    entry.stale = true;
                    entry.refreshing = false;
                }
                warn!(scope = %scope, error = %e, "leaderboard refresh failed");
                Err(e)
            }
        }
    }

    fn spawn_refresh(self: &Arc<Self>, handle: &Handle, scope: Scope) -> JoinHandle<()> {
        let this = Arc::clone(self);
        handle.spawn(async move {
            // Failures are logged inside `refresh` and retried next cycle.
            let _ = this.refresh(&scope).await;
        })
    }

    /// Count a point change against every cached scope the user is (or
    /// was, before a campus/department move) part of.
    pub fn note_change(&self, before: Option<&UserContribution>, after: &UserContribution) {
        for mut entry in self.entries.iter_mut() {
            let scope = &entry.snapshot.scope;
            if scope.contains(after) || before.is_some_and(|b| scope.contains(b)) {
                entry.pending_changes += 1;
                entry.changes_seen += 1;
                if entry.pending_changes >= self.settings.change_threshold {
                    entry.stale = true;
                }
            }
        }
    }

    /// Force one scope stale; it is refreshed on the next read or cycle.
    pub fn invalidate(&self, scope: &Scope) {
        if let Some(mut entry) = self.entries.get_mut(&scope.cache_key()) {
            entry.stale = true;
        }
    }

    /// Refresh every cached scope that is due and not already refreshing.
    /// Returns how many refreshed successfully.
    pub async fn refresh_due(self: &Arc<Self>) -> usize {
        let due: Vec<Scope> = self
            .entries
            .iter_mut()
            .filter_map(|mut entry| {
                if entry.refreshing || !entry.is_due(&self.settings) {
                    return None;
                }
                entry.stale = true;
                entry.refreshing = true;
                Some(entry.snapshot.scope.clone())
            })
            .collect();

        let mut refreshed = 0;
        for scope in due {
            if self.refresh(&scope).await.is_ok() {
                refreshed += 1;
            }
        }
        refreshed
    }

    /// Periodically refresh due scopes until the handle is aborted.
    pub fn spawn_refresher(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let refreshed = this.refresh_due().await;
                if refreshed > 0 {
                    debug!(refreshed, "scheduled leaderboard refresh");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaderboard::roles::BadgeAssigner;
    use crate::leaderboard::scope::Candidate;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

    /// Ranks a single user whose points equal the current version.
    struct VersionedSource {
        version: AtomicI64,
        delay_ms: AtomicU64,
        calls: AtomicUsize,
    }

    impl VersionedSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                version: AtomicI64::new(1),
                delay_ms: AtomicU64::new(0),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl SnapshotSource for VersionedSource {
        fn compute(&self, scope: &Scope) -> Vec<LeaderboardEntry> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                std::thread::sleep(Duration::from_millis(delay));
            }
            let points = self.version.load(Ordering::SeqCst);
            let candidate = Candidate {
                user_id: "u1".to_string(),
                campus_id: scope.campus_id.clone().unwrap_or_else(|| "A".to_string()),
                department_id: "cs".to_string(),
                rank_key: points,
                last_activity_at: None,
                total_points: points,
                breakdown: BTreeMap::new(),
                badge_points: points,
            };
            vec![LeaderboardEntry::new(1, &candidate, &BadgeAssigner::default())]
        }
    }

    fn lazy_settings() -> SnapshotSettings {
        SnapshotSettings {
            refresh_interval: Duration::from_secs(3600),
            change_threshold: 3,
            refresh_budget: Duration::from_secs(5),
        }
    }

    fn member(campus: &str) -> UserContribution {
        UserContribution::new("u9", campus, "cs")
    }

    fn points(page: &LeaderboardPage) -> i64 {
        page.entries[0].ranked_points
    }

    #[tokio::test]
    async fn test_missing_then_fresh() {
        let source = VersionedSource::new();
        let cache = SnapshotCache::new(Arc::clone(&source), lazy_settings());
        let scope = Scope::overall().with_campus("A");

        assert_eq!(cache.state(&scope), SnapshotState::Missing);
        let page = cache.get(&scope, Page::default()).await.unwrap();
        assert_eq!(points(&page), 1);
        assert!(!page.stale);
        assert_eq!(cache.state(&scope), SnapshotState::Fresh);

        // Served from cache: no second computation.
        source.version.store(2, Ordering::SeqCst);
        assert_eq!(points(&cache.get(&scope, Page::default()).await.unwrap()), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_change_threshold_is_scope_keyed() {
        let source = VersionedSource::new();
        let cache = SnapshotCache::new(source, lazy_settings());
        let campus_a = Scope::overall().with_campus("A");
        let campus_b = Scope::overall().with_campus("B");
        cache.get(&campus_a, Page::default()).await.unwrap();
        cache.get(&campus_b, Page::default()).await.unwrap();

        for _ in 0..3 {
            cache.note_change(None, &member("A"));
        }
        assert_eq!(cache.state(&campus_a), SnapshotState::Stale);
        assert_eq!(cache.state(&campus_b), SnapshotState::Fresh);
    }

    #[tokio::test]
    async fn test_campus_move_invalidates_old_scope() {
        let cache = SnapshotCache::new(VersionedSource::new(), lazy_settings());
        let campus_b = Scope::overall().with_campus("B");
        cache.get(&campus_b, Page::default()).await.unwrap();

        for _ in 0..3 {
            cache.note_change(Some(&member("B")), &member("A"));
        }
        assert_eq!(cache.state(&campus_b), SnapshotState::Stale);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_served_while_refreshing() {
        let source = VersionedSource::new();
        let cache = SnapshotCache::new(Arc::clone(&source), lazy_settings());
        let scope = Scope::overall();
        cache.get(&scope, Page::default()).await.unwrap();

        source.version.store(2, Ordering::SeqCst);
        source.delay_ms.store(300, Ordering::SeqCst);
        cache.invalidate(&scope);

        let started = Instant::now();
        let page = cache.get(&scope, Page::default()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(page.stale);
        assert_eq!(points(&page), 1);
        assert_eq!(cache.state(&scope), SnapshotState::Refreshing);

        // A second reader neither blocks nor starts another refresh.
        assert_eq!(points(&cache.get(&scope, Page::default()).await.unwrap()), 1);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(cache.state(&scope), SnapshotState::Fresh);
        assert_eq!(points(&cache.get(&scope, Page::default()).await.unwrap()), 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refresh_timeout_keeps_previous_snapshot() {
        let source = VersionedSource::new();
        let settings = SnapshotSettings {
            refresh_budget: Duration::from_millis(50),
            ..lazy_settings()
        };
        let cache = SnapshotCache::new(Arc::clone(&source), settings);
        let scope = Scope::overall();
        cache.get(&scope, Page::default()).await.unwrap();

        source.version.store(2, Ordering::SeqCst);
        source.delay_ms.store(400, Ordering::SeqCst);
        let err = cache.refresh(&scope).await.unwrap_err();
        assert!(matches!(err, RankError::RankEngineTimeout(_)));
        assert_eq!(cache.state(&scope), SnapshotState::Stale);

        // Stale snapshot still served; the retry kicks off in the background.
        let page = cache.get(&scope, Page::default()).await.unwrap();
        assert!(page.stale);
        assert_eq!(points(&page), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_first_computation_times_out() {
        let source = VersionedSource::new();
        source.delay_ms.store(400, Ordering::SeqCst);
        let settings = SnapshotSettings {
            refresh_budget: Duration::from_millis(50),
            ..lazy_settings()
        };
        let cache = SnapshotCache::new(Arc::clone(&source), settings);
        let scope = Scope::overall();

        let started = Instant::now();
        let err = cache.get(&scope, Page::default()).await.unwrap_err();
        assert!(matches!(err, RankError::RankEngineTimeout(_)));
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(cache.state(&scope), SnapshotState::Missing);

        source.delay_ms.store(0, Ordering::SeqCst);
        assert_eq!(points(&cache.get(&scope, Page::default()).await.unwrap()), 1);
        assert_eq!(cache.state(&scope), SnapshotState::Fresh);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_late_first_computation_keeps_entry_stored_meanwhile() {
        let source = VersionedSource::new();
        source.delay_ms.store(300, Ordering::SeqCst);
        let cache = SnapshotCache::new(Arc::clone(&source), lazy_settings());
        let scope = Scope::overall();

        let slow = {
            let cache = Arc::clone(&cache);
            let scope = scope.clone();
            tokio::spawn(async move { cache.refresh(&scope).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A second reader fills the scope first and changes start counting.
        source.delay_ms.store(0, Ordering::SeqCst);
        cache.get(&scope, Page::default()).await.unwrap();
        cache.note_change(None, &member("A"));
        cache.note_change(None, &member("A"));

        slow.await.unwrap().unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.state(&scope), SnapshotState::Fresh);
        cache.note_change(None, &member("A"));
        assert_eq!(cache.state(&scope), SnapshotState::Stale);
    }

    #[test]
    fn test_due_snapshot_refreshed_inline_without_runtime() {
        let source = VersionedSource::new();
        let cache = SnapshotCache::new(Arc::clone(&source), lazy_settings());
        let scope = Scope::overall();
        let first = futures::executor::block_on(cache.get(&scope, Page::default())).unwrap();
        assert_eq!(points(&first), 1);

        source.version.store(2, Ordering::SeqCst);
        cache.invalidate(&scope);
        let page = futures::executor::block_on(cache.get(&scope, Page::default())).unwrap();
        assert!(!page.stale);
        assert_eq!(points(&page), 2);
        assert_eq!(cache.state(&scope), SnapshotState::Fresh);
    }

    #[tokio::test]
    async fn test_refresh_due_refreshes_only_due_scopes() {
        let source = VersionedSource::new();
        let cache = SnapshotCache::new(Arc::clone(&source), lazy_settings());
        let a = Scope::overall().with_campus("A");
        let b = Scope::overall().with_campus("B");
        cache.get(&a, Page::default()).await.unwrap();
        cache.get(&b, Page::default()).await.unwrap();

        source.version.store(5, Ordering::SeqCst);
        cache.invalidate(&a);
        assert_eq!(cache.refresh_due().await, 1);
        assert_eq!(points(&cache.get(&a, Page::default()).await.unwrap()), 5);
        assert_eq!(points(&cache.get(&b, Page::default()).await.unwrap()), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_refresher_picks_up_stale_scopes() {
        let source = VersionedSource::new();
        let cache = SnapshotCache::new(Arc::clone(&source), lazy_settings());
        let scope = Scope::overall();
        cache.get(&scope, Page::default()).await.unwrap();

        let refresher = cache.spawn_refresher(Duration::from_millis(20));
        source.version.store(7, Ordering::SeqCst);
        cache.invalidate(&scope);
        tokio::time::sleep(Duration::from_millis(300)).await;
        refresher.abort();

        assert_eq!(cache.state(&scope), SnapshotState::Fresh);
        assert_eq!(points(&cache.get(&scope, Page::default()).await.unwrap()), 7);
    }

    #[tokio::test]
    async fn test_interval_expiry_marks_stale() {
        let settings = SnapshotSettings {
            refresh_interval: Duration::ZERO,
            ..lazy_settings()
        };
        let cache = SnapshotCache::new(VersionedSource::new(), settings);
        let scope = Scope::overall();
        cache.get(&scope, Page::default()).await.unwrap();
        assert_ne!(cache.state(&scope), SnapshotState::Fresh);
    }

    #[tokio::test]
    async fn test_windowed_scopes_not_cached() {
        let source = VersionedSource::new();
        let cache = SnapshotCache::new(Arc::clone(&source), lazy_settings());
        let scope = Scope::overall().with_window(Some(Utc::now() - chrono::Duration::days(7)), None);

        cache.get(&scope, Page::default()).await.unwrap();
        source.version.store(3, Ordering::SeqCst);
        assert_eq!(points(&cache.get(&scope, Page::default()).await.unwrap()), 3);
        assert!(cache.is_empty());
        assert_eq!(cache.state(&scope), SnapshotState::Missing);
    }

    #[tokio::test]
    async fn test_changes_during_refresh_carry_over() {
        let cache = SnapshotCache::new(VersionedSource::new(), lazy_settings());
        let scope = Scope::overall();
        cache.get(&scope, Page::default()).await.unwrap();

        cache.note_change(None, &member("A"));
        cache.refresh(&scope).await.unwrap();
        assert_eq!(cache.state(&scope), SnapshotState::Fresh);

        cache.note_change(None, &member("A"));
        cache.note_change(None, &member("A"));
        assert_eq!(cache.state(&scope), SnapshotState::Fresh);
        cache.note_change(None, &member("A"));
        assert_eq!(cache.state(&scope), SnapshotState::Stale);
    }
}
