use atomic_write_file::AtomicWriteFile;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::types::{ActivityEvent, ActivityType, DedupKey, EventCursor};
use crate::error::Result;

/// Events pulled per lock acquisition by [`EventIter`].
const LIST_BATCH: usize = 256;

/// An activity accepted for recording; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewActivity {
    pub user_id: String,
    pub campus_id: String,
    pub department_id: String,
    pub activity_type: ActivityType,
    pub resource_id: String,
    pub weight: i64,
    pub occurred_at: DateTime<Utc>,
}

impl NewActivity {
    fn dedup_key(&self) -> DedupKey {
        DedupKey {
            user_id: self.user_id.clone(),
            activity_type: self.activity_type,
            resource_id: self.resource_id.clone(),
        }
    }
}

/// Result of [`EventStore::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First time this key was seen; the event is now stored.
    Recorded(ActivityEvent),
    /// The key already existed; carries the original event, unchanged.
    Duplicate(ActivityEvent),
}

impl RecordOutcome {
    pub fn event(&self) -> &ActivityEvent {
        match self {
            RecordOutcome::Recorded(e) | RecordOutcome::Duplicate(e) => e,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, RecordOutcome::Duplicate(_))
    }
}

struct StoreData {
    events: BTreeMap<EventCursor, ActivityEvent>,
    by_key: HashMap<DedupKey, EventCursor>,
    by_user: HashMap<String, Vec<EventCursor>>,
    next_id: u64,
    journal: Option<File>,
}

impl StoreData {
    fn empty() -> Self {
        Self {
            events: BTreeMap::new(),
            by_key: HashMap::new(),
            by_user: HashMap::new(),
            next_id: 1,
            journal: None,
        }
    }

    /// Index an event. Returns false if its key is already present.
    fn insert(&mut self, event: ActivityEvent) -> bool {
        let key = event.dedup_key();
        if self.by_key.contains_key(&key) {
            return false;
        }
        let cursor = event.cursor();
        self.next_id = self.next_id.max(event.id + 1);
        self.by_key.insert(key, cursor);
        self.by_user
            .entry(event.user_id.clone())
            .or_default()
            .push(cursor);
        self.events.insert(cursor, event);
        true
    }
}

/// Load every journal line into `data`.
///
/// A last line that does not parse was torn by a crash mid-append: it is
/// dropped and the file truncated back to the last complete line. A bad line
/// anywhere else is corruption and fails the open.
fn replay(path: &Path, data: &mut StoreData) -> Result<()> {
    let content = fs::read(path)?;
    let mut offset = 0;
    let mut skipped = 0usize;

    while offset < content.len() {
        let end = content[offset..]
            .iter()
            .position(|b| *b == b'\n')
            .map_or(content.len(), |i| offset + i);
        let next = (end + 1).min(content.len());
        let line = &content[offset..end];
        if line.iter().all(u8::is_ascii_whitespace) {
            offset = next;
            continue;
        }

        match serde_json::from_slice::<ActivityEvent>(line) {
            Ok(event) => {
                if !data.insert(event) {
                    skipped += 1;
                }
            }
            Err(e) if content[next..].iter().all(u8::is_ascii_whitespace) => {
                warn!(path = %path.display(), offset, error = %e, "truncating torn journal tail");
                OpenOptions::new().write(true).open(path)?.set_len(offset as u64)?;
                break;
            }
            Err(e) => return Err(e.into()),
        }
        offset = next;
    }

    if skipped > 0 {
        warn!(path = %path.display(), skipped, "journal contained duplicate activity keys");
    }
    Ok(())
}

/// Append-only activity log with exactly-once semantics per
/// `(user_id, activity_type, resource_id)`.
///
/// With a journal path, every accepted event is appended as one JSON line
/// and flushed before `record` returns; reopening replays the journal.
pub struct EventStore {
    inner: RwLock<StoreData>,
    journal_path: Option<PathBuf>,
}

impl EventStore {
    /// Volatile store, used by tests and one-off computations.
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(StoreData::empty()),
            journal_path: None,
        }
    }

    /// Open (or create) a journal-backed store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut data = StoreData::empty();
        if path.exists() {
            replay(path, &mut data)?;
            info!(path = %path.display(), events = data.events.len(), "replayed event journal");
        }

        data.journal = Some(OpenOptions::new().create(true).append(true).open(path)?);

        Ok(Self {
            inner: RwLock::new(data),
            journal_path: Some(path.to_path_buf()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreData> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreData> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert the activity if its key is new, otherwise hand back the
    /// existing event untouched.
    pub fn record(&self, activity: NewActivity) -> Result<RecordOutcome> {
        let mut data = self.write();

        if let Some(cursor) = data.by_key.get(&activity.dedup_key()) {
            if let Some(existing) = data.events.get(cursor) {
                debug!(
                    user_id = %existing.user_id,
                    activity_type = %existing.activity_type,
                    resource_id = %existing.resource_id,
                    "duplicate activity ignored"
                );
                return Ok(RecordOutcome::Duplicate(existing.clone()));
            }
        }

        let event = ActivityEvent {
            id: data.next_id,
            user_id: activity.user_id,
            campus_id: activity.campus_id,
            department_id: activity.department_id,
            activity_type: activity.activity_type,
            resource_id: activity.resource_id,
            weight: activity.weight,
            occurred_at: activity.occurred_at,
        };

        // Journal first: an event that is not durable must not be counted.
        if let Some(journal) = data.journal.as_mut() {
            let mut line = serde_json::to_vec(&event)?;
            line.push(b'\n');
            let len = journal.metadata()?.len();
            if let Err(e) = journal.write_all(&line).and_then(|()| journal.flush()) {
                // A partial line would swallow the next append.
                if let Err(rollback) = journal.set_len(len) {
                    warn!(error = %rollback, "failed to roll back partial journal write");
                }
                return Err(e.into());
            }
        }

        data.insert(event.clone());
        Ok(RecordOutcome::Recorded(event))
    }

    /// Lazily iterate events after `cursor` in `(occurred_at, id)` order.
    /// `None` starts from the beginning.
    pub fn list_since(&self, cursor: Option<EventCursor>) -> EventIter<'_> {
        EventIter {
            store: self,
            fetch_after: cursor,
            position: cursor,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Events with `start <= occurred_at < end`; open bounds are unbounded.
    pub fn events_in_window(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<ActivityEvent> {
        // Ids start at 1, so id 0 sorts before every event at that instant.
        let lower = match start {
            Some(occurred_at) => Bound::Included(EventCursor { occurred_at, id: 0 }),
            None => Bound::Unbounded,
        };
        let upper = match end {
            Some(occurred_at) => Bound::Excluded(EventCursor { occurred_at, id: 0 }),
            None => Bound::Unbounded,
        };
        if let (Bound::Included(lo), Bound::Excluded(hi)) = (&lower, &upper) {
            if lo >= hi {
                return Vec::new();
            }
        }

        self.read()
            .events
            .range((lower, upper))
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Full history of one user in `(occurred_at, id)` order.
    pub fn events_for_user(&self, user_id: &str) -> Vec<ActivityEvent> {
        let data = self.read();
        let mut cursors = data.by_user.get(user_id).cloned().unwrap_or_default();
        cursors.sort();
        cursors
            .iter()
            .filter_map(|c| data.events.get(c).cloned())
            .collect()
    }

    pub fn get(&self, key: &DedupKey) -> Option<ActivityEvent> {
        let data = self.read();
        data.by_key.get(key).and_then(|c| data.events.get(c)).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the journal atomically in event order, dropping anything the
    /// replay skipped. No-op for in-memory stores.
    pub fn compact(&self) -> Result<usize> {
        let Some(path) = self.journal_path.as_ref() else {
            return Ok(0);
        };

        let mut data = self.write();
        data.journal = None;

        let mut file = AtomicWriteFile::open(path)?;
        for event in data.events.values() {
            serde_json::to_writer(&mut file, event)?;
            file.write_all(b"\n")?;
        }
        file.commit()?;

        data.journal = Some(OpenOptions::new().create(true).append(true).open(path)?);
        info!(path = %path.display(), events = data.events.len(), "compacted event journal");
        Ok(data.events.len())
    }
}

/// Lazy, restartable walk over the store; see [`EventStore::list_since`].
pub struct EventIter<'a> {
    store: &'a EventStore,
    fetch_after: Option<EventCursor>,
    position: Option<EventCursor>,
    buffer: VecDeque<ActivityEvent>,
    exhausted: bool,
}

impl EventIter<'_> {
    /// Cursor of the last event yielded; pass it to `list_since` to resume.
    pub fn cursor(&self) -> Option<EventCursor> {
        self.position
    }

    fn fill(&mut self) {
        let data = self.store.read();
        let lower = match self.fetch_after {
            Some(c) => Bound::Excluded(c),
            None => Bound::Unbounded,
        };
        self.buffer.extend(
            data.events
                .range((lower, Bound::Unbounded))
                .take(LIST_BATCH)
                .map(|(_, e)| e.clone()),
        );
        match self.buffer.back() {
            Some(last) => self.fetch_after = Some(last.cursor()),
            None => self.exhausted = true,
        }
    }
}

impl Iterator for EventIter<'_> {
    type Item = ActivityEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill();
        }
        let event = self.buffer.pop_front()?;
        self.position = Some(event.cursor());
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::env;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, hour, 0, 0).unwrap()
    }

    fn activity(user: &str, kind: ActivityType, resource: &str, when: DateTime<Utc>) -> NewActivity {
        NewActivity {
            user_id: user.to_string(),
            campus_id: "lahore".to_string(),
            department_id: "cs".to_string(),
            activity_type: kind,
            resource_id: resource.to_string(),
            weight: 10,
            occurred_at: when,
        }
    }

    fn temp_journal(name: &str) -> PathBuf {
        let path = env::temp_dir().join(format!("contrib_rank_{}_{}.jsonl", name, std::process::id()));
        let _ = fs::remove_file(&path);
        path
    }

    #[test]
    fn test_record_assigns_increasing_ids() {
        let store = EventStore::in_memory();
        let a = store.record(activity("u1", ActivityType::PaperUpload, "p1", at(9))).unwrap();
        let b = store.record(activity("u1", ActivityType::PaperUpload, "p2", at(8))).unwrap();
        assert_eq!(a.event().id, 1);
        assert_eq!(b.event().id, 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_duplicate_returns_existing_event_unchanged() {
        let store = EventStore::in_memory();
        let first = store.record(activity("u1", ActivityType::PaperUpload, "p1", at(9))).unwrap();

        let mut edited = activity("u1", ActivityType::PaperUpload, "p1", at(11));
        edited.weight = 99;
        let second = store.record(edited).unwrap();

        assert!(second.is_duplicate());
        assert_eq!(second.event(), first.event());
        assert_eq!(second.event().weight, 10);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_same_resource_different_type_is_distinct() {
        let store = EventStore::in_memory();
        store.record(activity("u1", ActivityType::PostCreated, "post-1", at(9))).unwrap();
        let outcome = store
            .record(activity("u1", ActivityType::PostPopularBonus, "post-1", at(10)))
            .unwrap();
        assert!(!outcome.is_duplicate());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_list_since_orders_by_time_then_id() {
        let store = EventStore::in_memory();
        store.record(activity("u1", ActivityType::PaperUpload, "late", at(12))).unwrap();
        store.record(activity("u2", ActivityType::PaperUpload, "early", at(8))).unwrap();
        store.record(activity("u3", ActivityType::PaperUpload, "tie", at(12))).unwrap();

        let resources: Vec<_> = store.list_since(None).map(|e| e.resource_id).collect();
        assert_eq!(resources, vec!["early", "late", "tie"]);
    }

    #[test]
    fn test_list_since_is_restartable() {
        let store = EventStore::in_memory();
        for i in 0..600u32 {
            let when = at(0) + Duration::seconds(i as i64);
            store
                .record(activity("u1", ActivityType::PostCommentReceived, &format!("c{}", i), when))
                .unwrap();
        }

        let mut iter = store.list_since(None);
        let first: Vec<_> = iter.by_ref().take(300).collect();
        let cursor = iter.cursor();
        assert_eq!(cursor, Some(first[299].cursor()));

        let rest: Vec<_> = store.list_since(cursor).collect();
        assert_eq!(rest.len(), 300);
        assert_eq!(rest[0].resource_id, "c300");
        assert_eq!(store.list_since(None).count(), 600);
    }

    #[test]
    fn test_list_since_end_of_stream() {
        let store = EventStore::in_memory();
        let e = store.record(activity("u1", ActivityType::PaperUpload, "p1", at(9))).unwrap();
        assert_eq!(store.list_since(Some(e.event().cursor())).count(), 0);
    }

    #[test]
    fn test_events_in_window_half_open() {
        let store = EventStore::in_memory();
        store.record(activity("u1", ActivityType::PaperUpload, "p8", at(8))).unwrap();
        store.record(activity("u1", ActivityType::PaperUpload, "p9", at(9))).unwrap();
        store.record(activity("u1", ActivityType::PaperUpload, "p10", at(10))).unwrap();

        let window: Vec<_> = store
            .events_in_window(Some(at(9)), Some(at(10)))
            .into_iter()
            .map(|e| e.resource_id)
            .collect();
        assert_eq!(window, vec!["p9"]);

        assert_eq!(store.events_in_window(Some(at(9)), None).len(), 2);
        assert_eq!(store.events_in_window(None, Some(at(9))).len(), 1);
        assert!(store.events_in_window(Some(at(10)), Some(at(9))).is_empty());
    }

    #[test]
    fn test_events_for_user_sorted() {
        let store = EventStore::in_memory();
        store.record(activity("u1", ActivityType::PaperUpload, "b", at(11))).unwrap();
        store.record(activity("u2", ActivityType::PaperUpload, "x", at(10))).unwrap();
        store.record(activity("u1", ActivityType::PaperUpload, "a", at(9))).unwrap();

        let mine: Vec<_> = store.events_for_user("u1").into_iter().map(|e| e.resource_id).collect();
        assert_eq!(mine, vec!["a", "b"]);
        assert!(store.events_for_user("nobody").is_empty());
    }

    #[test]
    fn test_journal_replay_roundtrip() {
        let path = temp_journal("replay");
        {
            let store = EventStore::open(&path).unwrap();
            store.record(activity("u1", ActivityType::PaperUpload, "p1", at(9))).unwrap();
            store.record(activity("u1", ActivityType::ReviewWritten, "r1", at(10))).unwrap();
        }

        let reopened = EventStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);

        // Dedup survives a restart and ids keep increasing.
        let dup = reopened.record(activity("u1", ActivityType::PaperUpload, "p1", at(12))).unwrap();
        assert!(dup.is_duplicate());
        let fresh = reopened.record(activity("u2", ActivityType::PaperUpload, "p2", at(12))).unwrap();
        assert_eq!(fresh.event().id, 3);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_torn_tail_truncated_on_open() {
        let path = temp_journal("torn");
        {
            let store = EventStore::open(&path).unwrap();
            store.record(activity("u1", ActivityType::PaperUpload, "p1", at(9))).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"id":2,"user_id":"u"#).unwrap();
        drop(file);

        let reopened = EventStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        let next = reopened.record(activity("u2", ActivityType::PostCreated, "post-1", at(10))).unwrap();
        assert_eq!(next.event().id, 2);
        drop(reopened);
        assert_eq!(EventStore::open(&path).unwrap().len(), 2);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_line_before_tail_fails_open() {
        let path = temp_journal("corrupt");
        {
            let store = EventStore::open(&path).unwrap();
            store.record(activity("u1", ActivityType::PaperUpload, "p1", at(9))).unwrap();
        }
        let valid = fs::read_to_string(&path).unwrap();
        fs::write(&path, format!("not json\n{}", valid)).unwrap();

        let err = EventStore::open(&path).err().unwrap();
        assert!(matches!(err, crate::error::RankError::Serialization(_)));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_replay_skips_duplicate_lines_and_compacts() {
        let path = temp_journal("compact");
        {
            let store = EventStore::open(&path).unwrap();
            store.record(activity("u1", ActivityType::PaperUpload, "p1", at(9))).unwrap();
        }
        // Simulate a producer-side double append.
        let contents = fs::read_to_string(&path).unwrap();
        fs::write(&path, format!("{}{}", contents, contents)).unwrap();

        let store = EventStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.compact().unwrap(), 1);

        let lines = fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().filter(|l| !l.trim().is_empty()).count(), 1);

        // Still appendable after compaction.
        store.record(activity("u1", ActivityType::PaperUpload, "p2", at(10))).unwrap();
        assert_eq!(EventStore::open(&path).unwrap().len(), 2);

        let _ = fs::remove_file(&path);
    }
}
