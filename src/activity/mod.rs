pub mod store;
pub mod types;

pub use store::{EventIter, EventStore, NewActivity, RecordOutcome};
pub use types::{ActivityEvent, ActivityRecord, ActivityType, Category, DedupKey, EventCursor};
