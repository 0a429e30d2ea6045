pub mod rank;
pub mod roles;
pub mod scope;
pub mod snapshot;

pub use rank::{
    compare, my_rank, position, rank, rank_entries, LeaderboardEntry, MyRank, Page,
    DEFAULT_PAGE_LIMIT,
};
pub use roles::{Assignment, BadgeAssigner, GamificationRole, RoleDirectory, RoleGrant};
pub use scope::{resolve, resolve_all_time, resolve_windowed, Candidate, RankCategory, Scope};
pub use snapshot::{
    LeaderboardPage, Snapshot, SnapshotCache, SnapshotSettings, SnapshotSource, SnapshotState,
};
