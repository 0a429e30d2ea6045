use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::roles::{BadgeAssigner, GamificationRole};
use super::scope::Candidate;
use crate::activity::Category;
use crate::scoring::Badge;

/// Default page size, matching what the leaderboard screen requests.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Earlier activity ranks higher; a missing time sorts last.
fn cmp_activity(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Total order over candidates: `Less` means `a` ranks above `b`.
///
/// Rank key descending, then earlier last activity in the ranked category,
/// then the smaller user id. Two distinct users never compare equal.
pub fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    b.rank_key
        .cmp(&a.rank_key)
        .then_with(|| cmp_activity(a.last_activity_at, b.last_activity_at))
        .then_with(|| a.user_id.cmp(&b.user_id))
}

/// Sort candidates into ranking order. O(N log N).
pub fn rank(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(compare);
    candidates
}

/// Global 1-based rank of `user_id` without sorting: one pass counting the
/// candidates that order before it.
pub fn position<'a>(candidates: &'a [Candidate], user_id: &str) -> Option<(usize, &'a Candidate)> {
    let me = candidates.iter().find(|c| c.user_id == user_id)?;
    let ahead = candidates
        .iter()
        .filter(|c| compare(c, me) == Ordering::Less)
        .count();
    Some((ahead + 1, me))
}

/// Offset/limit window onto a ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn slice<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        let start = self.offset.min(items.len());
        let end = start.saturating_add(self.limit).min(items.len());
        &items[start..end]
    }
}

/// One ranked row as served to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: String,
    pub campus_id: String,
    pub department_id: String,
    pub total_points: i64,
    /// The value this scope ranked by.
    pub ranked_points: i64,
    pub breakdown: BTreeMap<Category, i64>,
    pub badge: Badge,
    pub admin_badge: Option<Badge>,
    pub gamification_role: Option<GamificationRole>,
    pub is_admin: bool,
}

impl LeaderboardEntry {
    pub fn new(rank: usize, candidate: &Candidate, assigner: &BadgeAssigner) -> Self {
        let assignment = assigner.assign(&candidate.user_id, candidate.badge_points);
        Self {
            rank,
            user_id: candidate.user_id.clone(),
            campus_id: candidate.campus_id.clone(),
            department_id: candidate.department_id.clone(),
            total_points: candidate.total_points,
            ranked_points: candidate.rank_key,
            breakdown: candidate.breakdown.clone(),
            is_admin: assignment.is_admin(),
            badge: assignment.badge,
            admin_badge: assignment.admin_badge,
            gamification_role: assignment.gamification_role,
        }
    }
}

/// Rank candidates and decorate each with dense ranks `1..=N` and badges.
pub fn rank_entries(candidates: Vec<Candidate>, assigner: &BadgeAssigner) -> Vec<LeaderboardEntry> {
    rank(candidates)
        .iter()
        .enumerate()
        .map(|(i, c)| LeaderboardEntry::new(i + 1, c, assigner))
        .collect()
}

/// A single user's standing within a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MyRank {
    pub rank: usize,
    pub total_candidates: usize,
    pub total_points: i64,
    pub ranked_points: i64,
    pub breakdown: BTreeMap<Category, i64>,
}

pub fn my_rank(candidates: &[Candidate], user_id: &str) -> Option<MyRank> {
    let (rank, me) = position(candidates, user_id)?;
    Some(MyRank {
        rank,
        total_candidates: candidates.len(),
        total_points: me.total_points,
        ranked_points: me.rank_key,
        breakdown: me.breakdown.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn cand(user: &str, key: i64, minute: i64) -> Candidate {
        Candidate {
            user_id: user.to_string(),
            campus_id: "A".to_string(),
            department_id: "cs".to_string(),
            rank_key: key,
            last_activity_at: Some(at(minute)),
            total_points: key,
            breakdown: BTreeMap::new(),
            badge_points: key,
        }
    }

    fn order(candidates: Vec<Candidate>) -> Vec<String> {
        rank(candidates).into_iter().map(|c| c.user_id).collect()
    }

    #[test]
    fn test_sorts_by_points_descending() {
        let got = order(vec![cand("a", 10, 0), cand("b", 30, 0), cand("c", 20, 0)]);
        assert_eq!(got, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_tie_broken_by_earlier_activity() {
        // u_b was active later, so u_a (earlier) wins the tie at 100.
        let got = order(vec![cand("u_b", 100, 50), cand("u_a", 100, 10)]);
        assert_eq!(got, vec!["u_a", "u_b"]);
    }

    #[test]
    fn test_tie_broken_by_user_id_last() {
        let got = order(vec![cand("zed", 100, 10), cand("amy", 100, 10), cand("kim", 100, 10)]);
        assert_eq!(got, vec!["amy", "kim", "zed"]);
    }

    #[test]
    fn test_missing_activity_sorts_after() {
        let mut none = cand("aaa", 50, 0);
        none.last_activity_at = None;
        let got = order(vec![none, cand("zzz", 50, 99)]);
        assert_eq!(got, vec!["zzz", "aaa"]);
    }

    #[test]
    fn test_dense_unique_ranks() {
        let candidates: Vec<_> = (0..25)
            .map(|i| cand(&format!("user{:02}", i), (i % 4) * 10, i % 3))
            .collect();
        let entries = rank_entries(candidates, &BadgeAssigner::default());
        let ranks: Vec<_> = entries.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, (1..=25).collect::<Vec<_>>());
        for pair in entries.windows(2) {
            assert!(pair[0].ranked_points >= pair[1].ranked_points);
        }
    }

    #[test]
    fn test_order_independent_of_input_order() {
        let base = vec![cand("a", 5, 3), cand("b", 5, 1), cand("c", 9, 7), cand("d", 5, 1)];
        let expected = order(base.clone());
        let mut reversed = base;
        reversed.reverse();
        assert_eq!(order(reversed), expected);
        assert_eq!(expected, vec!["c", "b", "d", "a"]);
    }

    #[test]
    fn test_position_matches_full_sort() {
        let candidates = vec![
            cand("a", 5, 3),
            cand("b", 5, 1),
            cand("c", 9, 7),
            cand("d", 5, 1),
            cand("e", 1, 0),
        ];
        let sorted = rank(candidates.clone());
        for (i, c) in sorted.iter().enumerate() {
            let (pos, _) = position(&candidates, &c.user_id).unwrap();
            assert_eq!(pos, i + 1, "user {}", c.user_id);
        }
        assert!(position(&candidates, "ghost").is_none());
    }

    #[test]
    fn test_my_rank_reports_points() {
        let candidates = vec![cand("a", 40, 0), cand("b", 60, 0)];
        let mine = my_rank(&candidates, "a").unwrap();
        assert_eq!(mine.rank, 2);
        assert_eq!(mine.total_candidates, 2);
        assert_eq!(mine.ranked_points, 40);
    }

    #[test]
    fn test_page_slice_keeps_global_rank() {
        let candidates: Vec<_> = (0..10).map(|i| cand(&format!("u{}", i), 100 - i, 0)).collect();
        let entries = rank_entries(candidates, &BadgeAssigner::default());

        let page = Page::new(4, 3).slice(&entries);
        let ranks: Vec<_> = page.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![5, 6, 7]);

        assert_eq!(Page::new(8, 5).slice(&entries).len(), 2);
        assert!(Page::new(20, 5).slice(&entries).is_empty());
        assert_eq!(Page::new(0, usize::MAX).slice(&entries).len(), 10);
    }

    #[test]
    fn test_entry_uses_badge_points() {
        let mut c = cand("u1", 20, 0);
        c.badge_points = 250;
        let entry = LeaderboardEntry::new(1, &c, &BadgeAssigner::default());
        assert_eq!(entry.ranked_points, 20);
        assert_eq!(entry.badge.label, "Gold");
        assert!(!entry.is_admin);
    }
}
