use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RankError;

/// Point bucket an activity contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Papers,
    Reviews,
    Community,
    Helpdesk,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Papers,
        Category::Reviews,
        Category::Community,
        Category::Helpdesk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Papers => "papers",
            Category::Reviews => "reviews",
            Category::Community => "community",
            Category::Helpdesk => "helpdesk",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of point-worthy action emitted by an activity producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    PaperUpload,
    PaperDownloaded,
    PaperMarkedHelpful,
    ReviewWritten,
    ReviewQualityBonus,
    ReviewMarkedHelpful,
    PostCreated,
    PostLiked,
    PostCommentReceived,
    PostPopularBonus,
    TicketCreated,
    TicketResolved,
}

impl ActivityType {
    pub const ALL: [ActivityType; 12] = [
        ActivityType::PaperUpload,
        ActivityType::PaperDownloaded,
        ActivityType::PaperMarkedHelpful,
        ActivityType::ReviewWritten,
        ActivityType::ReviewQualityBonus,
        ActivityType::ReviewMarkedHelpful,
        ActivityType::PostCreated,
        ActivityType::PostLiked,
        ActivityType::PostCommentReceived,
        ActivityType::PostPopularBonus,
        ActivityType::TicketCreated,
        ActivityType::TicketResolved,
    ];

    pub fn category(&self) -> Category {
        match self {
            ActivityType::PaperUpload
            | ActivityType::PaperDownloaded
            | ActivityType::PaperMarkedHelpful => Category::Papers,
            ActivityType::ReviewWritten
            | ActivityType::ReviewQualityBonus
            | ActivityType::ReviewMarkedHelpful => Category::Reviews,
            ActivityType::PostCreated
            | ActivityType::PostLiked
            | ActivityType::PostCommentReceived
            | ActivityType::PostPopularBonus => Category::Community,
            ActivityType::TicketCreated | ActivityType::TicketResolved => Category::Helpdesk,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::PaperUpload => "paper_upload",
            ActivityType::PaperDownloaded => "paper_downloaded",
            ActivityType::PaperMarkedHelpful => "paper_marked_helpful",
            ActivityType::ReviewWritten => "review_written",
            ActivityType::ReviewQualityBonus => "review_quality_bonus",
            ActivityType::ReviewMarkedHelpful => "review_marked_helpful",
            ActivityType::PostCreated => "post_created",
            ActivityType::PostLiked => "post_liked",
            ActivityType::PostCommentReceived => "post_comment_received",
            ActivityType::PostPopularBonus => "post_popular_bonus",
            ActivityType::TicketCreated => "ticket_created",
            ActivityType::TicketResolved => "ticket_resolved",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityType {
    type Err = RankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        ActivityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| RankError::config(format!("unknown activity type '{}'", s)))
    }
}

/// What a producer hands over after its own transaction commits.
///
/// `activity_type` stays a raw string here so an unrecognised kind is
/// rejected as a configuration error instead of failing deserialization of a
/// whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub user_id: String,
    pub campus_id: String,
    pub department_id: String,
    pub activity_type: String,
    pub resource_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Immutable, stored point-worthy action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: u64,
    pub user_id: String,
    pub campus_id: String,
    pub department_id: String,
    pub activity_type: ActivityType,
    pub resource_id: String,
    pub weight: i64,
    pub occurred_at: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            user_id: self.user_id.clone(),
            activity_type: self.activity_type,
            resource_id: self.resource_id.clone(),
        }
    }

    /// Position in the global `(occurred_at, id)` order.
    pub fn cursor(&self) -> EventCursor {
        EventCursor {
            occurred_at: self.occurred_at,
            id: self.id,
        }
    }

    pub fn category(&self) -> Category {
        self.activity_type.category()
    }
}

/// Identity of an activity for exactly-once recording.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub user_id: String,
    pub activity_type: ActivityType,
    pub resource_id: String,
}

/// Resumable position in the event stream. Events strictly after the
/// cursor are returned by `list_since`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventCursor {
    pub occurred_at: DateTime<Utc>,
    pub id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_type_from_str() {
        assert_eq!(
            "paper_upload".parse::<ActivityType>().unwrap(),
            ActivityType::PaperUpload
        );
        assert_eq!(
            " ticket_resolved ".parse::<ActivityType>().unwrap(),
            ActivityType::TicketResolved
        );
    }

    #[test]
    fn test_unknown_activity_type_is_configuration_error() {
        let err = "paper_deleted".parse::<ActivityType>().unwrap_err();
        assert!(matches!(err, RankError::Configuration(_)));
        assert!(err.to_string().contains("paper_deleted"));
    }

    #[test]
    fn test_every_type_maps_to_a_category() {
        assert_eq!(ActivityType::PaperUpload.category(), Category::Papers);
        assert_eq!(ActivityType::ReviewQualityBonus.category(), Category::Reviews);
        assert_eq!(ActivityType::PostPopularBonus.category(), Category::Community);
        assert_eq!(ActivityType::TicketResolved.category(), Category::Helpdesk);
    }

    #[test]
    fn test_downloads_and_likes_are_typed_activities() {
        let downloaded: ActivityType = "paper_downloaded".parse().unwrap();
        assert_eq!(downloaded, ActivityType::PaperDownloaded);
        assert_eq!(downloaded.category(), Category::Papers);

        let liked: ActivityType = "post_liked".parse().unwrap();
        assert_eq!(liked, ActivityType::PostLiked);
        assert_eq!(liked.category(), Category::Community);

        for category in Category::ALL {
            assert!(ActivityType::ALL.iter().any(|t| t.category() == category));
        }
    }

    #[test]
    fn test_serde_names_match_as_str() {
        for t in ActivityType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn test_cursor_orders_by_time_then_id() {
        let now = Utc::now();
        let a = EventCursor { occurred_at: now, id: 9 };
        let b = EventCursor { occurred_at: now, id: 10 };
        let c = EventCursor {
            occurred_at: now + chrono::Duration::seconds(1),
            id: 1,
        };
        assert!(a < b);
        assert!(b < c);
    }
}
