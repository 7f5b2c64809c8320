use serde::Serialize;
use sqlx::FromRow;

/// A cached Hacker News story (or job/poll post) row.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct Story {
    pub id: i64,
    pub title: String,
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub score: i64,
    pub by: String,
    pub time: i64,
    pub descendants: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub fetched_at: i64,
    pub rank: Option<i64>,
    pub dead: bool,
}

/// One comment row as persisted. Tree structure is rebuilt at read time.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Comment {
    pub id: i64,
    pub story_id: i64,
    pub parent_id: Option<i64>,
    pub by: Option<String>,
    pub text: Option<String>,
    pub time: i64,
    pub dead: bool,
    pub deleted: bool,
    pub fetched_at: i64,
}

/// A comment with its resolved children, as served to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommentNode {
    pub id: i64,
    pub by: Option<String>,
    pub text: Option<String>,
    pub time: i64,
    pub dead: bool,
    pub deleted: bool,
    pub children: Vec<CommentNode>,
}

impl CommentNode {
    pub(crate) fn from_row(row: Comment) -> Self {
        Self {
            id: row.id,
            by: row.by,
            text: row.text,
            time: row.time,
            dead: row.dead,
            deleted: row.deleted,
            children: Vec::new(),
        }
    }
}

/// Extracted reader-mode content for a story, 1:1 by story id.
///
/// `extraction_failed` is cached state: a failed extraction is recorded so
/// reads do not retrigger it; an explicit refresh re-attempts.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct Article {
    pub story_id: i64,
    pub content: Option<String>,
    pub title: Option<String>,
    pub excerpt: Option<String>,
    pub byline: Option<String>,
    pub extraction_failed: bool,
    pub fetched_at: i64,
}

/// A computed popularity score for one story in one period window.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    pub story_id: i64,
    pub period: Period,
    pub score: f64,
    pub computed_at: i64,
}

/// A story id paired with its 1-based front-page position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankPair {
    pub id: i64,
    pub rank: i64,
}

/// Ranking period windows. `Yesterday` keeps raw scores; the others decay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Day,
    Yesterday,
    Week,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Day, Period::Yesterday, Period::Week];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Period::Day => "day",
            Period::Yesterday => "yesterday",
            Period::Week => "week",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "day" => Some(Period::Day),
            "yesterday" => Some(Period::Yesterday),
            "week" => Some(Period::Week),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_round_trips_through_str() {
        for period in Period::ALL {
            assert_eq!(Period::parse(period.as_str()), Some(period));
        }
        assert_eq!(Period::parse("fortnight"), None);
    }
}
