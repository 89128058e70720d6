use chrono::{DateTime, TimeZone, Utc};

use super::folder::FolderId;

/// Store-assigned article identifier.
pub type ArticleId = i64;

/// Classification assigned while merging a refresh batch.
///
/// Consumed once by the refresh pipeline and then reset to `Empty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArticleStatus {
    #[default]
    Empty,
    New,
    Updated,
}

impl ArticleStatus {
    pub(crate) fn to_code(self) -> i64 {
        match self {
            ArticleStatus::Empty => 0,
            ArticleStatus::New => 1,
            ArticleStatus::Updated => 2,
        }
    }

    pub(crate) fn from_code(code: i64) -> Self {
        match code {
            1 => ArticleStatus::New,
            2 => ArticleStatus::Updated,
            _ => ArticleStatus::Empty,
        }
    }
}

/// A persisted article.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub id: ArticleId,
    pub folder_id: FolderId,
    pub guid: String,
    /// Parent article for threaded comments, 0 when top level.
    pub parent_id: ArticleId,
    pub title: String,
    pub author: String,
    pub link: String,
    pub body: String,
    pub summary: String,
    /// Publication date, unix seconds.
    pub date: i64,
    /// When the article was first stored, unix seconds.
    pub created_date: i64,
    pub enclosure: Option<String>,
    pub read: bool,
    pub revised: bool,
    pub flagged: bool,
    pub deleted: bool,
    pub has_enclosure: bool,
    pub enclosure_downloaded: bool,
    pub status: ArticleStatus,
}

impl Article {
    pub fn date_time(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.date, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Whether this article counts towards its folder's unread count.
    pub fn counts_as_unread(&self) -> bool {
        !self.read && !self.deleted
    }
}

/// A transient article produced by the feed parser.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedArticle {
    pub guid: String,
    pub title: String,
    pub author: String,
    pub link: String,
    pub body: String,
    pub summary: String,
    /// Publication date, unix seconds. The parser substitutes "now" for
    /// missing or unparsable dates.
    pub date: i64,
    pub enclosure: Option<String>,
    /// Read state reported by a sync server, authoritative when present.
    pub remote_read: Option<bool>,
    /// Starred state reported by a sync server, authoritative when present.
    pub remote_starred: Option<bool>,
}

impl ParsedArticle {
    /// Whether the stored article's content differs from this parsed copy.
    ///
    /// Dates are excluded: feeds that regenerate timestamps on every request
    /// would otherwise turn every refresh into an update.
    pub fn differs_from(&self, stored: &Article) -> bool {
        self.title != stored.title
            || self.author != stored.author
            || self.link != stored.link
            || self.body != stored.body
            || self.summary != stored.summary
            || self.enclosure != stored.enclosure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored() -> Article {
        Article {
            id: 1,
            folder_id: 2,
            guid: "g1".into(),
            parent_id: 0,
            title: "T1".into(),
            author: String::new(),
            link: "https://example.com/1".into(),
            body: "body".into(),
            summary: "body".into(),
            date: 1_700_000_000,
            created_date: 1_700_000_000,
            enclosure: None,
            read: false,
            revised: false,
            flagged: false,
            deleted: false,
            has_enclosure: false,
            enclosure_downloaded: false,
            status: ArticleStatus::New,
        }
    }

    #[test]
    fn test_differs_ignores_date() {
        let parsed = ParsedArticle {
            guid: "g1".into(),
            title: "T1".into(),
            link: "https://example.com/1".into(),
            body: "body".into(),
            summary: "body".into(),
            date: 1_800_000_000,
            ..Default::default()
        };
        assert!(!parsed.differs_from(&stored()));
    }

    #[test]
    fn test_differs_on_title() {
        let parsed = ParsedArticle {
            guid: "g1".into(),
            title: "T1-updated".into(),
            link: "https://example.com/1".into(),
            body: "body".into(),
            summary: "body".into(),
            ..Default::default()
        };
        assert!(parsed.differs_from(&stored()));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ArticleStatus::from_code(ArticleStatus::Updated.to_code()), ArticleStatus::Updated);
        assert_eq!(ArticleStatus::from_code(42), ArticleStatus::Empty);
    }
}
