use thiserror::Error;

use crate::model::{
    Article, ArticleId, ArticleStatus, CriteriaError, Folder, FolderFlags, FolderId, FolderType,
    SessionFlags,
};

// ============================================================================
// Error Types
// ============================================================================

/// Store errors with user-facing messages.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file.
    #[error("The database is locked by another process. Please close it and try again.")]
    Locked,

    /// The store was opened read-only and a write was attempted.
    #[error("The database is open read-only; changes cannot be saved")]
    ReadOnly,

    #[error("Database migration failed: {0}")]
    Migration(String),

    /// The file was written by a newer version of this program.
    #[error("Database version {found} is newer than the supported version {supported}")]
    TooNew { found: i64, supported: i64 },

    #[error("{0} not found")]
    NotFound(String),

    /// The operation would break a store invariant.
    #[error("Invalid operation: {0}")]
    Invalid(String),

    #[error(transparent)]
    Criteria(#[from] CriteriaError),

    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Map lock-related SQLite failures to [`DatabaseError::Locked`].
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return DatabaseError::Locked;
        }
        if error_string.contains("attempt to write a readonly database") {
            return DatabaseError::ReadOnly;
        }

        DatabaseError::Other(err)
    }

    pub(crate) fn folder_not_found(id: FolderId) -> Self {
        DatabaseError::NotFound(format!("folder {id}"))
    }
}

// ============================================================================
// Operation Results
// ============================================================================

/// How a single parsed article was reconciled with the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Never seen before; inserted and recorded in the GUID history.
    New,
    /// Stored copy existed with different content; rewritten and marked revised.
    Updated,
    /// Stored copy existed and nothing changed.
    Unchanged,
    /// The GUID was seen before but the article has since been purged.
    Suppressed,
}

/// Aggregate of a batch merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub suppressed: usize,
}

impl MergeSummary {
    pub(crate) fn record(&mut self, outcome: CreateOutcome) {
        match outcome {
            CreateOutcome::New => self.new += 1,
            CreateOutcome::Updated => self.updated += 1,
            CreateOutcome::Unchanged => self.unchanged += 1,
            CreateOutcome::Suppressed => self.suppressed += 1,
        }
    }
}

/// Optional narrowing applied on top of a folder's article set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArticleFilter {
    pub unread_only: bool,
    pub flagged_only: bool,
    /// Case-insensitive substring match on title or body.
    pub text: Option<String>,
    pub limit: Option<i64>,
}

impl ArticleFilter {
    pub(crate) fn is_default(&self) -> bool {
        *self == ArticleFilter::default()
    }
}

/// Everything a successful feed fetch writes back, committed atomically with
/// the article merge.
#[derive(Debug, Clone, Default)]
pub struct RefreshCommit {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Target of a permanent redirect, replaces the stored feed URL.
    pub permanent_url: Option<String>,
    /// Channel title, used to replace a placeholder folder name.
    pub feed_title: Option<String>,
    pub home_page: Option<String>,
    pub description: Option<String>,
}

// ============================================================================
// Row Types
// ============================================================================

pub(crate) const FOLDER_COLUMNS: &str = "id, parent_id, next_sibling_id, first_child_id, name, \
     folder_type, flags, unread_count, child_unread_count, feed_url, home_page, description, \
     username, last_update, etag, last_modified, remote_id";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FolderRow {
    pub id: i64,
    pub parent_id: i64,
    pub next_sibling_id: i64,
    pub first_child_id: i64,
    pub name: String,
    pub folder_type: i64,
    pub flags: i64,
    pub unread_count: i64,
    pub child_unread_count: i64,
    pub feed_url: Option<String>,
    pub home_page: Option<String>,
    pub description: Option<String>,
    pub username: Option<String>,
    pub last_update: Option<i64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub remote_id: Option<String>,
}

impl FolderRow {
    /// Rows with an unknown type code are skipped by callers.
    pub(crate) fn into_folder(self) -> Option<Folder> {
        let folder_type = FolderType::from_code(self.folder_type)?;
        Some(Folder {
            id: self.id,
            parent_id: self.parent_id,
            next_sibling_id: self.next_sibling_id,
            first_child_id: self.first_child_id,
            name: self.name,
            folder_type,
            flags: FolderFlags::from_bits(self.flags),
            session: SessionFlags::default(),
            unread_count: self.unread_count,
            child_unread_count: self.child_unread_count,
            feed_url: self.feed_url,
            home_page: self.home_page,
            description: self.description,
            username: self.username,
            last_update: self.last_update,
            etag: self.etag,
            last_modified: self.last_modified,
            remote_id: self.remote_id,
        })
    }
}

pub(crate) const ARTICLE_COLUMNS: &str = "id, folder_id, guid, parent_id, title, author, link, \
     body, summary, date, created_date, enclosure, read, revised, flagged, deleted, \
     has_enclosure, enclosure_downloaded, status";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleRow {
    pub id: ArticleId,
    pub folder_id: FolderId,
    pub guid: String,
    pub parent_id: ArticleId,
    pub title: String,
    pub author: String,
    pub link: String,
    pub body: String,
    pub summary: String,
    pub date: i64,
    pub created_date: i64,
    pub enclosure: Option<String>,
    pub read: bool,
    pub revised: bool,
    pub flagged: bool,
    pub deleted: bool,
    pub has_enclosure: bool,
    pub enclosure_downloaded: bool,
    pub status: i64,
}

impl ArticleRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            id: self.id,
            folder_id: self.folder_id,
            guid: self.guid,
            parent_id: self.parent_id,
            title: self.title,
            author: self.author,
            link: self.link,
            body: self.body,
            summary: self.summary,
            date: self.date,
            created_date: self.created_date,
            enclosure: self.enclosure,
            read: self.read,
            revised: self.revised,
            flagged: self.flagged,
            deleted: self.deleted,
            has_enclosure: self.has_enclosure,
            enclosure_downloaded: self.enclosure_downloaded,
            status: ArticleStatus::from_code(self.status),
        }
    }
}
