use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::cache::FolderCache;
use super::events::{EventBus, StoreEvent};
use super::types::DatabaseError;

/// Schema version written by this build. Databases with a higher stored
/// version are refused.
pub const SCHEMA_VERSION: i64 = 3;

const VERSION_KEY: &str = "database_version";

struct Migration {
    version: i64,
    description: &'static str,
    statements: &'static [&'static str],
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "folder tree, articles, guid history, smart folders",
        statements: &[
            r#"
            CREATE TABLE folders (
                id INTEGER PRIMARY KEY,
                parent_id INTEGER NOT NULL,
                next_sibling_id INTEGER NOT NULL DEFAULT 0,
                first_child_id INTEGER NOT NULL DEFAULT 0,
                name TEXT NOT NULL,
                folder_type INTEGER NOT NULL,
                flags INTEGER NOT NULL DEFAULT 0,
                unread_count INTEGER NOT NULL DEFAULT 0,
                child_unread_count INTEGER NOT NULL DEFAULT 0,
                feed_url TEXT,
                home_page TEXT,
                username TEXT,
                last_update INTEGER
            )
            "#,
            r#"
            CREATE TABLE articles (
                id INTEGER PRIMARY KEY,
                folder_id INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
                guid TEXT NOT NULL,
                parent_id INTEGER NOT NULL DEFAULT 0,
                title TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL DEFAULT '',
                link TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                summary TEXT NOT NULL DEFAULT '',
                date INTEGER NOT NULL,
                created_date INTEGER NOT NULL,
                enclosure TEXT,
                read INTEGER NOT NULL DEFAULT 0,
                revised INTEGER NOT NULL DEFAULT 0,
                flagged INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                has_enclosure INTEGER NOT NULL DEFAULT 0,
                enclosure_downloaded INTEGER NOT NULL DEFAULT 0,
                status INTEGER NOT NULL DEFAULT 0,
                UNIQUE(folder_id, guid)
            )
            "#,
            r#"
            CREATE TABLE guid_history (
                folder_id INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
                guid TEXT NOT NULL,
                first_seen INTEGER NOT NULL,
                PRIMARY KEY (folder_id, guid)
            )
            "#,
            r#"
            CREATE TABLE smart_folders (
                folder_id INTEGER PRIMARY KEY REFERENCES folders(id) ON DELETE CASCADE,
                criteria TEXT NOT NULL
            )
            "#,
            "INSERT INTO folders (id, parent_id, name, folder_type) VALUES (0, -1, 'Root', 1)",
            "INSERT INTO folders (parent_id, name, folder_type) VALUES (0, 'Trash', 5)",
            "UPDATE folders SET first_child_id = (SELECT id FROM folders WHERE folder_type = 5) WHERE id = 0",
        ],
    },
    Migration {
        version: 2,
        description: "conditional GET validators, feed description, sync ids, folder images",
        statements: &[
            "ALTER TABLE folders ADD COLUMN etag TEXT",
            "ALTER TABLE folders ADD COLUMN last_modified TEXT",
            "ALTER TABLE folders ADD COLUMN description TEXT",
            "ALTER TABLE folders ADD COLUMN remote_id TEXT",
            r#"
            CREATE TABLE folder_images (
                folder_id INTEGER PRIMARY KEY REFERENCES folders(id) ON DELETE CASCADE,
                image BLOB NOT NULL,
                mime_type TEXT,
                updated_at INTEGER NOT NULL
            )
            "#,
        ],
    },
    Migration {
        version: 3,
        description: "query indexes",
        statements: &[
            "CREATE INDEX idx_articles_folder_state ON articles(folder_id, deleted, read)",
            "CREATE INDEX idx_articles_date ON articles(date DESC)",
            "CREATE INDEX idx_articles_flagged ON articles(flagged) WHERE flagged = 1",
            "CREATE INDEX idx_folders_parent ON folders(parent_id)",
            "CREATE INDEX idx_guid_history_seen ON guid_history(first_seen)",
        ],
    },
];

// ============================================================================
// Database
// ============================================================================

/// Handle to the article store. Cheap to clone; all clones share one pool,
/// one write gate and one folder cache.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    write_gate: Arc<Mutex<()>>,
    exclusive: Arc<RwLock<()>>,
    read_only: bool,
    pub(crate) events: EventBus,
    pub(crate) cache: FolderCache,
}

/// A write transaction holding the store's single-writer gate.
///
/// Field order matters: the transaction rolls back (if uncommitted) before
/// the gates are released.
pub(crate) struct WriteTxn {
    pub(crate) tx: Transaction<'static, Sqlite>,
    _writer: OwnedMutexGuard<()>,
    _shared: OwnedRwLockReadGuard<()>,
}

impl WriteTxn {
    pub(crate) fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub(crate) async fn commit(self) -> Result<(), DatabaseError> {
        self.tx.commit().await.map_err(DatabaseError::from_sqlx)
    }
}

/// A pooled connection for reads. Holds the shared side of the exclusive
/// gate, so compact and reindex never overlap a query.
pub(crate) struct ReadConn {
    conn: PoolConnection<Sqlite>,
    _shared: OwnedRwLockReadGuard<()>,
}

impl ReadConn {
    pub(crate) fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }
}

impl Database {
    /// Open (creating if needed) a read-write store and bring its schema up
    /// to date.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Locked` if another process holds the file,
    /// `DatabaseError::TooNew` if the file was written by a newer version and
    /// `DatabaseError::Migration` if a migration step failed (nothing is
    /// applied in that case).
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let pool = connect(path, false).await?;
        let version = run_migrations(&pool).await?;
        tracing::debug!(path = %path, version, "database opened");
        Ok(Self::from_pool(pool, false))
    }

    /// Open an existing store without write access. The schema must already
    /// be current.
    pub async fn open_read_only(path: &str) -> Result<Self, DatabaseError> {
        if path == ":memory:" {
            return Err(DatabaseError::Invalid(
                "an in-memory database cannot be opened read-only".into(),
            ));
        }
        let pool = connect(path, true).await?;
        let mut conn = pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        let version = stored_version(&mut conn).await?;
        drop(conn);
        if version > SCHEMA_VERSION {
            return Err(DatabaseError::TooNew {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        if version < SCHEMA_VERSION {
            return Err(DatabaseError::Migration(format!(
                "read-only database is at version {version} and needs migration"
            )));
        }
        tracing::warn!(path = %path, "database opened read-only");
        Ok(Self::from_pool(pool, true))
    }

    /// Open read-write, falling back to read-only when the file cannot be
    /// opened for writing. Migration failures are never masked.
    pub async fn open_or_read_only(path: &str) -> Result<Self, DatabaseError> {
        match Self::open(path).await {
            Ok(db) => Ok(db),
            Err(e @ (DatabaseError::Migration(_) | DatabaseError::TooNew { .. })) => Err(e),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "read-write open failed, trying read-only");
                Self::open_read_only(path).await
            }
        }
    }

    fn from_pool(pool: SqlitePool, read_only: bool) -> Self {
        Self {
            pool,
            write_gate: Arc::new(Mutex::new(())),
            exclusive: Arc::new(RwLock::new(())),
            read_only,
            events: EventBus::new(),
            cache: FolderCache::new(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &FolderCache {
        &self.cache
    }

    /// Close the underlying pool. Outstanding clones become unusable.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Stored schema version.
    pub async fn database_version(&self) -> Result<i64, DatabaseError> {
        let mut r = self.reader().await?;
        stored_version(r.conn()).await
    }

    /// Take a connection for reading, waiting out any compact or reindex.
    pub(crate) async fn reader(&self) -> Result<ReadConn, DatabaseError> {
        let shared = self.exclusive.clone().read_owned().await;
        let conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        Ok(ReadConn {
            conn,
            _shared: shared,
        })
    }

    /// Start a write transaction behind the single-writer gate.
    pub(crate) async fn begin_write(&self) -> Result<WriteTxn, DatabaseError> {
        if self.read_only {
            return Err(DatabaseError::ReadOnly);
        }
        let shared = self.exclusive.clone().read_owned().await;
        let writer = self.write_gate.clone().lock_owned().await;
        let tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
        Ok(WriteTxn {
            tx,
            _writer: writer,
            _shared: shared,
        })
    }

    /// Wait until no read or write is in progress and block new ones.
    pub(crate) async fn exclusive(&self) -> Result<OwnedRwLockWriteGuard<()>, DatabaseError> {
        if self.read_only {
            return Err(DatabaseError::ReadOnly);
        }
        Ok(self.exclusive.clone().write_owned().await)
    }
}

pub(crate) async fn connect(path: &str, read_only: bool) -> Result<SqlitePool, DatabaseError> {
    let memory = path == ":memory:";

    #[cfg(unix)]
    if !memory && !read_only {
        prepare_db_file(path);
    }

    let url = if memory {
        "sqlite::memory:".to_string()
    } else if read_only {
        format!("sqlite:{path}?mode=ro")
    } else {
        format!("sqlite:{path}?mode=rwc")
    };

    let mut options = SqliteConnectOptions::from_str(&url)
        .map_err(DatabaseError::from_sqlx)?
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true)
        .read_only(read_only)
        .with_regexp();
    if !memory && !read_only {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    // Every connection to ":memory:" is a separate database, so the pool must
    // hold exactly one connection and never recycle it.
    let pool_options = if memory {
        SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    pool_options
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .map_err(DatabaseError::from_sqlx)
}

/// Create the file with owner-only permissions before SQLite touches it.
#[cfg(unix)]
fn prepare_db_file(path: &str) {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let db_path = std::path::Path::new(path);
    if db_path.exists() {
        if let Err(e) = std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600)) {
            tracing::warn!(path = %path, error = %e, "failed to restrict database file permissions");
        }
    } else if db_path.parent().is_some_and(|p| p.as_os_str().is_empty() || p.exists()) {
        // If this fails SQLite reports the real error at connect time.
        let _ = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(db_path);
    }
}

async fn stored_version(conn: &mut SqliteConnection) -> Result<i64, DatabaseError> {
    let has_info: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'info'")
            .fetch_optional(&mut *conn)
            .await
            .map_err(DatabaseError::from_sqlx)?;
    if has_info.is_none() {
        return Ok(0);
    }
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM info WHERE key = ?")
        .bind(VERSION_KEY)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    match row {
        None => Ok(0),
        Some((value,)) => value.trim().parse().map_err(|_| {
            DatabaseError::Migration(format!("unreadable database version {value:?}"))
        }),
    }
}

/// Apply every pending migration in one transaction. Returns the resulting
/// version.
pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<i64, DatabaseError> {
    migrate_to(pool, SCHEMA_VERSION).await
}

async fn migrate_to(pool: &SqlitePool, target: i64) -> Result<i64, DatabaseError> {
    let mut tx = pool.begin().await.map_err(DatabaseError::from_sqlx)?;

    sqlx::query("CREATE TABLE IF NOT EXISTS info (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

    let current = stored_version(&mut tx).await?;
    if current > SCHEMA_VERSION {
        return Err(DatabaseError::TooNew {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }
    if current >= target {
        return Ok(current);
    }

    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > current && m.version <= target)
    {
        for statement in migration.statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| match DatabaseError::from_sqlx(e) {
                    DatabaseError::Other(e) => DatabaseError::Migration(format!(
                        "step {} ({}): {e}",
                        migration.version, migration.description
                    )),
                    other => other,
                })?;
        }
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applied database migration"
        );
    }

    sqlx::query("INSERT OR REPLACE INTO info (key, value) VALUES (?, ?)")
        .bind(VERSION_KEY)
        .bind(target.to_string())
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

    tx.commit().await.map_err(DatabaseError::from_sqlx)?;
    Ok(target)
}
