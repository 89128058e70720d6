//! Persistent folder and article store on SQLite.
//!
//! [`Database`] is the only handle. Its methods are spread over one file per
//! concern: the schema and connection in `schema`, folder tree operations in
//! `folders`, article merge and state in `articles`, smart folders and the
//! criteria compiler in `smart`, and housekeeping in `maintenance`.

mod articles;
mod cache;
mod events;
mod folders;
mod maintenance;
mod schema;
mod smart;
mod types;

pub use cache::{FolderCache, FolderSnapshot};
pub use events::{EventBus, StoreEvent};
pub use schema::{Database, SCHEMA_VERSION};
pub use smart::{compile, SqlPredicate, SqlValue};
pub use types::{ArticleFilter, CreateOutcome, DatabaseError, MergeSummary, RefreshCommit};
