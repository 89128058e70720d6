//! Feed storage and synchronization engine.
//!
//! A SQLite-backed folder tree and article store with GUID-history
//! deduplication and unread rollups, a criteria compiler for smart folders,
//! a bounded-concurrency refresh pipeline for RSS/Atom/RDF feeds, and a
//! client for OpenReader (Google Reader API) sync servers.

pub mod config;
pub mod credentials;
pub mod feed;
pub mod model;
pub mod storage;
pub mod sync;
pub mod util;
