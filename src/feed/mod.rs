//! Getting feeds from the network into the store.
//!
//! - [`fetcher`]: HTTP with conditional GET, manual redirects and retries
//! - [`parser`]: RSS 0.9x/2.0, RDF, Atom and OpenReader stream documents
//! - [`refresh`]: the bounded-concurrency refresh pipeline
//! - [`favicon`]: folder icons, fetched after a successful refresh
//! - [`activity`]: per-folder status log
//! - [`opml`]: subscription list import and export

pub mod activity;
pub mod dates;
pub mod favicon;
pub mod fetcher;
pub mod opml;
pub mod parser;
pub mod refresh;

pub use activity::{ActivityEntry, ActivityLog};
pub use dates::parse_date;
pub use favicon::{favicon_url, FaviconFetcher};
pub use fetcher::{FetchError, FetchOutcome, FetchRequest, FetchSettings, FetchedFeed, Fetcher};
pub use opml::{
    export_opml, import_opml, parse_opml, read_opml, write_atomically, ImportSummary, OpmlEntry,
    OpmlError, OpmlFeed,
};
pub use parser::{
    parse_feed, parse_feed_at, parse_stream_contents, ParseError, ParsedFeed, StreamPage,
};
pub use refresh::{feed_credential_key, RefreshError, RefreshManager, RefreshState};
