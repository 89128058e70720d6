//! Small helpers shared by the store, the parser and the fetcher.
//!
//! - **Text**: control-character stripping, folder name cleanup, plain-text
//!   summaries of HTML bodies and SQL `LIKE` escaping
//! - **URLs**: feed URL normalization and relative link resolution

mod text;
mod links;

pub use self::text::{clean_name, escape_like, strip_control_chars, summarize};
pub use self::links::{normalize_feed_url, resolve_link, UrlError};

/// Length in characters of generated article summaries.
pub const SUMMARY_LENGTH: usize = 200;
