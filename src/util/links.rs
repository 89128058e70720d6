use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UrlError {
    #[error("Invalid URL: {0}")]
    Invalid(#[from] url::ParseError),

    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),

    #[error("URL has no host")]
    MissingHost,
}

/// Normalize a user-supplied subscription URL.
///
/// Surrounding whitespace is trimmed, `feed:` pseudo-schemes are rewritten
/// to their http equivalent and a missing scheme defaults to `http`. Only
/// http and https URLs with a host are accepted.
///
/// ```
/// use feedkeep::util::normalize_feed_url;
///
/// assert_eq!(
///     normalize_feed_url("feed://example.com/rss").unwrap(),
///     "http://example.com/rss"
/// );
/// assert!(normalize_feed_url("file:///etc/passwd").is_err());
/// ```
pub fn normalize_feed_url(input: &str) -> Result<String, UrlError> {
    let trimmed = input.trim();

    let rewritten = if let Some(rest) = trimmed.strip_prefix("feed://") {
        format!("http://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("feed:") {
        // feed:https://example.com/rss
        rest.to_string()
    } else if !trimmed.contains("://") {
        format!("http://{trimmed}")
    } else {
        trimmed.to_string()
    };

    let url = Url::parse(&rewritten)?;
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_owned())),
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => {}
        _ => return Err(UrlError::MissingHost),
    }
    Ok(url.to_string())
}

/// Resolve a possibly relative link against the document it came from.
/// Returns the input unchanged when it cannot be resolved.
pub fn resolve_link(base: Option<&str>, href: &str) -> String {
    let href = href.trim();
    if href.is_empty() {
        return String::new();
    }
    if let Ok(absolute) = Url::parse(href) {
        return absolute.to_string();
    }
    base.and_then(|b| Url::parse(b).ok())
        .and_then(|b| b.join(href).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| href.to_string())
}
