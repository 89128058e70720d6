//! Background favicon retrieval for feed folders.
//!
//! Runs beside the refresh pool with its own single permit so icon downloads
//! never hold up article fetches.

use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use url::Url;

use super::fetcher::{FetchError, Fetcher};
use crate::model::FolderId;
use crate::storage::Database;

/// Icons larger than this are ignored.
const MAX_ICON_BYTES: usize = 256 * 1024;

#[derive(Clone)]
pub struct FaviconFetcher {
    inner: Arc<Inner>,
}

struct Inner {
    db: Database,
    fetcher: Fetcher,
    permit: Semaphore,
    pending: watch::Sender<usize>,
}

/// `scheme://host[:port]/favicon.ico` for a page or feed URL.
pub fn favicon_url(page: &str) -> Option<String> {
    let mut url = Url::parse(page).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_query(None);
    url.set_fragment(None);
    url.set_path("/favicon.ico");
    Some(url.to_string())
}

impl FaviconFetcher {
    pub fn new(db: Database, fetcher: Fetcher) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                db,
                fetcher,
                permit: Semaphore::new(1),
                pending,
            }),
        }
    }

    /// Queue an icon fetch for the folder. Failures are logged, not returned.
    pub fn schedule(&self, folder_id: FolderId, page_url: &str) {
        let Some(icon_url) = favicon_url(page_url) else {
            tracing::debug!(folder_id, page_url, "no favicon location for URL");
            return;
        };
        let inner = Arc::clone(&self.inner);
        inner.pending.send_modify(|n| *n += 1);
        tokio::spawn(async move {
            if let Err(e) = inner.fetch_and_store(folder_id, &icon_url).await {
                tracing::debug!(folder_id, url = %icon_url, error = %e, "favicon fetch failed");
            }
            inner.pending.send_modify(|n| *n = n.saturating_sub(1));
        });
    }

    /// Resolves once no icon fetch is pending.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.inner.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Inner {
    async fn fetch_and_store(&self, folder_id: FolderId, icon_url: &str) -> Result<(), FaviconError> {
        let _permit = self.permit.acquire().await.map_err(|_| FaviconError::Closed)?;
        let (body, content_type) = self.fetcher.fetch_bytes(icon_url).await?;
        if body.is_empty() || body.len() > MAX_ICON_BYTES {
            return Err(FaviconError::Rejected(body.len()));
        }
        if content_type.as_deref().is_some_and(|ct| ct.starts_with("text/")) {
            return Err(FaviconError::NotAnImage);
        }
        self.db
            .set_folder_image(folder_id, &body, content_type.as_deref())
            .await?;
        self.db
            .update_folder_flags(folder_id, |f| f.check_for_image = false)
            .await?;
        tracing::debug!(folder_id, bytes = body.len(), "favicon stored");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum FaviconError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Database(#[from] crate::storage::DatabaseError),
    #[error("icon of {0} bytes rejected")]
    Rejected(usize),
    #[error("server returned a page, not an icon")]
    NotAnImage,
    #[error("favicon queue closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FetchSettings;
    use crate::model::ROOT_FOLDER_ID;
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_favicon_url() {
        assert_eq!(
            favicon_url("https://example.com/blog/feed.xml?x=1").as_deref(),
            Some("https://example.com/favicon.ico")
        );
        assert_eq!(
            favicon_url("http://example.com:8080/").as_deref(),
            Some("http://example.com:8080/favicon.ico")
        );
        assert!(favicon_url("ftp://example.com/").is_none());
        assert!(favicon_url("nonsense").is_none());
    }

    #[tokio::test]
    async fn test_icon_stored_and_flag_cleared() {
        let server = MockServer::start().await;
        Mock::given(path("/favicon.ico"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8, 0, 1, 0])
                    .insert_header("Content-Type", "image/x-icon"),
            )
            .mount(&server)
            .await;

        let db = Database::open(":memory:").await.unwrap();
        let feed_url = format!("{}/feed", server.uri());
        let id = db.add_rss_folder(ROOT_FOLDER_ID, Some("F"), &feed_url, None).await.unwrap();
        db.update_folder_flags(id, |f| f.check_for_image = true).await.unwrap();

        let favicons = FaviconFetcher::new(db.clone(), Fetcher::new(FetchSettings::default()).unwrap());
        favicons.schedule(id, &feed_url);
        favicons.wait_until_idle().await;

        let (image, mime) = db.folder_image(id).await.unwrap().unwrap();
        assert_eq!(image, vec![0u8, 0, 1, 0]);
        assert_eq!(mime.as_deref(), Some("image/x-icon"));
        assert!(!db.folder(id).await.unwrap().unwrap().flags.check_for_image);
    }

    #[tokio::test]
    async fn test_html_error_page_ignored() {
        let server = MockServer::start().await;
        Mock::given(path("/favicon.ico"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html>nope</html>")
                    .insert_header("Content-Type", "text/html"),
            )
            .mount(&server)
            .await;

        let db = Database::open(":memory:").await.unwrap();
        let feed_url = format!("{}/feed", server.uri());
        let id = db.add_rss_folder(ROOT_FOLDER_ID, Some("F"), &feed_url, None).await.unwrap();

        let favicons = FaviconFetcher::new(db.clone(), Fetcher::new(FetchSettings::default()).unwrap());
        favicons.schedule(id, &feed_url);
        favicons.wait_until_idle().await;
        assert!(db.folder_image(id).await.unwrap().is_none());
    }
}
