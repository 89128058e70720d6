//! OpenReader (Google Reader API) client.
//!
//! Authenticates with ClientLogin, keeps the auth token fresh from a
//! background task and re-authenticates once when a request is refused.
//! Pulls the subscription list and stream contents into the store.

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use super::token::{parse_client_login, Token, AUTH_TOKEN_LIFETIME, EDIT_TOKEN_LIFETIME};
use super::SyncError;
use crate::credentials::CredentialStore;
use crate::feed::{parse_stream_contents, Fetcher, StreamPage};
use crate::model::{FolderId, FolderType, InsertPosition, ROOT_FOLDER_ID};
use crate::storage::{Database, MergeSummary, RefreshCommit};

/// Items requested per stream page.
const STREAM_PAGE_SIZE: u32 = 200;

/// Pages fetched per folder refresh before giving up on the continuation.
const MAX_STREAM_PAGES: usize = 5;

/// Floor between background token renewals, also the retry delay after a
/// failed renewal.
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(30);

/// Set by servers when the `T` token in a write was rejected.
const BAD_TOKEN_HEADER: &str = "X-Reader-Google-Bad-Token";

pub(crate) const READ_TAG: &str = "user/-/state/com.google/read";
pub(crate) const STARRED_TAG: &str = "user/-/state/com.google/starred";
pub(crate) const LABEL_PREFIX: &str = "user/-/label/";

/// Connection to one OpenReader account. Cheap to clone.
#[derive(Clone)]
pub struct SyncClient {
    pub(super) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(super) db: Database,
    http: reqwest::Client,
    base: Url,
    username: String,
    credentials: Arc<dyn CredentialStore>,
    auth: Mutex<Option<Token>>,
    edit: Mutex<Option<Token>>,
    pub(super) max_retries: u32,
    pub(super) retry_base_delay: Duration,
    timeout: Duration,
}

/// One entry of `subscription/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSubscription {
    /// Stream id, `feed/<url>`.
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub categories: Vec<RemoteCategory>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "htmlUrl")]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCategory {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl RemoteSubscription {
    /// First label the subscription carries.
    pub fn label(&self) -> Option<&str> {
        self.categories.iter().find_map(|c| {
            c.label
                .as_deref()
                .filter(|l| !l.is_empty())
                .or_else(|| c.id.rsplit_once("/label/").map(|(_, l)| l))
        })
    }

    pub fn feed_url(&self) -> &str {
        self.url
            .as_deref()
            .or_else(|| self.id.strip_prefix("feed/"))
            .unwrap_or(&self.id)
    }
}

#[derive(Deserialize)]
struct SubscriptionList {
    #[serde(default)]
    subscriptions: Vec<RemoteSubscription>,
}

/// What [`SyncClient::sync_subscriptions`] changed locally.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionReport {
    pub added: usize,
    pub moved: usize,
    pub renamed: usize,
    pub removed: usize,
}

impl SyncClient {
    pub fn new(
        db: Database,
        fetcher: &Fetcher,
        credentials: Arc<dyn CredentialStore>,
        server: &str,
        username: &str,
    ) -> Result<Self, SyncError> {
        let mut base = Url::parse(server.trim()).map_err(|e| SyncError::InvalidUrl(e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!("unsupported scheme in {base}")));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let settings = fetcher.settings();
        Ok(Self {
            inner: Arc::new(ClientInner {
                db,
                http: fetcher.client().clone(),
                base,
                username: username.to_string(),
                credentials,
                auth: Mutex::new(None),
                edit: Mutex::new(None),
                max_retries: settings.max_retries,
                retry_base_delay: settings.retry_base_delay,
                timeout: settings.timeout,
            }),
        })
    }

    /// Key under which the account password is kept in the credential store.
    pub fn credential_key(&self) -> &str {
        self.inner.base.as_str()
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Log in now, replacing any cached token.
    pub async fn authenticate(&self) -> Result<(), SyncError> {
        let mut auth = self.inner.auth.lock().await;
        *auth = Some(self.client_login().await?);
        Ok(())
    }

    async fn client_login(&self) -> Result<Token, SyncError> {
        let creds = self
            .inner
            .credentials
            .get(self.credential_key())?
            .ok_or(SyncError::MissingCredentials)?;
        let body = form_body([
            ("Email", self.inner.username.as_str()),
            ("Passwd", creds.password.expose_secret()),
        ]);
        let url = self.endpoint("accounts/ClientLogin")?;
        let response = self
            .timed(
                self.inner
                    .http
                    .post(url)
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(body)
                    .send(),
            )
            .await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                tracing::warn!(user = %self.inner.username, "sync server rejected login");
                return Err(SyncError::AuthFailed);
            }
            s if !s.is_success() => return Err(SyncError::Status(s.as_u16())),
            _ => {}
        }
        let text = response.text().await?;
        let token = parse_client_login(&text)
            .ok_or_else(|| SyncError::Protocol("ClientLogin response has no Auth line".into()))?;
        tracing::info!(user = %self.inner.username, server = %self.inner.base, "signed in to sync server");
        Ok(Token::new(token, AUTH_TOKEN_LIFETIME))
    }

    /// Current auth token, logging in when there is none or it is stale.
    async fn auth_token(&self) -> Result<String, SyncError> {
        let mut auth = self.inner.auth.lock().await;
        match auth.as_ref() {
            Some(token) if token.is_fresh() => Ok(token.expose().to_string()),
            _ => {
                let token = self.client_login().await?;
                let value = token.expose().to_string();
                *auth = Some(token);
                Ok(value)
            }
        }
    }

    async fn invalidate_auth(&self) {
        *self.inner.auth.lock().await = None;
    }

    /// Edit (`T`) token for write requests, cached for its own lifetime.
    pub(super) async fn edit_token(&self) -> Result<String, SyncError> {
        let mut edit = self.inner.edit.lock().await;
        if let Some(token) = edit.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.expose().to_string());
        }
        let url = self.endpoint("reader/api/0/token")?;
        let text = self.send(Method::GET, url, None).await?.text().await?;
        let value = text.trim();
        if value.is_empty() {
            return Err(SyncError::Protocol("empty edit token".into()));
        }
        *edit = Some(Token::new(value, EDIT_TOKEN_LIFETIME));
        Ok(value.to_string())
    }

    /// Renew the auth token in the background until every client handle is
    /// dropped.
    pub fn spawn_token_refresher(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let wake = match weak.upgrade() {
                    Some(inner) => SyncClient { inner }.renewal_due().await,
                    None => break,
                };
                tokio::time::sleep_until(wake).await;
                let Some(inner) = weak.upgrade() else { break };
                let client = SyncClient { inner };
                if client.has_auth().await {
                    if let Err(e) = client.auth_token().await {
                        tracing::warn!(error = %e, "background token renewal failed");
                    }
                }
            }
            tracing::debug!("token refresher stopped");
        })
    }

    async fn renewal_due(&self) -> Instant {
        let floor = Instant::now() + MIN_RENEW_INTERVAL;
        match self.inner.auth.lock().await.as_ref() {
            Some(token) => token.refresh_at().max(floor),
            None => floor,
        }
    }

    async fn has_auth(&self) -> bool {
        self.inner.auth.lock().await.is_some()
    }

    // ========================================================================
    // Requests
    // ========================================================================

    pub(super) fn endpoint(&self, path: &str) -> Result<Url, SyncError> {
        self.inner
            .base
            .join(path)
            .map_err(|e| SyncError::InvalidUrl(e.to_string()))
    }

    async fn timed(
        &self,
        request: impl std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    ) -> Result<reqwest::Response, SyncError> {
        tokio::time::timeout(self.inner.timeout, request)
            .await
            .map_err(|_| SyncError::Timeout)?
            .map_err(SyncError::Network)
    }

    /// Authorized request. A 401 triggers one fresh login and a resend.
    pub(super) async fn send(
        &self,
        method: Method,
        url: Url,
        form: Option<String>,
    ) -> Result<reqwest::Response, SyncError> {
        let mut reauthenticated = false;
        loop {
            let token = self.auth_token().await?;
            let mut request = self
                .inner
                .http
                .request(method.clone(), url.clone())
                .header(AUTHORIZATION, format!("GoogleLogin auth={token}"));
            if let Some(body) = &form {
                request = request
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(body.clone());
            }
            let response = self.timed(request.send()).await?;
            if response.headers().contains_key(BAD_TOKEN_HEADER) {
                return Err(SyncError::BadEditToken);
            }
            match response.status() {
                StatusCode::UNAUTHORIZED if !reauthenticated => {
                    tracing::info!(url = %url, "sync request unauthorized, signing in again");
                    self.invalidate_auth().await;
                    reauthenticated = true;
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(SyncError::AuthFailed),
                s if !s.is_success() => return Err(SyncError::Status(s.as_u16())),
                _ => return Ok(response),
            }
        }
    }

    /// POST a write with the edit token, renewing the token once if the
    /// server rejects it. Servers answer `OK` on success.
    pub(super) async fn post_edit(&self, path: &str, params: &[(&str, String)]) -> Result<(), SyncError> {
        let url = self.endpoint(path)?;
        let mut renewed = false;
        loop {
            let t = self.edit_token().await?;
            let body = form_body(
                params
                    .iter()
                    .map(|(k, v)| (*k, v.as_str()))
                    .chain(std::iter::once(("T", t.as_str()))),
            );
            match self.send(Method::POST, url.clone(), Some(body)).await {
                Err(SyncError::BadEditToken) if !renewed => {
                    *self.inner.edit.lock().await = None;
                    renewed = true;
                }
                Err(e) => return Err(e),
                Ok(response) => {
                    let text = response.text().await?;
                    if text.trim().eq_ignore_ascii_case("OK") {
                        return Ok(());
                    }
                    return Err(SyncError::Protocol(format!("{path} answered {:?}", text.trim())));
                }
            }
        }
    }

    // ========================================================================
    // Pull
    // ========================================================================

    pub async fn subscriptions(&self) -> Result<Vec<RemoteSubscription>, SyncError> {
        let mut url = self.endpoint("reader/api/0/subscription/list")?;
        url.query_pairs_mut().append_pair("output", "json");
        let bytes = self.send(Method::GET, url, None).await?.bytes().await?;
        let list: SubscriptionList =
            serde_json::from_slice(&bytes).map_err(|e| SyncError::Protocol(e.to_string()))?;
        Ok(list.subscriptions)
    }

    /// Mirror the server's subscription list in the folder tree.
    ///
    /// Labels become Group folders under the root. Local OpenReader folders
    /// the server no longer lists are deleted.
    pub async fn sync_subscriptions(&self) -> Result<SubscriptionReport, SyncError> {
        let subscriptions = self.subscriptions().await?;
        let db = &self.inner.db;
        let snapshot = db.folder_snapshot().await?;
        let mut report = SubscriptionReport::default();
        let mut seen = HashSet::new();

        for sub in &subscriptions {
            seen.insert(sub.id.as_str());
            let parent = match sub.label() {
                Some(label) => {
                    db.add_folder(ROOT_FOLDER_ID, InsertPosition::Last, label, FolderType::Group, false)
                        .await?
                }
                None => ROOT_FOLDER_ID,
            };
            let title = if sub.title.trim().is_empty() {
                sub.feed_url()
            } else {
                sub.title.as_str()
            };

            match snapshot.find_by_remote_id(&sub.id) {
                Some(existing) => {
                    if existing.parent_id != parent {
                        db.set_parent(existing.id, parent, InsertPosition::Last).await?;
                        report.moved += 1;
                    }
                    if existing.name != title {
                        match db.rename_folder(existing.id, title).await {
                            Ok(()) => report.renamed += 1,
                            Err(e) => {
                                tracing::warn!(folder_id = existing.id, error = %e, "could not apply remote title")
                            }
                        }
                    }
                }
                None => {
                    db.add_open_reader_folder(parent, title, sub.feed_url(), &sub.id)
                        .await?;
                    report.added += 1;
                }
            }
        }

        let stale: Vec<FolderId> = db
            .feed_folders()
            .await?
            .into_iter()
            .filter(|f| f.folder_type == FolderType::OpenReader)
            .filter(|f| f.remote_id.as_deref().is_some_and(|id| !seen.contains(id)))
            .map(|f| f.id)
            .collect();
        for id in stale {
            db.delete_folder(id).await?;
            report.removed += 1;
        }

        tracing::info!(
            added = report.added,
            moved = report.moved,
            renamed = report.renamed,
            removed = report.removed,
            "subscriptions synchronized"
        );
        Ok(report)
    }

    pub async fn stream_contents(
        &self,
        stream_id: &str,
        continuation: Option<&str>,
    ) -> Result<StreamPage, SyncError> {
        let mut url = self.endpoint("reader/api/0/stream/contents")?;
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidUrl(self.inner.base.to_string()))?
            .push(stream_id);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("output", "json");
            query.append_pair("n", &STREAM_PAGE_SIZE.to_string());
            if let Some(c) = continuation {
                query.append_pair("c", c);
            }
        }
        let bytes = self.send(Method::GET, url, None).await?.bytes().await?;
        Ok(parse_stream_contents(&bytes, chrono::Utc::now())?)
    }

    /// Fetch a synced folder's stream and merge it like an RSS refresh.
    ///
    /// Read and starred state from the server wins. It is applied to every
    /// stored article only when the whole stream was read.
    pub async fn refresh_folder(&self, folder_id: FolderId) -> Result<MergeSummary, SyncError> {
        let db = &self.inner.db;
        let folder = db
            .folder(folder_id)
            .await?
            .ok_or(SyncError::NotSynced(folder_id))?;
        let stream_id = folder
            .remote_id
            .filter(|_| folder.folder_type == FolderType::OpenReader)
            .ok_or(SyncError::NotSynced(folder_id))?;

        let mut articles = Vec::new();
        let mut continuation: Option<String> = None;
        let mut complete = false;
        for _ in 0..MAX_STREAM_PAGES {
            let page = self.stream_contents(&stream_id, continuation.as_deref()).await?;
            articles.extend(page.articles);
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => {
                    complete = true;
                    break;
                }
            }
        }

        let summary = db
            .commit_refresh(folder_id, &articles, &RefreshCommit::default())
            .await?;

        if complete {
            let unread: HashSet<String> = articles
                .iter()
                .filter(|a| a.remote_read == Some(false))
                .map(|a| a.guid.clone())
                .collect();
            let starred: HashSet<String> = articles
                .iter()
                .filter(|a| a.remote_starred == Some(true))
                .map(|a| a.guid.clone())
                .collect();
            db.apply_remote_state(folder_id, &unread, &starred).await?;
        }

        tracing::info!(folder_id, new = summary.new, pages_complete = complete, "synced folder refreshed");
        Ok(summary)
    }
}

pub(super) fn form_body<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::credentials::{Credentials, MemoryCredentialStore};
    use crate::feed::FetchSettings;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_string_contains, header, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/accounts/ClientLogin"))
            .and(body_string_contains("Email=ann"))
            .respond_with(ResponseTemplate::new(200).set_body_string("SID=x\nLSID=y\nAuth=tok1\n"))
            .mount(server)
            .await;
    }

    pub(crate) async fn client(server: &MockServer) -> SyncClient {
        let db = Database::open(":memory:").await.unwrap();
        let store = Arc::new(MemoryCredentialStore::new());
        let fetcher = Fetcher::new(FetchSettings {
            retry_base_delay: Duration::from_millis(5),
            ..FetchSettings::default()
        })
        .unwrap();
        let client = SyncClient::new(db, &fetcher, store.clone(), &server.uri(), "ann").unwrap();
        store
            .set(client.credential_key(), Credentials::new("ann", "pw"))
            .unwrap();
        client
    }

    const SUBSCRIPTIONS: &str = r#"{"subscriptions":[
        {"id":"feed/https://a.example/rss","title":"Alpha","categories":[{"id":"user/-/label/Tech","label":"Tech"}],"url":"https://a.example/rss","htmlUrl":"https://a.example/"},
        {"id":"feed/https://b.example/rss","title":"Beta","categories":[]}
    ]}"#;

    #[test]
    fn test_remote_subscription_helpers() {
        let list: SubscriptionList = serde_json::from_str(SUBSCRIPTIONS).unwrap();
        assert_eq!(list.subscriptions[0].label(), Some("Tech"));
        assert_eq!(list.subscriptions[1].label(), None);
        assert_eq!(list.subscriptions[1].feed_url(), "https://b.example/rss");
    }

    #[tokio::test]
    async fn test_login_and_authorized_request() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(path("/reader/api/0/subscription/list"))
            .and(header("Authorization", "GoogleLogin auth=tok1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SUBSCRIPTIONS))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let subs = client.subscriptions().await.unwrap();
        assert_eq!(subs.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_password_is_reported() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        client.inner.credentials.remove(client.credential_key()).unwrap();
        let err = client.authenticate().await.unwrap_err();
        assert!(matches!(err, SyncError::MissingCredentials));
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let server = MockServer::start().await;
        Mock::given(path("/accounts/ClientLogin"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Error=BadAuthentication"))
            .mount(&server)
            .await;
        let client = client(&server).await;
        assert!(matches!(client.authenticate().await.unwrap_err(), SyncError::AuthFailed));
    }

    #[tokio::test]
    async fn test_unauthorized_reauthenticates_once() {
        let server = MockServer::start().await;
        Mock::given(path("/accounts/ClientLogin"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Auth=tok1\n"))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(path("/reader/api/0/subscription/list"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let client = client(&server).await;
        let err = client.subscriptions().await.unwrap_err();
        assert!(matches!(err, SyncError::AuthFailed));
    }

    #[tokio::test]
    async fn test_sync_subscriptions_builds_tree() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(path("/reader/api/0/subscription/list"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SUBSCRIPTIONS))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let report = client.sync_subscriptions().await.unwrap();
        assert_eq!(report.added, 2);

        let db = client.database();
        let tech = db.folder_by_name("Tech").await.unwrap().unwrap();
        assert_eq!(tech.folder_type, FolderType::Group);
        let alpha = db.folder_by_name("Alpha").await.unwrap().unwrap();
        assert_eq!(alpha.folder_type, FolderType::OpenReader);
        assert_eq!(alpha.parent_id, tech.id);
        assert_eq!(alpha.remote_id.as_deref(), Some("feed/https://a.example/rss"));
        let beta = db.folder_by_name("Beta").await.unwrap().unwrap();
        assert_eq!(beta.parent_id, ROOT_FOLDER_ID);

        // A second pass is a no-op.
        assert_eq!(client.sync_subscriptions().await.unwrap(), SubscriptionReport::default());
    }

    #[tokio::test]
    async fn test_sync_subscriptions_removes_stale_folders() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(path("/reader/api/0/subscription/list"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SUBSCRIPTIONS))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let db = client.database();
        db.add_open_reader_folder(ROOT_FOLDER_ID, "Gone", "https://gone.example/", "feed/https://gone.example/")
            .await
            .unwrap();
        let report = client.sync_subscriptions().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(db.folder_by_name("Gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_folder_merges_and_applies_state() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(path_regex("^/reader/api/0/stream/contents/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"items":[
                    {"id":"item-1","title":"One","published":1736942400,
                     "categories":["user/-/state/com.google/reading-list","user/-/state/com.google/read"]},
                    {"id":"item-2","title":"Two","published":1736942500,
                     "categories":["user/-/state/com.google/starred"]}
                ]}"#,
            ))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let db = client.database();
        let folder = db
            .add_open_reader_folder(ROOT_FOLDER_ID, "Alpha", "https://a.example/rss", "feed/https://a.example/rss")
            .await
            .unwrap();

        let summary = client.refresh_folder(folder).await.unwrap();
        assert_eq!(summary.new, 2);

        let one = db.article_by_guid(folder, "item-1").await.unwrap().unwrap();
        let two = db.article_by_guid(folder, "item-2").await.unwrap().unwrap();
        assert!(one.read);
        assert!(!two.read);
        assert!(two.flagged);
        assert_eq!(db.folder(folder).await.unwrap().unwrap().unread_count, 1);
    }

    #[tokio::test]
    async fn test_refresh_folder_rejects_plain_feed() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        let id = client
            .database()
            .add_rss_folder(ROOT_FOLDER_ID, Some("F"), "https://f.example/", None)
            .await
            .unwrap();
        assert!(matches!(client.refresh_folder(id).await.unwrap_err(), SyncError::NotSynced(_)));
    }

    #[tokio::test]
    async fn test_token_refresher_stops_when_client_dropped() {
        let server = MockServer::start().await;
        let client = client(&server).await;
        let handle = client.spawn_token_refresher();
        drop(client);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("refresher should exit")
            .unwrap();
    }
}
