//! Concurrent refresh pipeline.
//!
//! Every feed folder moves through `Queued → Fetching → Parsing → Merging →
//! Done`, or ends in `Error` / `NeedCredentials`. Jobs run as tokio tasks
//! behind a semaphore sized by `concurrent_downloads`; a folder already
//! queued or running is not queued again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Semaphore, SemaphorePermit};
use tokio::task::{AbortHandle, JoinHandle};

use super::activity::ActivityLog;
use super::favicon::FaviconFetcher;
use super::fetcher::{FetchError, FetchOutcome, FetchRequest, Fetcher};
use super::parser::{parse_feed, ParseError};
use crate::credentials::{CredentialError, CredentialStore, Credentials};
use crate::model::{ArticleStatus, Folder, FolderId, FolderType, ROOT_FOLDER_ID};
use crate::storage::{Database, DatabaseError, MergeSummary, RefreshCommit, StoreEvent};
use crate::sync::{SyncClient, SyncError};

/// Where a folder is in the refresh pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RefreshState {
    #[default]
    Idle,
    Queued,
    Fetching,
    Parsing,
    Merging,
    Done,
    Error,
    NeedCredentials,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("folder {0} is not a feed")]
    NotAFeed(FolderId),
}

/// Failure of a single folder's job.
#[derive(Debug, Error)]
enum JobError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("{0}")]
    Unavailable(String),
}

/// Key of a feed folder's password in the credential store.
pub fn feed_credential_key(folder_id: FolderId) -> String {
    format!("feed:{folder_id}")
}

/// Schedules and runs feed refreshes. Cheap to clone.
#[derive(Clone)]
pub struct RefreshManager {
    inner: Arc<Inner>,
}

struct Inner {
    db: Database,
    fetcher: Fetcher,
    credentials: Arc<dyn CredentialStore>,
    sync: OnceLock<SyncClient>,
    favicons: FaviconFetcher,
    activity: ActivityLog,
    permits: Semaphore,
    suspended: watch::Sender<bool>,
    /// Number of jobs queued or running.
    active: watch::Sender<usize>,
    jobs: Mutex<Jobs>,
    auth_queue: Mutex<VecDeque<FolderId>>,
    next_job: AtomicU64,
    new_articles: AtomicUsize,
    fetching: AtomicUsize,
    peak_fetching: AtomicUsize,
}

#[derive(Default)]
struct Jobs {
    running: HashMap<FolderId, (u64, AbortHandle)>,
    states: HashMap<FolderId, RefreshState>,
    batch_total: usize,
    batch_done: usize,
}

enum JobOutcome {
    Merged(MergeSummary),
    NotModified,
}

impl RefreshManager {
    pub fn new(
        db: Database,
        fetcher: Fetcher,
        credentials: Arc<dyn CredentialStore>,
        concurrent_downloads: usize,
    ) -> Self {
        let (suspended, _) = watch::channel(false);
        let (active, _) = watch::channel(0);
        let favicons = FaviconFetcher::new(db.clone(), fetcher.clone());
        let activity = ActivityLog::new(db.events().clone());
        Self {
            inner: Arc::new(Inner {
                db,
                fetcher,
                credentials,
                sync: OnceLock::new(),
                favicons,
                activity,
                permits: Semaphore::new(concurrent_downloads.max(1)),
                suspended,
                active,
                jobs: Mutex::new(Jobs::default()),
                auth_queue: Mutex::new(VecDeque::new()),
                next_job: AtomicU64::new(1),
                new_articles: AtomicUsize::new(0),
                fetching: AtomicUsize::new(0),
                peak_fetching: AtomicUsize::new(0),
            }),
        }
    }

    /// Route OpenReader folders through this client. Only the first call
    /// takes effect.
    pub fn attach_sync(&self, client: SyncClient) -> bool {
        self.inner.sync.set(client).is_ok()
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.inner.activity
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Queue every feed in or below `folders`. Unsubscribed feeds are
    /// skipped unless `ignore_subscription_status`. Returns how many jobs
    /// were queued.
    pub async fn refresh_subscriptions(
        &self,
        folders: &[FolderId],
        ignore_subscription_status: bool,
    ) -> Result<usize, RefreshError> {
        let feeds = self.collect_feeds(folders, ignore_subscription_status).await?;
        Ok(self.enqueue_all(&feeds, false))
    }

    /// Queue the feeds below `folders` regardless of subscription status,
    /// without conditional GET validators.
    pub async fn force_refresh_subscription_for_folders(
        &self,
        folders: &[FolderId],
    ) -> Result<usize, RefreshError> {
        let feeds = self.collect_feeds(folders, true).await?;
        Ok(self.enqueue_all(&feeds, true))
    }

    pub async fn refresh_all(&self) -> Result<usize, RefreshError> {
        self.refresh_subscriptions(&[ROOT_FOLDER_ID], false).await
    }

    async fn collect_feeds(
        &self,
        folders: &[FolderId],
        ignore_subscription_status: bool,
    ) -> Result<Vec<FolderId>, RefreshError> {
        if self.inner.db.is_read_only() {
            return Err(RefreshError::Database(DatabaseError::ReadOnly));
        }
        let snapshot = self.inner.db.folder_snapshot().await?;
        let mut seen = HashSet::new();
        let mut feeds = Vec::new();
        for &root in folders {
            for id in snapshot.subtree_ids(root) {
                let Some(folder) = snapshot.get(id) else { continue };
                if !folder.is_feed() || !seen.insert(id) {
                    continue;
                }
                if folder.flags.unsubscribed && !ignore_subscription_status {
                    tracing::debug!(folder_id = id, "skipping unsubscribed feed");
                    continue;
                }
                if folder.folder_type == FolderType::OpenReader && self.inner.sync.get().is_none() {
                    tracing::debug!(folder_id = id, "no sync account, skipping synced folder");
                    continue;
                }
                feeds.push(id);
            }
        }
        Ok(feeds)
    }

    fn enqueue_all(&self, feeds: &[FolderId], force: bool) -> usize {
        let queued = feeds
            .iter()
            .filter(|id| self.inner.enqueue(**id, force))
            .count();
        if queued > 0 {
            tracing::info!(queued, force, "refresh queued");
        }
        queued
    }

    /// Abort every queued and running job. Their folders return to `Idle`.
    pub fn cancel_all(&self) {
        let cancelled: Vec<FolderId> = {
            let mut jobs = self.inner.lock_jobs();
            let running = std::mem::take(&mut jobs.running);
            for (id, (_, handle)) in &running {
                handle.abort();
                jobs.states.insert(*id, RefreshState::Idle);
            }
            self.inner.active.send_replace(0);
            running.into_keys().collect()
        };
        for id in &cancelled {
            self.inner.db.set_session_flags(*id, |s| s.updating = false);
        }
        if !cancelled.is_empty() {
            tracing::info!(cancelled = cancelled.len(), "refresh cancelled");
        }
    }

    /// Hold queued jobs until [`resume`](Self::resume). Running jobs finish.
    pub fn suspend(&self) {
        if !self.inner.suspended.send_replace(true) {
            tracing::info!("refresh suspended");
        }
    }

    pub fn resume(&self) {
        if self.inner.suspended.send_replace(false) {
            tracing::info!("refresh resumed");
        }
    }

    pub fn is_suspended(&self) -> bool {
        *self.inner.suspended.borrow()
    }

    /// Repeat [`refresh_all`](Self::refresh_all) every `interval` until every
    /// manager handle is dropped.
    pub fn spawn_periodic(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let manager = RefreshManager { inner };
                if let Err(e) = manager.refresh_all().await {
                    tracing::warn!(error = %e, "scheduled refresh failed");
                }
            }
        })
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// True while any job is queued or running.
    pub fn is_connecting(&self) -> bool {
        *self.inner.active.borrow() > 0
    }

    /// New articles stored since the current (or last) batch began.
    pub fn count_of_new_articles(&self) -> usize {
        self.inner.new_articles.load(Ordering::Relaxed)
    }

    pub fn state(&self, folder_id: FolderId) -> RefreshState {
        self.inner
            .lock_jobs()
            .states
            .get(&folder_id)
            .copied()
            .unwrap_or_default()
    }

    /// Largest number of simultaneous fetches in the current batch.
    pub fn peak_concurrency(&self) -> usize {
        self.inner.peak_fetching.load(Ordering::Relaxed)
    }

    /// One-line summary for a status bar.
    pub fn status_message(&self) -> String {
        let jobs = self.inner.lock_jobs();
        if !jobs.running.is_empty() {
            let prefix = if self.is_suspended() {
                "Refresh suspended"
            } else {
                "Refreshing subscriptions"
            };
            return format!("{prefix} ({} of {})", jobs.batch_done, jobs.batch_total);
        }
        if jobs.batch_total == 0 {
            return String::new();
        }
        match self.count_of_new_articles() {
            0 => "No new articles".to_string(),
            1 => "1 new article".to_string(),
            n => format!("{n} new articles"),
        }
    }

    /// Resolves when no job is queued or running and pending icon fetches
    /// are done. Never resolves while suspended with jobs queued.
    pub async fn wait_until_idle(&self) {
        let mut active = self.inner.active.subscribe();
        let _ = active.wait_for(|n| *n == 0).await.map(|_| ());
        self.inner.favicons.wait_until_idle().await;
    }

    // ========================================================================
    // Credentials
    // ========================================================================

    /// Folders waiting for a username and password, oldest first.
    pub fn pending_credentials(&self) -> Vec<FolderId> {
        self.inner.lock_auth().iter().copied().collect()
    }

    /// Store credentials for a feed and queue it again.
    pub async fn supply_credentials(
        &self,
        folder_id: FolderId,
        credentials: Credentials,
    ) -> Result<(), RefreshError> {
        let db = &self.inner.db;
        db.folder(folder_id)
            .await?
            .filter(Folder::is_feed)
            .ok_or(RefreshError::NotAFeed(folder_id))?;
        db.set_folder_username(folder_id, Some(&credentials.username))
            .await?;
        self.inner
            .credentials
            .set(&feed_credential_key(folder_id), credentials)?;
        db.update_folder_flags(folder_id, |f| f.need_credentials = false)
            .await?;
        db.set_session_flags(folder_id, |s| s.credentials_surfaced = false);
        self.inner.lock_auth().retain(|id| *id != folder_id);
        tracing::info!(folder_id, "credentials supplied, refreshing again");
        self.inner.enqueue(folder_id, false);
        Ok(())
    }
}

impl Inner {
    fn lock_jobs(&self) -> MutexGuard<'_, Jobs> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_auth(&self) -> MutexGuard<'_, VecDeque<FolderId>> {
        self.auth_queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue one folder. Returns false when it is already queued or running.
    fn enqueue(self: &Arc<Self>, folder_id: FolderId, force: bool) -> bool {
        {
            let mut jobs = self.lock_jobs();
            if jobs.running.contains_key(&folder_id) {
                tracing::debug!(folder_id, "refresh already pending, coalesced");
                return false;
            }
            if jobs.running.is_empty() {
                jobs.batch_total = 0;
                jobs.batch_done = 0;
                self.new_articles.store(0, Ordering::Relaxed);
                self.peak_fetching.store(0, Ordering::Relaxed);
            }
            let job = self.next_job.fetch_add(1, Ordering::Relaxed);
            jobs.states.insert(folder_id, RefreshState::Queued);
            jobs.batch_total += 1;

            // The task cannot finish before its handle is registered: it
            // needs this lock to deregister.
            let inner = Arc::clone(self);
            let handle = tokio::spawn(async move {
                inner.run_job(folder_id, job, force).await;
                inner.finish(folder_id, job);
            });
            jobs.running.insert(folder_id, (job, handle.abort_handle()));
            self.active.send_replace(jobs.running.len());
        }
        self.db.set_session_flags(folder_id, |s| s.updating = true);
        true
    }

    fn finish(&self, folder_id: FolderId, job: u64) {
        let removed = {
            let mut jobs = self.lock_jobs();
            let current = jobs
                .running
                .get(&folder_id)
                .is_some_and(|(running, _)| *running == job);
            if current {
                jobs.running.remove(&folder_id);
                jobs.batch_done += 1;
                self.active.send_replace(jobs.running.len());
            }
            current
        };
        if removed {
            self.db.set_session_flags(folder_id, |s| s.updating = false);
        }
    }

    /// Record a transition, unless the job was cancelled meanwhile.
    fn set_state(&self, folder_id: FolderId, job: u64, state: RefreshState) -> bool {
        let mut jobs = self.lock_jobs();
        let current = jobs
            .running
            .get(&folder_id)
            .is_some_and(|(running, _)| *running == job);
        if current {
            jobs.states.insert(folder_id, state);
            tracing::trace!(folder_id, ?state, "refresh state");
        }
        current
    }

    /// Wait while suspended, then take a download slot.
    async fn acquire_slot(&self) -> Option<SemaphorePermit<'_>> {
        let mut suspended = self.suspended.subscribe();
        loop {
            if suspended.wait_for(|s| !*s).await.map(|_| ()).is_err() {
                return None;
            }
            let permit = self.permits.acquire().await.ok()?;
            if !*self.suspended.borrow() {
                return Some(permit);
            }
        }
    }

    async fn run_job(&self, folder_id: FolderId, job: u64, force: bool) {
        let Some(_permit) = self.acquire_slot().await else {
            return;
        };
        let _fetching = FetchingGuard::enter(self);

        let folder = match self.db.folder(folder_id).await {
            Ok(Some(folder)) => folder,
            Ok(None) => {
                tracing::debug!(folder_id, "folder deleted before refresh");
                self.set_state(folder_id, job, RefreshState::Idle);
                return;
            }
            Err(e) => {
                tracing::warn!(folder_id, error = %e, "cannot load folder for refresh");
                self.set_state(folder_id, job, RefreshState::Error);
                return;
            }
        };

        let result = match folder.folder_type {
            FolderType::OpenReader => self.refresh_synced(&folder, job).await,
            _ => self.refresh_feed(&folder, job, force).await,
        };

        match result {
            Ok(outcome) => self.job_succeeded(&folder, job, outcome).await,
            Err(JobError::Fetch(FetchError::AuthRequired(status))) => {
                tracing::info!(folder_id, status, "feed requires credentials");
                self.park_for_credentials(&folder, job).await;
            }
            Err(e) => {
                tracing::warn!(folder_id, name = %folder.name, error = %e, "refresh failed");
                if self.set_state(folder_id, job, RefreshState::Error) {
                    if let Err(db_err) = self.db.set_folder_error(folder_id, true).await {
                        tracing::warn!(folder_id, error = %db_err, "failed to flag folder error");
                    }
                    self.activity.record(folder_id, &folder.name, format!("Error: {e}"));
                }
            }
        }
    }

    async fn refresh_feed(&self, folder: &Folder, job: u64, force: bool) -> Result<JobOutcome, JobError> {
        let url = folder
            .feed_url
            .clone()
            .ok_or_else(|| JobError::Unavailable(format!("folder {} has no feed URL", folder.id)))?;
        let credentials = self.credentials.get(&feed_credential_key(folder.id))?;

        self.set_state(folder.id, job, RefreshState::Fetching);
        self.activity
            .record(folder.id, &folder.name, format!("Connecting to {url}"));
        let request = FetchRequest {
            url: &url,
            etag: folder.etag.as_deref().filter(|_| !force),
            last_modified: folder.last_modified.as_deref().filter(|_| !force),
            credentials: credentials.as_ref(),
        };

        match self.fetcher.fetch(&request).await? {
            FetchOutcome::NotModified { permanent_url } => {
                self.set_state(folder.id, job, RefreshState::Merging);
                let commit = RefreshCommit {
                    etag: folder.etag.clone(),
                    last_modified: folder.last_modified.clone(),
                    permanent_url,
                    ..RefreshCommit::default()
                };
                self.db.commit_refresh(folder.id, &[], &commit).await?;
                Ok(JobOutcome::NotModified)
            }
            FetchOutcome::Modified(fetched) => {
                self.set_state(folder.id, job, RefreshState::Parsing);
                let parsed = parse_feed(&fetched.body, Some(&fetched.final_url))?;

                self.set_state(folder.id, job, RefreshState::Merging);
                let commit = RefreshCommit {
                    etag: fetched.etag,
                    last_modified: fetched.last_modified,
                    permanent_url: fetched.permanent_url,
                    feed_title: parsed.title,
                    home_page: parsed.home_page,
                    description: parsed.description,
                };
                let summary = self
                    .db
                    .commit_refresh(folder.id, &parsed.articles, &commit)
                    .await?;
                Ok(JobOutcome::Merged(summary))
            }
        }
    }

    async fn refresh_synced(&self, folder: &Folder, job: u64) -> Result<JobOutcome, JobError> {
        let client = self
            .sync
            .get()
            .ok_or_else(|| JobError::Unavailable("no sync account configured".into()))?;
        self.set_state(folder.id, job, RefreshState::Fetching);
        self.activity
            .record(folder.id, &folder.name, "Retrieving articles from the sync server");
        let summary = client.refresh_folder(folder.id).await?;
        Ok(JobOutcome::Merged(summary))
    }

    async fn job_succeeded(&self, folder: &Folder, job: u64, outcome: JobOutcome) {
        if !self.set_state(folder.id, job, RefreshState::Done) {
            return;
        }
        let message = match &outcome {
            JobOutcome::NotModified => "No new articles (not modified)".to_string(),
            JobOutcome::Merged(summary) => {
                self.new_articles.fetch_add(summary.new, Ordering::Relaxed);
                match summary.new {
                    0 => "No new articles".to_string(),
                    1 => "1 new article".to_string(),
                    n => format!("{n} new articles"),
                }
            }
        };
        match self.db.consume_article_status(folder.id).await {
            Ok(changed) if !changed.is_empty() => {
                let updated = changed
                    .iter()
                    .filter(|a| a.status == ArticleStatus::Updated)
                    .count();
                tracing::debug!(
                    folder_id = folder.id,
                    new = changed.len() - updated,
                    updated,
                    "article status consumed"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(folder_id = folder.id, error = %e, "failed to reset article status"),
        }
        tracing::info!(folder_id = folder.id, name = %folder.name, status = %message, "refresh done");
        self.activity.record(folder.id, &folder.name, message);

        if folder.folder_type == FolderType::Rss && folder.flags.check_for_image {
            let refreshed = self.db.folder(folder.id).await.ok().flatten();
            let page = refreshed
                .as_ref()
                .and_then(|f| f.home_page.as_deref().or(f.feed_url.as_deref()));
            if let Some(page) = page {
                self.favicons.schedule(folder.id, page);
            }
        }
    }

    async fn park_for_credentials(&self, folder: &Folder, job: u64) {
        if !self.set_state(folder.id, job, RefreshState::NeedCredentials) {
            return;
        }
        if let Err(e) = self
            .db
            .update_folder_flags(folder.id, |f| f.need_credentials = true)
            .await
        {
            tracing::warn!(folder_id = folder.id, error = %e, "failed to flag missing credentials");
        }
        {
            let mut queue = self.lock_auth();
            if !queue.contains(&folder.id) {
                queue.push_back(folder.id);
            }
        }
        self.activity
            .record(folder.id, &folder.name, "Authentication required");
        if !self.db.session_flags(folder.id).credentials_surfaced {
            self.db
                .set_session_flags(folder.id, |s| s.credentials_surfaced = true);
            self.db.events().emit(StoreEvent::CredentialsRequired(folder.id));
        }
    }
}

/// Counts a running fetch; released on completion or abort.
struct FetchingGuard<'a> {
    inner: &'a Inner,
}

impl<'a> FetchingGuard<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let now = inner.fetching.fetch_add(1, Ordering::Relaxed) + 1;
        inner.peak_fetching.fetch_max(now, Ordering::Relaxed);
        Self { inner }
    }
}

impl Drop for FetchingGuard<'_> {
    fn drop(&mut self) {
        self.inner.fetching.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::feed::FetchSettings;
    use crate::model::{InsertPosition, ROOT_FOLDER_ID};
    use crate::storage::ArticleFilter;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rss(items: &[(&str, &str)]) -> String {
        let items: String = items
            .iter()
            .map(|(guid, title)| {
                format!(
                    "<item><guid>{guid}</guid><title>{title}</title>\
                     <pubDate>Wed, 15 Jan 2025 12:00:00 GMT</pubDate></item>"
                )
            })
            .collect();
        format!(
            r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Test Feed</title>
<link>https://example.com/</link>{items}</channel></rss>"#
        )
    }

    async fn setup(concurrent: usize) -> (Database, RefreshManager, Arc<MemoryCredentialStore>) {
        let db = Database::open(":memory:").await.unwrap();
        let fetcher = Fetcher::new(FetchSettings {
            retry_base_delay: Duration::from_millis(5),
            max_retries: 1,
            ..FetchSettings::default()
        })
        .unwrap();
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = RefreshManager::new(db.clone(), fetcher, store.clone(), concurrent);
        (db, manager, store)
    }

    async fn add_feed(db: &Database, url: &str) -> FolderId {
        let id = db.add_rss_folder(ROOT_FOLDER_ID, None, url, None).await.unwrap();
        db.update_folder_flags(id, |f| f.check_for_image = false).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_new_then_updated_articles() {
        let server = MockServer::start().await;
        Mock::given(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[("g1", "First"), ("g2", "Second")])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[("g1", "First, revised"), ("g2", "Second")])))
            .mount(&server)
            .await;

        let (db, manager, _) = setup(4).await;
        let folder = add_feed(&db, &format!("{}/feed", server.uri())).await;

        assert_eq!(manager.refresh_subscriptions(&[folder], false).await.unwrap(), 1);
        manager.wait_until_idle().await;
        assert_eq!(manager.state(folder), RefreshState::Done);
        assert_eq!(manager.count_of_new_articles(), 2);
        let stored = db.folder(folder).await.unwrap().unwrap();
        assert_eq!(stored.unread_count, 2);
        assert_eq!(stored.name, "Test Feed");
        assert_eq!(stored.home_page.as_deref(), Some("https://example.com/"));
        let g1 = db.article_by_guid(folder, "g1").await.unwrap().unwrap();
        assert_eq!(g1.status, ArticleStatus::Empty, "status is reset once the refresh consumed it");

        manager.refresh_subscriptions(&[folder], false).await.unwrap();
        manager.wait_until_idle().await;
        assert_eq!(manager.count_of_new_articles(), 0);
        let g1 = db.article_by_guid(folder, "g1").await.unwrap().unwrap();
        assert_eq!(g1.title, "First, revised");
        assert!(g1.revised);
        assert_eq!(g1.status, ArticleStatus::Empty);
        let g2 = db.article_by_guid(folder, "g2").await.unwrap().unwrap();
        assert_eq!(g2.status, ArticleStatus::Empty);
        assert_eq!(manager.status_message(), "No new articles");
    }

    #[tokio::test]
    async fn test_conditional_get_and_force() {
        let server = MockServer::start().await;
        Mock::given(path("/feed"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(rss(&[("g1", "First")]))
                    .insert_header("ETag", "\"v1\""),
            )
            .expect(2)
            .mount(&server)
            .await;

        let (db, manager, _) = setup(2).await;
        let folder = add_feed(&db, &format!("{}/feed", server.uri())).await;

        manager.refresh_all().await.unwrap();
        manager.wait_until_idle().await;
        assert_eq!(db.folder(folder).await.unwrap().unwrap().etag.as_deref(), Some("\"v1\""));

        manager.refresh_all().await.unwrap();
        manager.wait_until_idle().await;
        assert_eq!(manager.state(folder), RefreshState::Done);
        assert_eq!(manager.count_of_new_articles(), 0);
        assert_eq!(db.folder(folder).await.unwrap().unwrap().etag.as_deref(), Some("\"v1\""));

        manager.force_refresh_subscription_for_folders(&[folder]).await.unwrap();
        manager.wait_until_idle().await;
        assert_eq!(manager.state(folder), RefreshState::Done);
    }

    #[tokio::test]
    async fn test_permanent_redirect_updates_feed_url() {
        let server = MockServer::start().await;
        Mock::given(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
            .mount(&server)
            .await;
        Mock::given(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[("g1", "First")])))
            .mount(&server)
            .await;

        let (db, manager, _) = setup(2).await;
        let folder = add_feed(&db, &format!("{}/old", server.uri())).await;
        manager.refresh_all().await.unwrap();
        manager.wait_until_idle().await;

        let stored = db.folder(folder).await.unwrap().unwrap();
        assert_eq!(stored.feed_url, Some(format!("{}/new", server.uri())));
    }

    #[tokio::test]
    async fn test_parse_failure_marks_error() {
        let server = MockServer::start().await;
        Mock::given(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>not a feed</body></html>"))
            .mount(&server)
            .await;

        let (db, manager, _) = setup(2).await;
        let folder = add_feed(&db, &format!("{}/feed", server.uri())).await;
        manager.refresh_all().await.unwrap();
        manager.wait_until_idle().await;

        assert_eq!(manager.state(folder), RefreshState::Error);
        assert!(db.folder(folder).await.unwrap().unwrap().flags.error);
        assert!(db.articles(folder, &ArticleFilter::default()).await.unwrap().is_empty());
        let entry = manager.activity().entry(folder).unwrap();
        assert!(entry.status.starts_with("Error"));
    }

    #[tokio::test]
    async fn test_credentials_cycle() {
        let server = MockServer::start().await;
        Mock::given(path("/private"))
            .and(header("Authorization", "Basic YW5uOnB3"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[("g1", "Secret")])))
            .mount(&server)
            .await;
        Mock::given(path("/private"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (db, manager, store) = setup(2).await;
        let mut events = db.subscribe();
        let folder = add_feed(&db, &format!("{}/private", server.uri())).await;

        for _ in 0..2 {
            manager.refresh_all().await.unwrap();
            manager.wait_until_idle().await;
            assert_eq!(manager.state(folder), RefreshState::NeedCredentials);
        }
        assert!(db.folder(folder).await.unwrap().unwrap().flags.need_credentials);
        assert_eq!(manager.pending_credentials(), vec![folder]);

        let mut prompts = 0;
        while let Ok(event) = events.try_recv() {
            if event == StoreEvent::CredentialsRequired(folder) {
                prompts += 1;
            }
        }
        assert_eq!(prompts, 1, "asked once per session");

        manager
            .supply_credentials(folder, Credentials::new("ann", "wrong"))
            .await
            .unwrap();
        manager.wait_until_idle().await;
        assert_eq!(manager.state(folder), RefreshState::NeedCredentials);
        assert_eq!(manager.pending_credentials(), vec![folder]);
        let mut prompts = 0;
        while let Ok(event) = events.try_recv() {
            if event == StoreEvent::CredentialsRequired(folder) {
                prompts += 1;
            }
        }
        assert_eq!(prompts, 1, "rejected new credentials prompt again");

        manager
            .supply_credentials(folder, Credentials::new("ann", "pw"))
            .await
            .unwrap();
        manager.wait_until_idle().await;
        assert_eq!(manager.state(folder), RefreshState::Done);
        assert!(manager.pending_credentials().is_empty());
        assert!(store.get(&feed_credential_key(folder)).unwrap().is_some());
        let stored = db.folder(folder).await.unwrap().unwrap();
        assert!(!stored.flags.need_credentials);
        assert_eq!(stored.username.as_deref(), Some("ann"));
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(rss(&[("g1", "First")]))
                    .set_delay(Duration::from_millis(50)),
            )
            .mount(&server)
            .await;

        let (db, manager, _) = setup(2).await;
        let mut folders = Vec::new();
        for i in 0..6 {
            folders.push(add_feed(&db, &format!("{}/feed{i}", server.uri())).await);
        }
        assert_eq!(manager.refresh_all().await.unwrap(), 6);
        assert!(manager.is_connecting());
        manager.wait_until_idle().await;

        assert!(!manager.is_connecting());
        assert!(manager.peak_concurrency() <= 2);
        assert!(manager.peak_concurrency() >= 1);
        for id in folders {
            assert_eq!(manager.state(id), RefreshState::Done);
        }
        assert_eq!(manager.count_of_new_articles(), 6);
        assert_eq!(manager.status_message(), "6 new articles");
    }

    #[tokio::test]
    async fn test_cancel_all_leaves_folders_idle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(rss(&[("g1", "First")]))
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let (db, manager, _) = setup(1).await;
        let a = add_feed(&db, &format!("{}/a", server.uri())).await;
        let b = add_feed(&db, &format!("{}/b", server.uri())).await;
        manager.refresh_all().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        manager.cancel_all();
        assert!(!manager.is_connecting());
        tokio::time::timeout(Duration::from_secs(1), manager.wait_until_idle())
            .await
            .unwrap();
        for id in [a, b] {
            assert_eq!(manager.state(id), RefreshState::Idle);
            assert!(!db.session_flags(id).updating);
        }
        assert!(db.articles(a, &ArticleFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_suspend_holds_queue() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[("g1", "First")])))
            .mount(&server)
            .await;

        let (db, manager, _) = setup(2).await;
        let folder = add_feed(&db, &format!("{}/feed", server.uri())).await;
        manager.suspend();
        manager.refresh_all().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state(folder), RefreshState::Queued);
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
        assert!(manager.status_message().starts_with("Refresh suspended"));

        manager.resume();
        manager.wait_until_idle().await;
        assert_eq!(manager.state(folder), RefreshState::Done);
    }

    #[tokio::test]
    async fn test_pending_folder_is_coalesced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[("g1", "First")])))
            .expect(1)
            .mount(&server)
            .await;

        let (db, manager, _) = setup(2).await;
        let folder = add_feed(&db, &format!("{}/feed", server.uri())).await;
        manager.suspend();
        assert_eq!(manager.refresh_subscriptions(&[folder], false).await.unwrap(), 1);
        assert_eq!(manager.refresh_subscriptions(&[folder], false).await.unwrap(), 0);
        manager.resume();
        manager.wait_until_idle().await;
    }

    #[tokio::test]
    async fn test_unsubscribed_feeds_skipped_unless_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[("g1", "First")])))
            .mount(&server)
            .await;

        let (db, manager, _) = setup(2).await;
        let group = db
            .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "Group", FolderType::Group, false)
            .await
            .unwrap();
        let folder = db
            .add_rss_folder(group, Some("F"), &format!("{}/feed", server.uri()), None)
            .await
            .unwrap();
        db.update_folder_flags(folder, |f| {
            f.unsubscribed = true;
            f.check_for_image = false;
        })
        .await
        .unwrap();

        assert_eq!(manager.refresh_subscriptions(&[group], false).await.unwrap(), 0);
        assert_eq!(manager.refresh_subscriptions(&[group], true).await.unwrap(), 1);
        manager.wait_until_idle().await;
        assert_eq!(manager.state(folder), RefreshState::Done);
    }

    #[tokio::test]
    async fn test_favicon_fetched_after_refresh() {
        let server = MockServer::start().await;
        let body = rss(&[("g1", "First")]).replace("https://example.com/", &format!("{}/", server.uri()));
        Mock::given(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
        Mock::given(path("/favicon.ico"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![1u8, 2, 3])
                    .insert_header("Content-Type", "image/png"),
            )
            .mount(&server)
            .await;

        let (db, manager, _) = setup(2).await;
        let folder = db
            .add_rss_folder(ROOT_FOLDER_ID, Some("F"), &format!("{}/feed", server.uri()), None)
            .await
            .unwrap();
        assert!(db.folder(folder).await.unwrap().unwrap().flags.check_for_image);

        manager.refresh_all().await.unwrap();
        manager.wait_until_idle().await;
        let (image, _) = db.folder_image(folder).await.unwrap().unwrap();
        assert_eq!(image, vec![1u8, 2, 3]);
        assert!(!db.folder(folder).await.unwrap().unwrap().flags.check_for_image);
    }

    #[tokio::test]
    async fn test_read_only_store_rejects_refresh() {
        let path = std::env::temp_dir().join(format!("feedkeep-refresh-ro-{}.db", std::process::id()));
        let path = path.to_string_lossy().to_string();
        let _ = std::fs::remove_file(&path);

        let db = Database::open(&path).await.unwrap();
        let folder = add_feed(&db, "https://example.com/feed").await;
        db.close().await;

        let ro = Database::open_read_only(&path).await.unwrap();
        let fetcher = Fetcher::new(FetchSettings::default()).unwrap();
        let manager = RefreshManager::new(ro.clone(), fetcher, Arc::new(MemoryCredentialStore::new()), 2);
        assert!(matches!(
            manager.refresh_subscriptions(&[folder], false).await,
            Err(RefreshError::Database(DatabaseError::ReadOnly))
        ));
        assert!(matches!(
            manager.force_refresh_subscription_for_folders(&[folder]).await,
            Err(RefreshError::Database(DatabaseError::ReadOnly))
        ));
        assert!(!manager.is_connecting());
        assert_eq!(manager.state(folder), RefreshState::Idle);
        ro.close().await;

        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{path}{suffix}"));
        }
    }
}
