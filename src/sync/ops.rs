//! Writes pushed to the sync server.
//!
//! Read and starred changes are applied locally first and rolled back when
//! the server definitively refuses them. Folder operations change the local
//! tree only after the server accepted them.

use futures::future::join_all;
use std::future::Future;

use super::client::{SyncClient, LABEL_PREFIX, READ_TAG, STARRED_TAG};
use super::SyncError;
use crate::model::{Article, ArticleId, FolderId, FolderType, InsertPosition, ROOT_FOLDER_ID};

/// One change to mirror on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOp {
    MarkRead { articles: Vec<ArticleId>, read: bool },
    MarkStarred { articles: Vec<ArticleId>, starred: bool },
    /// Subscribe and create the local folder, optionally under a label.
    Subscribe { feed_url: String, label: Option<String> },
    Unsubscribe { folder_id: FolderId },
    Rename { folder_id: FolderId, name: String },
    /// Move a synced folder between labels. `None` means no label.
    SetFolderLabel {
        folder_id: FolderId,
        add: Option<String>,
        remove: Option<String>,
    },
}

impl SyncClient {
    /// Run each operation independently; one failure does not stop the rest.
    pub async fn push_all(&self, ops: Vec<SyncOp>) -> Vec<Result<(), SyncError>> {
        join_all(ops.into_iter().map(|op| async move { self.push(op).await })).await
    }

    pub async fn push(&self, op: SyncOp) -> Result<(), SyncError> {
        tracing::debug!(?op, "pushing sync operation");
        match op {
            SyncOp::MarkRead { articles, read } => self.push_article_state(&articles, StateChange::Read(read)).await,
            SyncOp::MarkStarred { articles, starred } => {
                self.push_article_state(&articles, StateChange::Starred(starred)).await
            }
            SyncOp::Subscribe { feed_url, label } => self.subscribe(&feed_url, label.as_deref()).await,
            SyncOp::Unsubscribe { folder_id } => {
                let stream = self.stream_id(folder_id).await?;
                let params = [("ac", "unsubscribe".to_string()), ("s", stream)];
                self.with_retries(|| self.post_edit("reader/api/0/subscription/edit", &params))
                    .await?;
                self.database().delete_folder(folder_id).await?;
                Ok(())
            }
            SyncOp::Rename { folder_id, name } => {
                let stream = self.stream_id(folder_id).await?;
                let params = [("ac", "edit".to_string()), ("s", stream), ("t", name.clone())];
                self.with_retries(|| self.post_edit("reader/api/0/subscription/edit", &params))
                    .await?;
                self.database().rename_folder(folder_id, &name).await?;
                Ok(())
            }
            SyncOp::SetFolderLabel { folder_id, add, remove } => {
                let stream = self.stream_id(folder_id).await?;
                let mut params = vec![("ac", "edit".to_string()), ("s", stream)];
                if let Some(label) = &add {
                    params.push(("a", format!("{LABEL_PREFIX}{label}")));
                }
                if let Some(label) = &remove {
                    params.push(("r", format!("{LABEL_PREFIX}{label}")));
                }
                self.with_retries(|| self.post_edit("reader/api/0/subscription/edit", &params))
                    .await?;
                let parent = self.label_folder(add.as_deref()).await?;
                self.database()
                    .set_parent(folder_id, parent, InsertPosition::Last)
                    .await?;
                Ok(())
            }
        }
    }

    async fn push_article_state(&self, ids: &[ArticleId], change: StateChange) -> Result<(), SyncError> {
        let db = self.database();
        let mut changed: Vec<Article> = Vec::new();
        for id in ids {
            if let Some(article) = db.article(*id).await? {
                if change.differs(&article) {
                    changed.push(article);
                }
            }
        }
        if changed.is_empty() {
            return Ok(());
        }
        let changed_ids: Vec<ArticleId> = changed.iter().map(|a| a.id).collect();
        change.apply_local(self, &changed_ids, false).await?;

        let synced = self.synced_guids(&changed).await?;
        if synced.is_empty() {
            return Ok(());
        }
        let (action, tag) = change.remote_edit();
        let mut params: Vec<(&str, String)> = synced.into_iter().map(|guid| ("i", guid)).collect();
        params.push((action, tag.to_string()));

        match self
            .with_retries(|| self.post_edit("reader/api/0/edit-tag", &params))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, count = changed_ids.len(), "server refused state change, rolling back");
                if let Err(rollback) = change.apply_local(self, &changed_ids, true).await {
                    tracing::error!(error = %rollback, "rollback of local state change failed");
                }
                Err(e)
            }
        }
    }

    /// Remote item ids of the articles that live in synced folders.
    async fn synced_guids(&self, articles: &[Article]) -> Result<Vec<String>, SyncError> {
        let snapshot = self.database().folder_snapshot().await?;
        Ok(articles
            .iter()
            .filter(|a| {
                snapshot
                    .get(a.folder_id)
                    .is_some_and(|f| f.folder_type == FolderType::OpenReader)
            })
            .map(|a| a.guid.clone())
            .collect())
    }

    async fn subscribe(&self, feed_url: &str, label: Option<&str>) -> Result<(), SyncError> {
        let stream = format!("feed/{feed_url}");
        let mut params = vec![("ac", "subscribe".to_string()), ("s", stream.clone())];
        if let Some(label) = label {
            params.push(("a", format!("{LABEL_PREFIX}{label}")));
        }
        self.with_retries(|| self.post_edit("reader/api/0/subscription/edit", &params))
            .await?;
        let parent = self.label_folder(label).await?;
        self.database()
            .add_open_reader_folder(parent, feed_url, feed_url, &stream)
            .await?;
        Ok(())
    }

    async fn label_folder(&self, label: Option<&str>) -> Result<FolderId, SyncError> {
        Ok(match label {
            Some(label) => {
                self.database()
                    .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, label, FolderType::Group, false)
                    .await?
            }
            None => ROOT_FOLDER_ID,
        })
    }

    async fn stream_id(&self, folder_id: FolderId) -> Result<String, SyncError> {
        self.database()
            .folder(folder_id)
            .await?
            .filter(|f| f.folder_type == FolderType::OpenReader)
            .and_then(|f| f.remote_id)
            .ok_or(SyncError::NotSynced(folder_id))
    }

    /// Retry transient failures with exponential backoff.
    async fn with_retries<F, Fut>(&self, mut attempt: F) -> Result<(), SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), SyncError>>,
    {
        let mut retry_count = 0;
        loop {
            match attempt().await {
                Err(e) if e.is_transient() && retry_count < self.inner.max_retries => {
                    let delay = self
                        .inner
                        .retry_base_delay
                        .saturating_mul(2u32.saturating_pow(retry_count));
                    tracing::warn!(retry = retry_count, delay_ms = delay.as_millis() as u64, error = %e, "sync request failed, retrying");
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                other => return other,
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StateChange {
    Read(bool),
    Starred(bool),
}

impl StateChange {
    fn differs(self, article: &Article) -> bool {
        match self {
            StateChange::Read(read) => article.read != read,
            StateChange::Starred(starred) => article.flagged != starred,
        }
    }

    fn remote_edit(self) -> (&'static str, &'static str) {
        match self {
            StateChange::Read(true) => ("a", READ_TAG),
            StateChange::Read(false) => ("r", READ_TAG),
            StateChange::Starred(true) => ("a", STARRED_TAG),
            StateChange::Starred(false) => ("r", STARRED_TAG),
        }
    }

    async fn apply_local(self, client: &SyncClient, ids: &[ArticleId], undo: bool) -> Result<(), SyncError> {
        let db = client.database();
        match self {
            StateChange::Read(read) => db.mark_read(ids, read != undo).await?,
            StateChange::Starred(starred) => db.mark_flagged(ids, starred != undo).await?,
        };
        Ok(())
    }
}
