use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::events::StoreEvent;
use super::folders::{adjust_unread, load_folder, unique_sibling_name};
use super::schema::Database;
use super::types::{
    ArticleFilter, ArticleRow, CreateOutcome, DatabaseError, MergeSummary, RefreshCommit,
    ARTICLE_COLUMNS,
};
use crate::model::{Article, ArticleId, ArticleStatus, FolderId, FolderType, ParsedArticle};
use crate::util::escape_like;

/// Maximum number of articles returned by any single list query.
const MAX_ARTICLES: i64 = 5000;

/// SQLite's default bound-parameter limit is 999; id lists are chunked below it.
const ID_CHUNK: usize = 500;

const SECONDS_PER_DAY: i64 = 86_400;

/// Per-article state column toggled by the `mark_*` family.
#[derive(Debug, Clone, Copy)]
enum StateColumn {
    Read,
    Flagged,
    Deleted,
}

impl StateColumn {
    fn name(self) -> &'static str {
        match self {
            StateColumn::Read => "read",
            StateColumn::Flagged => "flagged",
            StateColumn::Deleted => "deleted",
        }
    }

    /// Unread delta for one article whose column flips to `value`.
    fn unread_delta(self, value: bool, read: bool, deleted: bool) -> i64 {
        let sign = if value { -1 } else { 1 };
        match self {
            StateColumn::Read if !deleted => sign,
            StateColumn::Deleted if !read => sign,
            _ => 0,
        }
    }
}

impl Database {
    // ========================================================================
    // Merge
    // ========================================================================

    /// Reconcile a single parsed article with the folder's stored articles.
    pub async fn create_article(
        &self,
        folder_id: FolderId,
        parsed: &ParsedArticle,
    ) -> Result<CreateOutcome, DatabaseError> {
        let summary = self.merge_articles(folder_id, std::slice::from_ref(parsed)).await?;
        Ok(if summary.new > 0 {
            CreateOutcome::New
        } else if summary.updated > 0 {
            CreateOutcome::Updated
        } else if summary.suppressed > 0 {
            CreateOutcome::Suppressed
        } else {
            CreateOutcome::Unchanged
        })
    }

    /// Merge a batch of parsed articles into a feed folder in one transaction.
    ///
    /// New GUIDs are inserted unread and recorded in the folder's GUID
    /// history. Known articles whose content changed are rewritten and
    /// flagged revised with their read state kept. GUIDs in the history whose
    /// article has since been purged are suppressed.
    pub async fn merge_articles(
        &self,
        folder_id: FolderId,
        articles: &[ParsedArticle],
    ) -> Result<MergeSummary, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut w = self.begin_write().await?;
        let folder = load_folder(w.conn(), folder_id).await?;
        if !folder.is_feed() {
            return Err(DatabaseError::Invalid(format!(
                "articles can only be stored in feed folders, not {:?}",
                folder.folder_type
            )));
        }
        let (summary, changed) = merge_into(w.conn(), folder_id, articles, now).await?;
        w.commit().await?;

        tracing::debug!(
            folder_id,
            new = summary.new,
            updated = summary.updated,
            suppressed = summary.suppressed,
            "merged articles"
        );
        self.cache.invalidate();
        if changed {
            self.events.emit(StoreEvent::ArticlesChanged(folder_id));
        }
        Ok(summary)
    }

    /// Store the result of a successful fetch: merge the articles and update
    /// the folder's refresh metadata in one transaction.
    ///
    /// Clears the error and credential flags, records the refresh time and
    /// the conditional GET validators, applies a permanent redirect and
    /// replaces a placeholder name with the channel title.
    pub async fn commit_refresh(
        &self,
        folder_id: FolderId,
        articles: &[ParsedArticle],
        commit: &RefreshCommit,
    ) -> Result<MergeSummary, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut w = self.begin_write().await?;
        let folder = load_folder(w.conn(), folder_id).await?;
        if !folder.is_feed() {
            return Err(DatabaseError::Invalid(format!("folder {folder_id} is not a feed")));
        }

        let (summary, changed) = merge_into(w.conn(), folder_id, articles, now).await?;

        let mut flags = folder.flags;
        flags.error = false;
        flags.need_credentials = false;
        sqlx::query(
            "UPDATE folders SET flags = ?, last_update = ?, etag = ?, last_modified = ?,
                 home_page = COALESCE(?, home_page), description = COALESCE(?, description)
             WHERE id = ?",
        )
        .bind(flags.to_bits())
        .bind(now)
        .bind(&commit.etag)
        .bind(&commit.last_modified)
        .bind(&commit.home_page)
        .bind(&commit.description)
        .bind(folder_id)
        .execute(&mut *w.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if let Some(url) = &commit.permanent_url {
            if folder.feed_url.as_deref() != Some(url.as_str()) {
                let taken: Option<(i64,)> =
                    sqlx::query_as("SELECT id FROM folders WHERE feed_url = ? AND id != ?")
                        .bind(url)
                        .bind(folder_id)
                        .fetch_optional(&mut *w.tx)
                        .await
                        .map_err(DatabaseError::from_sqlx)?;
                if taken.is_none() {
                    sqlx::query("UPDATE folders SET feed_url = ? WHERE id = ?")
                        .bind(url)
                        .bind(folder_id)
                        .execute(&mut *w.tx)
                        .await
                        .map_err(DatabaseError::from_sqlx)?;
                    tracing::info!(folder_id, url = %url, "feed moved permanently");
                } else {
                    tracing::warn!(folder_id, url = %url, "redirect target already subscribed, keeping old URL");
                }
            }
        }

        let is_placeholder = folder.feed_url.as_deref() == Some(folder.name.as_str());
        if let (true, Some(title)) = (is_placeholder, commit.feed_title.as_deref()) {
            if let Some(name) = unique_sibling_name(w.conn(), &folder, title).await? {
                sqlx::query("UPDATE folders SET name = ? WHERE id = ?")
                    .bind(&name)
                    .bind(folder_id)
                    .execute(&mut *w.tx)
                    .await
                    .map_err(DatabaseError::from_sqlx)?;
            }
        }

        w.commit().await?;

        self.cache.invalidate();
        self.events.emit(StoreEvent::FolderUpdated(folder_id));
        if changed {
            self.events.emit(StoreEvent::ArticlesChanged(folder_id));
        }
        Ok(summary)
    }

    /// Return the articles whose merge status is still set and reset it.
    pub async fn consume_article_status(
        &self,
        folder_id: FolderId,
    ) -> Result<Vec<Article>, DatabaseError> {
        let mut w = self.begin_write().await?;
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE folder_id = ? AND status != 0 ORDER BY id"
        );
        let rows: Vec<ArticleRow> = sqlx::query_as(&sql)
            .bind(folder_id)
            .fetch_all(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query("UPDATE articles SET status = 0 WHERE folder_id = ? AND status != 0")
            .bind(folder_id)
            .execute(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        w.commit().await?;
        self.cache.invalidate_articles();
        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }

    // ========================================================================
    // Article Queries
    // ========================================================================

    pub async fn article(&self, id: ArticleId) -> Result<Option<Article>, DatabaseError> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?");
        let mut r = self.reader().await?;
        let row: Option<ArticleRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(r.conn())
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(row.map(ArticleRow::into_article))
    }

    pub async fn article_by_guid(
        &self,
        folder_id: FolderId,
        guid: &str,
    ) -> Result<Option<Article>, DatabaseError> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE folder_id = ? AND guid = ?");
        let mut r = self.reader().await?;
        let row: Option<ArticleRow> = sqlx::query_as(&sql)
            .bind(folder_id)
            .bind(guid)
            .fetch_optional(r.conn())
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(row.map(ArticleRow::into_article))
    }

    /// Articles shown for a folder, newest first.
    ///
    /// Feed folders list their own non-deleted articles, groups and the root
    /// everything below them, the trash every deleted article and smart
    /// folders whatever their criteria select.
    pub async fn articles(
        &self,
        folder_id: FolderId,
        filter: &ArticleFilter,
    ) -> Result<Vec<Article>, DatabaseError> {
        let cacheable = filter.is_default();
        if cacheable {
            if let Some(cached) = self.cache.cached_articles(folder_id) {
                return Ok(cached.as_ref().clone());
            }
        }

        let epoch = self.cache.article_epoch();
        let snapshot = self.folder_snapshot().await?;
        let folder = snapshot
            .get(folder_id)
            .ok_or_else(|| DatabaseError::folder_not_found(folder_id))?;

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE "));
        match folder.folder_type {
            FolderType::Rss | FolderType::OpenReader => {
                builder.push("deleted = 0 AND folder_id = ");
                builder.push_bind(folder_id);
            }
            FolderType::Root | FolderType::Group => {
                let feeds: Vec<FolderId> = snapshot
                    .subtree_ids(folder_id)
                    .into_iter()
                    .filter(|id| snapshot.get(*id).is_some_and(|f| f.is_feed()))
                    .collect();
                if feeds.is_empty() {
                    return Ok(Vec::new());
                }
                builder.push("deleted = 0 AND folder_id IN (");
                let mut separated = builder.separated(", ");
                for id in feeds {
                    separated.push_bind(id);
                }
                separated.push_unseparated(")");
            }
            FolderType::Trash => {
                builder.push("deleted = 1");
            }
            FolderType::Smart | FolderType::Search => {
                let Some(predicate) = self.smart_predicate(folder_id).await? else {
                    return Ok(Vec::new());
                };
                builder.push("(");
                predicate.push_to(&mut builder);
                builder.push(")");
            }
        }

        if filter.unread_only {
            builder.push(" AND read = 0");
        }
        if filter.flagged_only {
            builder.push(" AND flagged = 1");
        }
        if let Some(text) = filter.text.as_deref().filter(|t| !t.is_empty()) {
            let pattern = format!("%{}%", escape_like(text));
            builder.push(" AND (title LIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" ESCAPE '\\' OR body LIKE ");
            builder.push_bind(pattern);
            builder.push(" ESCAPE '\\')");
        }
        let limit = filter.limit.unwrap_or(MAX_ARTICLES).clamp(0, MAX_ARTICLES);
        builder.push(" ORDER BY date DESC, id DESC LIMIT ");
        builder.push_bind(limit);

        let mut r = self.reader().await?;
        let rows: Vec<ArticleRow> = builder
            .build_query_as()
            .fetch_all(r.conn())
            .await
            .map_err(DatabaseError::from_sqlx)?;
        drop(r);
        let articles: Vec<Article> = rows.into_iter().map(ArticleRow::into_article).collect();

        if cacheable {
            self.cache
                .store_articles_if(epoch, folder_id, Arc::new(articles.clone()));
        }
        Ok(articles)
    }

    /// Number of unread articles a folder shows, including smart folders.
    pub async fn unread_count(&self, folder_id: FolderId) -> Result<i64, DatabaseError> {
        let folder = self
            .folder(folder_id)
            .await?
            .ok_or_else(|| DatabaseError::folder_not_found(folder_id))?;
        if folder.folder_type.is_query() || folder.folder_type == FolderType::Trash {
            let filter = ArticleFilter {
                unread_only: true,
                ..Default::default()
            };
            return Ok(self.articles(folder_id, &filter).await?.len() as i64);
        }
        Ok(folder.total_unread())
    }

    // ========================================================================
    // Article Mutations
    // ========================================================================

    /// Set the read state. Returns the number of articles that changed.
    pub async fn mark_read(&self, ids: &[ArticleId], read: bool) -> Result<usize, DatabaseError> {
        self.set_state(ids, StateColumn::Read, read).await
    }

    pub async fn mark_flagged(
        &self,
        ids: &[ArticleId],
        flagged: bool,
    ) -> Result<usize, DatabaseError> {
        self.set_state(ids, StateColumn::Flagged, flagged).await
    }

    pub async fn mark_deleted(
        &self,
        ids: &[ArticleId],
        deleted: bool,
    ) -> Result<usize, DatabaseError> {
        self.set_state(ids, StateColumn::Deleted, deleted).await
    }

    /// Move articles to the trash.
    pub async fn delete_articles(&self, ids: &[ArticleId]) -> Result<usize, DatabaseError> {
        self.mark_deleted(ids, true).await
    }

    /// Restore articles from the trash.
    pub async fn undelete_articles(&self, ids: &[ArticleId]) -> Result<usize, DatabaseError> {
        self.mark_deleted(ids, false).await
    }

    async fn set_state(
        &self,
        ids: &[ArticleId],
        column: StateColumn,
        value: bool,
    ) -> Result<usize, DatabaseError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut w = self.begin_write().await?;
        let mut deltas: BTreeMap<FolderId, i64> = BTreeMap::new();
        let mut changed = 0usize;

        for chunk in ids.chunks(ID_CHUNK) {
            let mut select: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "SELECT id, folder_id, read, deleted FROM articles WHERE {} != ",
                column.name()
            ));
            select.push_bind(value);
            select.push(" AND id IN (");
            let mut separated = select.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            let rows: Vec<(ArticleId, FolderId, bool, bool)> = select
                .build_query_as()
                .fetch_all(&mut *w.tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            if rows.is_empty() {
                continue;
            }

            let mut update: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("UPDATE articles SET {} = ", column.name()));
            update.push_bind(value);
            update.push(" WHERE id IN (");
            let mut separated = update.separated(", ");
            for (id, folder_id, read, deleted) in &rows {
                separated.push_bind(*id);
                *deltas.entry(*folder_id).or_default() +=
                    column.unread_delta(value, *read, *deleted);
            }
            separated.push_unseparated(")");
            update
                .build()
                .execute(&mut *w.tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            changed += rows.len();
        }

        for (folder_id, delta) in &deltas {
            adjust_unread(w.conn(), *folder_id, *delta).await?;
        }
        w.commit().await?;

        if changed > 0 {
            self.cache.invalidate();
            for folder_id in deltas.keys() {
                self.events.emit(StoreEvent::ArticlesChanged(*folder_id));
            }
        }
        Ok(changed)
    }

    /// Rewrite an article's content and state from `article`. The folder
    /// cannot change here; use [`Database::move_articles`].
    pub async fn update_article(&self, article: &Article) -> Result<(), DatabaseError> {
        let mut w = self.begin_write().await?;
        let current = load_article(w.conn(), article.id).await?;
        if current.folder_id != article.folder_id {
            return Err(DatabaseError::Invalid(format!(
                "article {} belongs to folder {}",
                article.id, current.folder_id
            )));
        }
        sqlx::query(
            "UPDATE articles SET title = ?, author = ?, link = ?, body = ?, summary = ?, date = ?,
                 enclosure = ?, has_enclosure = ?, enclosure_downloaded = ?, read = ?, revised = ?,
                 flagged = ?, deleted = ?, status = ?
             WHERE id = ?",
        )
        .bind(&article.title)
        .bind(&article.author)
        .bind(&article.link)
        .bind(&article.body)
        .bind(&article.summary)
        .bind(article.date)
        .bind(&article.enclosure)
        .bind(article.has_enclosure)
        .bind(article.enclosure_downloaded)
        .bind(article.read)
        .bind(article.revised)
        .bind(article.flagged)
        .bind(article.deleted)
        .bind(article.status.to_code())
        .bind(article.id)
        .execute(&mut *w.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let delta = i64::from(article.counts_as_unread()) - i64::from(current.counts_as_unread());
        adjust_unread(w.conn(), article.folder_id, delta).await?;
        w.commit().await?;

        self.cache.invalidate();
        self.events.emit(StoreEvent::ArticlesChanged(article.folder_id));
        Ok(())
    }

    /// Mark every article shown in a folder as read. Returns how many changed.
    pub async fn mark_folder_read(&self, folder_id: FolderId) -> Result<usize, DatabaseError> {
        let snapshot = self.folder_snapshot().await?;
        let folder = snapshot
            .get(folder_id)
            .ok_or_else(|| DatabaseError::folder_not_found(folder_id))?;

        if folder.folder_type.is_query() || folder.folder_type == FolderType::Trash {
            let filter = ArticleFilter {
                unread_only: true,
                ..Default::default()
            };
            let ids: Vec<ArticleId> = self
                .articles(folder_id, &filter)
                .await?
                .into_iter()
                .map(|a| a.id)
                .collect();
            return self.mark_read(&ids, true).await;
        }

        let feeds: Vec<FolderId> = snapshot
            .subtree_ids(folder_id)
            .into_iter()
            .filter(|id| snapshot.get(*id).is_some_and(|f| f.is_feed()))
            .collect();
        let mut w = self.begin_write().await?;
        let mut changed = Vec::new();
        let mut total = 0usize;
        for feed in feeds {
            let result = sqlx::query(
                "UPDATE articles SET read = 1 WHERE folder_id = ? AND read = 0 AND deleted = 0",
            )
            .bind(feed)
            .execute(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            let n = result.rows_affected() as i64;
            if n > 0 {
                adjust_unread(w.conn(), feed, -n).await?;
                changed.push(feed);
                total += n as usize;
            }
        }
        w.commit().await?;

        if total > 0 {
            self.cache.invalidate();
            for feed in changed {
                self.events.emit(StoreEvent::ArticlesChanged(feed));
            }
        }
        Ok(total)
    }

    /// Move articles to another feed folder. Articles whose GUID already
    /// exists in the target are left where they are. Returns how many moved.
    pub async fn move_articles(
        &self,
        ids: &[ArticleId],
        target: FolderId,
    ) -> Result<usize, DatabaseError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = chrono::Utc::now().timestamp();
        let mut w = self.begin_write().await?;
        let target_folder = load_folder(w.conn(), target).await?;
        if !target_folder.is_feed() {
            return Err(DatabaseError::Invalid(format!(
                "articles cannot be moved into a {:?} folder",
                target_folder.folder_type
            )));
        }

        let mut deltas: BTreeMap<FolderId, i64> = BTreeMap::new();
        let mut moved = 0usize;
        for id in ids {
            let article = match load_article(w.conn(), *id).await {
                Ok(a) => a,
                Err(DatabaseError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if article.folder_id == target {
                continue;
            }
            let clash: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM articles WHERE folder_id = ? AND guid = ?")
                    .bind(target)
                    .bind(&article.guid)
                    .fetch_optional(&mut *w.tx)
                    .await
                    .map_err(DatabaseError::from_sqlx)?;
            if clash.is_some() {
                tracing::debug!(article_id = id, target, "guid already in target, not moved");
                continue;
            }
            sqlx::query("UPDATE articles SET folder_id = ? WHERE id = ?")
                .bind(target)
                .bind(id)
                .execute(&mut *w.tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            sqlx::query(
                "INSERT OR IGNORE INTO guid_history (folder_id, guid, first_seen) VALUES (?, ?, ?)",
            )
            .bind(target)
            .bind(&article.guid)
            .bind(now)
            .execute(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            if article.counts_as_unread() {
                *deltas.entry(article.folder_id).or_default() -= 1;
                *deltas.entry(target).or_default() += 1;
            } else {
                deltas.entry(article.folder_id).or_default();
                deltas.entry(target).or_default();
            }
            moved += 1;
        }
        for (folder_id, delta) in &deltas {
            adjust_unread(w.conn(), *folder_id, *delta).await?;
        }
        w.commit().await?;

        if moved > 0 {
            self.cache.invalidate();
            for folder_id in deltas.keys() {
                self.events.emit(StoreEvent::ArticlesChanged(*folder_id));
            }
        }
        Ok(moved)
    }

    /// Apply read and starred state reported by a sync server to every
    /// article of a folder. The server is authoritative. Returns how many
    /// articles changed.
    pub async fn apply_remote_state(
        &self,
        folder_id: FolderId,
        unread_guids: &HashSet<String>,
        starred_guids: &HashSet<String>,
    ) -> Result<usize, DatabaseError> {
        let mut w = self.begin_write().await?;
        let rows: Vec<(ArticleId, String, bool, bool, bool)> = sqlx::query_as(
            "SELECT id, guid, read, flagged, deleted FROM articles WHERE folder_id = ?",
        )
        .bind(folder_id)
        .fetch_all(&mut *w.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let mut delta = 0i64;
        let mut changed = 0usize;
        for (id, guid, read, flagged, deleted) in rows {
            let want_read = !unread_guids.contains(&guid);
            let want_flagged = starred_guids.contains(&guid);
            if want_read == read && want_flagged == flagged {
                continue;
            }
            sqlx::query("UPDATE articles SET read = ?, flagged = ? WHERE id = ?")
                .bind(want_read)
                .bind(want_flagged)
                .bind(id)
                .execute(&mut *w.tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            if want_read != read && !deleted {
                delta += if want_read { -1 } else { 1 };
            }
            changed += 1;
        }
        adjust_unread(w.conn(), folder_id, delta).await?;
        w.commit().await?;

        if changed > 0 {
            tracing::debug!(folder_id, changed, "applied remote article state");
            self.cache.invalidate();
            self.events.emit(StoreEvent::ArticlesChanged(folder_id));
        }
        Ok(changed)
    }

    // ========================================================================
    // Purging
    // ========================================================================

    /// Permanently remove every article in the trash. GUID history is kept,
    /// so purged articles are not resurrected by the next refresh.
    pub async fn purge_deleted_articles(&self) -> Result<usize, DatabaseError> {
        let mut w = self.begin_write().await?;
        let folders: Vec<(FolderId,)> =
            sqlx::query_as("SELECT DISTINCT folder_id FROM articles WHERE deleted = 1")
                .fetch_all(&mut *w.tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
        let result = sqlx::query("DELETE FROM articles WHERE deleted = 1")
            .execute(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        w.commit().await?;

        let purged = result.rows_affected() as usize;
        if purged > 0 {
            tracing::info!(purged, "emptied trash");
            self.cache.invalidate();
            if let Ok(trash) = self.trash_folder_id().await {
                self.events.emit(StoreEvent::ArticlesChanged(trash));
            }
            for (folder_id,) in folders {
                self.events.emit(StoreEvent::ArticlesChanged(folder_id));
            }
        }
        Ok(purged)
    }

    /// Permanently remove unflagged articles published more than `days` days
    /// ago. Zero days means never.
    pub async fn purge_articles_older_than(&self, days: u32) -> Result<usize, DatabaseError> {
        if days == 0 {
            return Ok(0);
        }
        let cutoff = chrono::Utc::now().timestamp() - i64::from(days) * SECONDS_PER_DAY;
        let mut w = self.begin_write().await?;
        let counts: Vec<(FolderId, i64, i64)> = sqlx::query_as(
            "SELECT folder_id, COUNT(*), SUM(CASE WHEN read = 0 AND deleted = 0 THEN 1 ELSE 0 END)
             FROM articles WHERE flagged = 0 AND date < ? GROUP BY folder_id",
        )
        .bind(cutoff)
        .fetch_all(&mut *w.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        if counts.is_empty() {
            return Ok(0);
        }
        sqlx::query("DELETE FROM articles WHERE flagged = 0 AND date < ?")
            .bind(cutoff)
            .execute(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        for (folder_id, _, unread) in &counts {
            adjust_unread(w.conn(), *folder_id, -unread).await?;
        }
        w.commit().await?;

        let purged: i64 = counts.iter().map(|(_, n, _)| n).sum();
        tracing::info!(days, purged, "expired old articles");
        self.cache.invalidate();
        for (folder_id, _, _) in counts {
            self.events.emit(StoreEvent::ArticlesChanged(folder_id));
        }
        Ok(purged as usize)
    }

    /// Forget GUIDs first seen more than `days` days ago whose article no
    /// longer exists. Feeds still carrying such an item will deliver it
    /// again as new.
    pub async fn prune_guid_history(&self, days: u32) -> Result<usize, DatabaseError> {
        if days == 0 {
            return Ok(0);
        }
        let cutoff = chrono::Utc::now().timestamp() - i64::from(days) * SECONDS_PER_DAY;
        let mut w = self.begin_write().await?;
        let result = sqlx::query(
            "DELETE FROM guid_history WHERE first_seen < ? AND NOT EXISTS (
                 SELECT 1 FROM articles a
                 WHERE a.folder_id = guid_history.folder_id AND a.guid = guid_history.guid
             )",
        )
        .bind(cutoff)
        .execute(&mut *w.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        w.commit().await?;
        let pruned = result.rows_affected() as usize;
        tracing::debug!(days, pruned, "pruned guid history");
        Ok(pruned)
    }
}

// ============================================================================
// Transaction Helpers
// ============================================================================

async fn load_article(
    conn: &mut SqliteConnection,
    id: ArticleId,
) -> Result<Article, DatabaseError> {
    let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?");
    let row: Option<ArticleRow> = sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    row.map(ArticleRow::into_article)
        .ok_or_else(|| DatabaseError::NotFound(format!("article {id}")))
}

/// Merge a batch into `folder_id` and fix up its unread count. Returns the
/// summary and whether any stored row changed.
async fn merge_into(
    conn: &mut SqliteConnection,
    folder_id: FolderId,
    articles: &[ParsedArticle],
    now: i64,
) -> Result<(MergeSummary, bool), DatabaseError> {
    let mut summary = MergeSummary::default();
    let mut delta = 0i64;
    let mut changed = false;
    for parsed in articles {
        if parsed.guid.is_empty() {
            tracing::warn!(folder_id, title = %parsed.title, "skipping article without guid");
            continue;
        }
        let (outcome, d, touched) = merge_one(conn, folder_id, parsed, now).await?;
        summary.record(outcome);
        delta += d;
        changed |= touched;
    }
    adjust_unread(conn, folder_id, delta).await?;
    Ok((summary, changed))
}

/// Returns the outcome, the unread delta and whether a row was written.
async fn merge_one(
    conn: &mut SqliteConnection,
    folder_id: FolderId,
    parsed: &ParsedArticle,
    now: i64,
) -> Result<(CreateOutcome, i64, bool), DatabaseError> {
    let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE folder_id = ? AND guid = ?");
    let existing: Option<ArticleRow> = sqlx::query_as(&sql)
        .bind(folder_id)
        .bind(&parsed.guid)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DatabaseError::from_sqlx)?;

    if let Some(row) = existing {
        let stored = row.into_article();
        let read = parsed.remote_read.unwrap_or(stored.read);
        let flagged = parsed.remote_starred.unwrap_or(stored.flagged);
        let delta = if read != stored.read && !stored.deleted {
            if read {
                -1
            } else {
                1
            }
        } else {
            0
        };

        if parsed.differs_from(&stored) {
            sqlx::query(
                "UPDATE articles SET title = ?, author = ?, link = ?, body = ?, summary = ?,
                     date = ?, enclosure = ?, has_enclosure = ?, read = ?, flagged = ?,
                     revised = 1, status = ?
                 WHERE id = ?",
            )
            .bind(&parsed.title)
            .bind(&parsed.author)
            .bind(&parsed.link)
            .bind(&parsed.body)
            .bind(&parsed.summary)
            .bind(parsed.date)
            .bind(&parsed.enclosure)
            .bind(parsed.enclosure.is_some())
            .bind(read)
            .bind(flagged)
            .bind(ArticleStatus::Updated.to_code())
            .bind(stored.id)
            .execute(&mut *conn)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            return Ok((CreateOutcome::Updated, delta, true));
        }

        if read != stored.read || flagged != stored.flagged {
            sqlx::query("UPDATE articles SET read = ?, flagged = ? WHERE id = ?")
                .bind(read)
                .bind(flagged)
                .bind(stored.id)
                .execute(&mut *conn)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            return Ok((CreateOutcome::Unchanged, delta, true));
        }
        return Ok((CreateOutcome::Unchanged, 0, false));
    }

    let seen: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM guid_history WHERE folder_id = ? AND guid = ?")
            .bind(folder_id)
            .bind(&parsed.guid)
            .fetch_optional(&mut *conn)
            .await
            .map_err(DatabaseError::from_sqlx)?;
    if seen.is_some() {
        return Ok((CreateOutcome::Suppressed, 0, false));
    }

    let read = parsed.remote_read.unwrap_or(false);
    sqlx::query(
        "INSERT INTO articles (folder_id, guid, title, author, link, body, summary, date,
             created_date, enclosure, has_enclosure, read, flagged, status)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(folder_id)
    .bind(&parsed.guid)
    .bind(&parsed.title)
    .bind(&parsed.author)
    .bind(&parsed.link)
    .bind(&parsed.body)
    .bind(&parsed.summary)
    .bind(parsed.date)
    .bind(now)
    .bind(&parsed.enclosure)
    .bind(parsed.enclosure.is_some())
    .bind(read)
    .bind(parsed.remote_starred.unwrap_or(false))
    .bind(ArticleStatus::New.to_code())
    .execute(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;
    sqlx::query("INSERT OR IGNORE INTO guid_history (folder_id, guid, first_seen) VALUES (?, ?, ?)")
        .bind(folder_id)
        .bind(&parsed.guid)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(DatabaseError::from_sqlx)?;

    Ok((CreateOutcome::New, if read { 0 } else { 1 }, true))
}
