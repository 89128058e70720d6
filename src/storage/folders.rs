use std::sync::Arc;

use sqlx::SqliteConnection;

use super::cache::FolderSnapshot;
use super::events::StoreEvent;
use super::schema::Database;
use super::types::{DatabaseError, FolderRow, FOLDER_COLUMNS};
use crate::model::{
    folder_name_compare, Folder, FolderFlags, FolderId, FolderType, InsertPosition, SessionFlags,
    SortMode, NO_FOLDER, ROOT_FOLDER_ID,
};
use crate::util::{clean_name, normalize_feed_url};

impl Database {
    // ========================================================================
    // Folder Queries
    // ========================================================================

    /// Current generation of the folder tree, loading it if the cache is cold.
    pub async fn folder_snapshot(&self) -> Result<Arc<FolderSnapshot>, DatabaseError> {
        if let Some(snapshot) = self.cache.current() {
            return Ok(snapshot);
        }
        let epoch = self.cache.epoch();
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders");
        let mut r = self.reader().await?;
        let rows: Vec<FolderRow> = sqlx::query_as(&sql)
            .fetch_all(r.conn())
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let folders = rows.into_iter().filter_map(FolderRow::into_folder).collect();
        Ok(self.cache.install(epoch, folders))
    }

    pub async fn folder(&self, id: FolderId) -> Result<Option<Folder>, DatabaseError> {
        Ok(self.folder_snapshot().await?.get(id).cloned())
    }

    /// Direct children of `parent`.
    pub async fn folders_under(
        &self,
        parent: FolderId,
        sort: SortMode,
    ) -> Result<Vec<Folder>, DatabaseError> {
        let snapshot = self.folder_snapshot().await?;
        if snapshot.get(parent).is_none() {
            return Err(DatabaseError::folder_not_found(parent));
        }
        let mut children: Vec<Folder> = snapshot
            .children_linked(parent)
            .into_iter()
            .cloned()
            .collect();
        if sort == SortMode::ByName {
            children.sort_by(|a, b| folder_name_compare(&a.name, &b.name));
        }
        Ok(children)
    }

    /// Every Rss and OpenReader folder, in no particular order.
    pub async fn feed_folders(&self) -> Result<Vec<Folder>, DatabaseError> {
        let snapshot = self.folder_snapshot().await?;
        Ok(snapshot
            .folders
            .values()
            .filter(|f| f.is_feed())
            .cloned()
            .collect())
    }

    pub async fn folder_by_feed_url(&self, url: &str) -> Result<Option<Folder>, DatabaseError> {
        Ok(self.folder_snapshot().await?.find_by_feed_url(url).cloned())
    }

    /// First folder with the given name, ignoring case.
    pub async fn folder_by_name(&self, name: &str) -> Result<Option<Folder>, DatabaseError> {
        let snapshot = self.folder_snapshot().await?;
        let wanted = name.to_lowercase();
        let mut matches: Vec<&Folder> = snapshot
            .folders
            .values()
            .filter(|f| f.id != ROOT_FOLDER_ID && f.name.to_lowercase() == wanted)
            .collect();
        matches.sort_by_key(|f| f.id);
        Ok(matches.first().map(|f| (*f).clone()))
    }

    pub async fn trash_folder_id(&self) -> Result<FolderId, DatabaseError> {
        let snapshot = self.folder_snapshot().await?;
        snapshot
            .folders
            .values()
            .find(|f| f.folder_type == FolderType::Trash)
            .map(|f| f.id)
            .ok_or_else(|| DatabaseError::NotFound("trash folder".into()))
    }

    // ========================================================================
    // Folder Creation
    // ========================================================================

    /// Create a folder under `parent`.
    ///
    /// With `can_append_index` false, an existing sibling with the same name
    /// (ignoring case) and type is returned instead of creating a duplicate.
    /// With it true, the name is made unique by appending ` (n)`.
    pub async fn add_folder(
        &self,
        parent: FolderId,
        position: InsertPosition,
        name: &str,
        folder_type: FolderType,
        can_append_index: bool,
    ) -> Result<FolderId, DatabaseError> {
        if matches!(folder_type, FolderType::Root | FolderType::Trash) {
            return Err(DatabaseError::Invalid(format!(
                "cannot create another {folder_type:?} folder"
            )));
        }
        let mut w = self.begin_write().await?;
        let (id, created) =
            insert_folder(w.conn(), parent, position, name, folder_type, can_append_index).await?;
        w.commit().await?;
        self.folder_added(id, created);
        Ok(id)
    }

    /// Subscribe to a feed. An existing subscription to the same URL is
    /// returned as is.
    ///
    /// Without a name the URL itself is used as a placeholder; the first
    /// successful refresh replaces it with the channel title.
    pub async fn add_rss_folder(
        &self,
        parent: FolderId,
        name: Option<&str>,
        feed_url: &str,
        username: Option<&str>,
    ) -> Result<FolderId, DatabaseError> {
        let url =
            normalize_feed_url(feed_url).map_err(|e| DatabaseError::Invalid(e.to_string()))?;
        let name = name.and_then(clean_name).unwrap_or_else(|| url.clone());

        let mut w = self.begin_write().await?;
        if let Some(existing) = existing_folder(w.conn(), "feed_url", &url).await? {
            return Ok(existing);
        }
        let (id, created) =
            insert_folder(w.conn(), parent, InsertPosition::Last, &name, FolderType::Rss, true)
                .await?;
        let flags = FolderFlags {
            check_for_image: true,
            ..Default::default()
        };
        sqlx::query("UPDATE folders SET feed_url = ?, username = ?, flags = ? WHERE id = ?")
            .bind(&url)
            .bind(username)
            .bind(flags.to_bits())
            .bind(id)
            .execute(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        w.commit().await?;

        tracing::info!(folder_id = id, url = %url, "subscribed to feed");
        self.folder_added(id, created);
        Ok(id)
    }

    /// Create or find the folder that mirrors a subscription on a sync server.
    pub async fn add_open_reader_folder(
        &self,
        parent: FolderId,
        name: &str,
        feed_url: &str,
        remote_id: &str,
    ) -> Result<FolderId, DatabaseError> {
        let mut w = self.begin_write().await?;
        if let Some(existing) = existing_folder(w.conn(), "remote_id", remote_id).await? {
            return Ok(existing);
        }
        let (id, created) = insert_folder(
            w.conn(),
            parent,
            InsertPosition::Last,
            name,
            FolderType::OpenReader,
            true,
        )
        .await?;
        sqlx::query("UPDATE folders SET feed_url = ?, remote_id = ? WHERE id = ?")
            .bind(feed_url)
            .bind(remote_id)
            .bind(id)
            .execute(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        w.commit().await?;
        self.folder_added(id, created);
        Ok(id)
    }

    pub(crate) fn folder_added(&self, id: FolderId, created: bool) {
        self.cache.invalidate();
        if created {
            self.events.emit(StoreEvent::FolderAdded(id));
        }
    }

    // ========================================================================
    // Tree Mutation
    // ========================================================================

    /// Delete a folder and, for groups, everything below it.
    ///
    /// Articles and GUID history of every removed folder go with it and the
    /// removed unread rollup is subtracted from every ancestor.
    pub async fn delete_folder(&self, id: FolderId) -> Result<(), DatabaseError> {
        let snapshot = self.folder_snapshot().await?;
        let folder = snapshot
            .get(id)
            .ok_or_else(|| DatabaseError::folder_not_found(id))?;
        if matches!(folder.folder_type, FolderType::Root | FolderType::Trash) {
            return Err(DatabaseError::Invalid(format!(
                "the {:?} folder cannot be deleted",
                folder.folder_type
            )));
        }
        let doomed: Vec<FolderId> = snapshot.subtree_ids(id).into_iter().rev().collect();
        for fid in &doomed {
            self.events.emit(StoreEvent::WillDeleteFolder(*fid));
        }

        let mut w = self.begin_write().await?;
        let folder = load_folder(w.conn(), id).await?;
        adjust_ancestors(w.conn(), id, -folder.total_unread()).await?;
        unlink(w.conn(), &folder).await?;

        let removed: Vec<(i64,)> = sqlx::query_as(
            r#"
            WITH RECURSIVE subtree(id, depth) AS (
                SELECT ?, 0
                UNION
                SELECT f.id, s.depth + 1 FROM folders f JOIN subtree s ON f.parent_id = s.id
            )
            SELECT id FROM subtree ORDER BY depth DESC
            "#,
        )
        .bind(id)
        .fetch_all(&mut *w.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        for (fid,) in &removed {
            for table in ["articles", "guid_history", "smart_folders", "folder_images"] {
                sqlx::query(&format!("DELETE FROM {table} WHERE folder_id = ?"))
                    .bind(fid)
                    .execute(&mut *w.tx)
                    .await
                    .map_err(DatabaseError::from_sqlx)?;
            }
            sqlx::query("DELETE FROM folders WHERE id = ?")
                .bind(fid)
                .execute(&mut *w.tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
        }
        w.commit().await?;

        tracing::info!(folder_id = id, removed = removed.len(), "deleted folder");
        self.cache.invalidate();
        for (fid,) in &removed {
            self.cache.clear_session(*fid);
            self.events.emit(StoreEvent::DidDeleteFolder(*fid));
        }
        Ok(())
    }

    /// Move a folder under a new parent.
    ///
    /// The folder's unread rollup leaves the old ancestor chain and joins the
    /// new one in the same transaction. Moving a folder below itself is
    /// refused.
    pub async fn set_parent(
        &self,
        id: FolderId,
        new_parent: FolderId,
        position: InsertPosition,
    ) -> Result<(), DatabaseError> {
        if id == ROOT_FOLDER_ID || id == new_parent {
            return Err(DatabaseError::Invalid(format!(
                "folder {id} cannot be moved under {new_parent}"
            )));
        }
        let mut w = self.begin_write().await?;
        let folder = load_folder(w.conn(), id).await?;
        let parent = load_folder(w.conn(), new_parent).await?;
        if !parent.folder_type.can_have_children() {
            return Err(DatabaseError::Invalid(format!(
                "{:?} folders cannot contain other folders",
                parent.folder_type
            )));
        }
        if is_ancestor(w.conn(), id, new_parent).await? {
            return Err(DatabaseError::Invalid(format!(
                "folder {new_parent} is inside folder {id}"
            )));
        }

        let total = folder.total_unread();
        adjust_ancestors(w.conn(), id, -total).await?;
        unlink(w.conn(), &folder).await?;
        sqlx::query("UPDATE folders SET parent_id = ? WHERE id = ?")
            .bind(new_parent)
            .bind(id)
            .execute(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        link_child(w.conn(), new_parent, id, position).await?;
        adjust_ancestors(w.conn(), id, total).await?;
        w.commit().await?;

        tracing::debug!(folder_id = id, from = folder.parent_id, to = new_parent, "moved folder");
        self.folder_updated(id);
        Ok(())
    }

    /// Point `parent` at a new first child. Raw link repair; the caller keeps
    /// the sibling chain consistent.
    pub async fn set_first_child(
        &self,
        parent: FolderId,
        child: FolderId,
    ) -> Result<(), DatabaseError> {
        let mut w = self.begin_write().await?;
        load_folder(w.conn(), parent).await?;
        if child != NO_FOLDER && load_folder(w.conn(), child).await?.parent_id != parent {
            return Err(DatabaseError::Invalid(format!(
                "folder {child} is not a child of {parent}"
            )));
        }
        set_link(w.conn(), "first_child_id", parent, child).await?;
        w.commit().await?;
        self.folder_updated(parent);
        Ok(())
    }

    /// Point a folder at a new next sibling. Raw link repair.
    pub async fn set_next_sibling(
        &self,
        id: FolderId,
        next: FolderId,
    ) -> Result<(), DatabaseError> {
        let mut w = self.begin_write().await?;
        let folder = load_folder(w.conn(), id).await?;
        if next != NO_FOLDER
            && (next == id || load_folder(w.conn(), next).await?.parent_id != folder.parent_id)
        {
            return Err(DatabaseError::Invalid(format!(
                "folder {next} is not a sibling of {id}"
            )));
        }
        set_link(w.conn(), "next_sibling_id", id, next).await?;
        w.commit().await?;
        self.folder_updated(id);
        Ok(())
    }

    /// Rename a folder. A sibling already using the name (ignoring case) is
    /// a conflict.
    pub async fn rename_folder(&self, id: FolderId, name: &str) -> Result<(), DatabaseError> {
        if id == ROOT_FOLDER_ID {
            return Err(DatabaseError::Invalid("the root folder cannot be renamed".into()));
        }
        let name = clean_name(name)
            .ok_or_else(|| DatabaseError::Invalid("folder name is empty".into()))?;

        let mut w = self.begin_write().await?;
        let folder = load_folder(w.conn(), id).await?;
        let siblings = sibling_names(w.conn(), folder.parent_id, id).await?;
        if siblings
            .iter()
            .any(|(_, n, _)| n.to_lowercase() == name.to_lowercase())
        {
            return Err(DatabaseError::Invalid(format!(
                "a folder named {name:?} already exists here"
            )));
        }
        sqlx::query("UPDATE folders SET name = ? WHERE id = ?")
            .bind(&name)
            .bind(id)
            .execute(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        w.commit().await?;
        self.folder_updated(id);
        Ok(())
    }

    // ========================================================================
    // Folder Attributes
    // ========================================================================

    pub async fn set_folder_flags(
        &self,
        id: FolderId,
        flags: FolderFlags,
    ) -> Result<(), DatabaseError> {
        self.update_folder_flags(id, |f| *f = flags).await.map(|_| ())
    }

    /// Read-modify-write the persisted flags. Returns the new flags.
    pub async fn update_folder_flags(
        &self,
        id: FolderId,
        update: impl FnOnce(&mut FolderFlags),
    ) -> Result<FolderFlags, DatabaseError> {
        let mut w = self.begin_write().await?;
        let folder = load_folder(w.conn(), id).await?;
        let mut flags = folder.flags;
        update(&mut flags);
        if flags == folder.flags {
            return Ok(flags);
        }
        sqlx::query("UPDATE folders SET flags = ? WHERE id = ?")
            .bind(flags.to_bits())
            .bind(id)
            .execute(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        w.commit().await?;
        self.folder_updated(id);
        Ok(flags)
    }

    /// Update session-only flags. Nothing is written to the database.
    pub fn set_session_flags(&self, id: FolderId, update: impl FnOnce(&mut SessionFlags)) {
        if self.cache.update_session(id, update) {
            self.events.emit(StoreEvent::FolderUpdated(id));
        }
    }

    pub fn session_flags(&self, id: FolderId) -> SessionFlags {
        self.cache.session_flags(id)
    }

    /// Change a feed's URL. Cached validators are dropped with the old URL.
    pub async fn set_feed_url(&self, id: FolderId, url: &str) -> Result<(), DatabaseError> {
        let url = normalize_feed_url(url).map_err(|e| DatabaseError::Invalid(e.to_string()))?;
        if let Some(other) = self.folder_by_feed_url(&url).await? {
            if other.id != id {
                return Err(DatabaseError::Invalid(format!(
                    "{url} is already subscribed as folder {}",
                    other.id
                )));
            }
        }
        let mut w = self.begin_write().await?;
        let folder = load_folder(w.conn(), id).await?;
        if !folder.is_feed() {
            return Err(DatabaseError::Invalid(format!("folder {id} is not a feed")));
        }
        update_feed_url(w.conn(), id, &url).await?;
        w.commit().await?;
        self.folder_updated(id);
        Ok(())
    }

    pub async fn set_folder_username(
        &self,
        id: FolderId,
        username: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let mut w = self.begin_write().await?;
        load_folder(w.conn(), id).await?;
        sqlx::query("UPDATE folders SET username = ? WHERE id = ?")
            .bind(username)
            .bind(id)
            .execute(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        w.commit().await?;
        self.folder_updated(id);
        Ok(())
    }

    pub async fn set_home_page(
        &self,
        id: FolderId,
        home_page: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let mut w = self.begin_write().await?;
        load_folder(w.conn(), id).await?;
        sqlx::query("UPDATE folders SET home_page = ? WHERE id = ?")
            .bind(home_page)
            .bind(id)
            .execute(&mut *w.tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        w.commit().await?;
        self.folder_updated(id);
        Ok(())
    }

    /// Set or clear the error flag after a failed or successful refresh.
    pub async fn set_folder_error(&self, id: FolderId, error: bool) -> Result<(), DatabaseError> {
        self.update_folder_flags(id, |f| f.error = error)
            .await
            .map(|_| ())
    }

    pub(crate) fn folder_updated(&self, id: FolderId) {
        self.cache.invalidate();
        self.events.emit(StoreEvent::FolderUpdated(id));
    }

    // ========================================================================
    // Folder Images
    // ========================================================================

    pub async fn set_folder_image(
        &self,
        id: FolderId,
        image: &[u8],
        mime_type: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut w = self.begin_write().await?;
        load_folder(w.conn(), id).await?;
        sqlx::query(
            "INSERT INTO folder_images (folder_id, image, mime_type, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(folder_id) DO UPDATE SET image = excluded.image,
                 mime_type = excluded.mime_type, updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(image)
        .bind(mime_type)
        .bind(now)
        .execute(&mut *w.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        w.commit().await?;
        self.events.emit(StoreEvent::FolderUpdated(id));
        Ok(())
    }

    pub async fn folder_image(
        &self,
        id: FolderId,
    ) -> Result<Option<(Vec<u8>, Option<String>)>, DatabaseError> {
        let mut r = self.reader().await?;
        let image = sqlx::query_as("SELECT image, mime_type FROM folder_images WHERE folder_id = ?")
            .bind(id)
            .fetch_optional(r.conn())
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(image)
    }
}

// ============================================================================
// Transaction Helpers
// ============================================================================

/// Folder already holding `value` in a unique-per-subscription column.
async fn existing_folder(
    conn: &mut SqliteConnection,
    column: &'static str,
    value: &str,
) -> Result<Option<FolderId>, DatabaseError> {
    let sql = format!("SELECT id FROM folders WHERE {column} = ? LIMIT 1");
    let row: Option<(FolderId,)> = sqlx::query_as(&sql)
        .bind(value)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    Ok(row.map(|(id,)| id))
}

pub(crate) async fn load_folder(
    conn: &mut SqliteConnection,
    id: FolderId,
) -> Result<Folder, DatabaseError> {
    let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE id = ?");
    let row: Option<FolderRow> = sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    row.and_then(FolderRow::into_folder)
        .ok_or_else(|| DatabaseError::folder_not_found(id))
}

/// Insert a folder row and link it under `parent`. Returns the id and
/// whether a new row was created.
pub(crate) async fn insert_folder(
    conn: &mut SqliteConnection,
    parent: FolderId,
    position: InsertPosition,
    name: &str,
    folder_type: FolderType,
    can_append_index: bool,
) -> Result<(FolderId, bool), DatabaseError> {
    let parent_folder = load_folder(conn, parent).await?;
    if !parent_folder.folder_type.can_have_children() {
        return Err(DatabaseError::Invalid(format!(
            "{:?} folders cannot contain other folders",
            parent_folder.folder_type
        )));
    }
    let name =
        clean_name(name).ok_or_else(|| DatabaseError::Invalid("folder name is empty".into()))?;
    let siblings = sibling_names(conn, parent, NO_FOLDER).await?;
    let taken = |candidate: &str| {
        let lower = candidate.to_lowercase();
        siblings.iter().any(|(_, n, _)| n.to_lowercase() == lower)
    };

    let name = if can_append_index {
        unique_name(&name, taken)
    } else {
        let lower = name.to_lowercase();
        if let Some((id, _, _)) = siblings
            .iter()
            .find(|(_, n, t)| *t == folder_type.to_code() && n.to_lowercase() == lower)
        {
            return Ok((*id, false));
        }
        name
    };

    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO folders (parent_id, name, folder_type) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(parent)
    .bind(&name)
    .bind(folder_type.to_code())
    .fetch_one(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;
    link_child(conn, parent, id, position).await?;
    tracing::debug!(folder_id = id, parent, name = %name, ?folder_type, "created folder");
    Ok((id, true))
}

fn unique_name(name: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(name) {
        return name.to_string();
    }
    (2..)
        .map(|n| format!("{name} ({n})"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| name.to_string())
}

/// `(id, name, type code)` of the children of `parent`, excluding `exclude`.
async fn sibling_names(
    conn: &mut SqliteConnection,
    parent: FolderId,
    exclude: FolderId,
) -> Result<Vec<(i64, String, i64)>, DatabaseError> {
    sqlx::query_as("SELECT id, name, folder_type FROM folders WHERE parent_id = ? AND id != ?")
        .bind(parent)
        .bind(exclude)
        .fetch_all(&mut *conn)
        .await
        .map_err(DatabaseError::from_sqlx)
}

/// Pick a sibling name for a folder that is currently named after a
/// placeholder. Used when a refresh learns the channel title.
pub(crate) async fn unique_sibling_name(
    conn: &mut SqliteConnection,
    folder: &Folder,
    wanted: &str,
) -> Result<Option<String>, DatabaseError> {
    let Some(wanted) = clean_name(wanted) else {
        return Ok(None);
    };
    let siblings = sibling_names(conn, folder.parent_id, folder.id).await?;
    Ok(Some(unique_name(&wanted, |candidate| {
        let lower = candidate.to_lowercase();
        siblings.iter().any(|(_, n, _)| n.to_lowercase() == lower)
    })))
}

async fn set_link(
    conn: &mut SqliteConnection,
    column: &str,
    id: FolderId,
    target: FolderId,
) -> Result<(), DatabaseError> {
    sqlx::query(&format!("UPDATE folders SET {column} = ? WHERE id = ?"))
        .bind(target)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    Ok(())
}

async fn link_of(
    conn: &mut SqliteConnection,
    column: &str,
    id: FolderId,
) -> Result<FolderId, DatabaseError> {
    let row: Option<(i64,)> = sqlx::query_as(&format!("SELECT {column} FROM folders WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    Ok(row.map_or(NO_FOLDER, |(v,)| v))
}

/// Insert `id` into the sibling list of `parent`.
async fn link_child(
    conn: &mut SqliteConnection,
    parent: FolderId,
    id: FolderId,
    position: InsertPosition,
) -> Result<(), DatabaseError> {
    if let InsertPosition::After(prev) = position {
        let prev_row: Option<(i64,)> = sqlx::query_as(
            "SELECT next_sibling_id FROM folders WHERE id = ? AND parent_id = ? AND id != ?",
        )
        .bind(prev)
        .bind(parent)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        if let Some((next,)) = prev_row {
            set_link(conn, "next_sibling_id", id, next).await?;
            set_link(conn, "next_sibling_id", prev, id).await?;
            return Ok(());
        }
        // An unknown anchor appends.
    }

    let head = link_of(conn, "first_child_id", parent).await?;
    if position == InsertPosition::First || head == NO_FOLDER {
        set_link(conn, "next_sibling_id", id, head).await?;
        set_link(conn, "first_child_id", parent, id).await?;
        return Ok(());
    }

    let mut tail = head;
    let mut steps = 0usize;
    loop {
        let next = link_of(conn, "next_sibling_id", tail).await?;
        if next == NO_FOLDER || next == id {
            break;
        }
        tail = next;
        steps += 1;
        if steps > 100_000 {
            return Err(DatabaseError::Invalid(format!(
                "sibling list of folder {parent} does not terminate"
            )));
        }
    }
    set_link(conn, "next_sibling_id", id, NO_FOLDER).await?;
    set_link(conn, "next_sibling_id", tail, id).await?;
    Ok(())
}

/// Remove a folder from its parent's sibling list.
async fn unlink(conn: &mut SqliteConnection, folder: &Folder) -> Result<(), DatabaseError> {
    sqlx::query("UPDATE folders SET first_child_id = ? WHERE id = ? AND first_child_id = ?")
        .bind(folder.next_sibling_id)
        .bind(folder.parent_id)
        .bind(folder.id)
        .execute(&mut *conn)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    sqlx::query(
        "UPDATE folders SET next_sibling_id = ? WHERE parent_id = ? AND next_sibling_id = ? AND id != ?",
    )
    .bind(folder.next_sibling_id)
    .bind(folder.parent_id)
    .bind(folder.id)
    .bind(folder.id)
    .execute(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;
    set_link(conn, "next_sibling_id", folder.id, NO_FOLDER).await
}

/// Whether `ancestor` is `id` or lies on the parent chain of `id`.
async fn is_ancestor(
    conn: &mut SqliteConnection,
    ancestor: FolderId,
    id: FolderId,
) -> Result<bool, DatabaseError> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        WITH RECURSIVE chain(id) AS (
            SELECT ?
            UNION
            SELECT f.parent_id FROM folders f JOIN chain c ON f.id = c.id
        )
        SELECT 1 FROM chain WHERE id = ?
        "#,
    )
    .bind(id)
    .bind(ancestor)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;
    Ok(row.is_some())
}

pub(crate) async fn update_feed_url(
    conn: &mut SqliteConnection,
    id: FolderId,
    url: &str,
) -> Result<(), DatabaseError> {
    sqlx::query("UPDATE folders SET feed_url = ?, etag = NULL, last_modified = NULL WHERE id = ?")
        .bind(url)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    Ok(())
}

// ============================================================================
// Unread Rollup
// ============================================================================

/// Add `delta` to a folder's own unread count and propagate it to every
/// ancestor's child count.
pub(crate) async fn adjust_unread(
    conn: &mut SqliteConnection,
    folder_id: FolderId,
    delta: i64,
) -> Result<(), DatabaseError> {
    if delta == 0 {
        return Ok(());
    }
    sqlx::query("UPDATE folders SET unread_count = MAX(0, unread_count + ?) WHERE id = ?")
        .bind(delta)
        .bind(folder_id)
        .execute(&mut *conn)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    adjust_ancestors(conn, folder_id, delta).await
}

/// Add `delta` to `child_unread_count` of every ancestor of `folder_id`.
pub(crate) async fn adjust_ancestors(
    conn: &mut SqliteConnection,
    folder_id: FolderId,
    delta: i64,
) -> Result<(), DatabaseError> {
    if delta == 0 {
        return Ok(());
    }
    sqlx::query(
        r#"
        WITH RECURSIVE ancestors(id) AS (
            SELECT parent_id FROM folders WHERE id = ?
            UNION
            SELECT f.parent_id FROM folders f JOIN ancestors a ON f.id = a.id
        )
        UPDATE folders SET child_unread_count = MAX(0, child_unread_count + ?)
        WHERE id IN (SELECT id FROM ancestors)
        "#,
    )
    .bind(folder_id)
    .bind(delta)
    .execute(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParsedArticle;
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn article(guid: &str) -> ParsedArticle {
        ParsedArticle {
            guid: guid.to_string(),
            title: format!("Title {guid}"),
            date: 1_700_000_000,
            ..Default::default()
        }
    }

    async fn names_under(db: &Database, parent: FolderId) -> Vec<String> {
        db.folders_under(parent, SortMode::Manual)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect()
    }

    #[tokio::test]
    async fn test_add_folder_positions() {
        let db = test_db().await;
        let a = db
            .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "A", FolderType::Group, false)
            .await
            .unwrap();
        db.add_folder(ROOT_FOLDER_ID, InsertPosition::First, "B", FolderType::Group, false)
            .await
            .unwrap();
        db.add_folder(ROOT_FOLDER_ID, InsertPosition::After(a), "C", FolderType::Group, false)
            .await
            .unwrap();
        assert_eq!(names_under(&db, ROOT_FOLDER_ID).await, vec!["B", "Trash", "A", "C"]);
    }

    #[tokio::test]
    async fn test_add_folder_duplicate_handling() {
        let db = test_db().await;
        let first = db
            .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "News", FolderType::Group, false)
            .await
            .unwrap();
        let again = db
            .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "news", FolderType::Group, false)
            .await
            .unwrap();
        assert_eq!(first, again);

        let indexed = db
            .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "News", FolderType::Group, true)
            .await
            .unwrap();
        assert_ne!(first, indexed);
        assert_eq!(db.folder(indexed).await.unwrap().unwrap().name, "News (2)");
    }

    #[tokio::test]
    async fn test_add_folder_rejects_bad_input() {
        let db = test_db().await;
        assert!(matches!(
            db.add_folder(ROOT_FOLDER_ID, InsertPosition::Last, " \x01 ", FolderType::Group, false)
                .await,
            Err(DatabaseError::Invalid(_))
        ));
        let feed = db
            .add_rss_folder(ROOT_FOLDER_ID, Some("Feed"), "https://example.com/rss", None)
            .await
            .unwrap();
        assert!(matches!(
            db.add_folder(feed, InsertPosition::Last, "Child", FolderType::Group, false)
                .await,
            Err(DatabaseError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_add_rss_folder_dedups_url_and_uses_placeholder() {
        let db = test_db().await;
        let id = db
            .add_rss_folder(ROOT_FOLDER_ID, None, "feed://example.com/rss", Some("ann"))
            .await
            .unwrap();
        let again = db
            .add_rss_folder(ROOT_FOLDER_ID, Some("Other"), "http://example.com/rss", None)
            .await
            .unwrap();
        assert_eq!(id, again);

        let folder = db.folder(id).await.unwrap().unwrap();
        assert_eq!(folder.name, "http://example.com/rss");
        assert_eq!(folder.username.as_deref(), Some("ann"));
        assert!(folder.flags.check_for_image);
    }

    #[tokio::test]
    async fn test_concurrent_subscribes_share_one_folder() {
        let db = test_db().await;
        let (a, b) = tokio::join!(
            db.add_rss_folder(ROOT_FOLDER_ID, None, "https://example.com/rss", None),
            db.add_rss_folder(ROOT_FOLDER_ID, Some("Twin"), "https://example.com/rss", None),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        let feeds = db.feed_folders().await.unwrap();
        assert_eq!(feeds.len(), 1);
    }

    #[tokio::test]
    async fn test_sort_by_name() {
        let db = test_db().await;
        for name in ["beta", "Alpha", "Feed 10", "Feed 2"] {
            db.add_folder(ROOT_FOLDER_ID, InsertPosition::Last, name, FolderType::Group, false)
                .await
                .unwrap();
        }
        let names: Vec<_> = db
            .folders_under(ROOT_FOLDER_ID, SortMode::ByName)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "beta", "Feed 2", "Feed 10", "Trash"]);
    }

    #[tokio::test]
    async fn test_delete_group_removes_subtree_and_rollup() {
        let db = test_db().await;
        let group = db
            .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "G", FolderType::Group, false)
            .await
            .unwrap();
        let feed = db
            .add_rss_folder(group, Some("F"), "https://example.com/a", None)
            .await
            .unwrap();
        db.merge_articles(feed, &[article("1"), article("2")])
            .await
            .unwrap();
        assert_eq!(db.folder(ROOT_FOLDER_ID).await.unwrap().unwrap().child_unread_count, 2);

        let mut events = db.subscribe();
        db.delete_folder(group).await.unwrap();

        assert!(db.folder(group).await.unwrap().is_none());
        assert!(db.folder(feed).await.unwrap().is_none());
        assert_eq!(db.folder(ROOT_FOLDER_ID).await.unwrap().unwrap().child_unread_count, 0);
        assert_eq!(names_under(&db, ROOT_FOLDER_ID).await, vec!["Trash"]);

        let (orphans,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(orphans, 0);

        assert_eq!(events.recv().await.unwrap(), StoreEvent::WillDeleteFolder(feed));
        assert_eq!(events.recv().await.unwrap(), StoreEvent::WillDeleteFolder(group));
        assert_eq!(events.recv().await.unwrap(), StoreEvent::DidDeleteFolder(feed));
        assert_eq!(events.recv().await.unwrap(), StoreEvent::DidDeleteFolder(group));
    }

    #[tokio::test]
    async fn test_delete_protected_folders_refused() {
        let db = test_db().await;
        let trash = db.trash_folder_id().await.unwrap();
        assert!(matches!(db.delete_folder(trash).await, Err(DatabaseError::Invalid(_))));
        assert!(matches!(
            db.delete_folder(ROOT_FOLDER_ID).await,
            Err(DatabaseError::Invalid(_))
        ));
        assert!(matches!(db.delete_folder(999).await, Err(DatabaseError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_set_parent_moves_rollup() {
        let db = test_db().await;
        let g1 = db
            .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "G1", FolderType::Group, false)
            .await
            .unwrap();
        let g2 = db
            .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "G2", FolderType::Group, false)
            .await
            .unwrap();
        let feed = db
            .add_rss_folder(g1, Some("F"), "https://example.com/a", None)
            .await
            .unwrap();
        db.merge_articles(feed, &[article("1"), article("2"), article("3")])
            .await
            .unwrap();

        db.set_parent(feed, g2, InsertPosition::Last).await.unwrap();

        assert_eq!(db.folder(g1).await.unwrap().unwrap().child_unread_count, 0);
        assert_eq!(db.folder(g2).await.unwrap().unwrap().child_unread_count, 3);
        assert_eq!(db.folder(ROOT_FOLDER_ID).await.unwrap().unwrap().child_unread_count, 3);
        assert!(names_under(&db, g1).await.is_empty());
        assert_eq!(names_under(&db, g2).await, vec!["F"]);
    }

    #[tokio::test]
    async fn test_set_parent_refuses_cycles() {
        let db = test_db().await;
        let outer = db
            .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "Outer", FolderType::Group, false)
            .await
            .unwrap();
        let inner = db
            .add_folder(outer, InsertPosition::Last, "Inner", FolderType::Group, false)
            .await
            .unwrap();
        assert!(matches!(
            db.set_parent(outer, inner, InsertPosition::Last).await,
            Err(DatabaseError::Invalid(_))
        ));
        assert!(matches!(
            db.set_parent(outer, outer, InsertPosition::Last).await,
            Err(DatabaseError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_reorder_within_parent() {
        let db = test_db().await;
        let a = db
            .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "A", FolderType::Group, false)
            .await
            .unwrap();
        db.add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "B", FolderType::Group, false)
            .await
            .unwrap();
        db.set_parent(a, ROOT_FOLDER_ID, InsertPosition::Last).await.unwrap();
        assert_eq!(names_under(&db, ROOT_FOLDER_ID).await, vec!["Trash", "B", "A"]);
    }

    #[tokio::test]
    async fn test_rename_conflict() {
        let db = test_db().await;
        let a = db
            .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "A", FolderType::Group, false)
            .await
            .unwrap();
        db.add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "B", FolderType::Group, false)
            .await
            .unwrap();
        assert!(matches!(db.rename_folder(a, "b").await, Err(DatabaseError::Invalid(_))));
        db.rename_folder(a, "  Renamed ").await.unwrap();
        assert_eq!(db.folder(a).await.unwrap().unwrap().name, "Renamed");
    }

    #[tokio::test]
    async fn test_flags_persist_but_session_flags_do_not() {
        let db = test_db().await;
        let feed = db
            .add_rss_folder(ROOT_FOLDER_ID, Some("F"), "https://example.com/a", None)
            .await
            .unwrap();
        db.update_folder_flags(feed, |f| f.need_credentials = true)
            .await
            .unwrap();
        db.set_session_flags(feed, |s| s.updating = true);

        let folder = db.folder(feed).await.unwrap().unwrap();
        assert!(folder.flags.need_credentials);
        assert!(folder.session.updating);

        let (bits,): (i64,) = sqlx::query_as("SELECT flags FROM folders WHERE id = ?")
            .bind(feed)
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(FolderFlags::from_bits(bits), folder.flags);
    }

    #[tokio::test]
    async fn test_set_feed_url_conflict_and_reset_validators() {
        let db = test_db().await;
        let a = db
            .add_rss_folder(ROOT_FOLDER_ID, Some("A"), "https://example.com/a", None)
            .await
            .unwrap();
        db.add_rss_folder(ROOT_FOLDER_ID, Some("B"), "https://example.com/b", None)
            .await
            .unwrap();
        assert!(matches!(
            db.set_feed_url(a, "https://example.com/b").await,
            Err(DatabaseError::Invalid(_))
        ));
        db.set_feed_url(a, "https://example.com/new").await.unwrap();
        assert_eq!(
            db.folder(a).await.unwrap().unwrap().feed_url.as_deref(),
            Some("https://example.com/new")
        );
    }

    #[tokio::test]
    async fn test_folder_image_round_trip() {
        let db = test_db().await;
        let feed = db
            .add_rss_folder(ROOT_FOLDER_ID, Some("F"), "https://example.com/a", None)
            .await
            .unwrap();
        assert!(db.folder_image(feed).await.unwrap().is_none());
        db.set_folder_image(feed, &[1, 2, 3], Some("image/png")).await.unwrap();
        let (bytes, mime) = db.folder_image(feed).await.unwrap().unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(mime.as_deref(), Some("image/png"));
    }
}
