use std::collections::HashMap;

use super::schema::Database;
use super::types::DatabaseError;
use crate::model::{FolderId, FolderType};

impl Database {
    /// Rebuild the database file, reclaiming space left by purges.
    ///
    /// Waits for every open write transaction and blocks new ones until done.
    pub async fn compact(&self) -> Result<(), DatabaseError> {
        let _exclusive = self.exclusive().await?;
        let started = std::time::Instant::now();
        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "database compacted");
        Ok(())
    }

    /// Rebuild every index, then run SQLite's integrity check.
    ///
    /// Returns the problems reported, empty when the file is sound.
    pub async fn reindex(&self) -> Result<Vec<String>, DatabaseError> {
        let _exclusive = self.exclusive().await?;
        sqlx::query("REINDEX")
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let rows: Vec<(String,)> = sqlx::query_as("PRAGMA integrity_check")
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let problems: Vec<String> = rows
            .into_iter()
            .map(|(line,)| line)
            .filter(|line| line != "ok")
            .collect();
        if problems.is_empty() {
            tracing::info!("database reindexed");
        } else {
            tracing::error!(count = problems.len(), first = %problems[0], "integrity check failed");
        }
        Ok(problems)
    }

    /// Recompute every folder's unread counters from the articles table and
    /// store the ones that drifted. Returns how many folders were corrected.
    pub async fn recount_unread(&self) -> Result<usize, DatabaseError> {
        let mut w = self.begin_write().await?;
        let folders: Vec<(FolderId, FolderId, i64, i64, i64)> = sqlx::query_as(
            "SELECT id, parent_id, folder_type, unread_count, child_unread_count FROM folders",
        )
        .fetch_all(&mut *w.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        let counts: Vec<(FolderId, i64)> = sqlx::query_as(
            "SELECT folder_id, COUNT(*) FROM articles WHERE read = 0 AND deleted = 0 GROUP BY folder_id",
        )
        .fetch_all(&mut *w.tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        let counts: HashMap<FolderId, i64> = counts.into_iter().collect();
        let parents: HashMap<FolderId, FolderId> =
            folders.iter().map(|(id, parent, ..)| (*id, *parent)).collect();

        let mut own: HashMap<FolderId, i64> = HashMap::new();
        let mut child: HashMap<FolderId, i64> = HashMap::new();
        for (id, _, code, ..) in &folders {
            let is_feed = FolderType::from_code(*code).is_some_and(FolderType::is_feed);
            let unread = if is_feed {
                counts.get(id).copied().unwrap_or(0)
            } else {
                0
            };
            own.insert(*id, unread);
            if unread == 0 {
                continue;
            }
            // Walk up at most once per folder so a corrupt parent chain terminates.
            let mut parent = parents.get(id).copied();
            let mut steps = 0;
            while let Some(p) = parent.filter(|p| parents.contains_key(p)) {
                *child.entry(p).or_default() += unread;
                steps += 1;
                if steps > folders.len() {
                    break;
                }
                parent = parents.get(&p).copied();
            }
        }

        let mut corrected = 0usize;
        for (id, _, _, stored_own, stored_child) in &folders {
            let want_own = own.get(id).copied().unwrap_or(0);
            let want_child = child.get(id).copied().unwrap_or(0);
            if want_own == *stored_own && want_child == *stored_child {
                continue;
            }
            tracing::warn!(
                folder_id = id,
                stored = stored_own,
                actual = want_own,
                stored_child,
                actual_child = want_child,
                "unread count drifted"
            );
            sqlx::query("UPDATE folders SET unread_count = ?, child_unread_count = ? WHERE id = ?")
                .bind(want_own)
                .bind(want_child)
                .bind(id)
                .execute(&mut *w.tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            corrected += 1;
        }
        w.commit().await?;

        if corrected > 0 {
            self.cache.invalidate();
        }
        Ok(corrected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InsertPosition, ParsedArticle, ROOT_FOLDER_ID};

    fn article(guid: &str) -> ParsedArticle {
        ParsedArticle {
            guid: guid.into(),
            title: guid.into(),
            date: chrono::Utc::now().timestamp(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_recount_repairs_drift() {
        let db = Database::open(":memory:").await.unwrap();
        let g = db
            .add_folder(ROOT_FOLDER_ID, InsertPosition::Last, "G", FolderType::Group, false)
            .await
            .unwrap();
        let f = db.add_rss_folder(g, Some("F"), "https://f.example/", None).await.unwrap();
        db.merge_articles(f, &[article("1"), article("2")]).await.unwrap();
        assert_eq!(db.recount_unread().await.unwrap(), 0);

        sqlx::query("UPDATE folders SET unread_count = 9 WHERE id = ?")
            .bind(f)
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query("UPDATE folders SET child_unread_count = 0 WHERE id = ?")
            .bind(g)
            .execute(&db.pool)
            .await
            .unwrap();
        db.cache.invalidate();

        assert_eq!(db.recount_unread().await.unwrap(), 2);
        let folder = db.folder(f).await.unwrap().unwrap();
        assert_eq!(folder.unread_count, 2);
        assert_eq!(db.folder(g).await.unwrap().unwrap().child_unread_count, 2);
        assert_eq!(db.folder(ROOT_FOLDER_ID).await.unwrap().unwrap().child_unread_count, 2);
    }

    #[tokio::test]
    async fn test_compact_and_reindex() {
        let db = Database::open(":memory:").await.unwrap();
        db.compact().await.unwrap();
        assert!(db.reindex().await.unwrap().is_empty());
    }
}
