//! In-memory read-through view of the folder table.
//!
//! Readers take an `Arc<FolderSnapshot>` and keep a complete, immutable
//! generation for as long as they hold it. Mutations only drop the current
//! generation; the next reader rebuilds it from the store. Session flags live
//! here and nowhere else.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;

use crate::model::{Article, Folder, FolderId, SessionFlags};

/// Number of folders whose unfiltered article list is kept.
const ARTICLE_LIST_CAPACITY: usize = 32;

/// One immutable generation of the folder tree, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct FolderSnapshot {
    pub generation: u64,
    pub folders: HashMap<FolderId, Folder>,
}

impl FolderSnapshot {
    pub fn get(&self, id: FolderId) -> Option<&Folder> {
        self.folders.get(&id)
    }

    pub fn len(&self) -> usize {
        self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    /// Direct children of `parent` in sibling-link order.
    ///
    /// Stops on a revisited id so a corrupt link chain cannot loop forever.
    pub fn children_linked(&self, parent: FolderId) -> Vec<&Folder> {
        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut next = self.get(parent).map_or(0, |p| p.first_child_id);
        while next != crate::model::NO_FOLDER && seen.insert(next) {
            match self.get(next) {
                Some(f) if f.parent_id == parent => {
                    out.push(f);
                    next = f.next_sibling_id;
                }
                _ => break,
            }
        }
        out
    }

    /// Ids of `root` and every folder below it.
    pub fn subtree_ids(&self, root: FolderId) -> Vec<FolderId> {
        let mut out = vec![root];
        let mut seen = std::collections::HashSet::from([root]);
        let mut i = 0;
        while i < out.len() {
            let id = out[i];
            let children: Vec<FolderId> = self
                .folders
                .values()
                .filter(|f| f.parent_id == id && !seen.contains(&f.id))
                .map(|f| f.id)
                .collect();
            for child in children {
                seen.insert(child);
                out.push(child);
            }
            i += 1;
        }
        out
    }

    pub fn find_by_feed_url(&self, url: &str) -> Option<&Folder> {
        self.folders
            .values()
            .find(|f| f.feed_url.as_deref() == Some(url))
    }

    pub fn find_by_remote_id(&self, remote_id: &str) -> Option<&Folder> {
        self.folders
            .values()
            .find(|f| f.remote_id.as_deref() == Some(remote_id))
    }
}

#[derive(Clone)]
pub struct FolderCache {
    snapshot: Arc<RwLock<Option<Arc<FolderSnapshot>>>>,
    /// Bumped on every invalidation; a load started under an older epoch is
    /// returned to its caller but not installed.
    epoch: Arc<AtomicU64>,
    generation: Arc<AtomicU64>,
    session: Arc<Mutex<HashMap<FolderId, SessionFlags>>>,
    articles: Arc<Mutex<ArticleLists>>,
}

/// Recently read article lists. `epoch` counts invalidations so a query
/// that raced a write is not cached.
struct ArticleLists {
    epoch: u64,
    lists: LruCache<FolderId, Arc<Vec<Article>>>,
}

impl FolderCache {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(ARTICLE_LIST_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            snapshot: Arc::new(RwLock::new(None)),
            epoch: Arc::new(AtomicU64::new(0)),
            generation: Arc::new(AtomicU64::new(0)),
            session: Arc::new(Mutex::new(HashMap::new())),
            articles: Arc::new(Mutex::new(ArticleLists {
                epoch: 0,
                lists: LruCache::new(capacity),
            })),
        }
    }

    pub(crate) fn current(&self) -> Option<Arc<FolderSnapshot>> {
        self.snapshot.read().ok().and_then(|s| s.clone())
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Install a folder list loaded under `epoch` as the next generation,
    /// overlaying the current session flags.
    pub(crate) fn install(&self, epoch: u64, folders: Vec<Folder>) -> Arc<FolderSnapshot> {
        let session = self.session.lock().map(|s| s.clone()).unwrap_or_default();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let folders = folders
            .into_iter()
            .map(|mut f| {
                f.session = session.get(&f.id).copied().unwrap_or_default();
                (f.id, f)
            })
            .collect();
        let snapshot = Arc::new(FolderSnapshot {
            generation,
            folders,
        });
        if let Ok(mut slot) = self.snapshot.write() {
            if self.epoch.load(Ordering::Acquire) == epoch {
                *slot = Some(snapshot.clone());
            }
        }
        snapshot
    }

    /// Drop the folder generation and every cached article list.
    pub(crate) fn invalidate(&self) {
        self.drop_snapshot();
        self.invalidate_articles();
    }

    fn drop_snapshot(&self) {
        if let Ok(mut slot) = self.snapshot.write() {
            self.epoch.fetch_add(1, Ordering::AcqRel);
            *slot = None;
        }
    }

    pub(crate) fn invalidate_articles(&self) {
        if let Ok(mut cached) = self.articles.lock() {
            cached.epoch += 1;
            cached.lists.clear();
        }
    }

    pub(crate) fn article_epoch(&self) -> u64 {
        self.articles.lock().map(|c| c.epoch).unwrap_or(u64::MAX)
    }

    pub(crate) fn cached_articles(&self, folder_id: FolderId) -> Option<Arc<Vec<Article>>> {
        self.articles.lock().ok()?.lists.get(&folder_id).cloned()
    }

    /// Cache a list queried under `epoch`, unless the articles were
    /// invalidated since.
    pub(crate) fn store_articles_if(
        &self,
        epoch: u64,
        folder_id: FolderId,
        articles: Arc<Vec<Article>>,
    ) -> bool {
        match self.articles.lock() {
            Ok(mut cached) if cached.epoch == epoch => {
                cached.lists.put(folder_id, articles);
                true
            }
            _ => false,
        }
    }

    pub fn session_flags(&self, folder_id: FolderId) -> SessionFlags {
        self.session
            .lock()
            .ok()
            .and_then(|s| s.get(&folder_id).copied())
            .unwrap_or_default()
    }

    /// Update a folder's session flags. Returns true when they changed.
    pub(crate) fn update_session(
        &self,
        folder_id: FolderId,
        update: impl FnOnce(&mut SessionFlags),
    ) -> bool {
        let changed = match self.session.lock() {
            Ok(mut map) => {
                let entry = map.entry(folder_id).or_default();
                let before = *entry;
                update(entry);
                before != *entry
            }
            Err(_) => false,
        };
        if changed {
            // Session flags are overlaid at install time, so the generation is stale.
            self.drop_snapshot();
        }
        changed
    }

    pub(crate) fn clear_session(&self, folder_id: FolderId) {
        if let Ok(mut map) = self.session.lock() {
            map.remove(&folder_id);
        }
    }
}

impl Default for FolderCache {
    fn default() -> Self {
        Self::new()
    }
}
