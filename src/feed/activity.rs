//! Per-folder refresh log shown by collaborators as an activity window.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::model::FolderId;
use crate::storage::{EventBus, StoreEvent};

/// Detail lines kept per folder.
const MAX_DETAILS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    pub folder_id: FolderId,
    pub name: String,
    /// Latest one-line status, e.g. "3 new articles".
    pub status: String,
    /// Older status lines, newest last.
    pub details: Vec<String>,
    pub updated: DateTime<Utc>,
}

pub struct ActivityLog {
    entries: Mutex<HashMap<FolderId, ActivityEntry>>,
    events: EventBus,
}

impl ActivityLog {
    pub fn new(events: EventBus) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FolderId, ActivityEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the folder's status line, pushing the previous one into details.
    pub fn record(&self, folder_id: FolderId, name: &str, status: impl Into<String>) {
        let status = status.into();
        {
            let mut entries = self.lock();
            let entry = entries.entry(folder_id).or_insert_with(|| ActivityEntry {
                folder_id,
                name: name.to_string(),
                status: String::new(),
                details: Vec::new(),
                updated: Utc::now(),
            });
            if !entry.status.is_empty() {
                let previous = std::mem::take(&mut entry.status);
                entry.details.push(previous);
                if entry.details.len() > MAX_DETAILS {
                    entry.details.remove(0);
                }
            }
            entry.name = name.to_string();
            entry.status = status;
            entry.updated = Utc::now();
        }
        self.events.emit(StoreEvent::ActivityLogUpdated(folder_id));
    }

    pub fn entry(&self, folder_id: FolderId) -> Option<ActivityEntry> {
        self.lock().get(&folder_id).cloned()
    }

    /// All entries, most recently updated first.
    pub fn entries(&self) -> Vec<ActivityEntry> {
        let mut all: Vec<ActivityEntry> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| b.updated.cmp(&a.updated).then(a.folder_id.cmp(&b.folder_id)));
        all
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_keeps_history_and_notifies() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let log = ActivityLog::new(bus);

        log.record(4, "Feed", "Connecting");
        log.record(4, "Feed", "2 new articles");

        let entry = log.entry(4).unwrap();
        assert_eq!(entry.status, "2 new articles");
        assert_eq!(entry.details, vec!["Connecting".to_string()]);
        assert_eq!(rx.recv().await.unwrap(), StoreEvent::ActivityLogUpdated(4));
    }

    #[test]
    fn test_details_are_bounded() {
        let log = ActivityLog::new(EventBus::new());
        for i in 0..50 {
            log.record(1, "F", format!("line {i}"));
        }
        let entry = log.entry(1).unwrap();
        assert_eq!(entry.details.len(), MAX_DETAILS);
        assert_eq!(entry.details.last().map(String::as_str), Some("line 48"));
    }
}
