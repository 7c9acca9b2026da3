use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::review::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: String,
    pub task_id: String,
    pub category: Category,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Findings serialized as a JSON array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<String>,
    pub started_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl ReviewRecord {
    pub fn finding_count(&self) -> usize {
        self.findings
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<serde_json::Value>>(raw).ok())
            .map_or(0, |items| items.len())
    }
}

/// Overwrites every mutable field of a record. `started_at` is kept when `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub status: RecordStatus,
    pub score: Option<u8>,
    pub summary: Option<String>,
    pub findings: Option<String>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
}

impl RecordUpdate {
    /// Reset a record for a fresh review run.
    pub fn restart(started_at: u64) -> Self {
        Self {
            status: RecordStatus::InProgress,
            score: None,
            summary: None,
            findings: None,
            started_at: Some(started_at),
            completed_at: None,
        }
    }
}

/// Persistence collaborator for review records.
pub trait ReviewStore: Send {
    fn find(&self, task_id: &str, category: Category) -> Result<Option<ReviewRecord>>;

    /// Create an in-progress record.
    fn create(&self, task_id: &str, category: Category, started_at: u64) -> Result<ReviewRecord>;

    fn update(&self, id: &str, update: RecordUpdate) -> Result<()>;

    /// Delete the task's records whose category is not in `keep`.
    fn prune(&self, task_id: &str, keep: &[Category]) -> Result<usize>;

    /// All records for a task, in creation order.
    fn list(&self, task_id: &str) -> Result<Vec<ReviewRecord>>;
}

impl<T: ReviewStore + Sync> ReviewStore for Arc<T> {
    fn find(&self, task_id: &str, category: Category) -> Result<Option<ReviewRecord>> {
        (**self).find(task_id, category)
    }

    fn create(&self, task_id: &str, category: Category, started_at: u64) -> Result<ReviewRecord> {
        (**self).create(task_id, category, started_at)
    }

    fn update(&self, id: &str, update: RecordUpdate) -> Result<()> {
        (**self).update(id, update)
    }

    fn prune(&self, task_id: &str, keep: &[Category]) -> Result<usize> {
        (**self).prune(task_id, keep)
    }

    fn list(&self, task_id: &str) -> Result<Vec<ReviewRecord>> {
        (**self).list(task_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StoreData {
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub records: Vec<ReviewRecord>,
}

impl StoreData {
    fn find(&self, task_id: &str, category: Category) -> Option<ReviewRecord> {
        self.records
            .iter()
            .find(|r| r.task_id == task_id && r.category == category)
            .cloned()
    }

    fn create(&mut self, task_id: &str, category: Category, started_at: u64) -> ReviewRecord {
        self.next_id += 1;
        let record = ReviewRecord {
            id: format!("rev-{}", self.next_id),
            task_id: task_id.to_string(),
            category,
            status: RecordStatus::InProgress,
            score: None,
            summary: None,
            findings: None,
            started_at,
            completed_at: None,
        };
        self.records.push(record.clone());
        record
    }

    fn update(&mut self, id: &str, update: RecordUpdate) -> Result<()> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::Store(format!("no review record with id {id}")))?;
        record.status = update.status;
        record.score = update.score;
        record.summary = update.summary;
        record.findings = update.findings;
        record.completed_at = update.completed_at;
        if let Some(started_at) = update.started_at {
            record.started_at = started_at;
        }
        Ok(())
    }

    fn prune(&mut self, task_id: &str, keep: &[Category]) -> usize {
        let before = self.records.len();
        self.records
            .retain(|r| r.task_id != task_id || keep.contains(&r.category));
        before - self.records.len()
    }

    fn list(&self, task_id: &str) -> Vec<ReviewRecord> {
        self.records
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect()
    }
}

/// In-memory store, used by tests and embedders without durable storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| Error::Store("record store lock poisoned".to_string()))?;
        f(&mut data)
    }
}

impl ReviewStore for MemoryStore {
    fn find(&self, task_id: &str, category: Category) -> Result<Option<ReviewRecord>> {
        self.with_data(|data| Ok(data.find(task_id, category)))
    }

    fn create(&self, task_id: &str, category: Category, started_at: u64) -> Result<ReviewRecord> {
        self.with_data(|data| Ok(data.create(task_id, category, started_at)))
    }

    fn update(&self, id: &str, update: RecordUpdate) -> Result<()> {
        self.with_data(|data| data.update(id, update))
    }

    fn prune(&self, task_id: &str, keep: &[Category]) -> Result<usize> {
        self.with_data(|data| Ok(data.prune(task_id, keep)))
    }

    fn list(&self, task_id: &str) -> Result<Vec<ReviewRecord>> {
        self.with_data(|data| Ok(data.list(task_id)))
    }
}

/// Records persisted as a single TOML file, loaded and rewritten per operation.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default store location relative to a working directory.
    pub fn default_path(root: &Path) -> PathBuf {
        root.join(".review-pool").join("reviews.toml")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load records from disk. Returns empty data if the file is missing or corrupted.
    pub fn load(&self) -> StoreData {
        if !self.path.exists() {
            return StoreData::default();
        }

        match std::fs::read_to_string(&self.path) {
            Ok(content) => match toml::from_str::<StoreData>(&content) {
                Ok(data) => data,
                Err(e) => {
                    warn!("corrupted record file {}: {e}, resetting", self.path.display());
                    StoreData::default()
                }
            },
            Err(e) => {
                warn!(
                    "failed to read record file {}: {e}, resetting",
                    self.path.display()
                );
                StoreData::default()
            }
        }
    }

    pub fn save(&self, data: &StoreData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Store(format!("failed to create store dir: {e}")))?;
        }

        let content = toml::to_string_pretty(data)
            .map_err(|e| Error::Store(format!("failed to serialize records: {e}")))?;

        std::fs::write(&self.path, content)
            .map_err(|e| Error::Store(format!("failed to write record file: {e}")))?;

        Ok(())
    }

    fn modify<T>(&self, f: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut data = self.load();
        let out = f(&mut data)?;
        self.save(&data)?;
        Ok(out)
    }
}

impl ReviewStore for FileStore {
    fn find(&self, task_id: &str, category: Category) -> Result<Option<ReviewRecord>> {
        Ok(self.load().find(task_id, category))
    }

    fn create(&self, task_id: &str, category: Category, started_at: u64) -> Result<ReviewRecord> {
        self.modify(|data| Ok(data.create(task_id, category, started_at)))
    }

    fn update(&self, id: &str, update: RecordUpdate) -> Result<()> {
        self.modify(|data| data.update(id, update))
    }

    fn prune(&self, task_id: &str, keep: &[Category]) -> Result<usize> {
        self.modify(|data| Ok(data.prune(task_id, keep)))
    }

    fn list(&self, task_id: &str) -> Result<Vec<ReviewRecord>> {
        Ok(self.load().list(task_id))
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("state").join("reviews.toml"));
        (dir, store)
    }

    fn completed(score: u8) -> RecordUpdate {
        RecordUpdate {
            status: RecordStatus::Completed,
            score: Some(score),
            summary: Some("fine".to_string()),
            findings: Some(r#"[{"severity":"low","title":"a","description":"b"}]"#.to_string()),
            started_at: None,
            completed_at: Some(1_700_000_100),
        }
    }

    #[test]
    fn test_load_empty_returns_default() {
        let (_dir, store) = test_store();
        assert_eq!(store.load(), StoreData::default());
    }

    #[test]
    fn test_create_and_find() {
        let (_dir, store) = test_store();
        let record = store.create("task-1", Category::Security, 1_700_000_000).unwrap();
        assert_eq!(record.status, RecordStatus::InProgress);

        let found = store.find("task-1", Category::Security).unwrap().unwrap();
        assert_eq!(found, record);
        assert!(store.find("task-1", Category::Quality).unwrap().is_none());
        assert!(store.find("task-2", Category::Security).unwrap().is_none());
    }

    #[test]
    fn test_update_overwrites_fields() {
        let (_dir, store) = test_store();
        let record = store.create("task-1", Category::Quality, 1_700_000_000).unwrap();
        store.update(&record.id, completed(90)).unwrap();

        let found = store.find("task-1", Category::Quality).unwrap().unwrap();
        assert_eq!(found.status, RecordStatus::Completed);
        assert_eq!(found.score, Some(90));
        assert_eq!(found.finding_count(), 1);
        assert_eq!(found.started_at, 1_700_000_000);

        // Same update again leaves the same record
        store.update(&record.id, completed(90)).unwrap();
        assert_eq!(store.find("task-1", Category::Quality).unwrap().unwrap(), found);

        store.update(&record.id, RecordUpdate::restart(1_700_000_500)).unwrap();
        let reset = store.find("task-1", Category::Quality).unwrap().unwrap();
        assert_eq!(reset.status, RecordStatus::InProgress);
        assert_eq!(reset.score, None);
        assert_eq!(reset.finding_count(), 0);
        assert_eq!(reset.started_at, 1_700_000_500);
    }

    #[test]
    fn test_update_unknown_id_errors() {
        let (_dir, store) = test_store();
        let err = store.update("rev-404", completed(1)).unwrap_err();
        assert!(err.to_string().contains("no review record"));
    }

    #[test]
    fn test_prune_keeps_listed_categories_and_other_tasks() {
        let store = MemoryStore::new();
        store.create("task-1", Category::Security, 1).unwrap();
        store.create("task-1", Category::Quality, 1).unwrap();
        store.create("task-1", Category::Research, 1).unwrap();
        store.create("task-2", Category::Research, 1).unwrap();

        let removed = store.prune("task-1", &[Category::Security]).unwrap();
        assert_eq!(removed, 2);

        let remaining: Vec<Category> = store
            .list("task-1")
            .unwrap()
            .into_iter()
            .map(|r| r.category)
            .collect();
        assert_eq!(remaining, vec![Category::Security]);
        assert_eq!(store.list("task-2").unwrap().len(), 1);
    }

    #[test]
    fn test_corrupted_file_returns_default() {
        let (_dir, store) = test_store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "this is not valid toml [[[").unwrap();
        assert_eq!(store.load(), StoreData::default());
    }

    #[test]
    fn test_records_survive_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reviews.toml");

        let id = {
            let store = FileStore::new(&path);
            let record = store.create("task-9", Category::Performance, 5).unwrap();
            store.update(&record.id, completed(75)).unwrap();
            record.id
        };

        let store = FileStore::new(&path);
        let records = store.list("task-9").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].score, Some(75));

        // Ids keep increasing across reloads
        let next = store.create("task-9", Category::Security, 6).unwrap();
        assert_ne!(next.id, id);
    }

    #[test]
    fn test_finding_count_tolerates_garbage() {
        let mut record = MemoryStore::new().create("t", Category::Security, 0).unwrap();
        record.findings = Some("not json".to_string());
        assert_eq!(record.finding_count(), 0);
    }
}
