use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::process::{EventSink, Launcher, ProcessConfig, ProcessControl, ProcessEvent};
use crate::progress::{CategoryStatus, ProgressReporter, ProgressUpdate};
use crate::review::Category;
use crate::store::{MemoryStore, RecordStatus, RecordUpdate, ReviewRecord, ReviewStore};

/// Process handle that only counts termination requests.
pub struct FakeProcess {
    kills: Arc<AtomicUsize>,
}

impl ProcessControl for FakeProcess {
    fn terminate(&mut self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }
}

struct Launch {
    config: ProcessConfig,
    sink: EventSink,
    kills: Arc<AtomicUsize>,
}

/// Launcher that records every launch and lets tests drive each process's
/// events by hand.
#[derive(Default)]
pub struct ScriptedLauncher {
    fail: bool,
    launches: Mutex<Vec<Launch>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A launcher whose executable never exists.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    /// Index of the most recent launch for a category.
    pub fn last_index(&self, category: Category) -> Option<usize> {
        let prefix = format!("review:{category}");
        self.launches
            .lock()
            .unwrap()
            .iter()
            .rposition(|l| l.config.log_prefix == prefix)
    }

    pub fn emit_at(&self, index: usize, event: ProcessEvent) {
        let sink = Arc::clone(&self.launches.lock().unwrap()[index].sink);
        sink(event);
    }

    /// Emit an event from the most recent process of a category.
    pub fn emit(&self, category: Category, event: ProcessEvent) {
        let index = self.last_index(category).expect("category was launched");
        self.emit_at(index, event);
    }

    pub fn kills_at(&self, index: usize) -> usize {
        self.launches.lock().unwrap()[index]
            .kills
            .load(Ordering::SeqCst)
    }

    pub fn kills(&self, category: Category) -> usize {
        let index = self.last_index(category).expect("category was launched");
        self.kills_at(index)
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, config: ProcessConfig, sink: EventSink) -> Result<Box<dyn ProcessControl>> {
        if self.fail {
            return Err(Error::Process(format!(
                "failed to spawn '{}': No such file or directory (os error 2)",
                config.command
            )));
        }
        let kills = Arc::new(AtomicUsize::new(0));
        self.launches.lock().unwrap().push(Launch {
            config,
            sink,
            kills: Arc::clone(&kills),
        });
        Ok(Box::new(FakeProcess { kills }))
    }
}

/// Reporter that keeps every update.
#[derive(Default)]
pub struct RecordingReporter {
    updates: Mutex<Vec<ProgressUpdate>>,
}

impl RecordingReporter {
    pub fn first(&self) -> Option<ProgressUpdate> {
        self.updates.lock().unwrap().first().cloned()
    }

    pub fn last(&self) -> Option<ProgressUpdate> {
        self.updates.lock().unwrap().last().cloned()
    }

    /// Highest number of running categories seen in a single update.
    pub fn max_running(&self) -> usize {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|u| {
                u.categories
                    .iter()
                    .filter(|c| c.status == CategoryStatus::Running)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, update: &ProgressUpdate) {
        self.updates.lock().unwrap().push(update.clone());
    }
}

/// Store that hands out records but cannot write updates.
pub struct FailingStore;

impl ReviewStore for FailingStore {
    fn find(&self, _task_id: &str, _category: Category) -> Result<Option<ReviewRecord>> {
        Ok(None)
    }

    fn create(&self, task_id: &str, category: Category, started_at: u64) -> Result<ReviewRecord> {
        Ok(ReviewRecord {
            id: format!("rev-{category}"),
            task_id: task_id.to_string(),
            category,
            status: RecordStatus::InProgress,
            score: None,
            summary: None,
            findings: None,
            started_at,
            completed_at: None,
        })
    }

    fn update(&self, id: &str, _update: RecordUpdate) -> Result<()> {
        Err(Error::Store(format!("disk full while writing {id}")))
    }

    fn prune(&self, _task_id: &str, _keep: &[Category]) -> Result<usize> {
        Ok(0)
    }

    fn list(&self, _task_id: &str) -> Result<Vec<ReviewRecord>> {
        Ok(Vec::new())
    }
}

/// In-memory store that counts record lookups.
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryStore,
    finds: AtomicUsize,
}

impl CountingStore {
    pub fn finds(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }
}

impl ReviewStore for CountingStore {
    fn find(&self, task_id: &str, category: Category) -> Result<Option<ReviewRecord>> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        self.inner.find(task_id, category)
    }

    fn create(&self, task_id: &str, category: Category, started_at: u64) -> Result<ReviewRecord> {
        self.inner.create(task_id, category, started_at)
    }

    fn update(&self, id: &str, update: RecordUpdate) -> Result<()> {
        self.inner.update(id, update)
    }

    fn prune(&self, task_id: &str, keep: &[Category]) -> Result<usize> {
        self.inner.prune(task_id, keep)
    }

    fn list(&self, task_id: &str) -> Result<Vec<ReviewRecord>> {
        self.inner.list(task_id)
    }
}
