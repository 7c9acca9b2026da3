use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::review::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverallStatus::Pending => write!(f, "pending"),
            OverallStatus::InProgress => write!(f, "in_progress"),
            OverallStatus::Completed => write!(f, "completed"),
            OverallStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Status of one category within a task. `Pending` means queued for capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl CategoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryStatus::Pending => "pending",
            CategoryStatus::Running => "running",
            CategoryStatus::Completed => "completed",
            CategoryStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySummary {
    pub category: Category,
    pub status: CategoryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    /// Final summary for finished reviews, latest status message while running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub finding_count: usize,
}

/// Aggregated review state of one task, computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReviewState {
    pub status: OverallStatus,
    pub categories: Vec<CategorySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_score: Option<u8>,
}

impl TaskReviewState {
    pub fn pending() -> Self {
        Self {
            status: OverallStatus::Pending,
            categories: Vec::new(),
            average_score: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activity {
    pub category: Category,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Activity {
    pub fn now(category: Category, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            category,
            message: message.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub status: OverallStatus,
    pub categories: Vec<CategorySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_score: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_activity: Option<Activity>,
}

impl ProgressUpdate {
    pub fn new(task_id: &str, state: TaskReviewState, activity: Option<Activity>) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: state.status,
            categories: state.categories,
            overall_score: state.average_score,
            current_activity: activity,
        }
    }
}

impl ProgressUpdate {
    /// One human-readable line, as printed by the command-line runner.
    pub fn render_line(&self) -> String {
        if let Some(activity) = &self.current_activity {
            return format!("[review:{}] {}", activity.category, activity.message);
        }
        let categories = self
            .categories
            .iter()
            .map(|c| match (c.status, c.score) {
                (CategoryStatus::Completed, Some(score)) => format!("{} {score}", c.category),
                (status, _) => format!("{} {}", c.category, status.as_str()),
            })
            .collect::<Vec<_>>()
            .join(", ");
        match self.overall_score {
            Some(score) => format!(
                "[review-pool] {} {}: {categories} (average {score})",
                self.task_id, self.status
            ),
            None => format!("[review-pool] {} {}: {categories}", self.task_id, self.status),
        }
    }
}

/// Observer for progress notifications.
pub trait ProgressReporter: Send {
    fn report(&self, update: &ProgressUpdate);
}

impl<T: ProgressReporter + Sync> ProgressReporter for Arc<T> {
    fn report(&self, update: &ProgressUpdate) {
        (**self).report(update);
    }
}

/// Reporter that only logs.
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn report(&self, update: &ProgressUpdate) {
        match &update.current_activity {
            Some(activity) => info!(
                task_id = update.task_id,
                status = %update.status,
                category = %activity.category,
                "{}",
                activity.message
            ),
            None => info!(
                task_id = update.task_id,
                status = %update.status,
                score = ?update.overall_score,
                "review progress"
            ),
        }
    }
}

/// Reporter that fans updates out over a tokio broadcast channel.
pub struct BroadcastReporter {
    tx: broadcast::Sender<ProgressUpdate>,
}

impl BroadcastReporter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.tx.subscribe()
    }
}

impl ProgressReporter for BroadcastReporter {
    fn report(&self, update: &ProgressUpdate) {
        if self.tx.send(update.clone()).is_err() {
            debug!(task_id = update.task_id, "no progress subscribers");
        }
    }
}
