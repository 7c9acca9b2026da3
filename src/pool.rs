use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{
    Agent, AgentEvent, AgentId, AgentOutcome, AgentStatus, AgentTimeouts, AgentUpdate,
    EventSender, FailureReason, PoolEvent,
};
use crate::error::{Error, Result};
use crate::process::{EventSink, Launcher, ProcessEvent};
use crate::progress::{
    Activity, CategoryStatus, CategorySummary, OverallStatus, ProgressReporter, ProgressUpdate,
    TaskReviewState,
};
use crate::prompts::PromptEngine;
use crate::review::{Category, ReviewRequest};
use crate::runner::AnalysisCommand;
use crate::store::{RecordStatus, RecordUpdate, ReviewStore, unix_now};

pub struct PoolConfig {
    /// Global ceiling on concurrently running agents.
    pub max_concurrent: usize,
    pub timeouts: AgentTimeouts,
    pub command: AnalysisCommand,
    pub prompts: PromptEngine,
}

/// One batch of category reviews for a task.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub task_id: String,
    pub working_dir: PathBuf,
    pub task_description: String,
    pub changed_files: Vec<String>,
    pub categories: Vec<Category>,
}

impl BatchRequest {
    fn request_for(&self, category: Category) -> ReviewRequest {
        ReviewRequest {
            task_id: self.task_id.clone(),
            category,
            working_dir: self.working_dir.clone(),
            task_description: self.task_description.clone(),
            changed_files: self.changed_files.clone(),
        }
    }
}

/// A review waiting for capacity.
struct PendingReview {
    request: ReviewRequest,
    record_id: Option<String>,
}

/// The current tracking set of one task.
#[derive(Default)]
struct TaskEntry {
    /// Categories in batch order.
    categories: Vec<Category>,
    agents: HashMap<Category, AgentId>,
}

/// Owns every agent and mutates them only from its operations and
/// [`ReviewPool::handle_event`], on a single task.
pub struct ReviewPool<L, S, P> {
    config: PoolConfig,
    launcher: L,
    store: S,
    reporter: P,
    events: EventSender,
    agents: HashMap<AgentId, Agent>,
    tasks: HashMap<String, TaskEntry>,
    pending: VecDeque<PendingReview>,
    running: usize,
    next_agent_id: u64,
}

impl<L: Launcher, S: ReviewStore, P: ProgressReporter> ReviewPool<L, S, P> {
    /// Create a pool and the receiving end of its event channel.
    ///
    /// Every event read from the receiver must be passed back to
    /// [`ReviewPool::handle_event`]; [`ReviewPool::spawn`] does this.
    pub fn new(
        config: PoolConfig,
        launcher: L,
        store: S,
        reporter: P,
    ) -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let pool = Self {
            config,
            launcher,
            store,
            reporter,
            events,
            agents: HashMap::new(),
            tasks: HashMap::new(),
            pending: VecDeque::new(),
            running: 0,
            next_agent_id: 0,
        };
        (pool, rx)
    }

    pub fn running_count(&self) -> usize {
        self.running
    }

    pub fn queued_count(&self) -> usize {
        self.pending.len()
    }

    /// Status of the current agent for a task's category, if one is tracked.
    pub fn agent_status(&self, task_id: &str, category: Category) -> Option<AgentStatus> {
        let id = self.tasks.get(task_id)?.agents.get(&category)?;
        self.agents.get(id).map(Agent::status)
    }

    /// Start reviews for every requested category, replacing any prior batch
    /// for the same task.
    ///
    /// Categories beyond the concurrency ceiling are queued and started as
    /// capacity frees. Duplicate categories are collapsed.
    pub fn start_batch(&mut self, batch: BatchRequest) -> TaskReviewState {
        let mut categories = Vec::with_capacity(batch.categories.len());
        for category in &batch.categories {
            if !categories.contains(category) {
                categories.push(*category);
            }
        }

        let superseded = self.discard_task(&batch.task_id, FailureReason::Superseded);
        if superseded > 0 {
            info!(task_id = batch.task_id, superseded, "replaced running reviews");
        }

        match self.store.prune(&batch.task_id, &categories) {
            Ok(0) => {}
            Ok(pruned) => debug!(task_id = batch.task_id, pruned, "pruned stale review records"),
            Err(e) => warn!(task_id = batch.task_id, error = %e, "failed to prune review records"),
        }

        if categories.is_empty() {
            self.fill_capacity();
            return self.status(&batch.task_id);
        }

        info!(
            task_id = batch.task_id,
            categories = ?categories,
            running = self.running,
            max_concurrent = self.config.max_concurrent,
            "starting review batch"
        );

        for category in &categories {
            let record_id = self.prepare_record(&batch.task_id, *category);
            self.pending.push_back(PendingReview {
                request: batch.request_for(*category),
                record_id,
            });
        }
        self.tasks.insert(
            batch.task_id.clone(),
            TaskEntry {
                categories,
                agents: HashMap::new(),
            },
        );

        self.report(&batch.task_id, None);
        self.fill_capacity();
        self.status(&batch.task_id)
    }

    /// Cancel every review of a task and stop tracking it.
    ///
    /// Returns the number of running agents that were cancelled.
    pub fn cancel(&mut self, task_id: &str) -> usize {
        if !self.tasks.contains_key(task_id) {
            debug!(task_id, "nothing to cancel");
            return 0;
        }
        let cancelled = self.discard_task(task_id, FailureReason::Cancelled);
        info!(task_id, cancelled, "cancelled reviews");
        self.report(task_id, None);
        self.fill_capacity();
        cancelled
    }

    /// Cancel everything. Used when the pool shuts down.
    pub fn cancel_all(&mut self) -> usize {
        let task_ids: Vec<String> = self.tasks.keys().cloned().collect();
        task_ids
            .iter()
            .map(|task_id| self.discard_task(task_id, FailureReason::Cancelled))
            .sum()
    }

    /// Aggregate state of a task's currently tracked reviews, with finished
    /// categories read back from the store.
    pub fn status(&self, task_id: &str) -> TaskReviewState {
        self.task_state(task_id, true)
    }

    fn task_state(&self, task_id: &str, read_store: bool) -> TaskReviewState {
        let Some(entry) = self.tasks.get(task_id) else {
            return TaskReviewState::pending();
        };

        let categories: Vec<CategorySummary> = entry
            .categories
            .iter()
            .map(|category| match entry.agents.get(category).and_then(|id| self.agents.get(id)) {
                Some(agent) => self.summarize(agent, read_store),
                None => CategorySummary {
                    category: *category,
                    status: CategoryStatus::Pending,
                    score: None,
                    summary: None,
                    finding_count: 0,
                },
            })
            .collect();

        aggregate(categories)
    }

    /// Apply an event from a subprocess or timer.
    pub fn handle_event(&mut self, event: PoolEvent) {
        let timeouts = self.config.timeouts;
        let Some(agent) = self.agents.get_mut(&event.agent_id) else {
            debug!(agent_id = %event.agent_id, "event for untracked agent");
            return;
        };

        let Some(update) = agent.handle(event.event, &timeouts) else {
            return;
        };
        let task_id = agent.task_id().to_string();
        let category = agent.category();

        match update {
            AgentUpdate::Started => self.report(&task_id, None),
            AgentUpdate::Activity(messages) => {
                for message in messages {
                    self.report(&task_id, Some(Activity::now(category, message)));
                }
            }
            AgentUpdate::Finished => {
                self.running = self.running.saturating_sub(1);
                self.persist_outcome(event.agent_id);
                self.report(&task_id, None);
                self.fill_capacity();
            }
        }
    }

    fn next_id(&mut self) -> AgentId {
        self.next_agent_id += 1;
        AgentId::new(self.next_agent_id)
    }

    /// Reuse the (task, category) record when one exists, otherwise create it.
    fn prepare_record(&self, task_id: &str, category: Category) -> Option<String> {
        let started_at = unix_now();
        let result = self.store.find(task_id, category).and_then(|existing| match existing {
            Some(record) => self
                .store
                .update(&record.id, RecordUpdate::restart(started_at))
                .map(|()| record.id),
            None => self
                .store
                .create(task_id, category, started_at)
                .map(|record| record.id),
        });
        match result {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(task_id, category = %category, error = %e, "failed to prepare review record");
                None
            }
        }
    }

    /// Start queued reviews while there is capacity.
    fn fill_capacity(&mut self) {
        while self.running < self.config.max_concurrent {
            let Some(next) = self.pending.pop_front() else {
                break;
            };
            self.launch(next);
        }
    }

    fn launch(&mut self, pending: PendingReview) {
        let id = self.next_id();
        let task_id = pending.request.task_id.clone();
        let category = pending.request.category;
        let mut agent = Agent::new(id, pending.request, pending.record_id, self.events.clone());

        if let Some(entry) = self.tasks.get_mut(&task_id) {
            entry.agents.insert(category, id);
        }

        let prompt = match self.config.prompts.render_review(agent.request()) {
            Ok(prompt) => prompt,
            Err(e) => {
                agent.fail(FailureReason::InstructionFailed(e.to_string()));
                self.agents.insert(id, agent);
                self.persist_outcome(id);
                self.report(&task_id, None);
                return;
            }
        };

        agent.start(&self.config.timeouts);
        self.running += 1;

        let process_config = self.config.command.process_config(agent.request(), &prompt);
        let sink = event_sink(self.events.clone(), id);
        info!(agent_id = %id, task_id, category = %category, command = process_config.command, "launching analysis");

        match self.launcher.launch(process_config, sink) {
            Ok(process) => {
                agent.attach_process(process);
                self.agents.insert(id, agent);
                self.report(&task_id, None);
            }
            Err(e) => {
                agent.fail(FailureReason::SpawnFailed(e.to_string()));
                self.running = self.running.saturating_sub(1);
                self.agents.insert(id, agent);
                self.persist_outcome(id);
                self.report(&task_id, None);
            }
        }
    }

    /// Drop a task's tracking set, failing its running agents and its queue.
    fn discard_task(&mut self, task_id: &str, reason: FailureReason) -> usize {
        let mut failed = 0;
        if let Some(entry) = self.tasks.remove(task_id) {
            for id in entry.agents.values() {
                let Some(mut agent) = self.agents.remove(id) else {
                    continue;
                };
                if agent.fail(reason.clone()) {
                    self.running = self.running.saturating_sub(1);
                    failed += 1;
                    self.persist(&agent);
                }
            }
        }

        let mut dropped = Vec::new();
        self.pending.retain(|queued| {
            if queued.request.task_id == task_id {
                dropped.push(queued.record_id.clone());
                false
            } else {
                true
            }
        });
        for record_id in dropped.into_iter().flatten() {
            self.write_record(
                &record_id,
                RecordUpdate {
                    status: RecordStatus::Failed,
                    score: None,
                    summary: Some(reason.to_string()),
                    findings: None,
                    started_at: None,
                    completed_at: Some(unix_now()),
                },
            );
        }

        failed
    }

    fn persist_outcome(&self, id: AgentId) {
        if let Some(agent) = self.agents.get(&id) {
            self.persist(agent);
        }
    }

    /// Write a finished agent's outcome to its record. Failures are logged only.
    fn persist(&self, agent: &Agent) {
        let (Some(record_id), Some(outcome)) = (agent.record_id(), agent.outcome()) else {
            return;
        };

        let update = match outcome {
            AgentOutcome::Completed { result, .. } => RecordUpdate {
                status: RecordStatus::Completed,
                score: Some(result.score.clamp(0, 100) as u8),
                summary: agent.summary(),
                findings: match serde_json::to_string(&result.findings) {
                    Ok(json) => Some(json),
                    Err(e) => {
                        warn!(agent_id = %agent.id(), error = %e, "failed to serialize findings");
                        None
                    }
                },
                started_at: None,
                completed_at: Some(unix_now()),
            },
            AgentOutcome::Failed(_) => RecordUpdate {
                status: RecordStatus::Failed,
                score: None,
                summary: agent.summary(),
                findings: None,
                started_at: None,
                completed_at: Some(unix_now()),
            },
        };
        self.write_record(record_id, update);
    }

    fn write_record(&self, record_id: &str, update: RecordUpdate) {
        if let Err(e) = self.store.update(record_id, update) {
            warn!(record_id, error = %e, "failed to persist review record");
        }
    }

    fn summarize(&self, agent: &Agent, read_store: bool) -> CategorySummary {
        let category = agent.category();
        let status = match agent.status() {
            AgentStatus::Running => {
                return CategorySummary {
                    category,
                    status: CategoryStatus::Running,
                    score: None,
                    summary: agent.current_message().map(str::to_string),
                    finding_count: 0,
                };
            }
            AgentStatus::Completed => CategoryStatus::Completed,
            AgentStatus::Failed => CategoryStatus::Failed,
        };

        let record = if read_store {
            match self.store.find(agent.task_id(), category) {
                Ok(record) => record.filter(|r| Some(r.id.as_str()) == agent.record_id()),
                Err(e) => {
                    debug!(agent_id = %agent.id(), error = %e, "record lookup failed");
                    None
                }
            }
        } else {
            None
        };
        if let Some(record) = record.filter(|r| r.status != RecordStatus::InProgress) {
            return CategorySummary {
                category,
                status,
                score: record.score,
                finding_count: record.finding_count(),
                summary: record.summary,
            };
        }

        // Notification, or store unavailable or stale: use the in-memory outcome.
        let (score, finding_count) = match agent.outcome() {
            Some(AgentOutcome::Completed { result, .. }) => {
                (Some(result.score.clamp(0, 100) as u8), result.findings.len())
            }
            _ => (None, 0),
        };
        CategorySummary {
            category,
            status,
            score,
            summary: agent.summary(),
            finding_count,
        }
    }

    fn report(&self, task_id: &str, activity: Option<Activity>) {
        let update = ProgressUpdate::new(task_id, self.task_state(task_id, false), activity);
        self.reporter.report(&update);
    }
}

/// Fold per-category summaries into the task's overall state.
pub fn aggregate(categories: Vec<CategorySummary>) -> TaskReviewState {
    let status = if categories.is_empty() {
        OverallStatus::Pending
    } else if categories
        .iter()
        .any(|c| matches!(c.status, CategoryStatus::Running | CategoryStatus::Pending))
    {
        OverallStatus::InProgress
    } else if categories
        .iter()
        .all(|c| c.status == CategoryStatus::Completed)
    {
        OverallStatus::Completed
    } else {
        OverallStatus::Failed
    };

    let scores: Vec<u8> = categories
        .iter()
        .filter(|c| c.status == CategoryStatus::Completed)
        .filter_map(|c| c.score)
        .collect();
    let average_score = if scores.is_empty() {
        None
    } else {
        let total: u32 = scores.iter().map(|&s| u32::from(s)).sum();
        Some((f64::from(total) / scores.len() as f64).round() as u8)
    };

    TaskReviewState {
        status,
        categories,
        average_score,
    }
}

fn event_sink(events: EventSender, agent_id: AgentId) -> EventSink {
    Arc::new(move |event: ProcessEvent| {
        let _ = events.send(PoolEvent {
            agent_id,
            event: AgentEvent::Process(event),
        });
    })
}

enum Command {
    StartBatch {
        batch: BatchRequest,
        reply: oneshot::Sender<TaskReviewState>,
    },
    Cancel {
        task_id: String,
        reply: oneshot::Sender<usize>,
    },
    Status {
        task_id: String,
        reply: oneshot::Sender<TaskReviewState>,
    },
}

/// Cloneable handle to a pool running on its own task.
///
/// When every handle is dropped the pool cancels all running reviews and stops.
#[derive(Clone)]
pub struct PoolHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl PoolHandle {
    pub async fn start_batch(&self, batch: BatchRequest) -> Result<TaskReviewState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StartBatch { batch, reply })?;
        rx.await.map_err(|_| Error::PoolClosed)
    }

    pub async fn cancel(&self, task_id: &str) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel {
            task_id: task_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::PoolClosed)
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskReviewState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status {
            task_id: task_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::PoolClosed)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::PoolClosed)
    }
}

impl<L, S, P> ReviewPool<L, S, P>
where
    L: Launcher + 'static,
    S: ReviewStore + 'static,
    P: ProgressReporter + 'static,
{
    /// Move the pool onto its own task.
    pub fn spawn(self, events: mpsc::UnboundedReceiver<PoolEvent>) -> (PoolHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(self.run(rx, events));
        (PoolHandle { commands }, join)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<PoolEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.execute(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }

        let cancelled = self.cancel_all();
        info!(cancelled, "review pool stopped");
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::StartBatch { batch, reply } => {
                let _ = reply.send(self.start_batch(batch));
            }
            Command::Cancel { task_id, reply } => {
                let _ = reply.send(self.cancel(&task_id));
            }
            Command::Status { task_id, reply } => {
                let _ = reply.send(self.status(&task_id));
            }
        }
    }
}
