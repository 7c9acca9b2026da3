use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::extract::extract;
use crate::process::{ProcessControl, ProcessEvent, ProcessExit};
use crate::review::{Category, ReviewRequest, ReviewResult, Severity};
use crate::stream::StatusTranslator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(u64);

impl AgentId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentTimeouts {
    pub spawn_confirm: Duration,
    pub silence: Duration,
    pub stall: Duration,
}

impl Default for AgentTimeouts {
    fn default() -> Self {
        Self {
            spawn_confirm: Duration::from_secs(5),
            silence: Duration::from_secs(90),
            stall: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    SpawnConfirm,
    Silence,
    Stall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Process(ProcessEvent),
    Timer { kind: TimerKind, generation: u64 },
}

/// An event addressed to one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEvent {
    pub agent_id: AgentId,
    pub event: AgentEvent,
}

pub type EventSender = mpsc::UnboundedSender<PoolEvent>;

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// The timers owned by one agent.
///
/// Arming a kind always cancels the previous timer of that kind. Every arm
/// gets a fresh generation so a firing that raced with its own cancellation
/// is recognized as stale.
pub struct TimerSet {
    agent_id: AgentId,
    events: EventSender,
    armed: HashMap<TimerKind, ArmedTimer>,
    generation: u64,
}

impl TimerSet {
    pub fn new(agent_id: AgentId, events: EventSender) -> Self {
        Self {
            agent_id,
            events,
            armed: HashMap::new(),
            generation: 0,
        }
    }

    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.cancel(kind);
        self.generation += 1;

        let generation = self.generation;
        let agent_id = self.agent_id;
        let events = self.events.clone();
        let deadline = tokio::time::Instant::now() + after;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = events.send(PoolEvent {
                agent_id,
                event: AgentEvent::Timer { kind, generation },
            });
        });

        self.armed.insert(kind, ArmedTimer { generation, handle });
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(timer) = self.armed.remove(&kind) {
            timer.handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.armed.drain() {
            timer.handle.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Consume a firing. False for stale or cancelled timers.
    fn take_fired(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.armed.get(&kind) {
            Some(timer) if timer.generation == generation => {
                self.armed.remove(&kind);
                true
            }
            _ => false,
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Running,
    Completed,
    Failed,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AgentStatus::Running)
    }
}

/// How a completed agent got its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The process exited cleanly.
    Exited,
    /// The process went quiet and the accumulated output was usable.
    Stalled,
}

/// Why an agent failed. The message is shown to users as the review summary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("analysis executable could not be started: {0}")]
    SpawnFailed(String),

    #[error("instruction could not be rendered: {0}")]
    InstructionFailed(String),

    #[error("spawn confirmation timeout")]
    SpawnTimeout,

    #[error("no output received")]
    NoOutput,

    #[error("output stalled with no output")]
    StalledWithoutOutput,

    #[error("output stalled with unparseable output")]
    StalledUnparseable,

    #[error("failed to parse output")]
    ParseFailed,

    #[error("nonzero exit (code {code})")]
    NonZeroExit { code: i32 },

    #[error("nonzero exit (killed by signal {signal})")]
    Signaled { signal: i32 },

    #[error("process error: {0}")]
    ProcessError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("superseded by a newer review batch")]
    Superseded,
}

impl FailureReason {
    fn from_exit(exit: ProcessExit) -> Self {
        match exit.signal {
            Some(signal) => FailureReason::Signaled { signal },
            None => FailureReason::NonZeroExit {
                code: exit.exit_code,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Completed {
        result: ReviewResult,
        completion: Completion,
    },
    Failed(FailureReason),
}

/// What an event changed, for the scheduler to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentUpdate {
    /// The process confirmed it started.
    Started,
    /// New status messages translated from output.
    Activity(Vec<String>),
    /// The agent reached a terminal state.
    Finished,
}

/// One analysis subprocess, from launch to a single terminal outcome. Guarded
/// by spawn-confirmation, silence and stall timers; the first terminal
/// transition wins and later events are ignored.
pub struct Agent {
    id: AgentId,
    request: ReviewRequest,
    record_id: Option<String>,
    process: Option<Box<dyn ProcessControl>>,
    status: AgentStatus,
    output: Vec<u8>,
    translator: StatusTranslator,
    current_message: Option<String>,
    spawn_confirmed: bool,
    received_output: bool,
    timers: TimerSet,
    outcome: Option<AgentOutcome>,
}

impl Agent {
    pub fn new(
        id: AgentId,
        request: ReviewRequest,
        record_id: Option<String>,
        events: EventSender,
    ) -> Self {
        Self {
            id,
            request,
            record_id,
            process: None,
            status: AgentStatus::Running,
            output: Vec::new(),
            translator: StatusTranslator::new(),
            current_message: None,
            spawn_confirmed: false,
            received_output: false,
            timers: TimerSet::new(id, events),
            outcome: None,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn task_id(&self) -> &str {
        &self.request.task_id
    }

    pub fn category(&self) -> Category {
        self.request.category
    }

    pub fn request(&self) -> &ReviewRequest {
        &self.request
    }

    pub fn record_id(&self) -> Option<&str> {
        self.record_id.as_deref()
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == AgentStatus::Running
    }

    pub fn spawn_confirmed(&self) -> bool {
        self.spawn_confirmed
    }

    pub fn current_message(&self) -> Option<&str> {
        self.current_message.as_deref()
    }

    pub fn outcome(&self) -> Option<&AgentOutcome> {
        self.outcome.as_ref()
    }

    pub fn timers(&self) -> &TimerSet {
        &self.timers
    }

    /// Everything received on stdout so far, including an unterminated tail.
    /// Empty once the agent has finished.
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    /// Arm the spawn-confirmation and silence timers. Call right before launching.
    pub fn start(&mut self, timeouts: &AgentTimeouts) {
        self.timers
            .arm(TimerKind::SpawnConfirm, timeouts.spawn_confirm);
        self.timers.arm(TimerKind::Silence, timeouts.silence);
    }

    pub fn attach_process(&mut self, process: Box<dyn ProcessControl>) {
        self.process = Some(process);
    }

    /// Force a terminal failure (spawn error, cancellation, superseding batch).
    /// Returns false when the agent had already finished.
    pub fn fail(&mut self, reason: FailureReason) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.terminate_process();
        self.finish(AgentOutcome::Failed(reason));
        true
    }

    /// Apply one event.
    pub fn handle(&mut self, event: AgentEvent, timeouts: &AgentTimeouts) -> Option<AgentUpdate> {
        if self.status.is_terminal() {
            debug!(agent_id = %self.id, ?event, "ignoring event for finished agent");
            return None;
        }

        match event {
            AgentEvent::Process(ProcessEvent::Spawned) => {
                self.confirm_spawn();
                info!(agent_id = %self.id, task_id = self.request.task_id, category = %self.request.category, "analysis process started");
                Some(AgentUpdate::Started)
            }
            AgentEvent::Process(ProcessEvent::Stdout(chunk)) => self.on_output(&chunk, timeouts),
            AgentEvent::Process(ProcessEvent::Exited(exit)) => {
                self.release_process();
                if exit.success() {
                    let result = extract(&self.output_text());
                    if result.is_parsed() {
                        self.complete(result, Completion::Exited);
                    } else {
                        self.finish(AgentOutcome::Failed(FailureReason::ParseFailed));
                    }
                } else {
                    self.finish(AgentOutcome::Failed(FailureReason::from_exit(exit)));
                }
                Some(AgentUpdate::Finished)
            }
            AgentEvent::Process(ProcessEvent::Failed(message)) => {
                self.terminate_process();
                self.finish(AgentOutcome::Failed(FailureReason::ProcessError(message)));
                Some(AgentUpdate::Finished)
            }
            AgentEvent::Timer { kind, generation } => self.on_timer(kind, generation),
        }
    }

    fn confirm_spawn(&mut self) {
        self.spawn_confirmed = true;
        self.timers.cancel(TimerKind::SpawnConfirm);
    }

    fn on_output(&mut self, chunk: &[u8], timeouts: &AgentTimeouts) -> Option<AgentUpdate> {
        if chunk.is_empty() {
            return None;
        }
        // Output proves the process is alive even if the start notice was lost.
        if !self.spawn_confirmed {
            self.confirm_spawn();
        }
        if !self.received_output {
            self.received_output = true;
            self.timers.cancel(TimerKind::Silence);
        }
        self.timers.arm(TimerKind::Stall, timeouts.stall);

        self.output.extend_from_slice(chunk);
        let messages = self.translator.consume(chunk);
        let last = messages.last()?;
        self.current_message = Some(last.clone());
        Some(AgentUpdate::Activity(messages))
    }

    fn on_timer(&mut self, kind: TimerKind, generation: u64) -> Option<AgentUpdate> {
        if !self.timers.take_fired(kind, generation) {
            debug!(agent_id = %self.id, ?kind, generation, "ignoring stale timer");
            return None;
        }

        match kind {
            TimerKind::SpawnConfirm => {
                if self.spawn_confirmed {
                    return None;
                }
                warn!(agent_id = %self.id, category = %self.request.category, "process did not confirm spawn in time");
                self.terminate_process();
                self.finish(AgentOutcome::Failed(FailureReason::SpawnTimeout));
            }
            TimerKind::Silence => {
                if self.received_output {
                    return None;
                }
                warn!(agent_id = %self.id, category = %self.request.category, "no output before silence timeout");
                self.terminate_process();
                self.finish(AgentOutcome::Failed(FailureReason::NoOutput));
            }
            TimerKind::Stall => {
                let text = self.output_text();
                warn!(
                    agent_id = %self.id,
                    category = %self.request.category,
                    bytes = text.len(),
                    partial_line = self.translator.partial_line().len(),
                    "output stalled, attempting recovery"
                );
                self.terminate_process();
                let result = extract(&text);
                if result.is_parsed() {
                    self.complete(result, Completion::Stalled);
                } else if text.trim().is_empty() {
                    self.finish(AgentOutcome::Failed(FailureReason::StalledWithoutOutput));
                } else {
                    self.finish(AgentOutcome::Failed(FailureReason::StalledUnparseable));
                }
            }
        }
        Some(AgentUpdate::Finished)
    }

    fn complete(&mut self, result: ReviewResult, completion: Completion) {
        self.finish(AgentOutcome::Completed { result, completion });
    }

    fn finish(&mut self, outcome: AgentOutcome) {
        self.timers.cancel_all();
        self.release_process();
        // Finished agents stay queryable; only the outcome is read from here on.
        self.output = Vec::new();
        self.translator = StatusTranslator::new();
        match &outcome {
            AgentOutcome::Completed { result, completion } => {
                self.status = AgentStatus::Completed;
                info!(
                    agent_id = %self.id,
                    task_id = self.request.task_id,
                    category = %self.request.category,
                    score = result.score,
                    findings = result.findings.len(),
                    ?completion,
                    "review completed"
                );
            }
            AgentOutcome::Failed(reason) => {
                self.status = AgentStatus::Failed;
                warn!(
                    agent_id = %self.id,
                    task_id = self.request.task_id,
                    category = %self.request.category,
                    reason = %reason,
                    "review failed"
                );
            }
        }
        self.outcome = Some(outcome);
    }

    fn terminate_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.terminate();
        }
    }

    fn release_process(&mut self) {
        self.process = None;
    }

    /// One-line summary persisted with the record.
    pub fn summary(&self) -> Option<String> {
        match self.outcome.as_ref()? {
            AgentOutcome::Completed { result, completion } => {
                let base = result.summary.clone().unwrap_or_else(|| {
                    let critical = result.count_severity(Severity::Critical);
                    let mut text = format!(
                        "Score {}/100, {} finding(s)",
                        result.score,
                        result.findings.len()
                    );
                    if critical > 0 {
                        text.push_str(&format!(", {critical} critical"));
                    }
                    text
                });
                Some(match completion {
                    Completion::Exited => base,
                    Completion::Stalled => format!("{base} (recovered after stall)"),
                })
            }
            AgentOutcome::Failed(reason) => Some(reason.to_string()),
        }
    }
}
