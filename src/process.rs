use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};

const READ_CHUNK_BYTES: usize = 8192;

/// How long to wait for the output readers to drain after the child exits.
/// A grandchild holding the pipe open must not stall the exit notification.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for spawning a child process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub log_prefix: String,
    pub env: Vec<(String, String)>,
}

/// Exit information for a finished child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub exit_code: i32,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }
}

/// Asynchronous notifications from a running child, delivered in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Spawned,
    Stdout(Vec<u8>),
    Exited(ProcessExit),
    Failed(String),
}

/// Receiver of [`ProcessEvent`]s. Called from reader tasks, never blocks.
pub type EventSink = Arc<dyn Fn(ProcessEvent) + Send + Sync>;

/// Control side of a launched process.
pub trait ProcessControl: Send {
    /// Request termination. Does not wait for the process to exit.
    fn terminate(&mut self);
}

/// Starts analysis processes. Overridden in tests with scripted fakes.
pub trait Launcher: Send {
    fn launch(&self, config: ProcessConfig, sink: EventSink) -> Result<Box<dyn ProcessControl>>;
}

impl<T: Launcher + Sync> Launcher for Arc<T> {
    fn launch(&self, config: ProcessConfig, sink: EventSink) -> Result<Box<dyn ProcessControl>> {
        (**self).launch(config, sink)
    }
}

/// Launcher backed by real child processes.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    terminate_grace: Duration,
}

impl CommandLauncher {
    pub fn new(terminate_grace: Duration) -> Self {
        Self { terminate_grace }
    }
}

impl Default for CommandLauncher {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, config: ProcessConfig, sink: EventSink) -> Result<Box<dyn ProcessControl>> {
        let process = spawn_streaming(config, sink, self.terminate_grace)?;
        Ok(Box::new(process))
    }
}

/// Handle to a child started by [`spawn_streaming`].
#[derive(Debug)]
pub struct StreamingProcess {
    pid: Option<u32>,
    log_prefix: String,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl StreamingProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl ProcessControl for StreamingProcess {
    fn terminate(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            info!(pid = ?self.pid, "[{}] terminating process", self.log_prefix);
            let _ = tx.send(());
        }
    }
}

/// Spawn a child process and stream its stdout to `sink` as raw chunks.
///
/// Stdin is closed immediately. Stderr is logged line by line and not
/// forwarded. The child is placed in its own process group on Unix so that
/// termination reaches anything it spawned. Emits `Spawned` before returning,
/// then any number of `Stdout` chunks, then exactly one `Exited` or `Failed`.
pub fn spawn_streaming(
    config: ProcessConfig,
    sink: EventSink,
    terminate_grace: Duration,
) -> Result<StreamingProcess> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Process(format!("failed to spawn '{}': {e}", config.command)))?;

    let pid = child.id();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Process("child stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Process("child stderr not captured".into()))?;

    debug!(?pid, "[{}] spawned {}", config.log_prefix, config.command);
    sink(ProcessEvent::Spawned);

    let prefix_out = config.log_prefix.clone();
    let stdout_sink = Arc::clone(&sink);
    let stdout_task = tokio::spawn(async move {
        let mut stdout = stdout;
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    trace!(bytes = n, "[{prefix_out}] stdout chunk");
                    stdout_sink(ProcessEvent::Stdout(buf[..n].to_vec()));
                }
                Err(e) => {
                    warn!("[{prefix_out}] stdout read error: {e}");
                    break;
                }
            }
        }
    });

    let prefix_err = config.log_prefix.clone();
    let stderr_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            warn!("[{prefix_err}] {line}");
        }
    });

    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let prefix_wait = config.log_prefix.clone();
    tokio::spawn(async move {
        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = kill_rx => None,
        };
        let status = match waited {
            Some(status) => status,
            None => kill_child(&mut child, pid, terminate_grace).await,
        };

        drain(stdout_task, &prefix_wait, "stdout").await;
        drain(stderr_task, &prefix_wait, "stderr").await;

        match status {
            Ok(status) => {
                let (exit_code, signal) = extract_exit_info(&status);
                debug!(exit_code, ?signal, "[{prefix_wait}] process exited");
                sink(ProcessEvent::Exited(ProcessExit { exit_code, signal }));
            }
            Err(e) => sink(ProcessEvent::Failed(format!("wait error: {e}"))),
        }
    });

    Ok(StreamingProcess {
        pid,
        log_prefix: config.log_prefix,
        kill_tx: Some(kill_tx),
    })
}

/// SIGTERM the process group, then SIGKILL it if the grace period runs out.
async fn kill_child(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as i32, libc::SIGTERM);
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = (pid, grace);

    let _ = child.start_kill();
    child.wait().await
}

async fn drain(task: JoinHandle<()>, prefix: &str, stream: &str) {
    let abort = task.abort_handle();
    if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
        warn!("[{prefix}] {stream} still open after exit, abandoning reader");
        abort.abort();
    }
}

fn extract_exit_info(status: &std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (-1, None)
}
