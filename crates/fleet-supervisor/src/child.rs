//! Per-child lifecycle supervisor.
//!
//! Each configured server is an owned actor: one command queue consumed by a
//! single worker task that exclusively owns the MCP session and the supervised
//! process handle. Lifecycle transitions, RPC forwarding, and health probes
//! are processed strictly serially; external callers only enqueue commands or
//! read snapshots.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use rmcp::model::{CallToolResult, Tool};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fleet_config::{ChildConfig, Transport};

use crate::capture::{OutputCapture, OutputLine, StreamKind};
use crate::session::{HEALTH_PROBE_TIMEOUT, McpSession, RPC_TIMEOUT, build_command, tool_to_value};
use crate::tokens::SchemaTokenCounter;

/// Consecutive retry attempts before a child is marked errored.
const MAX_RETRIES: u32 = 5;
/// Backoff before retry attempt n is `BACKOFF_BASE_SECS ^ n` seconds.
const BACKOFF_BASE_SECS: u64 = 2;
/// Pause between health probes.
const HEALTH_INTERVAL: Duration = Duration::from_secs(45);
/// Two consecutive probe failures mark the child unsalvageable in place.
const MAX_HEALTH_FAILURES: u32 = 2;
/// Wrapper bound around each readiness-gate tool-list attempt.
const READINESS_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace between SIGTERM (or SIGKILL) and escalation.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
/// Drains normally exit on pipe EOF; stragglers are aborted after this.
const DRAIN_REAP_TIMEOUT: Duration = Duration::from_secs(1);
const COMMAND_QUEUE_CAPACITY: usize = 64;

type JsonObject = serde_json::Map<String, Value>;

/// Lifecycle state of one child. `errored` is sticky: nothing but an external
/// start command leaves it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildState {
    #[default]
    Stopped,
    Starting,
    Running,
    Retrying,
    Stopping,
    Errored,
}

impl std::fmt::Display for ChildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Stopping => "stopping",
            Self::Errored => "errored",
        };
        f.write_str(label)
    }
}

/// Non-blocking snapshot of one child, as served by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct ChildInfo {
    pub state: ChildState,
    pub pid: Option<u32>,
    pub transport: Transport,
    pub retries: u32,
    pub uptime: Option<f64>,
    pub healthy: bool,
    pub restarts: u32,
    pub last_error: Option<String>,
    pub stdout: Vec<OutputLine>,
    pub stderr: Vec<OutputLine>,
    pub last_output_renewal: Option<String>,
}

/// Live tool inventory summary for one child.
#[derive(Debug, Clone, Serialize)]
pub struct ToolsInfo {
    pub tool_count: usize,
    pub token_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_error: Option<String>,
}

impl ToolsInfo {
    fn unavailable(reason: String) -> Self {
        Self {
            tool_count: 0,
            token_count: 0,
            tools_error: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StatusInner {
    state: ChildState,
    pid: Option<u32>,
    retries: u32,
    restart_count: u32,
    healthy: bool,
    health_failures: u32,
    last_error: Option<String>,
    started_at: Option<Instant>,
}

/// Observable child state. Mutated only from the worker task; everyone else
/// reads copies.
#[derive(Debug, Default)]
struct StatusCell {
    inner: Mutex<StatusInner>,
}

impl StatusCell {
    fn with<R>(&self, f: impl FnOnce(&mut StatusInner) -> R) -> R {
        f(&mut lock(&self.inner))
    }

    fn state(&self) -> ChildState {
        self.with(|s| s.state)
    }

    fn set_state(&self, state: ChildState) {
        self.with(|s| {
            s.state = state;
            // healthy=true is only meaningful while the lifecycle can still
            // carry it back to running.
            if matches!(
                state,
                ChildState::Stopping | ChildState::Stopped | ChildState::Errored
            ) {
                s.healthy = false;
            }
        });
    }

    fn snapshot(&self) -> StatusInner {
        self.with(|s| s.clone())
    }
}

enum ChildCommand {
    Start,
    Stop,
    Exit,
    ListTools {
        respond: oneshot::Sender<Result<Vec<Tool>>>,
    },
    CallTool {
        tool: String,
        arguments: Option<JsonObject>,
        respond: oneshot::Sender<Result<CallToolResult>>,
    },
    /// Internal health tick; ignored unless the child is running.
    Probe,
}

/// Public handle to one supervised child. Cheap to share; all lifecycle work
/// happens on the child's worker task.
pub struct ChildHandle {
    name: String,
    config: ChildConfig,
    commands: mpsc::Sender<ChildCommand>,
    status: Arc<StatusCell>,
    capture: Arc<OutputCapture>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChildHandle {
    /// Create the child in `stopped` and spawn its worker task. Nothing runs
    /// until a start command arrives.
    pub fn spawn(config: ChildConfig) -> Self {
        Self::spawn_inner(config, HEALTH_INTERVAL)
    }

    /// Same as [`ChildHandle::spawn`] with a shortened probe cadence, so tests
    /// can exercise the health loop without waiting out the production
    /// interval.
    #[cfg(test)]
    pub(crate) fn spawn_with_health_interval(
        config: ChildConfig,
        health_interval: Duration,
    ) -> Self {
        Self::spawn_inner(config, health_interval)
    }

    fn spawn_inner(config: ChildConfig, health_interval: Duration) -> Self {
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let status = Arc::new(StatusCell::default());
        let capture = Arc::new(OutputCapture::default());

        let worker = ChildWorker {
            name: config.name.clone(),
            config: config.clone(),
            status: status.clone(),
            capture: capture.clone(),
            commands: commands.clone(),
            health_interval,
            session: None,
            proc: None,
            drains: Vec::new(),
            health: None,
        };
        let handle = tokio::spawn(worker.run(receiver));

        Self {
            name: config.name.clone(),
            config,
            commands,
            status,
            capture,
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChildState {
        self.status.state()
    }

    /// Enqueue a start command; returns once queued.
    pub async fn start(&self) {
        let _ = self.commands.send(ChildCommand::Start).await;
    }

    /// Enqueue a stop command; processed after any in-flight lifecycle work.
    pub async fn stop(&self) {
        let _ = self.commands.send(ChildCommand::Stop).await;
    }

    /// Enqueue one health probe immediately, bypassing the interval timer.
    #[cfg(test)]
    pub(crate) async fn probe_now(&self) {
        let _ = self.commands.send(ChildCommand::Probe).await;
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let (respond, reply) = oneshot::channel();
        self.commands
            .send(ChildCommand::ListTools { respond })
            .await
            .map_err(|_| anyhow!("child '{}': command queue is closed", self.name))?;
        reply
            .await
            .map_err(|_| anyhow!("child '{}': worker dropped the reply", self.name))?
    }

    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult> {
        let (respond, reply) = oneshot::channel();
        self.commands
            .send(ChildCommand::CallTool {
                tool: tool.to_string(),
                arguments,
                respond,
            })
            .await
            .map_err(|_| anyhow!("child '{}': command queue is closed", self.name))?;
        reply
            .await
            .map_err(|_| anyhow!("child '{}': worker dropped the reply", self.name))?
    }

    /// Non-blocking view of the child.
    pub fn info(&self) -> ChildInfo {
        let status = self.status.snapshot();
        ChildInfo {
            state: status.state,
            pid: status.pid,
            transport: self.config.transport,
            retries: status.retries,
            uptime: status
                .started_at
                .map(|at| (at.elapsed().as_secs_f64() * 10.0).round() / 10.0),
            healthy: status.healthy,
            restarts: status.restart_count,
            last_error: status.last_error,
            stdout: self.capture.tail(StreamKind::Stdout),
            stderr: self.capture.tail(StreamKind::Stderr),
            last_output_renewal: self.capture.last_renewal(),
        }
    }

    /// Live tool count and schema token cost. Non-running children
    /// short-circuit without touching the session.
    pub async fn tools_info(&self, counter: Option<&dyn SchemaTokenCounter>) -> ToolsInfo {
        let state = self.state();
        if state != ChildState::Running {
            return ToolsInfo::unavailable(format!("MCP state is {state}"));
        }
        let tools = match self.list_tools().await {
            Ok(tools) => tools,
            Err(error) => return ToolsInfo::unavailable(format!("{error:#}")),
        };
        let serialized: Vec<Value> = tools.iter().map(tool_to_value).collect();
        let tool_count = serialized.len();
        let schema = match serde_json::to_string(&serialized) {
            Ok(schema) => schema,
            Err(error) => {
                return ToolsInfo {
                    tool_count,
                    token_count: 0,
                    tools_error: Some(format!("schema serialization failed: {error}")),
                };
            }
        };
        match counter {
            Some(counter) => match counter.count(&schema) {
                Ok(token_count) => ToolsInfo {
                    tool_count,
                    token_count,
                    tools_error: None,
                },
                Err(error) => ToolsInfo {
                    tool_count,
                    token_count: 0,
                    tools_error: Some(format!("token counter failed: {error}")),
                },
            },
            None => ToolsInfo {
                tool_count,
                token_count: 0,
                tools_error: Some("token counter unavailable".to_string()),
            },
        }
    }

    /// Stop the child and terminate its worker; used at fleet shutdown.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(ChildCommand::Exit).await;
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct HealthTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StartMode {
    /// External start command: readiness failure is sticky errored.
    Commanded,
    /// Re-entry from the backoff path: failures feed back into retry.
    Restart,
}

#[derive(Clone, Copy)]
enum KillStyle {
    /// SIGTERM, 5 s grace, then SIGKILL.
    Graceful,
    /// SIGKILL, 5 s wait, then an OS-level kill on the recorded pid.
    Hard,
}

/// The worker task: sole owner of the session, process handle, drains, and
/// health loop for one child.
struct ChildWorker {
    name: String,
    config: ChildConfig,
    status: Arc<StatusCell>,
    capture: Arc<OutputCapture>,
    commands: mpsc::Sender<ChildCommand>,
    health_interval: Duration,
    session: Option<McpSession>,
    proc: Option<tokio::process::Child>,
    drains: Vec<JoinHandle<()>>,
    health: Option<HealthTask>,
}

impl ChildWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<ChildCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                ChildCommand::Start => self.handle_start().await,
                ChildCommand::Stop => self.handle_stop().await,
                ChildCommand::Exit => {
                    self.handle_stop().await;
                    break;
                }
                ChildCommand::ListTools { respond } => {
                    let _ = respond.send(self.list_tools(RPC_TIMEOUT).await);
                }
                ChildCommand::CallTool {
                    tool,
                    arguments,
                    respond,
                } => {
                    let _ = respond.send(self.call_tool(&tool, arguments).await);
                }
                ChildCommand::Probe => self.handle_probe().await,
            }
        }
        // Handle dropped without an explicit exit: tear down anyway so no
        // session or process outlives the worker.
        self.cancel_health().await;
        self.close_session().await;
        self.kill_proc(KillStyle::Graceful).await;
    }

    async fn handle_start(&mut self) {
        if self.status.state() == ChildState::Running {
            return;
        }
        // Fresh lifecycle: the consecutive-retry budget starts over.
        self.status.with(|s| s.retries = 0);
        self.start_sequence(StartMode::Commanded).await;
    }

    async fn start_sequence(&mut self, mode: StartMode) {
        self.status.set_state(ChildState::Starting);

        if let Some(delay) = self.config.startup_delay() {
            tracing::info!(
                child = %self.name,
                delay_ms = delay.as_millis() as u64,
                "waiting before spawn"
            );
            tokio::time::sleep(delay).await;
        }

        if let Err(error) = self.spawn_if_needed().await {
            // Not retried: a missing executable will not appear on its own.
            self.record_error(&error);
            self.status.set_state(ChildState::Errored);
            tracing::error!(child = %self.name, error = %format!("{error:#}"), "spawn failed");
            return;
        }

        let attempts = self.config.readiness_attempts();
        let delay = self.config.readiness_delay();
        let mut ready = false;
        for attempt in 1..=attempts {
            match tokio::time::timeout(READINESS_ATTEMPT_TIMEOUT, self.list_tools(RPC_TIMEOUT))
                .await
            {
                Ok(Ok(tools)) if !tools.is_empty() => {
                    tracing::info!(child = %self.name, attempt, "tools available");
                    ready = true;
                    break;
                }
                Ok(Ok(_)) => {
                    tracing::warn!(child = %self.name, attempt, "readiness probe returned no tools");
                }
                Ok(Err(error)) => {
                    tracing::warn!(
                        child = %self.name,
                        attempt,
                        error = %format!("{error:#}"),
                        "readiness probe failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(child = %self.name, attempt, "readiness probe timed out");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }

        if ready {
            // healthy flips here, but health_failures only resets on a probe
            // success: a strike must survive the backoff restart so the next
            // consecutive failure can promote to errored.
            self.status.with(|s| s.healthy = true);
            self.status.set_state(ChildState::Running);
            self.spawn_health_loop();
            tracing::info!(child = %self.name, transport = %self.config.transport, "running");
            return;
        }

        let error = anyhow!("Failed to get tools after {attempts} attempts");
        self.record_error(&error);
        match mode {
            StartMode::Commanded => {
                // Sticky: only another external start re-enters the lifecycle.
                self.close_session().await;
                self.kill_proc(KillStyle::Hard).await;
                self.status.set_state(ChildState::Errored);
                tracing::error!(child = %self.name, "readiness gate exhausted, marking errored");
            }
            StartMode::Restart => self.schedule_retry().await,
        }
    }

    async fn handle_stop(&mut self) {
        if self.status.state() == ChildState::Stopped {
            return;
        }
        self.status.set_state(ChildState::Stopping);
        self.cancel_health().await;
        self.close_session().await;
        self.kill_proc(KillStyle::Graceful).await;
        self.status.set_state(ChildState::Stopped);
        tracing::info!(child = %self.name, "stopped");
    }

    async fn handle_probe(&mut self) {
        if self.status.state() != ChildState::Running {
            return; // stale tick from a loop that is already being torn down
        }

        let result = async {
            self.ensure_session().await?;
            let Some(session) = self.session.as_ref() else {
                return Err(anyhow!("session unavailable"));
            };
            session.list_tools(HEALTH_PROBE_TIMEOUT).await
        }
        .await;

        match result {
            Ok(_) => self.status.with(|s| {
                s.healthy = true;
                s.health_failures = 0;
            }),
            Err(error) => {
                let failures = self.status.with(|s| {
                    s.healthy = false;
                    s.last_error = Some(format!("{error:#}"));
                    s.health_failures += 1;
                    s.health_failures
                });
                tracing::warn!(
                    child = %self.name,
                    failures,
                    error = %format!("{error:#}"),
                    "health probe failed"
                );
                self.cancel_health().await;
                if failures >= MAX_HEALTH_FAILURES {
                    // Two strikes: the child is unsalvageable in place.
                    self.close_session().await;
                    self.kill_proc(KillStyle::Hard).await;
                    self.status.set_state(ChildState::Errored);
                    tracing::error!(
                        child = %self.name,
                        "two consecutive health failures, marking errored"
                    );
                } else {
                    self.schedule_retry().await;
                }
            }
        }
    }

    async fn schedule_retry(&mut self) {
        self.cancel_health().await;
        self.close_session().await;
        self.kill_proc(KillStyle::Hard).await;

        let retries = self.status.with(|s| s.retries);
        if retries >= MAX_RETRIES {
            self.status.set_state(ChildState::Errored);
            tracing::error!(child = %self.name, retries, "retry budget exhausted, marking errored");
            return;
        }

        let attempt = self.status.with(|s| {
            s.retries += 1;
            s.restart_count += 1;
            s.retries
        });
        self.status.set_state(ChildState::Retrying);
        let backoff = Duration::from_secs(BACKOFF_BASE_SECS.pow(attempt));
        tracing::warn!(
            child = %self.name,
            attempt,
            backoff_secs = backoff.as_secs(),
            "retrying after backoff"
        );
        tokio::time::sleep(backoff).await;
        Box::pin(self.start_sequence(StartMode::Restart)).await;
    }

    /// Spawn the supervised process for stdio children. No-op for http
    /// transport or while a previous process is still alive.
    async fn spawn_if_needed(&mut self) -> Result<()> {
        if self.config.transport != Transport::Stdio {
            return Ok(());
        }
        if let Some(proc) = self.proc.as_mut() {
            match proc.try_wait() {
                Ok(None) => return Ok(()),
                _ => {
                    // Previous process exited on its own; reap before respawn.
                    self.proc = None;
                    self.reap_drains().await;
                }
            }
        }

        let mut cmd = build_command(&self.config)?;
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            child = %self.name,
            command = %self.config.command.as_deref().unwrap_or_default(),
            "spawning"
        );
        let mut child = cmd.spawn().map_err(|error| {
            anyhow!("failed to spawn '{}': {error}", self.name)
        })?;

        if let Some(stdout) = child.stdout.take() {
            self.drains
                .push(self.capture.spawn_drain(&self.name, StreamKind::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            self.drains
                .push(self.capture.spawn_drain(&self.name, StreamKind::Stderr, stderr));
        }
        self.status.with(|s| {
            s.pid = child.id();
            s.started_at = Some(Instant::now());
        });
        self.proc = Some(child);
        Ok(())
    }

    /// Open the session if absent, or refresh it once it ages past the TTL.
    async fn ensure_session(&mut self) -> Result<()> {
        if let Some(session) = self.session.as_ref() {
            if !session.is_expired() {
                return Ok(());
            }
            tracing::debug!(child = %self.name, "session expired, refreshing");
        }
        if let Some(stale) = self.session.take() {
            stale.close().await;
        }
        let session = McpSession::open(&self.config).await?;
        self.status.with(|s| {
            if s.started_at.is_none() {
                s.started_at = Some(Instant::now());
            }
        });
        self.session = Some(session);
        Ok(())
    }

    async fn list_tools(&mut self, bound: Duration) -> Result<Vec<Tool>> {
        self.ensure_session().await?;
        let Some(session) = self.session.as_ref() else {
            return Err(anyhow!("child '{}': session unavailable", self.name));
        };
        session.list_tools(bound).await
    }

    async fn call_tool(
        &mut self,
        tool: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult> {
        self.ensure_session().await?;
        let Some(session) = self.session.as_ref() else {
            return Err(anyhow!("child '{}': session unavailable", self.name));
        };
        session.call_tool(tool, arguments).await
    }

    fn spawn_health_loop(&mut self) {
        if let Some(stale) = self.health.take() {
            stale.token.cancel();
            stale.handle.abort();
        }
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let commands = self.commands.clone();
        let name = self.name.clone();
        let interval = self.health_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if commands.send(ChildCommand::Probe).await.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(child = %name, "health loop exited");
        });
        self.health = Some(HealthTask { token, handle });
    }

    async fn cancel_health(&mut self) {
        if let Some(health) = self.health.take() {
            health.token.cancel();
            let _ = health.handle.await;
        }
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    async fn kill_proc(&mut self, style: KillStyle) {
        let Some(mut proc) = self.proc.take() else {
            self.reap_drains().await;
            return;
        };
        let pid = proc.id();
        match style {
            KillStyle::Graceful => {
                if let Some(pid) = pid {
                    signal_pid(pid, libc::SIGTERM);
                }
                match tokio::time::timeout(TERMINATE_GRACE, proc.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        let _ = proc.kill().await;
                    }
                }
            }
            KillStyle::Hard => {
                let _ = proc.start_kill();
                match tokio::time::timeout(TERMINATE_GRACE, proc.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        // Last resort: the process ignored SIGKILL delivery via
                        // the handle, go through the OS on the recorded pid.
                        if let Some(pid) = pid {
                            signal_pid(pid, libc::SIGKILL);
                        }
                    }
                }
            }
        }
        self.status.with(|s| s.pid = None);
        self.reap_drains().await;
    }

    async fn reap_drains(&mut self) {
        for mut drain in self.drains.drain(..) {
            if tokio::time::timeout(DRAIN_REAP_TIMEOUT, &mut drain).await.is_err() {
                drain.abort();
                let _ = drain.await;
            }
        }
    }

    fn record_error(&self, error: &anyhow::Error) {
        self.status.with(|s| s.last_error = Some(format!("{error:#}")));
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: i32) {
    // SAFETY: kill() is async-signal-safe; the pid was recorded from our own
    // spawn. A vanished process returns ESRCH, which we ignore.
    unsafe {
        libc::kill(pid as i32, signal);
    }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _signal: i32) {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "child_tests.rs"]
pub(crate) mod tests;
