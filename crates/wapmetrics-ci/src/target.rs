//! Target provisioning.
//!
//! Exactly one acquisition strategy is active per run, by precedence:
//! preview URL > static distribution directory > local start command >
//! config-only. A local server is started lazily on first acquire, at most
//! once per run, and torn down by [`TargetProvisioner::shutdown`] no matter
//! how many references are still outstanding.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wapmetrics_core::{Result, RuntimeConfig, WapmError};

/// Ready-line pattern used when none is configured.
pub const DEFAULT_READY_PATTERN: &str = r"(?i)ready|listening|started";

pub const DEFAULT_READY_TIMEOUT_MS: u64 = 120_000;

/// URL assumed for a started server when none is configured.
pub const DEFAULT_LOCAL_URL: &str = "http://127.0.0.1:3000";

/// Run-level target inputs. Each field wins over the persisted
/// `runtime` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetInputs {
    pub preview_url: Option<String>,
    pub static_dist_dir: Option<PathBuf>,
    pub start_command: Option<String>,
    pub ready_pattern: Option<String>,
    pub ready_timeout_ms: Option<u64>,
    pub server_url: Option<String>,
}

/// A shell command that serves the site locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCommand {
    pub command: String,
    pub ready_pattern: String,
    pub ready_timeout_ms: u64,
    pub url: String,
}

impl StartCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ready_pattern: DEFAULT_READY_PATTERN.to_string(),
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            url: DEFAULT_LOCAL_URL.to_string(),
        }
    }

    pub fn with_ready_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.ready_pattern = pattern.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.ready_timeout_ms = timeout_ms;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

/// The selected acquisition strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStrategy {
    Preview { url: String },
    StaticDir { dir: PathBuf },
    LocalServer(StartCommand),
    /// The config already specifies collection; provision nothing.
    ConfigOnly,
}

impl TargetStrategy {
    /// Select a strategy from run-level inputs layered over `runtime`.
    pub fn select(inputs: &TargetInputs, runtime: &RuntimeConfig) -> Result<Self> {
        let non_empty = |s: &Option<String>| s.clone().filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty(&inputs.preview_url).or_else(|| non_empty(&runtime.preview_url)) {
            return Ok(TargetStrategy::Preview {
                url: url.trim_end_matches('/').to_string(),
            });
        }

        let static_dir = inputs
            .static_dist_dir
            .clone()
            .or_else(|| non_empty(&runtime.static_dist_dir).map(PathBuf::from));
        if let Some(dir) = static_dir {
            return Ok(TargetStrategy::StaticDir { dir });
        }

        let start = runtime.start.clone().unwrap_or_default();
        if let Some(command) = non_empty(&inputs.start_command).or_else(|| non_empty(&start.command)) {
            let mut cmd = StartCommand::new(command);
            if let Some(pattern) = non_empty(&inputs.ready_pattern).or(start.ready_pattern) {
                cmd = cmd.with_ready_pattern(pattern);
            }
            if let Some(timeout) = inputs.ready_timeout_ms.or(start.ready_timeout_ms) {
                cmd = cmd.with_timeout_ms(timeout);
            }
            if let Some(url) = non_empty(&inputs.server_url).or(start.url) {
                cmd = cmd.with_url(url);
            }
            Regex::new(&cmd.ready_pattern).map_err(|e| {
                WapmError::ConfigInvalid(format!("invalid ready pattern '{}': {}", cmd.ready_pattern, e))
            })?;
            return Ok(TargetStrategy::LocalServer(cmd));
        }

        Ok(TargetStrategy::ConfigOnly)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TargetStrategy::Preview { .. } => "preview",
            TargetStrategy::StaticDir { .. } => "static",
            TargetStrategy::LocalServer(_) => "local",
            TargetStrategy::ConfigOnly => "config-only",
        }
    }
}

/// What a tool sees of the provisioned target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetInfo {
    pub base_url: Option<String>,
    pub static_dir: Option<PathBuf>,
    pub start_command: Option<String>,
}

// ---------------------------------------------------------------------------
// Local server
// ---------------------------------------------------------------------------

fn spawn_line_pump<R>(reader: R, stream: &'static str, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(server = stream, "{}", line);
            // Receiver is gone once the server is ready; keep draining.
            let _ = tx.send(line);
        }
    })
}

/// A running local server process.
pub struct LocalServer {
    child: Child,
    pumps: Vec<JoinHandle<()>>,
}

impl LocalServer {
    /// Spawn `cmd` and wait until an output line matches its ready pattern.
    pub async fn start(cmd: &StartCommand) -> Result<Self> {
        let pattern = Regex::new(&cmd.ready_pattern)
            .map_err(|e| WapmError::ConfigInvalid(format!("invalid ready pattern: {}", e)))?;

        info!(command = %cmd.command, timeout_ms = cmd.ready_timeout_ms, "Starting local server");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&cmd.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WapmError::ServerStartFailed(format!("{}: {}", cmd.command, e)))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_line_pump(stdout, "stdout", tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_line_pump(stderr, "stderr", tx.clone()));
        }
        drop(tx);

        let wait_ready = async move {
            while let Some(line) = rx.recv().await {
                if pattern.is_match(&line) {
                    return Ok(line);
                }
            }
            Err(WapmError::ServerStartFailed(
                "server exited before printing a ready line".to_string(),
            ))
        };

        let outcome = tokio::time::timeout(Duration::from_millis(cmd.ready_timeout_ms), wait_ready).await;
        let mut server = LocalServer { child, pumps };
        match outcome {
            Ok(Ok(line)) => {
                info!(ready_line = %line, "Local server ready");
                Ok(server)
            }
            Ok(Err(e)) => {
                server.stop().await;
                Err(e)
            }
            Err(_) => {
                server.stop().await;
                Err(WapmError::ServerStartTimeout {
                    timeout_ms: cmd.ready_timeout_ms,
                })
            }
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the process; a server that already exited is not an error.
    pub async fn stop(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "Local server already exited");
        }
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

enum ServerState {
    NotStarted,
    Running(LocalServer),
    Failed { timeout_ms: Option<u64>, message: String },
    Stopped,
}

struct ProvisionState {
    refs: usize,
    starts: usize,
    server: ServerState,
}

/// Shares one provisioned target between all tools of a run.
pub struct TargetProvisioner {
    strategy: TargetStrategy,
    fallback_base_url: String,
    state: Mutex<ProvisionState>,
}

impl TargetProvisioner {
    /// `fallback_base_url` is used by the config-only strategy.
    pub fn new(strategy: TargetStrategy, fallback_base_url: impl Into<String>) -> Self {
        Self {
            strategy,
            fallback_base_url: fallback_base_url.into(),
            state: Mutex::new(ProvisionState {
                refs: 0,
                starts: 0,
                server: ServerState::NotStarted,
            }),
        }
    }

    pub fn strategy(&self) -> &TargetStrategy {
        &self.strategy
    }

    /// Target description without provisioning anything.
    pub fn describe(&self) -> TargetInfo {
        match &self.strategy {
            TargetStrategy::Preview { url } => TargetInfo {
                base_url: Some(url.clone()),
                ..TargetInfo::default()
            },
            TargetStrategy::StaticDir { dir } => TargetInfo {
                static_dir: Some(dir.clone()),
                ..TargetInfo::default()
            },
            TargetStrategy::LocalServer(cmd) => TargetInfo {
                base_url: Some(cmd.url.clone()),
                start_command: Some(cmd.command.clone()),
                ..TargetInfo::default()
            },
            TargetStrategy::ConfigOnly => TargetInfo {
                base_url: Some(self.fallback_base_url.clone()),
                ..TargetInfo::default()
            },
        }
    }

    /// Take a reference on the target, starting the server on first use.
    /// A failed start is remembered and returned to later callers.
    pub async fn acquire(&self) -> Result<TargetInfo> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if let TargetStrategy::LocalServer(cmd) = &self.strategy {
            if matches!(state.server, ServerState::NotStarted) {
                state.starts += 1;
                state.server = match LocalServer::start(cmd).await {
                    Ok(server) => ServerState::Running(server),
                    Err(WapmError::ServerStartTimeout { timeout_ms }) => ServerState::Failed {
                        timeout_ms: Some(timeout_ms),
                        message: String::new(),
                    },
                    Err(WapmError::ServerStartFailed(reason)) => ServerState::Failed {
                        timeout_ms: None,
                        message: reason,
                    },
                    Err(other) => ServerState::Failed {
                        timeout_ms: None,
                        message: other.to_string(),
                    },
                };
            }

            match &state.server {
                ServerState::Running(_) => {}
                ServerState::Failed {
                    timeout_ms: Some(timeout_ms),
                    ..
                } => {
                    return Err(WapmError::ServerStartTimeout {
                        timeout_ms: *timeout_ms,
                    })
                }
                ServerState::Failed { message, .. } => {
                    return Err(WapmError::ServerStartFailed(message.clone()))
                }
                ServerState::NotStarted | ServerState::Stopped => {
                    return Err(WapmError::ServerStartFailed(
                        "target already shut down".to_string(),
                    ))
                }
            }
        }

        state.refs += 1;
        Ok(self.describe())
    }

    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        state.refs = state.refs.saturating_sub(1);
    }

    /// Tear down the server regardless of outstanding references.
    pub async fn shutdown(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.refs > 0 {
            warn!(refs = state.refs, "Shutting down target with outstanding references");
        }
        if let ServerState::Running(server) = &mut state.server {
            info!(pid = ?server.id(), "Stopping local server");
            server.stop().await;
        }
        if !matches!(state.server, ServerState::Failed { .. }) {
            state.server = ServerState::Stopped;
        }
        state.refs = 0;
    }

    /// Number of times a server start was attempted.
    pub async fn starts(&self) -> usize {
        self.state.lock().await.starts
    }

    pub async fn is_running(&self) -> bool {
        matches!(self.state.lock().await.server, ServerState::Running(_))
    }
}
