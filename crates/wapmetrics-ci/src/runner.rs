//! External command execution for measurement tools.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// A command line to run on behalf of a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Tool name, used in errors and logs.
    pub name: String,

    pub program: String,

    pub args: Vec<String>,

    /// Working directory; inherits the current one when `None`.
    pub cwd: Option<PathBuf>,

    /// Wall-clock limit; the process is killed when it elapses.
    pub timeout_ms: Option<u64>,
}

impl CommandSpec {
    /// Build from an argv vector. The first element is the program.
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> anyhow::Result<Self> {
        let name = name.into();
        let mut argv = argv.into_iter();
        let program = match argv.next() {
            Some(p) if !p.trim().is_empty() => p,
            _ => anyhow::bail!("Command for {} is empty", name),
        };
        Ok(Self {
            name,
            program,
            args: argv.collect(),
            cwd: None,
            timeout_ms: None,
        })
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms.filter(|t| *t > 0);
        self
    }

    /// Rendered command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub name: String,

    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    pub duration_ms: u64,

    pub success: bool,
}

impl CommandOutcome {
    /// Whether this command passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Last `lines` lines of stderr, for failure messages.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Runs tool commands to completion.
pub struct CommandRunner;

impl CommandRunner {
    /// Execute `spec` and capture its output. A non-zero exit is returned
    /// as an outcome; spawn errors and timeouts are errors.
    pub async fn execute(spec: &CommandSpec) -> anyhow::Result<CommandOutcome> {
        let start = Instant::now();
        debug!(tool = %spec.name, command = %spec.display(), "Executing command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let child = command
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn {}: {}", spec.program, e))?;

        let output = match spec.timeout_ms {
            Some(timeout_ms) => tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| anyhow::anyhow!("{} timed out after {}ms", spec.name, timeout_ms))??,
            None => child.wait_with_output().await?,
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);

        Ok(CommandOutcome {
            name: spec.name.clone(),
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
            success: output.status.success(),
        })
    }
}
