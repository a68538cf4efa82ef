//! External tool invocation
//!
//! Spawns one external process, forwards its stdout/stderr line by line into
//! the log tagged with the stage name and group label, and classifies how it
//! ended.
//!
//! Failing to start the process ([`RunOutcome::LaunchFailed`]) is kept apart
//! from a process that started and exited unsuccessfully
//! ([`RunOutcome::Failed`]). Read errors on the child's pipes are logged and
//! never propagate: a broken pipe must not take the watcher down.
//!
//! [`run_captured`] additionally keeps the stdout lines for callers that
//! consume the tool's report.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Decides from an exit code whether a run succeeded; `None` means the
/// process was terminated by a signal
pub type SuccessPredicate = fn(Option<i32>) -> bool;

/// Default predicate: exit code zero
pub fn exit_zero(code: Option<i32>) -> bool {
    code == Some(0)
}

/// Fully built command line for one invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub current_dir: Option<PathBuf>,
    /// Identifies this invocation in logs and follow-ups
    pub label: String,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            label: label.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Arguments as lossy strings, for assertions and logs
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// How one invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Success predicate accepted the exit status
    Succeeded,
    /// Process ran but the exit status was rejected; `None` when killed by a signal
    Failed { code: Option<i32> },
    /// Process could not be started at all
    LaunchFailed(String),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }

    /// Exit code suitable for passing on from a wrapper process
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed { code: Some(code) } if *code != 0 => *code,
            RunOutcome::Failed { .. } => 1,
            RunOutcome::LaunchFailed(_) => 127,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Running child with its output forwarders
pub struct Supervised {
    child: Child,
    forwarders: Vec<(StreamKind, JoinHandle<Vec<String>>)>,
    stdout: Vec<String>,
    stage: String,
    label: String,
}

impl Supervised {
    /// Start the process described by `spec`
    pub fn spawn(stage: &str, spec: &CommandSpec) -> std::io::Result<Self> {
        Self::start(stage, spec, false)
    }

    /// Like [`Supervised::spawn`], also keeping stdout lines for
    /// [`Supervised::stdout_lines`]
    pub fn spawn_capturing(stage: &str, spec: &CommandSpec) -> std::io::Result<Self> {
        Self::start(stage, spec, true)
    }

    fn start(stage: &str, spec: &CommandSpec, capture: bool) -> std::io::Result<Self> {
        info!(stage = %stage, label = %spec.label, command = %spec, "Starting external tool");

        let mut child = spec.to_command().spawn()?;
        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let handle = forward(stdout, stage, &spec.label, StreamKind::Stdout, capture);
            forwarders.push((StreamKind::Stdout, handle));
        }
        if let Some(stderr) = child.stderr.take() {
            let handle = forward(stderr, stage, &spec.label, StreamKind::Stderr, false);
            forwarders.push((StreamKind::Stderr, handle));
        }

        Ok(Self {
            child,
            forwarders,
            stdout: Vec::new(),
            stage: stage.to_string(),
            label: spec.label.clone(),
        })
    }

    /// OS process id, while the child is running
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for exit, then for the output forwarders to flush
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        for (kind, handle) in self.forwarders.drain(..) {
            match handle.await {
                Ok(lines) => {
                    if let StreamKind::Stdout = kind {
                        self.stdout.extend(lines);
                    }
                }
                Err(e) => {
                    warn!(stage = %self.stage, label = %self.label, error = %e, "Output forwarder ended abnormally");
                }
            }
        }
        Ok(status)
    }

    /// Stdout lines kept by [`Supervised::spawn_capturing`], complete after
    /// [`Supervised::wait`]
    pub fn stdout_lines(&self) -> &[String] {
        &self.stdout
    }

    /// Kill the child and reap it
    pub async fn kill(&mut self) -> std::io::Result<()> {
        warn!(stage = %self.stage, label = %self.label, "Killing external tool");
        self.child.kill().await
    }
}

/// Spawn, wait and classify one invocation
pub async fn run(stage: &str, spec: &CommandSpec, success: SuccessPredicate) -> RunOutcome {
    execute(stage, spec, success, false).await.0
}

/// [`run`], also returning the tool's stdout lines
pub async fn run_captured(
    stage: &str,
    spec: &CommandSpec,
    success: SuccessPredicate,
) -> (RunOutcome, Vec<String>) {
    execute(stage, spec, success, true).await
}

async fn execute(
    stage: &str,
    spec: &CommandSpec,
    success: SuccessPredicate,
    capture: bool,
) -> (RunOutcome, Vec<String>) {
    let mut supervised = match Supervised::start(stage, spec, capture) {
        Ok(s) => s,
        Err(e) => {
            error!(
                stage = %stage,
                label = %spec.label,
                program = %spec.program.to_string_lossy(),
                error = %e,
                "Failed to start external tool"
            );
            return (RunOutcome::LaunchFailed(e.to_string()), Vec::new());
        }
    };

    let outcome = match supervised.wait().await {
        Ok(status) => classify(status, success),
        Err(e) => {
            error!(stage = %stage, label = %spec.label, error = %e, "Failed waiting for external tool");
            RunOutcome::Failed { code: None }
        }
    };

    match &outcome {
        RunOutcome::Succeeded => {
            info!(stage = %stage, label = %spec.label, "External tool finished successfully");
        }
        RunOutcome::Failed { code } => {
            warn!(
                stage = %stage,
                label = %spec.label,
                code = ?code,
                "External tool failed; inputs stay unmarked and will be retried"
            );
        }
        RunOutcome::LaunchFailed(_) => {}
    }
    (outcome, supervised.stdout)
}

/// Apply the success predicate to an exit status
pub fn classify(status: ExitStatus, success: SuccessPredicate) -> RunOutcome {
    let code = status.code();
    if success(code) {
        RunOutcome::Succeeded
    } else {
        RunOutcome::Failed { code }
    }
}

fn forward<R>(stream: R, stage: &str, label: &str, kind: StreamKind, keep: bool) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stage = stage.to_string();
    let label = label.to_string();

    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        let mut kept = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Tools emit whatever encoding they like; never fail on it
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    match kind {
                        StreamKind::Stdout => info!(stage = %stage, label = %label, "{}", line),
                        StreamKind::Stderr => warn!(stage = %stage, label = %label, "{}", line),
                    }
                    if keep {
                        kept.push(line.to_string());
                    }
                }
                Err(e) => {
                    // Dropping the reader closes our end of the pipe
                    warn!(stage = %stage, label = %label, stream = ?kind, error = %e, "Error reading tool output");
                    break;
                }
            }
        }
        debug!(stage = %stage, label = %label, stream = ?kind, "Output stream closed");
        kept
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_zero_predicate() {
        assert!(exit_zero(Some(0)));
        assert!(!exit_zero(Some(1)));
        assert!(!exit_zero(None));
    }

    #[test]
    fn test_display_joins_program_and_args() {
        let spec = CommandSpec::new("Rscript", "batch1_2024-01-01_1")
            .arg("process_json.R")
            .args(["out", "batch1_2024-01-01_1"]);
        assert_eq!(spec.to_string(), "Rscript process_json.R out batch1_2024-01-01_1");
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(RunOutcome::Succeeded.exit_code(), 0);
        assert_eq!(RunOutcome::Failed { code: Some(3) }.exit_code(), 3);
        assert_eq!(RunOutcome::Failed { code: None }.exit_code(), 1);
        assert_eq!(RunOutcome::LaunchFailed("nope".into()).exit_code(), 127);
    }

    #[tokio::test]
    async fn test_launch_failure_is_distinct() {
        let spec = CommandSpec::new("/nonexistent/smitt-tool", "x");
        let outcome = run("test", &spec, exit_zero).await;
        assert!(matches!(outcome, RunOutcome::LaunchFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let spec = CommandSpec::new("sh", "x").args(["-c", "echo out; echo err >&2; exit 3"]);
        let outcome = run("test", &spec, exit_zero).await;
        assert_eq!(outcome, RunOutcome::Failed { code: Some(3) });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captured_stdout_excludes_stderr() {
        let spec = CommandSpec::new("sh", "x").args(["-c", "echo one; echo err >&2; printf 'two\\r\\n'"]);
        let (outcome, lines) = run_captured("test", &spec, exit_zero).await;
        assert_eq!(outcome, RunOutcome::Succeeded);
        assert_eq!(lines, vec!["one", "two"]);

        let (_, lines) = execute("test", &spec, exit_zero, false).await;
        assert!(lines.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_output_does_not_fail_run() {
        let spec = CommandSpec::new("sh", "x").args(["-c", "printf '\\377\\376\\n'; exit 0"]);
        assert_eq!(run("test", &spec, exit_zero).await, RunOutcome::Succeeded);
    }
}
