//! Executes a single action command and reports a structured outcome.
//!
//! The runner never raises: spawn failures, non-zero exits and timeouts all
//! surface through [`ActionOutcome`], and the snapshot driver decides what
//! they mean under the binding's mode.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::actions::{ActionCommand, ActionEvent, ActionMode};
use crate::clock::Clock;

/// Upper bound on captured stdout; directives fit well below this.
const MAX_CAPTURED_STDOUT: u64 = 1024 * 1024;

/// The only stdout directive the engine recognizes.
pub const REDIRECT_KEY: &str = "KOPIA_SNAPSHOT_PATH";

/// Structured result of one action invocation.
#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    /// Exit disposition after the mode's rules are applied
    pub exit_ok: bool,

    /// The child was still running when its timeout fired
    pub timed_out: bool,

    /// The child was forcibly terminated
    pub killed: bool,

    /// Redirection target printed by the child, if any
    pub redirect_path: Option<PathBuf>,

    /// Wall-clock time spent in the invocation
    pub duration: Duration,
}

/// Everything a child process learns about the attempt.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub event: ActionEvent,

    /// Unique per attempt, even for repeated snapshots of the same source
    pub snapshot_id: String,

    /// Directory being captured when this action fires
    pub source_path: PathBuf,

    /// Working directory for the child
    pub work_dir: PathBuf,

    /// Additional environment entries
    pub extra_env: HashMap<String, String>,
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs action commands for one snapshot attempt.
pub struct ActionRunner {
    clock: Arc<dyn Clock>,
    script_dir: PathBuf,
    cancel: CancellationToken,
}

impl ActionRunner {
    /// `script_dir` receives materialized persisted scripts; the driver owns
    /// it for the attempt and removes it on teardown.
    pub fn new(clock: Arc<dyn Clock>, script_dir: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            clock,
            script_dir,
            cancel,
        }
    }

    /// Execute one binding and report its outcome.
    pub async fn run(&self, binding: &ActionCommand, ctx: &ActionContext) -> ActionOutcome {
        let started = self.clock.now();

        let mut command = match self.build_command(binding, ctx) {
            Ok(command) => command,
            Err(reason) => {
                warn!(
                    "{} action for {} could not be prepared: {}",
                    ctx.event,
                    ctx.source_path.display(),
                    reason
                );
                return self.finish(
                    binding.mode,
                    ActionOutcome {
                        duration: self.clock.since(started),
                        ..Default::default()
                    },
                );
            }
        };

        if binding.mode == ActionMode::Async {
            // Spawn and detach: stdout is discarded and the child outlives
            // this call.
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            match command.spawn() {
                Ok(_child) => debug!(
                    "{} action for {} detached",
                    ctx.event,
                    ctx.source_path.display()
                ),
                Err(e) => warn!(
                    "{} action for {} failed to start: {}",
                    ctx.event,
                    ctx.source_path.display(),
                    e
                ),
            }
            return ActionOutcome {
                exit_ok: true,
                duration: self.clock.since(started),
                ..Default::default()
            };
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    "{} action for {} failed to start: {}",
                    ctx.event,
                    ctx.source_path.display(),
                    e
                );
                return self.finish(
                    binding.mode,
                    ActionOutcome {
                        duration: self.clock.since(started),
                        ..Default::default()
                    },
                );
            }
        };

        let stdout_task = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = Vec::with_capacity(1024);
                let mut limited = (&mut out).take(MAX_CAPTURED_STDOUT);
                let _ = limited.read_to_end(&mut buf).await;
                // Drain past the cap so the child is never blocked on a
                // full pipe.
                let _ = tokio::io::copy(&mut out, &mut tokio::io::sink()).await;
                buf
            })
        });

        let waited = self.wait_bounded(&mut child, binding.effective_timeout()).await;

        let mut outcome = ActionOutcome::default();
        let mut exited = false;

        match waited {
            Waited::Exited(Ok(status)) => {
                exited = true;
                outcome.exit_ok = status.success();
                if !status.success() {
                    warn!(
                        "{} action for {} exited with {}",
                        ctx.event,
                        ctx.source_path.display(),
                        status
                    );
                }
            }
            Waited::Exited(Err(e)) => {
                warn!(
                    "{} action for {} could not be awaited: {}",
                    ctx.event,
                    ctx.source_path.display(),
                    e
                );
            }
            Waited::TimedOut => {
                warn!(
                    "{} action for {} timed out, killing",
                    ctx.event,
                    ctx.source_path.display()
                );
                outcome.timed_out = true;
                outcome.killed = true;
                if let Err(e) = child.kill().await {
                    warn!("failed to kill timed-out action: {}", e);
                }
            }
            Waited::Cancelled => {
                debug!(
                    "{} action for {} cancelled with the attempt",
                    ctx.event,
                    ctx.source_path.display()
                );
                outcome.killed = true;
                if let Err(e) = child.kill().await {
                    warn!("failed to kill cancelled action: {}", e);
                }
            }
        }

        if let Some(task) = stdout_task {
            let stdout = task.await.unwrap_or_default();
            if exited {
                parse_directives(&stdout, &mut outcome);
            }
        }

        outcome.duration = self.clock.since(started);
        self.finish(binding.mode, outcome)
    }

    /// Wait for the child, bounded by the binding's timeout and the
    /// attempt's cancellation signal.
    async fn wait_bounded(&self, child: &mut Child, timeout: Option<Duration>) -> Waited {
        let wait = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                    Ok(result) => Waited::Exited(result),
                    Err(_) => Waited::TimedOut,
                },
                None => Waited::Exited(child.wait().await),
            }
        };

        tokio::select! {
            waited = wait => waited,
            _ = self.cancel.cancelled() => Waited::Cancelled,
        }
    }

    fn build_command(
        &self,
        binding: &ActionCommand,
        ctx: &ActionContext,
    ) -> std::result::Result<Command, String> {
        let (program, args) = if let Some(body) = &binding.script {
            self.persist_script(body)
                .map_err(|e| format!("persist script: {e}"))?
        } else if let Some(line) = &binding.command {
            let mut parts = line.split_whitespace().map(str::to_string);
            let Some(program) = parts.next() else {
                return Err("empty command".to_string());
            };
            (program, parts.collect())
        } else {
            return Err("binding has neither command nor script".to_string());
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&ctx.work_dir)
            .env("KOPIA_ACTION", ctx.event.as_str())
            .env("KOPIA_SNAPSHOT_ID", &ctx.snapshot_id)
            .env("KOPIA_SOURCE_PATH", &ctx.source_path)
            .env("KOPIA_VERSION", env!("CARGO_PKG_VERSION"));
        for (key, value) in &ctx.extra_env {
            command.env(key, value);
        }
        Ok(command)
    }

    /// Materialize an inline script as an owner-only executable file.
    #[cfg(unix)]
    fn persist_script(&self, body: &str) -> std::io::Result<(String, Vec<String>)> {
        use std::os::unix::fs::PermissionsExt;

        let path = self
            .script_dir
            .join(format!("action-{}.sh", uuid::Uuid::new_v4()));
        let contents = if body.starts_with("#!") {
            body.to_string()
        } else {
            format!("#!/bin/sh\n{body}")
        };
        std::fs::write(&path, contents)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        Ok((path.to_string_lossy().into_owned(), Vec::new()))
    }

    #[cfg(windows)]
    fn persist_script(&self, body: &str) -> std::io::Result<(String, Vec<String>)> {
        let path = self
            .script_dir
            .join(format!("action-{}.cmd", uuid::Uuid::new_v4()));
        std::fs::write(&path, body)?;
        Ok((
            "cmd".to_string(),
            vec!["/c".to_string(), path.to_string_lossy().into_owned()],
        ))
    }

    /// Optional-mode failures are logged and ignored; async never fails.
    fn finish(&self, mode: ActionMode, mut outcome: ActionOutcome) -> ActionOutcome {
        if mode != ActionMode::Essential && !outcome.exit_ok {
            debug!("{} action failure ignored", mode);
            outcome.exit_ok = true;
        }
        outcome
    }

    /// Where persisted scripts for this attempt are materialized.
    pub fn script_dir(&self) -> &Path {
        &self.script_dir
    }
}

/// Scan stdout for `KEY=VALUE` directive lines.
///
/// Only [`REDIRECT_KEY`] is recognized; unknown keys and non-directive
/// lines are ignored without error. No shell-style unescaping is applied.
fn parse_directives(stdout: &[u8], outcome: &mut ActionOutcome) {
    let text = String::from_utf8_lossy(stdout);
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            REDIRECT_KEY => outcome.redirect_path = Some(PathBuf::from(value.trim())),
            other => debug!("ignoring unknown action directive '{}'", other),
        }
    }
}
