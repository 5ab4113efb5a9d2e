pub mod claude;
pub mod codex;
pub mod retry;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::LoopError;
use crate::watchdog::{self, WatchdogConfig};

/// Capability interface the orchestrator depends on: run one prompt,
/// leaving the assistant's final text at `output_path` (with the raw
/// stream at [`raw_sibling`]). Implementations spawn a specific external
/// CLI; the `RetryRunner` decorator wraps any of them with backoff.
#[async_trait]
pub trait AiRunner: Send + Sync {
    async fn run(
        &self,
        prompt: &str,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), LoopError>;
}

#[async_trait]
impl<T: AiRunner + ?Sized> AiRunner for Box<T> {
    async fn run(
        &self,
        prompt: &str,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), LoopError> {
        (**self).run(prompt, output_path, cancel).await
    }
}

/// Raw-stream path next to an extracted-text path:
/// `implementation-output.txt` → `implementation-stream.jsonl`.
pub fn raw_sibling(output_path: &Path) -> PathBuf {
    let stem = output_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.strip_suffix("-output.txt").unwrap_or(n))
        .unwrap_or("run");
    output_path.with_file_name(format!("{stem}-stream.jsonl"))
}

/// Drop guard that kills the entire process group (not just the leader
/// PID). The child is spawned with `process_group(0)` and may fork
/// grandchildren; killing only the leader would orphan them.
struct ProcessGroupGuard {
    pid: Option<u32>,
    disarmed: bool,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid, disarmed: false }
    }

    fn disarm(&mut self) {
        self.disarmed = true;
    }

    fn kill_group(&self) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if !self.disarmed {
            self.kill_group();
        }
    }
}

/// What happened to the spawned subprocess.
#[derive(Debug)]
pub struct StreamOutcome {
    /// Exit code; -1 when killed by signal.
    pub exit_code: i32,
    /// True when the run's own watchdog (marker / inactivity / hard cap)
    /// killed the process, as opposed to natural exit.
    pub watchdog_killed: bool,
}

/// Spawn `executable` with `args`, streaming stdout and stderr into
/// `raw_path` as they arrive so the watchdog can tail the file. A
/// per-invocation child token links the watchdog and the subprocess: the
/// watchdog cancels it to kill the run, and outer cancellation propagates
/// through it to the OS process.
pub async fn spawn_streamed(
    executable: &str,
    args: &[String],
    raw_path: &Path,
    watchdog_config: WatchdogConfig,
    cancel: &CancellationToken,
) -> Result<StreamOutcome, LoopError> {
    let mut file = tokio::fs::File::create(raw_path)
        .await
        .map_err(|source| LoopError::CreateOutputFailed {
            path: raw_path.display().to_string(),
            source,
        })?;

    let mut cmd = Command::new(executable);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = cmd.spawn().map_err(|e| LoopError::CommandFailed {
        code: -1,
        stderr: format!("failed to spawn {executable}: {e}"),
    })?;
    let mut guard = ProcessGroupGuard::new(child.id());

    let run_token = cancel.child_token();
    let watchdog_handle = tokio::spawn(watchdog::watch_activity(
        raw_path.to_path_buf(),
        watchdog_config,
        run_token.clone(),
    ));

    let mut stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");

    let mut out_buf = vec![0u8; 8192];
    let mut err_buf = vec![0u8; 8192];
    let mut out_done = false;
    let mut err_done = false;
    let mut killed = false;

    while !(out_done && err_done) {
        tokio::select! {
            () = run_token.cancelled() => {
                guard.kill_group();
                killed = true;
                break;
            }
            n = stdout.read(&mut out_buf), if !out_done => {
                match n {
                    Ok(0) | Err(_) => out_done = true,
                    Ok(n) => {
                        file.write_all(&out_buf[..n]).await?;
                        file.flush().await?;
                    }
                }
            }
            n = stderr.read(&mut err_buf), if !err_done => {
                match n {
                    Ok(0) | Err(_) => err_done = true,
                    Ok(n) => {
                        file.write_all(&err_buf[..n]).await?;
                        file.flush().await?;
                    }
                }
            }
        }
    }

    if killed {
        // Capture whatever the dying process flushed before SIGKILL closed
        // its pipes, so the terminal marker block is not lost.
        let mut rest = Vec::new();
        let _ = stdout.read_to_end(&mut rest).await;
        let _ = stderr.read_to_end(&mut rest).await;
        if !rest.is_empty() {
            file.write_all(&rest).await?;
            file.flush().await?;
        }
    }

    let status = child.wait().await?;
    guard.disarm();
    run_token.cancel();
    let _ = watchdog_handle.await;

    let exit_code = status.code().unwrap_or(-1);
    let watchdog_killed = killed && !cancel.is_cancelled();

    if !status.success() {
        tracing::warn!(
            executable,
            code = exit_code,
            watchdog_killed,
            "subprocess did not exit cleanly"
        );
    }

    Ok(StreamOutcome {
        exit_code,
        watchdog_killed,
    })
}

/// Shared tail of every runner: rate-limit detection first (regardless of
/// exit status), then outer cancellation, then exit-status mapping.
///
/// A watchdog kill that happened after the terminal marker flushed is the
/// normal completion path for tools that idle after emitting their result,
/// so it maps to success when the marker is present.
pub(crate) async fn classify_outcome(
    outcome: StreamOutcome,
    text_path: &Path,
    raw_path: &Path,
    cancel: &CancellationToken,
) -> Result<(), LoopError> {
    let text = tokio::fs::read_to_string(text_path).await.unwrap_or_default();

    let underlying = subprocess_error(&outcome, raw_path).await;

    if let Some(info) = crate::ratelimit::detect(&text) {
        return Err(LoopError::RateLimited {
            info,
            source: underlying.map(Box::new),
        });
    }

    if cancel.is_cancelled() {
        return Err(LoopError::Cancelled);
    }

    match underlying {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn subprocess_error(outcome: &StreamOutcome, raw_path: &Path) -> Option<LoopError> {
    if outcome.exit_code == 0 {
        return None;
    }
    if outcome.watchdog_killed {
        let raw = tokio::fs::read(raw_path).await.unwrap_or_default();
        let marker_seen = crate::watchdog::TERMINAL_MARKERS
            .iter()
            .any(|m| raw.windows(m.len()).any(|w| w == m.as_bytes()));
        if marker_seen {
            return None;
        }
        return Some(LoopError::CommandFailed {
            code: outcome.exit_code,
            stderr: "terminated by activity watchdog before emitting a result".to_string(),
        });
    }
    Some(LoopError::CommandFailed {
        code: outcome.exit_code,
        stderr: String::new(),
    })
}

/// Builds concrete runners for a provider name. The orchestrator goes
/// through this seam so tests can substitute mock runners.
pub trait RunnerFactory: Send + Sync {
    /// Whether the provider's CLI can be invoked at all.
    fn available(&self, provider: &str) -> bool;

    fn build(
        &self,
        provider: &str,
        model: &str,
        watchdog: WatchdogConfig,
    ) -> Result<Box<dyn AiRunner>, LoopError>;
}

/// Production factory: provider names map to real CLI executables.
pub struct CliRunnerFactory;

impl RunnerFactory for CliRunnerFactory {
    fn available(&self, provider: &str) -> bool {
        matches!(provider, "claude" | "codex") && which_exists(provider)
    }

    fn build(
        &self,
        provider: &str,
        model: &str,
        watchdog: WatchdogConfig,
    ) -> Result<Box<dyn AiRunner>, LoopError> {
        match provider {
            "claude" => Ok(Box::new(claude::ClaudeRunner::new(model, watchdog))),
            "codex" => Ok(Box::new(codex::CodexRunner::new(model, watchdog))),
            other => Err(LoopError::Config(format!("unknown AI provider {other:?}"))),
        }
    }
}

/// PATH probe for a provider CLI.
pub fn which_exists(name: &str) -> bool {
    std::process::Command::new("which")
        .arg(name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}
