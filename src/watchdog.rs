use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The assistant's final structured block starts with one of these; once
/// seen, the subprocess gets a short grace period to flush and is then
/// cancelled.
pub const TERMINAL_MARKERS: [&str; 2] = ["RALPH_STATUS", "RALPH_VALIDATION"];

/// Grace between first marker sighting and cancellation.
pub const MARKER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Cancel when the output file stops growing for this long. Zero
    /// disables inactivity detection.
    pub inactivity_timeout: Duration,
    /// Absolute ceiling on subprocess runtime.
    pub hard_cap: Duration,
    pub poll_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(300),
            hard_cap: Duration::from_secs(7200),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Tail `path` and cancel `subprocess` when the run should end: hard cap
/// elapsed, terminal marker flushed (plus grace), or output inactive past
/// the timeout.
///
/// File growth is the authoritative liveness signal: a wedged subprocess
/// can hold its handle open forever without writing. The watchdog shares
/// the subprocess's cancellation token and never reports a value; it also
/// exits promptly when that token is cancelled from outside.
pub async fn watch_activity(path: PathBuf, config: WatchdogConfig, subprocess: CancellationToken) {
    let started = Instant::now();
    let mut last_change = Instant::now();
    let mut last_size: Option<u64> = None;
    let mut marker_seen_at: Option<Instant> = None;

    loop {
        tokio::select! {
            () = subprocess.cancelled() => return,
            () = tokio::time::sleep(config.poll_interval) => {}
        }

        if started.elapsed() >= config.hard_cap {
            tracing::warn!(path = %path.display(), "hard cap reached; cancelling subprocess");
            subprocess.cancel();
            return;
        }

        // The file may not exist yet if the subprocess is still starting.
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => continue,
        };

        if last_size != Some(size) {
            last_size = Some(size);
            last_change = Instant::now();

            if marker_seen_at.is_none() {
                match tokio::fs::read(&path).await {
                    Ok(bytes) => {
                        if contains_marker(&bytes) {
                            tracing::debug!(path = %path.display(), "terminal marker seen");
                            marker_seen_at = Some(Instant::now());
                        }
                    }
                    Err(e) => {
                        tracing::debug!(path = %path.display(), "watchdog read failed: {e}");
                    }
                }
            }
        }

        if let Some(seen) = marker_seen_at
            && seen.elapsed() > MARKER_GRACE
        {
            tracing::info!(path = %path.display(), "result flushed; cancelling subprocess");
            subprocess.cancel();
            return;
        }

        if !config.inactivity_timeout.is_zero() && last_change.elapsed() >= config.inactivity_timeout {
            tracing::warn!(
                path = %path.display(),
                idle_secs = last_change.elapsed().as_secs(),
                "no output activity; cancelling subprocess"
            );
            subprocess.cancel();
            return;
        }
    }
}

fn contains_marker(bytes: &[u8]) -> bool {
    TERMINAL_MARKERS
        .iter()
        .any(|m| bytes.windows(m.len()).any(|w| w == m.as_bytes()))
}
