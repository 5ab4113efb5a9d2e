use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use ralph_loop::runner::spawn_streamed;
use ralph_loop::watchdog::WatchdogConfig;

fn fast_watchdog() -> WatchdogConfig {
    WatchdogConfig {
        inactivity_timeout: Duration::from_secs(30),
        hard_cap: Duration::from_secs(60),
        poll_interval: Duration::from_millis(100),
    }
}

fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

#[tokio::test]
async fn streams_stdout_and_stderr_to_file() {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("run-stream.jsonl");
    let cancel = CancellationToken::new();

    let outcome = spawn_streamed(
        "sh",
        &sh("printf 'out line\\n'; printf 'err line\\n' >&2"),
        &raw,
        fast_watchdog(),
        &cancel,
    )
    .await
    .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert!(!outcome.watchdog_killed);
    let content = std::fs::read_to_string(&raw).unwrap();
    assert!(content.contains("out line"));
    assert!(content.contains("err line"));
}

#[tokio::test]
async fn nonzero_exit_is_reported() {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("run-stream.jsonl");
    let cancel = CancellationToken::new();

    let outcome = spawn_streamed("sh", &sh("exit 3"), &raw, fast_watchdog(), &cancel)
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, 3);
    assert!(!outcome.watchdog_killed);
}

#[tokio::test]
async fn watchdog_kills_after_terminal_marker() {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("run-stream.jsonl");
    let cancel = CancellationToken::new();

    // Emits its result then wedges; the watchdog must reap it after the
    // 2 s grace period instead of waiting out the full sleep.
    let started = std::time::Instant::now();
    let outcome = spawn_streamed(
        "sh",
        &sh("echo 'RALPH_STATUS: done'; sleep 60"),
        &raw,
        fast_watchdog(),
        &cancel,
    )
    .await
    .unwrap();

    assert!(outcome.watchdog_killed);
    assert!(started.elapsed() < Duration::from_secs(30));
    let content = std::fs::read_to_string(&raw).unwrap();
    assert!(content.contains("RALPH_STATUS"));
}

#[tokio::test]
async fn watchdog_kills_on_inactivity() {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("run-stream.jsonl");
    let cancel = CancellationToken::new();

    let config = WatchdogConfig {
        inactivity_timeout: Duration::from_secs(1),
        hard_cap: Duration::from_secs(60),
        poll_interval: Duration::from_millis(100),
    };
    let started = std::time::Instant::now();
    let outcome = spawn_streamed("sh", &sh("echo start; sleep 60"), &raw, config, &cancel)
        .await
        .unwrap();

    assert!(outcome.watchdog_killed);
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test]
async fn outer_cancellation_kills_the_subprocess() {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("run-stream.jsonl");
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
    }

    let started = std::time::Instant::now();
    let outcome = spawn_streamed(
        "sh",
        &sh("echo working; sleep 60"),
        &raw,
        fast_watchdog(),
        &cancel,
    )
    .await
    .unwrap();

    // Killed via the shared token, not by the run's own watchdog.
    assert!(!outcome.watchdog_killed);
    assert_ne!(outcome.exit_code, 0);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn missing_executable_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("run-stream.jsonl");
    let cancel = CancellationToken::new();

    let err = spawn_streamed(
        "definitely-not-a-real-binary-a3f9",
        &[],
        &raw,
        fast_watchdog(),
        &cancel,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("failed to spawn"));
}
