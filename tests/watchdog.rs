use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use ralph_loop::watchdog::{WatchdogConfig, watch_activity};

fn fast_config() -> WatchdogConfig {
    WatchdogConfig {
        inactivity_timeout: Duration::from_secs(10),
        hard_cap: Duration::from_secs(3600),
        poll_interval: Duration::from_millis(100),
    }
}

#[tokio::test(start_paused = true)]
async fn cancels_after_terminal_marker_plus_grace() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run-stream.jsonl");
    std::fs::write(&path, "progress...\nRALPH_STATUS: done\n").unwrap();

    let token = CancellationToken::new();
    let handle = tokio::spawn(watch_activity(path, fast_config(), token.clone()));

    tokio::time::timeout(Duration::from_secs(30), token.cancelled())
        .await
        .expect("watchdog never cancelled after marker");
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancels_on_inactivity() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run-stream.jsonl");
    std::fs::write(&path, "started\n").unwrap();

    let config = WatchdogConfig {
        inactivity_timeout: Duration::from_secs(5),
        ..fast_config()
    };
    let token = CancellationToken::new();
    let handle = tokio::spawn(watch_activity(path, config, token.clone()));

    tokio::time::timeout(Duration::from_secs(30), token.cancelled())
        .await
        .expect("watchdog never cancelled on inactivity");
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn zero_inactivity_timeout_disables_idle_detection() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run-stream.jsonl");
    std::fs::write(&path, "started\n").unwrap();

    let config = WatchdogConfig {
        inactivity_timeout: Duration::ZERO,
        hard_cap: Duration::from_secs(20),
        poll_interval: Duration::from_millis(100),
    };
    let token = CancellationToken::new();
    let handle = tokio::spawn(watch_activity(path, config, token.clone()));

    // Nothing to trip except the hard cap.
    tokio::time::timeout(Duration::from_secs(60), token.cancelled())
        .await
        .expect("hard cap never fired");
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn missing_file_is_tolerated_until_hard_cap() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("never-created.jsonl");

    let config = WatchdogConfig {
        inactivity_timeout: Duration::from_secs(2),
        hard_cap: Duration::from_secs(30),
        poll_interval: Duration::from_millis(100),
    };
    let token = CancellationToken::new();
    let handle = tokio::spawn(watch_activity(path, config, token.clone()));

    // A missing file is skipped silently each tick, so only the hard cap
    // can fire here.
    tokio::time::timeout(Duration::from_secs(60), token.cancelled())
        .await
        .expect("watchdog never cancelled");
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exits_promptly_on_external_cancellation() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run-stream.jsonl");
    std::fs::write(&path, "work\n").unwrap();

    let token = CancellationToken::new();
    let handle = tokio::spawn(watch_activity(
        path,
        WatchdogConfig::default(),
        token.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(10)).await;
    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("watchdog did not exit on cancellation")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn growing_file_without_marker_stays_alive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run-stream.jsonl");
    std::fs::write(&path, "start\n").unwrap();

    let config = WatchdogConfig {
        inactivity_timeout: Duration::from_secs(5),
        hard_cap: Duration::from_secs(3600),
        poll_interval: Duration::from_millis(100),
    };
    let token = CancellationToken::new();
    let handle = tokio::spawn(watch_activity(path.clone(), config, token.clone()));

    // Keep appending for a while; activity resets the idle clock each time.
    for i in 0..40 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!token.is_cancelled(), "cancelled while output was growing");
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| {
                use std::io::Write;
                writeln!(f, "chunk {i}")
            })
            .unwrap();
    }

    token.cancel();
    handle.await.unwrap();
}
