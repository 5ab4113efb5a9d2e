use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use ralph_loop::ratelimit::{self, RESET_BUFFER_SECS, RateLimitInfo};

fn pinned_now() -> chrono::DateTime<Utc> {
    // 2026-03-10 12:00:00 UTC == 07:00 in America/Chicago (CDT, UTC-5).
    Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
}

#[test]
fn pattern_12h_with_minutes() {
    let info = ratelimit::detect_at("You've hit your limit. Resets 3:30pm (America/Chicago)", pinned_now())
        .unwrap();
    assert!(info.detected);
    assert!(info.parseable);
    assert_eq!(info.timezone, "America/Chicago");
    // 15:30 CDT == 20:30 UTC, same day, plus the buffer.
    let expected = Utc.with_ymd_and_hms(2026, 3, 10, 20, 30, 0).unwrap().timestamp();
    assert_eq!(info.reset_epoch, expected + RESET_BUFFER_SECS);
}

#[test]
fn pattern_12h_bare_hour() {
    let info = ratelimit::detect_at("rate limited, resets 5pm (UTC)", pinned_now()).unwrap();
    assert!(info.parseable);
    let expected = Utc.with_ymd_and_hms(2026, 3, 10, 17, 0, 0).unwrap().timestamp();
    assert_eq!(info.reset_epoch, expected + RESET_BUFFER_SECS);
}

#[test]
fn pattern_24h() {
    let info = ratelimit::detect_at("quota exhausted, reset 18:45 (UTC)", pinned_now()).unwrap();
    assert!(info.parseable);
    let expected = Utc.with_ymd_and_hms(2026, 3, 10, 18, 45, 0).unwrap().timestamp();
    assert_eq!(info.reset_epoch, expected + RESET_BUFFER_SECS);
}

#[test]
fn pattern_dated_uses_time_only() {
    // The date is captured but ignored: a reset weeks out still anchors to
    // today/tomorrow relative to "now".
    let info = ratelimit::detect_at(
        "limit reached. Resets Jan 15, 2027, 3:30pm (UTC)",
        pinned_now(),
    )
    .unwrap();
    assert!(info.parseable);
    let expected = Utc.with_ymd_and_hms(2026, 3, 10, 15, 30, 0).unwrap().timestamp();
    assert_eq!(info.reset_epoch, expected + RESET_BUFFER_SECS);
}

#[test]
fn rolls_to_tomorrow_when_not_strictly_future() {
    // 9am UTC is before the pinned noon → tomorrow.
    let info = ratelimit::detect_at("resets 9am (UTC)", pinned_now()).unwrap();
    let expected = Utc.with_ymd_and_hms(2026, 3, 11, 9, 0, 0).unwrap().timestamp();
    assert_eq!(info.reset_epoch, expected + RESET_BUFFER_SECS);
}

#[test]
fn midnight_and_noon_edge_cases() {
    let midnight = ratelimit::detect_at("resets 12am (UTC)", pinned_now()).unwrap();
    let expected = Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 0).unwrap().timestamp();
    assert_eq!(midnight.reset_epoch, expected + RESET_BUFFER_SECS);

    let noon = ratelimit::detect_at("resets 12pm (UTC)", pinned_now()).unwrap();
    let expected = Utc.with_ymd_and_hms(2026, 3, 11, 12, 0, 0).unwrap().timestamp();
    assert_eq!(noon.reset_epoch, expected + RESET_BUFFER_SECS);
}

#[test]
fn invalid_timezone_degrades_to_unparseable() {
    let info = ratelimit::detect_at("resets 3:30pm (PST)", pinned_now()).unwrap();
    assert!(info.detected);
    assert!(!info.parseable);
    assert_eq!(info.reset_epoch, 0);
}

#[test]
fn bare_patterns_detected_in_short_text() {
    for text in [
        "you've hit your limit",
        "youve hit your limit",
        "Rate limit exceeded",
        "we are being rate limited",
        "HTTP 429: too many requests",
    ] {
        let info = ratelimit::detect(text).unwrap();
        assert!(info.detected, "{text}");
        assert!(!info.parseable, "{text}");
    }
}

#[test]
fn bare_patterns_ignored_in_long_text() {
    // An essay that merely discusses rate limits must not trip detection.
    let mut text = String::from("Here is a long analysis of API design. ");
    text.push_str(&"The quick brown fox jumps over the lazy dog. ".repeat(20));
    text.push_str("Some services return 'rate limit exceeded' under load.");
    assert!(text.len() > 500);
    assert!(ratelimit::detect(&text).is_none());
}

#[test]
fn parseable_match_ignores_length_gate() {
    let mut text = "x".repeat(600);
    text.push_str(" resets 6pm (UTC)");
    let info = ratelimit::detect_at(&text, pinned_now()).unwrap();
    assert!(info.parseable);
}

#[test]
fn plain_text_not_detected() {
    assert!(ratelimit::detect("all tests passed, nothing to report").is_none());
}

#[test]
fn detection_is_idempotent() {
    let text = "resets 11:15pm (America/New_York)";
    let a = ratelimit::detect(text).unwrap();
    let b = ratelimit::detect(text).unwrap();
    // Two runs may land in different wall-clock seconds; epochs must still
    // agree within one second.
    assert!((a.reset_epoch - b.reset_epoch).abs() <= 1);
    assert_eq!(a.timezone, b.timezone);
    assert_eq!(a.parseable, b.parseable);
}

#[tokio::test]
async fn waiter_returns_immediately_for_past_reset() {
    let info = RateLimitInfo {
        detected: true,
        parseable: true,
        reset_epoch: Utc::now().timestamp() - 10,
        reset_human: String::new(),
        timezone: "UTC".to_string(),
    };
    let cancel = CancellationToken::new();
    let started = std::time::Instant::now();
    ratelimit::wait_for_reset(&info, &cancel).await.unwrap();
    assert!(started.elapsed() < std::time::Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn waiter_cancellation_returns_promptly() {
    let info = RateLimitInfo {
        detected: true,
        parseable: true,
        reset_epoch: Utc::now().timestamp() + 3600,
        reset_human: String::new(),
        timezone: "UTC".to_string(),
    };
    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            ratelimit::wait_for_reset(&info, &cancel).await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    cancel.cancel();
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("waiter did not observe cancellation")
        .unwrap();
    assert!(matches!(result, Err(ralph_loop::error::LoopError::Cancelled)));
}
