use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::LoopError;

/// Parse a user-supplied start instant: either RFC 3339 with offset, or a
/// bare `HH:MM` on the local wall clock (rolling to tomorrow when already
/// past).
pub fn parse_start_at(spec: &str) -> Result<DateTime<Utc>, LoopError> {
    let spec = spec.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(spec) {
        return Ok(dt.with_timezone(&Utc));
    }
    let time = NaiveTime::parse_from_str(spec, "%H:%M")
        .map_err(|_| LoopError::Config(format!("unparseable start time {spec:?} (want HH:MM or RFC 3339)")))?;
    let now = Local::now();
    let today = now.date_naive().and_time(time);
    let mut target = Local
        .from_local_datetime(&today)
        .earliest()
        .ok_or_else(|| LoopError::Config(format!("nonexistent local time {spec:?}")))?;
    if target <= now {
        let tomorrow = now
            .date_naive()
            .succ_opt()
            .ok_or_else(|| LoopError::Config("date overflow".to_string()))?
            .and_time(time);
        target = Local
            .from_local_datetime(&tomorrow)
            .earliest()
            .ok_or_else(|| LoopError::Config(format!("nonexistent local time {spec:?}")))?;
    }
    Ok(target.with_timezone(&Utc))
}

/// Block until `target` is reached, printing an adaptive countdown.
/// Returns immediately for a past target; returns `Cancelled` promptly when
/// the token fires.
pub async fn wait_until(target: DateTime<Utc>, cancel: &CancellationToken) -> Result<(), LoopError> {
    loop {
        let remaining = (target - Utc::now()).num_seconds();
        if remaining <= 0 {
            return Ok(());
        }
        tracing::info!(
            target = %target.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            remaining_secs = remaining,
            "waiting for scheduled start"
        );
        // If remaining drops below the bracket interval, clamp to remaining
        // so the final wake lands on the target, not past it.
        let tick = countdown_interval(remaining).min(remaining as u64);
        tokio::select! {
            () = cancel.cancelled() => return Err(LoopError::Cancelled),
            () = tokio::time::sleep(Duration::from_secs(tick.max(1))) => {}
        }
    }
}

/// Countdown bracket selection. Boundaries are strict greater-than: exactly
/// one hour remaining uses the 30 s bracket, exactly ten minutes the 10 s
/// bracket, exactly one minute the 1 s bracket.
pub fn countdown_interval(remaining_secs: i64) -> u64 {
    if remaining_secs > 3600 {
        60
    } else if remaining_secs > 600 {
        30
    } else if remaining_secs > 60 {
        10
    } else {
        1
    }
}
