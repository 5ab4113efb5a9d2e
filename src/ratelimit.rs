use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::LoopError;

/// Safety margin added to every parsed reset instant. Provider clocks and
/// ours disagree by seconds; waking exactly on the minute still rate-limits.
pub const RESET_BUFFER_SECS: i64 = 60;

/// Bare-pattern detection only runs on short content. Long analytical output
/// that merely *discusses* rate limits must not trip the detector.
pub const BARE_SCAN_MAX_BYTES: usize = 500;

/// Fallback sleep when a rate limit is detected but no reset time parses.
pub const UNPARSEABLE_WAIT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub detected: bool,
    pub parseable: bool,
    /// Unix seconds of the reset instant, including [`RESET_BUFFER_SECS`].
    /// Zero when `parseable` is false.
    pub reset_epoch: i64,
    pub reset_human: String,
    /// IANA zone name as captured from the message.
    pub timezone: String,
}

impl RateLimitInfo {
    fn bare() -> Self {
        Self {
            detected: true,
            parseable: false,
            reset_epoch: 0,
            reset_human: String::new(),
            timezone: String::new(),
        }
    }
}

// IANA zone names: "UTC", "America/New_York", "Etc/GMT+5". Abbreviations
// like "PST" parse as invalid downstream and surface as parseable=false.
const TZ: &str = r"([A-Za-z][A-Za-z0-9_+\-]*(?:/[A-Za-z0-9_+\-]+)*)";

// Ordered highest-specificity first; the first match wins. Pattern 1 must
// run before pattern 3 or "3:30pm (America/Chicago)" loses its am/pm marker.
static RESET_12H_MINUTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)resets?\s+(\d{{1,2}}):(\d{{2}})\s*(am|pm)\s*\(?\s*{TZ}\s*\)?"
    ))
    .expect("static regex")
});

static RESET_12H: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)resets?\s+(\d{{1,2}})\s*(am|pm)\s*\(?\s*{TZ}\s*\)?"
    ))
    .expect("static regex")
});

static RESET_24H: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)resets?\s+(\d{{1,2}}):(\d{{2}})\s*\(?\s*{TZ}\s*\)?"
    ))
    .expect("static regex")
});

// Explicit date form, e.g. "resets Jan 15, 2026, 3:30pm (America/Chicago)".
// Only the time-of-day is resolved; the captured date is ignored, so a reset
// more than a day away still anchors to today/tomorrow.
static RESET_DATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)resets?\s+[A-Za-z]{{3,9}}\s+\d{{1,2}},\s*\d{{4}},?\s*(?:at\s+)?(\d{{1,2}})(?::(\d{{2}}))?\s*(am|pm)?\s*\(?\s*{TZ}\s*\)?"
    ))
    .expect("static regex")
});

static BARE_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)you'?ve hit your limit|rate limit exceeded|rate limited|too many requests")
        .expect("static regex")
});

/// Scan arbitrary subprocess output for a rate-limit marker.
///
/// Returns `None` when nothing matched, `Some` with `parseable=true` and a
/// resolved epoch when a reset time was extracted, or `Some` with
/// `parseable=false` for bare markers and unresolvable times.
pub fn detect(text: &str) -> Option<RateLimitInfo> {
    detect_at(text, Utc::now())
}

/// [`detect`] with an injected clock, so tests can pin "now".
pub fn detect_at(text: &str, now: DateTime<Utc>) -> Option<RateLimitInfo> {
    if let Some(caps) = RESET_12H_MINUTES.captures(text) {
        let parsed = parse_12h(&caps[1], &caps[2], &caps[3])
            .and_then(|(h, m)| resolve_epoch(h, m, caps[4].trim(), now));
        return Some(build_info(parsed, caps[4].trim()));
    }
    if let Some(caps) = RESET_12H.captures(text) {
        let parsed =
            parse_12h(&caps[1], "0", &caps[2]).and_then(|(h, m)| resolve_epoch(h, m, caps[3].trim(), now));
        return Some(build_info(parsed, caps[3].trim()));
    }
    if let Some(caps) = RESET_24H.captures(text) {
        let parsed = parse_24h(&caps[1], &caps[2])
            .and_then(|(h, m)| resolve_epoch(h, m, caps[3].trim(), now));
        return Some(build_info(parsed, caps[3].trim()));
    }
    if let Some(caps) = RESET_DATED.captures(text) {
        let minute = caps.get(2).map(|m| m.as_str());
        let ampm = caps.get(3).map(|m| m.as_str());
        let tz = caps[4].trim().to_string();
        let parsed = match (minute, ampm) {
            (_, Some(ap)) => parse_12h(&caps[1], minute.unwrap_or("0"), ap),
            (Some(min), None) => parse_24h(&caps[1], min),
            // Bare "1800"-style hour with neither colon nor am/pm is ambiguous.
            (None, None) => Err(LoopError::ResetParse(
                "time without minutes or am/pm marker".to_string(),
            )),
        }
        .and_then(|(h, m)| resolve_epoch(h, m, &tz, now));
        return Some(build_info(parsed, &tz));
    }

    if text.len() <= BARE_SCAN_MAX_BYTES && BARE_PATTERNS.is_match(text) {
        return Some(RateLimitInfo::bare());
    }
    None
}

fn build_info(parsed: Result<i64, LoopError>, tz: &str) -> RateLimitInfo {
    match parsed {
        Ok(epoch) => RateLimitInfo {
            detected: true,
            parseable: true,
            reset_epoch: epoch,
            reset_human: human_reset(epoch, tz),
            timezone: tz.to_string(),
        },
        Err(e) => {
            tracing::debug!("rate-limit reset time did not parse: {e}");
            RateLimitInfo::bare()
        }
    }
}

fn parse_12h(hour: &str, minute: &str, ampm: &str) -> Result<(u32, u32), LoopError> {
    let h: u32 = hour
        .trim()
        .parse()
        .map_err(|_| LoopError::ResetParse(format!("non-numeric hour {hour:?}")))?;
    let m: u32 = minute
        .trim()
        .parse()
        .map_err(|_| LoopError::ResetParse(format!("non-numeric minute {minute:?}")))?;
    if !(1..=12).contains(&h) || m > 59 {
        return Err(LoopError::ResetParse(format!("12h time out of range: {h}:{m:02}")));
    }
    let h24 = match (h, ampm.eq_ignore_ascii_case("pm")) {
        (12, false) => 0,
        (12, true) => 12,
        (h, true) => h + 12,
        (h, false) => h,
    };
    Ok((h24, m))
}

fn parse_24h(hour: &str, minute: &str) -> Result<(u32, u32), LoopError> {
    let h: u32 = hour
        .trim()
        .parse()
        .map_err(|_| LoopError::ResetParse(format!("non-numeric hour {hour:?}")))?;
    let m: u32 = minute
        .trim()
        .parse()
        .map_err(|_| LoopError::ResetParse(format!("non-numeric minute {minute:?}")))?;
    if h > 23 || m > 59 {
        return Err(LoopError::ResetParse(format!("24h time out of range: {h}:{m:02}")));
    }
    Ok((h, m))
}

/// Build today's instant at `hour:minute` in `tz_name`; if that is not
/// strictly after `now`, roll to tomorrow. Adds [`RESET_BUFFER_SECS`].
fn resolve_epoch(hour: u32, minute: u32, tz_name: &str, now: DateTime<Utc>) -> Result<i64, LoopError> {
    let tz: Tz = tz_name
        .parse()
        .map_err(|_| LoopError::ResetParse(format!("invalid timezone {tz_name:?}")))?;
    let local_now = now.with_timezone(&tz);

    let today = local_now.date_naive();
    let mut resolved = at_local(tz, today, hour, minute)?;
    if resolved <= local_now {
        let tomorrow = today
            .succ_opt()
            .ok_or_else(|| LoopError::ResetParse("date overflow".to_string()))?;
        resolved = at_local(tz, tomorrow, hour, minute)?;
    }
    Ok(resolved.timestamp() + RESET_BUFFER_SECS)
}

fn at_local(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> Result<DateTime<Tz>, LoopError> {
    let naive = date
        .and_hms_opt(hour, minute, 0)
        .ok_or_else(|| LoopError::ResetParse(format!("invalid time {hour}:{minute:02}")))?;
    // DST gaps make some local times nonexistent; take the earliest valid
    // mapping (for ambiguous fall-back times) or fail.
    tz.from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| LoopError::ResetParse(format!("nonexistent local time {hour}:{minute:02} in {tz}")))
}

fn human_reset(epoch: i64, tz_name: &str) -> String {
    let utc = Utc
        .timestamp_opt(epoch, 0)
        .single()
        .unwrap_or_else(Utc::now);
    match tz_name.parse::<Tz>() {
        Ok(tz) => format!("{} ({tz_name})", utc.with_timezone(&tz).format("%Y-%m-%d %H:%M")),
        Err(_) => utc.format("%Y-%m-%d %H:%M UTC").to_string(),
    }
}

/// Sleep until `info.reset_epoch`, rechecking on an adaptive tick so a
/// system clock jump shortens the wait. Returns immediately for past
/// resets; returns `Cancelled` promptly when the token fires.
pub async fn wait_for_reset(info: &RateLimitInfo, cancel: &CancellationToken) -> Result<(), LoopError> {
    let first = remaining_secs(info.reset_epoch);
    if first <= 0 {
        return Ok(());
    }
    tracing::info!(
        reset = %info.reset_human,
        remaining_secs = first,
        "waiting for rate limit reset"
    );
    loop {
        let remaining = remaining_secs(info.reset_epoch);
        if remaining <= 0 {
            return Ok(());
        }
        let tick = tick_interval(remaining).min(remaining as u64);
        tokio::select! {
            () = cancel.cancelled() => return Err(LoopError::Cancelled),
            () = tokio::time::sleep(Duration::from_secs(tick.max(1))) => {}
        }
    }
}

fn remaining_secs(reset_epoch: i64) -> i64 {
    reset_epoch - Utc::now().timestamp()
}

fn tick_interval(remaining: i64) -> u64 {
    if remaining >= 300 {
        60
    } else if remaining >= 60 {
        30
    } else {
        5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noon_utc() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn twelve_hour_conversion() {
        assert_eq!(parse_12h("12", "0", "am").unwrap(), (0, 0));
        assert_eq!(parse_12h("12", "30", "pm").unwrap(), (12, 30));
        assert_eq!(parse_12h("3", "05", "pm").unwrap(), (15, 5));
        assert_eq!(parse_12h("9", "00", "am").unwrap(), (9, 0));
        assert!(parse_12h("13", "00", "pm").is_err());
    }

    #[test]
    fn same_day_when_strictly_future() {
        // 18:00 UTC is after the injected noon → today.
        let epoch = resolve_epoch(18, 0, "UTC", noon_utc()).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 3, 10, 18, 0, 0).unwrap().timestamp();
        assert_eq!(epoch, expected + RESET_BUFFER_SECS);
    }

    #[test]
    fn rolls_to_tomorrow_when_past_or_equal() {
        let epoch = resolve_epoch(12, 0, "UTC", noon_utc()).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 3, 11, 12, 0, 0).unwrap().timestamp();
        assert_eq!(epoch, expected + RESET_BUFFER_SECS);
    }

    #[test]
    fn tick_brackets() {
        assert_eq!(tick_interval(301), 60);
        assert_eq!(tick_interval(300), 60);
        assert_eq!(tick_interval(299), 30);
        assert_eq!(tick_interval(60), 30);
        assert_eq!(tick_interval(59), 5);
    }
}
