use serde::Deserialize;

use crate::exit::ExitStatus;

/// The five validator verdicts. Anything else arbitrates to a generic
/// error exit.
pub const COMPLETE: &str = "COMPLETE";
pub const NEEDS_MORE_WORK: &str = "NEEDS_MORE_WORK";
pub const ESCALATE: &str = "ESCALATE";
pub const INADMISSIBLE: &str = "INADMISSIBLE";
pub const BLOCKED: &str = "BLOCKED";

/// Structured block the validator emits after the `RALPH_VALIDATION`
/// marker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidationReport {
    #[serde(default)]
    pub verdict: String,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub blocked_tasks: Vec<String>,
}

/// Find the validator's JSON block: the first balanced object after the
/// last `RALPH_VALIDATION` marker, falling back to the last balanced
/// object containing a `"verdict"` key anywhere in the text.
pub fn extract_report(output: &str) -> Option<ValidationReport> {
    if let Some(idx) = output.rfind("RALPH_VALIDATION")
        && let Some(json) = balanced_object(&output[idx..])
        && let Ok(report) = serde_json::from_str::<ValidationReport>(json)
    {
        return Some(report);
    }

    // Fallback: any JSON object carrying a verdict, last one wins.
    let mut last: Option<ValidationReport> = None;
    let mut rest = output;
    while let Some(start) = rest.find('{') {
        if let Some(json) = balanced_object(&rest[start..]) {
            if json.contains("\"verdict\"")
                && let Ok(report) = serde_json::from_str::<ValidationReport>(json)
            {
                last = Some(report);
            }
            rest = &rest[start + 1..];
        } else {
            break;
        }
    }
    last
}

/// First balanced `{…}` in `text`, string-literal aware.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct VerdictInput {
    pub verdict: String,
    pub feedback: Option<String>,
    /// Unchecked tasks remaining, counted fresh from the (possibly edited)
    /// tasks file.
    pub remaining: usize,
    /// Tasks the validator reported blocked.
    pub blocked_count: usize,
    pub inadmissible_count: u32,
    pub max_inadmissible: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictAction {
    Continue,
    Exit,
}

#[derive(Debug, Clone)]
pub struct VerdictResult {
    pub action: VerdictAction,
    pub exit_status: ExitStatus,
    pub feedback: Option<String>,
    pub inadmissible_count: u32,
}

impl VerdictResult {
    fn cont(feedback: Option<String>, inadmissible_count: u32) -> Self {
        Self {
            action: VerdictAction::Continue,
            exit_status: ExitStatus::Success,
            feedback,
            inadmissible_count,
        }
    }

    fn exit(status: ExitStatus, inadmissible_count: u32) -> Self {
        Self {
            action: VerdictAction::Exit,
            exit_status: status,
            feedback: None,
            inadmissible_count,
        }
    }
}

/// Map a validator verdict plus task-file state to the loop's next move.
pub fn process_verdict(input: &VerdictInput) -> VerdictResult {
    let count = input.inadmissible_count;
    match input.verdict.as_str() {
        COMPLETE => {
            let doable = input.remaining.saturating_sub(input.blocked_count);
            if input.remaining > 0 && doable > 0 {
                // Wording is a stable contract: downstream prompt assembly
                // pattern-matches on this exact sentence.
                let feedback = format!(
                    "Validation marked complete but {} tasks remain unchecked. Continuing implementation.",
                    input.remaining
                );
                VerdictResult::cont(Some(feedback), count)
            } else if input.remaining > 0 && input.blocked_count >= input.remaining {
                VerdictResult::exit(ExitStatus::Blocked, count)
            } else {
                VerdictResult::exit(ExitStatus::Success, count)
            }
        }
        NEEDS_MORE_WORK => VerdictResult::cont(input.feedback.clone(), count),
        // Escalation is already a terminal user-signal; feedback is cleared.
        ESCALATE => VerdictResult::exit(ExitStatus::Escalate, count),
        INADMISSIBLE => {
            let new_count = count + 1;
            if new_count > input.max_inadmissible {
                VerdictResult::exit(ExitStatus::Inadmissible, new_count)
            } else {
                VerdictResult::cont(input.feedback.clone(), new_count)
            }
        }
        BLOCKED => {
            let doable = input.remaining.saturating_sub(input.blocked_count);
            if doable > 0 {
                VerdictResult::cont(input.feedback.clone(), count)
            } else {
                VerdictResult::exit(ExitStatus::Blocked, count)
            }
        }
        other => {
            tracing::error!(verdict = other, "unrecognized validator verdict");
            VerdictResult::exit(ExitStatus::Error, count)
        }
    }
}
