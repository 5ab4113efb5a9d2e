use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::LoopError;

/// Current on-disk schema. Readers refuse any other value rather than
/// silently upgrading.
pub const SCHEMA_VERSION: u32 = 2;

pub const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Impl,
    Validation,
    WaitingForSchedule,
    Complete,
    Interrupted,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Complete,
    Interrupted,
    Cancelled,
    Failed,
}

/// Extra validator configuration: which CLI and model to run it with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSpec {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub target_epoch: i64,
    pub human: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningsState {
    pub enabled: bool,
    pub file: PathBuf,
}

/// The process-wide durable record. One JSON document per session,
/// rewritten after every phase transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub schema_version: u32,
    pub session_id: String,
    pub started_at: String,
    pub last_updated: String,

    pub iteration: u32,
    pub max_iterations: u32,
    pub phase: Phase,
    pub status: SessionStatus,
    /// Last validator verdict, verbatim.
    pub verdict: String,

    pub tasks_file: PathBuf,
    pub tasks_file_hash: String,

    pub ai_provider: String,
    pub impl_model: String,
    pub val_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_validation: Option<ValidatorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_plan_validation: Option<ValidatorSpec>,

    pub inadmissible_count: u32,
    pub max_inadmissible: u32,

    /// Base64-encoded; may hold arbitrary bytes including newlines and
    /// control characters. See [`encode_feedback`]/[`decode_feedback`].
    pub last_feedback: String,

    pub retry_attempt: u32,
    pub retry_delay: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleState>,

    pub learnings: LearningsState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_issue: Option<String>,
}

impl Session {
    pub fn new(tasks_file: PathBuf, tasks_file_hash: String) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            schema_version: SCHEMA_VERSION,
            session_id: next_session_id(),
            started_at: now.clone(),
            last_updated: now,
            iteration: 0,
            max_iterations: 10,
            phase: Phase::Init,
            status: SessionStatus::InProgress,
            verdict: String::new(),
            tasks_file,
            tasks_file_hash,
            ai_provider: "claude".to_string(),
            impl_model: String::new(),
            val_model: String::new(),
            cross_validation: None,
            final_plan_validation: None,
            inadmissible_count: 0,
            max_inadmissible: 3,
            last_feedback: String::new(),
            retry_attempt: 0,
            retry_delay: 0,
            schedule: None,
            learnings: LearningsState {
                enabled: false,
                file: PathBuf::from("learnings.md"),
            },
            github_issue: None,
        }
    }

    pub fn set_feedback(&mut self, feedback: &str) {
        self.last_feedback = encode_feedback(feedback);
    }

    pub fn feedback(&self) -> Option<String> {
        if self.last_feedback.is_empty() {
            None
        } else {
            Some(decode_feedback(&self.last_feedback))
        }
    }
}

/// Opaque, monotonically assignable session identity.
fn next_session_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("session-{millis}")
}

/// Feedback is unconstrained user-visible text that must survive JSON
/// round-trips, so it is stored base64-encoded.
pub fn encode_feedback(feedback: &str) -> String {
    BASE64.encode(feedback.as_bytes())
}

/// Decode stored feedback, falling back to the raw string for corrupted or
/// legacy state files.
pub fn decode_feedback(stored: &str) -> String {
    match BASE64.decode(stored.as_bytes()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => stored.to_string(),
    }
}

/// Reads and writes the session sidecar under the state directory.
/// Writes are synchronous and atomic (temp + rename), so a crash never
/// leaves a partial document.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    pub fn exists(&self) -> bool {
        self.session_path().is_file()
    }

    pub fn ensure_dir(&self) -> Result<(), LoopError> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Persist the session, refreshing `last_updated`. Callers treat
    /// failure as non-fatal; they log and continue.
    pub fn save(&self, session: &mut Session) -> Result<(), LoopError> {
        session.last_updated = Utc::now().to_rfc3339();
        self.ensure_dir()?;
        let json = serde_json::to_string_pretty(session)?;
        let path = self.session_path();
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json.as_bytes())?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn load(&self) -> Result<Session, LoopError> {
        let path = self.session_path();
        if !path.is_file() {
            return Err(LoopError::NoSession(self.dir.display().to_string()));
        }
        let content = std::fs::read_to_string(&path)?;

        // Check the schema gate before deserializing the full document so a
        // future schema's missing fields surface as a version error, not a
        // serde error.
        #[derive(Deserialize)]
        struct VersionProbe {
            schema_version: u32,
        }
        let probe: VersionProbe = serde_json::from_str(&content)?;
        if probe.schema_version != SCHEMA_VERSION {
            return Err(LoopError::SchemaVersion {
                found: probe.schema_version,
                expected: SCHEMA_VERSION,
            });
        }

        Ok(serde_json::from_str(&content)?)
    }

    /// Resume guard: the tasks file must hash to what the session recorded,
    /// unless the caller forces.
    pub fn validate_tasks_hash(&self, session: &Session, force: bool) -> Result<(), LoopError> {
        if force {
            return Ok(());
        }
        let current = crate::tasks::hash_file(&session.tasks_file)?;
        if current != session.tasks_file_hash {
            return Err(LoopError::HashMismatch);
        }
        Ok(())
    }

    /// Wipe the state directory (the `--clean` flag).
    pub fn clean(&self) -> Result<(), LoopError> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    /// Per-iteration artifact directory, `iteration-NNN` zero-padded.
    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.dir.join(format!("iteration-{iteration:03}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_round_trip() {
        let text = "line one\nline two\twith tab\u{7}";
        let encoded = encode_feedback(text);
        assert_ne!(encoded, text);
        assert_eq!(decode_feedback(&encoded), text);
    }

    #[test]
    fn feedback_decode_falls_back_to_raw() {
        // Not valid base64 → legacy/corrupted state, returned as-is.
        assert_eq!(decode_feedback("not!!base64"), "not!!base64");
    }

    #[test]
    fn iteration_dir_is_zero_padded() {
        let store = SessionStore::new("/tmp/x");
        assert!(store.iteration_dir(7).ends_with("iteration-007"));
        assert!(store.iteration_dir(123).ends_with("iteration-123"));
    }
}
