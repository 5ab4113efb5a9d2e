use std::path::PathBuf;
use std::time::Duration;

use crate::runner::retry::RetryPolicy;
use crate::session::{Session, ValidatorSpec};
use crate::watchdog::WatchdogConfig;

/// Default state directory, created in the working directory.
pub const DEFAULT_STATE_DIR: &str = ".ralph-loop";

/// One-shot control actions handled during the resume-check phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlAction {
    #[default]
    Run,
    /// Print the persisted session summary and exit.
    Status,
    /// Wipe the state directory, then run with a fresh session.
    Clean,
    /// Mark the loaded session cancelled and exit (idempotent).
    Cancel,
}

/// Explicit CLI overrides. These beat restored-session values on resume.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub ai_provider: Option<String>,
    pub impl_model: Option<String>,
    pub val_model: Option<String>,
    pub max_iterations: Option<u32>,
    pub max_inadmissible: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub tasks_file: Option<PathBuf>,
    pub state_dir: PathBuf,

    pub ai_provider: String,
    pub impl_model: String,
    pub val_model: String,
    pub cross_validation: Option<ValidatorSpec>,
    pub final_plan_validation: Option<ValidatorSpec>,

    pub max_iterations: u32,
    pub max_inadmissible: u32,

    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_rate_limit_waits: u32,

    pub inactivity_timeout_secs: u64,
    pub hard_cap_secs: u64,
    pub poll_interval_secs: u64,

    /// `HH:MM` or RFC 3339; the loop blocks until this instant.
    pub start_at: Option<String>,

    pub learnings_enabled: bool,
    /// Relative paths resolve against the state directory.
    pub learnings_file: Option<PathBuf>,

    /// Design-spec source for tasks validation and the final-plan
    /// validator.
    pub plan_file: Option<PathBuf>,
    pub github_issue: Option<String>,

    pub control: ControlAction,
    pub resume: bool,
    pub resume_force: bool,
    pub overrides: ConfigOverrides,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tasks_file: None,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            ai_provider: "claude".to_string(),
            impl_model: String::new(),
            val_model: String::new(),
            cross_validation: None,
            final_plan_validation: None,
            max_iterations: 10,
            max_inadmissible: 3,
            max_retries: 3,
            base_delay_secs: 5,
            max_rate_limit_waits: 3,
            inactivity_timeout_secs: 300,
            hard_cap_secs: 7200,
            poll_interval_secs: 2,
            start_at: None,
            learnings_enabled: false,
            learnings_file: None,
            plan_file: None,
            github_issue: None,
            control: ControlAction::Run,
            resume: false,
            resume_force: false,
            overrides: ConfigOverrides::default(),
        }
    }
}

impl LoopConfig {
    pub fn watchdog(&self) -> WatchdogConfig {
        WatchdogConfig {
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
            hard_cap: Duration::from_secs(self.hard_cap_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_secs: self.base_delay_secs,
            max_rate_limit_waits: self.max_rate_limit_waits,
            start_attempt: 0,
            start_delay_secs: None,
        }
    }

    /// Resume overlay: adopt the restored session's tool/model/limit
    /// configuration, then re-apply explicit CLI overrides on top.
    pub fn overlay_session(&mut self, session: &Session) {
        self.ai_provider = session.ai_provider.clone();
        self.impl_model = session.impl_model.clone();
        self.val_model = session.val_model.clone();
        self.max_iterations = session.max_iterations;
        self.max_inadmissible = session.max_inadmissible;
        self.cross_validation = session.cross_validation.clone();
        self.final_plan_validation = session.final_plan_validation.clone();
        self.learnings_enabled = session.learnings.enabled;
        self.learnings_file = Some(session.learnings.file.clone());
        self.github_issue = session.github_issue.clone();

        let overrides = self.overrides.clone();
        if let Some(provider) = overrides.ai_provider {
            self.ai_provider = provider;
        }
        if let Some(model) = overrides.impl_model {
            self.impl_model = model;
        }
        if let Some(model) = overrides.val_model {
            self.val_model = model;
        }
        if let Some(max) = overrides.max_iterations {
            self.max_iterations = max;
        }
        if let Some(max) = overrides.max_inadmissible {
            self.max_inadmissible = max;
        }
    }

    /// The learnings file path, resolved: relative paths are relative to
    /// the state directory, absolute paths preserved.
    pub fn resolved_learnings_file(&self) -> PathBuf {
        let raw = self
            .learnings_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("learnings.md"));
        if raw.is_absolute() {
            raw
        } else {
            self.state_dir.join(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn learnings_path_resolution() {
        let mut config = LoopConfig {
            state_dir: PathBuf::from("/work/.ralph-loop"),
            ..LoopConfig::default()
        };
        assert_eq!(
            config.resolved_learnings_file(),
            PathBuf::from("/work/.ralph-loop/learnings.md")
        );
        config.learnings_file = Some(PathBuf::from("/abs/learn.md"));
        assert_eq!(config.resolved_learnings_file(), PathBuf::from("/abs/learn.md"));
    }

    #[test]
    fn overrides_beat_session_on_overlay() {
        let mut config = LoopConfig {
            overrides: ConfigOverrides {
                impl_model: Some("opus".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoopConfig::default()
        };
        let mut session = Session::new(PathBuf::from("/t/TASKS.md"), "h".to_string());
        session.ai_provider = "codex".to_string();
        session.impl_model = "restored-model".to_string();
        session.max_iterations = 42;

        config.overlay_session(&session);
        assert_eq!(config.ai_provider, "codex");
        assert_eq!(config.impl_model, "opus");
        assert_eq!(config.max_iterations, 42);
    }
}
