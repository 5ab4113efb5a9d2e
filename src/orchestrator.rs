use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::{ControlAction, LoopConfig};
use crate::error::LoopError;
use crate::events::{LogNotifier, LoopEvent, Notifier};
use crate::exit::ExitStatus;
use crate::postvalidate::{PostAction, PostValidationChain};
use crate::prompt::{DefaultPrompts, PromptBuilder, PromptContext};
use crate::ratelimit::RateLimitInfo;
use crate::runner::retry::{RetryObserver, RetryRunner, run_with_retry};
use crate::runner::{AiRunner, CliRunnerFactory, RunnerFactory};
use crate::session::{Phase, ScheduleState, Session, SessionStatus, SessionStore};
use crate::tasks;
use crate::verdict::{self, VerdictAction, VerdictInput};
use crate::{schedule, session};

/// GitHub-issue retrieval seam. Failures are always non-fatal.
#[async_trait]
pub trait IssueFetcher: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<String, LoopError>;
}

/// Default fetcher: shells out to the `gh` CLI.
pub struct GhIssueFetcher;

#[async_trait]
impl IssueFetcher for GhIssueFetcher {
    async fn fetch(&self, reference: &str) -> Result<String, LoopError> {
        let output = tokio::process::Command::new("gh")
            .args(["issue", "view", reference])
            .output()
            .await?;
        if !output.status.success() {
            return Err(LoopError::CommandFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Checkpoints the retry state into the session between attempts so a
/// killed process resumes mid-backoff instead of starting over.
struct RetryCheckpoint<'a> {
    session: &'a mut Session,
    store: &'a SessionStore,
}

impl RetryObserver for RetryCheckpoint<'_> {
    fn on_retry(&mut self, attempt: u32, delay_secs: u64) {
        self.session.retry_attempt = attempt + 1;
        self.session.retry_delay = delay_secs.saturating_mul(2);
        if let Err(e) = self.store.save(self.session) {
            tracing::warn!("failed to checkpoint retry state: {e}");
        }
    }

    fn on_rate_limit(&mut self, waits: u32, info: &RateLimitInfo) {
        tracing::info!(
            waits,
            parseable = info.parseable,
            reset = %info.reset_human,
            "absorbed rate limit"
        );
    }
}

/// Drives the ten phases and the iteration loop. Owns the session; all
/// state flows through it.
pub struct Orchestrator {
    config: LoopConfig,
    store: SessionStore,
    cancel: CancellationToken,
    notifier: Arc<dyn Notifier>,
    prompts: Arc<dyn PromptBuilder>,
    runners: Arc<dyn RunnerFactory>,
    issues: Arc<dyn IssueFetcher>,
}

impl Orchestrator {
    pub fn new(config: LoopConfig, cancel: CancellationToken) -> Self {
        let store = SessionStore::new(config.state_dir.clone());
        Self {
            config,
            store,
            cancel,
            notifier: Arc::new(LogNotifier),
            prompts: Arc::new(DefaultPrompts),
            runners: Arc::new(CliRunnerFactory),
            issues: Arc::new(GhIssueFetcher),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_prompts(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_runner_factory(mut self, runners: Arc<dyn RunnerFactory>) -> Self {
        self.runners = runners;
        self
    }

    pub fn with_issue_fetcher(mut self, issues: Arc<dyn IssueFetcher>) -> Self {
        self.issues = issues;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Run to completion, mapping every error onto the exit-code contract.
    pub async fn run(&self) -> ExitStatus {
        match self.run_inner().await {
            Ok(status) => status,
            Err(e) if e.is_cancelled() => {
                tracing::warn!("run interrupted");
                self.notifier.notify(&LoopEvent::Interrupted);
                ExitStatus::Interrupted
            }
            Err(e) => {
                tracing::error!("run failed: {e}");
                ExitStatus::Error
            }
        }
    }

    async fn run_inner(&self) -> Result<ExitStatus, LoopError> {
        let mut config = self.config.clone();

        // Phase 1: state directory; fresh session unless resuming (then
        // creation is deferred to the resume check).
        self.store.ensure_dir()?;

        // Phase 2: fail closed when a required CLI is missing.
        self.check_commands(&config)?;

        // Phase 3: startup banner.
        tracing::info!(
            provider = %config.ai_provider,
            impl_model = %config.impl_model,
            val_model = %config.val_model,
            max_iterations = config.max_iterations,
            state_dir = %config.state_dir.display(),
            "ralph loop starting"
        );

        // Phase 4: locate and fingerprint the tasks file.
        let cwd = std::env::current_dir()?;
        let tasks_file = tasks::find_tasks_file(config.tasks_file.as_deref(), &cwd)?;
        let tasks_hash = tasks::hash_file(&tasks_file)?;
        let unchecked = tasks::unchecked_in_file(&tasks_file)?;
        tracing::info!(tasks_file = %tasks_file.display(), unchecked, "tasks file found");
        if unchecked == 0 {
            tracing::info!("no unchecked tasks; nothing to do");
            return Ok(ExitStatus::Success);
        }

        // Phase 5: control actions and resumption.
        let mut session = match self.resume_check(&mut config, &tasks_file, &tasks_hash)? {
            ResumeOutcome::Exit(status) => return Ok(status),
            ResumeOutcome::Session(session) => session,
        };

        // Phase 6: compliance lint (warnings only) and learnings setup.
        let content = std::fs::read_to_string(&tasks_file)?;
        for warning in tasks::lint(&content) {
            tracing::warn!(tasks_file = %tasks_file.display(), "lint: {warning}");
        }
        let learnings_file = config.resolved_learnings_file();
        session.learnings = session::LearningsState {
            enabled: config.learnings_enabled,
            file: learnings_file.clone(),
        };
        if config.learnings_enabled {
            tasks::init_learnings_file(&learnings_file)?;
        }
        self.persist(&mut session);

        // Phase 7: cache the referenced issue, best-effort.
        if let Some(reference) = &config.github_issue {
            match self.issues.fetch(reference).await {
                Ok(body) => {
                    let path = self.store.dir().join("issue.md");
                    if let Err(e) = std::fs::write(&path, body) {
                        tracing::warn!("failed to cache issue: {e}");
                    } else {
                        tracing::info!(issue = %reference, path = %path.display(), "issue cached");
                    }
                }
                Err(e) => tracing::warn!(issue = %reference, "issue fetch failed: {e}"),
            }
        }

        // Phase 8: one-shot tasks validation when a spec source exists.
        if let Some(spec_text) = self.spec_source(&config) {
            match self
                .validate_tasks(&config, &session, &tasks_file, spec_text)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    self.notifier.notify(&LoopEvent::TasksInvalid);
                    return Ok(self.finish(&mut session, ExitStatus::TasksInvalid, false));
                }
                Err(e) if e.is_cancelled() => {
                    return Ok(self.finish(&mut session, ExitStatus::Interrupted, true));
                }
                Err(e) => tracing::warn!("tasks validation failed: {e}"),
            }
        }

        // Phase 9: optional scheduled start.
        if let Some(spec) = &config.start_at {
            let target = schedule::parse_start_at(spec)?;
            session.phase = Phase::WaitingForSchedule;
            session.schedule = Some(ScheduleState {
                target_epoch: target.timestamp(),
                human: target
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            });
            self.persist(&mut session);
            if let Err(e) = schedule::wait_until(target, &self.cancel).await {
                debug_assert!(e.is_cancelled());
                return Ok(self.finish(&mut session, ExitStatus::Interrupted, true));
            }
        }

        self.notifier.notify(&LoopEvent::Started {
            session_id: session.session_id.clone(),
            tasks_file: tasks_file.display().to_string(),
            max_iterations: session.max_iterations,
        });

        // Phase 10: the iteration loop.
        self.iterate(&config, &mut session, &tasks_file, &learnings_file)
            .await
    }

    async fn iterate(
        &self,
        config: &LoopConfig,
        session: &mut Session,
        tasks_file: &Path,
        learnings_file: &Path,
    ) -> Result<ExitStatus, LoopError> {
        let impl_runner =
            self.runners
                .build(&config.ai_provider, &config.impl_model, config.watchdog())?;
        let val_runner =
            self.runners
                .build(&config.ai_provider, &config.val_model, config.watchdog())?;

        while session.iteration < session.max_iterations {
            session.iteration += 1;
            if self.cancel.is_cancelled() {
                session.phase = Phase::Interrupted;
                return Ok(self.finish(session, ExitStatus::Interrupted, true));
            }

            session.phase = Phase::Impl;
            self.persist(session);

            let iter_dir = self.store.iteration_dir(session.iteration);
            std::fs::create_dir_all(&iter_dir)?;

            let ctx = PromptContext {
                tasks_file: tasks_file.display().to_string(),
                iteration: session.iteration,
                feedback: session.feedback(),
                learnings: if config.learnings_enabled {
                    crate::prompt::read_optional(learnings_file)
                } else {
                    None
                },
                ..PromptContext::default()
            };
            let prompt = if session.iteration == 1 {
                self.prompts.first_prompt(&ctx)
            } else {
                self.prompts.continue_prompt(&ctx)
            };

            let impl_out = iter_dir.join("implementation-output.txt");
            let policy = config
                .retry_policy()
                .resuming_from(session.retry_attempt, session.retry_delay);
            let result = {
                let mut checkpoint = RetryCheckpoint {
                    session: &mut *session,
                    store: &self.store,
                };
                run_with_retry(&policy, &self.cancel, &mut checkpoint, || {
                    impl_runner.run(&prompt, &impl_out, &self.cancel)
                })
                .await
            };
            session.retry_attempt = 0;
            session.retry_delay = 0;

            match result {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    return Ok(self.finish(session, ExitStatus::Interrupted, true));
                }
                Err(e) => {
                    // A single transient tool failure must not kill a
                    // multi-hour run; advance to the next iteration.
                    tracing::error!(iteration = session.iteration, "implementation run failed: {e}");
                    self.persist(session);
                    continue;
                }
            }

            if config.learnings_enabled {
                self.harvest_learnings(session, &impl_out, learnings_file);
            }

            session.phase = Phase::Validation;
            self.persist(session);

            let val_out = iter_dir.join("validation-output.txt");
            let vprompt = self.prompts.validation_prompt(&ctx);
            let policy = config.retry_policy();
            let result = {
                let mut checkpoint = RetryCheckpoint {
                    session: &mut *session,
                    store: &self.store,
                };
                run_with_retry(&policy, &self.cancel, &mut checkpoint, || {
                    val_runner.run(&vprompt, &val_out, &self.cancel)
                })
                .await
            };
            session.retry_attempt = 0;
            session.retry_delay = 0;

            match result {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    return Ok(self.finish(session, ExitStatus::Interrupted, true));
                }
                Err(e) => {
                    tracing::error!(iteration = session.iteration, "validation run failed: {e}");
                    self.persist(session);
                    continue;
                }
            }

            let val_text = std::fs::read_to_string(&val_out).unwrap_or_default();
            let Some(report) = verdict::extract_report(&val_text) else {
                tracing::error!(
                    iteration = session.iteration,
                    "validator produced no verdict block"
                );
                return Ok(self.finish(session, ExitStatus::Error, true));
            };
            session.verdict = report.verdict.clone();

            let remaining = tasks::unchecked_in_file(tasks_file)?;
            let input = VerdictInput {
                verdict: report.verdict.clone(),
                feedback: report.feedback.clone(),
                remaining,
                blocked_count: report.blocked_tasks.len(),
                inadmissible_count: session.inadmissible_count,
                max_inadmissible: session.max_inadmissible,
            };
            let outcome = verdict::process_verdict(&input);
            session.inadmissible_count = outcome.inadmissible_count;

            match outcome.action {
                VerdictAction::Continue => {
                    match &outcome.feedback {
                        Some(feedback) => session.set_feedback(feedback),
                        None => session.last_feedback.clear(),
                    }
                    self.persist(session);
                    continue;
                }
                VerdictAction::Exit => match outcome.exit_status {
                    ExitStatus::Success => {
                        let chain_ctx = PromptContext {
                            tasks_file: tasks_file.display().to_string(),
                            iteration: session.iteration,
                            impl_output: std::fs::read_to_string(&impl_out).ok(),
                            validation_output: Some(val_text.clone()),
                            spec_text: self.spec_source(config),
                            ..PromptContext::default()
                        };
                        match self
                            .post_validate(config, &chain_ctx, &iter_dir)
                            .await?
                        {
                            PostOutcome::Done => {
                                return Ok(self.finish(session, ExitStatus::Success, true));
                            }
                            PostOutcome::Loop(feedback) => {
                                session.set_feedback(&feedback);
                                self.persist(session);
                                continue;
                            }
                            PostOutcome::Abort(status) => {
                                return Ok(self.finish(session, status, true));
                            }
                        }
                    }
                    status => {
                        return Ok(self.finish(session, status, true));
                    }
                },
            }
        }

        Ok(self.finish(session, ExitStatus::MaxIterations, true))
    }

    async fn post_validate(
        &self,
        config: &LoopConfig,
        ctx: &PromptContext,
        iter_dir: &std::path::Path,
    ) -> Result<PostOutcome, LoopError> {
        let cross = match &config.cross_validation {
            Some(spec) => Some(RetryRunner::new(
                self.runners.build(&spec.provider, &spec.model, config.watchdog())?,
                config.retry_policy(),
            )),
            None => None,
        };
        let final_plan = match &config.final_plan_validation {
            Some(spec) => Some(RetryRunner::new(
                self.runners.build(&spec.provider, &spec.model, config.watchdog())?,
                config.retry_policy(),
            )),
            None => None,
        };
        if cross.is_none() && final_plan.is_none() {
            return Ok(PostOutcome::Done);
        }

        let chain = PostValidationChain {
            cross: cross.as_ref().map(|r| r as &dyn AiRunner),
            final_plan: final_plan.as_ref().map(|r| r as &dyn AiRunner),
            prompts: self.prompts.as_ref(),
        };
        let result = chain.run(ctx, iter_dir, &self.cancel).await;
        Ok(match result.action {
            PostAction::Success => PostOutcome::Done,
            PostAction::Continue => PostOutcome::Loop(result.feedback.unwrap_or_default()),
            PostAction::Exit => PostOutcome::Abort(result.exit_status),
        })
    }

    fn harvest_learnings(
        &self,
        session: &Session,
        impl_out: &std::path::Path,
        learnings_file: &std::path::Path,
    ) {
        let Ok(text) = std::fs::read_to_string(impl_out) else {
            return;
        };
        if let Some(learnings) = tasks::extract_learnings(&text) {
            match tasks::append_learnings(learnings_file, session.iteration, &learnings) {
                Ok(()) => tracing::info!(iteration = session.iteration, "learnings appended"),
                Err(e) => tracing::warn!("failed to append learnings: {e}"),
            }
        }
    }

    fn check_commands(&self, config: &LoopConfig) -> Result<(), LoopError> {
        let mut providers = vec![config.ai_provider.clone()];
        if let Some(spec) = &config.cross_validation
            && !providers.contains(&spec.provider)
        {
            providers.push(spec.provider.clone());
        }
        if let Some(spec) = &config.final_plan_validation
            && !providers.contains(&spec.provider)
        {
            providers.push(spec.provider.clone());
        }
        for provider in providers {
            if !self.runners.available(&provider) {
                return Err(LoopError::Config(format!(
                    "{provider} CLI not found in PATH"
                )));
            }
        }
        Ok(())
    }

    fn resume_check(
        &self,
        config: &mut LoopConfig,
        tasks_file: &std::path::Path,
        tasks_hash: &str,
    ) -> Result<ResumeOutcome, LoopError> {
        match config.control {
            ControlAction::Status => {
                match self.store.load() {
                    Ok(session) => print_status(&session),
                    Err(LoopError::NoSession(dir)) => println!("no session found in {dir}"),
                    Err(e) => return Err(e),
                }
                return Ok(ResumeOutcome::Exit(ExitStatus::Success));
            }
            ControlAction::Cancel => {
                match self.store.load() {
                    Ok(mut session) => {
                        session.status = SessionStatus::Cancelled;
                        session.phase = Phase::Cancelled;
                        self.persist(&mut session);
                        tracing::info!(session_id = %session.session_id, "session cancelled");
                    }
                    // Idempotent: cancelling nothing is still success.
                    Err(LoopError::NoSession(_)) => {}
                    Err(e) => return Err(e),
                }
                return Ok(ResumeOutcome::Exit(ExitStatus::Success));
            }
            ControlAction::Clean => {
                self.store.clean()?;
                self.store.ensure_dir()?;
                tracing::info!(dir = %self.store.dir().display(), "state directory cleaned");
            }
            ControlAction::Run => {}
        }

        if config.resume && config.control != ControlAction::Clean {
            let session = self.store.load()?;
            self.store
                .validate_tasks_hash(&session, config.resume_force)?;
            config.overlay_session(&session);
            let mut session = session;
            session.status = SessionStatus::InProgress;
            session.max_iterations = config.max_iterations;
            session.max_inadmissible = config.max_inadmissible;
            session.ai_provider = config.ai_provider.clone();
            session.impl_model = config.impl_model.clone();
            session.val_model = config.val_model.clone();
            tracing::info!(
                session_id = %session.session_id,
                iteration = session.iteration,
                "resuming session"
            );
            return Ok(ResumeOutcome::Session(session));
        }

        let mut session = Session::new(tasks_file.to_path_buf(), tasks_hash.to_string());
        session.max_iterations = config.max_iterations;
        session.max_inadmissible = config.max_inadmissible;
        session.ai_provider = config.ai_provider.clone();
        session.impl_model = config.impl_model.clone();
        session.val_model = config.val_model.clone();
        session.cross_validation = config.cross_validation.clone();
        session.final_plan_validation = config.final_plan_validation.clone();
        session.github_issue = config.github_issue.clone();
        self.persist(&mut session);
        Ok(ResumeOutcome::Session(session))
    }

    async fn validate_tasks(
        &self,
        config: &LoopConfig,
        session: &Session,
        tasks_file: &std::path::Path,
        spec_text: String,
    ) -> Result<bool, LoopError> {
        let runner = RetryRunner::new(
            self.runners
                .build(&config.ai_provider, &config.val_model, config.watchdog())?,
            config.retry_policy(),
        );
        let ctx = PromptContext {
            tasks_file: tasks_file.display().to_string(),
            iteration: session.iteration,
            spec_text: Some(spec_text),
            ..PromptContext::default()
        };
        let prompt = self.prompts.tasks_validation_prompt(&ctx);
        let output_path = self.store.dir().join("tasks-validation-output.txt");
        runner.run(&prompt, &output_path, &self.cancel).await?;
        let text = std::fs::read_to_string(&output_path)?;
        match first_validity_token(&text) {
            Some(false) => {
                tracing::error!("tasks validation verdict: INVALID");
                Ok(false)
            }
            Some(true) => {
                tracing::info!("tasks validation verdict: VALID");
                Ok(true)
            }
            None => {
                tracing::warn!("tasks validator emitted no VALID/INVALID verdict; proceeding");
                Ok(true)
            }
        }
    }

    /// Design-spec text for validators: the explicit plan file, else the
    /// cached issue body.
    fn spec_source(&self, config: &LoopConfig) -> Option<String> {
        if let Some(plan) = &config.plan_file
            && let Some(text) = crate::prompt::read_optional(plan)
        {
            return Some(text);
        }
        crate::prompt::read_optional(&self.store.dir().join("issue.md"))
    }

    /// Terminal bookkeeping: status, persistence, event.
    fn finish(&self, session: &mut Session, status: ExitStatus, notify: bool) -> ExitStatus {
        session.status = match status {
            ExitStatus::Success => SessionStatus::Complete,
            ExitStatus::Interrupted => SessionStatus::Interrupted,
            _ => SessionStatus::Failed,
        };
        if status == ExitStatus::Success {
            session.phase = Phase::Complete;
        }
        self.persist(session);
        if notify
            && let Some(event) =
                LoopEvent::for_exit(status, session.iteration, session.max_iterations)
        {
            self.notifier.notify(&event);
        }
        tracing::info!(
            exit = status.as_str(),
            code = status.code(),
            iteration = session.iteration,
            "run finished"
        );
        status
    }

    /// Persistence is non-fatal by contract: log and keep going.
    fn persist(&self, session: &mut Session) {
        if let Err(e) = self.store.save(session) {
            tracing::warn!("failed to persist session: {e}");
        }
    }
}

enum ResumeOutcome {
    Exit(ExitStatus),
    Session(Session),
}

enum PostOutcome {
    Done,
    Loop(String),
    Abort(ExitStatus),
}

/// Leftmost VALID/INVALID token; INVALID listed first so the alternation
/// cannot match the VALID suffix inside INVALID.
fn first_validity_token(text: &str) -> Option<bool> {
    static TOKEN: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"\b(INVALID|VALID)\b").expect("static regex")
    });
    TOKEN.find(text).map(|m| m.as_str() == "VALID")
}

fn print_status(session: &Session) {
    let schedule = session
        .schedule
        .as_ref()
        .map(|s| {
            let local = Utc
                .timestamp_opt(s.target_epoch, 0)
                .single()
                .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| s.human.clone());
            format!("\n  scheduled start: {local}")
        })
        .unwrap_or_default();
    println!(
        "session {id}\n  status: {status:?}\n  phase: {phase:?}\n  iteration: {iter}/{max}\n  verdict: {verdict}\n  tasks file: {tasks}\n  last update: {updated}{schedule}",
        id = session.session_id,
        status = session.status,
        phase = session.phase,
        iter = session.iteration,
        max = session.max_iterations,
        verdict = if session.verdict.is_empty() { "-" } else { &session.verdict },
        tasks = session.tasks_file.display(),
        updated = session.last_updated,
    );
}
