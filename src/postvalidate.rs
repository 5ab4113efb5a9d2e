use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::LoopError;
use crate::exit::ExitStatus;
use crate::prompt::{PromptBuilder, PromptContext};
use crate::runner::AiRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    /// Both extra validators passed (or were disabled).
    Success,
    /// A validator rejected; loop another iteration with its feedback.
    Continue,
    /// A validator misbehaved or the run was cancelled.
    Exit,
}

#[derive(Debug, Clone)]
pub struct PostValidationResult {
    pub action: PostAction,
    pub exit_status: ExitStatus,
    pub feedback: Option<String>,
}

impl PostValidationResult {
    pub fn success() -> Self {
        Self {
            action: PostAction::Success,
            exit_status: ExitStatus::Success,
            feedback: None,
        }
    }

    fn continue_with(feedback: String) -> Self {
        Self {
            action: PostAction::Continue,
            exit_status: ExitStatus::Success,
            feedback: Some(feedback),
        }
    }

    fn exit(status: ExitStatus) -> Self {
        Self {
            action: PostAction::Exit,
            exit_status: status,
            feedback: None,
        }
    }
}

static CROSS_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(CONFIRMED|REJECTED)\b").expect("static regex"));

// Final-plan tools answer APPROVE/REJECT; older ones the normalized pair.
static FINAL_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(CONFIRMED|NOT_IMPLEMENTED|APPROVED?|REJECTED?)\b").expect("static regex")
});

fn normalize_final(token: &str) -> &'static str {
    match token {
        "CONFIRMED" | "APPROVE" | "APPROVED" => "CONFIRMED",
        _ => "NOT_IMPLEMENTED",
    }
}

/// The two optional validators that run after a `COMPLETE` verdict.
/// Callers hand in runners already wrapped for retry (`RetryRunner`).
pub struct PostValidationChain<'a> {
    pub cross: Option<&'a dyn AiRunner>,
    pub final_plan: Option<&'a dyn AiRunner>,
    pub prompts: &'a dyn PromptBuilder,
}

impl PostValidationChain<'_> {
    /// Run the chain. Validator subprocess errors are terminal for the
    /// chain (they do not dump the user into another impl iteration);
    /// rejections continue the loop with the validator's feedback.
    pub async fn run(
        &self,
        ctx: &PromptContext,
        iteration_dir: &Path,
        cancel: &CancellationToken,
    ) -> PostValidationResult {
        if let Some(cross) = self.cross {
            let output_path = iteration_dir.join("cross-validation-output.txt");
            let prompt = self.prompts.cross_validation_prompt(ctx);
            let text = match self.invoke(cross, &prompt, &output_path, cancel).await {
                Ok(text) => text,
                Err(e) => return Self::chain_error("cross-validator", &e),
            };
            match CROSS_TOKEN.find(&text).map(|m| m.as_str()) {
                Some("CONFIRMED") => {
                    tracing::info!("cross-validation confirmed");
                }
                Some(_) => {
                    tracing::warn!("cross-validation rejected; continuing iteration");
                    return PostValidationResult::continue_with(text);
                }
                None => {
                    tracing::error!("cross-validator emitted no recognizable verdict");
                    return PostValidationResult::exit(ExitStatus::Error);
                }
            }
        }

        if let Some(final_plan) = self.final_plan {
            let output_path = iteration_dir.join("final-plan-output.txt");
            let prompt = self.prompts.final_plan_prompt(ctx);
            let text = match self.invoke(final_plan, &prompt, &output_path, cancel).await {
                Ok(text) => text,
                Err(e) => return Self::chain_error("final-plan validator", &e),
            };
            match FINAL_TOKEN.find(&text).map(|m| normalize_final(m.as_str())) {
                Some("CONFIRMED") => {
                    tracing::info!("final-plan validation confirmed");
                }
                Some(_) => {
                    tracing::warn!("final plan not implemented; continuing iteration");
                    return PostValidationResult::continue_with(text);
                }
                None => {
                    tracing::error!("final-plan validator emitted no recognizable verdict");
                    return PostValidationResult::exit(ExitStatus::Error);
                }
            }
        }

        PostValidationResult::success()
    }

    async fn invoke(
        &self,
        runner: &dyn AiRunner,
        prompt: &str,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, LoopError> {
        runner.run(prompt, output_path, cancel).await?;
        Ok(std::fs::read_to_string(output_path)?)
    }

    fn chain_error(which: &str, err: &LoopError) -> PostValidationResult {
        if err.is_cancelled() {
            return PostValidationResult::exit(ExitStatus::Interrupted);
        }
        tracing::error!(validator = which, error = %err, "post-validation failed");
        PostValidationResult::exit(ExitStatus::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_token_normalization() {
        assert_eq!(normalize_final("APPROVE"), "CONFIRMED");
        assert_eq!(normalize_final("APPROVED"), "CONFIRMED");
        assert_eq!(normalize_final("CONFIRMED"), "CONFIRMED");
        assert_eq!(normalize_final("REJECT"), "NOT_IMPLEMENTED");
        assert_eq!(normalize_final("REJECTED"), "NOT_IMPLEMENTED");
        assert_eq!(normalize_final("NOT_IMPLEMENTED"), "NOT_IMPLEMENTED");
    }

    #[test]
    fn cross_token_first_match_wins() {
        let m = CROSS_TOKEN.find("verdict: REJECTED (was not CONFIRMED)").unwrap();
        assert_eq!(m.as_str(), "REJECTED");
    }
}
