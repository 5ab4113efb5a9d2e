use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::LoopError;
use crate::parsers::{OutputParser, codex::CodexParser};
use crate::runner::{AiRunner, classify_outcome, raw_sibling, spawn_streamed};
use crate::watchdog::WatchdogConfig;

/// Runs the codex CLI via `exec --json`. Codex writes the final message
/// itself through `--output-last-message`; when that file comes back
/// empty the raw JSONL is parsed to recover the last agent message.
pub struct CodexRunner {
    pub executable: String,
    pub model: String,
    pub watchdog: WatchdogConfig,
}

impl CodexRunner {
    pub fn new(model: impl Into<String>, watchdog: WatchdogConfig) -> Self {
        Self {
            executable: "codex".to_string(),
            model: model.into(),
            watchdog,
        }
    }

    fn build_args(&self, prompt: &str, output_path: &Path) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "--json".to_string(),
            "--output-last-message".to_string(),
            output_path.display().to_string(),
            "--dangerously-bypass-approvals-and-sandbox".to_string(),
        ];
        if !self.model.is_empty() {
            args.push("--model".to_string());
            args.push(self.model.clone());
        }
        args.push(prompt.to_string());
        args
    }
}

#[async_trait]
impl AiRunner for CodexRunner {
    async fn run(
        &self,
        prompt: &str,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), LoopError> {
        let raw_path = raw_sibling(output_path);
        let args = self.build_args(prompt, output_path);

        // Pre-create the message file so downstream reads never race a
        // codex that exits before writing it.
        tokio::fs::write(output_path, b"")
            .await
            .map_err(|source| LoopError::CreateOutputFailed {
                path: output_path.display().to_string(),
                source,
            })?;

        let outcome = spawn_streamed(
            &self.executable,
            &args,
            &raw_path,
            self.watchdog.clone(),
            cancel,
        )
        .await?;

        let extracted = tokio::fs::read_to_string(output_path)
            .await
            .unwrap_or_default();
        if extracted.trim().is_empty() {
            let raw = tokio::fs::read(&raw_path).await.unwrap_or_default();
            match CodexParser.parse(&raw) {
                Ok(text) => {
                    tokio::fs::write(output_path, &text).await?;
                }
                Err(e) => {
                    tracing::debug!(path = %raw_path.display(), "no recoverable agent message: {e}");
                }
            }
        }

        classify_outcome(outcome, output_path, &raw_path, cancel).await
    }
}
