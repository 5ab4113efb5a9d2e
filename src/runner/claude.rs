use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::LoopError;
use crate::parsers::{OutputParser, claude::ClaudeParser};
use crate::runner::{AiRunner, classify_outcome, raw_sibling, spawn_streamed};
use crate::watchdog::WatchdogConfig;

/// Runs the claude CLI in non-interactive streaming mode. The JSONL stream
/// lands in the raw sibling file; the final assistant text is extracted
/// into `output_path` afterwards.
pub struct ClaudeRunner {
    pub executable: String,
    pub model: String,
    pub max_turns: u32,
    pub watchdog: WatchdogConfig,
}

impl ClaudeRunner {
    pub fn new(model: impl Into<String>, watchdog: WatchdogConfig) -> Self {
        Self {
            executable: "claude".to_string(),
            model: model.into(),
            max_turns: 200,
            watchdog,
        }
    }

    fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if !self.model.is_empty() {
            args.push("--model".to_string());
            args.push(self.model.clone());
        }
        args.push("--max-turns".to_string());
        args.push(self.max_turns.to_string());
        args.push("--prompt".to_string());
        args.push(prompt.to_string());
        args
    }
}

#[async_trait]
impl AiRunner for ClaudeRunner {
    async fn run(
        &self,
        prompt: &str,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), LoopError> {
        let raw_path = raw_sibling(output_path);
        let args = self.build_args(prompt);

        let outcome = spawn_streamed(
            &self.executable,
            &args,
            &raw_path,
            self.watchdog.clone(),
            cancel,
        )
        .await?;

        // Extract the final assistant message from the stream. An
        // unparseable stream still produces an (empty) output file so
        // downstream reads and rate-limit detection have something to open.
        let raw = tokio::fs::read(&raw_path).await.unwrap_or_default();
        let text = match ClaudeParser.parse(&raw) {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!(path = %raw_path.display(), "no extractable message: {e}");
                String::new()
            }
        };
        tokio::fs::write(output_path, &text)
            .await
            .map_err(|source| LoopError::CreateOutputFailed {
                path: output_path.display().to_string(),
                source,
            })?;

        classify_outcome(outcome, output_path, &raw_path, cancel).await
    }
}
