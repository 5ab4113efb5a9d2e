use serde::Deserialize;

use crate::error::LoopError;
use crate::parsers::OutputParser;

/// Parses Codex CLI `--json` JSONL. Used as the recovery path when the
/// `--output-last-message` file comes back empty: extracts the text of the
/// last `agent_message` item in the stream.
pub struct CodexParser;

#[derive(Deserialize)]
struct CodexEvent {
    item: Option<CodexItem>,
    /// Some codex builds put the message at the top level.
    #[serde(rename = "type")]
    event_type: Option<String>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct CodexItem {
    #[serde(rename = "type")]
    item_type: Option<String>,
    text: Option<String>,
}

impl OutputParser for CodexParser {
    fn parse(&self, raw: &[u8]) -> Result<String, LoopError> {
        let text = String::from_utf8_lossy(raw);
        let mut last: Option<String> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event: CodexEvent = match serde_json::from_str(line) {
                Ok(e) => e,
                Err(_) => continue,
            };

            if let Some(item) = &event.item
                && item.item_type.as_deref().is_some_and(|t| t == "agent_message")
                && let Some(text) = &item.text
                && !text.is_empty()
            {
                last = Some(text.clone());
                continue;
            }

            if event.event_type.as_deref().is_some_and(|t| t == "agent_message")
                && let Some(text) = &event.text
                && !text.is_empty()
            {
                last = Some(text.clone());
            }
        }

        last.ok_or_else(|| {
            LoopError::OutputParse("no agent_message found in codex output".to_string())
        })
    }
}
