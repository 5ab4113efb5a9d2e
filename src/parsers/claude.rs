use serde::Deserialize;

use crate::error::LoopError;
use crate::parsers::OutputParser;

/// Parses claude CLI `--output-format stream-json` JSONL.
/// Prefers the terminal `result` event; falls back to the last
/// `assistant` message's text content.
pub struct ClaudeParser;

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: Option<String>,
    result: Option<String>,
    message: Option<StreamMessage>,
}

#[derive(Deserialize)]
struct StreamMessage {
    content: Option<Vec<StreamContent>>,
}

#[derive(Deserialize)]
struct StreamContent {
    #[serde(rename = "type")]
    content_type: Option<String>,
    text: Option<String>,
}

impl OutputParser for ClaudeParser {
    fn parse(&self, raw: &[u8]) -> Result<String, LoopError> {
        let text = String::from_utf8_lossy(raw);
        let mut last_result: Option<String> = None;
        let mut last_assistant: Option<String> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event: StreamEvent = match serde_json::from_str(line) {
                Ok(e) => e,
                Err(_) => continue,
            };

            match event.event_type.as_deref() {
                Some("result") => {
                    if let Some(result) = event.result
                        && !result.is_empty()
                    {
                        last_result = Some(result);
                    }
                }
                Some("assistant") => {
                    let Some(message) = &event.message else {
                        continue;
                    };
                    let Some(content) = &message.content else {
                        continue;
                    };
                    let mut parts: Vec<&str> = Vec::new();
                    for c in content {
                        if c.content_type.as_deref().is_some_and(|t| t == "text")
                            && let Some(text) = &c.text
                            && !text.is_empty()
                        {
                            parts.push(text);
                        }
                    }
                    if !parts.is_empty() {
                        last_assistant = Some(parts.join("\n"));
                    }
                }
                _ => {}
            }
        }

        last_result.or(last_assistant).ok_or_else(|| {
            LoopError::OutputParse("no assistant message found in claude stream output".to_string())
        })
    }
}
