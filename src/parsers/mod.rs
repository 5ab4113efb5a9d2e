pub mod claude;
pub mod codex;

use crate::error::LoopError;

/// Trait for recovering the final user-visible message from a CLI's raw
/// streamed output. Each tool has its own JSONL event shape.
pub trait OutputParser: Send + Sync {
    /// Parse raw stream bytes into the assistant's final message text.
    fn parse(&self, raw: &[u8]) -> Result<String, LoopError>;
}
