//! Exact token counting in the target model's tokenization scheme.
//!
//! Counts must match provider-side limits bit-for-bit, so this uses the
//! `cl100k_base` BPE rather than a character heuristic. The structured
//! per-message rule reproduces the counting scheme from the OpenAI
//! cookbook's "counting tokens for chat API calls": every message costs a
//! fixed 4-token framing overhead, and a present `name` field costs one
//! token less than its raw encoding.

use tiktoken_rs::{CoreBPE, cl100k_base};

use crate::PromptMessage;
use crate::error::CompletionError;

/// Fixed framing overhead added per structured message (role/name scaffolding).
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Token counter for the target model family.
///
/// Stateless between calls: `count` on identical input always returns
/// identical results.
pub struct TokenCounter {
    bpe: CoreBPE,
}

impl TokenCounter {
    /// Load the `cl100k_base` encoding. Failure here means the embedded
    /// encoder tables are unusable, which is a configuration fault.
    pub fn new() -> Result<Self, CompletionError> {
        let bpe = cl100k_base()
            .map_err(|e| CompletionError::Config(format!("failed to load cl100k_base encoding: {e}")))?;
        Ok(Self { bpe })
    }

    /// Number of tokens `text` consumes. Empty text is zero tokens.
    pub fn count(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len() as u32
    }

    /// Token cost of one structured message: the sum of every present
    /// field's encoding (role, optional name, content), minus one token when
    /// a name is present, plus the fixed per-message overhead.
    pub fn count_message(&self, message: &PromptMessage) -> u32 {
        let mut total = self.count(&message.role.to_string()) + self.count(&message.content);
        if let Some(ref name) = message.name {
            total += self.count(name).saturating_sub(1);
        }
        total + MESSAGE_OVERHEAD_TOKENS
    }
}
