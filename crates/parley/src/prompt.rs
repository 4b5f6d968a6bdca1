//! Prompt assembly under a hard token budget.
//!
//! The budgeter rebuilds one conversation's prompt from stored history:
//! a synthesized system instruction goes first, then as many history turns
//! as fit, selected newest-first so the model never sees a prompt where
//! only stale context survived. Older turns are dropped whole; there is no
//! partial-message truncation. The walk is a plain iterative loop.

use std::collections::VecDeque;

use chrono::Local;
use tracing::debug;

use crate::error::CompletionError;
use crate::store::StoredMessage;
use crate::tokens::TokenCounter;
use crate::{MessageRole, PromptMessage};

// ── Budget constants ───────────────────────────────────────────────

/// Combined prompt + response budget a model call may consume.
pub const MAX_CONTEXT_TOKENS: u32 = 4095;

/// Target output budget, adjusted downward when the prompt runs long.
pub const MAX_RESPONSE_TOKENS: u32 = 1024;

/// Fixed metadata overhead added to every assembled prompt.
const PROMPT_METADATA_TOKENS: u32 = 2;

const PERSONA: &str =
    "You are Parley, a large language model assistant. Respond conversationally.";

/// Today's date in long en-US form, e.g. "August 29, 2026".
fn current_date_string() -> String {
    Local::now().format("%B %-d, %Y").to_string()
}

// ── Plan ───────────────────────────────────────────────────────────

/// A trimmed, ordered prompt that fits the token budget.
#[derive(Debug)]
pub struct PromptPlan {
    /// System instruction first, selected history in chronological order.
    pub messages: Vec<PromptMessage>,
    /// Tokens the assembled prompt consumes, metadata overhead included.
    pub prompt_tokens: u32,
    /// Output budget left for the model's reply.
    pub response_budget: u32,
}

// ── Budgeter ───────────────────────────────────────────────────────

/// Builds a [`PromptPlan`] from ordered conversation history.
///
/// Selection is newest-first: walking from the most recent turn backwards,
/// each turn is kept while it still fits under the prompt budget, and the
/// walk stops at the first turn that does not. A conversation with no
/// history succeeds with the system instruction alone; a newest turn that
/// cannot fit by itself fails the request rather than silently truncating.
pub struct PromptBudgeter<'a> {
    counter: &'a TokenCounter,
    max_context_tokens: u32,
    max_response_tokens: u32,
}

impl<'a> PromptBudgeter<'a> {
    pub fn new(counter: &'a TokenCounter) -> Self {
        Self {
            counter,
            max_context_tokens: MAX_CONTEXT_TOKENS,
            max_response_tokens: MAX_RESPONSE_TOKENS,
        }
    }

    /// Override the budget constants (tests, smaller models).
    pub fn with_limits(mut self, max_context_tokens: u32, max_response_tokens: u32) -> Self {
        self.max_context_tokens = max_context_tokens;
        self.max_response_tokens = max_response_tokens;
        self
    }

    /// Tokens available for the prompt once the response target is reserved.
    pub fn max_prompt_tokens(&self) -> u32 {
        self.max_context_tokens.saturating_sub(self.max_response_tokens)
    }

    /// Assemble the prompt for one completion request.
    ///
    /// `history` is oldest-to-newest; `owner_id` becomes the identity tag on
    /// every selected history message.
    pub fn build(
        &self,
        owner_id: &str,
        history: &[StoredMessage],
    ) -> Result<PromptPlan, CompletionError> {
        if self.max_response_tokens >= self.max_context_tokens {
            return Err(CompletionError::Config(format!(
                "response budget {} must be below the {}-token context window",
                self.max_response_tokens, self.max_context_tokens,
            )));
        }

        let budget = self.max_prompt_tokens();
        let system = PromptMessage::system(format!(
            "{PERSONA}\nCurrent date: {}",
            current_date_string()
        ));

        // Metadata overhead is counted up front so the selection bound below
        // is exact: the final total never exceeds the prompt budget.
        let mut running = self.counter.count_message(&system) + PROMPT_METADATA_TOKENS;
        if running >= budget {
            return Err(CompletionError::Config(format!(
                "system instruction alone costs {running} tokens against a {budget}-token prompt budget",
            )));
        }

        let mut selected: VecDeque<PromptMessage> = VecDeque::new();
        for turn in history.iter().rev() {
            let candidate =
                PromptMessage::tagged(turn.role, owner_id, turn.content.clone());
            let cost = self.counter.count_message(&candidate);
            if running + cost < budget {
                running += cost;
                selected.push_front(candidate);
            } else if selected.is_empty() {
                // The newest turn must be present or the request is not
                // answerable; dropping it silently is worse than failing.
                return Err(CompletionError::Config(format!(
                    "newest message costs {cost} tokens; only {} of the {budget}-token prompt budget remain",
                    budget - running,
                )));
            } else {
                // Everything older than the first non-fitting turn is dropped.
                break;
            }
        }

        let response_budget = self
            .max_context_tokens
            .saturating_sub(running)
            .min(self.max_response_tokens);

        debug!(
            prompt_tokens = running,
            response_budget,
            selected = selected.len(),
            dropped = history.len() - selected.len(),
            "prompt assembled"
        );

        let mut messages = Vec::with_capacity(selected.len() + 1);
        messages.push(system);
        messages.extend(selected);

        Ok(PromptPlan {
            messages,
            prompt_tokens: running,
            response_budget,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn counter() -> TokenCounter {
        TokenCounter::new().expect("cl100k_base loads")
    }

    fn turn(role: MessageRole, content: &str) -> StoredMessage {
        StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: "conv-1".into(),
            owner_id: "user-1".into(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn empty_history_yields_system_message_only() {
        let c = counter();
        let plan = PromptBudgeter::new(&c).build("user-1", &[]).unwrap();
        assert_eq!(plan.messages.len(), 1);
        assert_eq!(plan.messages[0].role, MessageRole::System);
        assert_eq!(plan.response_budget, MAX_RESPONSE_TOKENS);
    }

    #[test]
    fn system_message_is_always_first() {
        let c = counter();
        let history = vec![
            turn(MessageRole::User, "Hi"),
            turn(MessageRole::Assistant, "Hello!"),
            turn(MessageRole::User, "What's the weather?"),
        ];
        let plan = PromptBudgeter::new(&c).build("user-1", &history).unwrap();
        assert_eq!(plan.messages[0].role, MessageRole::System);
        assert_eq!(plan.messages.len(), 4);
    }

    #[test]
    fn selected_history_stays_chronological() {
        let c = counter();
        let history = vec![
            turn(MessageRole::User, "first question"),
            turn(MessageRole::Assistant, "first answer"),
            turn(MessageRole::User, "second question"),
        ];
        let plan = PromptBudgeter::new(&c).build("user-1", &history).unwrap();
        assert_eq!(plan.messages[1].content, "first question");
        assert_eq!(plan.messages[3].content, "second question");
    }

    #[test]
    fn dropped_turns_are_always_the_oldest() {
        let c = counter();
        // Each turn is ~60 tokens; a tight budget forces dropping.
        let long = "alpha beta gamma delta ".repeat(12);
        let history: Vec<StoredMessage> = (0..8)
            .map(|i| turn(MessageRole::User, &format!("{long} turn {i}")))
            .collect();
        let plan = PromptBudgeter::new(&c)
            .with_limits(600, 256)
            .build("user-1", &history)
            .unwrap();

        let kept: Vec<&str> = plan.messages[1..]
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert!(!kept.is_empty() && kept.len() < 8, "budget forces a drop");
        // The kept turns must be a contiguous newest suffix of the history.
        let suffix_start = 8 - kept.len();
        for (i, content) in kept.iter().enumerate() {
            assert!(content.ends_with(&format!("turn {}", suffix_start + i)));
        }
    }

    #[test]
    fn total_never_exceeds_prompt_budget() {
        let c = counter();
        let history: Vec<StoredMessage> = (0..20)
            .map(|i| turn(MessageRole::User, &format!("message number {i} with some padding text")))
            .collect();
        for (ctx, resp) in [(4095, 1024), (900, 256), (500, 128)] {
            let budgeter = PromptBudgeter::new(&c).with_limits(ctx, resp);
            let plan = budgeter.build("user-1", &history).unwrap();
            assert!(plan.prompt_tokens <= budgeter.max_prompt_tokens());
        }
    }

    #[test]
    fn response_budget_never_overflows_context() {
        let c = counter();
        let history: Vec<StoredMessage> = (0..30)
            .map(|_| turn(MessageRole::User, "some reasonably sized conversational filler here"))
            .collect();
        for (ctx, resp) in [(700, 600), (4095, 1024), (900, 512)] {
            let plan = PromptBudgeter::new(&c)
                .with_limits(ctx, resp)
                .build("user-1", &history)
                .unwrap();
            assert!(plan.response_budget <= resp);
            assert!(plan.prompt_tokens + plan.response_budget <= ctx);
        }
    }

    #[test]
    fn oversized_newest_turn_fails_the_request() {
        let c = counter();
        let history = vec![
            turn(MessageRole::User, "small old turn"),
            turn(MessageRole::User, &"enormous newest turn ".repeat(200)),
        ];
        let err = PromptBudgeter::new(&c)
            .with_limits(600, 256)
            .build("user-1", &history)
            .unwrap_err();
        assert!(matches!(err, CompletionError::Config(_)));
    }

    #[test]
    fn inconsistent_budget_constants_fail_fast() {
        let c = counter();
        let err = PromptBudgeter::new(&c)
            .with_limits(1024, 4095)
            .build("user-1", &[])
            .unwrap_err();
        assert!(matches!(err, CompletionError::Config(_)));
    }

    #[test]
    fn history_messages_carry_the_owner_tag() {
        let c = counter();
        let history = vec![turn(MessageRole::User, "Hi")];
        let plan = PromptBudgeter::new(&c).build("user-7", &history).unwrap();
        assert_eq!(plan.messages[1].name.as_deref(), Some("user-7"));
        assert!(plan.messages[0].name.is_none(), "system message is untagged");
    }
}
