//! History truncation: drop the oldest turns before the context window fills.
//!
//! Pure functions. The decision is driven by the token count the provider
//! reported for the previous request; the per-message share of that count is
//! estimated at ~4 characters per token.

use tasklane_core::message::{ApiMessage, TokenAccounting};

/// Fraction of the context window held back as headroom.
pub const CONTEXT_BUFFER: f64 = 0.1;

/// Estimate the token count for a string. 1 token ≈ 4 characters, rounded up.
pub fn estimate_tokens(text_len: usize) -> u64 {
    text_len.div_ceil(4) as u64
}

/// Tokens the retained history may occupy.
pub fn allowed_tokens(context_window: u64, max_output_tokens: u64) -> u64 {
    let usable = (context_window as f64 * (1.0 - CONTEXT_BUFFER)) as u64;
    usable.saturating_sub(max_output_tokens)
}

/// How many messages after the first to drop. Always even, so whole
/// assistant/user pairs go together and a tool result never outlives its call.
pub fn messages_to_drop(
    history: &[ApiMessage],
    accounting: &TokenAccounting,
    context_window: u64,
    max_output_tokens: u64,
) -> usize {
    let consumed = accounting.total();
    let allowed = allowed_tokens(context_window, max_output_tokens);
    if consumed <= allowed || history.len() < 4 {
        return 0;
    }

    let excess = consumed - allowed;
    let mut freed = 0u64;
    let mut drop = 0usize;
    // Keep the task statement (index 0) and the latest message
    while 1 + drop + 2 < history.len() && freed < excess {
        freed += estimate_tokens(history[1 + drop].char_len());
        freed += estimate_tokens(history[2 + drop].char_len());
        drop += 2;
    }
    drop
}

/// The history to send next.
pub fn truncate(
    history: &[ApiMessage],
    accounting: &TokenAccounting,
    context_window: u64,
    max_output_tokens: u64,
) -> Vec<ApiMessage> {
    let drop = messages_to_drop(history, accounting, context_window, max_output_tokens);
    if drop == 0 {
        return history.to_vec();
    }
    let mut kept = Vec::with_capacity(history.len() - drop);
    kept.push(history[0].clone());
    kept.extend_from_slice(&history[1 + drop..]);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasklane_core::message::Role;

    fn conversation(turns: usize, chars: usize) -> Vec<ApiMessage> {
        let mut history = vec![ApiMessage::user("<task>build it</task>")];
        for _ in 0..turns {
            history.push(ApiMessage::assistant("a".repeat(chars)));
            history.push(ApiMessage::user("u".repeat(chars)));
        }
        history
    }

    fn used(tokens_in: u64) -> TokenAccounting {
        TokenAccounting { tokens_in, ..Default::default() }
    }

    #[test]
    fn under_budget_keeps_everything() {
        let history = conversation(5, 400);
        let kept = truncate(&history, &used(1_000), 200_000, 8_192);
        assert_eq!(kept, history);
    }

    #[test]
    fn allowed_accounts_for_buffer_and_output() {
        assert_eq!(allowed_tokens(200_000, 8_192), 180_000 - 8_192);
        assert_eq!(allowed_tokens(1_000, 5_000), 0);
    }

    #[test]
    fn over_budget_drops_oldest_pairs() {
        let history = conversation(10, 4_000);
        // Each message ≈ 1000 tokens; 2500 over budget needs two pairs
        let allowed = allowed_tokens(100_000, 8_000);
        let kept = truncate(&history, &used(allowed + 2_500), 100_000, 8_000);

        assert_eq!(kept.len(), history.len() - 4);
        assert_eq!(kept[0], history[0]);
        assert_eq!(kept[1], history[5]);
        assert_eq!(kept[1].role, Role::Assistant);
        assert_eq!(kept.last(), history.last());
    }

    #[test]
    fn latest_message_is_never_dropped() {
        let history = conversation(3, 100);
        let kept = truncate(&history, &used(10_000_000), 100_000, 8_000);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0], history[0]);
        assert_eq!(kept.last(), history.last());
    }

    #[test]
    fn monotonic_in_consumed_tokens() {
        let history = conversation(20, 2_000);
        let mut previous = 0;
        for consumed in (0..200_000u64).step_by(2_500) {
            let drop = messages_to_drop(&history, &used(consumed), 100_000, 8_000);
            assert!(drop >= previous);
            assert_eq!(drop % 2, 0);
            previous = drop;
        }
    }

    #[test]
    fn cache_tokens_count_toward_usage() {
        let history = conversation(10, 4_000);
        let allowed = allowed_tokens(100_000, 8_000);
        let accounting = TokenAccounting {
            tokens_in: 10,
            tokens_out: 10,
            cache_writes: 0,
            cache_reads: allowed,
            cost: 0.0,
        };
        assert!(messages_to_drop(&history, &accounting, 100_000, 8_000) > 0);
    }
}
