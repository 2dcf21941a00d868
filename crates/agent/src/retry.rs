//! Backoff and request spacing for model requests.

use std::time::Duration;
use tasklane_core::error::AskError;
use tasklane_core::message::SayKind;
use tokio::time::Instant;

use crate::messenger::Messenger;

/// Seconds to wait before retry number `attempt` (0-based):
/// `base × 2^attempt`, floored by the provider's retry-after, capped at `max_secs`.
pub fn retry_delay(base_secs: u64, attempt: u32, retry_after: Option<u64>, max_secs: u64) -> u64 {
    let exponential = base_secs.saturating_mul(2u64.saturating_pow(attempt));
    exponential.max(retry_after.unwrap_or(0)).min(max_secs)
}

/// Whole seconds still to wait so that requests are at least
/// `rate_limit_secs` apart.
pub fn rate_limit_wait(last_request: Option<Instant>, now: Instant, rate_limit_secs: u64) -> u64 {
    let Some(last) = last_request else {
        return 0;
    };
    let remaining = Duration::from_secs(rate_limit_secs).saturating_sub(now.duration_since(last));
    remaining.as_millis().div_ceil(1000) as u64
}

/// Count down `secs` seconds as one partial `api_req_retry_delayed` message,
/// finalized with `render(0)`. A zero count posts only the final message.
/// Returns early if the task is cancelled.
pub async fn countdown(
    messenger: &Messenger,
    secs: u64,
    render: impl Fn(u64) -> String,
) -> Result<(), AskError> {
    let cancel = messenger.cancel_token().clone();
    for remaining in (1..=secs).rev() {
        messenger.post(SayKind::ApiReqRetryDelayed, &render(remaining), true);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AskError::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
    messenger.post(SayKind::ApiReqRetryDelayed, &render(0), false);
    Ok(())
}
