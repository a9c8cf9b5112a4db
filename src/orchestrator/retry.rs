use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::chat::Usage;
use crate::config::ResilienceConfig;
use crate::request_loop::{OutcomeKind, RequestOutcome};

/// Run `attempt` until it succeeds, fails for good, or runs out of attempts.
///
/// Only 429 and 5xx outcomes are retried, and only while the failed attempt
/// produced no messages and `untouched` still holds (nothing was streamed to
/// listeners). Usage of every attempt is summed into the returned outcome.
pub(crate) async fn send_with_retry<F, Fut, U>(
    cfg: &ResilienceConfig,
    cancel: &CancellationToken,
    mut attempt: F,
    untouched: U,
) -> RequestOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RequestOutcome>,
    U: Fn() -> bool,
{
    let mut usage = Usage::default();
    let mut idx = 0usize;

    loop {
        let mut outcome = attempt().await;
        usage += outcome.usage;
        outcome.usage = usage;

        let attempts_left = cfg.max_attempts.saturating_sub(idx + 1);
        if attempts_left == 0
            || !outcome.kind.is_retryable()
            || outcome.has_output()
            || !untouched()
        {
            return outcome;
        }

        let delay = backoff_delay(cfg, idx);
        log::info!(
            "request ended with {:?}, retrying in {}ms ({attempts_left} attempts left)",
            outcome.kind,
            delay.as_millis()
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                outcome.kind = OutcomeKind::Cancelled;
                return outcome;
            }
            _ = sleep(delay) => {}
        }
        idx += 1;
    }
}

/// Exponential backoff capped at `max_delay_ms`, with deterministic jitter.
pub(crate) fn backoff_delay(cfg: &ResilienceConfig, attempt_index: usize) -> Duration {
    let mut delay = cfg
        .base_delay_ms
        .saturating_mul(1u64 << attempt_index.min(16));
    delay = delay.min(cfg.max_delay_ms);
    if cfg.jitter {
        let span = (delay / 2).max(1);
        let jitter = ((attempt_index as u64)
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1))
            % span;
        delay = delay.saturating_sub(jitter);
    }
    Duration::from_millis(delay)
}
