use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Longest hold a single penalty can place on the bucket.
pub const MAX_PENALTY: Duration = Duration::from_secs(60 * 60);

/// Returned by [`TokenBucket::acquire`] when shutdown wins the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancelled while waiting for a rate limit token")]
pub struct Cancelled;

/// Process-wide request budget: `capacity` requests per `refill_interval`,
/// refilled continuously.
///
/// The bucket is in-memory only and starts full, so a restart may burst up to
/// `capacity` requests.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    /// Refill resumes from here. Sits in the future while a penalty holds.
    refilled_at: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        let interval = refill_interval.as_secs_f64().max(f64::EPSILON);
        Self {
            capacity,
            tokens_per_sec: capacity / interval,
            state: Mutex::new(BucketState {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Wait for one token. Never fails because the bucket is empty; only
    /// cancellation ends the wait early.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut state, now);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                let deficit = Duration::from_secs_f64((1.0 - state.tokens) / self.tokens_per_sec);
                state.refilled_at.saturating_duration_since(now) + deficit
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Drain the bucket and hold off every grant for at least `delay`,
    /// capped at [`MAX_PENALTY`].
    pub async fn penalize(&self, delay: Duration) {
        let delay = delay.min(MAX_PENALTY);
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let until = now
            .checked_add(delay)
            .or_else(|| now.checked_add(MAX_PENALTY))
            .unwrap_or(now);
        state.tokens = 0.0;
        if until > state.refilled_at {
            state.refilled_at = until;
        }
        debug!(delay_ms = delay.as_millis(), "rate limit penalty applied");
    }

    /// Tokens available right now, for logging and tests.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if now <= state.refilled_at {
            return;
        }
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.tokens_per_sec).min(self.capacity);
        state.refilled_at = now;
    }
}
