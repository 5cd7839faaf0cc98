use crate::{
    clock::Clock,
    config::RateLimitConfig,
    models::RateLimitBucket,
    remote::MAX_RETRY_AFTER,
    store::{Repository, StoreError},
};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("requested {requested} tokens but bucket for {seller_id} holds at most {max_tokens}")]
    ExceedsCapacity {
        seller_id: String,
        requested: f64,
        max_tokens: f64,
    },
    #[error("no rate limit token for {seller_id} after waiting; retry in {retry_after:?}")]
    Exhausted {
        seller_id: String,
        retry_after: Duration,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of one atomic bucket update.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Debit {
    Acquired,
    Throttled(DateTime<Utc>),
    Short(Duration),
}

/// Persistent per-seller token buckets shared by every worker and process
/// that uses the same repository.
pub struct RateLimiter {
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 1000.0).max(0.0)
}

/// Refills from elapsed time and keeps `0 <= tokens <= max_tokens`.
fn refill(bucket: &mut RateLimitBucket, now: DateTime<Utc>) {
    let elapsed = elapsed_secs(bucket.last_refill_at, now);
    if elapsed > 0.0 {
        bucket.tokens += elapsed * bucket.refill_rate;
        bucket.last_refill_at = now;
    }
    bucket.tokens = bucket.tokens.clamp(0.0, bucket.max_tokens);
}

fn try_debit(bucket: &mut RateLimitBucket, tokens: f64, now: DateTime<Utc>) -> Debit {
    match bucket.throttled_until {
        Some(until) if until > now => return Debit::Throttled(until),
        Some(_) => bucket.throttled_until = None,
        None => {}
    }
    refill(bucket, now);
    if bucket.tokens >= tokens {
        bucket.tokens -= tokens;
        return Debit::Acquired;
    }
    let missing = tokens - bucket.tokens;
    let rate = bucket.refill_rate.max(f64::EPSILON);
    Debit::Short(Duration::try_from_secs_f64(missing / rate).unwrap_or(Duration::MAX))
}

impl RateLimiter {
    pub fn new(repo: Arc<dyn Repository>, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self {
            repo,
            clock,
            config,
        }
    }

    fn fresh_bucket(&self, seller_id: &str) -> RateLimitBucket {
        RateLimitBucket {
            seller_id: seller_id.to_string(),
            tokens: self.config.burst_capacity,
            max_tokens: self.config.burst_capacity,
            refill_rate: self.config.requests_per_second,
            last_refill_at: self.clock.now(),
            throttled_until: None,
        }
    }

    async fn debit(&self, seller_id: &str, tokens: f64) -> Result<(Debit, f64), StoreError> {
        let now = self.clock.now();
        let mut outcome = Debit::Acquired;
        let bucket = self
            .repo
            .update_bucket(seller_id, self.fresh_bucket(seller_id), &mut |bucket| {
                outcome = try_debit(bucket, tokens, now);
            })
            .await?;
        Ok((outcome, bucket.max_tokens))
    }

    /// Takes `tokens` from the seller's bucket, sleeping at most once for a
    /// throttle window and once for a refill before giving up.
    pub async fn acquire(&self, seller_id: &str, tokens: f64) -> Result<(), RateLimitError> {
        let mut waited_for_refill = false;
        let mut waited_for_throttle = false;
        loop {
            let (outcome, max_tokens) = self.debit(seller_id, tokens).await?;
            if tokens > max_tokens {
                return Err(RateLimitError::ExceedsCapacity {
                    seller_id: seller_id.to_string(),
                    requested: tokens,
                    max_tokens,
                });
            }
            match outcome {
                Debit::Acquired => return Ok(()),
                Debit::Throttled(until) if !waited_for_throttle => {
                    let wait = (until - self.clock.now()).to_std().unwrap_or_default();
                    info!(
                        target = "reviews.ratelimit",
                        seller_id = %seller_id,
                        wait_ms = wait.as_millis() as u64,
                        "seller throttled upstream; waiting"
                    );
                    waited_for_throttle = true;
                    self.clock.sleep(wait).await;
                }
                Debit::Short(wait) if !waited_for_refill => {
                    debug!(
                        target = "reviews.ratelimit",
                        seller_id = %seller_id,
                        wait_ms = wait.as_millis() as u64,
                        "bucket empty; waiting for refill"
                    );
                    waited_for_refill = true;
                    self.clock.sleep(wait).await;
                }
                Debit::Throttled(until) => {
                    let retry_after = (until - self.clock.now()).to_std().unwrap_or_default();
                    return Err(self.exhausted(seller_id, retry_after));
                }
                Debit::Short(retry_after) => return Err(self.exhausted(seller_id, retry_after)),
            }
        }
    }

    fn exhausted(&self, seller_id: &str, retry_after: Duration) -> RateLimitError {
        warn!(
            target = "reviews.ratelimit",
            seller_id = %seller_id,
            retry_after_ms = retry_after.as_millis() as u64,
            "rate limit acquisition failed"
        );
        RateLimitError::Exhausted {
            seller_id: seller_id.to_string(),
            retry_after,
        }
    }

    /// Blocks the seller's bucket until `now + retry_after`, with
    /// `retry_after` capped at [`MAX_RETRY_AFTER`]. An existing later
    /// deadline is kept.
    pub async fn set_throttled(
        &self,
        seller_id: &str,
        retry_after: Duration,
    ) -> Result<(), RateLimitError> {
        let now = self.clock.now();
        let until = chrono::Duration::from_std(retry_after.min(MAX_RETRY_AFTER))
            .ok()
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.repo
            .update_bucket(seller_id, self.fresh_bucket(seller_id), &mut |bucket| {
                bucket.throttled_until = Some(bucket.throttled_until.map_or(until, |t| t.max(until)));
            })
            .await?;
        info!(
            target = "reviews.ratelimit",
            seller_id = %seller_id,
            until = %until,
            "seller throttled"
        );
        Ok(())
    }
}
