//! Fetches every review page of one item for one job, stores the raw pages,
//! and writes the normalized artifact.

use crate::{
    auth::{TokenError, TokenService},
    clock::Clock,
    config::{RetryPolicy, Settings},
    models::{FetchJob, ItemFetchResult, JobMode, JobStatus, SellerStatus},
    normalize::{NormalizeContext, normalize_page},
    platform::PlatformRegistry,
    ratelimit::{RateLimitError, RateLimiter},
    remote::{FailureKind, Pages, RemoteError, ReviewPage},
    storage::{ArtifactMeta, ItemScope, NormalizedArtifact, RawPageRecord, ReviewStorage, StorageError},
    store::{Repository, StoreError},
};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("seller {seller_id} is {status}")]
    SellerInactive {
        seller_id: String,
        status: SellerStatus,
    },
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the task queue should do with a failed item task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Run the task again later; `delay` is the upstream hint if any.
    Requeue { delay: Option<Duration> },
    /// The item is finished as failed.
    Finalize,
}

impl FetchError {
    pub fn disposition(&self) -> Disposition {
        match self {
            FetchError::Remote(RemoteError::RateLimited { retry_after }) => Disposition::Requeue {
                delay: *retry_after,
            },
            FetchError::RateLimit(RateLimitError::Exhausted { retry_after, .. }) => {
                Disposition::Requeue {
                    delay: Some(*retry_after),
                }
            }
            _ => Disposition::Finalize,
        }
    }
}

#[derive(Debug)]
pub enum ItemOutcome {
    Completed(ItemFetchResult),
    /// Redelivered task for an item that already finished.
    AlreadyFinal(ItemFetchResult),
    JobCancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub retry: RetryPolicy,
    pub page_size: u32,
    pub recent_mode_max_pages: u32,
}

impl FetchOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            retry: settings.retry,
            page_size: settings.page_size,
            recent_mode_max_pages: settings.recent_mode_max_pages,
        }
    }
}

pub struct ItemFetcher {
    repo: Arc<dyn Repository>,
    tokens: Arc<TokenService>,
    limiter: Arc<RateLimiter>,
    storage: ReviewStorage,
    platforms: Arc<PlatformRegistry>,
    clock: Arc<dyn Clock>,
    options: FetchOptions,
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 1000.0).max(0.0)
}

impl ItemFetcher {
    pub fn new(
        repo: Arc<dyn Repository>,
        tokens: Arc<TokenService>,
        limiter: Arc<RateLimiter>,
        storage: ReviewStorage,
        platforms: Arc<PlatformRegistry>,
        clock: Arc<dyn Clock>,
        options: FetchOptions,
    ) -> Self {
        Self {
            repo,
            tokens,
            limiter,
            storage,
            platforms,
            clock,
            options,
        }
    }

    pub async fn run(&self, job_id: Uuid, item_id: &str) -> Result<ItemOutcome, FetchError> {
        let job = self
            .repo
            .get_job(job_id)
            .await?
            .ok_or(FetchError::JobNotFound(job_id))?;
        if job.status == JobStatus::Cancelled {
            info!(target = "reviews.fetch", job_id = %job_id, item_id = %item_id, "job cancelled; skipping item");
            return Ok(ItemOutcome::JobCancelled);
        }
        if let Some(existing) = self.repo.get_item(job_id, item_id).await?
            && existing.status.is_terminal()
        {
            debug!(target = "reviews.fetch", job_id = %job_id, item_id = %item_id, "item already final");
            return Ok(ItemOutcome::AlreadyFinal(existing));
        }

        let now = self.clock.now();
        let current = self
            .repo
            .update_item(job_id, item_id, &mut |item| {
                if !item.status.is_terminal() {
                    item.status = JobStatus::InProgress;
                    item.started_at.get_or_insert(now);
                }
            })
            .await?;
        if current.status.is_terminal() {
            return Ok(ItemOutcome::AlreadyFinal(current));
        }

        let started_at = current.started_at.unwrap_or(now);
        match self.fetch_item(&job, item_id, started_at).await {
            Ok(result) => Ok(ItemOutcome::Completed(result)),
            Err(err) => {
                let recorded = match err.disposition() {
                    Disposition::Requeue { .. } => self.record_retry(job_id, item_id, &err).await,
                    Disposition::Finalize => self.mark_failed(job_id, item_id, &err.to_string()).await,
                };
                if let Err(store_err) = recorded {
                    warn!(
                        target = "reviews.fetch",
                        job_id = %job_id,
                        item_id = %item_id,
                        error = %store_err,
                        "could not record item failure"
                    );
                }
                Err(err)
            }
        }
    }

    async fn fetch_item(
        &self,
        job: &FetchJob,
        item_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<ItemFetchResult, FetchError> {
        let seller = self.tokens.seller(&job.seller_id).await?;
        if seller.status != SellerStatus::Active {
            return Err(FetchError::SellerInactive {
                seller_id: seller.id,
                status: seller.status,
            });
        }
        let access_token = self.tokens.get_valid_access_token(&seller.id).await?;

        let platform = self.platforms.get(job.platform);
        let source = platform.source.as_ref();
        let max_pages = match job.mode {
            JobMode::Full => None,
            JobMode::Recent => Some(self.options.recent_mode_max_pages),
        };
        let mut pages = Pages::new(
            source,
            item_id,
            &job.marketplace_id,
            self.options.page_size,
            max_pages,
        );
        let scope = ItemScope {
            platform: job.platform,
            seller_id: &job.seller_id,
            item_id,
            job_id: job.id,
            job_created_at: job.created_at,
        };

        let mut reviews = Vec::new();
        let mut raw_paths = Vec::new();
        while !pages.is_done() {
            let page_number = pages.page_number();
            let page_token = format!("page{page_number}");

            let stored = if self.storage.raw_exists(&scope, &page_token).await? {
                self.storage.read_raw(&scope, &page_token).await?
            } else {
                None
            };
            let (items, next_cursor, location) = match stored {
                Some(record) => {
                    debug!(
                        target = "reviews.fetch",
                        job_id = %job.id,
                        item_id = %item_id,
                        page = %page_token,
                        "raw page already stored; resuming from it"
                    );
                    (
                        source.items_from_body(&record.body),
                        record.next_cursor,
                        self.storage.raw_location(&scope, &page_token),
                    )
                }
                None => {
                    let page = self
                        .fetch_with_retry(&pages, &access_token, &job.seller_id, item_id, page_number)
                        .await?;
                    let record = RawPageRecord {
                        item_id: item_id.to_string(),
                        page_token: page_token.clone(),
                        fetched_at: self.clock.now(),
                        next_cursor: page.next_cursor.clone(),
                        body: page.body,
                    };
                    let location = self.storage.write_raw(&scope, &record).await?;
                    (page.items, page.next_cursor, location)
                }
            };

            let context = NormalizeContext {
                platform: job.platform,
                item_id,
                marketplace_id: &job.marketplace_id,
                page_token: &page_token,
            };
            let mut normalized = normalize_page(platform.normalize, &items, &context);
            if let Some(range) = job.date_range {
                normalized.retain(|review| review.parsed_date().is_none_or(|at| range.contains(at)));
            }
            reviews.extend(normalized);
            raw_paths.push(location);
            pages.advance(next_cursor.clone());

            let count = reviews.len() as u64;
            self.repo
                .update_item(job.id, item_id, &mut |item| {
                    item.pages_fetched = item.pages_fetched.max(page_number);
                    item.reviews_count = item.reviews_count.max(count);
                    item.last_cursor = next_cursor.clone();
                    if raw_paths.len() > item.raw_locations.len() {
                        item.raw_locations = raw_paths.clone();
                    }
                })
                .await?;
        }

        let finished_at = self.clock.now();
        let pages_fetched = pages.page_number() - 1;
        let reviews_count = reviews.len() as u64;
        let artifact = NormalizedArtifact {
            job_id: job.id,
            platform: job.platform,
            seller_id: job.seller_id.clone(),
            item_id: item_id.to_string(),
            fetched_at: finished_at,
            source_endpoint: source.source_endpoint(item_id, &job.marketplace_id),
            raw_paths: raw_paths.clone(),
            reviews_count,
            reviews,
            meta: ArtifactMeta {
                pages_fetched,
                next_token: pages.cursor().map(str::to_string),
                fetch_duration_seconds: seconds_between(started_at, finished_at),
            },
        };
        let processed = self.storage.write_normalized(&scope, &artifact).await?;

        let result = self
            .repo
            .update_item(job.id, item_id, &mut |item| {
                if item.status.is_terminal() {
                    return;
                }
                item.status = JobStatus::Success;
                item.reviews_count = reviews_count;
                item.pages_fetched = item.pages_fetched.max(pages_fetched);
                item.raw_locations = raw_paths.clone();
                item.processed_location = Some(processed.clone());
                item.error_message = None;
                item.completed_at = Some(finished_at);
            })
            .await?;

        info!(
            target = "reviews.fetch",
            job_id = %job.id,
            item_id = %item_id,
            seller_id = %job.seller_id,
            pages = pages_fetched,
            reviews = reviews_count,
            "item fetched"
        );
        Ok(result)
    }

    /// One page, with in-process backoff for retryable failures. A rate
    /// limit token is taken before every attempt.
    async fn fetch_with_retry(
        &self,
        pages: &Pages<'_>,
        access_token: &str,
        seller_id: &str,
        item_id: &str,
        page: u32,
    ) -> Result<ReviewPage, FetchError> {
        let retry = self.options.retry;
        let mut attempt = 0;
        loop {
            self.limiter.acquire(seller_id, 1.0).await?;
            let err = match pages.fetch(access_token).await {
                Ok(fetched) => return Ok(fetched),
                Err(err) => err,
            };

            match err.kind() {
                FailureKind::Retryable if attempt + 1 < retry.max_attempts => {
                    let delay = retry.jittered_delay(attempt);
                    attempt += 1;
                    warn!(
                        target = "reviews.fetch",
                        seller_id = %seller_id,
                        item_id = %item_id,
                        page,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "upstream failure; backing off"
                    );
                    self.clock.sleep(delay).await;
                }
                FailureKind::Throttled => {
                    if let RemoteError::RateLimited {
                        retry_after: Some(wait),
                    } = &err
                    {
                        self.limiter.set_throttled(seller_id, *wait).await?;
                    }
                    return Err(err.into());
                }
                FailureKind::NeedsReauth => {
                    if let Err(flag_err) = self
                        .tokens
                        .mark_reauthorize_required(seller_id, &err.to_string())
                        .await
                    {
                        warn!(
                            target = "reviews.fetch",
                            seller_id = %seller_id,
                            error = %flag_err,
                            "could not flag seller for reauthorization"
                        );
                    }
                    return Err(err.into());
                }
                FailureKind::Retryable | FailureKind::Fatal => return Err(err.into()),
            }
        }
    }

    async fn record_retry(
        &self,
        job_id: Uuid,
        item_id: &str,
        err: &FetchError,
    ) -> Result<(), StoreError> {
        let message = err.to_string();
        self.repo
            .update_item(job_id, item_id, &mut |item| {
                if !item.status.is_terminal() {
                    item.error_message = Some(message.clone());
                    item.retry_count += 1;
                }
            })
            .await?;
        info!(
            target = "reviews.fetch",
            job_id = %job_id,
            item_id = %item_id,
            error = %message,
            "item throttled; will be retried"
        );
        Ok(())
    }

    /// Finalizes the item as failed unless it already finished.
    pub async fn mark_failed(
        &self,
        job_id: Uuid,
        item_id: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.repo
            .update_item(job_id, item_id, &mut |item| {
                if item.status.is_terminal() {
                    return;
                }
                item.status = JobStatus::Failed;
                item.error_message = Some(message.to_string());
                item.completed_at = Some(now);
            })
            .await?;
        warn!(
            target = "reviews.fetch",
            job_id = %job_id,
            item_id = %item_id,
            error = %message,
            "item failed"
        );
        Ok(())
    }
}
