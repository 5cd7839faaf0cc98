//! Persistence of sellers, jobs, item results, rate-limit buckets and the
//! short-lived OAuth/idempotency keys.
//!
//! Every `update_*` applies the closure as one atomic single-row
//! read-modify-write. Backends may re-apply the closure when a concurrent
//! writer wins, so closures must only depend on the row they are given.

mod memory;
mod redis;

pub use memory::MemoryRepository;
pub use self::redis::RedisRepository;

use crate::models::{FetchJob, ItemFetchResult, OAuthState, RateLimitBucket, Seller};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("corrupt record: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("gave up updating {key} after concurrent writers")]
    Contention { key: String },
    #[error("{0} already exists")]
    Duplicate(String),
}

pub type Update<'a, T> = &'a mut (dyn FnMut(&mut T) + Send);

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_seller(&self, id: &str) -> Result<Option<Seller>, StoreError>;
    /// Inserts the seller or replaces the stored row wholesale.
    async fn put_seller(&self, seller: Seller) -> Result<(), StoreError>;
    async fn update_seller(
        &self,
        id: &str,
        apply: Update<'_, Seller>,
    ) -> Result<Option<Seller>, StoreError>;

    async fn insert_job(&self, job: FetchJob) -> Result<(), StoreError>;
    async fn get_job(&self, id: Uuid) -> Result<Option<FetchJob>, StoreError>;
    async fn update_job(
        &self,
        id: Uuid,
        apply: Update<'_, FetchJob>,
    ) -> Result<Option<FetchJob>, StoreError>;
    /// Newest first.
    async fn jobs_for_seller(&self, seller_id: &str) -> Result<Vec<FetchJob>, StoreError>;

    async fn get_item(&self, job_id: Uuid, item_id: &str)
    -> Result<Option<ItemFetchResult>, StoreError>;
    /// Creates a pending result first when none exists for the pair.
    async fn update_item(
        &self,
        job_id: Uuid,
        item_id: &str,
        apply: Update<'_, ItemFetchResult>,
    ) -> Result<ItemFetchResult, StoreError>;
    /// Results in the order of the job's item list.
    async fn items_for_job(&self, job_id: Uuid) -> Result<Vec<ItemFetchResult>, StoreError>;

    /// `init` seeds the bucket when the seller has none yet.
    async fn update_bucket(
        &self,
        seller_id: &str,
        init: RateLimitBucket,
        apply: Update<'_, RateLimitBucket>,
    ) -> Result<RateLimitBucket, StoreError>;

    /// Keeps the state for `ttl` past its `created_at`.
    async fn put_oauth_state(&self, state: OAuthState, ttl: Duration) -> Result<(), StoreError>;
    /// Returns and deletes the state; a second call yields `None`.
    async fn take_oauth_state(&self, state: &str) -> Result<Option<OAuthState>, StoreError>;

    /// Binds the seller's `key` to `job_id` unless a binding younger than
    /// `ttl` exists; returns that earlier binding when there is one. Keys of
    /// different sellers never collide.
    async fn claim_idempotency_key(
        &self,
        seller_id: &str,
        key: &str,
        job_id: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Uuid>, StoreError>;
}

/// Storage key of a seller's idempotency key.
pub(crate) fn scoped_idempotency_key(seller_id: &str, key: &str) -> String {
    format!("{}:{key}", urlencoding::encode(seller_id))
}

/// `at + ttl`, saturating at the end of representable time.
pub(crate) fn expires_at(at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| at.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
