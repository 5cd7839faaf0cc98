use super::{Repository, StoreError, Update, expires_at, scoped_idempotency_key};
use crate::models::{FetchJob, ItemFetchResult, OAuthState, RateLimitBucket, Seller};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, time::Duration};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Single-process repository; one lock serializes every mutation.
#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    sellers: HashMap<String, Seller>,
    jobs: HashMap<Uuid, FetchJob>,
    items: HashMap<Uuid, Vec<ItemFetchResult>>,
    buckets: HashMap<String, RateLimitBucket>,
    oauth_states: HashMap<String, (OAuthState, DateTime<Utc>)>,
    idempotency: HashMap<String, (Uuid, DateTime<Utc>)>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_seller(&self, id: &str) -> Result<Option<Seller>, StoreError> {
        Ok(self.tables.lock().await.sellers.get(id).cloned())
    }

    async fn put_seller(&self, seller: Seller) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .sellers
            .insert(seller.id.clone(), seller);
        Ok(())
    }

    async fn update_seller(
        &self,
        id: &str,
        apply: Update<'_, Seller>,
    ) -> Result<Option<Seller>, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.sellers.get_mut(id).map(|seller| {
            apply(seller);
            seller.clone()
        }))
    }

    async fn insert_job(&self, job: FetchJob) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(format!("job {}", job.id)));
        }
        tables.items.entry(job.id).or_default();
        tables.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<FetchJob>, StoreError> {
        Ok(self.tables.lock().await.jobs.get(&id).cloned())
    }

    async fn update_job(
        &self,
        id: Uuid,
        apply: Update<'_, FetchJob>,
    ) -> Result<Option<FetchJob>, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.jobs.get_mut(&id).map(|job| {
            apply(job);
            job.clone()
        }))
    }

    async fn jobs_for_seller(&self, seller_id: &str) -> Result<Vec<FetchJob>, StoreError> {
        let tables = self.tables.lock().await;
        let mut jobs: Vec<FetchJob> = tables
            .jobs
            .values()
            .filter(|job| job.seller_id == seller_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn get_item(
        &self,
        job_id: Uuid,
        item_id: &str,
    ) -> Result<Option<ItemFetchResult>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .items
            .get(&job_id)
            .and_then(|items| items.iter().find(|item| item.item_id == item_id))
            .cloned())
    }

    async fn update_item(
        &self,
        job_id: Uuid,
        item_id: &str,
        apply: Update<'_, ItemFetchResult>,
    ) -> Result<ItemFetchResult, StoreError> {
        let mut tables = self.tables.lock().await;
        let items = tables.items.entry(job_id).or_default();
        let position = match items.iter().position(|item| item.item_id == item_id) {
            Some(position) => position,
            None => {
                items.push(ItemFetchResult::new(job_id, item_id));
                items.len() - 1
            }
        };
        let item = &mut items[position];
        apply(item);
        Ok(item.clone())
    }

    async fn items_for_job(&self, job_id: Uuid) -> Result<Vec<ItemFetchResult>, StoreError> {
        let tables = self.tables.lock().await;
        let mut items = tables.items.get(&job_id).cloned().unwrap_or_default();
        if let Some(job) = tables.jobs.get(&job_id) {
            items.sort_by_key(|item| {
                job.item_ids
                    .iter()
                    .position(|id| *id == item.item_id)
                    .unwrap_or(usize::MAX)
            });
        }
        Ok(items)
    }

    async fn update_bucket(
        &self,
        seller_id: &str,
        init: RateLimitBucket,
        apply: Update<'_, RateLimitBucket>,
    ) -> Result<RateLimitBucket, StoreError> {
        let mut tables = self.tables.lock().await;
        let bucket = tables
            .buckets
            .entry(seller_id.to_string())
            .or_insert(init);
        apply(bucket);
        Ok(bucket.clone())
    }

    /// Expiry is judged by the caller's clock: states are pruned relative to
    /// the new state's `created_at`, and `take` leaves the age check to the
    /// caller.
    async fn put_oauth_state(&self, state: OAuthState, ttl: Duration) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let now = state.created_at;
        tables.oauth_states.retain(|_, (_, expires)| *expires > now);
        let expires = expires_at(now, ttl);
        tables
            .oauth_states
            .insert(state.state.clone(), (state, expires));
        Ok(())
    }

    async fn take_oauth_state(&self, state: &str) -> Result<Option<OAuthState>, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.oauth_states.remove(state).map(|(state, _)| state))
    }

    async fn claim_idempotency_key(
        &self,
        seller_id: &str,
        key: &str,
        job_id: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.idempotency.retain(|_, (_, expires)| *expires > now);
        let scoped = scoped_idempotency_key(seller_id, key);
        if let Some((existing, _)) = tables.idempotency.get(&scoped) {
            return Ok(Some(*existing));
        }
        tables
            .idempotency
            .insert(scoped, (job_id, expires_at(now, ttl)));
        Ok(None)
    }
}
