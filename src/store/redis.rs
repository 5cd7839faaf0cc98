use super::{Repository, StoreError, Update, scoped_idempotency_key};
use crate::models::{FetchJob, ItemFetchResult, OAuthState, RateLimitBucket, Seller};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Script, aio::MultiplexedConnection};
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const KEY_PREFIX: &str = "reviews";
const CAS_MAX_ATTEMPTS: usize = 16;

/// Compare-and-set on a string key (empty field) or a hash field. An empty
/// expected value means "absent".
static COMPARE_AND_SET: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local current
if ARGV[1] == '' then
  current = redis.call('GET', KEYS[1])
else
  current = redis.call('HGET', KEYS[1], ARGV[1])
end
if not current then current = '' end
if current ~= ARGV[2] then return 0 end
if ARGV[1] == '' then
  redis.call('SET', KEYS[1], ARGV[3])
else
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
end
return 1
",
    )
});

/// Redis-backed repository shared by every worker process.
#[derive(Clone)]
pub struct RedisRepository {
    conn: MultiplexedConnection,
}

fn seller_key(id: &str) -> String {
    format!("{KEY_PREFIX}:seller:{id}")
}

fn seller_jobs_key(id: &str) -> String {
    format!("{KEY_PREFIX}:seller:{id}:jobs")
}

fn job_key(id: Uuid) -> String {
    format!("{KEY_PREFIX}:job:{id}")
}

fn job_items_key(id: Uuid) -> String {
    format!("{KEY_PREFIX}:job:{id}:items")
}

fn bucket_key(seller_id: &str) -> String {
    format!("{KEY_PREFIX}:bucket:{seller_id}")
}

fn oauth_state_key(state: &str) -> String {
    format!("{KEY_PREFIX}:oauth_state:{state}")
}

fn idempotency_key(seller_id: &str, key: &str) -> String {
    format!(
        "{KEY_PREFIX}:idempotency:{}",
        scoped_idempotency_key(seller_id, key)
    )
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl RedisRepository {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(target = "reviews.store", "connected to redis repository");
        Ok(Self { conn })
    }

    async fn read_raw(&self, key: &str, field: Option<&str>) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = match field {
            Some(field) => conn.hget(key, field).await?,
            None => conn.get(key).await?,
        };
        Ok(raw.filter(|value| !value.is_empty()))
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        key: &str,
        field: Option<&str>,
    ) -> Result<Option<T>, StoreError> {
        match self.read_raw(key, field).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

/// The two round trips an optimistic update is built from. An empty
/// `expected` value stands for an absent row.
#[async_trait]
trait CasStore: Sync {
    async fn load(&self, key: &str, field: Option<&str>) -> Result<Option<String>, StoreError>;
    async fn swap(
        &self,
        key: &str,
        field: Option<&str>,
        expected: &str,
        next: &str,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
impl CasStore for RedisRepository {
    async fn load(&self, key: &str, field: Option<&str>) -> Result<Option<String>, StoreError> {
        self.read_raw(key, field).await
    }

    async fn swap(
        &self,
        key: &str,
        field: Option<&str>,
        expected: &str,
        next: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let swapped: i32 = COMPARE_AND_SET
            .key(key)
            .arg(field.unwrap_or(""))
            .arg(expected)
            .arg(next)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}

/// Optimistic read-modify-write. `init` supplies the row when absent;
/// `None` from it means "do not create". `apply` runs again on the fresh row
/// each time another writer wins.
async fn compare_and_set<S, T>(
    store: &S,
    key: &str,
    field: Option<&str>,
    init: impl Fn() -> Option<T> + Send,
    apply: Update<'_, T>,
) -> Result<Option<T>, StoreError>
where
    S: CasStore + ?Sized,
    T: Serialize + DeserializeOwned + Send,
{
    for attempt in 0..CAS_MAX_ATTEMPTS {
        let expected = store.load(key, field).await?.unwrap_or_default();
        let current = if expected.is_empty() {
            init()
        } else {
            Some(serde_json::from_str::<T>(&expected)?)
        };
        let Some(mut row) = current else {
            return Ok(None);
        };
        apply(&mut row);
        let next = serde_json::to_string(&row)?;
        if next == expected {
            return Ok(Some(row));
        }
        if store.swap(key, field, &expected, &next).await? {
            return Ok(Some(row));
        }
        debug!(target = "reviews.store", key, attempt, "compare-and-set lost race");
    }
    Err(StoreError::Contention {
        key: key.to_string(),
    })
}

#[async_trait]
impl Repository for RedisRepository {
    async fn get_seller(&self, id: &str) -> Result<Option<Seller>, StoreError> {
        self.read_json(&seller_key(id), None).await
    }

    async fn put_seller(&self, seller: Seller) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(&seller)?;
        let _: () = conn.set(seller_key(&seller.id), json).await?;
        Ok(())
    }

    async fn update_seller(
        &self,
        id: &str,
        apply: Update<'_, Seller>,
    ) -> Result<Option<Seller>, StoreError> {
        compare_and_set(self, &seller_key(id), None, || None, apply)
            .await
    }

    async fn insert_job(&self, job: FetchJob) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(&job)?;
        let created: bool = conn.set_nx(job_key(job.id), json).await?;
        if !created {
            return Err(StoreError::Duplicate(format!("job {}", job.id)));
        }
        let _: () = conn
            .lpush(seller_jobs_key(&job.seller_id), job.id.to_string())
            .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<FetchJob>, StoreError> {
        self.read_json(&job_key(id), None).await
    }

    async fn update_job(
        &self,
        id: Uuid,
        apply: Update<'_, FetchJob>,
    ) -> Result<Option<FetchJob>, StoreError> {
        compare_and_set(self, &job_key(id), None, || None, apply)
            .await
    }

    async fn jobs_for_seller(&self, seller_id: &str) -> Result<Vec<FetchJob>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.lrange(seller_jobs_key(seller_id), 0, -1).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(id) = Uuid::parse_str(&id) else {
                continue;
            };
            if let Some(job) = self.get_job(id).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn get_item(
        &self,
        job_id: Uuid,
        item_id: &str,
    ) -> Result<Option<ItemFetchResult>, StoreError> {
        self.read_json(&job_items_key(job_id), Some(item_id)).await
    }

    async fn update_item(
        &self,
        job_id: Uuid,
        item_id: &str,
        apply: Update<'_, ItemFetchResult>,
    ) -> Result<ItemFetchResult, StoreError> {
        let key = job_items_key(job_id);
        let updated = compare_and_set(
            self,
            &key,
            Some(item_id),
            || Some(ItemFetchResult::new(job_id, item_id)),
            apply,
        )
        .await?;
        updated.ok_or(StoreError::Contention { key })
    }

    async fn items_for_job(&self, job_id: Uuid) -> Result<Vec<ItemFetchResult>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<(String, String)> = conn.hgetall(job_items_key(job_id)).await?;
        let mut items = raw
            .into_iter()
            .map(|(_, json)| serde_json::from_str::<ItemFetchResult>(&json))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(job) = self.get_job(job_id).await? {
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
        let key = bucket_key(seller_id);
        let updated = compare_and_set(self, &key, None, || Some(init.clone()), apply).await?;
        updated.ok_or(StoreError::Contention { key })
    }

    async fn put_oauth_state(&self, state: OAuthState, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(&state)?;
        let _: () = conn
            .set_ex(oauth_state_key(&state.state), json, ttl_secs(ttl))
            .await?;
        Ok(())
    }

    async fn take_oauth_state(&self, state: &str) -> Result<Option<OAuthState>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get_del(oauth_state_key(state)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Redis expires the binding itself, so `now` is not consulted.
    async fn claim_idempotency_key(
        &self,
        seller_id: &str,
        key: &str,
        job_id: Uuid,
        _now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut conn = self.conn.clone();
        let redis_key = idempotency_key(seller_id, key);
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&redis_key)
            .arg(job_id.to_string())
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        if claimed.is_some() {
            return Ok(None);
        }
        let existing: Option<String> = conn.get(&redis_key).await?;
        Ok(existing.and_then(|raw| Uuid::parse_str(&raw).ok()))
    }
}
