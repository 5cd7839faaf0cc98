//! Object storage for raw upstream pages and normalized review artifacts.

use crate::{models::Platform, normalize::CanonicalReview};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::{Compression, write::GzEncoder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error("object store i/o on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("object {key} is not valid json: {source}")]
    Serde {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        key: key.to_string(),
        source,
    }
}

/// Rejects keys that could escape the store root.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    /// Stores the object atomically and returns its location.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, StorageError>;
    fn location(&self, key: &str) -> String;
}

/// Filesystem store rooted at a directory. Objects are written to a
/// temporary sibling and renamed into place, so a visible object is complete.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(Path::new(key)))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path(key)?;
        tokio::fs::try_exists(&path).await.map_err(io_error(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(key)(err)),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error(key))?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes).await.map_err(io_error(key))?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(key)(err));
        }
        debug!(target = "reviews.storage", key = %key, bytes = bytes.len(), "object stored");
        Ok(self.location(key))
    }

    fn location(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }
}

#[cfg(test)]
pub(crate) use memory::MemoryObjectStore;


/// One upstream page exactly as received, plus what is needed to resume
/// pagination from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPageRecord {
    pub item_id: String,
    pub page_token: String,
    pub fetched_at: DateTime<Utc>,
    pub next_cursor: Option<String>,
    pub body: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMeta {
    pub pages_fetched: u32,
    pub next_token: Option<String>,
    pub fetch_duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedArtifact {
    pub job_id: Uuid,
    pub platform: Platform,
    pub seller_id: String,
    pub item_id: String,
    pub fetched_at: DateTime<Utc>,
    pub source_endpoint: String,
    pub raw_paths: Vec<String>,
    pub reviews_count: u64,
    pub reviews: Vec<CanonicalReview>,
    pub meta: ArtifactMeta,
}

/// Identifies the objects written for one item of one job.
#[derive(Debug, Clone, Copy)]
pub struct ItemScope<'a> {
    pub platform: Platform,
    pub seller_id: &'a str,
    pub item_id: &'a str,
    pub job_id: Uuid,
    /// Date segments come from here so keys are stable across re-runs.
    pub job_created_at: DateTime<Utc>,
}

impl ItemScope<'_> {
    fn prefix(&self, area: &str) -> String {
        format!(
            "{area}/{}/{}/{}/{}",
            self.platform,
            urlencoding::encode(self.seller_id),
            urlencoding::encode(self.item_id),
            self.job_created_at.format("%Y/%m/%d"),
        )
    }
}

#[derive(Clone)]
pub struct ReviewStorage {
    store: Arc<dyn ObjectStore>,
    compress: bool,
}

impl ReviewStorage {
    pub fn new(store: Arc<dyn ObjectStore>, compress: bool) -> Self {
        Self { store, compress }
    }

    pub fn raw_key(scope: &ItemScope<'_>, page_token: &str) -> String {
        format!(
            "{}/{}/{}.json",
            scope.prefix("raw"),
            scope.job_id,
            urlencoding::encode(page_token)
        )
    }

    pub fn processed_key(&self, scope: &ItemScope<'_>) -> String {
        let suffix = if self.compress { ".json.gz" } else { ".json" };
        format!("{}/{}{suffix}", scope.prefix("processed"), scope.job_id)
    }

    pub fn raw_location(&self, scope: &ItemScope<'_>, page_token: &str) -> String {
        self.store.location(&Self::raw_key(scope, page_token))
    }

    pub async fn raw_exists(
        &self,
        scope: &ItemScope<'_>,
        page_token: &str,
    ) -> Result<bool, StorageError> {
        self.store.exists(&Self::raw_key(scope, page_token)).await
    }

    pub async fn read_raw(
        &self,
        scope: &ItemScope<'_>,
        page_token: &str,
    ) -> Result<Option<RawPageRecord>, StorageError> {
        let key = Self::raw_key(scope, page_token);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Serde { key, source })
    }

    pub async fn write_raw(
        &self,
        scope: &ItemScope<'_>,
        record: &RawPageRecord,
    ) -> Result<String, StorageError> {
        let key = Self::raw_key(scope, &record.page_token);
        let bytes = serde_json::to_vec(record).map_err(|source| StorageError::Serde {
            key: key.clone(),
            source,
        })?;
        self.store.put(&key, bytes).await
    }

    pub async fn write_normalized(
        &self,
        scope: &ItemScope<'_>,
        artifact: &NormalizedArtifact,
    ) -> Result<String, StorageError> {
        let key = self.processed_key(scope);
        let json = serde_json::to_vec(artifact).map_err(|source| StorageError::Serde {
            key: key.clone(),
            source,
        })?;
        let bytes = if self.compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&json).map_err(io_error(&key))?;
            encoder.finish().map_err(io_error(&key))?
        } else {
            json
        };
        self.store.put(&key, bytes).await
    }

    #[cfg(test)]
    pub(crate) async fn read_normalized(
        &self,
        scope: &ItemScope<'_>,
    ) -> Option<NormalizedArtifact> {
        use std::io::Read;
        let bytes = self.store.get(&self.processed_key(scope)).await.ok()??;
        let json = if self.compress {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(bytes.as_slice())
                .read_to_end(&mut out)
                .ok()?;
            out
        } else {
            bytes
        };
        serde_json::from_slice(&json).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn scope(job_id: Uuid) -> ItemScope<'static> {
        ItemScope {
            platform: Platform::Amazon,
            seller_id: "A1SELLER",
            item_id: "B000TEST",
            job_id,
            job_created_at: Utc.with_ymd_and_hms(2025, 4, 9, 23, 59, 0).unwrap(),
        }
    }

    fn record(page_token: &str) -> RawPageRecord {
        RawPageRecord {
            item_id: "B000TEST".into(),
            page_token: page_token.into(),
            fetched_at: Utc.with_ymd_and_hms(2025, 4, 10, 1, 0, 0).unwrap(),
            next_cursor: Some("tok-2".into()),
            body: json!({"reviews": [{"reviewId": "R1"}], "nextToken": "tok-2"}),
        }
    }

    #[test]
    fn keys_follow_layout_and_job_date() {
        let job_id = Uuid::nil();
        let key = ReviewStorage::raw_key(&scope(job_id), "page1");
        assert_eq!(
            key,
            format!("raw/amazon/A1SELLER/B000TEST/2025/04/09/{job_id}/page1.json")
        );

        let storage = ReviewStorage::new(Arc::new(MemoryObjectStore::default()), true);
        assert_eq!(
            storage.processed_key(&scope(job_id)),
            format!("processed/amazon/A1SELLER/B000TEST/2025/04/09/{job_id}.json.gz")
        );
    }

    #[test]
    fn traversal_keys_are_rejected() {
        for key in ["", "/etc/passwd", "raw/../secret", "raw//x", "raw/./x", "a\\b"] {
            assert!(validate_key(key).is_err(), "{key}");
        }
        assert!(validate_key("raw/amazon/x.json").is_ok());
    }

    #[test]
    fn id_segments_cannot_add_path_components() {
        let mut scoped = scope(Uuid::nil());
        scoped.item_id = "../../etc";
        let key = ReviewStorage::raw_key(&scoped, "page1");
        assert!(validate_key(&key).is_ok());
        assert!(key.contains("..%2F..%2Fetc"));
    }

    #[tokio::test]
    async fn filesystem_store_round_trips_raw_pages() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ReviewStorage::new(Arc::new(FsObjectStore::new(dir.path())), false);
        let scoped = scope(Uuid::new_v4());

        assert!(!storage.raw_exists(&scoped, "page1").await.unwrap());
        let location = storage.write_raw(&scoped, &record("page1")).await.unwrap();
        assert!(location.starts_with("file://"));
        assert!(storage.raw_exists(&scoped, "page1").await.unwrap());

        let back = storage.read_raw(&scoped, "page1").await.unwrap().unwrap();
        assert_eq!(back.next_cursor.as_deref(), Some("tok-2"));
        assert_eq!(back.body, record("page1").body);
        assert!(storage.read_raw(&scoped, "page2").await.unwrap().is_none());

        let leftovers: Vec<_> = walk(dir.path())
            .into_iter()
            .filter(|p| p.to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn compressed_artifact_is_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let storage = ReviewStorage::new(store.clone(), true);
        let scoped = scope(Uuid::new_v4());
        let artifact = NormalizedArtifact {
            job_id: scoped.job_id,
            platform: Platform::Amazon,
            seller_id: "A1SELLER".into(),
            item_id: "B000TEST".into(),
            fetched_at: Utc::now(),
            source_endpoint: "https://sellingpartnerapi-na.amazon.com/x".into(),
            raw_paths: vec!["file:///tmp/raw/page1.json".into()],
            reviews_count: 0,
            reviews: Vec::new(),
            meta: ArtifactMeta {
                pages_fetched: 1,
                next_token: None,
                fetch_duration_seconds: 0.5,
            },
        };

        let location = storage.write_normalized(&scoped, &artifact).await.unwrap();
        assert!(location.ends_with(".json.gz"));
        let bytes = store
            .get(&storage.processed_key(&scoped))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);

        let back = storage.read_normalized(&scoped).await.unwrap();
        assert_eq!(back.raw_paths, artifact.raw_paths);
        let text = serde_json::to_value(&back).unwrap();
        assert!(text["meta"].get("fetchDurationSeconds").is_some());
    }

    fn walk(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
        out
    }
}
