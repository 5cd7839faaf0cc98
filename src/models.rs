use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;
use uuid::Uuid;

/// E-commerce platforms reviews can be ingested from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Amazon,
    Shopify,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Amazon => "amazon",
            Platform::Shopify => "shopify",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "amazon" => Some(Platform::Amazon),
            "shopify" => Some(Platform::Shopify),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SellerStatus {
    Active,
    ReauthorizeRequired,
    InsufficientPermissions,
    Revoked,
}

impl fmt::Display for SellerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SellerStatus::Active => "active",
            SellerStatus::ReauthorizeRequired => "reauthorize_required",
            SellerStatus::InsufficientPermissions => "insufficient_permissions",
            SellerStatus::Revoked => "revoked",
        };
        f.write_str(label)
    }
}

/// How the long-lived credential of a seller is used.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// Refresh token exchanged for short-lived access tokens (LWA).
    Refresh,
    /// Long-lived access token used as-is (Shopify).
    Permanent,
}

/// Seller or shop account authorized through OAuth.
///
/// The encrypted credential is only ever decrypted by the token service;
/// API responses expose [`TokenMetadata`] instead of this struct.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seller {
    pub id: String,
    pub platform: Platform,
    /// Amazon marketplace id or Shopify shop domain.
    pub marketplace_id: String,
    pub client_id: String,
    pub(crate) encrypted_credential: String,
    pub credential_kind: CredentialKind,
    pub(crate) access_token: Option<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub status: SellerStatus,
    pub created_at: DateTime<Utc>,
    pub last_token_refresh_at: Option<DateTime<Utc>>,
    pub last_token_refresh_error: Option<String>,
    pub seller_name: Option<String>,
    pub seller_email: Option<String>,
}

/// Public view of a seller's authorization state without token material.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub seller_id: String,
    pub platform: Platform,
    pub marketplace_id: String,
    pub status: SellerStatus,
    pub credential_kind: CredentialKind,
    pub created_at: DateTime<Utc>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub last_token_refresh_at: Option<DateTime<Utc>>,
    pub last_token_refresh_error: Option<String>,
}

impl From<&Seller> for TokenMetadata {
    fn from(seller: &Seller) -> Self {
        Self {
            seller_id: seller.id.clone(),
            platform: seller.platform,
            marketplace_id: seller.marketplace_id.clone(),
            status: seller.status,
            credential_kind: seller.credential_kind,
            created_at: seller.created_at,
            access_token_expires_at: seller.access_token_expires_at,
            last_token_refresh_at: seller.last_token_refresh_at,
            last_token_refresh_error: seller.last_token_refresh_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Success,
    PartialSuccess,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::PartialSuccess | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Status only moves forward: pending -> in_progress -> terminal.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => next != JobStatus::Pending,
            JobStatus::InProgress => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Success => "success",
            JobStatus::PartialSuccess => "partial_success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    #[default]
    Full,
    Recent,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| at >= start) && self.end.is_none_or(|end| at <= end)
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchJob {
    pub id: Uuid,
    pub seller_id: String,
    pub platform: Platform,
    pub marketplace_id: String,
    pub item_ids: Vec<String>,
    pub date_range: Option<DateRange>,
    pub mode: JobMode,
    pub status: JobStatus,
    pub total_items: u32,
    pub completed_items: u32,
    pub failed_items: u32,
    pub total_reviews_fetched: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub raw_locations: Vec<String>,
    pub processed_locations: Vec<String>,
    pub error_message: Option<String>,
    pub requested_by: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemFetchResult {
    pub job_id: Uuid,
    pub item_id: String,
    pub status: JobStatus,
    pub reviews_count: u64,
    pub pages_fetched: u32,
    pub last_cursor: Option<String>,
    pub raw_locations: Vec<String>,
    pub processed_location: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ItemFetchResult {
    pub fn new(job_id: Uuid, item_id: &str) -> Self {
        Self {
            job_id,
            item_id: item_id.to_string(),
            status: JobStatus::Pending,
            reviews_count: 0,
            pages_fetched: 0,
            last_cursor: None,
            raw_locations: Vec::new(),
            processed_location: None,
            error_message: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Persistent token bucket, one per seller.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitBucket {
    pub seller_id: String,
    pub tokens: f64,
    pub max_tokens: f64,
    pub refill_rate: f64,
    pub last_refill_at: DateTime<Utc>,
    pub throttled_until: Option<DateTime<Utc>>,
}

/// Anti-forgery state issued when an authorization flow starts.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
    pub state: String,
    pub platform: Platform,
    pub seller_id: String,
    pub shop: Option<String>,
    pub return_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
