use std::{env, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct LwaConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub token_url: String,
    pub authorization_url: String,
}

#[derive(Debug, Clone)]
pub struct SpApiConfig {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub endpoint_na: String,
    pub endpoint_eu: String,
    pub endpoint_fe: String,
    /// Reviews path template, `{asin}` is substituted per item.
    pub reviews_path: String,
}

#[derive(Debug, Clone)]
pub struct ShopifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub api_version: String,
    pub scopes: String,
    pub reviews_namespace: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst_capacity: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based): `base * 2^attempt`
    /// capped at `backoff_max`, scaled by `jitter` in `[0.5, 1.0]`.
    pub fn delay(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 2f64.powi(attempt.min(30) as i32);
        let raw = (self.backoff_base.as_secs_f64() * factor).min(self.backoff_max.as_secs_f64());
        Duration::from_secs_f64(raw * jitter.clamp(0.5, 1.0))
    }

    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let jitter = rand::rng().random_range(0.5..=1.0);
        self.delay(attempt, jitter)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub capacity: usize,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub redis_url: Option<String>,
    pub object_store_root: PathBuf,
    /// Base64 of a 32-byte AES-256-GCM key. `None` means an ephemeral key.
    pub encryption_key: Option<String>,
    pub lwa: LwaConfig,
    pub spapi: SpApiConfig,
    pub shopify: ShopifyConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    pub queue: QueueConfig,
    pub token_refresh_buffer: Duration,
    pub page_size: u32,
    pub recent_mode_max_pages: u32,
    pub compress_normalized: bool,
    pub oauth_state_ttl: Duration,
    pub idempotency_ttl: Duration,
    pub http_timeout: Duration,
    pub http_connect_timeout: Duration,
    pub request_max_bytes: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings = Self {
            port: parse_env("PORT", 8000)?,
            redis_url: optional("REDIS_URL"),
            object_store_root: PathBuf::from(string_or("OBJECT_STORE_ROOT", "./data")),
            encryption_key: optional("ENCRYPTION_KEY"),
            lwa: LwaConfig {
                client_id: string_or("LWA_CLIENT_ID", ""),
                client_secret: string_or("LWA_CLIENT_SECRET", ""),
                redirect_uri: string_or("LWA_REDIRECT_URI", ""),
                token_url: string_or("LWA_TOKEN_URL", "https://api.amazon.com/auth/o2/token"),
                authorization_url: string_or(
                    "LWA_AUTHORIZATION_URL",
                    "https://www.amazon.com/ap/oa",
                ),
            },
            spapi: SpApiConfig {
                aws_access_key_id: string_or("SPAPI_AWS_ACCESS_KEY_ID", ""),
                aws_secret_access_key: string_or("SPAPI_AWS_SECRET_ACCESS_KEY", ""),
                endpoint_na: string_or(
                    "SPAPI_ENDPOINT_NA",
                    "https://sellingpartnerapi-na.amazon.com",
                ),
                endpoint_eu: string_or(
                    "SPAPI_ENDPOINT_EU",
                    "https://sellingpartnerapi-eu.amazon.com",
                ),
                endpoint_fe: string_or(
                    "SPAPI_ENDPOINT_FE",
                    "https://sellingpartnerapi-fe.amazon.com",
                ),
                reviews_path: string_or(
                    "SPAPI_REVIEWS_PATH",
                    "/customer-feedback/v2024-06-01/asins/{asin}/reviews",
                ),
            },
            shopify: ShopifyConfig {
                client_id: string_or("SHOPIFY_CLIENT_ID", ""),
                client_secret: string_or("SHOPIFY_CLIENT_SECRET", ""),
                redirect_uri: string_or("SHOPIFY_REDIRECT_URI", ""),
                api_version: string_or("SHOPIFY_API_VERSION", "2024-10"),
                scopes: string_or("SHOPIFY_SCOPES", "read_products"),
                reviews_namespace: string_or("SHOPIFY_REVIEWS_NAMESPACE", "reviews"),
            },
            rate_limit: RateLimitConfig {
                requests_per_second: parse_env("SPAPI_REQUESTS_PER_SECOND", 2.0)?,
                burst_capacity: parse_env("SPAPI_BURST_CAPACITY", 10.0)?,
            },
            retry: RetryPolicy {
                max_attempts: parse_env("FETCH_MAX_ATTEMPTS", 5)?,
                backoff_base: Duration::from_secs(parse_env("RETRY_BACKOFF_BASE_SECONDS", 2)?),
                backoff_max: Duration::from_secs(parse_env("RETRY_BACKOFF_MAX_SECONDS", 64)?),
            },
            queue: QueueConfig {
                capacity: parse_env("QUEUE_CAPACITY", 256)?,
                concurrency: parse_env("WORKER_CONCURRENCY", 8)?,
                max_attempts: parse_env("TASK_MAX_ATTEMPTS", 5)?,
                retry_delay: Duration::from_secs(parse_env("TASK_RETRY_DELAY_SECONDS", 30)?),
            },
            token_refresh_buffer: Duration::from_secs(parse_env(
                "TOKEN_REFRESH_BUFFER_SECONDS",
                60,
            )?),
            page_size: parse_env("PAGE_SIZE", 100)?,
            recent_mode_max_pages: parse_env("RECENT_MODE_MAX_PAGES", 5)?,
            compress_normalized: parse_env_bool("COMPRESS_NORMALIZED", true),
            oauth_state_ttl: Duration::from_secs(parse_env("OAUTH_STATE_TTL_SECONDS", 600)?),
            idempotency_ttl: Duration::from_secs(parse_env("IDEMPOTENCY_TTL_SECS", 3600)?),
            http_timeout: Duration::from_secs(parse_env("HTTP_TIMEOUT_SECS", 30)?),
            http_connect_timeout: Duration::from_secs(parse_env("HTTP_CONNECT_TIMEOUT_SECS", 5)?),
            request_max_bytes: parse_env("REQUEST_MAX_BYTES", 256 * 1024)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.requests_per_second <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "SPAPI_REQUESTS_PER_SECOND",
                reason: "must be positive".into(),
            });
        }
        if self.rate_limit.burst_capacity < 1.0 {
            return Err(ConfigError::Invalid {
                key: "SPAPI_BURST_CAPACITY",
                reason: "must be at least 1".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "FETCH_MAX_ATTEMPTS",
                reason: "must be at least 1".into(),
            });
        }
        if self.queue.concurrency == 0 || self.queue.capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_CONCURRENCY",
                reason: "queue capacity and concurrency must be positive".into(),
            });
        }
        if !(1..=250).contains(&self.page_size) {
            return Err(ConfigError::Invalid {
                key: "PAGE_SIZE",
                reason: "must be between 1 and 250".into(),
            });
        }
        Ok(())
    }

    /// Fails when credentials needed to reach a platform are absent.
    pub fn require_platform_credentials(&self) -> Result<(), ConfigError> {
        let required = [
            ("LWA_CLIENT_ID", &self.lwa.client_id),
            ("LWA_CLIENT_SECRET", &self.lwa.client_secret),
            ("SPAPI_AWS_ACCESS_KEY_ID", &self.spapi.aws_access_key_id),
            ("SPAPI_AWS_SECRET_ACCESS_KEY", &self.spapi.aws_secret_access_key),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(key));
            }
        }
        Ok(())
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn string_or(key: &str, default: &str) -> String {
    optional(key).unwrap_or_else(|| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional(key) {
        Some(raw) => raw.parse::<T>().map_err(|err| ConfigError::Invalid {
            key,
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    match optional(key) {
        Some(value) => matches!(
            value.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings {
        port: 0,
        redis_url: None,
        object_store_root: PathBuf::from("./data"),
        encryption_key: None,
        lwa: LwaConfig {
            client_id: "amzn1.application-oa2-client.test".into(),
            client_secret: "lwa-secret".into(),
            redirect_uri: "https://ingest.example.com/auth/amazon/callback".into(),
            token_url: "https://api.amazon.com/auth/o2/token".into(),
            authorization_url: "https://www.amazon.com/ap/oa".into(),
        },
        spapi: SpApiConfig {
            aws_access_key_id: "AKIDEXAMPLE".into(),
            aws_secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            endpoint_na: "https://sellingpartnerapi-na.amazon.com".into(),
            endpoint_eu: "https://sellingpartnerapi-eu.amazon.com".into(),
            endpoint_fe: "https://sellingpartnerapi-fe.amazon.com".into(),
            reviews_path: "/customer-feedback/v2024-06-01/asins/{asin}/reviews".into(),
        },
        shopify: ShopifyConfig {
            client_id: "shopify-client".into(),
            client_secret: "shopify-secret".into(),
            redirect_uri: "https://ingest.example.com/auth/shopify/callback".into(),
            api_version: "2024-10".into(),
            scopes: "read_products".into(),
            reviews_namespace: "reviews".into(),
        },
        rate_limit: RateLimitConfig {
            requests_per_second: 2.0,
            burst_capacity: 10.0,
        },
        retry: RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        },
        queue: QueueConfig {
            capacity: 64,
            concurrency: 4,
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
        },
        token_refresh_buffer: Duration::from_secs(60),
        page_size: 100,
        recent_mode_max_pages: 2,
        compress_normalized: false,
        oauth_state_ttl: Duration::from_secs(600),
        idempotency_ttl: Duration::from_secs(3600),
        http_timeout: Duration::from_secs(5),
        http_connect_timeout: Duration::from_secs(2),
        request_max_bytes: 256 * 1024,
    }
}
