mod auth;
mod clock;
mod config;
mod crypto;
mod fetch;
mod http;
mod jobs;
mod models;
mod normalize;
mod platform;
mod ratelimit;
mod remote;
mod shopify;
mod spapi;
mod storage;
mod store;

use auth::{AuthError, AuthorizationCallback, TokenError, TokenService};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use clock::{Clock, SystemClock};
use config::{ConfigError, Settings};
use crypto::CredentialCipher;
use fetch::{FetchOptions, ItemFetcher};
use jobs::{JobError, JobService, SubmitRequest, TaskQueue, TaskReceiver, Worker};
use models::{ApiError, DateRange, FetchJob, ItemFetchResult, JobMode, Platform, TokenMetadata};
use platform::PlatformRegistry;
use ratelimit::RateLimiter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use storage::{FsObjectStore, ObjectStore, ReviewStorage};
use store::{MemoryRepository, RedisRepository, Repository};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "reviews.api", error = %err, "server crashed");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = Settings::from_env()?;
    if let Err(err) = settings.require_platform_credentials() {
        warn!(target = "reviews.api", error = %err, "amazon credentials incomplete; amazon calls will fail");
    }

    let cipher = match &settings.encryption_key {
        Some(key) => CredentialCipher::from_base64(key)?,
        None if settings.redis_url.is_some() => {
            return Err(ConfigError::Missing("ENCRYPTION_KEY").into());
        }
        None => {
            warn!(
                target = "reviews.api",
                "ENCRYPTION_KEY not set; using an ephemeral key, stored credentials will not survive a restart"
            );
            CredentialCipher::ephemeral()?
        }
    };

    let repo: Arc<dyn Repository> = match &settings.redis_url {
        Some(url) => {
            info!(target = "reviews.api", "using redis repository");
            Arc::new(RedisRepository::connect(url).await?)
        }
        None => {
            info!(target = "reviews.api", "REDIS_URL not set; using in-process repository");
            Arc::new(MemoryRepository::new())
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let platforms = Arc::new(PlatformRegistry::from_settings(
        &settings,
        http::build_client(&settings),
        clock.clone(),
    ));
    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&settings.object_store_root));

    let (state, worker, receiver) = assemble(&settings, repo, clock, cipher, platforms, objects);
    let _worker = worker.spawn(receiver);
    let app = router(state, settings.request_max_bytes);

    let addr: SocketAddr = ([0, 0, 0, 0], settings.port).into();
    info!(target = "reviews.api", %addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    tokens: Arc<TokenService>,
    jobs: Arc<JobService>,
}

/// Wires the services over the given backends.
fn assemble(
    settings: &Settings,
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    cipher: CredentialCipher,
    platforms: Arc<PlatformRegistry>,
    objects: Arc<dyn ObjectStore>,
) -> (AppState, Worker, TaskReceiver) {
    let tokens = Arc::new(TokenService::new(
        repo.clone(),
        platforms.clone(),
        cipher,
        clock.clone(),
        settings.token_refresh_buffer,
        settings.oauth_state_ttl,
    ));
    let limiter = Arc::new(RateLimiter::new(repo.clone(), clock.clone(), settings.rate_limit));
    let fetcher = Arc::new(ItemFetcher::new(
        repo.clone(),
        tokens.clone(),
        limiter,
        ReviewStorage::new(objects, settings.compress_normalized),
        platforms,
        clock.clone(),
        FetchOptions::from_settings(settings),
    ));

    let (queue, receiver) = TaskQueue::channel(settings.queue.capacity);
    let jobs = Arc::new(JobService::new(
        repo,
        queue.clone(),
        clock.clone(),
        settings.idempotency_ttl,
    ));
    let worker = Worker::new(jobs.clone(), fetcher, queue, clock, settings.queue);
    (AppState { tokens, jobs }, worker, receiver)
}

fn router(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/auth/{platform}/start", get(authorize_start))
        .route(
            "/auth/{platform}/callback",
            get(authorize_callback_query).post(authorize_callback),
        )
        .nest(
            "/sellers/{id}",
            Router::new()
                .route("/refresh-token", post(refresh_token))
                .route("/tokens", get(token_metadata))
                .route("/revoke", post(revoke_seller))
                .route("/jobs", get(seller_jobs)),
        )
        .route("/fetch/reviews", post(submit_fetch))
        .route("/jobs/{id}", get(job_status))
        .route("/jobs/{id}/items", get(job_items))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "review-ingest",
        "timestamp": chrono::Utc::now(),
    }))
}

fn parse_platform(raw: &str) -> Result<Platform, AppError> {
    Platform::from_str(raw).ok_or_else(|| AppError::BadRequest(format!("unsupported platform {raw:?}")))
}

fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw.trim()).map_err(|_| AppError::BadRequest(format!("invalid job id {raw:?}")))
}

#[derive(Debug, Deserialize)]
struct StartQuery {
    seller_id: String,
    shop: Option<String>,
    return_to: Option<String>,
}

/// Redirects the seller to the platform's consent page.
///
/// - Method: `GET`
/// - Path: `/auth/{platform}/start?seller_id&shop&return_to`
async fn authorize_start(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Query(query): Query<StartQuery>,
) -> Result<Redirect, AppError> {
    let platform = parse_platform(&platform)?;
    let start = state
        .tokens
        .start_authorization(platform, &query.seller_id, query.shop.as_deref(), query.return_to)
        .await?;
    Ok(Redirect::temporary(&start.url))
}

/// Callback parameters. Amazon redirects with `spapi_oauth_code` and
/// `selling_partner_id`; Shopify identifies the seller by `shop`.
#[derive(Debug, Deserialize)]
struct CallbackRequest {
    #[serde(alias = "spapi_oauth_code")]
    code: String,
    state: String,
    #[serde(default, alias = "selling_partner_id")]
    seller_id: Option<String>,
    #[serde(default)]
    marketplace_id: Option<String>,
    #[serde(default)]
    shop: Option<String>,
    #[serde(default)]
    seller_name: Option<String>,
    #[serde(default)]
    seller_email: Option<String>,
}

#[derive(Debug, Serialize)]
struct CallbackResponse {
    ok: bool,
    seller_id: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    return_to: Option<String>,
}

async fn authorize_callback(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Json(request): Json<CallbackRequest>,
) -> Result<Json<CallbackResponse>, AppError> {
    complete_callback(&state, &platform, request).await
}

async fn authorize_callback_query(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Query(request): Query<CallbackRequest>,
) -> Result<Json<CallbackResponse>, AppError> {
    complete_callback(&state, &platform, request).await
}

async fn complete_callback(
    state: &AppState,
    platform: &str,
    request: CallbackRequest,
) -> Result<Json<CallbackResponse>, AppError> {
    let platform = parse_platform(platform)?;
    let seller_id = request
        .seller_id
        .filter(|id| !id.trim().is_empty())
        .or_else(|| {
            request
                .shop
                .as_deref()
                .map(shopify::normalize_shop_domain)
        })
        .ok_or_else(|| AppError::BadRequest("seller_id is required".into()))?;

    let (seller, return_to) = state
        .tokens
        .complete_authorization(AuthorizationCallback {
            platform,
            code: request.code,
            state: request.state,
            seller_id,
            marketplace_id: request.marketplace_id,
            seller_name: request.seller_name,
            seller_email: request.seller_email,
        })
        .await?;

    info!(target = "reviews.api", seller_id = %seller.id, platform = %platform, "authorization completed");
    Ok(Json(CallbackResponse {
        ok: true,
        message: format!("{} seller authorized", seller.platform),
        seller_id: seller.id,
        return_to,
    }))
}

async fn refresh_token(
    State(state): State<AppState>,
    Path(seller_id): Path<String>,
) -> Result<Json<TokenMetadata>, AppError> {
    Ok(Json(state.tokens.refresh_now(&seller_id).await?))
}

async fn token_metadata(
    State(state): State<AppState>,
    Path(seller_id): Path<String>,
) -> Result<Json<TokenMetadata>, AppError> {
    Ok(Json(state.tokens.token_metadata(&seller_id).await?))
}

async fn revoke_seller(
    State(state): State<AppState>,
    Path(seller_id): Path<String>,
) -> Result<Json<TokenMetadata>, AppError> {
    Ok(Json(state.tokens.revoke(&seller_id).await?))
}

async fn seller_jobs(
    State(state): State<AppState>,
    Path(seller_id): Path<String>,
) -> Result<Json<Vec<FetchJob>>, AppError> {
    state.tokens.seller(&seller_id).await?;
    Ok(Json(state.jobs.jobs_for_seller(&seller_id).await?))
}

#[derive(Debug, Deserialize)]
struct FetchReviewsRequest {
    seller_id: String,
    #[serde(default, alias = "shop")]
    marketplace_id: Option<String>,
    #[serde(alias = "asins", alias = "product_ids")]
    item_ids: Vec<String>,
    #[serde(default)]
    date_range: Option<DateRange>,
    #[serde(default)]
    mode: JobMode,
    #[serde(default)]
    requested_by: Option<String>,
}

#[derive(Debug, Serialize)]
struct FetchReviewsResponse {
    job_id: Uuid,
    status: models::JobStatus,
    message: String,
    items_count: usize,
}

/// Queues a review fetch job.
///
/// - Method: `POST`
/// - Path: `/fetch/reviews`
/// - Headers: optional `Idempotency-Key`
/// - Response: `202` with the job id
async fn submit_fetch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<FetchReviewsRequest>,
) -> Result<(StatusCode, Json<FetchReviewsResponse>), AppError> {
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let submission = state
        .jobs
        .submit(
            SubmitRequest {
                seller_id: payload.seller_id,
                marketplace_id: payload.marketplace_id,
                item_ids: payload.item_ids,
                date_range: payload.date_range,
                mode: payload.mode,
                requested_by: payload.requested_by,
            },
            idempotency_key.as_deref(),
        )
        .await?;

    let job = submission.job;
    let message = if submission.reused {
        "existing job returned for Idempotency-Key".to_string()
    } else {
        format!("fetching reviews for {} items", job.item_ids.len())
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(FetchReviewsResponse {
            job_id: job.id,
            status: job.status,
            message,
            items_count: job.item_ids.len(),
        }),
    ))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FetchJob>, AppError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(state.jobs.check_completion(job_id).await?))
}

async fn job_items(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ItemFetchResult>>, AppError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(state.jobs.items(job_id).await?))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FetchJob>, AppError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(state.jobs.cancel(job_id).await?))
}

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    Token(TokenError),
    Job(JobError),
}

impl From<TokenError> for AppError {
    fn from(value: TokenError) -> Self {
        Self::Token(value)
    }
}

impl From<JobError> for AppError {
    fn from(value: JobError) -> Self {
        Self::Job(value)
    }
}

impl AppError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            AppError::Token(err) => match err {
                TokenError::SellerNotFound(_) => (StatusCode::NOT_FOUND, "seller_not_found"),
                TokenError::SellerInactive { .. } => (StatusCode::CONFLICT, "seller_inactive"),
                TokenError::InvalidState | TokenError::StateExpired | TokenError::StateMismatch => {
                    (StatusCode::BAD_REQUEST, "invalid_state")
                }
                TokenError::InvalidRequest(_) | TokenError::Auth(AuthError::MissingParameter(_)) => {
                    (StatusCode::BAD_REQUEST, "invalid_request")
                }
                TokenError::Auth(AuthError::UnsupportedOperation(_)) => {
                    (StatusCode::CONFLICT, "unsupported_operation")
                }
                TokenError::Auth(_) => (StatusCode::BAD_GATEWAY, "upstream_auth_error"),
                TokenError::Crypto(_) | TokenError::Store(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            },
            AppError::Job(err) => match err {
                JobError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
                JobError::SellerNotFound(_) => (StatusCode::NOT_FOUND, "seller_not_found"),
                JobError::NotFound(_) => (StatusCode::NOT_FOUND, "job_not_found"),
                JobError::SellerInactive { .. } => (StatusCode::CONFLICT, "seller_inactive"),
                JobError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
                JobError::QueueClosed | JobError::Store(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            },
        }
    }

    fn detail(&self) -> String {
        match self {
            AppError::BadRequest(message) => message.clone(),
            AppError::Token(err) => err.to_string(),
            AppError::Job(err) => err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        let detail = self.detail();
        if status.is_server_error() {
            error!(target = "reviews.api", status = status.as_u16(), error = %detail, "request failed");
        }
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::tokens::testing::{active_seller, offline_registry},
        clock::ManualClock,
        config::test_settings,
        storage::MemoryObjectStore,
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, header},
    };
    use chrono::TimeZone;
    use serde_json::Value;
    use tower::ServiceExt;

    struct App {
        router: Router,
        repo: Arc<MemoryRepository>,
        _receiver: TaskReceiver,
    }

    async fn app() -> App {
        let settings = test_settings();
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(
            chrono::Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap(),
        ));
        let cipher = CredentialCipher::new([3u8; 32]);
        repo.put_seller(active_seller(&cipher, "A1", clock.now()))
            .await
            .unwrap();
        let (state, _worker, receiver) = assemble(
            &settings,
            repo.clone(),
            clock,
            cipher,
            Arc::new(offline_registry()),
            Arc::new(MemoryObjectStore::default()),
        );
        App {
            router: router(state, settings.request_max_bytes),
            repo,
            _receiver: receiver,
        }
    }

    async fn call(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_service() {
        let app = app().await;
        let (status, _, body) = call(&app.router, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "review-ingest");
    }

    #[tokio::test]
    async fn submit_then_query_job() {
        let app = app().await;
        let (status, _, body) = call(
            &app.router,
            post_json(
                "/fetch/reviews",
                json!({"seller_id": "A1", "asins": ["B01", "B02", "B01"], "mode": "recent"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["items_count"], 2);
        assert_eq!(body["status"], "pending");
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let (status, _, job) = call(&app.router, get_request(&format!("/jobs/{job_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["mode"], "recent");
        assert_eq!(job["item_ids"], json!(["B01", "B02"]));

        let (status, _, jobs) = call(&app.router, get_request("/sellers/A1/jobs")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(jobs.as_array().unwrap().len(), 1);

        let (status, _, cancelled) =
            call(&app.router, post_json(&format!("/jobs/{job_id}/cancel"), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "cancelled");
        let (status, _, body) =
            call(&app.router, post_json(&format!("/jobs/{job_id}/cancel"), json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");
    }

    #[tokio::test]
    async fn idempotency_header_returns_same_job() {
        let app = app().await;
        let request = || {
            Request::post("/fetch/reviews")
                .header(header::CONTENT_TYPE, "application/json")
                .header("Idempotency-Key", "abc-123")
                .body(Body::from(json!({"seller_id": "A1", "item_ids": ["B01"]}).to_string()))
                .unwrap()
        };
        let (_, _, first) = call(&app.router, request()).await;
        let (status, _, second) = call(&app.router, request()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(first["job_id"], second["job_id"]);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let app = app().await;

        let (status, _, body) = call(&app.router, get_request("/jobs/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (status, _, body) =
            call(&app.router, get_request(&format!("/jobs/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "job_not_found");

        let (status, _, _) = call(&app.router, get_request("/sellers/ghost/tokens")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = call(
            &app.router,
            post_json("/fetch/reviews", json!({"seller_id": "A1", "item_ids": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, body) = call(&app.router, post_json("/sellers/A1/revoke", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "revoked");
        let (status, _, body) = call(
            &app.router,
            post_json("/fetch/reviews", json!({"seller_id": "A1", "item_ids": ["B01"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "seller_inactive");
    }

    #[tokio::test]
    async fn token_metadata_has_no_secrets() {
        let app = app().await;
        let (status, _, body) = call(&app.router, get_request("/sellers/A1/tokens")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");
        let text = body.to_string();
        assert!(!text.contains("Atza|cached"));
        assert!(body.get("encrypted_credential").is_none());
    }

    #[tokio::test]
    async fn authorization_start_redirects_with_state() {
        let app = app().await;
        let (status, headers, _) = call(
            &app.router,
            get_request("/auth/amazon/start?seller_id=A9&return_to=%2Fdone"),
        )
        .await;
        assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
        let location = headers[header::LOCATION].to_str().unwrap();
        assert!(location.contains("state="));

        let (status, _, _) = call(&app.router, get_request("/auth/shopify/start?seller_id=s1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _, _) = call(&app.router, get_request("/auth/ebay/start?seller_id=s1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn callback_with_unknown_state_is_rejected() {
        let app = app().await;
        let (status, _, body) = call(
            &app.router,
            post_json(
                "/auth/amazon/callback",
                json!({"code": "c", "state": "forged", "seller_id": "A9", "marketplace_id": "ATVPDKIKX0DER"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_state");
        assert!(app.repo.get_seller("A9").await.unwrap().is_none());
    }
}
