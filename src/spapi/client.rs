use super::signer::{self, Credentials, SignableRequest};
use crate::{
    clock::Clock,
    config::SpApiConfig,
    remote::{PageRequest, RemoteError, ReviewPage, ReviewSource, classify},
};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SERVICE: &str = "execute-api";

/// Selling Partner API region serving a marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Na,
    Eu,
    Fe,
}

impl Region {
    /// Unknown marketplaces are served from North America.
    pub fn for_marketplace(marketplace_id: &str) -> Self {
        match marketplace_id {
            "ATVPDKIKX0DER" | "A2EUQ1WTGCTBG2" | "A1AM78C64UM0Y8" => Region::Na,
            "A1PA6795UKMFR9" | "A1RKKUPIHCS9HS" | "A13V1IB3VIYZZH" => Region::Eu,
            "A1VC38T7YXB528" | "A39IBJ37TRP1C6" => Region::Fe,
            _ => Region::Na,
        }
    }

    pub fn aws_region(&self) -> &'static str {
        match self {
            Region::Na => "us-east-1",
            Region::Eu => "eu-west-1",
            Region::Fe => "us-west-2",
        }
    }
}

#[derive(Clone)]
pub struct SpApiClient {
    http: Client,
    config: SpApiConfig,
    clock: Arc<dyn Clock>,
    endpoint_override: Option<String>,
}

impl SpApiClient {
    pub fn new(http: Client, config: SpApiConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            http,
            config,
            clock,
            endpoint_override: None,
        }
    }

    /// Sends every region to `endpoint` (tests, sandbox).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into());
        self
    }

    fn endpoint(&self, region: Region) -> &str {
        if let Some(endpoint) = &self.endpoint_override {
            return endpoint;
        }
        match region {
            Region::Na => &self.config.endpoint_na,
            Region::Eu => &self.config.endpoint_eu,
            Region::Fe => &self.config.endpoint_fe,
        }
    }

    fn reviews_path(&self, item_id: &str) -> String {
        self.config
            .reviews_path
            .replace("{asin}", &urlencoding::encode(item_id))
    }

    fn credentials(&self, region: Region) -> Credentials {
        Credentials {
            access_key_id: self.config.aws_access_key_id.clone(),
            secret_access_key: self.config.aws_secret_access_key.clone(),
            region: region.aws_region().to_string(),
            service: SERVICE.to_string(),
        }
    }
}

fn next_token(body: &Value) -> Option<String> {
    body.get("nextToken")
        .or_else(|| body.get("pagination").and_then(|p| p.get("nextToken")))
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn host_header(url: &Url) -> Result<String, RemoteError> {
    let host = url
        .host_str()
        .ok_or_else(|| RemoteError::Transport(format!("endpoint {url} has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[async_trait]
impl ReviewSource for SpApiClient {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<ReviewPage, RemoteError> {
        let region = Region::for_marketplace(request.marketplace_id);
        let path = self.reviews_path(request.item_id);

        let mut query = vec![
            ("marketplaceIds".to_string(), request.marketplace_id.to_string()),
            ("pageSize".to_string(), request.page_size.to_string()),
        ];
        if let Some(cursor) = request.cursor {
            query.push(("nextToken".to_string(), cursor.to_string()));
        }
        let encoded_query = query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let raw_url = format!(
            "{}{path}?{encoded_query}",
            self.endpoint(region).trim_end_matches('/')
        );
        let url = Url::parse(&raw_url)
            .map_err(|err| RemoteError::Transport(format!("invalid endpoint url: {err}")))?;

        let headers = vec![
            ("host".to_string(), host_header(&url)?),
            (
                signer::AMZ_DATE_HEADER.to_string(),
                signer::amz_date(self.clock.now()),
            ),
            (
                "x-amz-access-token".to_string(),
                request.access_token.to_string(),
            ),
            (
                signer::CONTENT_SHA_HEADER.to_string(),
                signer::payload_hash(b""),
            ),
        ];
        let signed = signer::sign(
            &SignableRequest {
                method: "GET",
                path: url.path(),
                query: &query,
                headers: &headers,
                body: b"",
            },
            &self.credentials(region),
        )?;

        let mut builder = self.http.get(url);
        for (name, value) in signed.iter().filter(|(name, _)| name != "host") {
            builder = builder.header(name.as_str(), value.as_str());
        }

        debug!(
            target = "reviews.spapi",
            item_id = %request.item_id,
            region = region.aws_region(),
            has_cursor = request.cursor.is_some(),
            "requesting reviews page"
        );
        let response = builder.send().await?;
        let status = response.status();
        let response_headers = response.headers().clone();
        let text = response.text().await?;

        if !status.is_success() {
            let err = classify(status, &response_headers, &text);
            warn!(
                target = "reviews.spapi",
                item_id = %request.item_id,
                status = status.as_u16(),
                error = %err,
                "reviews request failed"
            );
            return Err(err);
        }

        let body: Value =
            serde_json::from_str(&text).map_err(|err| RemoteError::Decode(err.to_string()))?;
        let items = self.items_from_body(&body);
        let next_cursor = next_token(&body);
        info!(
            target = "reviews.spapi",
            item_id = %request.item_id,
            reviews = items.len(),
            has_more = next_cursor.is_some(),
            "fetched reviews page"
        );
        Ok(ReviewPage {
            body,
            items,
            next_cursor,
        })
    }

    fn items_from_body(&self, body: &Value) -> Vec<Value> {
        body.get("reviews")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    fn source_endpoint(&self, item_id: &str, marketplace_id: &str) -> String {
        let region = Region::for_marketplace(marketplace_id);
        format!(
            "{}{}",
            self.endpoint(region).trim_end_matches('/'),
            self.reviews_path(item_id)
        )
    }
}
