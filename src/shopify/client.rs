use super::normalize_shop_domain;
use crate::{
    config::ShopifyConfig,
    remote::{PageRequest, RemoteError, ReviewPage, ReviewSource, classify},
};
use async_trait::async_trait;
use reqwest::{Client, Url, header::HeaderMap};
use serde_json::Value;
use tracing::{info, warn};

const MAX_PAGE_SIZE: u32 = 250;

/// Reads review metafields of Shopify products through the Admin REST API.
#[derive(Clone)]
pub struct ShopifyClient {
    http: Client,
    config: ShopifyConfig,
    base_url: Option<String>,
}

impl ShopifyClient {
    pub fn new(http: Client, config: ShopifyConfig) -> Self {
        Self {
            http,
            config,
            base_url: None,
        }
    }

    /// Sends every shop to `url` instead of `https://<shop>`.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    fn metafields_url(&self, shop: &str, product_id: &str) -> String {
        let base = match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}", normalize_shop_domain(shop)),
        };
        format!(
            "{base}/admin/api/{}/products/{}/metafields.json",
            self.config.api_version,
            urlencoding::encode(product_id)
        )
    }
}

/// `page_info` of the `rel="next"` entry of a `Link` header.
fn next_page_info(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(reqwest::header::LINK)?.to_str().ok()?;
    link.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|param| {
            let param = param.trim().replace(' ', "");
            param == "rel=\"next\"" || param == "rel=next"
        });
        if !is_next {
            return None;
        }
        let url = Url::parse(target.trim_start_matches('<').trim_end_matches('>')).ok()?;
        url.query_pairs()
            .find(|(key, _)| key == "page_info")
            .map(|(_, value)| value.into_owned())
    })
}

#[async_trait]
impl ReviewSource for ShopifyClient {
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<ReviewPage, RemoteError> {
        let limit = request.page_size.clamp(1, MAX_PAGE_SIZE).to_string();
        let url = self.metafields_url(request.marketplace_id, request.item_id);
        let query: Vec<(&str, &str)> = match request.cursor {
            // Shopify rejects filters alongside page_info.
            Some(cursor) => vec![("limit", limit.as_str()), ("page_info", cursor)],
            None => vec![
                ("limit", limit.as_str()),
                ("namespace", self.config.reviews_namespace.as_str()),
            ],
        };

        let response = self
            .http
            .get(&url)
            .query(&query)
            .header("X-Shopify-Access-Token", request.access_token)
            .send()
            .await?;
        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await?;

        if !status.is_success() {
            let err = classify(status, &headers, &text);
            warn!(
                target = "reviews.shopify",
                shop = %request.marketplace_id,
                product_id = %request.item_id,
                status = status.as_u16(),
                error = %err,
                "metafields request failed"
            );
            return Err(err);
        }

        let body: Value =
            serde_json::from_str(&text).map_err(|err| RemoteError::Decode(err.to_string()))?;
        let items = self.items_from_body(&body);
        let next_cursor = next_page_info(&headers);
        info!(
            target = "reviews.shopify",
            shop = %request.marketplace_id,
            product_id = %request.item_id,
            metafields = items.len(),
            has_more = next_cursor.is_some(),
            "fetched metafields page"
        );
        Ok(ReviewPage {
            body,
            items,
            next_cursor,
        })
    }

    fn items_from_body(&self, body: &Value) -> Vec<Value> {
        body.get("metafields")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    fn source_endpoint(&self, item_id: &str, marketplace_id: &str) -> String {
        self.metafields_url(marketplace_id, item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::test_settings, remote::FailureKind};
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const METAFIELDS_PATH: &str = "/admin/api/2024-10/products/8123/metafields.json";

    fn client(server: &MockServer) -> ShopifyClient {
        ShopifyClient::new(Client::new(), test_settings().shopify).with_base_url(server.uri())
    }

    fn request(cursor: Option<&str>) -> PageRequest<'_> {
        PageRequest {
            item_id: "8123",
            marketplace_id: "demo.myshopify.com",
            access_token: "shpat_token",
            page_size: 500,
            cursor,
        }
    }

    #[test]
    fn link_header_yields_next_page_info() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "link",
            HeaderValue::from_static(
                "<https://demo.myshopify.com/admin/api/2024-10/products/1/metafields.json?limit=250&page_info=prev1>; rel=\"previous\", \
                 <https://demo.myshopify.com/admin/api/2024-10/products/1/metafields.json?limit=250&page_info=next2>; rel=\"next\"",
            ),
        );
        assert_eq!(next_page_info(&headers).as_deref(), Some("next2"));
        assert_eq!(next_page_info(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn first_page_filters_by_namespace_and_follows_link() {
        let server = MockServer::start().await;
        let next = format!(
            "<{}{METAFIELDS_PATH}?limit=250&page_info=abc>; rel=\"next\"",
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path(METAFIELDS_PATH))
            .and(query_param("namespace", "reviews"))
            .and(query_param("limit", "250"))
            .and(header("X-Shopify-Access-Token", "shpat_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", next.as_str())
                    .set_body_json(json!({"metafields": [{"id": 1, "value": "{}"}]})),
            )
            .mount(&server)
            .await;

        let page = client(&server).fetch_page(&request(None)).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn cursor_page_sends_page_info_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(METAFIELDS_PATH))
            .and(query_param("page_info", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"metafields": []})))
            .mount(&server)
            .await;

        let page = client(&server).fetch_page(&request(Some("abc"))).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next_cursor, None);
    }

    #[tokio::test]
    async fn unauthorized_shop_needs_reauthorization() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let err = client(&server).fetch_page(&request(None)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::NeedsReauth);
    }
}
