use super::{AuthError, OAuthProvider, TokenBundle};
use crate::{config::ShopifyConfig, models::CredentialKind, shopify::normalize_shop_domain};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info};

/// Shopify OAuth; the code exchange yields a permanent offline token.
#[derive(Clone)]
pub struct ShopifyOAuth {
    http: Client,
    config: ShopifyConfig,
    base_url: Option<String>,
}

impl ShopifyOAuth {
    pub fn new(http: Client, config: ShopifyConfig) -> Self {
        Self {
            http,
            config,
            base_url: None,
        }
    }

    /// Sends token exchanges to `url` instead of `https://<shop>`.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    fn shop_base(&self, shop: &str) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{shop}"),
        }
    }
}

#[async_trait]
impl OAuthProvider for ShopifyOAuth {
    fn credential_kind(&self) -> CredentialKind {
        CredentialKind::Permanent
    }

    fn client_id(&self) -> &str {
        &self.config.client_id
    }

    fn authorization_url(&self, shop: Option<&str>, state: &str) -> Result<String, AuthError> {
        let shop = normalize_shop_domain(shop.ok_or(AuthError::MissingParameter("shop"))?);
        Ok(format!(
            "https://{shop}/admin/oauth/authorize?client_id={}&scope={}&redirect_uri={}&state={}",
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.scopes),
            urlencoding::encode(&self.config.redirect_uri),
            urlencoding::encode(state),
        ))
    }

    async fn exchange_code(&self, code: &str, shop: Option<&str>) -> Result<TokenBundle, AuthError> {
        let shop = normalize_shop_domain(shop.ok_or(AuthError::MissingParameter("shop"))?);
        info!(target = "reviews.tokens", shop = %shop, "exchanging shopify authorization code");

        let response = self
            .http
            .post(format!("{}/admin/oauth/access_token", self.shop_base(&shop)))
            .json(&json!({
                "client_id": self.config.client_id,
                "client_secret": self.config.client_secret,
                "code": code,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                target = "reviews.tokens",
                shop = %shop,
                status = status.as_u16(),
                "shopify token exchange rejected"
            );
            return Err(AuthError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let mut bundle: TokenBundle = response.json().await?;
        bundle.expires_in = None;
        bundle.refresh_token = None;
        Ok(bundle)
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenBundle, AuthError> {
        Err(AuthError::UnsupportedOperation(
            "shopify access tokens are permanent; the shop must reauthorize",
        ))
    }
}
