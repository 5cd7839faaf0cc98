use super::{AuthError, OAuthProvider, TokenBundle};
use crate::{config::LwaConfig, models::CredentialKind};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{error, info};

const CONSENT_SCOPE: &str = "profile postal_code";

/// Login with Amazon OAuth client.
#[derive(Clone)]
pub struct LwaClient {
    http: Client,
    config: LwaConfig,
}

impl LwaClient {
    pub fn new(http: Client, config: LwaConfig) -> Self {
        Self { http, config }
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<TokenBundle, AuthError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                target = "reviews.tokens",
                status = status.as_u16(),
                "lwa token request rejected"
            );
            return Err(AuthError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let mut bundle: TokenBundle = response.json().await?;
        bundle.expires_in = Some(bundle.expires_in.unwrap_or(super::DEFAULT_EXPIRES_IN_SECS));
        Ok(bundle)
    }
}

#[async_trait]
impl OAuthProvider for LwaClient {
    fn credential_kind(&self) -> CredentialKind {
        CredentialKind::Refresh
    }

    fn client_id(&self) -> &str {
        &self.config.client_id
    }

    fn authorization_url(&self, _shop: Option<&str>, state: &str) -> Result<String, AuthError> {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("scope", CONSENT_SCOPE),
            ("response_type", "code"),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("state", state),
        ];
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        Ok(format!("{}?{query}", self.config.authorization_url))
    }

    async fn exchange_code(&self, code: &str, _shop: Option<&str>) -> Result<TokenBundle, AuthError> {
        info!(target = "reviews.tokens", "exchanging lwa authorization code");
        let bundle = self
            .request_token(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ])
            .await?;
        if bundle.refresh_token.is_none() {
            return Err(AuthError::Decode(
                "authorization_code grant returned no refresh_token".into(),
            ));
        }
        Ok(bundle)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenBundle, AuthError> {
        self.request_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ])
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> LwaClient {
        let mut config = test_settings().lwa;
        config.token_url = format!("{}/auth/o2/token", server.uri());
        LwaClient::new(Client::new(), config)
    }

    #[test]
    fn consent_url_carries_state_and_redirect() {
        let config = test_settings().lwa;
        let url = LwaClient::new(Client::new(), config)
            .authorization_url(None, "st4te")
            .unwrap();
        assert!(url.starts_with("https://www.amazon.com/ap/oa?client_id="));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("state=st4te"));
        assert!(url.contains(
            "redirect_uri=https%3A%2F%2Fingest.example.com%2Fauth%2Famazon%2Fcallback"
        ));
    }

    #[tokio::test]
    async fn refresh_posts_form_grant_and_defaults_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/o2/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=Atzr%7Cold"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "Atza|new",
                "token_type": "bearer"
            })))
            .mount(&server)
            .await;

        let bundle = client(&server).refresh("Atzr|old").await.unwrap();
        assert_eq!(bundle.access_token, "Atza|new");
        assert_eq!(bundle.expires_in, Some(3600));
        assert!(bundle.refresh_token.is_none());
    }

    #[tokio::test]
    async fn rejected_grant_surfaces_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let err = client(&server).refresh("Atzr|old").await.unwrap_err();
        assert!(matches!(err, AuthError::Provider { status: 400, .. }));
        assert!(err.is_authorization_failure());
    }

    #[tokio::test]
    async fn code_exchange_requires_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "Atza|a",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;
        let err = client(&server).exchange_code("code-1", None).await.unwrap_err();
        assert!(matches!(err, AuthError::Decode(_)));
    }
}
