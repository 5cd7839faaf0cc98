//! Token lifecycle per seller: consent, code exchange, cached access tokens
//! and just-in-time refresh.

use super::{AuthError, DEFAULT_EXPIRES_IN_SECS, TokenBundle};
use crate::{
    clock::Clock,
    crypto::{CredentialCipher, CryptoError},
    models::{CredentialKind, OAuthState, Platform, Seller, SellerStatus, TokenMetadata},
    platform::PlatformRegistry,
    shopify::normalize_shop_domain,
    store::{Repository, StoreError},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("seller {0} not found")]
    SellerNotFound(String),
    #[error("seller {seller_id} is {status}")]
    SellerInactive {
        seller_id: String,
        status: SellerStatus,
    },
    #[error("unknown or already used oauth state")]
    InvalidState,
    #[error("oauth state has expired")]
    StateExpired,
    #[error("oauth state was issued for a different seller or platform")]
    StateMismatch,
    #[error("invalid authorization request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationStart {
    pub url: String,
    pub state: String,
}

/// Query/body of an OAuth callback.
#[derive(Debug, Clone)]
pub struct AuthorizationCallback {
    pub platform: Platform,
    pub code: String,
    pub state: String,
    pub seller_id: String,
    /// Amazon marketplace id; ignored for shop-scoped platforms.
    pub marketplace_id: Option<String>,
    pub seller_name: Option<String>,
    pub seller_email: Option<String>,
}

pub struct TokenService {
    repo: Arc<dyn Repository>,
    platforms: Arc<PlatformRegistry>,
    cipher: CredentialCipher,
    clock: Arc<dyn Clock>,
    refresh_buffer: Duration,
    state_ttl: Duration,
}

fn seconds(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn random_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl TokenService {
    pub fn new(
        repo: Arc<dyn Repository>,
        platforms: Arc<PlatformRegistry>,
        cipher: CredentialCipher,
        clock: Arc<dyn Clock>,
        refresh_buffer: Duration,
        state_ttl: Duration,
    ) -> Self {
        Self {
            repo,
            platforms,
            cipher,
            clock,
            refresh_buffer,
            state_ttl,
        }
    }

    pub async fn seller(&self, seller_id: &str) -> Result<Seller, TokenError> {
        self.repo
            .get_seller(seller_id)
            .await?
            .ok_or_else(|| TokenError::SellerNotFound(seller_id.to_string()))
    }

    fn cached_token(&self, seller: &Seller, now: DateTime<Utc>) -> Option<String> {
        let expires_at = seller.access_token_expires_at?;
        let token = seller.access_token.as_ref()?;
        let fresh_until = expires_at.checked_sub_signed(seconds(self.refresh_buffer))?;
        (now < fresh_until).then(|| token.clone())
    }

    pub async fn start_authorization(
        &self,
        platform: Platform,
        seller_id: &str,
        shop: Option<&str>,
        return_to: Option<String>,
    ) -> Result<AuthorizationStart, TokenError> {
        if seller_id.trim().is_empty() {
            return Err(TokenError::InvalidRequest("seller_id is required".into()));
        }
        let shop = match (platform, shop) {
            (Platform::Shopify, Some(shop)) => Some(normalize_shop_domain(shop)),
            (Platform::Shopify, None) => {
                return Err(TokenError::InvalidRequest("shop is required".into()));
            }
            (Platform::Amazon, _) => None,
        };

        let state = random_state();
        let url = self
            .platforms
            .get(platform)
            .auth
            .authorization_url(shop.as_deref(), &state)?;
        self.repo
            .put_oauth_state(
                OAuthState {
                    state: state.clone(),
                    platform,
                    seller_id: seller_id.to_string(),
                    shop,
                    return_to,
                    created_at: self.clock.now(),
                },
                self.state_ttl,
            )
            .await?;

        info!(
            target = "reviews.tokens",
            seller_id = %seller_id,
            platform = %platform,
            "authorization started"
        );
        Ok(AuthorizationStart { url, state })
    }

    /// Consumes the state, exchanges the code and stores the encrypted
    /// long-lived credential. Returns the seller and the state's `return_to`.
    pub async fn complete_authorization(
        &self,
        callback: AuthorizationCallback,
    ) -> Result<(Seller, Option<String>), TokenError> {
        let stored = self
            .repo
            .take_oauth_state(&callback.state)
            .await?
            .ok_or(TokenError::InvalidState)?;
        let now = self.clock.now();
        if now - stored.created_at > seconds(self.state_ttl) {
            return Err(TokenError::StateExpired);
        }
        if stored.platform != callback.platform || stored.seller_id != callback.seller_id {
            return Err(TokenError::StateMismatch);
        }

        let marketplace_id = match callback.platform {
            Platform::Amazon => callback
                .marketplace_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| TokenError::InvalidRequest("marketplace_id is required".into()))?,
            Platform::Shopify => stored
                .shop
                .clone()
                .ok_or_else(|| TokenError::InvalidRequest("state carries no shop".into()))?,
        };

        let existing = self.repo.get_seller(&callback.seller_id).await?;
        if let Some(existing) = &existing
            && existing.platform != callback.platform
        {
            return Err(TokenError::InvalidRequest(format!(
                "seller {} is registered on {}",
                existing.id, existing.platform
            )));
        }

        let provider = &self.platforms.get(callback.platform).auth;
        let bundle = provider
            .exchange_code(&callback.code, stored.shop.as_deref())
            .await?;
        let kind = provider.credential_kind();
        let (credential, access_token, expires_at) = match kind {
            CredentialKind::Refresh => {
                let refresh = bundle.refresh_token.clone().ok_or_else(|| {
                    AuthError::Decode("code exchange returned no refresh_token".into())
                })?;
                (refresh, Some(bundle.access_token.clone()), Some(expiry(now, &bundle)))
            }
            CredentialKind::Permanent => (bundle.access_token.clone(), None, None),
        };

        let seller = Seller {
            id: callback.seller_id.clone(),
            platform: callback.platform,
            marketplace_id,
            client_id: provider.client_id().to_string(),
            encrypted_credential: self.cipher.encrypt(&credential)?,
            credential_kind: kind,
            access_token,
            access_token_expires_at: expires_at,
            status: SellerStatus::Active,
            created_at: existing.as_ref().map_or(now, |seller| seller.created_at),
            last_token_refresh_at: Some(now),
            last_token_refresh_error: None,
            seller_name: callback
                .seller_name
                .or_else(|| existing.as_ref().and_then(|s| s.seller_name.clone())),
            seller_email: callback
                .seller_email
                .or_else(|| existing.as_ref().and_then(|s| s.seller_email.clone())),
        };
        self.repo.put_seller(seller.clone()).await?;

        info!(
            target = "reviews.tokens",
            seller_id = %seller.id,
            platform = %seller.platform,
            reauthorized = existing.is_some(),
            "seller authorized"
        );
        Ok((seller, stored.return_to))
    }

    /// Returns a usable access token, refreshing it when it is missing or
    /// within the refresh buffer of its expiry.
    pub async fn get_valid_access_token(&self, seller_id: &str) -> Result<String, TokenError> {
        let seller = self.seller(seller_id).await?;
        if seller.status != SellerStatus::Active {
            return Err(TokenError::SellerInactive {
                seller_id: seller.id,
                status: seller.status,
            });
        }
        if seller.credential_kind == CredentialKind::Permanent {
            return Ok(self.cipher.decrypt(&seller.encrypted_credential)?);
        }
        if let Some(token) = self.cached_token(&seller, self.clock.now()) {
            return Ok(token);
        }
        self.refresh(&seller).await
    }

    /// Forces a refresh regardless of the cached token.
    pub async fn refresh_now(&self, seller_id: &str) -> Result<TokenMetadata, TokenError> {
        let seller = self.seller(seller_id).await?;
        if seller.status == SellerStatus::Revoked {
            return Err(TokenError::SellerInactive {
                seller_id: seller.id,
                status: seller.status,
            });
        }
        self.refresh(&seller).await?;
        Ok(TokenMetadata::from(&self.seller(seller_id).await?))
    }

    async fn refresh(&self, seller: &Seller) -> Result<String, TokenError> {
        let provider = &self.platforms.get(seller.platform).auth;
        if !provider.supports_refresh() || seller.credential_kind != CredentialKind::Refresh {
            return Err(AuthError::UnsupportedOperation(
                "platform issues permanent tokens; the seller must reauthorize",
            )
            .into());
        }

        let refresh_token = self.cipher.decrypt(&seller.encrypted_credential)?;
        match provider.refresh(&refresh_token).await {
            Ok(bundle) => self.store_refreshed(seller, bundle).await,
            Err(err) => self.record_refresh_failure(seller, err).await,
        }
    }

    async fn store_refreshed(
        &self,
        seller: &Seller,
        bundle: TokenBundle,
    ) -> Result<String, TokenError> {
        let now = self.clock.now();
        let expires_at = expiry(now, &bundle);
        let rotated = match &bundle.refresh_token {
            Some(token) => Some(self.cipher.encrypt(token)?),
            None => None,
        };
        let access_token = bundle.access_token;

        let updated = self
            .repo
            .update_seller(&seller.id, &mut |row| {
                row.access_token = Some(access_token.clone());
                row.access_token_expires_at = Some(expires_at);
                row.last_token_refresh_at = Some(now);
                row.last_token_refresh_error = None;
                if let Some(encrypted) = &rotated {
                    row.encrypted_credential = encrypted.clone();
                }
            })
            .await?;
        if updated.is_none() {
            return Err(TokenError::SellerNotFound(seller.id.clone()));
        }

        info!(
            target = "reviews.tokens",
            seller_id = %seller.id,
            rotated = rotated.is_some(),
            expires_at = %expires_at,
            "access token refreshed"
        );
        Ok(access_token)
    }

    async fn record_refresh_failure(
        &self,
        seller: &Seller,
        err: AuthError,
    ) -> Result<String, TokenError> {
        // Another task may have refreshed while this one was waiting.
        let now = self.clock.now();
        if let Some(current) = self.repo.get_seller(&seller.id).await?
            && current.access_token != seller.access_token
            && let Some(token) = self.cached_token(&current, now)
        {
            info!(
                target = "reviews.tokens",
                seller_id = %seller.id,
                "refresh lost the race to a concurrent refresh; using its token"
            );
            return Ok(token);
        }

        let message = err.to_string();
        let reauthorize = err.is_authorization_failure();
        self.repo
            .update_seller(&seller.id, &mut |row| {
                row.last_token_refresh_error = Some(message.clone());
                row.last_token_refresh_at = Some(now);
                if reauthorize && row.status == SellerStatus::Active {
                    row.status = SellerStatus::ReauthorizeRequired;
                }
            })
            .await?;

        if reauthorize {
            warn!(
                target = "reviews.tokens",
                seller_id = %seller.id,
                error = %message,
                "refresh grant rejected; seller must reauthorize"
            );
        } else {
            warn!(
                target = "reviews.tokens",
                seller_id = %seller.id,
                error = %message,
                "access token refresh failed"
            );
        }
        Err(err.into())
    }

    /// Flags the seller after the platform API itself rejected its token.
    pub async fn mark_reauthorize_required(
        &self,
        seller_id: &str,
        error: &str,
    ) -> Result<(), TokenError> {
        let now = self.clock.now();
        let updated = self
            .repo
            .update_seller(seller_id, &mut |row| {
                if row.status == SellerStatus::Active {
                    row.status = SellerStatus::ReauthorizeRequired;
                }
                row.last_token_refresh_error = Some(error.to_string());
                row.last_token_refresh_at = Some(now);
            })
            .await?;
        if updated.is_none() {
            return Err(TokenError::SellerNotFound(seller_id.to_string()));
        }
        warn!(
            target = "reviews.tokens",
            seller_id = %seller_id,
            error = %error,
            "seller flagged for reauthorization"
        );
        Ok(())
    }

    /// Revocation keeps the encrypted credential for audit.
    pub async fn revoke(&self, seller_id: &str) -> Result<TokenMetadata, TokenError> {
        let seller = self
            .repo
            .update_seller(seller_id, &mut |row| {
                row.status = SellerStatus::Revoked;
                row.access_token = None;
                row.access_token_expires_at = None;
            })
            .await?
            .ok_or_else(|| TokenError::SellerNotFound(seller_id.to_string()))?;
        info!(target = "reviews.tokens", seller_id = %seller_id, "seller revoked");
        Ok(TokenMetadata::from(&seller))
    }

    pub async fn token_metadata(&self, seller_id: &str) -> Result<TokenMetadata, TokenError> {
        Ok(TokenMetadata::from(&self.seller(seller_id).await?))
    }
}

fn expiry(now: DateTime<Utc>, bundle: &TokenBundle) -> DateTime<Utc> {
    let secs = bundle.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    chrono::Duration::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX))
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
