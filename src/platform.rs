use crate::{
    auth::{LwaClient, OAuthProvider, ShopifyOAuth},
    clock::Clock,
    config::Settings,
    models::Platform,
    normalize::{self, Normalizer},
    remote::ReviewSource,
    shopify::ShopifyClient,
    spapi::SpApiClient,
};
use reqwest::Client;
use std::sync::Arc;

/// What the pipeline needs from one platform.
#[derive(Clone)]
pub struct PlatformCapabilities {
    pub auth: Arc<dyn OAuthProvider>,
    pub source: Arc<dyn ReviewSource>,
    pub normalize: Normalizer,
}

#[derive(Clone)]
pub struct PlatformRegistry {
    amazon: PlatformCapabilities,
    shopify: PlatformCapabilities,
}

impl PlatformRegistry {
    pub fn new(amazon: PlatformCapabilities, shopify: PlatformCapabilities) -> Self {
        Self { amazon, shopify }
    }

    pub fn from_settings(settings: &Settings, http: Client, clock: Arc<dyn Clock>) -> Self {
        let amazon = PlatformCapabilities {
            auth: Arc::new(LwaClient::new(http.clone(), settings.lwa.clone())),
            source: Arc::new(SpApiClient::new(http.clone(), settings.spapi.clone(), clock)),
            normalize: normalize::amazon::normalize,
        };
        let shopify = PlatformCapabilities {
            auth: Arc::new(ShopifyOAuth::new(http.clone(), settings.shopify.clone())),
            source: Arc::new(ShopifyClient::new(http, settings.shopify.clone())),
            normalize: normalize::shopify::normalize,
        };
        Self::new(amazon, shopify)
    }

    pub fn get(&self, platform: Platform) -> &PlatformCapabilities {
        match platform {
            Platform::Amazon => &self.amazon,
            Platform::Shopify => &self.shopify,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::SystemClock, config::test_settings, models::CredentialKind};

    #[test]
    fn each_platform_gets_its_own_capabilities() {
        let registry =
            PlatformRegistry::from_settings(&test_settings(), Client::new(), Arc::new(SystemClock));
        assert_eq!(
            registry.get(Platform::Amazon).auth.credential_kind(),
            CredentialKind::Refresh
        );
        assert_eq!(
            registry.get(Platform::Shopify).auth.credential_kind(),
            CredentialKind::Permanent
        );
        assert!(
            registry
                .get(Platform::Shopify)
                .source
                .source_endpoint("1", "demo")
                .starts_with("https://demo.myshopify.com/admin/api/2024-10/")
        );
    }
}
