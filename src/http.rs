use crate::config::Settings;
use reqwest::Client;

/// Shared outbound client used for every OAuth and platform API call.
pub fn build_client(settings: &Settings) -> Client {
    Client::builder()
        .timeout(settings.http_timeout)
        .connect_timeout(settings.http_connect_timeout)
        .user_agent(concat!("review-ingest/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}
