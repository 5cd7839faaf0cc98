//! AWS Signature Version 4 for Selling Partner API requests.
//!
//! Signing is a pure function of its inputs: the timestamp comes from the
//! `x-amz-date` header the caller sets, never from the clock.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const AMZ_DATE_HEADER: &str = "x-amz-date";
pub const CONTENT_SHA_HEADER: &str = "x-amz-content-sha256";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignError {
    #[error("{0} header is required for signing")]
    MissingHeader(&'static str),
    #[error("{AMZ_DATE_HEADER} must look like 20250101T000000Z, got {0:?}")]
    MalformedDate(String),
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub service: String,
}

pub struct SignableRequest<'a> {
    pub method: &'a str,
    /// Path component of the URL, as sent (unencoded segments are fine).
    pub path: &'a str,
    pub query: &'a [(String, String)],
    pub headers: &'a [(String, String)],
    pub body: &'a [u8],
}

/// `x-amz-date` formatting of a timestamp.
pub fn amz_date(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Hex SHA-256 of a request body, as used in the canonical request and the
/// optional `x-amz-content-sha256` header.
pub fn payload_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Returns the canonicalized request headers followed by `authorization`.
pub fn sign(
    request: &SignableRequest<'_>,
    credentials: &Credentials,
) -> Result<Vec<(String, String)>, SignError> {
    let amz_date = request
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(AMZ_DATE_HEADER))
        .map(|(_, value)| value.trim().to_string())
        .ok_or(SignError::MissingHeader(AMZ_DATE_HEADER))?;
    if amz_date.len() != 16 || !amz_date.is_ascii() || !amz_date.ends_with('Z') {
        return Err(SignError::MalformedDate(amz_date));
    }
    let date_stamp = &amz_date[..8];

    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = [
        request.method.to_ascii_uppercase(),
        canonical_uri(request.path),
        canonical_query(request.query),
        canonical_headers,
        signed_headers.clone(),
        payload_hash(request.body),
    ]
    .join("\n");

    let scope = format!(
        "{date_stamp}/{}/{}/aws4_request",
        credentials.region, credentials.service
    );
    let string_to_sign = [
        ALGORITHM.to_string(),
        amz_date.clone(),
        scope.clone(),
        hex::encode(Sha256::digest(canonical_request.as_bytes())),
    ]
    .join("\n");

    let signing_key = derive_signing_key(credentials, date_stamp);
    let signature = hex::encode(hmac(&signing_key, string_to_sign.as_bytes()));
    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id
    );

    headers.push(("authorization".to_string(), authorization));
    Ok(headers)
}

fn hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(credentials: &Credentials, date_stamp: &str) -> Vec<u8> {
    let seed = format!("AWS4{}", credentials.secret_access_key);
    let k_date = hmac(seed.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac(&k_date, credentials.region.as_bytes());
    let k_service = hmac(&k_region, credentials.service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

fn canonical_uri(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(|segment| {
            let decoded = urlencoding::decode(segment)
                .map(|value| value.into_owned())
                .unwrap_or_else(|_| segment.to_string());
            urlencoding::encode(&decoded).into_owned()
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(key, value)| {
            (
                urlencoding::encode(key).into_owned(),
                urlencoding::encode(value).into_owned(),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}
