//! Access token exchange and gateway URL discovery.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::debug;

use super::{AccessProvider, ApiError};

/// Tokens are refreshed this long before their reported expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Credential exchange against the platform's auth endpoint, with an
/// in-memory token cache.
pub struct HttpAccessProvider {
    http: Client,
    base_url: String,
    app_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl HttpAccessProvider {
    pub fn new(http: Client, base_url: String, app_id: String, client_secret: String) -> Self {
        Self {
            http,
            base_url,
            app_id,
            client_secret,
            cached: Mutex::new(None),
        }
    }

    async fn exchange(&self) -> Result<CachedToken, ApiError> {
        let url = format!("{}/app/getAppAccessToken", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&TokenRequest {
                app_id: &self.app_id,
                client_secret: &self.client_secret,
            })
            .send()
            .await?;

        if let Some(err) = check_status(&response) {
            return Err(err);
        }

        let body: TokenResponse = response.json().await?;
        debug!(expires_in = body.expires_in, "Exchanged app credentials for access token");
        Ok(CachedToken {
            token: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        })
    }
}

#[async_trait]
impl AccessProvider for HttpAccessProvider {
    async fn token(&self) -> Result<String, ApiError> {
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref()
            && entry.expires_at.saturating_duration_since(Instant::now()) > REFRESH_MARGIN
        {
            return Ok(entry.token.clone());
        }

        let fresh = self.exchange().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    async fn gateway_url(&self) -> Result<String, ApiError> {
        let token = self.token().await?;
        let url = format!("{}/gateway", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("Bot {token}"))
            .send()
            .await?;

        if let Some(err) = check_status(&response) {
            return Err(err);
        }

        let body: GatewayResponse = response.json().await?;
        validate_gateway_url(&body.url)?;
        Ok(body.url)
    }

    async fn force_refresh(&self) {
        *self.cached.lock().await = None;
    }
}

/// Map non-success statuses to structured errors; 429 carries Retry-After.
fn check_status(response: &reqwest::Response) -> Option<ApiError> {
    let status = response.status();
    if status.is_success() {
        return None;
    }
    if status.as_u16() == 429 {
        let retry_after_seconds = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        return Some(ApiError::RateLimited {
            retry_after_seconds,
        });
    }
    Some(ApiError::Api {
        status: status.as_u16(),
        message: status.canonical_reason().unwrap_or("unknown").to_string(),
    })
}

/// Only secure WebSocket URLs are accepted from discovery.
fn validate_gateway_url(raw: &str) -> Result<(), ApiError> {
    match url::Url::parse(raw) {
        Ok(parsed) if parsed.scheme() == "wss" && parsed.host_str().is_some() => Ok(()),
        _ => Err(ApiError::InvalidGatewayUrl(raw.to_string())),
    }
}

#[derive(serde::Serialize)]
struct TokenRequest<'a> {
    #[serde(rename = "appId")]
    app_id: &'a str,
    #[serde(rename = "clientSecret")]
    client_secret: &'a str,
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(deserialize_with = "string_or_u64")]
    expires_in: u64,
}

#[derive(serde::Deserialize)]
struct GatewayResponse {
    url: String,
}

/// The auth endpoint reports `expires_in` as a string in some deployments
/// and a number in others.
fn string_or_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_url_must_be_wss() {
        assert!(validate_gateway_url("wss://gateway.relay.example/ws").is_ok());
        assert!(validate_gateway_url("ws://gateway.relay.example/ws").is_err());
        assert!(validate_gateway_url("https://gateway.relay.example").is_err());
        assert!(validate_gateway_url("not a url").is_err());
    }

    #[test]
    fn expires_in_accepts_both_shapes() {
        let s: TokenResponse =
            serde_json::from_str(r#"{"access_token":"t","expires_in":"7200"}"#).unwrap();
        assert_eq!(s.expires_in, 7200);

        let n: TokenResponse =
            serde_json::from_str(r#"{"access_token":"t","expires_in":7200}"#).unwrap();
        assert_eq!(n.expires_in, 7200);
    }
}
