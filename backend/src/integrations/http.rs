use super::{DeviceApi, TokenRefresher};
use crate::error::{DeviceError, RefreshError};
use crate::models::TokenGrant;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Deserialize, Debug)]
struct SiteInfoResponse {
    response: SiteInfo,
}

#[derive(Deserialize, Debug)]
struct SiteInfo {
    backup_reserve_percent: i32,
}

#[derive(Deserialize, Debug, Default)]
struct OAuthError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

fn classify_status(status: StatusCode, site_id: &str) -> DeviceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DeviceError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => DeviceError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => DeviceError::Timeout,
        s if s.is_server_error() => DeviceError::SiteUnavailable(site_id.to_string()),
        s => DeviceError::Transport(format!("unexpected status {}", s)),
    }
}

fn classify_transport(err: reqwest::Error, site_id: &str) -> DeviceError {
    if err.is_timeout() {
        DeviceError::Timeout
    } else if err.is_connect() {
        DeviceError::SiteUnavailable(site_id.to_string())
    } else {
        DeviceError::Transport(err.to_string())
    }
}

/// Energy-site endpoints of the vendor fleet API.
pub struct HttpDeviceApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDeviceApi {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn backup_url(&self, site_id: &str) -> String {
        format!("{}/api/1/energy_sites/{}/backup", self.base_url, site_id)
    }

    fn site_info_url(&self, site_id: &str) -> String {
        format!("{}/api/1/energy_sites/{}/site_info", self.base_url, site_id)
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceApi {
    async fn set_reserve_percent(
        &self,
        site_id: &str,
        percent: i32,
        access_token: &str,
    ) -> Result<(), DeviceError> {
        let resp = self
            .client
            .post(self.backup_url(site_id))
            .bearer_auth(access_token)
            .json(&json!({ "backup_reserve_percent": percent }))
            .send()
            .await
            .map_err(|e| classify_transport(e, site_id))?;

        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), site_id));
        }
        log::debug!("Site {} accepted backup reserve {}%", site_id, percent);
        Ok(())
    }

    async fn get_reserve_percent(
        &self,
        site_id: &str,
        access_token: &str,
    ) -> Result<i32, DeviceError> {
        let resp = self
            .client
            .get(self.site_info_url(site_id))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| classify_transport(e, site_id))?;

        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), site_id));
        }
        let info = resp
            .json::<SiteInfoResponse>()
            .await
            .map_err(|e| DeviceError::Transport(format!("malformed site info: {}", e)))?;
        Ok(info.response.backup_reserve_percent)
    }
}

/// OAuth refresh-token grant against the vendor's authorization server.
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
}

impl HttpTokenRefresher {
    pub fn new(token_url: String, client_id: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            token_url,
            client_id,
        })
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        let resp = self
            .client
            .post(&self.token_url)
            .json(&json!({
                "grant_type": "refresh_token",
                "client_id": self.client_id,
                "refresh_token": refresh_token,
            }))
            .send()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<TokenGrant>()
                .await
                .map_err(|e| RefreshError::Transport(format!("malformed token response: {}", e)));
        }

        // 4xx from the token endpoint means the grant itself was refused
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            let body = resp.json::<OAuthError>().await.unwrap_or_default();
            let reason = body.error_description.unwrap_or(body.error);
            return Err(RefreshError::Rejected(format!("{} ({})", reason, status)));
        }
        Err(RefreshError::Transport(format!("token endpoint returned {}", status)))
    }
}
