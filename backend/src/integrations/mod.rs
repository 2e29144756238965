use crate::error::{DeviceError, ForecastError, RefreshError};
use crate::models::TokenGrant;
use async_trait::async_trait;

pub mod http;

pub use http::{HttpDeviceApi, HttpTokenRefresher};

/// Remote battery site API.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Sets the site's backup reserve. Setting the same value twice is harmless.
    async fn set_reserve_percent(
        &self,
        site_id: &str,
        percent: i32,
        access_token: &str,
    ) -> Result<(), DeviceError>;

    /// Reads the reserve currently configured on the site.
    async fn get_reserve_percent(&self, site_id: &str, access_token: &str)
    -> Result<i32, DeviceError>;
}

/// Exchanges a single-use refresh token for a new token pair.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError>;
}

/// Best-effort "force a higher reserve" signal for a site.
#[async_trait]
pub trait WeatherOverrideEvaluator: Send + Sync {
    async fn is_bad_weather(&self, site_id: &str) -> Result<bool, ForecastError>;
}

/// Evaluator for deployments without a forecast provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWeatherOverride;

#[async_trait]
impl WeatherOverrideEvaluator for NoWeatherOverride {
    async fn is_bad_weather(&self, _site_id: &str) -> Result<bool, ForecastError> {
        Ok(false)
    }
}
