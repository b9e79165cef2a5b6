//! Record store connection configuration.

use std::time::Duration;

/// Connection parameters for the remote record store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base URL of the record store API
    pub base_url: String,
    /// Container identifier (multi-tenant namespace)
    pub container_id: String,
    /// Deployment environment ("development" or "production")
    pub environment: String,
    /// API token identifying this client to the store
    pub api_token: String,
    /// Custom zone name all tour records live in
    pub zone_name: String,
    /// Timeout for individual requests
    pub request_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.apple-cloudkit.com".to_string(),
            container_id: "iCloud.com.soundsolutionsllc.tourcal".to_string(),
            environment: "production".to_string(),
            api_token: String::new(),
            zone_name: "TourCalZone".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TOURCAL_STORE_URL") {
            config.base_url = val;
        }
        if let Ok(val) = std::env::var("TOURCAL_CONTAINER_ID") {
            config.container_id = val;
        }
        if let Ok(val) = std::env::var("TOURCAL_ENVIRONMENT") {
            config.environment = val;
        }
        if let Ok(val) = std::env::var("TOURCAL_API_TOKEN") {
            config.api_token = val;
        }
        if let Ok(val) = std::env::var("TOURCAL_ZONE") {
            config.zone_name = val;
        }
        if let Ok(val) = std::env::var("TOURCAL_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.request_timeout = Duration::from_secs(secs);
            }
        }

        config
    }
}
