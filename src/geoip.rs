//! Geo-IP enrichment of user properties via ipdata.co.

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeoLocation {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country_code: Option<String>,
}

pub struct GeoIp {
    client: reqwest::Client,
    api_key: String,
}

impl GeoIp {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.to_string(),
        }
    }

    /// Looks up the caller's location. An empty `ip` asks the service to use
    /// the requesting address.
    pub async fn lookup(&self, ip: &str) -> Result<GeoLocation> {
        let url = format!("https://api.ipdata.co/{ip}?api-key={}", self.api_key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("geo-ip request failed")?;
        response
            .json::<GeoLocation>()
            .await
            .context("geo-ip response was not valid JSON")
    }
}
