//! Device directory: the backend's authoritative device list
//!
//! One authenticated GET returning every device bound to the account
//! with its last-known command state and telemetry. The snapshot seeds
//! the per-device state machines before the socket delivers live
//! updates. No retry here; the connection manager owns that policy.

use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use crate::auth::Session;
use crate::config::Config;
use crate::device::Device;
use crate::protocol::DevicesResponse;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("backend rejected device listing (HTTP {0})")]
    Rejected(u16),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed device listing response")]
    Malformed,
}

/// Fetches the account's device list
pub struct Directory {
    client: Client,
    config: Config,
}

impl Directory {
    pub fn new(client: Client, config: Config) -> Self {
        Self { client, config }
    }

    pub async fn list_devices(&self, session: &Session) -> Result<Vec<Device>, DirectoryError> {
        let url = format!("{}/web/devices", self.config.api_base.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[("limit", self.config.device_limit.to_string())])
            .bearer_auth(&session.access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DirectoryError::Rejected(response.status().as_u16()));
        }

        let parsed: DevicesResponse = response.json().await?;
        let data = parsed.data.ok_or(DirectoryError::Malformed)?;

        let devices: Vec<Device> = data.list_devices.into_iter().map(Device::from_entry).collect();
        debug!(count = devices.len(), "device directory fetched");
        Ok(devices)
    }
}
