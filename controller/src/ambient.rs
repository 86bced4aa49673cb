use std::time::Duration;

use heater_common::{AmbientConfig, DeviceRecord, ReadingSource};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::host::AppState;

#[derive(Debug, Error)]
pub enum AmbientError {
    #[error("weather api request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// REST client for the weather-station cloud API.
#[derive(Clone)]
pub struct AmbientClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    application_key: String,
}

impl AmbientClient {
    pub fn new(http: reqwest::Client, config: &AmbientConfig) -> Self {
        Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            application_key: config.application_key.clone(),
        }
    }

    /// Most recent `limit` records of one station, newest first.
    pub async fn device_data(
        &self,
        mac_address: &str,
        limit: u32,
    ) -> Result<Vec<DeviceRecord>, AmbientError> {
        let url = format!("{}/v1/devices/{mac_address}", self.api_url);
        let limit = limit.to_string();
        let records = self
            .http
            .get(url)
            .query(&[
                ("apiKey", self.api_key.as_str()),
                ("applicationKey", self.application_key.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<DeviceRecord>>()
            .await?;
        Ok(records)
    }
}

pub fn spawn_poll_loop(
    app_state: AppState,
    client: AmbientClient,
    mac_address: String,
    every: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            poll_once(&app_state, &client, &mac_address).await;
        }
    });
}

/// Returns how many readings were applied.
pub async fn poll_once(app_state: &AppState, client: &AmbientClient, mac_address: &str) -> usize {
    info!("Fetching data...");

    let records = match client.device_data(mac_address, 1).await {
        Ok(records) => records,
        Err(err) => {
            warn!("Error: {err}");
            return 0;
        }
    };

    let mut applied = 0;
    for record in records {
        match record.indoor_reading(ReadingSource::Poll) {
            Some(reading) => {
                app_state.apply_reading(reading).await;
                applied += 1;
            }
            None => warn!("station record has no indoor temperature: {record:?}"),
        }
    }
    applied
}
