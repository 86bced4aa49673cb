use std::{sync::Arc, time::Duration};

use anyhow::Context;
use heater_common::{BridgeConfig, Decision, Reading, ThermostatEngine};
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    actuator::{spawn_actuator, ActuatorHandle},
    ambient::{spawn_poll_loop, AmbientClient},
    metrics::{self, BridgeMetrics},
    mqtt::{self, spawn_mqtt_loop},
    realtime::{spawn_realtime_loop, RealtimeClient},
    wemo,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    engine: Arc<Mutex<ThermostatEngine>>,
    actuator: ActuatorHandle,
    metrics: Option<BridgeMetrics>,
}

impl AppState {
    pub fn new(
        engine: ThermostatEngine,
        actuator: ActuatorHandle,
        metrics: Option<BridgeMetrics>,
    ) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            actuator,
            metrics,
        }
    }

    /// Decides and queues a command for every reading, whatever its source.
    /// The engine lock is held while queueing so commands keep decision order.
    pub async fn apply_reading(&self, reading: Reading) -> Decision {
        let engine = self.engine.lock().await;
        let decision = engine.evaluate(reading);

        info!(source = decision.reading.source.as_str(), "{}", decision.describe());
        if let Some(metrics) = &self.metrics {
            metrics.record(&decision);
        }
        self.actuator.send(decision.command);

        decision
    }
}

pub async fn run() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = dotenv {
        if !err.not_found() {
            warn!("failed to load .env file: {err}");
        }
    }

    let config = BridgeConfig::from_env().context("invalid configuration")?;
    info!(
        "heater bridge starting: serial {}, desired temperature {}°F",
        config.heater_serial, config.desired_temp_f
    );

    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("failed to build http client")?;

    let bridge_metrics = config
        .metrics
        .as_ref()
        .map(|_| BridgeMetrics::new(config.desired_temp_f));

    let (actuator, commands) = ActuatorHandle::channel();
    let discovery = {
        let http = http.clone();
        let serial = config.heater_serial.clone();
        let timeout = config.discovery_timeout;
        async move {
            wemo::discover(&http, &serial, timeout)
                .await
                .map_err(anyhow::Error::from)
        }
    };
    spawn_actuator(discovery, commands);

    let app_state = AppState::new(
        ThermostatEngine::new(config.desired_temp_f),
        actuator,
        bridge_metrics.clone(),
    );

    if let Some(ambient) = &config.ambient {
        spawn_poll_loop(
            app_state.clone(),
            AmbientClient::new(http.clone(), ambient),
            ambient.mac_address.clone(),
            ambient.poll_interval,
        );
        if ambient.realtime_enabled {
            spawn_realtime_loop(app_state.clone(), RealtimeClient::new(http.clone(), ambient));
        }
    }

    if let Some(mqtt_config) = &config.mqtt {
        let (client, eventloop) = mqtt::connect(mqtt_config);
        spawn_mqtt_loop(app_state.clone(), client, eventloop, mqtt_config.clone());
    }

    if config.ambient.is_none() && config.mqtt.is_none() {
        warn!("no temperature source configured; the heater will never be switched");
    }

    match (&config.metrics, bridge_metrics) {
        (Some(metrics_config), Some(bridge_metrics)) => {
            tokio::select! {
                result = metrics::serve(metrics_config.port, bridge_metrics) => result?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
        }
        _ => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            info!("shutting down");
        }
    }

    Ok(())
}
