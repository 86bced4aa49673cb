use std::time::Duration;

use anyhow::{bail, Context};
use heater_common::{MqttConfig, MqttReadingPayload, Reading};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tracing::{info, warn};

use crate::host::AppState;

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const KEEP_ALIVE: Duration = Duration::from_secs(30);

pub fn connect(config: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut mqtt_options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    mqtt_options.set_keep_alive(KEEP_ALIVE);
    if let Some(user) = &config.username {
        mqtt_options.set_credentials(user.clone(), config.password.clone());
    }

    AsyncClient::new(mqtt_options, 32)
}

pub fn spawn_mqtt_loop(
    app_state: AppState,
    mqtt: AsyncClient,
    mut eventloop: EventLoop,
    config: MqttConfig,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    // Clean sessions drop subscriptions, so subscribe on every connect.
                    match mqtt.try_subscribe(config.topic.clone(), QoS::AtMostOnce) {
                        Ok(()) => info!(
                            "Successfully connected to MQTT host: {}:{} and subscribed to topic {}",
                            config.host, config.port, config.topic
                        ),
                        Err(err) => warn!("failed to subscribe to {}: {err}", config.topic),
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    match parse_reading(&message.payload) {
                        Ok(reading) => {
                            app_state.apply_reading(reading).await;
                        }
                        Err(err) => {
                            warn!("dropping MQTT message on {}: {err:#}", message.topic)
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    info!("MQTT service was disconnected.");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("MQTT connection error: {err}; reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    });
}

/// Parses `{ "time": ..., "temperature_F": ... }`. Anything else is rejected
/// rather than allowed to take the process down.
pub fn parse_reading(payload: &[u8]) -> anyhow::Result<Reading> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        bail!("oversized payload ({} bytes)", payload.len());
    }

    let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;
    info!("Received message from MQTT: {message}");

    let parsed: MqttReadingPayload =
        serde_json::from_str(message).context("payload is not a temperature reading")?;
    parsed
        .into_reading()
        .context("temperature_F is not a finite number")
}
