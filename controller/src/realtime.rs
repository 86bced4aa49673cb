use std::time::Duration;

use anyhow::{bail, Context};
use heater_common::{
    engineio::{decode_payload, encode_connect, encode_event, encode_pong, EnginePacket, SocketPacket},
    AmbientConfig, DeviceRecord, Reading, ReadingSource, SubscriptionPayload,
};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::host::AppState;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Slack on top of the server's ping interval + timeout before a long poll is
/// considered dead.
const POLL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Subscribed(Vec<String>),
    Unsubscribed(Vec<String>),
    Reading(Reading),
    Ignored,
}

/// Subscribes to the weather station's realtime stream over Engine.IO
/// long-polling.
#[derive(Clone)]
pub struct RealtimeClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    application_key: String,
    mac_address: String,
}

impl RealtimeClient {
    pub fn new(http: reqwest::Client, config: &AmbientConfig) -> Self {
        Self {
            http,
            endpoint: format!("{}/socket.io/", config.realtime_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            application_key: config.application_key.clone(),
            mac_address: config.mac_address.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, sid: Option<&str>) -> reqwest::RequestBuilder {
        let mut query = vec![
            ("EIO", "4"),
            ("transport", "polling"),
            ("api", "1"),
            ("applicationKey", self.application_key.as_str()),
        ];
        if let Some(sid) = sid {
            query.push(("sid", sid));
        }
        self.http.request(method, self.endpoint.as_str()).query(&query)
    }

    async fn send_packet(&self, sid: &str, packet: String) -> anyhow::Result<()> {
        self.request(reqwest::Method::POST, Some(sid))
            .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(packet)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Runs one session until the server closes it. Errors end the session;
    /// the caller reconnects.
    pub async fn run_session(&self, app_state: &AppState) -> anyhow::Result<()> {
        let body = self
            .request(reqwest::Method::GET, None)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let handshake = match decode_payload(&body)?.into_iter().next() {
            Some(EnginePacket::Open(handshake)) => handshake,
            other => bail!("expected engine.io open packet, got {other:?}"),
        };
        let poll_timeout = handshake.heartbeat_window().saturating_add(POLL_GRACE);
        let sid = handshake.sid;
        debug!("realtime handshake complete, sid {sid}");

        self.send_packet(&sid, encode_connect())
            .await
            .context("socket.io connect failed")?;

        loop {
            let body = self
                .request(reqwest::Method::GET, Some(&sid))
                .timeout(poll_timeout)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;

            for packet in decode_payload(&body)? {
                match packet {
                    EnginePacket::Ping(data) => self.send_packet(&sid, encode_pong(&data)).await?,
                    EnginePacket::Close | EnginePacket::Message(SocketPacket::Disconnect) => {
                        return Ok(())
                    }
                    EnginePacket::Message(SocketPacket::Connect(_)) => {
                        info!("Connected to Ambient Weather Realtime API!");
                        let subscribe = encode_event("subscribe", &json!({ "apiKeys": [self.api_key] }));
                        self.send_packet(&sid, subscribe).await?;
                    }
                    EnginePacket::Message(SocketPacket::ConnectError(data)) => {
                        bail!("realtime connection rejected: {data}")
                    }
                    EnginePacket::Message(SocketPacket::Event { name, args, .. }) => {
                        self.dispatch(app_state, interpret_event(&name, args, &self.mac_address))
                            .await;
                    }
                    _ => {}
                }
            }
        }
    }

    async fn dispatch(&self, app_state: &AppState, event: RealtimeEvent) {
        match event {
            RealtimeEvent::Subscribed(names) => {
                info!("Subscribed to {} device(s): {}", names.len(), names.join(", "));
                info!("Listening for temperature updates...");
            }
            RealtimeEvent::Unsubscribed(names) => {
                info!(
                    "Unsubscribed from {} device(s): {}",
                    names.len(),
                    names.join(", ")
                );
            }
            RealtimeEvent::Reading(reading) => {
                info!(
                    "Received data: {} - current indoor temperature is: {}°F",
                    reading.timestamp, reading.temperature_f
                );
                app_state.apply_reading(reading).await;
            }
            RealtimeEvent::Ignored => {}
        }
    }
}

pub fn interpret_event(name: &str, args: Vec<Value>, mac_address: &str) -> RealtimeEvent {
    let Some(data) = args.into_iter().next() else {
        return RealtimeEvent::Ignored;
    };

    match name {
        "subscribed" | "unsubscribed" => {
            let payload: SubscriptionPayload = serde_json::from_value(data).unwrap_or_default();
            let names = payload
                .devices
                .iter()
                .map(|device| device.display_name().to_string())
                .collect();
            if name == "subscribed" {
                RealtimeEvent::Subscribed(names)
            } else {
                RealtimeEvent::Unsubscribed(names)
            }
        }
        "data" => {
            let record: DeviceRecord = match serde_json::from_value(data) {
                Ok(record) => record,
                Err(err) => {
                    warn!("malformed realtime data event: {err}");
                    return RealtimeEvent::Ignored;
                }
            };
            if !record.is_from(mac_address) {
                debug!("ignoring realtime data for {:?}", record.mac_address);
                return RealtimeEvent::Ignored;
            }
            match record.indoor_reading(ReadingSource::Realtime) {
                Some(reading) => RealtimeEvent::Reading(reading),
                None => {
                    warn!("realtime data without indoor temperature");
                    RealtimeEvent::Ignored
                }
            }
        }
        _ => RealtimeEvent::Ignored,
    }
}

pub fn spawn_realtime_loop(app_state: AppState, client: RealtimeClient) {
    tokio::spawn(async move {
        loop {
            match client.run_session(&app_state).await {
                Ok(()) => info!("realtime session closed by server"),
                Err(err) => warn!("realtime session error: {err:#}"),
            }
            info!("reconnecting to the realtime API in {}s", RECONNECT_DELAY.as_secs());
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    });
}
