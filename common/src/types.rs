use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    Off,
    On,
}

impl SwitchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::On => "on",
        }
    }

    /// Value written to the device and to the switch-state gauge.
    pub fn binary_value(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::On => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingSource {
    Poll,
    Realtime,
    Mqtt,
}

impl ReadingSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Realtime => "realtime",
            Self::Mqtt => "mqtt",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Observation time as reported by the source; only ever logged.
    pub timestamp: String,
    pub temperature_f: f64,
    pub source: ReadingSource,
}

/// Payload published on the MQTT reading topic (rtl_433 style).
#[derive(Debug, Clone, Deserialize)]
pub struct MqttReadingPayload {
    pub time: serde_json::Value,
    #[serde(rename = "temperature_F")]
    pub temperature_f: f64,
}

impl MqttReadingPayload {
    pub fn into_reading(self) -> Option<Reading> {
        if !self.temperature_f.is_finite() {
            return None;
        }

        let timestamp = match self.time {
            serde_json::Value::String(text) => text,
            other => other.to_string(),
        };

        Some(Reading {
            timestamp,
            temperature_f: self.temperature_f,
            source: ReadingSource::Mqtt,
        })
    }
}

/// One station record from the weather REST API or the realtime `data` event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceRecord {
    #[serde(rename = "macAddress", default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub dateutc: Option<i64>,
    #[serde(default)]
    pub tempinf: Option<f64>,
}

impl DeviceRecord {
    pub fn indoor_reading(&self, source: ReadingSource) -> Option<Reading> {
        let temperature_f = self.tempinf.filter(|value| value.is_finite())?;
        let timestamp = self
            .date
            .clone()
            .or_else(|| {
                self.dateutc
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .map(|date| date.to_rfc3339())
            })
            .unwrap_or_else(|| "unknown".to_string());

        Some(Reading {
            timestamp,
            temperature_f,
            source,
        })
    }

    pub fn is_from(&self, mac_address: &str) -> bool {
        self.mac_address
            .as_deref()
            .map_or(true, |mac| mac.eq_ignore_ascii_case(mac_address))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StationInfo {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscribedDevice {
    #[serde(rename = "macAddress", default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub info: StationInfo,
}

impl SubscribedDevice {
    pub fn display_name(&self) -> &str {
        self.info
            .name
            .as_deref()
            .or(self.mac_address.as_deref())
            .unwrap_or("unnamed")
    }
}

/// Payload of the realtime `subscribed` / `unsubscribed` events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionPayload {
    #[serde(default)]
    pub devices: Vec<SubscribedDevice>,
}
