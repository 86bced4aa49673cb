use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_AMBIENT_API_URL: &str = "https://rt.ambientweather.net";
pub const DEFAULT_AMBIENT_REALTIME_URL: &str = "https://rt2.ambientweather.net";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTT_CLIENT_ID: &str = "heater-controller-rust";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmbientConfig {
    pub mac_address: String,
    pub api_key: String,
    pub application_key: String,
    pub api_url: String,
    pub realtime_url: String,
    pub realtime_enabled: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: String,
    pub topic: String,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub heater_serial: String,
    pub desired_temp_f: f64,
    pub discovery_timeout: Duration,
    pub ambient: Option<AmbientConfig>,
    pub mqtt: Option<MqttConfig>,
    pub metrics: Option<MetricsConfig>,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let heater_serial = env.required("HEATER_SERIAL")?;
        let desired_temp_f = env
            .parsed::<f64>("DESIRED_TEMP")?
            .ok_or(ConfigError::Missing("DESIRED_TEMP"))?;
        if !desired_temp_f.is_finite() {
            return Err(ConfigError::Invalid {
                key: "DESIRED_TEMP",
                value: desired_temp_f.to_string(),
            });
        }

        let discovery_timeout = Duration::from_secs(
            env.parsed::<u64>("DISCOVERY_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_DISCOVERY_TIMEOUT_SECS),
        );

        let ambient = match env.optional("AMBIENT_WEATHER_MAC_ADDRESS") {
            Some(mac_address) => Some(AmbientConfig {
                mac_address,
                api_key: env.required("AMBIENT_WEATHER_API_KEY")?,
                application_key: env.required("AMBIENT_WEATHER_APPLICATION_KEY")?,
                api_url: env
                    .optional("AMBIENT_WEATHER_API_URL")
                    .unwrap_or_else(|| DEFAULT_AMBIENT_API_URL.to_string()),
                realtime_url: env
                    .optional("AMBIENT_WEATHER_REALTIME_URL")
                    .unwrap_or_else(|| DEFAULT_AMBIENT_REALTIME_URL.to_string()),
                realtime_enabled: env.flag("AMBIENT_WEATHER_REALTIME")?.unwrap_or(true),
                poll_interval: Duration::from_secs(
                    env.parsed::<u64>("POLL_INTERVAL_SECS")?
                        .filter(|secs| *secs > 0)
                        .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
                ),
            }),
            None => None,
        };

        let mqtt = match env.optional("MQTT_HOST") {
            Some(raw_host) => {
                let default_port = env.parsed::<u16>("MQTT_PORT")?.unwrap_or(DEFAULT_MQTT_PORT);
                let (host, port) = parse_broker_address(&raw_host, default_port).ok_or(
                    ConfigError::Invalid {
                        key: "MQTT_HOST",
                        value: raw_host.clone(),
                    },
                )?;
                Some(MqttConfig {
                    host,
                    port,
                    username: env.optional("MQTT_USERNAME"),
                    password: env.optional("MQTT_PASSWORD").unwrap_or_default(),
                    topic: env.required("MQTT_TOPIC")?,
                    client_id: env
                        .optional("MQTT_CLIENT_ID")
                        .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                })
            }
            None => None,
        };

        let metrics = env
            .parsed::<u16>("METRICS_PORT")?
            .map(|port| MetricsConfig { port });

        Ok(Self {
            heater_serial,
            desired_temp_f,
            discovery_timeout,
            ambient,
            mqtt,
            metrics,
        })
    }
}

/// Accepts `host`, `host:port`, or `mqtt://[user@]host[:port][/path]`.
pub fn parse_broker_address(raw: &str, default_port: u16) -> Option<(String, u16)> {
    let trimmed = raw.trim();
    let without_scheme = match trimmed.split_once("://") {
        Some((scheme, rest)) if matches!(scheme, "mqtt" | "tcp") => rest,
        Some(_) => return None,
        None => trimmed,
    };
    let authority = without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme);
    let authority = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().ok()?),
        None => (authority, default_port),
    };

    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn parsed<T: std::str::FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        self.optional(key)
            .map(|value| {
                value
                    .parse::<T>()
                    .map_err(|_| ConfigError::Invalid { key, value })
            })
            .transpose()
    }

    fn flag(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        self.optional(key)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid { key, value }),
            })
            .transpose()
    }
}
