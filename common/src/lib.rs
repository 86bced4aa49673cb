pub mod config;
pub mod engineio;
pub mod thermostat;
pub mod types;

pub use config::{AmbientConfig, BridgeConfig, ConfigError, MetricsConfig, MqttConfig};
pub use thermostat::{decide, Decision, ThermostatEngine};
pub use types::{
    DeviceRecord, MqttReadingPayload, Reading, ReadingSource, SubscriptionPayload, SwitchState,
};
