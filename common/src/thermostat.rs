use crate::types::{Reading, SwitchState};

/// At or above the set-point the heater goes off, below it goes on.
pub fn decide(temperature_f: f64, setpoint_f: f64) -> SwitchState {
    if temperature_f >= setpoint_f {
        SwitchState::Off
    } else {
        SwitchState::On
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub reading: Reading,
    pub setpoint_f: f64,
    pub command: SwitchState,
}

impl Decision {
    pub fn describe(&self) -> String {
        let relation = match self.command {
            SwitchState::Off => "is at or above",
            SwitchState::On => "is below",
        };
        format!(
            "The temperature ({}°F) {relation} the desired temperature ({}°F). Weather station timestamp: [{}].",
            self.reading.temperature_f, self.setpoint_f, self.reading.timestamp
        )
    }
}

/// Every reading yields a command, even when it repeats the previous one.
#[derive(Debug, Clone)]
pub struct ThermostatEngine {
    setpoint_f: f64,
}

impl ThermostatEngine {
    pub fn new(setpoint_f: f64) -> Self {
        Self { setpoint_f }
    }

    pub fn evaluate(&self, reading: Reading) -> Decision {
        let command = decide(reading.temperature_f, self.setpoint_f);

        Decision {
            reading,
            setpoint_f: self.setpoint_f,
            command,
        }
    }
}
