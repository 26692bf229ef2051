use serde::Serialize;

use crate::topics::METRIC_BATTERY_VOLTAGE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryReading {
    pub metric: &'static str,
    pub millivolts: u32,
}

impl TelemetryReading {
    pub fn battery_voltage(millivolts: u32) -> Self {
        Self {
            metric: METRIC_BATTERY_VOLTAGE,
            millivolts,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatePayload {
    data: StateData,
}

#[derive(Debug, Serialize)]
struct StateData {
    battery_voltage: u32,
}

impl From<TelemetryReading> for StatePayload {
    fn from(reading: TelemetryReading) -> Self {
        Self {
            data: StateData {
                battery_voltage: reading.millivolts,
            },
        }
    }
}

/// Encodes `{"data":{"battery_voltage":<mV>}}`.
pub fn encode(millivolts: u32) -> Vec<u8> {
    encode_reading(TelemetryReading::battery_voltage(millivolts))
}

pub fn encode_reading(reading: TelemetryReading) -> Vec<u8> {
    // A struct of plain integers cannot fail to serialize.
    serde_json::to_vec(&StatePayload::from(reading)).unwrap_or_default()
}
