pub const DEFAULT_TOPIC_NAMESPACE: &str = "losant";

pub const METRIC_BATTERY_VOLTAGE: &str = "battery_voltage";

pub fn state_topic(namespace: &str, device_id: &str) -> String {
    format!("{namespace}/{device_id}/state")
}
