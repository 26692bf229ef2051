use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topics::{state_topic, DEFAULT_TOPIC_NAMESPACE};

/// Length limits imposed by the station driver's fixed-size config fields.
pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("wifi ssid is longer than {MAX_SSID_LEN} bytes")]
    SsidTooLong,
    #[error("wifi password is longer than {MAX_PASSWORD_LEN} bytes")]
    PasswordTooLong,
    #[error("broker host cannot be empty")]
    MissingBrokerHost,
    #[error("invalid config json: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub max_retries: u32,
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            max_retries: 5,
            connect_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub access_key: String,
    pub access_secret: String,
    pub device_id: String,
    pub topic_namespace: String,
    pub session_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "broker.losant.com".to_string(),
            port: 1883,
            access_key: String::new(),
            access_secret: String::new(),
            device_id: String::new(),
            topic_namespace: DEFAULT_TOPIC_NAMESPACE.to_string(),
            session_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SamplerConfig {
    pub default_vref_mv: u32,
    pub divider_ratio: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            default_vref_mv: 1_100,
            divider_ratio: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub wake_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            wake_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    pub network: NetworkConfig,
    pub broker: BrokerConfig,
    pub sampler: SamplerConfig,
    pub timing: TimingConfig,
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn has_password(&self) -> bool {
        !self.wifi_pass.is_empty()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wifi_ssid.len() > MAX_SSID_LEN {
            return Err(ConfigError::SsidTooLong);
        }
        if self.wifi_pass.len() > MAX_PASSWORD_LEN {
            return Err(ConfigError::PasswordTooLong);
        }
        Ok(())
    }
}

impl BrokerConfig {
    pub fn url(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }

    pub fn state_topic(&self) -> String {
        state_topic(&self.topic_namespace, &self.device_id)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Empty key means anonymous; credentials are never checked beyond that.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.access_key.is_empty() {
            None
        } else {
            Some((self.access_key.as_str(), self.access_secret.as_str()))
        }
    }
}

impl TimingConfig {
    pub fn wake_interval(&self) -> Duration {
        Duration::from_secs(self.wake_interval_secs)
    }
}

impl MonitorConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self =
            serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.sanitize();
        Ok(config)
    }

    pub fn sanitize(&mut self) {
        self.network.max_retries = self.network.max_retries.min(50);
        self.network.connect_timeout_ms = self.network.connect_timeout_ms.clamp(1_000, 600_000);

        if self.broker.port == 0 {
            self.broker.port = 1883;
        }
        if self.broker.topic_namespace.trim().is_empty() {
            self.broker.topic_namespace = DEFAULT_TOPIC_NAMESPACE.to_string();
        }
        self.broker.session_timeout_ms = self.broker.session_timeout_ms.clamp(1_000, 600_000);

        if self.sampler.divider_ratio == 0 {
            self.sampler.divider_ratio = 1;
        }
        self.sampler.default_vref_mv = self.sampler.default_vref_mv.clamp(1_000, 1_200);

        self.timing.wake_interval_secs = self.timing.wake_interval_secs.clamp(1, 24 * 3_600);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::MissingBrokerHost);
        }
        Ok(())
    }
}
