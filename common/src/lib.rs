pub mod broker;
pub mod config;
pub mod cycle;
pub mod events;
pub mod sampler;
pub mod station;
pub mod telemetry;
pub mod topics;

pub use broker::{await_session, open_session, SessionOutcome};
pub use config::{BrokerConfig, MonitorConfig, NetworkConfig, SamplerConfig, TimingConfig};
pub use cycle::{run_cycle, CyclePhase, CyclePlatform, CycleReport};
pub use events::{BrokerEvent, Deadline, EventSource, StationEvent, WaitError};
pub use sampler::{AdcReader, Calibration, CalibrationProfile, SampleError, VoltageSampler};
pub use station::{
    check_station_config, connect_station, ConnectFailure, ConnectionOutcome, StationLink,
};
pub use topics::*;
