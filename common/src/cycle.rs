use std::{fmt, time::Duration};

use log::{info, warn};

use crate::{
    broker::SessionOutcome,
    config::{BrokerConfig, MonitorConfig, NetworkConfig},
    sampler::SampleError,
    station::ConnectionOutcome,
    telemetry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Booting,
    AwaitingNetwork,
    AwaitingSession,
    Sampling,
    Publishing,
    SchedulingSleep,
    Sleeping,
}

impl CyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Booting => "BOOTING",
            Self::AwaitingNetwork => "AWAITING_NETWORK",
            Self::AwaitingSession => "AWAITING_SESSION",
            Self::Sampling => "SAMPLING",
            Self::Publishing => "PUBLISHING",
            Self::SchedulingSleep => "SCHEDULING_SLEEP",
            Self::Sleeping => "SLEEPING",
        }
    }
}

/// Hardware and transport operations one wake cycle needs.
///
/// Errors returned from these methods are platform faults and abort the
/// cycle. Expected failures, including credentials the station rejects and a
/// broker client that cannot be started, are reported through the outcome
/// types so the device still sleeps.
pub trait CyclePlatform {
    type Session;
    type Error: fmt::Display;

    fn connect_station(&mut self, network: &NetworkConfig)
        -> Result<ConnectionOutcome, Self::Error>;

    fn open_session(
        &mut self,
        broker: &BrokerConfig,
    ) -> Result<(SessionOutcome, Option<Self::Session>), Self::Error>;

    fn sample_battery_voltage(&mut self) -> Result<u32, SampleError>;

    /// QoS 0, not retained.
    fn publish(
        &mut self,
        session: &mut Self::Session,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), Self::Error>;

    fn close_session(&mut self, session: Self::Session);

    fn arm_wake_timer(&mut self, after: Duration) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub phases: Vec<CyclePhase>,
    pub connection: Option<ConnectionOutcome>,
    pub session: Option<SessionOutcome>,
    pub millivolts: Option<u32>,
    pub published: bool,
    pub wake_after: Duration,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            phases: vec![CyclePhase::Booting],
            connection: None,
            session: None,
            millivolts: None,
            published: false,
            wake_after: Duration::ZERO,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phases.last().copied().unwrap_or(CyclePhase::Booting)
    }

    fn enter(&mut self, next: CyclePhase) {
        info!("cycle {} -> {}", self.phase().as_str(), next.as_str());
        self.phases.push(next);
    }
}

/// Runs one measure-and-publish cycle and arms the wake timer. On return the
/// report is in `Sleeping` and the caller must power down.
pub fn run_cycle<P: CyclePlatform>(
    platform: &mut P,
    config: &MonitorConfig,
) -> Result<CycleReport, P::Error> {
    let mut report = CycleReport::new();

    report.enter(CyclePhase::AwaitingNetwork);
    let connection = platform.connect_station(&config.network)?;
    report.connection = Some(connection);

    if connection.is_connected() {
        report.enter(CyclePhase::AwaitingSession);
        let (outcome, session) = platform.open_session(&config.broker)?;
        report.session = Some(outcome);

        match session {
            Some(mut session) => {
                sample_and_publish(platform, &mut session, config, &mut report);
                platform.close_session(session);
            }
            None => warn!("no broker session ({outcome:?}); skipping telemetry"),
        }
    } else {
        warn!("network unavailable; skipping telemetry this cycle");
    }

    report.enter(CyclePhase::SchedulingSleep);
    let wake_after = config.timing.wake_interval();
    info!("enabling timer wakeup, {}s", wake_after.as_secs());
    platform.arm_wake_timer(wake_after)?;
    report.wake_after = wake_after;

    report.enter(CyclePhase::Sleeping);
    Ok(report)
}

fn sample_and_publish<P: CyclePlatform>(
    platform: &mut P,
    session: &mut P::Session,
    config: &MonitorConfig,
    report: &mut CycleReport,
) {
    report.enter(CyclePhase::Sampling);
    let millivolts = match platform.sample_battery_voltage() {
        Ok(millivolts) => millivolts,
        Err(err) => {
            warn!("battery sample failed: {err}");
            return;
        }
    };
    report.millivolts = Some(millivolts);

    report.enter(CyclePhase::Publishing);
    let topic = config.broker.state_topic();
    let payload = telemetry::encode(millivolts);
    match platform.publish(session, &topic, &payload) {
        Ok(()) => {
            info!("published {millivolts}mV to {topic}");
            report.published = true;
        }
        // Not retried; the next wake publishes a fresh reading.
        Err(err) => warn!("failed to publish battery voltage: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, net::Ipv4Addr};

    use super::*;
    use crate::{
        broker,
        events::{BrokerEvent, StationEvent},
        sampler::{AdcReader, VoltageSampler},
        station::{self, ConnectFailure, StationLink},
    };
    use pretty_assertions::assert_eq;

    struct ScriptedEvents<E>(VecDeque<E>);

    impl<E> crate::events::EventSource<E> for ScriptedEvents<E> {
        fn next_event(&mut self, _timeout: Duration) -> Result<E, crate::events::WaitError> {
            self.0
                .pop_front()
                .ok_or(crate::events::WaitError::TimedOut)
        }
    }

    struct NoopLink;

    impl StationLink for NoopLink {
        type Error = String;

        fn associate(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    struct RawAdc(u16);

    impl AdcReader for RawAdc {
        type Error = String;

        fn read_raw(&mut self) -> Result<u16, Self::Error> {
            Ok(self.0)
        }
    }

    #[derive(Debug, PartialEq)]
    struct Published {
        topic: String,
        payload: Vec<u8>,
    }

    /// Runs the real handshake and session logic over scripted events.
    struct FakePlatform {
        station_events: Vec<StationEvent>,
        broker_events: Vec<BrokerEvent>,
        raw_sample: u16,
        fail_publish: bool,
        session_attempts: u32,
        samples: u32,
        published: Vec<Published>,
        closed_sessions: u32,
        armed: Option<Duration>,
    }

    impl FakePlatform {
        fn new(station_events: Vec<StationEvent>, broker_events: Vec<BrokerEvent>) -> Self {
            Self {
                station_events,
                broker_events,
                raw_sample: 2048,
                fail_publish: false,
                session_attempts: 0,
                samples: 0,
                published: Vec::new(),
                closed_sessions: 0,
                armed: None,
            }
        }
    }

    impl CyclePlatform for FakePlatform {
        type Session = &'static str;
        type Error = String;

        fn connect_station(
            &mut self,
            network: &NetworkConfig,
        ) -> Result<ConnectionOutcome, Self::Error> {
            if let Err(failure) = station::check_station_config(network) {
                return Ok(ConnectionOutcome::Failed(failure));
            }
            let mut events = ScriptedEvents(self.station_events.drain(..).collect());
            Ok(station::connect_station(
                &mut NoopLink,
                &mut events,
                network.max_retries,
                network.connect_timeout(),
            ))
        }

        fn open_session(
            &mut self,
            broker: &BrokerConfig,
        ) -> Result<(SessionOutcome, Option<Self::Session>), Self::Error> {
            self.session_attempts += 1;
            let mut events = ScriptedEvents(self.broker_events.drain(..).collect());
            Ok(broker::open_session(
                "session",
                &mut events,
                broker.session_timeout(),
            ))
        }

        fn sample_battery_voltage(&mut self) -> Result<u32, SampleError> {
            self.samples += 1;
            let calibration = |raw: u16| -> u32 {
                if raw == 2048 {
                    1650
                } else {
                    u32::from(raw) / 2
                }
            };
            VoltageSampler::new(RawAdc(self.raw_sample), calibration, 2).sample_battery_voltage()
        }

        fn publish(
            &mut self,
            _session: &mut Self::Session,
            topic: &str,
            payload: &[u8],
        ) -> Result<(), Self::Error> {
            self.published.push(Published {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
            if self.fail_publish {
                Err("outbox full".to_string())
            } else {
                Ok(())
            }
        }

        fn close_session(&mut self, _session: Self::Session) {
            self.closed_sessions += 1;
        }

        fn arm_wake_timer(&mut self, after: Duration) -> Result<(), Self::Error> {
            self.armed = Some(after);
            Ok(())
        }
    }

    fn config() -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.broker.device_id = "dev1".to_string();
        config
    }

    fn connected() -> Vec<StationEvent> {
        vec![
            StationEvent::Started,
            StationEvent::Disconnected,
            StationEvent::AddressAcquired(Some(Ipv4Addr::new(10, 0, 0, 7))),
        ]
    }

    #[test]
    fn publishes_doubled_calibrated_reading() {
        let mut platform = FakePlatform::new(connected(), vec![BrokerEvent::Connected]);
        let report = run_cycle(&mut platform, &config()).unwrap();

        assert_eq!(platform.samples, 1);
        assert_eq!(
            platform.published,
            vec![Published {
                topic: "losant/dev1/state".to_string(),
                payload: br#"{"data":{"battery_voltage":3300}}"#.to_vec(),
            }]
        );
        assert_eq!(platform.closed_sessions, 1);
        assert_eq!(report.millivolts, Some(3300));
        assert!(report.published);
        assert_eq!(
            report.phases,
            vec![
                CyclePhase::Booting,
                CyclePhase::AwaitingNetwork,
                CyclePhase::AwaitingSession,
                CyclePhase::Sampling,
                CyclePhase::Publishing,
                CyclePhase::SchedulingSleep,
                CyclePhase::Sleeping,
            ]
        );
    }

    #[test]
    fn exhausted_retries_skip_straight_to_sleep() {
        let mut station_events = vec![StationEvent::Started];
        station_events.extend(std::iter::repeat(StationEvent::Disconnected).take(6));
        let mut platform = FakePlatform::new(station_events, vec![BrokerEvent::Connected]);

        let report = run_cycle(&mut platform, &config()).unwrap();

        assert_eq!(
            report.connection,
            Some(ConnectionOutcome::Failed(ConnectFailure::RetriesExhausted {
                attempts: 6
            }))
        );
        assert_eq!(platform.session_attempts, 0);
        assert_eq!(platform.samples, 0);
        assert!(platform.published.is_empty());
        assert_eq!(platform.armed, Some(Duration::from_secs(10)));
        assert_eq!(
            report.phases,
            vec![
                CyclePhase::Booting,
                CyclePhase::AwaitingNetwork,
                CyclePhase::SchedulingSleep,
                CyclePhase::Sleeping,
            ]
        );
    }

    #[test]
    fn ceiling_disconnects_without_address_skip_session() {
        let mut cfg = config();
        cfg.network.max_retries = 3;
        let station_events = vec![StationEvent::Disconnected; 3];
        let mut platform = FakePlatform::new(station_events, vec![BrokerEvent::Connected]);

        let report = run_cycle(&mut platform, &cfg).unwrap();

        assert!(!report.connection.unwrap().is_connected());
        assert_eq!(platform.session_attempts, 0);
        assert_eq!(report.phase(), CyclePhase::Sleeping);
    }

    #[test]
    fn broker_error_skips_sampling() {
        let mut platform = FakePlatform::new(
            connected(),
            vec![BrokerEvent::Error("connection refused".to_string())],
        );

        let report = run_cycle(&mut platform, &config()).unwrap();

        assert_eq!(report.session, Some(SessionOutcome::Error));
        assert_eq!(platform.samples, 0);
        assert!(platform.published.is_empty());
        assert_eq!(platform.closed_sessions, 0);
        assert_eq!(platform.armed, Some(Duration::from_secs(10)));
        assert!(!report.phases.contains(&CyclePhase::Sampling));
    }

    #[test]
    fn broker_silence_is_a_timeout() {
        let mut cfg = config();
        cfg.broker.session_timeout_ms = 1_000;
        let mut platform = FakePlatform::new(connected(), Vec::new());

        let report = run_cycle(&mut platform, &cfg).unwrap();

        assert_eq!(report.session, Some(SessionOutcome::Timeout));
        assert_eq!(platform.samples, 0);
    }

    #[test]
    fn publish_failure_still_sleeps() {
        let mut platform = FakePlatform::new(connected(), vec![BrokerEvent::Connected]);
        platform.fail_publish = true;

        let report = run_cycle(&mut platform, &config()).unwrap();

        assert_eq!(platform.published.len(), 1);
        assert!(!report.published);
        assert_eq!(platform.closed_sessions, 1);
        assert_eq!(report.phase(), CyclePhase::Sleeping);
    }

    #[test]
    fn sample_failure_skips_publish_but_closes_and_sleeps() {
        let mut platform = FakePlatform::new(connected(), vec![BrokerEvent::Connected]);
        platform.raw_sample = 5_000;

        let report = run_cycle(&mut platform, &config()).unwrap();

        assert_eq!(platform.samples, 1);
        assert!(platform.published.is_empty());
        assert_eq!(platform.closed_sessions, 1);
        assert_eq!(platform.armed, Some(Duration::from_secs(10)));
        assert_eq!(report.millivolts, None);
        assert!(!report.published);
        assert!(!report.phases.contains(&CyclePhase::Publishing));
        assert_eq!(report.phase(), CyclePhase::Sleeping);
    }

    #[test]
    fn rejected_station_config_still_sleeps() {
        let mut cfg = config();
        cfg.network.wifi_ssid = "s".repeat(33);
        let mut platform = FakePlatform::new(connected(), vec![BrokerEvent::Connected]);

        let report = run_cycle(&mut platform, &cfg).unwrap();

        assert_eq!(
            report.connection,
            Some(ConnectionOutcome::Failed(ConnectFailure::InvalidConfig))
        );
        assert_eq!(platform.session_attempts, 0);
        assert_eq!(platform.armed, Some(Duration::from_secs(10)));
        assert_eq!(report.phase(), CyclePhase::Sleeping);
    }

    #[test]
    fn identical_cycles_publish_identical_payloads() {
        let mut first = FakePlatform::new(connected(), vec![BrokerEvent::Connected]);
        let mut second = FakePlatform::new(connected(), vec![BrokerEvent::Connected]);
        first.raw_sample = 3_000;
        second.raw_sample = 3_000;

        run_cycle(&mut first, &config()).unwrap();
        run_cycle(&mut second, &config()).unwrap();

        assert_eq!(first.published, second.published);
        assert_eq!(
            first.published[0].payload,
            br#"{"data":{"battery_voltage":3000}}"#.to_vec()
        );
    }

    #[test]
    fn custom_wake_interval_is_armed() {
        let mut cfg = config();
        cfg.timing.wake_interval_secs = 900;
        let mut platform = FakePlatform::new(connected(), vec![BrokerEvent::Connected]);

        let report = run_cycle(&mut platform, &cfg).unwrap();

        assert_eq!(platform.armed, Some(Duration::from_secs(900)));
        assert_eq!(report.wake_after, Duration::from_secs(900));
    }
}
