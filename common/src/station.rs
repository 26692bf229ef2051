use std::{fmt, net::Ipv4Addr, time::Duration};

use log::{info, warn};

use crate::{
    config::NetworkConfig,
    events::{Deadline, EventSource, StationEvent, WaitError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    RetriesExhausted { attempts: u32 },
    TimedOut,
    EventsClosed,
    InvalidConfig,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetriesExhausted { attempts } => {
                write!(f, "gave up after {attempts} association attempt(s)")
            }
            Self::TimedOut => f.write_str("timed out waiting for an address"),
            Self::EventsClosed => f.write_str("station event source closed"),
            Self::InvalidConfig => f.write_str("station configuration rejected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Connected(Option<Ipv4Addr>),
    Failed(ConnectFailure),
}

impl ConnectionOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

/// Counts re-association attempts; never grows past its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCounter {
    count: u32,
    ceiling: u32,
}

impl RetryCounter {
    pub fn new(ceiling: u32) -> Self {
        Self { count: 0, ceiling }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Returns `false` once the ceiling has been reached.
    pub fn try_increment(&mut self) -> bool {
        if self.count < self.ceiling {
            self.count += 1;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Associate,
    Resolved(ConnectionOutcome),
}

#[derive(Debug, Clone)]
pub struct StationHandshake {
    retries: RetryCounter,
    attempts: u32,
    resolved: Option<ConnectionOutcome>,
}

impl StationHandshake {
    pub fn new(max_retries: u32) -> Self {
        Self {
            retries: RetryCounter::new(max_retries),
            attempts: 0,
            resolved: None,
        }
    }

    pub fn retries(&self) -> RetryCounter {
        self.retries
    }

    pub fn outcome(&self) -> Option<ConnectionOutcome> {
        self.resolved
    }

    /// Association requests the link accepted so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn on_event(&mut self, event: StationEvent) -> HandshakeStep {
        if let Some(outcome) = self.resolved {
            return HandshakeStep::Resolved(outcome);
        }

        match event {
            StationEvent::Started => HandshakeStep::Associate,
            StationEvent::Disconnected => {
                if self.retries.try_increment() {
                    info!(
                        "retry to connect to the AP ({}/{})",
                        self.retries.count(),
                        self.retries.ceiling()
                    );
                    HandshakeStep::Associate
                } else {
                    let attempts = self.attempts;
                    HandshakeStep::Resolved(self.resolve(ConnectionOutcome::Failed(
                        ConnectFailure::RetriesExhausted { attempts },
                    )))
                }
            }
            StationEvent::AddressAcquired(ip) => {
                self.retries.reset();
                HandshakeStep::Resolved(self.resolve(ConnectionOutcome::Connected(ip)))
            }
        }
    }

    pub fn on_wait_error(&mut self, err: WaitError) -> ConnectionOutcome {
        let failure = match err {
            WaitError::TimedOut => ConnectFailure::TimedOut,
            WaitError::Closed => ConnectFailure::EventsClosed,
        };
        self.resolve(ConnectionOutcome::Failed(failure))
    }

    fn resolve(&mut self, outcome: ConnectionOutcome) -> ConnectionOutcome {
        *self.resolved.get_or_insert(outcome)
    }
}

/// Rejects credentials the station driver cannot hold. The caller resolves
/// the phase as failed instead of configuring the radio.
pub fn check_station_config(network: &NetworkConfig) -> Result<(), ConnectFailure> {
    network.validate().map_err(|err| {
        warn!("station configuration rejected: {err}");
        ConnectFailure::InvalidConfig
    })
}

/// Association control of an already-configured station interface.
pub trait StationLink {
    type Error: fmt::Display;

    fn associate(&mut self) -> Result<(), Self::Error>;
}

/// Drives the handshake until the station has an address, the retry budget
/// is spent, or `timeout` elapses. The station must already be configured
/// with its SSID and key and be starting up; `events` carries its
/// notifications for this phase only.
pub fn connect_station<L, S>(
    link: &mut L,
    events: &mut S,
    max_retries: u32,
    timeout: Duration,
) -> ConnectionOutcome
where
    L: StationLink,
    S: EventSource<StationEvent>,
{
    let mut handshake = StationHandshake::new(max_retries);
    let deadline = Deadline::after(timeout);

    loop {
        let Some(remaining) = deadline.remaining() else {
            return handshake.on_wait_error(WaitError::TimedOut);
        };

        let event = match events.next_event(remaining) {
            Ok(event) => event,
            Err(err) => return handshake.on_wait_error(err),
        };

        match handshake.on_event(event) {
            HandshakeStep::Associate => match link.associate() {
                Ok(()) => handshake.record_attempt(),
                Err(err) => warn!("association request failed: {err}"),
            },
            HandshakeStep::Resolved(outcome) => {
                match outcome {
                    ConnectionOutcome::Connected(Some(ip)) => info!("got ip: {ip}"),
                    ConnectionOutcome::Connected(None) => info!("station connected"),
                    ConnectionOutcome::Failed(failure) => {
                        warn!("connect to the AP failed: {failure}")
                    }
                }
                return outcome;
            }
        }
    }
}
