use std::{
    net::Ipv4Addr,
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::{Duration, Instant},
};

use thiserror::Error;

/// Station lifecycle notifications forwarded from the platform event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationEvent {
    Started,
    Disconnected,
    AddressAcquired(Option<Ipv4Addr>),
}

/// Broker client notifications forwarded from the MQTT client callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    Error(String),
    Other(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out waiting for event")]
    TimedOut,
    #[error("event source closed")]
    Closed,
}

/// Blocking source of platform events for a single phase.
pub trait EventSource<E> {
    fn next_event(&mut self, timeout: Duration) -> Result<E, WaitError>;
}

impl<E> EventSource<E> for Receiver<E> {
    fn next_event(&mut self, timeout: Duration) -> Result<E, WaitError> {
        self.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => WaitError::TimedOut,
            RecvTimeoutError::Disconnected => WaitError::Closed,
        })
    }
}

/// Overall budget for one wait phase. A timeout too large to represent as an
/// instant never expires.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// Time left, or `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        match self.0 {
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now());
                (!left.is_zero()).then_some(left)
            }
            None => Some(Duration::MAX),
        }
    }
}
