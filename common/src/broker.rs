use std::time::Duration;

use log::{debug, info, warn};

use crate::events::{BrokerEvent, Deadline, EventSource, WaitError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Established,
    Error,
    Timeout,
}

/// Blocks until the broker acknowledges the session or reports an error.
/// Events other than those two are logged and skipped.
pub fn await_session<S>(events: &mut S, timeout: Duration) -> SessionOutcome
where
    S: EventSource<BrokerEvent>,
{
    let deadline = Deadline::after(timeout);

    loop {
        let Some(remaining) = deadline.remaining() else {
            warn!("broker session timed out after {}ms", timeout.as_millis());
            return SessionOutcome::Timeout;
        };

        match events.next_event(remaining) {
            Ok(BrokerEvent::Connected) => {
                info!("broker session established");
                return SessionOutcome::Established;
            }
            Ok(BrokerEvent::Error(detail)) => {
                warn!("broker session error: {detail}");
                return SessionOutcome::Error;
            }
            Ok(BrokerEvent::Other(kind)) => debug!("ignoring broker event {kind}"),
            Err(WaitError::TimedOut) => {
                warn!("broker session timed out after {}ms", timeout.as_millis());
                return SessionOutcome::Timeout;
            }
            Err(WaitError::Closed) => {
                warn!("broker event source closed before session resolved");
                return SessionOutcome::Error;
            }
        }
    }
}

/// Waits on a freshly started client. The handle is handed back only when
/// the session is established; otherwise it is dropped here, which tears the
/// client down.
pub fn open_session<H, S>(
    client: H,
    events: &mut S,
    timeout: Duration,
) -> (SessionOutcome, Option<H>)
where
    S: EventSource<BrokerEvent>,
{
    match await_session(events, timeout) {
        SessionOutcome::Established => (SessionOutcome::Established, Some(client)),
        outcome => (outcome, None),
    }
}
