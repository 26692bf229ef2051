use std::{
    net::Ipv4Addr,
    sync::mpsc::{self, Sender},
    time::Duration,
};

use anyhow::Context;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, Outgoing, QoS};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{info, warn};

use battery_monitor_common::{
    check_station_config,
    config::{BrokerConfig, NetworkConfig},
    connect_station, open_session, run_cycle, AdcReader, BrokerEvent, ConnectionOutcome,
    CyclePlatform, CycleReport, MonitorConfig, SampleError, SamplerConfig, SessionOutcome,
    StationEvent, StationLink, VoltageSampler,
};

const HOST_CLIENT_ID: &str = "battery-monitor-host";
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Stands in for the radio: fails the first `failures` associations, then
/// hands out a loopback address.
struct SimulatedStation {
    events: Sender<StationEvent>,
    failures: u32,
}

impl StationLink for SimulatedStation {
    type Error = mpsc::SendError<StationEvent>;

    fn associate(&mut self) -> Result<(), Self::Error> {
        if self.failures > 0 {
            self.failures -= 1;
            self.events.send(StationEvent::Disconnected)
        } else {
            self.events
                .send(StationEvent::AddressAcquired(Some(Ipv4Addr::LOCALHOST)))
        }
    }
}

struct SimulatedAdc {
    raw: u16,
}

impl AdcReader for SimulatedAdc {
    type Error = std::convert::Infallible;

    fn read_raw(&mut self) -> Result<u16, Self::Error> {
        Ok(self.raw)
    }
}

#[derive(Debug, Clone, Copy)]
struct Simulation {
    association_failures: u32,
    raw_sample: u16,
}

struct HostSession {
    client: AsyncClient,
    poller: Option<JoinHandle<()>>,
}

struct HostPlatform {
    runtime: Handle,
    simulation: Simulation,
    sample_config: SamplerConfig,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("battery monitor host simulation started");

    // Each iteration mirrors one wake from deep sleep: everything is rebuilt.
    loop {
        let config = load_config()?;
        let wake_after = config.timing.wake_interval();

        let report = run_host_cycle(config)
            .await
            .context("wake cycle aborted")?;
        info!(
            "cycle finished: connection={:?} session={:?} millivolts={:?} published={}",
            report.connection, report.session, report.millivolts, report.published
        );

        info!("sleeping {}s until next wake", wake_after.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(wake_after) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; exiting");
                return Ok(());
            }
        }
    }
}

async fn run_host_cycle(config: MonitorConfig) -> anyhow::Result<CycleReport> {
    let runtime = Handle::current();
    let simulation = simulation_from_env();

    tokio::task::spawn_blocking(move || {
        let mut platform = HostPlatform {
            runtime,
            simulation,
            sample_config: config.sampler,
        };
        run_cycle(&mut platform, &config)
    })
    .await
    .context("wake cycle task panicked")?
}

fn load_config() -> anyhow::Result<MonitorConfig> {
    let mut config = match std::env::var("BATMON_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {path}"))?;
            MonitorConfig::from_json(&raw).with_context(|| format!("invalid config in {path}"))?
        }
        Err(_) => MonitorConfig::default(),
    };

    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.broker.host = host;
    }
    if let Some(port) = env_parse::<u16>("MQTT_PORT") {
        config.broker.port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        config.broker.access_key = user;
        config.broker.access_secret = std::env::var("MQTT_PASS").unwrap_or_default();
    }
    if let Ok(device_id) = std::env::var("DEVICE_ID") {
        config.broker.device_id = device_id;
    }
    if let Some(secs) = env_parse::<u64>("WAKE_INTERVAL_SECS") {
        config.timing.wake_interval_secs = secs;
    }

    config.sanitize();
    config.validate()?;
    Ok(config)
}

fn simulation_from_env() -> Simulation {
    Simulation {
        association_failures: env_parse("BATMON_SIM_ASSOC_FAILURES").unwrap_or(0),
        raw_sample: env_parse("BATMON_SIM_RAW").unwrap_or(2048),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse::<T>().ok())
}

impl CyclePlatform for HostPlatform {
    type Session = HostSession;
    type Error = anyhow::Error;

    fn connect_station(&mut self, network: &NetworkConfig) -> anyhow::Result<ConnectionOutcome> {
        if let Err(failure) = check_station_config(network) {
            return Ok(ConnectionOutcome::Failed(failure));
        }

        let (tx, mut rx) = mpsc::channel();
        tx.send(StationEvent::Started)
            .context("station event channel closed")?;
        let mut station = SimulatedStation {
            events: tx,
            failures: self.simulation.association_failures,
        };

        Ok(connect_station(
            &mut station,
            &mut rx,
            network.max_retries,
            network.connect_timeout(),
        ))
    }

    fn open_session(
        &mut self,
        broker: &BrokerConfig,
    ) -> anyhow::Result<(SessionOutcome, Option<Self::Session>)> {
        let client_id = if broker.device_id.is_empty() {
            HOST_CLIENT_ID
        } else {
            broker.device_id.as_str()
        };

        let mut options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
        if let Some((user, pass)) = broker.credentials() {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, 10);
        let (tx, mut rx) = mpsc::channel();
        let poller = self.runtime.spawn(poll_broker(eventloop, tx));

        let session = HostSession {
            client,
            poller: Some(poller),
        };
        Ok(open_session(session, &mut rx, broker.session_timeout()))
    }

    fn sample_battery_voltage(&mut self) -> Result<u32, SampleError> {
        let adc = SimulatedAdc {
            raw: self.simulation.raw_sample,
        };
        VoltageSampler::from_config(adc, &self.sample_config).sample_battery_voltage()
    }

    fn publish(
        &mut self,
        session: &mut Self::Session,
        topic: &str,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        self.runtime
            .block_on(
                session
                    .client
                    .publish(topic, QoS::AtMostOnce, false, payload.to_vec()),
            )
            .with_context(|| format!("mqtt publish to {topic} failed"))
    }

    fn close_session(&mut self, mut session: Self::Session) {
        info!("disconnecting from broker");
        let poller = session.poller.take();
        let client = session.client.clone();
        self.runtime.block_on(async move {
            if let Err(err) = client.disconnect().await {
                warn!("mqtt disconnect request failed: {err}");
            }
            if let Some(poller) = poller {
                if tokio::time::timeout(DISCONNECT_GRACE, poller).await.is_err() {
                    warn!("mqtt event loop did not stop within {DISCONNECT_GRACE:?}");
                }
            }
        });
    }

    fn arm_wake_timer(&mut self, after: Duration) -> anyhow::Result<()> {
        info!("wake timer armed for {}s", after.as_secs());
        Ok(())
    }
}

// Sessions that never got established still own a reconnecting event loop.
impl Drop for HostSession {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

async fn poll_broker(mut eventloop: rumqttc::EventLoop, events: Sender<BrokerEvent>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                let event = if ack.code == ConnectReturnCode::Success {
                    BrokerEvent::Connected
                } else {
                    BrokerEvent::Error(format!("connection refused: {:?}", ack.code))
                };
                let _ = events.send(event);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(Event::Outgoing(Outgoing::Publish(_))) => {
                let _ = events.send(BrokerEvent::Other("published"));
            }
            Ok(_) => {}
            Err(err) => {
                warn!("mqtt poll error: {err}");
                let _ = events.send(BrokerEvent::Error(err.to_string()));
                break;
            }
        }
    }
}
