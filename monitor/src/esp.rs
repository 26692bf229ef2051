use std::{ffi::CStr, sync::mpsc, time::Duration};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    gpio::Gpio35,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration},
    netif::IpEvent,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::EspError,
    wifi::{EspWifi, WifiEvent},
};
use log::{info, warn};

use battery_monitor_common::{
    config::{BrokerConfig, NetworkConfig},
    check_station_config, connect_station, open_session, run_cycle, AdcReader, BrokerEvent,
    CalibrationProfile, ConnectFailure, ConnectionOutcome, CyclePlatform, MonitorConfig,
    SampleError, SessionOutcome, StationEvent, StationLink, VoltageSampler,
};

const NVS_NAMESPACE: &str = "batmon";
const NVS_CONFIG_KEY: &str = "config_json";

type BatteryChannel = AdcChannelDriver<'static, Gpio35, AdcDriver<'static, ADC1>>;

/// Battery sense line on the Huzzah32: half the cell voltage on GPIO35.
struct BatteryAdc {
    channel: BatteryChannel,
}

impl AdcReader for BatteryAdc {
    type Error = EspError;

    fn read_raw(&mut self) -> Result<u16, Self::Error> {
        self.channel.read_raw()
    }
}

struct StationAssociator<'a> {
    wifi: &'a mut EspWifi<'static>,
}

impl StationLink for StationAssociator<'_> {
    type Error = EspError;

    fn associate(&mut self) -> Result<(), Self::Error> {
        self.wifi.connect()
    }
}

struct EspPlatform {
    wifi: EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
    sampler: VoltageSampler<BatteryAdc, CalibrationProfile>,
}

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();
    log_boot_info();

    let sys_loop = EspSystemEventLoop::take().context("failed to take system event loop")?;
    let nvs_partition = EspDefaultNvsPartition::take().context("failed to initialize nvs")?;

    let mut config = NvsStore {
        partition: nvs_partition.clone(),
    }
    .load_config()
    .unwrap_or_else(|err| {
        warn!("failed to load config from NVS: {err:#}");
        MonitorConfig::default()
    });
    apply_build_defaults(&mut config);
    config.sanitize();

    let Peripherals {
        modem, pins, adc1, ..
    } = Peripherals::take().context("failed to take peripherals")?;

    let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))
        .context("failed to create wifi driver")?;

    let adc = AdcDriver::new(adc1).context("failed to initialize ADC1")?;
    let channel_config = AdcChannelConfig {
        attenuation: DB_11,
        ..Default::default()
    };
    let channel = AdcChannelDriver::new(adc, pins.gpio35, &channel_config)
        .context("failed to configure battery ADC channel")?;
    let sampler = VoltageSampler::from_config(BatteryAdc { channel }, &config.sampler);

    let mut platform = EspPlatform {
        wifi,
        sys_loop,
        sampler,
    };

    let report = run_cycle(&mut platform, &config)?;
    info!(
        "cycle finished: connection={:?} session={:?} published={}",
        report.connection, report.session, report.published
    );

    drop(platform);
    enter_deep_sleep()
}

impl CyclePlatform for EspPlatform {
    type Session = EspMqttClient<'static>;
    type Error = anyhow::Error;

    fn connect_station(&mut self, network: &NetworkConfig) -> anyhow::Result<ConnectionOutcome> {
        if let Err(failure) = check_station_config(network) {
            return Ok(ConnectionOutcome::Failed(failure));
        }
        if let Err(err) = self.configure_station(network) {
            warn!("station configuration rejected: {err:#}");
            return Ok(ConnectionOutcome::Failed(ConnectFailure::InvalidConfig));
        }

        let (tx, mut rx) = mpsc::channel();
        let wifi_tx = tx.clone();

        // Both subscriptions unregister when dropped at the end of this phase.
        let _wifi_events = self.sys_loop.subscribe::<WifiEvent, _>(move |event| {
            let forwarded = match event {
                WifiEvent::StaStarted => StationEvent::Started,
                WifiEvent::StaDisconnected(_) => StationEvent::Disconnected,
                _ => return,
            };
            let _ = wifi_tx.send(forwarded);
        })
        .context("failed to subscribe to wifi events")?;
        let _ip_events = self.sys_loop.subscribe::<IpEvent, _>(move |event| {
            if let IpEvent::DhcpIpAssigned(_) = event {
                let _ = tx.send(StationEvent::AddressAcquired(None));
            }
        })
        .context("failed to subscribe to ip events")?;

        self.wifi.start().context("failed to start wifi")?;
        info!("wifi_init_sta finished, connecting to `{}`", network.wifi_ssid);

        let mut link = StationAssociator {
            wifi: &mut self.wifi,
        };
        let outcome = connect_station(
            &mut link,
            &mut rx,
            network.max_retries,
            network.connect_timeout(),
        );

        Ok(match outcome {
            ConnectionOutcome::Connected(None) => {
                let ip = self.wifi.sta_netif().get_ip_info().ok().map(|info| info.ip);
                if let Some(ip) = ip {
                    info!("connected to ap `{}` with ip {ip}", network.wifi_ssid);
                }
                ConnectionOutcome::Connected(ip)
            }
            other => other,
        })
    }

    fn open_session(
        &mut self,
        broker: &BrokerConfig,
    ) -> anyhow::Result<(SessionOutcome, Option<Self::Session>)> {
        let url = broker.url();
        let credentials = broker.credentials();
        let conf = MqttClientConfiguration {
            client_id: (!broker.device_id.is_empty()).then_some(broker.device_id.as_str()),
            username: credentials.map(|(user, _)| user),
            password: credentials.map(|(_, pass)| pass),
            ..Default::default()
        };

        let (tx, mut rx) = mpsc::channel();
        let started = EspMqttClient::new_cb(&url, &conf, move |event| {
            let forwarded = match event.payload() {
                EventPayload::Connected(_) => BrokerEvent::Connected,
                EventPayload::Error(err) => BrokerEvent::Error(format!("{err:?}")),
                EventPayload::BeforeConnect => BrokerEvent::Other("before_connect"),
                EventPayload::Disconnected => BrokerEvent::Other("disconnected"),
                EventPayload::Published(_) => BrokerEvent::Other("published"),
                _ => BrokerEvent::Other("other"),
            };
            let _ = tx.send(forwarded);
        });
        let client = match started {
            Ok(client) => client,
            Err(err) => {
                warn!("failed to start mqtt client for {url}: {err}");
                return Ok((SessionOutcome::Error, None));
            }
        };

        Ok(open_session(client, &mut rx, broker.session_timeout()))
    }

    fn sample_battery_voltage(&mut self) -> Result<u32, SampleError> {
        self.sampler.sample_battery_voltage()
    }

    fn publish(
        &mut self,
        session: &mut Self::Session,
        topic: &str,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        session
            .publish(topic, QoS::AtMostOnce, false, payload)
            .with_context(|| format!("mqtt publish to {topic} failed"))?;
        Ok(())
    }

    fn close_session(&mut self, session: Self::Session) {
        info!("disconnecting from broker");
        drop(session);
    }

    fn arm_wake_timer(&mut self, after: Duration) -> anyhow::Result<()> {
        let micros = u64::try_from(after.as_micros()).unwrap_or(u64::MAX);
        let rc = unsafe { esp_idf_svc::sys::esp_sleep_enable_timer_wakeup(micros) };
        if rc == esp_idf_svc::sys::ESP_OK {
            return Ok(());
        }
        Err(anyhow!("esp_sleep_enable_timer_wakeup failed with code {}", rc))
    }
}

impl EspPlatform {
    fn configure_station(&mut self, network: &NetworkConfig) -> anyhow::Result<()> {
        let auth_method = if network.has_password() {
            AuthMethod::WPA2Personal
        } else {
            AuthMethod::None
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: network
                    .wifi_ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("wifi ssid too long"))?,
                password: network
                    .wifi_pass
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))
            .context("failed to apply station configuration")
    }
}

impl NvsStore {
    fn load_config(&self) -> anyhow::Result<MonitorConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            Some(value) => Ok(MonitorConfig::from_json(value)?),
            None => Ok(MonitorConfig::default()),
        }
    }
}

/// Fills credentials missing from NVS with values baked in at build time.
fn apply_build_defaults(config: &mut MonitorConfig) {
    fill_if_empty(&mut config.network.wifi_ssid, option_env!("WIFI_SSID"));
    fill_if_empty(&mut config.network.wifi_pass, option_env!("WIFI_PASS"));
    fill_if_empty(&mut config.broker.access_key, option_env!("BROKER_ACCESS_KEY"));
    fill_if_empty(
        &mut config.broker.access_secret,
        option_env!("BROKER_ACCESS_SECRET"),
    );
    fill_if_empty(&mut config.broker.device_id, option_env!("DEVICE_ID"));
}

fn fill_if_empty(field: &mut String, value: Option<&str>) {
    if field.is_empty() {
        if let Some(value) = value {
            *field = value.to_string();
        }
    }
}

fn log_boot_info() {
    let free_heap = unsafe { esp_idf_svc::sys::esp_get_free_heap_size() };
    let idf_version = unsafe { CStr::from_ptr(esp_idf_svc::sys::esp_get_idf_version()) };
    info!("[APP] Startup..");
    info!("[APP] Free memory: {free_heap} bytes");
    info!("[APP] IDF version: {}", idf_version.to_string_lossy());

    let cause = unsafe { esp_idf_svc::sys::esp_sleep_get_wakeup_cause() };
    if cause == esp_idf_svc::sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_TIMER {
        info!("[APP] woke from deep sleep timer");
    } else {
        info!("[APP] cold boot (wakeup cause {cause})");
    }
}

fn enter_deep_sleep() -> ! {
    info!("entering deep sleep");
    unsafe { esp_idf_svc::sys::esp_deep_sleep_start() }
}
