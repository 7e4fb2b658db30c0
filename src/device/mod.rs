//! Device contract and the wrapper that drives one adapter.

mod blade;
mod command;
mod config;
mod format;
mod hyperdeck;
mod publisher;
mod state;
mod xml_udp;

pub use blade::Blade;
pub use command::{Command, GotoTarget, MetadataField};
pub use config::{DeviceConfig, DeviceConfigError, Result};
pub use format::{DEFAULT_TEMPLATE, NameFormatter};
pub use hyperdeck::HyperDeck;
pub use publisher::StatePublisher;
pub use state::{Activity, DeviceFacts, DeviceState, Link, resolve};
pub use xml_udp::{CaptureContext, XmlFormat, XmlUdp, format_for};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::events::EventSender;
use crate::harvest::SourceSpec;
use crate::observability::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an adapter learns about device activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// State is refreshed by asking the device (`poll`)
    Pollable,
    /// The device pushes status; `poll` is a no-op
    EventDriven,
}

/// Timing shared by every session an adapter opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub advertise_interval: Duration,
    pub teardown_wait: Duration,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(2000),
            reconnect_interval: Duration::from_millis(2000),
            advertise_interval: Duration::from_millis(2000),
            teardown_wait: Duration::from_millis(1000),
        }
    }
}

/// Vendor protocol adapter. Owns at most one session at a time.
///
/// Adapters report everything through the [`StatePublisher`] handed to
/// `connect`; none of these methods return connectivity or protocol errors.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    fn kind(&self) -> &'static str;

    fn default_name(&self) -> &'static str;

    fn capability(&self) -> Capability;

    /// Check a config without touching the adapter.
    fn validate(&self, config: &DeviceConfig) -> Result<()>;

    /// Store a config. Leaves the adapter unchanged on error.
    fn configure(&mut self, config: &DeviceConfig) -> Result<()>;

    /// Adapter-specific keys only; the wrapper adds the common ones.
    fn to_config(&self) -> DeviceConfig;

    /// Start the session in the background.
    async fn connect(&mut self, publisher: StatePublisher) -> Result<()>;

    async fn command(&mut self, command: &Command, formatter: &NameFormatter);

    async fn poll(&mut self) {}

    /// Stop the session. Safe to call repeatedly.
    async fn teardown(&mut self);
}

/// Host-facing snapshot of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub id: DeviceId,
    pub kind: String,
    pub name: String,
    pub enabled: bool,
    pub state: DeviceState,
    pub info: String,
}

pub struct Device {
    id: DeviceId,
    name: String,
    enabled: bool,
    configured: bool,
    formatter: NameFormatter,
    harvest: Option<SourceSpec>,
    adapter: Box<dyn DeviceAdapter>,
    publisher: StatePublisher,
}

impl Device {
    pub fn new(
        id: DeviceId,
        name: &str,
        adapter: Box<dyn DeviceAdapter>,
        events: EventSender,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            enabled: true,
            configured: false,
            formatter: NameFormatter::new(name),
            harvest: None,
            adapter,
            publisher: StatePublisher::new(id, events, metrics),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.adapter.kind()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn capability(&self) -> Capability {
        self.adapter.capability()
    }

    pub fn formatter(&self) -> &NameFormatter {
        &self.formatter
    }

    pub fn harvest_source(&self) -> Option<&SourceSpec> {
        self.harvest.as_ref()
    }

    pub fn publisher(&self) -> &StatePublisher {
        &self.publisher
    }

    /// Validate `config`, stop any live session, then apply it. On error the
    /// device keeps its previous configuration and session.
    pub async fn reconfigure(&mut self, name: &str, config: &DeviceConfig) -> Result<()> {
        self.adapter.validate(config)?;
        let harvest = SourceSpec::from_config(config)?;
        let template = config.opt_str("formatting")?;
        let enabled = config.bool_or("enabled", self.enabled)?;

        self.adapter.teardown().await;
        self.adapter.configure(config)?;

        self.name = name.to_string();
        self.formatter.set_device_name(name);
        self.formatter
            .set_template(template.unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()));
        self.harvest = harvest;
        self.enabled = enabled;
        self.configured = true;

        self.publisher.update(|facts| *facts = DeviceFacts::default());
        self.publisher.set_enabled(enabled);
        debug!(device_id = %self.id, device = %self.name, kind = self.kind(), "Device configured");
        Ok(())
    }

    /// (Re)open the session. A disabled device stays disconnected.
    pub async fn connect(&mut self) -> Result<()> {
        if !self.configured {
            return Err(DeviceConfigError::NotConfigured);
        }
        self.adapter.teardown().await;
        self.publisher.update(|facts| *facts = DeviceFacts::default());
        if !self.enabled {
            return Ok(());
        }
        self.adapter.connect(self.publisher.clone()).await
    }

    pub async fn command(&mut self, command: &Command) {
        if !self.enabled {
            return;
        }
        if let Command::Metadata(field, value) = command {
            self.formatter.apply_metadata(*field, value);
        }
        debug!(device_id = %self.id, device = %self.name, %command, "Dispatching command");
        self.adapter.command(command, &self.formatter).await;
    }

    /// Poll when the adapter supports it, then republish.
    pub async fn refresh(&mut self) {
        if self.enabled && self.adapter.capability() == Capability::Pollable {
            self.adapter.poll().await;
        }
        self.publisher.refresh();
    }

    pub async fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        if self.enabled == enabled {
            return Ok(());
        }
        self.enabled = enabled;
        self.publisher.set_enabled(enabled);
        if enabled {
            self.connect().await
        } else {
            self.teardown().await;
            Ok(())
        }
    }

    pub fn state(&self) -> DeviceState {
        self.publisher.state()
    }

    pub fn info(&self) -> String {
        self.publisher.info()
    }

    pub fn status(&self) -> DeviceStatus {
        let (state, info) = self.publisher.snapshot();
        DeviceStatus {
            id: self.id,
            kind: self.kind().to_string(),
            name: self.name.clone(),
            enabled: self.enabled,
            state,
            info,
        }
    }

    pub async fn teardown(&mut self) {
        self.adapter.teardown().await;
        self.publisher.update(|facts| {
            facts.link = Link::default();
            facts.activity = Activity::Idle;
        });
    }

    pub fn to_config(&self) -> DeviceConfig {
        let mut config = self.adapter.to_config();
        config.insert("name", self.name.clone());
        config.insert("enabled", self.enabled);
        if self.formatter.template() != DEFAULT_TEMPLATE {
            config.insert("formatting", self.formatter.template());
        }
        if let Some(source) = &self.harvest {
            source.write_config(&mut config);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, Event};
    use std::sync::Mutex;

    /// Adapter that records what the wrapper asked of it.
    #[derive(Default)]
    struct Probe {
        calls: Arc<Mutex<Vec<String>>>,
        host: Option<String>,
    }

    #[async_trait]
    impl DeviceAdapter for Probe {
        fn kind(&self) -> &'static str {
            "probe"
        }

        fn default_name(&self) -> &'static str {
            "Probe"
        }

        fn capability(&self) -> Capability {
            Capability::Pollable
        }

        fn validate(&self, config: &DeviceConfig) -> Result<()> {
            config.require_str("host").map(|_| ())
        }

        fn configure(&mut self, config: &DeviceConfig) -> Result<()> {
            self.host = Some(config.require_str("host")?);
            self.calls.lock().unwrap().push("configure".into());
            Ok(())
        }

        fn to_config(&self) -> DeviceConfig {
            DeviceConfig::new().with("host", self.host.clone().unwrap_or_default())
        }

        async fn connect(&mut self, publisher: StatePublisher) -> Result<()> {
            self.calls.lock().unwrap().push("connect".into());
            publisher.update(|facts| facts.link = Link::Up);
            Ok(())
        }

        async fn command(&mut self, command: &Command, formatter: &NameFormatter) {
            let line = match command {
                Command::Record(take) => format!("record {}", formatter.format_take(take)),
                other => other.to_string(),
            };
            self.calls.lock().unwrap().push(line);
        }

        async fn poll(&mut self) {
            self.calls.lock().unwrap().push("poll".into());
        }

        async fn teardown(&mut self) {
            self.calls.lock().unwrap().push("teardown".into());
        }
    }

    fn device() -> (Device, Arc<Mutex<Vec<String>>>, events::EventReceiver) {
        let probe = Probe::default();
        let calls = probe.calls.clone();
        let (tx, rx) = events::channel();
        let device = Device::new(DeviceId(1), "probe", Box::new(probe), tx, Arc::new(Metrics::new()));
        (device, calls, rx)
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_without_mutation() {
        let (mut device, calls, _rx) = device();
        let err = device
            .reconfigure("renamed", &DeviceConfig::new())
            .await
            .unwrap_err();
        assert_eq!(err, DeviceConfigError::Missing("host"));
        assert_eq!(device.name(), "probe");
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(device.connect().await, Err(DeviceConfigError::NotConfigured));
    }

    #[tokio::test]
    async fn test_reconfigure_tears_down_before_applying() {
        let (mut device, calls, _rx) = device();
        let config = DeviceConfig::new().with("host", "10.0.0.1");
        device.reconfigure("deck", &config).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["teardown", "configure"]);
    }

    #[tokio::test]
    async fn test_disabled_device_ignores_commands_and_reports_offline() {
        let (mut device, calls, _rx) = device();
        let config = DeviceConfig::new().with("host", "h");
        device.reconfigure("deck", &config).await.unwrap();
        device.connect().await.unwrap();
        assert_eq!(device.state(), DeviceState::Online);

        device.set_enabled(false).await.unwrap();
        calls.lock().unwrap().clear();
        device.command(&Command::Record("t".into())).await;
        device.refresh().await;
        assert_eq!(device.state(), DeviceState::Offline);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_feeds_formatter() {
        let (mut device, calls, _rx) = device();
        let config = DeviceConfig::new()
            .with("host", "h")
            .with("formatting", "{shot}_{take}");
        device.reconfigure("deck", &config).await.unwrap();
        device
            .command(&Command::Metadata(MetadataField::ShotName, "wide".into()))
            .await;
        device.command(&Command::Record("t1".into())).await;
        assert_eq!(calls.lock().unwrap().last().unwrap(), "record wide_t1");
        assert_eq!(device.to_config().opt_str("formatting").unwrap().unwrap(), "{shot}_{take}");
    }

    #[tokio::test]
    async fn test_teardown_twice_publishes_once() {
        let (mut device, _calls, mut rx) = device();
        device
            .reconfigure("deck", &DeviceConfig::new().with("host", "h"))
            .await
            .unwrap();
        device.connect().await.unwrap();
        while rx.try_recv().is_ok() {}

        device.teardown().await;
        device.teardown().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![Event::StateChanged {
                device_id: DeviceId(1),
                state: DeviceState::Offline,
                info: String::new(),
            }]
        );
    }
}
