//! Vicon Blade: the application dials us.
//!
//! We listen on TCP and broadcast a `DivaServer` advertisement until Blade
//! connects, then push `DivaCommand` scripts to every connected peer.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::config::{DeviceConfig, DeviceConfigError, Result};
use super::state::{Activity, Link};
use super::{Capability, Command, DeviceAdapter, NameFormatter, NetworkSettings, StatePublisher};
use crate::session::{
    RendezvousSender, RendezvousSession, RendezvousSettings, Response, SessionEvent,
    SessionObserver,
};

pub const KIND: &str = "blade";
const DEFAULT_LISTEN_PORT: u16 = 8026;
const DEFAULT_BROADCAST_PORT: u16 = 8811;
const DEFAULT_TARGET_HOST: &str = "255.255.255.255";
const WAITING: &str = "Waiting for connection";
/// Longest record delay accepted, in seconds.
const MAX_DELAY: f64 = 3600.0;

#[derive(Debug, Clone, PartialEq)]
struct Settings {
    listen_ip: IpAddr,
    listen_port: u16,
    /// Where the advertisement goes; broadcast unless pinned to one host
    target_host: String,
    broadcast_port: u16,
    delay: f64,
    computer_name: String,
}

impl Settings {
    fn parse(config: &DeviceConfig) -> Result<Self> {
        let listen_ip = config
            .opt_ip("listen_ip")?
            .ok_or(DeviceConfigError::Missing("listen_ip"))?;
        let computer_name = match config.opt_str("computer_name")? {
            Some(name) => name,
            None => std::env::var("COMPUTERNAME")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or_else(|_| "stagehand".to_string()),
        };
        let delay = config.f64_or("delay", 0.0)?;
        if delay > MAX_DELAY {
            return Err(DeviceConfigError::Invalid {
                field: "delay",
                reason: format!("{delay} exceeds {MAX_DELAY} seconds"),
            });
        }
        Ok(Self {
            listen_ip,
            listen_port: config.port_or("listen_port", DEFAULT_LISTEN_PORT)?,
            target_host: match config.opt_str("target_host")? {
                Some(host) => host,
                None => config
                    .opt_str("blade_host")?
                    .unwrap_or_else(|| DEFAULT_TARGET_HOST.to_string()),
            },
            broadcast_port: config.port_or("broadcast_port", DEFAULT_BROADCAST_PORT)?,
            delay,
            computer_name,
        })
    }

    fn advertisement(&self) -> String {
        format!(
            "<?xml version=\"1.0\" standalone=\"yes\"?><DivaServer IPAddress=\"{}\" ComputerName=\"{}\" Port=\"{}\" />\0",
            self.listen_ip,
            quick_xml::escape::escape(self.computer_name.as_str()),
            self.listen_port
        )
    }
}

/// Wrap a script line for Blade's command socket.
fn diva_command(script: &str) -> String {
    format!(
        "<?xml version=\"1.0\" standalone=\"yes\" ?><DivaCommand ScriptText='{}' />",
        script.replace('"', "&quot;")
    )
}

fn record_script(take: &str) -> [String; 2] {
    [
        diva_command(&format!("captureOptions -name \"{take}\";")),
        diva_command("capture;"),
    ]
}

/// Tracks connected peers and folds them into the link fact.
struct PeerObserver {
    publisher: StatePublisher,
    peers: AtomicUsize,
}

impl SessionObserver<Response> for PeerObserver {
    fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                let peers = self.peers.fetch_add(1, Ordering::AcqRel) + 1;
                self.publisher.update(|facts| {
                    facts.link = Link::Up;
                    facts.local_error = None;
                    facts.detail = format!("Connections: {peers}");
                });
            }
            SessionEvent::Disconnected(_) => {
                let previous = self
                    .peers
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
                    .unwrap_or_default();
                let peers = previous.saturating_sub(1);
                self.publisher.update(|facts| {
                    facts.detail = format!("Connections: {peers}");
                    if peers == 0 {
                        facts.link = Link::Down(WAITING.to_string());
                        facts.activity = Activity::Idle;
                    }
                });
            }
            other => self.publisher.update(|facts| facts.apply(&other)),
        }
    }

    fn on_message(&self, response: Response) {
        debug!(reply = %response.text, "Blade replied");
    }
}

fn send_all(sender: &RendezvousSender, publisher: &StatePublisher, messages: &[String]) -> bool {
    for message in messages {
        if let Err(err) = sender.send(message) {
            warn!(error = %err, "Blade command not delivered");
            return false;
        }
    }
    publisher.update(|facts| facts.local_error = None);
    true
}

pub struct Blade {
    network: NetworkSettings,
    settings: Option<Settings>,
    session: Option<RendezvousSession>,
    publisher: Option<StatePublisher>,
    pending_record: Option<JoinHandle<()>>,
}

impl Blade {
    pub fn new(network: &NetworkSettings) -> Self {
        Self {
            network: network.clone(),
            settings: None,
            session: None,
            publisher: None,
            pending_record: None,
        }
    }

    fn cancel_pending(&mut self) {
        if let Some(task) = self.pending_record.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl DeviceAdapter for Blade {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn default_name(&self) -> &'static str {
        "Blade"
    }

    fn capability(&self) -> Capability {
        Capability::EventDriven
    }

    fn validate(&self, config: &DeviceConfig) -> Result<()> {
        Settings::parse(config).map(|_| ())
    }

    fn configure(&mut self, config: &DeviceConfig) -> Result<()> {
        self.settings = Some(Settings::parse(config)?);
        Ok(())
    }

    fn to_config(&self) -> DeviceConfig {
        let Some(s) = &self.settings else {
            return DeviceConfig::new();
        };
        DeviceConfig::new()
            .with("listen_ip", s.listen_ip.to_string())
            .with("listen_port", s.listen_port)
            .with("target_host", s.target_host.clone())
            .with("broadcast_port", s.broadcast_port)
            .with("delay", s.delay)
            .with("computer_name", s.computer_name.clone())
    }

    async fn connect(&mut self, publisher: StatePublisher) -> Result<()> {
        let Some(settings) = self.settings.clone() else {
            return Err(DeviceConfigError::NotConfigured);
        };
        self.teardown().await;
        self.publisher = Some(publisher.clone());

        // Blade cannot reach us when bound to a single interface.
        let listen = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), settings.listen_port);
        let observer = Arc::new(PeerObserver {
            publisher: publisher.clone(),
            peers: AtomicUsize::new(0),
        });
        let opened = RendezvousSession::open(
            RendezvousSettings {
                listen,
                advertise_to: format!("{}:{}", settings.target_host, settings.broadcast_port),
                advertisement: settings.advertisement(),
                advertise_interval: self.network.advertise_interval,
                teardown_wait: self.network.teardown_wait,
            },
            observer,
        )
        .await;

        match opened {
            Ok(session) => {
                self.session = Some(session);
                publisher.update(|facts| facts.link = Link::Down(WAITING.to_string()));
            }
            Err(err) => {
                warn!(error = %err, %listen, "Blade listener failed");
                publisher.update(|facts| facts.apply(&SessionEvent::Error(err.kind(), err.to_string())));
            }
        }
        Ok(())
    }

    async fn command(&mut self, command: &Command, formatter: &NameFormatter) {
        let (Some(session), Some(publisher)) = (&self.session, self.publisher.clone()) else {
            return;
        };
        let sender = session.sender();
        match command {
            Command::Record(take) => {
                self.cancel_pending();
                let script = record_script(&formatter.format_take(take));
                let delay = self
                    .settings
                    .as_ref()
                    .and_then(|s| Duration::try_from_secs_f64(s.delay).ok())
                    .unwrap_or_default();
                if !delay.is_zero() {
                    self.pending_record = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if send_all(&sender, &publisher, &script) {
                            publisher.update(|facts| facts.activity = Activity::Recording);
                        }
                    }));
                } else if send_all(&sender, &publisher, &script) {
                    publisher.update(|facts| facts.activity = Activity::Recording);
                }
            }
            Command::Stop => {
                self.cancel_pending();
                send_all(&sender, &publisher, &[diva_command("capture -stop;")]);
                publisher.update(|facts| facts.activity = Activity::Idle);
            }
            other => debug!(command = %other, "Ignored"),
        }
    }

    async fn teardown(&mut self) {
        self.cancel_pending();
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diva_command_escapes_quotes() {
        let [name, capture] = record_script("take_01");
        assert_eq!(
            name,
            "<?xml version=\"1.0\" standalone=\"yes\" ?><DivaCommand ScriptText='captureOptions -name &quot;take_01&quot;;' />"
        );
        assert!(capture.ends_with("ScriptText='capture;' />"));
    }

    #[test]
    fn test_advertisement_names_listener() {
        let settings = Settings::parse(
            &DeviceConfig::new()
                .with("listen_ip", "192.168.1.5")
                .with("computer_name", "stage"),
        )
        .unwrap();
        assert_eq!(settings.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(settings.broadcast_port, DEFAULT_BROADCAST_PORT);
        assert_eq!(
            settings.advertisement(),
            "<?xml version=\"1.0\" standalone=\"yes\"?><DivaServer IPAddress=\"192.168.1.5\" ComputerName=\"stage\" Port=\"8026\" />\0"
        );
    }

    #[test]
    fn test_record_delay_is_bounded() {
        let config = DeviceConfig::new().with("listen_ip", "10.0.0.1");
        assert_eq!(Settings::parse(&config.clone().with("delay", 2.5)).unwrap().delay, 2.5);
        assert!(matches!(
            Settings::parse(&config.clone().with("delay", 1e30)),
            Err(DeviceConfigError::Invalid { field: "delay", .. })
        ));
        assert!(Settings::parse(&config.with("delay", -1.0)).is_err());
    }

    #[test]
    fn test_listen_ip_required() {
        assert_eq!(
            Settings::parse(&DeviceConfig::new()),
            Err(DeviceConfigError::Missing("listen_ip"))
        );
    }
}
