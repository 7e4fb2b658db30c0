//! Capture software triggered by XML datagrams.
//!
//! Outbound messages come from a table keyed by the `fmt` setting, one entry
//! per vendor dialect. With `listen_ip`/`listen_port` set, the device's own
//! status datagrams drive the state; otherwise the last command does.

use async_trait::async_trait;
use quick_xml::escape::escape;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

use super::config::{DeviceConfig, DeviceConfigError, Result};
use super::state::{Activity, DeviceFacts, Link};
use super::{Capability, Command, DeviceAdapter, MetadataField, NameFormatter, NetworkSettings, StatePublisher};
use crate::session::{
    BroadcastSettings, BroadcastXmlSession, SessionErrorKind, SessionEvent, SessionObserver,
    XmlMessage,
};

pub const KIND: &str = "xmludp";
const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no" ?>"#;

/// Values substituted into a capture message.
#[derive(Debug, Clone, Copy)]
pub struct CaptureContext<'a> {
    pub take: &'a str,
    pub packet_id: u32,
    pub database_path: Option<&'a str>,
}

pub type FormatFn = fn(&CaptureContext<'_>) -> String;

/// One vendor dialect.
pub struct XmlFormat {
    pub tag: &'static str,
    pub start: FormatFn,
    pub stop: FormatFn,
}

static FORMATS: &[XmlFormat] = &[
    XmlFormat { tag: "Vicon", start: vicon_start, stop: vicon_stop },
    XmlFormat { tag: "Optitrack", start: optitrack_start, stop: optitrack_stop },
    XmlFormat { tag: "XSENS", start: xsens_start, stop: xsens_stop },
    XmlFormat { tag: "Blade", start: blade_start, stop: blade_stop },
    XmlFormat { tag: "Rokoko", start: rokoko_start, stop: rokoko_stop },
    XmlFormat { tag: "Nansense", start: nansense_start, stop: nansense_stop },
];

static GENERIC: XmlFormat = XmlFormat {
    tag: "",
    start: generic_start,
    stop: generic_stop,
};

/// Dialect for a vendor tag, falling back to the generic message.
pub fn format_for(tag: &str) -> &'static XmlFormat {
    FORMATS.iter().find(|f| f.tag == tag).unwrap_or(&GENERIC)
}

fn name(ctx: &CaptureContext<'_>) -> String {
    escape(ctx.take).into_owned()
}

fn vicon_start(ctx: &CaptureContext<'_>) -> String {
    format!(
        "<CaptureStart>\n    <Name VALUE=\"{}\"/>\n    <Notes VALUE=\"\"/>\n    <Description VALUE=\"\"/>\n    <Delay VALUE=\"33\"/>\n    <PacketID VALUE=\"{}\"/>\n</CaptureStart>\n",
        name(ctx),
        ctx.packet_id
    )
}

fn vicon_stop(ctx: &CaptureContext<'_>) -> String {
    format!(
        "{XML_DECL}\n<CaptureStop RESULT=\"SUCCESS\">\n    <Name VALUE=\"{}\"/>\n    <PacketID VALUE=\"{}\"/>\n</CaptureStop>\n",
        name(ctx),
        ctx.packet_id
    )
}

fn optitrack(tag: &str, ctx: &CaptureContext<'_>) -> String {
    format!(
        "{XML_DECL}<{tag}><Name VALUE=\"{}\"/><SessionName VALUE=\"\"/><Notes VALUE=\"\"/><Assets VALUE=\"\"/><Description VALUE=\"\"/><DatabasePath VALUE=\"\"/><TimeCode VALUE=\"00:00:00:00\"/><PacketID VALUE=\"{}\"/><HostName VALUE=\"Motive\"/><ProcessID VALUE=\"{}\"/></{tag}>",
        name(ctx),
        ctx.packet_id,
        std::process::id()
    )
}

fn optitrack_start(ctx: &CaptureContext<'_>) -> String {
    optitrack("CaptureStart", ctx)
}

fn optitrack_stop(ctx: &CaptureContext<'_>) -> String {
    optitrack("CaptureStop", ctx)
}

fn xsens_start(ctx: &CaptureContext<'_>) -> String {
    let mut msg = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<CaptureStart>\n<Name VALUE=\"{}\" />\n",
        name(ctx)
    );
    if let Some(path) = ctx.database_path {
        msg.push_str(&format!("<DatabasePath VALUE=\"{}\" />\n", escape(path)));
    }
    msg.push_str("<TimeCode VALUE=\"\" />\n<Notes></Notes>\n</CaptureStart>\n");
    msg
}

fn xsens_stop(_ctx: &CaptureContext<'_>) -> String {
    "<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<CaptureStop>\n<Notes></Notes>\n</CaptureStop>\n"
        .to_string()
}

fn blade_start(ctx: &CaptureContext<'_>) -> String {
    format!(
        "{XML_DECL}<CaptureStart><Name VALUE=\"{}\"/><Notes VALUE=\"\"/><Description VALUE=\"\"/><DatabasePath VALUE=\"{}\"/><Delay VALUE=\"0\"/><PacketID VALUE=\"{}\"/></CaptureStart>\0",
        name(ctx),
        escape(ctx.database_path.unwrap_or_default()),
        ctx.packet_id
    )
}

fn blade_stop(ctx: &CaptureContext<'_>) -> String {
    format!(
        "{XML_DECL}<CaptureStop RESULT=\"SUCCESS\"><Name VALUE=\"{}\"/><DatabasePath VALUE=\"{}\"/><Delay VALUE=\"0\"/><PacketID VALUE=\"{}\"/></CaptureStop>",
        name(ctx),
        escape(ctx.database_path.unwrap_or_default()),
        ctx.packet_id
    )
}

fn rokoko(tag: &str, extra: &str, ctx: &CaptureContext<'_>) -> String {
    format!(
        "{XML_DECL}<{tag}><Name VALUE=\"{}\"/><TimeCode VALUE=\"00:00:00:00\"/>{extra}<PacketID VALUE=\"{}\"/><ProcessID VALUE=\"{}\"/></{tag}>",
        name(ctx),
        ctx.packet_id,
        std::process::id()
    )
}

fn rokoko_start(ctx: &CaptureContext<'_>) -> String {
    rokoko("CaptureStart", "", ctx)
}

fn rokoko_stop(ctx: &CaptureContext<'_>) -> String {
    rokoko("CaptureStop", "<SetActiveClip VALUE=\"False\"/>", ctx)
}

fn nansense_start(ctx: &CaptureContext<'_>) -> String {
    format!("<CaptureStart><Name VALUE=\"{}\" /></CaptureStart>", name(ctx))
}

fn nansense_stop(ctx: &CaptureContext<'_>) -> String {
    format!("<CaptureStop><Name VALUE=\"{}\" /></CaptureStop>\n", name(ctx))
}

fn generic_start(ctx: &CaptureContext<'_>) -> String {
    format!(
        "{XML_DECL}\n<CaptureStart>\n\t<Name VALUE=\"{}\"/>\n\t<PacketID VALUE=\"{}\"/>\n</CaptureStart>\n",
        name(ctx),
        ctx.packet_id
    )
}

fn generic_stop(ctx: &CaptureContext<'_>) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\" ?>\n<CaptureStop>\n      <Name VALUE=\"{}\" />\n</CaptureStop>\n",
        name(ctx)
    )
}

/// Map a status datagram onto the facts.
fn apply_status(message: &XmlMessage, facts: &mut DeviceFacts) {
    facts.activity = match message.tag.as_str() {
        "CaptureStart" => Activity::Recording,
        "CaptureStop" | "CaptureStopAck" | "CaptureComplete" => Activity::Idle,
        "CaptureStartAck" => match message.attribute("Result") {
            Some("TRUE") => Activity::Recording,
            _ => Activity::Fault(
                message
                    .attribute("Reason")
                    .unwrap_or("Capture start refused")
                    .to_string(),
            ),
        },
        other => Activity::Fault(format!("Unknown message: {other}")),
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    host: String,
    port: u16,
    broadcast: bool,
    listen: Option<SocketAddr>,
    format: String,
    set_capture_folder: bool,
}

impl Settings {
    fn parse(config: &DeviceConfig) -> Result<Self> {
        let format = config.opt_str("fmt")?.unwrap_or_default();
        if !format.is_empty() && format_for(&format).tag.is_empty() {
            return Err(DeviceConfigError::Invalid {
                field: "fmt",
                reason: format!("unknown format '{format}'"),
            });
        }

        let listen = match (config.opt_str("listen_ip")?, config.opt_port("listen_port")?) {
            (Some(ip), Some(port)) if ip == "--all--" => {
                Some(SocketAddr::new(IpAddr::from([0, 0, 0, 0]), port))
            }
            (Some(_), Some(port)) => config.opt_ip("listen_ip")?.map(|ip| SocketAddr::new(ip, port)),
            _ => None,
        };

        Ok(Self {
            host: config.require_str("host")?,
            port: config.require_port("port")?,
            broadcast: config.bool_or("broadcast", false)?,
            listen,
            format,
            set_capture_folder: config.bool_or("set_capture_folder", false)?,
        })
    }
}

struct StatusObserver {
    publisher: StatePublisher,
}

impl SessionObserver<XmlMessage> for StatusObserver {
    fn on_event(&self, event: SessionEvent) {
        self.publisher.update(|facts| match event {
            SessionEvent::Error(SessionErrorKind::Protocol, diagnostic) => {
                facts.activity = Activity::Fault(diagnostic);
            }
            other => facts.apply(&other),
        });
    }

    /// A datagram that parses means the link works again.
    fn on_message(&self, message: XmlMessage) {
        self.publisher.update(|facts| {
            facts.link = Link::Up;
            apply_status(&message, facts);
        });
    }
}

pub struct XmlUdp {
    network: NetworkSettings,
    settings: Option<Settings>,
    session: Option<BroadcastXmlSession>,
    publisher: Option<StatePublisher>,
    packet_id: u32,
    current_take: String,
    data_directory: Option<String>,
}

impl XmlUdp {
    pub fn new(network: &NetworkSettings) -> Self {
        Self {
            network: network.clone(),
            settings: None,
            session: None,
            publisher: None,
            packet_id: 0,
            current_take: String::new(),
            data_directory: None,
        }
    }

    fn is_listening(&self) -> bool {
        self.session.as_ref().is_some_and(BroadcastXmlSession::is_listening)
    }

    async fn open(&mut self) {
        let (Some(settings), Some(publisher)) = (self.settings.clone(), self.publisher.clone()) else {
            return;
        };
        let observer = Arc::new(StatusObserver {
            publisher: publisher.clone(),
        });
        let opened = BroadcastXmlSession::open(
            BroadcastSettings {
                host: settings.host,
                port: settings.port,
                broadcast: settings.broadcast,
                listen: settings.listen,
                teardown_wait: self.network.teardown_wait,
            },
            observer,
        )
        .await;
        match opened {
            Ok(session) => self.session = Some(session),
            Err(err) => {
                warn!(error = %err, "Could not open datagram socket");
                publisher.update(|facts| facts.apply(&SessionEvent::Error(err.kind(), err.to_string())));
            }
        }
    }

    async fn send(&mut self, message: String, recording: bool) {
        if self.session.is_none() {
            self.open().await;
        }
        let Some(publisher) = self.publisher.clone() else {
            return;
        };
        let Some(session) = &self.session else {
            publisher.update(|facts| facts.local_error = Some("No socket".to_string()));
            return;
        };

        match session.send(&message).await {
            Ok(()) => {
                self.packet_id = self.packet_id.wrapping_add(1);
                let listening = self.is_listening();
                publisher.update(|facts| {
                    facts.local_error = None;
                    if !listening {
                        facts.link = Link::Up;
                        facts.activity = if recording {
                            Activity::Recording
                        } else {
                            Activity::Idle
                        };
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "Capture message not sent");
                publisher.update(|facts| facts.local_error = Some(err.to_string()));
            }
        }
    }

    /// Per-device capture folder under the session data directory.
    fn database_path(&self, formatter: &NameFormatter) -> Option<String> {
        if !self.settings.as_ref().is_some_and(|s| s.set_capture_folder) {
            return None;
        }
        let base = self.data_directory.as_deref()?;
        let device = formatter.value("device").unwrap_or_default();
        Some(format!("{}/{device}", base.trim_end_matches(['/', '\\'])))
    }
}

#[async_trait]
impl DeviceAdapter for XmlUdp {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn default_name(&self) -> &'static str {
        "XmlUdp"
    }

    fn capability(&self) -> Capability {
        if self.settings.as_ref().is_some_and(|s| s.listen.is_some()) {
            Capability::EventDriven
        } else {
            Capability::Pollable
        }
    }

    fn validate(&self, config: &DeviceConfig) -> Result<()> {
        Settings::parse(config).map(|_| ())
    }

    fn configure(&mut self, config: &DeviceConfig) -> Result<()> {
        self.settings = Some(Settings::parse(config)?);
        self.current_take.clear();
        Ok(())
    }

    fn to_config(&self) -> DeviceConfig {
        let Some(s) = &self.settings else {
            return DeviceConfig::new();
        };
        let mut config = DeviceConfig::new()
            .with("host", s.host.clone())
            .with("port", s.port)
            .with("broadcast", s.broadcast)
            .with("set_capture_folder", s.set_capture_folder);
        if !s.format.is_empty() {
            config.insert("fmt", s.format.clone());
        }
        if let Some(listen) = s.listen {
            config.insert("listen_ip", listen.ip().to_string());
            config.insert("listen_port", listen.port());
        }
        config
    }

    async fn connect(&mut self, publisher: StatePublisher) -> Result<()> {
        if self.settings.is_none() {
            return Err(DeviceConfigError::NotConfigured);
        }
        self.teardown().await;
        self.publisher = Some(publisher);
        self.open().await;
        Ok(())
    }

    async fn command(&mut self, command: &Command, formatter: &NameFormatter) {
        let format = format_for(self.settings.as_ref().map_or("", |s| s.format.as_str()));
        match command {
            Command::Record(take) => {
                self.current_take = formatter.format_take(take);
                let database_path = self.database_path(formatter);
                let message = (format.start)(&CaptureContext {
                    take: &self.current_take,
                    packet_id: self.packet_id,
                    database_path: database_path.as_deref(),
                });
                self.send(message, true).await;
            }
            Command::Stop => {
                let database_path = self.database_path(formatter);
                let message = (format.stop)(&CaptureContext {
                    take: &self.current_take,
                    packet_id: self.packet_id,
                    database_path: database_path.as_deref(),
                });
                self.send(message, false).await;
            }
            Command::Metadata(MetadataField::DataDirectory, dir) => {
                self.data_directory = Some(dir.clone()).filter(|d| !d.is_empty());
            }
            other => debug!(command = %other, "Ignored"),
        }
    }

    async fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceId, DeviceState};
    use crate::observability::Metrics;
    use crate::session::parse_message;

    fn ctx(take: &str) -> CaptureContext<'_> {
        CaptureContext {
            take,
            packet_id: 4,
            database_path: Some("D:/data/cam"),
        }
    }

    #[test]
    fn test_every_dialect_produces_parseable_xml() {
        for format in FORMATS.iter().chain(std::iter::once(&GENERIC)) {
            let start = parse_message((format.start)(&ctx("t&1")).as_bytes()).unwrap();
            assert_eq!(start.tag, "CaptureStart", "{}", format.tag);
            assert_eq!(start.child_value("Name"), Some("t&1"), "{}", format.tag);
            let stop = parse_message((format.stop)(&ctx("t&1")).as_bytes()).unwrap();
            assert_eq!(stop.tag, "CaptureStop", "{}", format.tag);
        }
    }

    #[test]
    fn test_format_lookup_falls_back_to_generic() {
        assert_eq!(format_for("Vicon").tag, "Vicon");
        assert_eq!(format_for("Whatever").tag, "");
        let message = (format_for("Vicon").start)(&ctx("a"));
        assert!(message.contains("<PacketID VALUE=\"4\"/>"));
    }

    #[test]
    fn test_status_mapping() {
        let mut facts = DeviceFacts::default();
        apply_status(&parse_message(b"<CaptureStart/>").unwrap(), &mut facts);
        assert_eq!(facts.activity, Activity::Recording);

        apply_status(&parse_message(b"<CaptureComplete/>").unwrap(), &mut facts);
        assert_eq!(facts.activity, Activity::Idle);

        let refused = parse_message(b"<CaptureStartAck Result=\"FALSE\" Reason=\"Disk full\"/>").unwrap();
        apply_status(&refused, &mut facts);
        assert_eq!(facts.activity, Activity::Fault("Disk full".to_string()));

        apply_status(&parse_message(b"<Hello/>").unwrap(), &mut facts);
        assert_eq!(facts.activity, Activity::Fault("Unknown message: Hello".to_string()));
    }

    #[test]
    fn test_valid_datagram_clears_receive_error() {
        let (tx, _rx) = crate::events::channel();
        let observer = StatusObserver {
            publisher: StatePublisher::new(DeviceId(1), tx, Arc::new(Metrics::new())),
        };
        observer.on_event(SessionEvent::Connected);
        observer.on_event(SessionEvent::Error(SessionErrorKind::Io, "reset".to_string()));
        assert_eq!(observer.publisher.state(), DeviceState::Error);

        observer.on_message(parse_message(b"<CaptureStop/>").unwrap());
        assert_eq!(observer.publisher.state(), DeviceState::Online);
        observer.on_message(parse_message(b"<CaptureStart/>").unwrap());
        assert_eq!(observer.publisher.state(), DeviceState::Recording);
    }

    #[test]
    fn test_settings_validation() {
        let base = DeviceConfig::new().with("host", "127.0.0.1").with("port", 30000);
        assert!(Settings::parse(&base).unwrap().listen.is_none());

        let listening = base.clone().with("listen_ip", "127.0.0.1").with("listen_port", 30001);
        assert_eq!(
            Settings::parse(&listening).unwrap().listen,
            Some("127.0.0.1:30001".parse().unwrap())
        );

        assert!(Settings::parse(&base.clone().with("fmt", "Bogus")).is_err());
        assert!(Settings::parse(&DeviceConfig::new().with("host", "h")).is_err());
    }
}
