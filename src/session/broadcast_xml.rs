//! Fire-and-forget XML datagrams, with an optional listener for device replies.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::reader::Reader;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Result, SessionError, SessionErrorKind, SessionEvent, SessionObserver, stop_task};

const MAX_DATAGRAM: usize = 64 * 1024;
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    pub host: String,
    pub port: u16,
    pub broadcast: bool,
    /// Bind here and surface inbound datagrams; sends also leave from this socket.
    pub listen: Option<SocketAddr>,
    pub teardown_wait: Duration,
}

/// Root element of a datagram plus its direct children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlMessage {
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<XmlMessage>,
}

impl XmlMessage {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn child(&self, tag: &str) -> Option<&XmlMessage> {
        self.children.iter().find(|child| child.tag == tag)
    }

    /// `VALUE` attribute of the named child, the convention capture software uses.
    pub fn child_value(&self, tag: &str) -> Option<&str> {
        self.child(tag)?.attribute("VALUE")
    }
}

pub fn parse_message(data: &[u8]) -> Result<XmlMessage> {
    let text = std::str::from_utf8(data)
        .map_err(|err| SessionError::Malformed(err.to_string()))?
        .trim_matches(|c: char| c == '\0' || c.is_whitespace());

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut root: Option<XmlMessage> = None;
    let mut depth = 0usize;
    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(start)) => {
                attach(&mut root, depth, element(&start)?);
                depth += 1;
            }
            Ok(XmlEvent::Empty(start)) => {
                attach(&mut root, depth, element(&start)?);
                if depth == 0 {
                    break;
                }
            }
            Ok(XmlEvent::End(_)) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    break;
                }
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(SessionError::Malformed(err.to_string())),
        }
    }

    root.ok_or_else(|| SessionError::Malformed("no root element".to_string()))
}

fn attach(root: &mut Option<XmlMessage>, depth: usize, element: XmlMessage) {
    match depth {
        0 => *root = Some(element),
        1 => {
            if let Some(parent) = root.as_mut() {
                parent.children.push(element);
            }
        }
        _ => {}
    }
}

fn element(start: &BytesStart<'_>) -> Result<XmlMessage> {
    let mut attributes = BTreeMap::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|err| SessionError::Malformed(err.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|err| SessionError::Malformed(err.to_string()))?;
        attributes.insert(
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            value.into_owned(),
        );
    }
    Ok(XmlMessage {
        tag: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
        attributes,
        children: Vec::new(),
    })
}

pub struct BroadcastXmlSession {
    socket: Arc<UdpSocket>,
    target: String,
    listening: bool,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    teardown_wait: Duration,
}

impl BroadcastXmlSession {
    /// Bind the socket and, when a listen address is set, start the receive loop.
    pub async fn open(
        settings: BroadcastSettings,
        observer: Arc<dyn SessionObserver<XmlMessage>>,
    ) -> Result<Self> {
        let bind = settings
            .listen
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        socket.set_broadcast(settings.broadcast)?;

        let cancel = CancellationToken::new();
        let task = settings.listen.map(|addr| {
            info!(%addr, "Listening for device datagrams");
            tokio::spawn(listen(socket.clone(), observer.clone(), cancel.clone()))
        });
        observer.on_event(SessionEvent::Connected);

        Ok(Self {
            socket,
            target: format!("{}:{}", settings.host, settings.port),
            listening: settings.listen.is_some(),
            cancel,
            task,
            teardown_wait: settings.teardown_wait,
        })
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    pub async fn send(&self, message: &str) -> Result<()> {
        let sent = self
            .socket
            .send_to(message.as_bytes(), self.target.as_str())
            .await?;
        if sent != message.len() {
            return Err(SessionError::transport(
                SessionErrorKind::Io,
                format!("short datagram: {sent} of {} bytes", message.len()),
            ));
        }
        debug!(to = %self.target, bytes = sent, "Datagram sent");
        Ok(())
    }

    pub async fn close(&mut self) {
        stop_task(&self.cancel, self.task.take(), self.teardown_wait).await;
    }
}

impl Drop for BroadcastXmlSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn listen(
    socket: Arc<UdpSocket>,
    observer: Arc<dyn SessionObserver<XmlMessage>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((len, from)) => match parse_message(&buf[..len]) {
                Ok(message) => {
                    debug!(%from, tag = %message.tag, "Datagram received");
                    observer.on_message(message);
                }
                Err(err) => {
                    warn!(%from, error = %err, "Unreadable datagram");
                    observer.on_event(SessionEvent::Error(SessionErrorKind::Protocol, err.to_string()));
                }
            },
            Err(err) => {
                let kind = SessionErrorKind::classify(&err);
                warn!(%kind, error = %err, "Receive failed");
                observer.on_event(SessionEvent::Error(kind, err.to_string()));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECEIVE_ERROR_PAUSE) => {}
                }
            }
        }
    }
    debug!("Datagram listener stopped");
}
