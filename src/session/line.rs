//! Newline-delimited request/response session over TCP with automatic reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, lookup_host};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Result, SessionError, SessionErrorKind, SessionEvent, SessionObserver, stop_task};

const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct LineSettings {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub teardown_wait: Duration,
}

/// One complete reply: a `NNN text` status line plus any body lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: Option<u16>,
    pub text: String,
    pub lines: Vec<String>,
}

impl Response {
    /// Value of a `key: value` body line.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let (k, v) = line.split_once(':')?;
            (k.trim() == key).then(|| v.trim())
        })
    }
}

/// Groups raw lines into responses. A status line ending in `:` opens a
/// multi-line body that runs until the next blank line.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    pending: Option<Response>,
}

impl ResponseAssembler {
    pub fn push(&mut self, line: &str) -> Option<Response> {
        let line = line.trim();

        if let Some(mut pending) = self.pending.take() {
            if line.is_empty() {
                return Some(pending);
            }
            if let (Some(_), _) = split_status(line) {
                debug!(code = ?pending.code, "Unterminated response body dropped");
            } else {
                pending.lines.push(line.to_string());
                self.pending = Some(pending);
                return None;
            }
        }

        if line.is_empty() {
            return None;
        }

        let (code, text) = split_status(line);
        let response = Response {
            code,
            text: text.to_string(),
            lines: Vec::new(),
        };
        if text.ends_with(':') {
            self.pending = Some(response);
            None
        } else {
            Some(response)
        }
    }
}

fn split_status(line: &str) -> (Option<u16>, &str) {
    let bytes = line.as_bytes();
    if bytes.len() >= 4 && bytes[..3].iter().all(u8::is_ascii_digit) && bytes[3] == b' ' {
        (line[..3].parse().ok(), &line[4..])
    } else {
        (None, line)
    }
}

struct Shared {
    connected: AtomicBool,
    reconnect: Notify,
}

/// Cloneable handle for writing to a session from callbacks and tasks.
#[derive(Clone)]
pub struct LineSender {
    outbound: mpsc::UnboundedSender<String>,
    shared: Arc<Shared>,
}

impl LineSender {
    /// Queue one line. With no live connection the message is dropped and a
    /// reconnect attempt is requested instead.
    pub fn send(&self, message: &str) -> Result<()> {
        if !self.is_connected() {
            self.shared.reconnect.notify_one();
            return Err(SessionError::NotConnected);
        }
        let mut line = message.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.outbound
            .send(line)
            .map_err(|_| SessionError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

pub struct LineProtocolSession {
    settings: LineSettings,
    sender: LineSender,
    outbound_rx: Option<mpsc::UnboundedReceiver<String>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LineProtocolSession {
    pub fn new(settings: LineSettings) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            sender: LineSender {
                outbound,
                shared: Arc::new(Shared {
                    connected: AtomicBool::new(false),
                    reconnect: Notify::new(),
                }),
            },
            outbound_rx: Some(outbound_rx),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn sender(&self) -> LineSender {
        self.sender.clone()
    }

    /// Start the connect/read loop. A session opens once.
    pub fn open(&mut self, observer: Arc<dyn SessionObserver<Response>>) {
        let Some(outbound_rx) = self.outbound_rx.take() else {
            warn!(host = %self.settings.host, "Line session already opened");
            return;
        };
        self.task = Some(tokio::spawn(run(
            self.settings.clone(),
            self.sender.shared.clone(),
            observer,
            outbound_rx,
            self.cancel.clone(),
        )));
    }

    pub fn send(&self, message: &str) -> Result<()> {
        self.sender.send(message)
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_connected()
    }

    pub async fn close(&mut self) {
        self.sender.shared.connected.store(false, Ordering::Release);
        stop_task(&self.cancel, self.task.take(), self.settings.teardown_wait).await;
    }
}

impl Drop for LineProtocolSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    settings: LineSettings,
    shared: Arc<Shared>,
    observer: Arc<dyn SessionObserver<Response>>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        // Anything queued for a previous connection is stale.
        while outbound.try_recv().is_ok() {}

        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = connect(&settings) => attempt,
        };

        match attempt {
            Ok(stream) => {
                info!(host = %settings.host, port = settings.port, "Session connected");
                shared.connected.store(true, Ordering::Release);
                observer.on_event(SessionEvent::Connected);

                let exit = pump(stream, observer.as_ref(), &mut outbound, &cancel).await;
                shared.connected.store(false, Ordering::Release);

                match exit {
                    PumpExit::Cancelled => break,
                    PumpExit::Closed => {
                        info!(host = %settings.host, "Session closed by peer");
                        observer.on_event(SessionEvent::Disconnected("Disconnected".to_string()));
                    }
                    PumpExit::Failed(kind, message) => {
                        warn!(host = %settings.host, %kind, %message, "Session failed");
                        observer.on_event(SessionEvent::Error(kind, message));
                    }
                }
            }
            Err(err) => {
                debug!(host = %settings.host, port = settings.port, error = %err, "Connect failed");
                observer.on_event(SessionEvent::Error(err.kind(), err.to_string()));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.reconnect_interval) => {}
            _ = shared.reconnect.notified() => {}
        }
    }
    shared.connected.store(false, Ordering::Release);
    debug!(host = %settings.host, "Line session task stopped");
}

async fn connect(settings: &LineSettings) -> Result<TcpStream> {
    let target = format!("{}:{}", settings.host, settings.port);
    let addr = match timeout(settings.connect_timeout, lookup_host(target.as_str())).await {
        Ok(Ok(mut addrs)) => addrs.next().ok_or_else(|| {
            SessionError::transport(SessionErrorKind::HostNotFound, format!("{target} has no address"))
        })?,
        Ok(Err(err)) => {
            return Err(SessionError::transport(SessionErrorKind::HostNotFound, err.to_string()));
        }
        Err(_) => return Err(SessionError::transport(SessionErrorKind::Timeout, "address lookup")),
    };

    match timeout(settings.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            if let Err(err) = stream.set_nodelay(true) {
                debug!(error = %err, "Could not set TCP_NODELAY");
            }
            Ok(stream)
        }
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(SessionError::transport(
            SessionErrorKind::Timeout,
            format!("connect to {addr}"),
        )),
    }
}

pub(crate) enum PumpExit {
    Cancelled,
    Closed,
    Failed(SessionErrorKind, String),
}

/// Shuttle lines both ways on one established connection until it ends.
pub(crate) async fn pump(
    stream: TcpStream,
    observer: &dyn SessionObserver<Response>,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> PumpExit {
    let (read, mut write) = stream.into_split();
    let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut assembler = ResponseAssembler::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.shutdown().await;
                return PumpExit::Cancelled;
            }
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    debug!(line = %line, "Received");
                    if let Some(response) = assembler.push(&line) {
                        observer.on_message(response);
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(limit = MAX_LINE_LENGTH, "Oversized line discarded");
                }
                Some(Err(LinesCodecError::Io(err))) => {
                    return PumpExit::Failed(SessionErrorKind::classify(&err), err.to_string());
                }
                None => return PumpExit::Closed,
            },
            message = outbound.recv() => match message {
                Some(message) => {
                    debug!(line = %message.trim_end(), "Sending");
                    if let Err(err) = write.write_all(message.as_bytes()).await {
                        return PumpExit::Failed(SessionErrorKind::classify(&err), err.to_string());
                    }
                }
                None => return PumpExit::Cancelled,
            },
        }
    }
}
