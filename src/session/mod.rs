//! Transport sessions shared by the device adapters.
//!
//! Every session owns one background task, reports connectivity through a
//! [`SessionObserver`], and shuts down through a cancellation token followed
//! by a bounded wait.

mod broadcast_xml;
mod line;
mod rendezvous;

pub use broadcast_xml::{BroadcastSettings, BroadcastXmlSession, XmlMessage, parse_message};
pub use line::{LineProtocolSession, LineSender, LineSettings, Response, ResponseAssembler};
pub use rendezvous::{RendezvousSender, RendezvousSession, RendezvousSettings};

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Classified transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionErrorKind {
    Refused,
    Timeout,
    HostNotFound,
    /// Peer closed or reset an established session
    Dropped,
    AddressInUse,
    /// Peer sent something that could not be understood
    Protocol,
    Io,
}

impl SessionErrorKind {
    /// A dropped session means the device went away, not that it is broken.
    pub fn is_disconnect(self) -> bool {
        matches!(self, SessionErrorKind::Dropped)
    }

    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => SessionErrorKind::Refused,
            io::ErrorKind::TimedOut => SessionErrorKind::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => SessionErrorKind::Dropped,
            io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable => {
                SessionErrorKind::AddressInUse
            }
            _ => SessionErrorKind::Io,
        }
    }
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionErrorKind::Refused => "Connection Refused",
            SessionErrorKind::Timeout => "Timeout",
            SessionErrorKind::HostNotFound => "Host Not Found",
            SessionErrorKind::Dropped => "Host Closed",
            SessionErrorKind::AddressInUse => "Address In Use",
            SessionErrorKind::Protocol => "Protocol Error",
            SessionErrorKind::Io => "Network Error",
        })
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{kind}: {message}")]
    Transport {
        kind: SessionErrorKind,
        message: String,
    },

    #[error("not connected")]
    NotConnected,

    #[error("no peers connected")]
    NoPeers,

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl SessionError {
    pub fn transport(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        SessionError::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> SessionErrorKind {
        match self {
            SessionError::Transport { kind, .. } => *kind,
            SessionError::NotConnected | SessionError::NoPeers => SessionErrorKind::Dropped,
            SessionError::Malformed(_) => SessionErrorKind::Protocol,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        SessionError::transport(SessionErrorKind::classify(&err), err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Connectivity notifications emitted by a session task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected(String),
    Error(SessionErrorKind, String),
}

/// Receives session callbacks. Called from the session task, so
/// implementations must not block.
pub trait SessionObserver<M>: Send + Sync + 'static {
    fn on_event(&self, event: SessionEvent);
    fn on_message(&self, message: M);
}

/// Cancel, wait up to `wait` for the task to wind down, then abort it.
pub(crate) async fn stop_task<T>(
    cancel: &CancellationToken,
    handle: Option<JoinHandle<T>>,
    wait: Duration,
) {
    cancel.cancel();
    let Some(mut handle) = handle else {
        return;
    };
    if tokio::time::timeout(wait, &mut handle).await.is_err() {
        warn!(wait_ms = wait.as_millis() as u64, "Session task did not stop in time, aborting");
        handle.abort();
        let _ = handle.await;
    }
}
