use serde::{Deserialize, Serialize};
use std::fmt;

use crate::session::{SessionErrorKind, SessionEvent};

/// Externally visible device status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Offline,
    Online,
    Recording,
    Playing,
    Error,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceState::Offline => "OFFLINE",
            DeviceState::Online => "ONLINE",
            DeviceState::Recording => "RECORDING",
            DeviceState::Playing => "PLAYING",
            DeviceState::Error => "ERROR",
        })
    }
}

/// Transport connectivity as last reported by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    /// No session, or the peer went away. Carries a reason for display.
    Down(String),
    Up,
    Failed {
        kind: SessionErrorKind,
        diagnostic: String,
    },
}

impl Default for Link {
    fn default() -> Self {
        Link::Down(String::new())
    }
}

/// What the device protocol last told us it is doing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Activity {
    #[default]
    Idle,
    Recording,
    Playing,
    /// Device reported a problem in-band
    Fault(String),
}

/// Raw inputs the visible state is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFacts {
    pub link: Link,
    pub activity: Activity,
    /// Unrecoverable error raised by the adapter itself
    pub local_error: Option<String>,
    /// Free-form status text shown while healthy
    pub detail: String,
}

impl DeviceFacts {
    /// Fold a session notification into the facts. Losing the session always
    /// resets activity so a dropped recorder never reads as RECORDING.
    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Connected => {
                self.link = Link::Up;
                self.local_error = None;
            }
            SessionEvent::Disconnected(reason) => {
                self.link = Link::Down(reason.clone());
                self.activity = Activity::Idle;
            }
            SessionEvent::Error(kind, message) => {
                self.link = if kind.is_disconnect() {
                    Link::Down(kind.to_string())
                } else {
                    Link::Failed {
                        kind: *kind,
                        diagnostic: match kind {
                            SessionErrorKind::Protocol => message.clone(),
                            _ => kind.to_string(),
                        },
                    }
                };
                self.activity = Activity::Idle;
            }
        }
    }
}

/// Derive `(state, info)`. First match wins: disabled, local error,
/// connectivity, device activity, then plain ONLINE. Info always comes from
/// the branch that produced the state.
pub fn resolve(enabled: bool, facts: &DeviceFacts) -> (DeviceState, String) {
    if !enabled {
        return (DeviceState::Offline, String::new());
    }
    if let Some(error) = &facts.local_error {
        return (DeviceState::Error, error.clone());
    }
    match &facts.link {
        Link::Down(reason) => return (DeviceState::Offline, reason.clone()),
        Link::Failed { diagnostic, .. } => return (DeviceState::Error, diagnostic.clone()),
        Link::Up => {}
    }
    match &facts.activity {
        Activity::Recording => (DeviceState::Recording, facts.detail.clone()),
        Activity::Playing => (DeviceState::Playing, facts.detail.clone()),
        Activity::Fault(reason) => (DeviceState::Error, reason.clone()),
        Activity::Idle => (DeviceState::Online, facts.detail.clone()),
    }
}
