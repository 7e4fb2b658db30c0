//! Events published to the host: device state changes and harvest progress.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::device::{DeviceId, DeviceState};
use crate::harvest::FileStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    StateChanged {
        device_id: DeviceId,
        state: DeviceState,
        info: String,
    },
    FileTransfer {
        device_id: DeviceId,
        local_name: String,
        status: FileStatus,
        error: Option<String>,
    },
    JobFinished {
        device_id: DeviceId,
        copied: usize,
        skipped: usize,
        failed: usize,
        error: Option<String>,
    },
}

impl Event {
    pub fn device_id(&self) -> DeviceId {
        match self {
            Event::StateChanged { device_id, .. }
            | Event::FileTransfer { device_id, .. }
            | Event::JobFinished { device_id, .. } => *device_id,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
