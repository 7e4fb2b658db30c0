//! Single publish point for device state.
//!
//! Adapters and their session callbacks only ever mutate [`DeviceFacts`];
//! the visible state is derived from those facts and published here. Deriving
//! never performs I/O and publishing never calls back into an adapter, so a
//! publish cannot re-enter a state computation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use super::DeviceId;
use super::state::{DeviceFacts, DeviceState, resolve};
use crate::events::{Event, EventSender};
use crate::observability::Metrics;

#[derive(Clone)]
pub struct StatePublisher {
    inner: Arc<Inner>,
}

struct Inner {
    device_id: DeviceId,
    enabled: AtomicBool,
    facts: Mutex<DeviceFacts>,
    last: Mutex<Option<(DeviceState, String)>>,
    events: EventSender,
    metrics: Arc<Metrics>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StatePublisher {
    pub fn new(device_id: DeviceId, events: EventSender, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                device_id,
                enabled: AtomicBool::new(true),
                facts: Mutex::new(DeviceFacts::default()),
                last: Mutex::new(None),
                events,
                metrics,
            }),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
        self.refresh();
    }

    pub fn facts(&self) -> DeviceFacts {
        lock(&self.inner.facts).clone()
    }

    /// Mutate the facts, then publish whatever state they now imply.
    pub fn update<R>(&self, change: impl FnOnce(&mut DeviceFacts) -> R) -> R {
        let result = change(&mut lock(&self.inner.facts));
        self.refresh();
        result
    }

    /// Derived `(state, info)`. Pure read.
    pub fn snapshot(&self) -> (DeviceState, String) {
        resolve(self.is_enabled(), &lock(&self.inner.facts))
    }

    pub fn state(&self) -> DeviceState {
        self.snapshot().0
    }

    pub fn info(&self) -> String {
        self.snapshot().1
    }

    /// Recompute and publish if anything changed.
    pub fn refresh(&self) {
        let mut last = lock(&self.inner.last);
        let (state, info) = self.snapshot();
        self.publish_locked(&mut last, state, info);
    }

    /// Publish an explicit state. Repeats are suppressed and a disabled
    /// device always publishes OFFLINE.
    pub fn update_state(&self, state: DeviceState, info: impl Into<String>) {
        let mut last = lock(&self.inner.last);
        let (state, info) = if self.is_enabled() {
            (state, info.into())
        } else {
            (DeviceState::Offline, String::new())
        };
        self.publish_locked(&mut last, state, info);
    }

    /// Re-send the current state even if unchanged.
    pub fn announce(&self) {
        let mut last = lock(&self.inner.last);
        let (state, info) = self.snapshot();
        *last = None;
        self.publish_locked(&mut last, state, info);
    }

    fn publish_locked(
        &self,
        last: &mut Option<(DeviceState, String)>,
        state: DeviceState,
        info: String,
    ) {
        if last.as_ref().is_some_and(|(s, i)| *s == state && *i == info) {
            return;
        }
        info!(device_id = %self.inner.device_id, %state, info = %info, "Device state changed");
        *last = Some((state, info.clone()));
        self.inner.metrics.state_changed();
        // The host may have hung up during shutdown; nothing to do then.
        let _ = self.inner.events.send(Event::StateChanged {
            device_id: self.inner.device_id,
            state,
            info,
        });
    }
}
