//! The set of configured devices, their ids, and their persisted form.

mod factory;

pub use factory::{AdapterFactory, AdapterTable};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::{
    Command, Device, DeviceConfig, DeviceConfigError, DeviceId, DeviceStatus, NetworkSettings,
};
use crate::events::EventSender;
use crate::harvest::{HarvestTarget, SourceSettings};
use crate::observability::Metrics;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown device kind: {0}")]
    UnknownKind(String),

    #[error("device '{name}': {source}")]
    Config {
        name: String,
        #[source]
        source: DeviceConfigError,
    },

    #[error("no device with id {0}")]
    NotFound(DeviceId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid devices file: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Everything a registry needs from the process, built once at startup.
#[derive(Clone)]
pub struct RegistryContext {
    pub adapters: AdapterTable,
    pub network: NetworkSettings,
    pub events: EventSender,
    pub metrics: Arc<Metrics>,
}

impl RegistryContext {
    pub fn new(events: EventSender, metrics: Arc<Metrics>) -> Self {
        Self {
            adapters: AdapterTable::with_defaults(),
            network: NetworkSettings::default(),
            events,
            metrics,
        }
    }
}

/// Persisted `[kind, {config}]` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord(pub String, pub DeviceConfig);

impl DeviceRecord {
    pub fn kind(&self) -> &str {
        &self.0
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.1
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DevicesFile {
    devices: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Drop every current device first
    Replace,
    /// Keep current devices; skip records whose kind and name already exist
    Merge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub added: Vec<DeviceId>,
    pub skipped: Vec<SkippedEntry>,
}

pub struct DeviceRegistry {
    ctx: RegistryContext,
    devices: Vec<Device>,
    next_id: u32,
}

impl DeviceRegistry {
    pub fn new(ctx: RegistryContext) -> Self {
        Self {
            ctx,
            devices: Vec::new(),
            next_id: 1,
        }
    }

    pub fn context(&self) -> &RegistryContext {
        &self.ctx
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|device| device.id() == id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.name() == name)
    }

    fn get_mut(&mut self, id: DeviceId) -> Result<&mut Device> {
        self.devices
            .iter_mut()
            .find(|device| device.id() == id)
            .ok_or(RegistryError::NotFound(id))
    }

    /// `base`, or `base1`, `base2`, ... if another device holds it.
    fn unique_name(&self, base: &str, exclude: Option<DeviceId>) -> String {
        let taken = |name: &str| {
            self.devices
                .iter()
                .any(|d| Some(d.id()) != exclude && d.name() == name)
        };
        if !taken(base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{base}{n}"))
            .find(|name| !taken(name))
            .unwrap_or_else(|| base.to_string())
    }

    /// Construct, configure and connect a device. Only configuration
    /// problems fail; connectivity shows up in the device state.
    pub async fn add(&mut self, kind: &str, config: &DeviceConfig) -> Result<DeviceId> {
        let adapter = self.ctx.adapters.create(kind, &self.ctx.network)?;
        let base = config.name().unwrap_or(adapter.default_name()).to_string();
        let name = self.unique_name(&base, None);
        let id = DeviceId(self.next_id);

        let mut device = Device::new(
            id,
            &name,
            adapter,
            self.ctx.events.clone(),
            self.ctx.metrics.clone(),
        );
        let as_config_error = |source| RegistryError::Config {
            name: name.clone(),
            source,
        };
        device.reconfigure(&name, config).await.map_err(as_config_error)?;
        device.connect().await.map_err(as_config_error)?;

        self.next_id += 1;
        info!(device_id = %id, device = %name, kind, "Device added");
        self.devices.push(device);
        Ok(id)
    }

    pub async fn remove(&mut self, id: DeviceId) -> Result<()> {
        let index = self
            .devices
            .iter()
            .position(|device| device.id() == id)
            .ok_or(RegistryError::NotFound(id))?;
        let mut device = self.devices.remove(index);
        device.teardown().await;
        info!(device_id = %id, device = %device.name(), "Device removed");
        Ok(())
    }

    /// Tear down every device. Ids keep counting.
    pub async fn remove_all(&mut self) {
        for mut device in self.devices.drain(..) {
            device.teardown().await;
        }
    }

    /// Host command entry point; unknown names are dispatched as no-ops.
    pub async fn command(&mut self, name: &str, argument: &str) {
        self.dispatch(&Command::parse(name, argument)).await;
    }

    /// Fan a command out to every enabled device in order.
    pub async fn dispatch(&mut self, command: &Command) {
        self.ctx.metrics.command_dispatched();
        debug!(%command, devices = self.devices.len(), "Dispatching");
        for device in &mut self.devices {
            device.command(command).await;
        }
    }

    pub fn statuses(&self) -> Vec<DeviceStatus> {
        self.devices.iter().map(Device::status).collect()
    }

    /// Re-send every device's current state to the host.
    pub fn update_all(&self) {
        for device in &self.devices {
            device.publisher().announce();
        }
    }

    pub async fn refresh(&mut self, id: DeviceId) -> Result<()> {
        self.get_mut(id)?.refresh().await;
        Ok(())
    }

    pub async fn refresh_all(&mut self) {
        for device in &mut self.devices {
            device.refresh().await;
        }
    }

    pub async fn reconnect(&mut self, id: DeviceId) -> Result<()> {
        let device = self.get_mut(id)?;
        let name = device.name().to_string();
        device
            .connect()
            .await
            .map_err(|source| RegistryError::Config { name, source })
    }

    pub async fn set_enabled(&mut self, id: DeviceId, enabled: bool) -> Result<()> {
        let device = self.get_mut(id)?;
        let name = device.name().to_string();
        device
            .set_enabled(enabled)
            .await
            .map_err(|source| RegistryError::Config { name, source })
    }

    /// Apply a new config to an existing device and reconnect it. On error the
    /// device keeps its previous configuration.
    pub async fn reconfigure(&mut self, id: DeviceId, config: &DeviceConfig) -> Result<()> {
        let current = self.get(id).ok_or(RegistryError::NotFound(id))?.name().to_string();
        let name = self.unique_name(config.name().unwrap_or(&current), Some(id));
        let device = self.get_mut(id)?;
        let as_config_error = |source| RegistryError::Config {
            name: name.clone(),
            source,
        };
        device.reconfigure(&name, config).await.map_err(as_config_error)?;
        device.connect().await.map_err(as_config_error)
    }

    pub fn records(&self) -> Vec<DeviceRecord> {
        self.devices
            .iter()
            .map(|device| DeviceRecord(device.kind().to_string(), device.to_config()))
            .collect()
    }

    /// Replay records; bad entries are logged and reported, never fatal.
    pub async fn load(&mut self, records: Vec<DeviceRecord>, mode: LoadMode) -> LoadReport {
        if mode == LoadMode::Replace {
            self.remove_all().await;
        }

        let mut report = LoadReport::default();
        for (index, DeviceRecord(kind, config)) in records.into_iter().enumerate() {
            let exists = mode == LoadMode::Merge
                && self.devices.iter().any(|device| {
                    device.kind() == kind && config.name().is_some_and(|name| name == device.name())
                });
            if exists {
                debug!(index, kind = %kind, "Device already present, skipping");
                report.skipped.push(SkippedEntry {
                    index,
                    reason: "already present".to_string(),
                });
                continue;
            }
            if config.name().is_none() {
                warn!(index, kind = %kind, "Device entry has no name, using the default");
            }

            match self.add(&kind, &config).await {
                Ok(id) => report.added.push(id),
                Err(err) => {
                    warn!(index, kind = %kind, error = %err, "Skipping device entry");
                    report.skipped.push(SkippedEntry {
                        index,
                        reason: err.to_string(),
                    });
                }
            }
        }
        report
    }

    pub async fn save_file(&self, path: &Path) -> Result<()> {
        let file = DevicesFile {
            devices: self
                .records()
                .into_iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<_, _>>()?,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(&file)?).await?;
        info!(path = %path.display(), devices = self.devices.len(), "Devices saved");
        Ok(())
    }

    /// Read a devices file. A malformed entry is reported in the returned
    /// skip list; only an unreadable file or a broken envelope is an error.
    pub async fn load_file(&mut self, path: &Path, mode: LoadMode) -> Result<LoadReport> {
        let (records, malformed) = read_records(path).await?;
        let mut report = self.load(records.iter().map(|(_, r)| r.clone()).collect(), mode).await;

        // Map indices back to positions in the file.
        for skipped in &mut report.skipped {
            skipped.index = records[skipped.index].0;
        }
        report.skipped.extend(malformed);
        report.skipped.sort_by_key(|entry| entry.index);
        info!(
            path = %path.display(),
            added = report.added.len(),
            skipped = report.skipped.len(),
            "Devices loaded"
        );
        Ok(report)
    }

    /// Harvest targets for the named devices (all enabled devices when
    /// `names` is empty). Devices without a harvest source are left out.
    pub fn harvest_targets(&self, names: &[String], settings: &SourceSettings) -> Vec<HarvestTarget> {
        for name in names {
            if self.get_by_name(name).is_none() {
                warn!(device = %name, "No such device to harvest");
            }
        }

        self.devices
            .iter()
            .filter(|device| {
                if names.is_empty() {
                    device.is_enabled()
                } else {
                    names.iter().any(|name| name == device.name())
                }
            })
            .filter_map(|device| {
                let Some(spec) = device.harvest_source() else {
                    debug!(device = %device.name(), "No harvest source configured");
                    return None;
                };
                match spec.build(settings) {
                    Ok(source) => Some(HarvestTarget {
                        device_id: device.id(),
                        device_name: device.name().to_string(),
                        source,
                        formatter: device.formatter().clone(),
                    }),
                    Err(err) => {
                        warn!(device = %device.name(), error = %err, "Harvest source unavailable");
                        None
                    }
                }
            })
            .collect()
    }

    /// Registry-wide teardown; the only place ids start over.
    pub async fn teardown(&mut self) {
        self.remove_all().await;
        self.next_id = 1;
    }
}

/// Parse `{"devices": [[kind, {..}], ..]}` into records plus the entries
/// that could not be read, each tagged with its position in the file.
pub async fn read_records(
    path: &Path,
) -> Result<(Vec<(usize, DeviceRecord)>, Vec<SkippedEntry>)> {
    let text = tokio::fs::read_to_string(path).await?;
    let file: DevicesFile = serde_json::from_str(&text)?;

    let mut records = Vec::new();
    let mut malformed = Vec::new();
    for (index, entry) in file.devices.into_iter().enumerate() {
        match serde_json::from_value::<DeviceRecord>(entry) {
            Ok(record) => records.push((index, record)),
            Err(err) => {
                warn!(index, error = %err, "Malformed device entry");
                malformed.push(SkippedEntry {
                    index,
                    reason: format!("malformed entry: {err}"),
                });
            }
        }
    }
    Ok((records, malformed))
}
