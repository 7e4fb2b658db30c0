use std::collections::BTreeMap;

use super::RegistryError;
use crate::device::{Blade, DeviceAdapter, HyperDeck, NetworkSettings, XmlUdp};

pub type AdapterFactory = fn(&NetworkSettings) -> Box<dyn DeviceAdapter>;

/// Maps a persisted `kind` tag to the adapter that speaks it.
#[derive(Clone, Default)]
pub struct AdapterTable {
    factories: BTreeMap<String, AdapterFactory>,
}

impl AdapterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, factory: AdapterFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn create(
        &self,
        kind: &str,
        network: &NetworkSettings,
    ) -> Result<Box<dyn DeviceAdapter>, RegistryError> {
        self.factories
            .get(kind)
            .map(|factory| factory(network))
            .ok_or_else(|| RegistryError::UnknownKind(kind.to_string()))
    }

    pub fn has_kind(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Every built-in adapter.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register("hyperdeck", hyperdeck);
        table.register("xmludp", xml_udp);
        table.register("blade", blade);
        table
    }
}

fn hyperdeck(network: &NetworkSettings) -> Box<dyn DeviceAdapter> {
    Box::new(HyperDeck::new(network))
}

fn xml_udp(network: &NetworkSettings) -> Box<dyn DeviceAdapter> {
    Box::new(XmlUdp::new(network))
}

fn blade(network: &NetworkSettings) -> Box<dyn DeviceAdapter> {
    Box::new(Blade::new(network))
}
