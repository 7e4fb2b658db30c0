use super::models::{Config, HarvestConfig, NetworkConfig, RegistryConfig};
use thiserror::Error;

const MAX_CHUNK_BYTES: u64 = 64 * 1024 * 1024; // 64 MB

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} must be positive")]
    ZeroDuration { field: &'static str },

    #[error("harvest chunk_size must be positive")]
    ZeroChunkSize,

    #[error("harvest chunk_size ({actual}) exceeds limit of 64MB ({limit})")]
    ChunkSizeExceedsLimit { actual: u64, limit: u64 },

    #[error("harvest root must not be empty")]
    EmptyHarvestRoot,

    #[error("registry devices_file must not be empty")]
    EmptyDevicesFile,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_network(&config.network)?;
    validate_harvest(&config.harvest)?;
    validate_registry(&config.registry)?;
    Ok(())
}

fn positive(field: &'static str, value: u64) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::ZeroDuration { field });
    }
    Ok(())
}

fn validate_network(network: &NetworkConfig) -> Result<(), ValidationError> {
    positive("network.connect_timeout_ms", network.connect_timeout_ms)?;
    positive("network.reconnect_interval_ms", network.reconnect_interval_ms)?;
    positive("network.advertise_interval_ms", network.advertise_interval_ms)?;
    positive("network.teardown_wait_ms", network.teardown_wait_ms)?;
    Ok(())
}

fn validate_harvest(harvest: &HarvestConfig) -> Result<(), ValidationError> {
    if harvest.root.as_os_str().is_empty() {
        return Err(ValidationError::EmptyHarvestRoot);
    }

    let chunk = harvest.chunk_size.as_u64();
    if chunk == 0 {
        return Err(ValidationError::ZeroChunkSize);
    }
    if chunk > MAX_CHUNK_BYTES {
        return Err(ValidationError::ChunkSizeExceedsLimit {
            actual: chunk,
            limit: MAX_CHUNK_BYTES,
        });
    }

    positive("harvest.connect_timeout_ms", harvest.connect_timeout_ms)?;
    positive("harvest.request_timeout_ms", harvest.request_timeout_ms)?;
    positive("harvest.cancel_wait_ms", harvest.cancel_wait_ms)?;
    positive("harvest.progress_interval_ms", harvest.progress_interval_ms)?;
    Ok(())
}

fn validate_registry(registry: &RegistryConfig) -> Result<(), ValidationError> {
    if registry.devices_file.as_os_str().is_empty() {
        return Err(ValidationError::EmptyDevicesFile);
    }
    positive("registry.refresh_interval_ms", registry.refresh_interval_ms)?;
    Ok(())
}
