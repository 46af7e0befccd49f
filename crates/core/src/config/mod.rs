use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{FacadeError, FormatBounds, Result, VideoFormat};

/// Hard ceiling on the number of devices a provider may expose.
pub const MAX_DEVICES: usize = 4;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl AppConfig {
    /// Loads a JSON configuration file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&contents).map_err(|err| {
            FacadeError::msg(format!("invalid config file {}: {err}", path.display()))
        })?;
        config.provider.validate()?;
        Ok(config)
    }
}

/// Configuration specific to the camera provider and its devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    pub provider_name: String,
    pub manufacturer: String,
    pub model: String,
    pub default_device_name: String,
    pub max_devices: usize,
    pub default_format: VideoFormat,
    /// Buffers available to the frame loop of each device.
    pub main_pool_capacity: usize,
    /// Buffers available to the relay path of each device.
    pub aux_pool_capacity: usize,
    /// Buffers allocated eagerly when a pool is built.
    pub pool_prewarm: usize,
    pub create_default_device: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_name: "Facade".to_string(),
            manufacturer: "Paal Maxima".to_string(),
            model: "Facade".to_string(),
            default_device_name: "Facade".to_string(),
            max_devices: MAX_DEVICES,
            default_format: VideoFormat::default(),
            main_pool_capacity: 64,
            aux_pool_capacity: 5,
            pool_prewarm: 1,
            create_default_device: true,
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_devices == 0 || self.max_devices > MAX_DEVICES {
            return Err(FacadeError::msg(format!(
                "maxDevices must be between 1 and {MAX_DEVICES}, got {}",
                self.max_devices
            )));
        }
        if !FormatBounds::CANONICAL.contains(&self.default_format) {
            return Err(FacadeError::msg(format!(
                "default format {} is out of bounds",
                self.default_format
            )));
        }
        if self.main_pool_capacity == 0 || self.aux_pool_capacity == 0 {
            return Err(FacadeError::msg("pool capacities must be non-zero"));
        }
        Ok(())
    }
}
