//! USB host configuration
//!
//! ```toml
//! log_level = "info"
//!
//! [session]
//! id_ceiling = 128
//! io_queue_depth = 64
//! sync_timeout_ms = 1000
//!
//! [[match_rules]]
//! module = "usb_ecm"
//! service = "ecm_service"
//! match_attr = "ecm_attr"
//! flags = ["int_class"]
//! interface_class = [0x02, 0x0A]
//! ```

use crate::ids::DEFAULT_ID_CEILING;
use crate::pnp::{InterfaceList, MatchFlags, MatchRule};
use anyhow::{Context, Result, anyhow};
use protocol::USB_PNP_INFO_MAX_INTERFACES;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "HostConfig::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub match_rules: Vec<MatchRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Object ids wrap at this value
    #[serde(default = "SessionSettings::default_id_ceiling")]
    pub id_ceiling: u32,
    #[serde(default = "SessionSettings::default_io_queue_depth")]
    pub io_queue_depth: usize,
    /// Limit for synchronous submissions; unset waits forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_timeout_ms: Option<u64>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            id_ceiling: Self::default_id_ceiling(),
            io_queue_depth: Self::default_io_queue_depth(),
            sync_timeout_ms: None,
        }
    }
}

impl SessionSettings {
    fn default_id_ceiling() -> u32 {
        DEFAULT_ID_CEILING
    }

    fn default_io_queue_depth() -> usize {
        64
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        self.sync_timeout_ms.map(Duration::from_millis)
    }
}

/// A match rule as written in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchRuleConfig {
    pub module: String,
    pub service: String,
    #[serde(default)]
    pub match_attr: String,
    /// Flag names, e.g. `["vendor", "int_class"]`
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub vendor_id: u16,
    #[serde(default)]
    pub product_id: u16,
    #[serde(default)]
    pub bcd_device_low: u16,
    #[serde(default)]
    pub bcd_device_high: u16,
    #[serde(default)]
    pub device_class: u8,
    #[serde(default)]
    pub device_subclass: u8,
    #[serde(default)]
    pub device_protocol: u8,
    #[serde(default)]
    pub interface_class: Vec<u8>,
    #[serde(default)]
    pub interface_subclass: Vec<u8>,
    #[serde(default)]
    pub interface_protocol: Vec<u8>,
    #[serde(default)]
    pub interface_number: Vec<u8>,
}

impl MatchRuleConfig {
    /// Build the runtime rule; unflagged interface lists start empty
    pub fn to_rule(&self) -> Result<MatchRule> {
        let flags = MatchFlags::from_names(self.flags.as_slice())
            .map_err(|e| anyhow!("Rule '{}': {}", self.module, e))?;
        let list = |flag: MatchFlags, values: &[u8]| {
            if flags.contains(flag) {
                InterfaceList::new(values.to_vec())
            } else {
                InterfaceList::default()
            }
        };

        Ok(MatchRule {
            module_name: self.module.clone(),
            service_name: self.service.clone(),
            match_attr: self.match_attr.clone(),
            flags,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            bcd_device_low: self.bcd_device_low,
            bcd_device_high: self.bcd_device_high,
            device_class: self.device_class,
            device_subclass: self.device_subclass,
            device_protocol: self.device_protocol,
            interface_class: list(MatchFlags::INT_CLASS, &self.interface_class),
            interface_subclass: list(MatchFlags::INT_SUBCLASS, &self.interface_subclass),
            interface_protocol: list(MatchFlags::INT_PROTOCOL, &self.interface_protocol),
            interface_number: list(MatchFlags::INT_NUMBER, &self.interface_number),
            ..Default::default()
        })
    }

    fn validate(&self) -> Result<()> {
        if self.module.is_empty() || self.service.is_empty() {
            return Err(anyhow!("Match rule needs a module and a service name"));
        }
        let flags = MatchFlags::from_names(self.flags.as_slice())
            .map_err(|e| anyhow!("Rule '{}': {}", self.module, e))?;

        for (flag, name, values) in [
            (MatchFlags::INT_CLASS, "interface_class", &self.interface_class),
            (MatchFlags::INT_SUBCLASS, "interface_subclass", &self.interface_subclass),
            (MatchFlags::INT_PROTOCOL, "interface_protocol", &self.interface_protocol),
            (MatchFlags::INT_NUMBER, "interface_number", &self.interface_number),
        ] {
            if values.len() > USB_PNP_INFO_MAX_INTERFACES {
                return Err(anyhow!(
                    "Rule '{}': {} holds {} values, at most {}",
                    self.module,
                    name,
                    values.len(),
                    USB_PNP_INFO_MAX_INTERFACES
                ));
            }
            if flags.contains(flag) && values.is_empty() {
                return Err(anyhow!(
                    "Rule '{}': {} is flagged but empty",
                    self.module,
                    name
                ));
            }
        }

        if flags.contains(MatchFlags::DEV_LOW)
            && flags.contains(MatchFlags::DEV_HIGH)
            && self.bcd_device_low > self.bcd_device_high
        {
            return Err(anyhow!(
                "Rule '{}': bcd_device_low {:#06x} above bcd_device_high {:#06x}",
                self.module,
                self.bcd_device_low,
                self.bcd_device_high
            ));
        }
        Ok(())
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            session: SessionSettings::default(),
            match_rules: Vec::new(),
        }
    }
}

impl HostConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Load configuration from file or default location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/hdf-io-core/usb-host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded USB host configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or fall back to defaults
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved USB host configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("hdf-io-core").join("usb-host.toml")
        } else {
            PathBuf::from(".config/hdf-io-core/usb-host.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.session.id_ceiling == 0 {
            return Err(anyhow!("session.id_ceiling must be at least 1"));
        }
        if self.session.io_queue_depth == 0 {
            return Err(anyhow!("session.io_queue_depth must be at least 1"));
        }

        for rule in &self.match_rules {
            rule.validate()?;
        }
        Ok(())
    }

    /// Runtime rules in file order
    pub fn to_rules(&self) -> Result<Vec<MatchRule>> {
        self.match_rules.iter().map(MatchRuleConfig::to_rule).collect()
    }
}

/// Load configuration from a path, expanding `~`
pub fn load_config(path: &str) -> Result<HostConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    HostConfig::load(Some(path_buf))
}
