//! Bridge configuration
//!
//! Loads and saves bridge config files (JSON format)

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use midibridge_platform::{EndpointSpec, MemoryBackend, FIRST_UNIQUE_ID};
use midibridge_policy::{Policy, DEFAULT_MAX_MESSAGE_LEN};

/// Config file schema version
pub const CONFIG_VERSION: u32 = 1;

/// A bridge config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Schema version
    pub version: u32,
    /// Sandbox limits for the script
    pub script: ScriptLimits,
    /// What scripts may do with their handles
    pub policy: PolicyConfig,
    /// Devices present on the in-memory backend at startup
    pub devices: Vec<DeviceConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            script: ScriptLimits::default(),
            policy: PolicyConfig::default(),
            devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptLimits {
    pub timeout_ms: u64,
    pub memory_limit: usize,
    pub max_sleep_ms: u64,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            memory_limit: 64 * 1024 * 1024,
            max_sleep_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub allow_sysex: bool,
    pub max_message_len: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allow_sysex: false,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

/// One simulated device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub inputs: Vec<PortConfig>,
    #[serde(default)]
    pub outputs: Vec<PortConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub name: String,
    /// Native unique id; assigned automatically when absent
    #[serde(default)]
    pub id: Option<i32>,
}

impl BridgeConfig {
    /// Load a config from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;

        let config: Self =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.as_ref().display().to_string(),
                error: e.to_string(),
            })?;

        if config.version > CONFIG_VERSION {
            return Err(ConfigError::VersionMismatch {
                file_version: config.version,
                supported_version: CONFIG_VERSION,
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Save the config to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::SerializeError {
                error: e.to_string(),
            })?;

        fs::write(path.as_ref(), content).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;

        Ok(())
    }

    /// Explicit port ids must be unique across all devices
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for id in self.ports().filter_map(|p| p.id) {
            if !seen.insert(id) {
                return Err(ConfigError::DuplicatePortId { id });
            }
        }
        Ok(())
    }

    fn ports(&self) -> impl Iterator<Item = &PortConfig> {
        self.devices
            .iter()
            .flat_map(|d| d.inputs.iter().chain(d.outputs.iter()))
    }

    pub fn to_policy(&self) -> Policy {
        let mut policy = Policy::new();
        policy.set_allow_sysex(self.policy.allow_sysex);
        policy.set_max_message_len(self.policy.max_message_len);
        policy
    }

    /// In-memory backend with every configured device plugged in
    ///
    /// Ports without an id get the lowest free id from `FIRST_UNIQUE_ID` up,
    /// skipping every explicit id in the file.
    pub fn build_backend(&self) -> MemoryBackend {
        let mut taken: BTreeSet<i32> = self.ports().filter_map(|p| p.id).collect();
        let mut next = FIRST_UNIQUE_ID;
        let mut assign = move |port: &PortConfig| {
            port.id.unwrap_or_else(|| {
                while taken.contains(&next) {
                    next += 1;
                }
                taken.insert(next);
                next
            })
        };

        let backend = MemoryBackend::new();
        for device in &self.devices {
            let mut endpoint = |port: &PortConfig| {
                let mut endpoint = EndpointSpec::named(port.name.clone()).with_id(assign(port));
                if let Some(manufacturer) = &device.manufacturer {
                    endpoint = endpoint.with_manufacturer(manufacturer.clone());
                }
                endpoint
            };
            let inputs = device.inputs.iter().map(&mut endpoint).collect();
            let outputs = device.outputs.iter().map(&mut endpoint).collect();
            backend.plug(device.name.clone(), inputs, outputs);
            tracing::debug!(
                device = %device.name,
                inputs = device.inputs.len(),
                outputs = device.outputs.len(),
                "Plugged configured device"
            );
        }
        backend
    }
}

/// Config-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {error}")]
    Io { path: String, error: String },

    #[error("Parse error in {path}: {error}")]
    ParseError { path: String, error: String },

    #[error("Serialization error: {error}")]
    SerializeError { error: String },

    #[error("Version mismatch: file is v{file_version}, we support up to v{supported_version}")]
    VersionMismatch {
        file_version: u32,
        supported_version: u32,
    },

    #[error("Port id {id} is configured more than once")]
    DuplicatePortId { id: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use midibridge_platform::MidiBackend;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn studio() -> BridgeConfig {
        BridgeConfig {
            devices: vec![DeviceConfig {
                name: "Synth".into(),
                manufacturer: Some("Acme".into()),
                inputs: vec![PortConfig {
                    name: "Synth Keys".into(),
                    id: Some(10),
                }],
                outputs: vec![PortConfig {
                    name: "Synth Sound".into(),
                    id: None,
                }],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_config_save_load() {
        let mut config = studio();
        config.policy.allow_sysex = true;
        config.script.timeout_ms = 1_000;

        let temp = NamedTempFile::new().unwrap();
        config.save(temp.path()).unwrap();

        let loaded = BridgeConfig::load(temp.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_sections_default() {
        let temp = NamedTempFile::new().unwrap();
        writeln!(temp.as_file(), r#"{{"policy": {{"allow_sysex": true}}}}"#).unwrap();

        let loaded = BridgeConfig::load(temp.path()).unwrap();
        assert_eq!(loaded.version, CONFIG_VERSION);
        assert!(loaded.policy.allow_sysex);
        assert_eq!(loaded.policy.max_message_len, DEFAULT_MAX_MESSAGE_LEN);
        assert_eq!(loaded.script, ScriptLimits::default());
        assert!(loaded.devices.is_empty());
    }

    #[test]
    fn test_version_mismatch() {
        let temp = NamedTempFile::new().unwrap();
        writeln!(temp.as_file(), r#"{{"version": 999}}"#).unwrap();

        let result = BridgeConfig::load(temp.path());
        assert!(matches!(result, Err(ConfigError::VersionMismatch { .. })));
    }

    #[test]
    fn test_duplicate_port_id() {
        let mut config = studio();
        config.devices[0].outputs[0].id = Some(10);

        let temp = NamedTempFile::new().unwrap();
        config.save(temp.path()).unwrap();

        let result = BridgeConfig::load(temp.path());
        assert!(matches!(result, Err(ConfigError::DuplicatePortId { id: 10 })));
    }

    #[test]
    fn test_missing_file() {
        let result = BridgeConfig::load("/nonexistent/midibridge.json");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_build_backend() {
        let backend = studio().build_backend();
        let devices = backend.devices().unwrap();
        assert_eq!(devices.len(), 1);

        let keys = devices[0].sources[0];
        assert_eq!(backend.unique_id(keys).unwrap(), 10);
        assert_eq!(
            backend
                .string_property(keys, midibridge_platform::Property::Manufacturer)
                .unwrap()
                .as_deref(),
            Some("Acme")
        );
    }

    #[test]
    fn test_assigned_ids_avoid_explicit_ones() {
        let config = BridgeConfig {
            devices: vec![
                DeviceConfig {
                    name: "Pads".into(),
                    manufacturer: None,
                    inputs: vec![
                        PortConfig {
                            name: "Pad A".into(),
                            id: None,
                        },
                        PortConfig {
                            name: "Pad B".into(),
                            id: Some(FIRST_UNIQUE_ID),
                        },
                    ],
                    outputs: vec![],
                },
                DeviceConfig {
                    name: "Synth".into(),
                    manufacturer: None,
                    inputs: vec![],
                    outputs: vec![PortConfig {
                        name: "Synth".into(),
                        id: Some(FIRST_UNIQUE_ID + 1),
                    }],
                },
            ],
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let backend = config.build_backend();
        let mut ids: Vec<i32> = backend
            .devices()
            .unwrap()
            .iter()
            .flat_map(|d| d.sources.iter().chain(d.destinations.iter()).copied())
            .map(|e| backend.unique_id(e).unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(
            ids,
            vec![FIRST_UNIQUE_ID, FIRST_UNIQUE_ID + 1, FIRST_UNIQUE_ID + 2]
        );
    }

    #[test]
    fn test_to_policy() {
        let mut config = BridgeConfig::default();
        assert!(!config.to_policy().allows_sysex());

        config.policy.allow_sysex = true;
        config.policy.max_message_len = 3;
        let policy = config.to_policy();
        assert!(policy.allows_sysex());
        assert!(!policy.check_send(true, &[1, 2, 3, 4]).is_allowed());
    }
}
