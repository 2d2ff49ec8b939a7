//! Plugin configuration: JSON schema, defaults, and validation.
//!
//! A configuration document enumerates the server settings, the PLC
//! identity strings reported to clients, the data blocks, and up to three
//! system areas, each with a mapping into the image tables:
//!
//! ```json
//! {
//!   "server": { "port": 102, "pdu_size": 480 },
//!   "plc_identity": { "name": "ferroplc" },
//!   "data_blocks": [
//!     { "db_number": 1, "description": "holding registers",
//!       "size_bytes": 64,
//!       "mapping": { "type": "int_memory", "start_buffer": 0 } }
//!   ],
//!   "system_areas": {
//!     "pe_area": { "enabled": true, "size_bytes": 128,
//!                  "mapping": { "type": "bool_input", "bit_addressing": true } }
//!   },
//!   "sync_mode": "double_buffered"
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use plc_image::BufferTag;

pub const DEFAULT_PORT: u16 = 102;
pub const DEFAULT_MAX_CLIENTS: usize = 32;
pub const DEFAULT_WORK_INTERVAL_MS: u64 = 100;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_PDU_SIZE: u16 = 480;

/// Largest accepted size for one data block or system area.
pub const MAX_AREA_BYTES: usize = 65_536;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse `{path}`: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which synchronisation policy the deployment runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Cycle-synchronous double buffering: the server serves shared
    /// buffers; `cycle_end` syncs S7 <-> shadow <-> image.
    #[default]
    DoubleBuffered,
    /// On-demand: every client operation runs through a callback that
    /// reads the image under its mutex and journals writes.
    OnDemand,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
    pub max_clients: usize,
    pub work_interval_ms: u64,
    pub send_timeout_ms: u64,
    pub recv_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub pdu_size: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            work_interval_ms: DEFAULT_WORK_INTERVAL_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT_MS,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            pdu_size: DEFAULT_PDU_SIZE,
        }
    }
}

/// Identity strings reported to clients asking who they talk to.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlcIdentity {
    pub name: String,
    pub module_type: String,
    pub serial_number: String,
    pub copyright: String,
    pub module_name: String,
}

impl Default for PlcIdentity {
    fn default() -> Self {
        Self {
            name: "ferroplc runtime".to_string(),
            module_type: "CPU 315-2 PN/DP".to_string(),
            serial_number: "S C-XXXXXXXXX".to_string(),
            copyright: "ferroplc project".to_string(),
            module_name: "ferroplc".to_string(),
        }
    }
}

/// Where in the image a DB or system area lands.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferMapping {
    #[serde(rename = "type")]
    pub kind: BufferTag,
    #[serde(default)]
    pub start_buffer: usize,
    #[serde(default)]
    pub bit_addressing: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataBlockConfig {
    pub db_number: u16,
    #[serde(default)]
    pub description: String,
    pub size_bytes: usize,
    pub mapping: BufferMapping,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemAreaConfig {
    pub enabled: bool,
    pub size_bytes: usize,
    pub mapping: Option<BufferMapping>,
}

impl Default for SystemAreaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size_bytes: 128,
            mapping: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SystemAreas {
    pub pe_area: SystemAreaConfig,
    pub pa_area: SystemAreaConfig,
    pub mk_area: SystemAreaConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingFlags {
    pub log_connections: bool,
    pub log_data_access: bool,
    pub log_errors: bool,
}

impl Default for LoggingFlags {
    fn default() -> Self {
        Self {
            log_connections: true,
            log_data_access: false,
            log_errors: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct S7Config {
    pub server: ServerSettings,
    pub plc_identity: PlcIdentity,
    pub data_blocks: Vec<DataBlockConfig>,
    pub system_areas: SystemAreas,
    pub logging: LoggingFlags,
    pub sync_mode: SyncMode,
}

impl S7Config {
    /// Parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.server;
        if s.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }
        if s.send_timeout_ms < 100 || s.recv_timeout_ms < 100 {
            return Err(ConfigError::Invalid(
                "send/recv timeouts below 100 ms".into(),
            ));
        }
        if !(240..=960).contains(&s.pdu_size) {
            return Err(ConfigError::Invalid(format!(
                "pdu_size {} outside the valid range 240..960",
                s.pdu_size
            )));
        }
        if s.max_clients == 0 || s.max_clients > 1024 {
            return Err(ConfigError::Invalid(format!(
                "max_clients {} outside 1..1024",
                s.max_clients
            )));
        }

        for (i, db) in self.data_blocks.iter().enumerate() {
            if db.db_number == 0 {
                return Err(ConfigError::Invalid(format!(
                    "data block #{i} has db_number 0"
                )));
            }
            if db.size_bytes == 0 || db.size_bytes > MAX_AREA_BYTES {
                return Err(ConfigError::Invalid(format!(
                    "DB{}: size_bytes {} outside 1..{}",
                    db.db_number, db.size_bytes, MAX_AREA_BYTES
                )));
            }
            for other in &self.data_blocks[i + 1..] {
                if other.db_number == db.db_number {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate db_number {}",
                        db.db_number
                    )));
                }
            }
        }

        for (name, area) in [
            ("pe_area", &self.system_areas.pe_area),
            ("pa_area", &self.system_areas.pa_area),
            ("mk_area", &self.system_areas.mk_area),
        ] {
            if !area.enabled {
                continue;
            }
            if area.mapping.is_none() {
                return Err(ConfigError::Invalid(format!("{name} has no mapping")));
            }
            if area.size_bytes == 0 || area.size_bytes > MAX_AREA_BYTES {
                return Err(ConfigError::Invalid(format!(
                    "{name}: size_bytes {} outside 1..{}",
                    area.size_bytes, MAX_AREA_BYTES
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(json.as_bytes()).unwrap();
        tmp
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = S7Config::default();
        assert!(cfg.server.enabled);
        assert_eq!(cfg.server.port, 102);
        assert_eq!(cfg.server.max_clients, 32);
        assert_eq!(cfg.server.pdu_size, 480);
        assert_eq!(cfg.server.work_interval_ms, 100);
        assert_eq!(cfg.sync_mode, SyncMode::DoubleBuffered);
        assert!(cfg.logging.log_connections);
        assert!(!cfg.logging.log_data_access);
        cfg.validate().unwrap();
    }

    #[test]
    fn parses_a_full_document() {
        let tmp = write_config(
            r#"{
                "server": { "port": 1102, "bind_address": "127.0.0.1", "pdu_size": 240 },
                "plc_identity": { "name": "line 4 PLC" },
                "data_blocks": [
                    { "db_number": 1, "description": "registers", "size_bytes": 64,
                      "mapping": { "type": "int_memory", "start_buffer": 0 } },
                    { "db_number": 2, "size_bytes": 16,
                      "mapping": { "type": "bool_output", "bit_addressing": true } }
                ],
                "system_areas": {
                    "pe_area": { "enabled": true, "size_bytes": 32,
                                 "mapping": { "type": "bool_input", "bit_addressing": true } }
                },
                "sync_mode": "on_demand"
            }"#,
        );
        let cfg = S7Config::load(tmp.path()).unwrap();
        assert_eq!(cfg.server.port, 1102);
        assert_eq!(cfg.plc_identity.name, "line 4 PLC");
        assert_eq!(cfg.plc_identity.module_type, "CPU 315-2 PN/DP");
        assert_eq!(cfg.data_blocks.len(), 2);
        assert_eq!(cfg.data_blocks[0].mapping.kind, BufferTag::IntMemory);
        assert!(cfg.data_blocks[1].mapping.bit_addressing);
        assert!(cfg.system_areas.pe_area.enabled);
        assert!(!cfg.system_areas.pa_area.enabled);
        assert_eq!(cfg.sync_mode, SyncMode::OnDemand);
    }

    #[test]
    fn pdu_size_outside_the_s7_range_is_rejected() {
        for pdu in [239, 961, 0] {
            let tmp = write_config(&format!(r#"{{ "server": {{ "pdu_size": {pdu} }} }}"#));
            assert!(matches!(
                S7Config::load(tmp.path()).unwrap_err(),
                ConfigError::Invalid(_)
            ));
        }
        for pdu in [240, 480, 960] {
            let tmp = write_config(&format!(r#"{{ "server": {{ "pdu_size": {pdu} }} }}"#));
            S7Config::load(tmp.path()).unwrap();
        }
    }

    #[test]
    fn duplicate_db_numbers_are_rejected() {
        let tmp = write_config(
            r#"{ "data_blocks": [
                { "db_number": 7, "size_bytes": 8, "mapping": { "type": "int_memory" } },
                { "db_number": 7, "size_bytes": 8, "mapping": { "type": "int_output" } }
            ] }"#,
        );
        let err = S7Config::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate db_number 7"));
    }

    #[test]
    fn unknown_buffer_type_is_a_parse_error() {
        let tmp = write_config(
            r#"{ "data_blocks": [
                { "db_number": 1, "size_bytes": 8, "mapping": { "type": "float_memory" } }
            ] }"#,
        );
        assert!(matches!(
            S7Config::load(tmp.path()).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }

    #[test]
    fn enabled_area_without_mapping_is_rejected() {
        let tmp = write_config(
            r#"{ "system_areas": { "mk_area": { "enabled": true, "size_bytes": 16 } } }"#,
        );
        let err = S7Config::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("mk_area has no mapping"));
    }
}
