//! Plugin enumeration configuration.
//!
//! A JSON document listing up to [`MAX_PLUGINS`](crate::MAX_PLUGINS)
//! specifications:
//!
//! ```json
//! {
//!   "plugins": [
//!     { "kind": "native", "path": "libs7comm.so",
//!       "enabled": true, "config": "/etc/plc/s7comm.json" }
//!   ]
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Native,
    Scripted,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginSpec {
    pub kind: PluginKind,
    /// Path of the dynamic artifact (native) or script (scripted).
    pub path: PathBuf,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-plugin private configuration file, passed through untouched.
    #[serde(default)]
    pub config: Option<PathBuf>,
    /// Display name for logs; defaults to the artifact file stem.
    #[serde(default)]
    pub name: Option<String>,
}

impl PluginSpec {
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read plugin config `{path}`: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse plugin config `{path}`: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

pub fn load(path: &Path) -> Result<DriverConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_plugin_list() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        fs::write(
            tmp.path(),
            r#"{
                "plugins": [
                    { "kind": "native", "path": "libs7comm.so", "config": "/etc/plc/s7.json" },
                    { "kind": "scripted", "path": "probe.py", "enabled": false }
                ]
            }"#,
        )
        .unwrap();
        let cfg = load(tmp.path()).unwrap();
        assert_eq!(cfg.plugins.len(), 2);
        assert_eq!(cfg.plugins[0].kind, PluginKind::Native);
        assert!(cfg.plugins[0].enabled, "enabled defaults to true");
        assert_eq!(cfg.plugins[0].display_name(), "libs7comm");
        assert_eq!(cfg.plugins[1].kind, PluginKind::Scripted);
        assert!(!cfg.plugins[1].enabled);
        assert_eq!(cfg.plugins[1].config, None);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load(Path::new("/nonexistent/plugins.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        fs::write(tmp.path(), "{ not json").unwrap();
        assert!(matches!(
            load(tmp.path()).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }
}
