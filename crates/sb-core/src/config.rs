use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::BridgeError;
use crate::value::HostValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Whether `karate.log` output is emitted at all (default: true)
    #[serde(default = "default_print_enabled")]
    pub print_enabled: bool,

    /// Disk shadow lifetime for `callSingle` results, 0 disables it
    #[serde(default)]
    pub call_single_cache_minutes: u64,

    #[serde(default = "default_target_dir")]
    pub call_single_cache_dir: PathBuf,

    /// Root for `karate.write` output (default: target)
    #[serde(default = "default_target_dir")]
    pub build_dir: PathBuf,

    #[serde(default)]
    pub env: Option<String>,

    /// Fallback `requestUrlBase` for `proceed()`
    #[serde(default)]
    pub url_base: Option<String>,

    /// Keys set through `configure` that the bridge itself does not interpret.
    #[serde(default)]
    pub extras: BTreeMap<String, JsonValue>,
}

fn default_print_enabled() -> bool {
    true
}

fn default_target_dir() -> PathBuf {
    PathBuf::from("target")
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            print_enabled: true,
            call_single_cache_minutes: 0,
            call_single_cache_dir: default_target_dir(),
            build_dir: default_target_dir(),
            env: None,
            url_base: None,
            extras: BTreeMap::new(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, BridgeError> {
        toml::from_str(text).map_err(|error| BridgeError::Config {
            message: error.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let text = std::fs::read_to_string(path).map_err(|error| BridgeError::io(path, &error))?;
        Self::from_toml_str(&text)
    }

    /// Run-time update from a script. `callSingleCache` accepts
    /// `{ minutes, dir }`; unknown keys land in `extras`.
    pub fn apply(&mut self, key: &str, value: &HostValue) -> Result<(), BridgeError> {
        match key {
            "printEnabled" => {
                self.print_enabled = value.as_bool().ok_or_else(|| config_type_error(key, value))?;
            }
            "callSingleCache" => {
                let map = value.as_map().ok_or_else(|| config_type_error(key, value))?;
                if let Some(minutes) = map.get("minutes") {
                    let minutes = minutes
                        .as_number()
                        .ok_or_else(|| config_type_error("callSingleCache.minutes", &minutes))?;
                    self.call_single_cache_minutes = minutes.as_i64().max(0) as u64;
                }
                if let Some(dir) = map.get("dir") {
                    let dir = dir
                        .as_text()
                        .ok_or_else(|| config_type_error("callSingleCache.dir", &dir))?;
                    self.call_single_cache_dir = PathBuf::from(dir);
                }
            }
            "buildDir" => {
                let dir = value.as_text().ok_or_else(|| config_type_error(key, value))?;
                self.build_dir = PathBuf::from(dir);
            }
            "url" | "urlBase" => {
                self.url_base = match value {
                    HostValue::Null => None,
                    other => Some(other.to_display_text()),
                };
            }
            _ => {
                self.extras.insert(key.to_string(), value.to_json());
            }
        }
        Ok(())
    }
}

fn config_type_error(key: &str, value: &HostValue) -> BridgeError {
    BridgeError::Config {
        message: format!("unexpected {} for '{}'", value.type_name(), key),
    }
}
