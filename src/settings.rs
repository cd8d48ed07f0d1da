use log::error;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub const DEFAULT_HTTP_PORT: u16 = 7899;
pub const DEFAULT_SOCKS_PORT: u16 = 7900;

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}

/// `config.yaml`: local listen ports and the default subscription.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    #[serde(default)]
    pub default: Option<String>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            socks_port: DEFAULT_SOCKS_PORT,
            default: None,
        }
    }
}

/// Read-only view over a static YAML settings document.
///
/// Routes are dotted key paths, e.g. `"log.level"`. Getters return `None` when the
/// route is missing or holds a value of another type.
#[derive(Debug, Clone, Default)]
pub struct SettingReader {
    root: Value,
}

impl SettingReader {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_yaml(&content).map_err(|e| Error::parse(path, e))
    }

    pub fn from_yaml(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        let root = serde_yaml::from_str(content)?;
        Ok(Self { root })
    }

    fn lookup(&self, route: &str) -> Option<&Value> {
        route
            .split('.')
            .try_fold(&self.root, |node, key| node.as_mapping()?.get(key))
    }

    fn typed<'a, T>(&'a self, route: &str, f: impl FnOnce(&'a Value) -> Option<T>) -> Option<T> {
        let value = self.lookup(route)?;
        let typed = f(value);
        if typed.is_none() {
            error!("setting '{}' has unexpected type: {:?}", route, value);
        }
        typed
    }

    pub fn get_str(&self, route: &str) -> Option<&str> {
        self.typed(route, Value::as_str)
    }

    pub fn get_int(&self, route: &str) -> Option<i64> {
        self.typed(route, Value::as_i64)
    }

    pub fn get_bool(&self, route: &str) -> Option<bool> {
        self.typed(route, Value::as_bool)
    }

    pub fn get_list(&self, route: &str) -> Option<&Vec<Value>> {
        self.typed(route, |v| v.as_sequence())
    }

    pub fn get_map(&self, route: &str) -> Option<&Mapping> {
        self.typed(route, Value::as_mapping)
    }

    pub fn http_port(&self) -> Option<u16> {
        self.port("httpPort")
    }

    pub fn socks_port(&self) -> Option<u16> {
        self.port("socksPort")
    }

    fn port(&self, route: &str) -> Option<u16> {
        let raw = self.get_int(route)?;
        match u16::try_from(raw) {
            Ok(port) => Some(port),
            Err(_) => {
                error!("setting '{}' is not a valid port: {}", route, raw);
                None
            }
        }
    }
}
