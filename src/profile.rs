use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::proxy_config::ProxyProtocol;

/// A generated per-proxy config file. Replaced wholesale on re-sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyFile {
    pub name: String,
    #[serde(rename = "type")]
    pub protocol: ProxyProtocol,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub name: String,
    pub url: String,
    #[serde(default, deserialize_with = "deserialize_interval")]
    pub update_interval: String,
    #[serde(default)]
    pub last_update: u64,
    #[serde(default)]
    pub files: Vec<ProxyFile>,
}

impl Subscription {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        update_interval: impl Into<String>,
        files: Vec<ProxyFile>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            update_interval: update_interval.into(),
            last_update: now_secs(),
            files,
        }
    }

    pub fn file(&self, name: &str) -> Option<&ProxyFile> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Paths of this subscription's files that are currently on disk.
    pub fn existing_paths(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .map(|f| f.path.clone())
            .filter(|p| p.exists())
            .collect()
    }

    /// The interval read as whole seconds, when it is numeric.
    pub fn update_interval_secs(&self) -> Option<u64> {
        self.update_interval.trim().parse().ok()
    }

    pub fn is_due(&self, now: u64) -> bool {
        match self.update_interval_secs() {
            Some(interval) => now.saturating_sub(self.last_update) >= interval,
            None => false,
        }
    }
}

// The interval is opaque; hand-edited files may carry it as a bare number.
fn deserialize_interval<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "updateInterval must be a string or number, got {:?}",
            other
        ))),
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One remote-supplied proxy record. Untyped until a protocol config is built from it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyDescriptor(Mapping);

impl ProxyDescriptor {
    pub fn new(map: Mapping) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str("name")
    }

    pub fn protocol_tag(&self) -> Option<&str> {
        self.get_str("type")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.0.iter()
    }

    /// Splits a parsed subscription document into descriptors.
    ///
    /// Returns `None` when the document has no `proxies` list. Entries that are not
    /// mappings are dropped.
    pub fn list_from(doc: &Mapping) -> Option<Vec<ProxyDescriptor>> {
        let proxies = doc.get("proxies")?.as_sequence()?;
        Some(
            proxies
                .iter()
                .filter_map(|p| match p {
                    Value::Mapping(m) => Some(ProxyDescriptor(m.clone())),
                    other => {
                        log::warn!("skipping non-mapping proxy entry: {:?}", other);
                        None
                    }
                })
                .collect(),
        )
    }
}

impl From<Mapping> for ProxyDescriptor {
    fn from(map: Mapping) -> Self {
        Self(map)
    }
}

pub(crate) fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        remove_file(path);
    }
}

pub(crate) fn remove_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("removed {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to remove {:?}: {}", path, e),
    }
}
