use log::{debug, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::profile::{remove_file, ProxyDescriptor, ProxyFile};
use crate::store::Store;

const FILE_ID_LEN: usize = 8;
const DEFAULT_UP: &str = "20 mbps";
const DEFAULT_DOWN: &str = "100 mbps";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Hysteria2,
}

impl ProxyProtocol {
    pub const ALL: &'static [ProxyProtocol] = &[ProxyProtocol::Hysteria2];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Hysteria2 => "hysteria2",
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ProxyProtocol::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::UnsupportedProtocol(s.to_string()))
    }
}

/// Local inbound ports written into generated configs when a descriptor has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenPorts {
    pub http: u16,
    pub socks: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ListenSection {
    pub listen: String,
    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TlsSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Bandwidth {
    pub up: String,
    pub down: String,
}

/// Client config document for the hysteria2 core.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Hysteria2Config {
    pub server: String,
    pub auth: String,
    pub http: ListenSection,
    pub socks: ListenSection,
    pub tls: TlsSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<Bandwidth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfs: Option<Value>,
    // unrecognised descriptor keys, written through untouched
    #[serde(flatten)]
    pub extra: Mapping,
}

// Descriptor keys folded into typed fields above (or meta keys that are not config).
const CONSUMED_KEYS: &[&str] = &[
    "name",
    "type",
    "server",
    "port",
    "auth",
    "password",
    "http",
    "socks",
    "tls",
    "sni",
    "skip-cert-verify",
    "bandwidth",
    "up",
    "down",
    "obfs",
    "obfs-password",
];

impl Hysteria2Config {
    /// Validates a descriptor and fills in defaults. All problems are reported at once.
    pub fn from_descriptor(desc: &ProxyDescriptor, ports: ListenPorts) -> Result<Self> {
        let mut issues = Vec::new();

        let server = match (desc.get("server"), desc.get("port")) {
            (None, _) => {
                issues.push("missing field 'server'".to_string());
                None
            }
            (Some(server), port) => match scalar_string(server) {
                Some(server) => join_port(&server, port, &mut issues),
                None => {
                    issues.push("'server' must be a string".to_string());
                    None
                }
            },
        };

        // `password` is the Clash spelling of `auth`
        let auth = match (desc.get("auth"), desc.get("password")) {
            (None, None) => {
                issues.push("missing field 'auth' (or 'password')".to_string());
                None
            }
            (Some(auth), _) => expect_scalar("auth", auth, &mut issues),
            (None, Some(password)) => expect_scalar("password", password, &mut issues),
        };

        let http = listen_section(desc, "http", ports.http, &mut issues);
        let socks = listen_section(desc, "socks", ports.socks, &mut issues);
        let tls = tls_section(desc, &mut issues);
        let bandwidth = bandwidth(desc, &mut issues);
        let obfs = obfs(desc, &mut issues);

        let extra: Mapping = desc
            .iter()
            .filter(|(k, _)| !k.as_str().is_some_and(|k| CONSUMED_KEYS.contains(&k)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        match (server, auth, http, socks, tls) {
            (Some(server), Some(auth), Some(http), Some(socks), Some(tls)) if issues.is_empty() => {
                Ok(Self {
                    server,
                    auth,
                    http,
                    socks,
                    tls,
                    bandwidth,
                    obfs,
                    extra,
                })
            }
            _ => Err(Error::InvalidDescriptor {
                name: desc.name().unwrap_or("<unnamed>").to_string(),
                issues,
            }),
        }
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn expect_scalar(key: &str, value: &Value, issues: &mut Vec<String>) -> Option<String> {
    match scalar_string(value) {
        Some(s) if !s.is_empty() => Some(s),
        Some(_) => {
            issues.push(format!("'{}' must not be empty", key));
            None
        }
        None => {
            issues.push(format!("'{}' must be a string", key));
            None
        }
    }
}

// Optional string-like key: numbers are stringified, null and "" read as absent.
fn optional_scalar(key: &str, value: Option<&Value>, issues: &mut Vec<String>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        other => expect_scalar(key, other, issues),
    }
}

/// Appends a separate `port` to `server` unless the address already carries one.
fn join_port(server: &str, port: Option<&Value>, issues: &mut Vec<String>) -> Option<String> {
    if server.is_empty() {
        issues.push("'server' must not be empty".to_string());
        return None;
    }
    let Some(port) = port else {
        return Some(server.to_string());
    };
    let port = match port {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    };
    let Some(port) = port else {
        issues.push("'port' must be a port number".to_string());
        return None;
    };

    let has_port = if server.starts_with('[') {
        server.contains("]:")
    } else {
        server.matches(':').count() == 1
    };
    if has_port {
        Some(server.to_string())
    } else if server.contains(':') && !server.starts_with('[') {
        Some(format!("[{}]:{}", server, port))
    } else {
        Some(format!("{}:{}", server, port))
    }
}

fn listen_section(
    desc: &ProxyDescriptor,
    key: &str,
    default_port: u16,
    issues: &mut Vec<String>,
) -> Option<ListenSection> {
    let default_listen = format!("127.0.0.1:{}", default_port);
    match desc.get(key) {
        None => Some(ListenSection {
            listen: default_listen,
            extra: Mapping::new(),
        }),
        Some(Value::Mapping(map)) => {
            let mut extra = map.clone();
            let listen = match extra.remove("listen") {
                None => default_listen,
                Some(v) => expect_scalar(&format!("{}.listen", key), &v, issues)?,
            };
            Some(ListenSection { listen, extra })
        }
        Some(_) => {
            issues.push(format!("'{}' must be a mapping", key));
            None
        }
    }
}

fn tls_section(desc: &ProxyDescriptor, issues: &mut Vec<String>) -> Option<TlsSection> {
    match desc.get("tls") {
        Some(Value::Mapping(map)) => {
            let mut extra = map.clone();
            let sni = optional_scalar("tls.sni", extra.remove("sni").as_ref(), issues);
            let insecure = match extra.remove("insecure") {
                None => None,
                Some(Value::Bool(b)) => Some(b),
                Some(_) => {
                    issues.push("'tls.insecure' must be a boolean".to_string());
                    return None;
                }
            };
            Some(TlsSection {
                sni,
                insecure,
                extra,
            })
        }
        Some(_) => {
            issues.push("'tls' must be a mapping".to_string());
            None
        }
        None => {
            let insecure = match desc.get("skip-cert-verify") {
                None => true,
                Some(Value::Bool(b)) => *b,
                Some(_) => {
                    issues.push("'skip-cert-verify' must be a boolean".to_string());
                    return None;
                }
            };
            let sni = optional_scalar("sni", desc.get("sni"), issues);
            Some(TlsSection {
                sni,
                insecure: Some(insecure),
                extra: Mapping::new(),
            })
        }
    }
}

/// Emitted only when some bandwidth key is present; missing halves get defaults.
fn bandwidth(desc: &ProxyDescriptor, issues: &mut Vec<String>) -> Option<Bandwidth> {
    let section = match desc.get("bandwidth") {
        None => None,
        Some(Value::Mapping(map)) => Some(map),
        Some(_) => {
            issues.push("'bandwidth' must be a mapping".to_string());
            return None;
        }
    };
    let pick = |key: &str, issues: &mut Vec<String>| -> Option<String> {
        let value = section
            .and_then(|m| m.get(key))
            .or_else(|| desc.get(key))?;
        let rate = rate_string(value);
        if rate.is_none() {
            issues.push(format!("'{}' must be a rate such as \"50 mbps\"", key));
        }
        rate
    };
    let up = pick("up", issues);
    let down = pick("down", issues);

    if section.is_none() && !desc.contains("up") && !desc.contains("down") {
        return None;
    }
    Some(Bandwidth {
        up: up.unwrap_or_else(|| DEFAULT_UP.to_string()),
        down: down.unwrap_or_else(|| DEFAULT_DOWN.to_string()),
    })
}

// Clash lists bare numbers in Mbps.
fn rate_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(format!("{} mbps", n)),
        Value::String(s) if s.trim().parse::<f64>().is_ok() => Some(format!("{} mbps", s.trim())),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn obfs(desc: &ProxyDescriptor, issues: &mut Vec<String>) -> Option<Value> {
    match desc.get("obfs")? {
        Value::Mapping(map) => Some(Value::Mapping(map.clone())),
        Value::String(kind) if !kind.is_empty() => {
            let mut obfs = Mapping::new();
            obfs.insert("type".into(), kind.as_str().into());
            let password = optional_scalar("obfs-password", desc.get("obfs-password"), issues);
            if let Some(password) = password {
                let mut params = Mapping::new();
                params.insert("password".into(), password.into());
                obfs.insert(kind.as_str().into(), Value::Mapping(params));
            }
            Some(Value::Mapping(obfs))
        }
        _ => {
            issues.push("'obfs' must be a string or mapping".to_string());
            None
        }
    }
}

/// A validated, protocol-specific proxy config.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyConfig {
    Hysteria2(Hysteria2Config),
}

impl ProxyConfig {
    /// Checks `name`/`type`, dispatches on the protocol and validates its fields.
    pub fn from_descriptor(desc: &ProxyDescriptor, ports: ListenPorts) -> Result<Self> {
        let mut missing = Vec::new();
        if desc.name().is_none() {
            missing.push("missing field 'name'".to_string());
        }
        if desc.protocol_tag().is_none() {
            missing.push("missing field 'type'".to_string());
        }
        let (Some(_), Some(tag)) = (desc.name(), desc.protocol_tag()) else {
            return Err(Error::InvalidDescriptor {
                name: desc.name().unwrap_or("<unnamed>").to_string(),
                issues: missing,
            });
        };

        match tag.parse::<ProxyProtocol>()? {
            ProxyProtocol::Hysteria2 => {
                Hysteria2Config::from_descriptor(desc, ports).map(ProxyConfig::Hysteria2)
            }
        }
    }

    pub fn protocol(&self) -> ProxyProtocol {
        match self {
            ProxyConfig::Hysteria2(_) => ProxyProtocol::Hysteria2,
        }
    }

    pub fn to_document(&self) -> Result<Mapping> {
        let value = match self {
            ProxyConfig::Hysteria2(config) => serde_yaml::to_value(config),
        };
        match value {
            Ok(Value::Mapping(map)) => Ok(map),
            Ok(other) => Err(Error::Parse {
                path: PathBuf::new(),
                source: serde::de::Error::custom(format!(
                    "config serialised to a non-mapping: {:?}",
                    other
                )),
            }),
            Err(e) => Err(Error::parse(PathBuf::new(), e)),
        }
    }

    /// Reads back a generated config file.
    pub fn load(protocol: ProxyProtocol, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        match protocol {
            ProxyProtocol::Hysteria2 => serde_yaml::from_str(&content)
                .map(ProxyConfig::Hysteria2)
                .map_err(|e| Error::parse(path, e)),
        }
    }
}

/// Turns descriptors into config files under one directory, one file per proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfigFactory {
    config_dir: PathBuf,
    ports: ListenPorts,
}

impl ProxyConfigFactory {
    pub fn new(config_dir: impl Into<PathBuf>, ports: ListenPorts) -> Self {
        Self {
            config_dir: config_dir.into(),
            ports,
        }
    }

    pub fn ports(&self) -> ListenPorts {
        self.ports
    }

    /// Validates `desc` and writes it to `<config_dir>/<random id>.yaml`.
    ///
    /// Nothing is left on disk when this fails.
    pub fn materialize(&self, desc: &ProxyDescriptor) -> Result<ProxyFile> {
        let config = ProxyConfig::from_descriptor(desc, self.ports)?;
        let name = desc.name().unwrap_or_default().to_string();
        let doc = config.to_document()?;

        let path = self.config_dir.join(format!("{}.yaml", random_id()));
        if let Err(e) = Store::create(&path, doc) {
            warn!("failed to write config for '{}': {}", name, e);
            remove_file(&path);
            return Err(e);
        }
        let path = match fs::canonicalize(&path) {
            Ok(p) => p,
            Err(e) => {
                remove_file(&path);
                return Err(Error::io(&path, e));
            }
        };

        debug!("materialized '{}' ({}) at {:?}", name, config.protocol(), path);
        Ok(ProxyFile {
            name,
            protocol: config.protocol(),
            path,
        })
    }
}

// No collision check: 62^8 ids per directory.
fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(FILE_ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PORTS: ListenPorts = ListenPorts {
        http: 7899,
        socks: 7900,
    };

    fn descriptor(yaml: &str) -> ProxyDescriptor {
        ProxyDescriptor::new(serde_yaml::from_str(yaml).unwrap())
    }

    fn hysteria2(yaml: &str) -> Hysteria2Config {
        match ProxyConfig::from_descriptor(&descriptor(yaml), PORTS).unwrap() {
            ProxyConfig::Hysteria2(c) => c,
        }
    }

    #[test]
    fn defaults_fill_listen_and_tls() {
        let c = hysteria2("{name: HK, type: hysteria2, server: '1.2.3.4:443', auth: secret}");
        assert_eq!(c.server, "1.2.3.4:443");
        assert_eq!(c.auth, "secret");
        assert_eq!(c.http.listen, "127.0.0.1:7899");
        assert_eq!(c.socks.listen, "127.0.0.1:7900");
        assert_eq!(c.tls.insecure, Some(true));
        assert_eq!(c.bandwidth, None);
        assert!(c.extra.is_empty());
    }

    #[test]
    fn password_is_an_alias_for_auth() {
        let c = hysteria2("{name: a, type: hysteria2, server: 'h:1', password: pw}");
        assert_eq!(c.auth, "pw");
        let c = hysteria2("{name: a, type: hysteria2, server: 'h:1', auth: a1, password: pw}");
        assert_eq!(c.auth, "a1");
    }

    #[test]
    fn all_issues_are_reported_together() {
        let err = ProxyConfig::from_descriptor(
            &descriptor("{name: bad, type: hysteria2, http: 5, tls: yes}"),
            PORTS,
        )
        .unwrap_err();
        match err {
            Error::InvalidDescriptor { name, issues } => {
                assert_eq!(name, "bad");
                assert_eq!(issues.len(), 4, "{:?}", issues);
                assert!(issues.iter().any(|i| i.contains("server")));
                assert!(issues.iter().any(|i| i.contains("auth")));
                assert!(issues.iter().any(|i| i.contains("'http'")));
                assert!(issues.iter().any(|i| i.contains("'tls'")));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn name_and_type_are_required() {
        let err = ProxyConfig::from_descriptor(&descriptor("{server: 'h:1', auth: x}"), PORTS)
            .unwrap_err();
        match err {
            Error::InvalidDescriptor { issues, .. } => assert_eq!(issues.len(), 2),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let err = ProxyConfig::from_descriptor(
            &descriptor("{name: v, type: vmess, server: h, port: 1}"),
            PORTS,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedProtocol(ref t) if t == "vmess"));
    }

    #[test]
    fn clash_style_fields_are_normalised() {
        let c = hysteria2(
            r#"
name: JP
type: hysteria2
server: jp.example.com
port: 8443
password: pw
sni: cdn.example.com
skip-cert-verify: false
up: 30
down: "200 mbps"
obfs: salamander
obfs-password: hidden
udp: true
"#,
        );
        assert_eq!(c.server, "jp.example.com:8443");
        assert_eq!(c.tls.sni.as_deref(), Some("cdn.example.com"));
        assert_eq!(c.tls.insecure, Some(false));
        assert_eq!(
            c.bandwidth,
            Some(Bandwidth {
                up: "30 mbps".into(),
                down: "200 mbps".into()
            })
        );
        let obfs = c.obfs.unwrap();
        assert_eq!(obfs["type"], Value::from("salamander"));
        assert_eq!(obfs["salamander"]["password"], Value::from("hidden"));
        assert_eq!(c.extra.get("udp"), Some(&Value::Bool(true)));
        assert!(c.extra.get("name").is_none());
    }

    #[test]
    fn numeric_scalars_are_stringified() {
        let c = hysteria2(
            "{name: n, type: hysteria2, server: 'h:1', auth: x, obfs: salamander, obfs-password: 123456, sni: 42}",
        );
        assert_eq!(c.tls.sni.as_deref(), Some("42"));
        assert_eq!(c.obfs.unwrap()["salamander"]["password"], Value::from("123456"));
    }

    #[test]
    fn non_scalar_sni_and_obfs_password_are_reported() {
        let err = ProxyConfig::from_descriptor(
            &descriptor(
                "{name: m, type: hysteria2, server: 'h:1', auth: x, obfs: salamander, obfs-password: {a: 1}, sni: [x]}",
            ),
            PORTS,
        )
        .unwrap_err();
        match err {
            Error::InvalidDescriptor { issues, .. } => {
                assert_eq!(issues.len(), 2, "{:?}", issues);
                assert!(issues.iter().any(|i| i.contains("'obfs-password'")));
                assert!(issues.iter().any(|i| i.contains("'sni'")));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let err = ProxyConfig::from_descriptor(
            &descriptor("{name: t, type: hysteria2, server: 'h:1', auth: x, tls: {sni: {a: 1}}}"),
            PORTS,
        )
        .unwrap_err();
        match err {
            Error::InvalidDescriptor { issues, .. } => {
                assert_eq!(issues, vec!["'tls.sni' must be a string".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn ipv6_server_gets_bracketed() {
        let c = hysteria2("{name: v6, type: hysteria2, server: '2001:db8::1', port: 443, auth: x}");
        assert_eq!(c.server, "[2001:db8::1]:443");
        let c = hysteria2("{name: p, type: hysteria2, server: 'h:443', port: 8443, auth: x}");
        assert_eq!(c.server, "h:443");
    }

    #[test]
    fn partial_bandwidth_gets_default_half() {
        let c = hysteria2("{name: b, type: hysteria2, server: 'h:1', auth: x, bandwidth: {up: 10 mbps}}");
        assert_eq!(
            c.bandwidth,
            Some(Bandwidth {
                up: "10 mbps".into(),
                down: DEFAULT_DOWN.into()
            })
        );
    }

    #[test]
    fn supplied_sections_are_kept() {
        let c = hysteria2(
            "{name: s, type: hysteria2, server: 'h:1', auth: x, http: {listen: ':8080', username: u}, tls: {sni: a.b}}",
        );
        assert_eq!(c.http.listen, ":8080");
        assert_eq!(c.http.extra.get("username"), Some(&Value::from("u")));
        assert_eq!(c.tls.sni.as_deref(), Some("a.b"));
        assert_eq!(c.tls.insecure, None);
    }

    #[test]
    fn materialize_writes_a_readable_file() {
        let dir = TempDir::new().unwrap();
        let factory = ProxyConfigFactory::new(dir.path(), PORTS);
        let file = factory
            .materialize(&descriptor(
                "{name: HK, type: hysteria2, server: '1.2.3.4:443', auth: secret}",
            ))
            .unwrap();

        assert_eq!(file.name, "HK");
        assert_eq!(file.protocol, ProxyProtocol::Hysteria2);
        assert!(file.path.is_absolute());
        let stem = file.path.file_stem().unwrap().to_str().unwrap();
        assert_eq!(stem.len(), FILE_ID_LEN);
        assert!(stem.chars().all(|c| c.is_ascii_alphanumeric()));

        let raw: Mapping = serde_yaml::from_str(&fs::read_to_string(&file.path).unwrap()).unwrap();
        assert_eq!(raw["http"]["listen"], Value::from("127.0.0.1:7899"));
        assert_eq!(raw["socks"]["listen"], Value::from("127.0.0.1:7900"));
        assert_eq!(raw["tls"]["insecure"], Value::Bool(true));
        assert!(raw.get("bandwidth").is_none());
        assert!(raw.get("name").is_none());

        let loaded = ProxyConfig::load(file.protocol, &file.path).unwrap();
        assert_eq!(loaded.protocol(), ProxyProtocol::Hysteria2);
    }

    #[test]
    fn materialize_failure_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let factory = ProxyConfigFactory::new(dir.path(), PORTS);
        assert!(factory
            .materialize(&descriptor("{name: x, type: hysteria2, server: 'h:1'}"))
            .is_err());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
