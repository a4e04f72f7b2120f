// ns-config: the device identity / server parameter config store (C1).
//
// A line-oriented file of `key<sep>value` pairs. Recognized keys (`ma`,
// `dk`, `ct`, `mp`, `sh`) are parsed into typed fields; every other key
// (e.g. `ip`, `op`, `wi`) is kept verbatim as a pass-through value for
// other components to interpret. The store never touches the network.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Public config type
// ---------------------------------------------------------------------------

/// Device identity and server parameters, as persisted to the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// `ma` — 12-hex MAC-style identifier. Required once configured.
    pub mac: Option<String>,
    /// `dk` — device key assigned by the server.
    pub device_key: Option<u32>,
    /// `ct` — client type string (e.g. "netsender", "weather").
    pub client_type: Option<String>,
    /// `mp` — monitor period in seconds.
    pub monitor_period: Option<u64>,
    /// `sh` — service host; overrides the built-in default when set.
    pub service_host: Option<String>,
    /// Every other key, kept verbatim (`ip`, `op`, `wi`, device-defined keys).
    pub extra: BTreeMap<String, String>,
}

impl DeviceConfig {
    pub fn empty() -> Self {
        DeviceConfig {
            mac: None,
            device_key: None,
            client_type: None,
            monitor_period: None,
            service_host: None,
            extra: BTreeMap::new(),
        }
    }

    /// True once the fields a successful configure reply would have filled
    /// in are all present.
    pub fn is_configured(&self) -> bool {
        self.mac.is_some() && self.device_key.is_some() && self.monitor_period.is_some()
    }

    fn from_raw(raw: BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut cfg = DeviceConfig::empty();
        for (key, value) in raw {
            match key.as_str() {
                "ma" => cfg.mac = Some(value),
                "dk" => {
                    cfg.device_key = Some(value.parse().map_err(|_| {
                        ConfigError::Parse(format!("'dk' is not a valid integer: '{value}'"))
                    })?)
                }
                "ct" => cfg.client_type = Some(value),
                "mp" => {
                    cfg.monitor_period = Some(value.parse().map_err(|_| {
                        ConfigError::Parse(format!("'mp' is not a valid integer: '{value}'"))
                    })?)
                }
                "sh" => cfg.service_host = Some(value),
                _ => {
                    cfg.extra.insert(key, value);
                }
            }
        }
        Ok(cfg)
    }

    fn to_raw(&self) -> BTreeMap<String, String> {
        let mut raw = BTreeMap::new();
        if let Some(v) = &self.mac {
            raw.insert("ma".to_owned(), v.clone());
        }
        if let Some(v) = self.device_key {
            raw.insert("dk".to_owned(), v.to_string());
        }
        if let Some(v) = &self.client_type {
            raw.insert("ct".to_owned(), v.clone());
        }
        if let Some(v) = self.monitor_period {
            raw.insert("mp".to_owned(), v.to_string());
        }
        if let Some(v) = &self.service_host {
            raw.insert("sh".to_owned(), v.clone());
        }
        for (k, v) in &self.extra {
            raw.insert(k.clone(), v.clone());
        }
        raw
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load a config file from `path`.
///
/// Blank lines and surrounding whitespace are tolerated. Each line must be
/// `key value` or `key:value`; anything else is `ErrConfigParse`. A missing
/// file is `ErrConfigMissing`, not a parse error, since it is the normal
/// first-run state before provisioning.
pub fn load(path: &Path) -> Result<DeviceConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ConfigError::Missing(path.to_path_buf())
        } else {
            ConfigError::Io(format!("reading '{}': {e}", path.display()))
        }
    })?;
    parse(&text)
}

fn parse(text: &str) -> Result<DeviceConfig, ConfigError> {
    let mut raw = BTreeMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = split_line(line)
            .ok_or_else(|| ConfigError::Parse(format!("line {}: '{line}'", lineno + 1)))?;
        if key.is_empty() {
            return Err(ConfigError::Parse(format!(
                "line {}: empty key",
                lineno + 1
            )));
        }
        raw.insert(key.to_owned(), value.to_owned());
    }
    DeviceConfig::from_raw(raw)
}

fn split_line(line: &str) -> Option<(&str, &str)> {
    if let Some(idx) = line.find(':') {
        let (k, v) = line.split_at(idx);
        return Some((k.trim(), v[1..].trim()));
    }
    line.split_once(char::is_whitespace)
        .map(|(k, v)| (k.trim(), v.trim()))
}

/// Persist `cfg` to `path` atomically: write to a temp file in the same
/// directory, then rename over the target. A reader never observes a
/// half-written file.
pub fn save(path: &Path, cfg: &DeviceConfig) -> Result<(), ConfigError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let tmp_path = tmp_path_in(dir, path);

    let mut body = String::new();
    for (k, v) in cfg.to_raw() {
        body.push_str(&k);
        body.push(' ');
        body.push_str(&v);
        body.push('\n');
    }

    fs::write(&tmp_path, body).map_err(|e| {
        ConfigError::Io(format!("writing temp file '{}': {e}", tmp_path.display()))
    })?;
    fs::rename(&tmp_path, path).map_err(|e| {
        ConfigError::Io(format!(
            "renaming '{}' to '{}': {e}",
            tmp_path.display(),
            path.display()
        ))
    })?;
    Ok(())
}

fn tmp_path_in(dir: &Path, target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("netsender.conf");
    dir.join(format!(".{name}.tmp"))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Missing(PathBuf),
    Parse(String),
    Io(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(p) => write!(f, "config file missing: {}", p.display()),
            ConfigError::Parse(s) => write!(f, "config parse error: {s}"),
            ConfigError::Io(s) => write!(f, "config IO error: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_and_passthrough_keys() {
        let cfg = parse("ma 00:00:00:00:00:01\ndk 10000001\nct netsender\nmp 60\nip X1,A2\n\n").unwrap();
        assert_eq!(cfg.mac.as_deref(), Some("00:00:00:00:00:01"));
        assert_eq!(cfg.device_key, Some(10_000_001));
        assert_eq!(cfg.client_type.as_deref(), Some("netsender"));
        assert_eq!(cfg.monitor_period, Some(60));
        assert_eq!(cfg.extra.get("ip").map(String::as_str), Some("X1,A2"));
    }

    #[test]
    fn accepts_colon_separator() {
        let cfg = parse("sh:data.example\n").unwrap();
        assert_eq!(cfg.service_host.as_deref(), Some("data.example"));
    }

    #[test]
    fn rejects_unparseable_device_key() {
        let err = parse("dk notanumber\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_err_config_missing() {
        let err = load(Path::new("/nonexistent/path/to/netsender.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netsender.conf");
        let mut cfg = DeviceConfig::empty();
        cfg.mac = Some("00:00:00:00:00:02".to_owned());
        cfg.device_key = Some(42);
        cfg.monitor_period = Some(30);
        cfg.extra.insert("ip".to_owned(), "X1,V2".to_owned());

        save(&path, &cfg).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn is_configured_requires_mac_key_and_period() {
        let mut cfg = DeviceConfig::empty();
        assert!(!cfg.is_configured());
        cfg.mac = Some("x".to_owned());
        cfg.device_key = Some(1);
        cfg.monitor_period = Some(10);
        assert!(cfg.is_configured());
    }
}
