//! YAML configuration loading and validation, grounded on `cognitod`'s
//! `Config::load()` shape (default-on-missing-file, `#[serde(default =
//! "...")]` per field) but switched to `serde_yaml` per the external
//! interface contract, and switched from "default on parse error" to
//! explicit `ConfigError` propagation: a config this process got wrong
//! must abort startup, not silently run with defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::MonitorError;
use crate::monitor::MonitorType;

pub const DEFAULT_CONFIG_PATH: &str = "config/monitor_config.yaml";

fn default_buffer_size() -> usize {
    2000
}
fn default_batch_size() -> usize {
    100
}
fn default_large_batch_threshold() -> usize {
    20
}
fn default_flush_interval_s() -> f64 {
    2.0
}
fn default_output_thread_sleep_s() -> f64 {
    0.1
}
fn default_csv_delimiter() -> char {
    ','
}
fn default_include_header() -> bool {
    true
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_large_batch_threshold")]
    pub large_batch_threshold: usize,
    #[serde(default = "default_flush_interval_s")]
    pub flush_interval_s: f64,
    #[serde(default = "default_output_thread_sleep_s")]
    pub output_thread_sleep_s: f64,
    #[serde(default = "default_csv_delimiter")]
    pub csv_delimiter: char,
    #[serde(default = "default_include_header")]
    pub include_header: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            large_batch_threshold: default_large_batch_threshold(),
            flush_interval_s: default_flush_interval_s(),
            output_thread_sleep_s: default_output_thread_sleep_s(),
            csv_delimiter: default_csv_delimiter(),
            include_header: default_include_header(),
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("temp/monitor.pid")
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            pid_file: default_pid_file(),
        }
    }
}

/// One monitor's raw option bag, still untyped: each concrete monitor
/// validates its own recognized keys out of this map and rejects anything
/// it does not recognize.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MonitorConfig {
    #[serde(flatten)]
    pub raw: BTreeMap<String, serde_yaml::Value>,
}

impl MonitorConfig {
    pub fn enabled(&self) -> bool {
        self.raw
            .get("enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, MonitorError> {
        match self.raw.get(key) {
            None => Ok(None),
            Some(v) => v.as_bool().map(Some).ok_or_else(|| MonitorError::Config {
                key: key.to_string(),
                reason: "expected a boolean".to_string(),
            }),
        }
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>, MonitorError> {
        match self.raw.get(key) {
            None => Ok(None),
            Some(v) => v.as_f64().map(Some).ok_or_else(|| MonitorError::Config {
                key: key.to_string(),
                reason: "expected a number".to_string(),
            }),
        }
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, MonitorError> {
        match self.raw.get(key) {
            None => Ok(None),
            Some(v) => v.as_u64().map(Some).ok_or_else(|| MonitorError::Config {
                key: key.to_string(),
                reason: "expected a non-negative integer".to_string(),
            }),
        }
    }

    pub fn get_str_list(&self, key: &str) -> Result<Option<Vec<String>>, MonitorError> {
        match self.raw.get(key) {
            None => Ok(None),
            Some(serde_yaml::Value::Sequence(seq)) => {
                let mut out = Vec::with_capacity(seq.len());
                for item in seq {
                    let s = item.as_str().ok_or_else(|| MonitorError::Config {
                        key: key.to_string(),
                        reason: "expected a list of strings".to_string(),
                    })?;
                    out.push(s.to_string());
                }
                Ok(Some(out))
            }
            Some(_) => Err(MonitorError::Config {
                key: key.to_string(),
                reason: "expected a list of strings".to_string(),
            }),
        }
    }

    /// Reads a key whose value is a mapping of `name -> bool`, e.g.
    /// `monitor_categories: { file_io: true, network: false }`.
    pub fn get_bool_map(&self, key: &str) -> Result<Option<BTreeMap<String, bool>>, MonitorError> {
        match self.raw.get(key) {
            None => Ok(None),
            Some(serde_yaml::Value::Mapping(map)) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    let name = k.as_str().ok_or_else(|| MonitorError::Config {
                        key: key.to_string(),
                        reason: "expected string keys".to_string(),
                    })?;
                    let flag = v.as_bool().ok_or_else(|| MonitorError::Config {
                        key: format!("{key}.{name}"),
                        reason: "expected a boolean".to_string(),
                    })?;
                    out.insert(name.to_string(), flag);
                }
                Ok(Some(out))
            }
            Some(_) => Err(MonitorError::Config {
                key: key.to_string(),
                reason: "expected a mapping of name to boolean".to_string(),
            }),
        }
    }

    /// Rejects any key not named in `known`; called by each monitor's
    /// `validate_config` after it has pulled out the keys it recognizes.
    pub fn reject_unknown_keys(&self, known: &[&str]) -> Result<(), MonitorError> {
        for key in self.raw.keys() {
            if !known.contains(&key.as_str()) {
                return Err(MonitorError::Config {
                    key: key.clone(),
                    reason: "unrecognized option for this monitor".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawDocument {
    #[serde(default)]
    app: AppConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    output: GlobalConfig,
    #[serde(default)]
    monitors: BTreeMap<String, MonitorConfig>,
}

impl Default for RawDocument {
    fn default() -> Self {
        RawDocument {
            app: AppConfig::default(),
            logging: LoggingConfig::default(),
            output: GlobalConfig::default(),
            monitors: BTreeMap::new(),
        }
    }
}

pub struct ConfigStore {
    pub app: AppConfig,
    pub logging: LoggingConfig,
    pub output: GlobalConfig,
    pub monitors: BTreeMap<MonitorType, MonitorConfig>,
}

impl ConfigStore {
    /// Loads and validates `path`. A missing file falls back to an
    /// all-defaults document (no monitors enabled); a present-but-malformed
    /// file is a hard `ConfigError`, never a silent default.
    pub fn load(path: &Path) -> Result<Self, MonitorError> {
        let doc: RawDocument = match fs::read_to_string(path) {
            Ok(contents) => serde_yaml::from_str(&contents).map_err(|e| MonitorError::Config {
                key: path.display().to_string(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RawDocument::default(),
            Err(e) => {
                return Err(MonitorError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let mut monitors = BTreeMap::new();
        for (name, cfg) in doc.monitors {
            let ty = MonitorType::parse(&name).ok_or_else(|| MonitorError::Config {
                key: format!("monitors.{name}"),
                reason: "not a registered monitor type".to_string(),
            })?;
            monitors.insert(ty, cfg);
        }

        Ok(ConfigStore {
            app: doc.app,
            logging: doc.logging,
            output: doc.output,
            monitors,
        })
    }

    pub fn monitor_config(&self, ty: MonitorType) -> MonitorConfig {
        self.monitors.get(&ty).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let store = ConfigStore::load(Path::new("/nonexistent/path.yaml")).unwrap();
        assert_eq!(store.output.buffer_size, 2000);
        assert!(store.monitors.is_empty());
    }

    #[test]
    fn unknown_monitor_type_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        let mut f = file.reopen().unwrap();
        writeln!(f, "monitors:\n  not_a_real_monitor:\n    enabled: true").unwrap();
        let err = ConfigStore::load(file.path()).unwrap_err();
        assert!(matches!(err, MonitorError::Config { .. }));
    }

    #[test]
    fn rejects_unrecognized_monitor_key() {
        let cfg: MonitorConfig = serde_yaml::from_str("enabled: true\nbogus_key: 1").unwrap();
        let err = cfg.reject_unknown_keys(&["enabled"]).unwrap_err();
        assert!(matches!(err, MonitorError::Config { key, .. } if key == "bogus_key"));
    }

    #[test]
    fn reads_bool_map() {
        let cfg: MonitorConfig =
            serde_yaml::from_str("enabled: true\nmonitor_categories:\n  file_io: true\n  network: false").unwrap();
        let map = cfg.get_bool_map("monitor_categories").unwrap().unwrap();
        assert_eq!(map.get("file_io"), Some(&true));
        assert_eq!(map.get("network"), Some(&false));
    }

    #[test]
    fn parses_full_document() {
        let yaml = r#"
app:
  pid_file: /tmp/x.pid
output:
  buffer_size: 10
  csv_delimiter: ";"
monitors:
  syscall:
    enabled: true
    interval: 1.0
    monitor_categories:
      file_io: true
"#;
        let file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        let mut f = file.reopen().unwrap();
        write!(f, "{yaml}").unwrap();
        let store = ConfigStore::load(file.path()).unwrap();
        assert_eq!(store.output.buffer_size, 10);
        assert_eq!(store.output.csv_delimiter, ';');
        assert!(store.monitors.contains_key(&MonitorType::Syscall));
    }
}
