use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::ids::ClientId;

/// Process-wide configuration loaded from a single INI file (§6).
///
/// The `[main]` section drives process-wide values; every other section
/// names a plugin module to load, with that section's key/value pairs
/// passed to the plugin verbatim — mirroring `master_config.py`'s
/// `plugins()`, which returns "every section except main" as a dict of
/// dicts.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub log_severity: String,
    pub log_file: Option<PathBuf>,
    pub tls_terminator_path: PathBuf,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub public_port: u16,
    pub compression_port: u16,
    pub proxy_master_port: u16,
    /// `host:port` of the external authenticator daemon (§4.10), defaulted
    /// to `127.0.0.1:<authport>` per spec.md's stated connection target.
    pub authenticator_addr: String,
    pub worker_count: usize,
    pub fast_pings: HashSet<ClientId>,
    pub rate_limiter_capacity_factor: f64,
    /// Every non-`[main]` section, verbatim, keyed by section name.
    pub plugins: HashMap<String, HashMap<String, String>>,
}

impl Config {
    /// Load and validate the config file. Missing `[main]` keys fail with
    /// `ConfigError::MissingKey` rather than silently defaulting — unlike
    /// the teacher's YAML config, which is entirely `#[serde(default)]`,
    /// this file is operator-authored per-deployment (ports, DB creds, TLS
    /// paths) and a missing value is a deployment mistake worth failing on.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let ini = ini::Ini::load_from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        let main = ini.section(Some("main")).ok_or_else(|| ConfigError::MissingKey {
            section: "main".into(),
            key: "<section>".into(),
        })?;

        let get = |key: &str| -> Result<String, ConfigError> {
            main.get(key)
                .map(str::to_owned)
                .ok_or_else(|| ConfigError::MissingKey {
                    section: "main".into(),
                    key: key.into(),
                })
        };
        let get_opt = |key: &str| main.get(key).map(str::to_owned);
        let get_port = |key: &str| -> Result<u16, ConfigError> {
            get(key)?.parse().map_err(|_| ConfigError::InvalidValue {
                section: "main".into(),
                key: key.into(),
                reason: "expected a 16-bit port number".into(),
            })
        };

        let worker_count: usize = get_opt("workers")
            .unwrap_or_else(default_worker_count)
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                section: "main".into(),
                key: "workers".into(),
                reason: "expected a positive integer".into(),
            })?;

        let rate_limiter_capacity_factor: f64 = get_opt("rate_limiter_capacity_factor")
            .unwrap_or_else(default_rate_limiter_capacity_factor)
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                section: "main".into(),
                key: "rate_limiter_capacity_factor".into(),
                reason: "expected a floating point number".into(),
            })?;

        let authport: u16 = get_opt("authport")
            .unwrap_or_else(default_authport)
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                section: "main".into(),
                key: "authport".into(),
                reason: "expected a 16-bit port number".into(),
            })?;

        let fast_pings = get_opt("fast_pings")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|hex_cid| ClientId::from_raw_bytes(hex_cid.as_bytes()))
            .collect();

        let mut plugins = HashMap::new();
        for section_name in ini.sections().flatten() {
            if section_name == "main" {
                continue;
            }
            let section = ini.section(Some(section_name)).unwrap();
            let kv = section
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            plugins.insert(section_name.to_string(), kv);
        }

        Ok(Self {
            db_name: get("db")?,
            db_user: get("dbuser")?,
            db_password: get("dbpasswd")?,
            log_severity: get_opt("severity").unwrap_or_else(default_severity),
            log_file: get_opt("log_file").map(PathBuf::from),
            tls_terminator_path: PathBuf::from(get("tls_terminator")?),
            tls_cert: PathBuf::from(get("tls_cert")?),
            tls_key: PathBuf::from(get("tls_key")?),
            public_port: get_port("public_port")?,
            compression_port: get_port("compression_port")?,
            proxy_master_port: get_port("proxy_master_port")?,
            authenticator_addr: format!("127.0.0.1:{authport}"),
            worker_count,
            fast_pings,
            rate_limiter_capacity_factor,
            plugins,
        })
    }
}

fn default_severity() -> String {
    "info".to_string()
}

fn default_worker_count() -> String {
    "4".to_string()
}

fn default_rate_limiter_capacity_factor() -> String {
    "2.0".to_string()
}

fn default_authport() -> String {
    "9999".to_string()
}
