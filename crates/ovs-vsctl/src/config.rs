//! Environment configuration
//!
//! Settings come from the process environment, optionally seeded from
//! `/etc/ovs-vsctl/environment` or a `.env` file in the working directory.
//!
//! ## Usage
//!
//! ```no_run
//! use ovs_vsctl::config::{load_environment, VsctlConfig};
//!
//! load_environment();
//! let config = VsctlConfig::from_env().unwrap();
//! println!("{}", config.remote);
//! ```
//!
//! | Variable | Meaning |
//! |---|---|
//! | `OVS_RUNDIR` | directory holding `db.sock` |
//! | `OVS_PKGDATADIR` | directory holding `vswitch.ovsschema` |
//! | `OVSDB_REMOTE` | full remote, overrides `OVS_RUNDIR` |
//! | `OVSDB_SCHEMA` | schema path, overrides `OVS_PKGDATADIR` |
//! | `OVSDB_MAX_ATTEMPTS` | commit attempts before giving up |
//! | `OVSDB_DEADLINE_MS` | overall deadline of one retried transaction, 0 disables |
//! | `OVSDB_RPC_TIMEOUT_MS` | deadline of a single request |
//! | `OVSDB_LOCK` | database lock to hold while writing |

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use ovs_idl::IdlOptions;

use crate::error::{Result, VsctlError};
use crate::retry::RetryPolicy;

/// Environment files, in order of priority
pub const ENV_FILE_PATHS: &[&str] = &["/etc/ovs-vsctl/environment", ".env"];

pub const DEFAULT_RUNDIRS: &[&str] = &["/var/run/openvswitch", "/run/openvswitch"];
pub const DEFAULT_PKGDATADIR: &str = "/usr/share/openvswitch";

/// Load variables from the first environment file found.
///
/// `OVS_VSCTL_ENV_FILE` names a file to try first. Variables already set
/// in the environment are left alone. Returns the path that was loaded.
pub fn load_environment() -> Option<String> {
    if let Ok(custom_path) = std::env::var("OVS_VSCTL_ENV_FILE") {
        if let Some(path) = try_load_env_file(&custom_path) {
            return Some(path);
        }
    }

    for path in ENV_FILE_PATHS {
        if let Some(loaded) = try_load_env_file(path) {
            return Some(loaded);
        }
    }

    debug!("No environment file found, using existing environment");
    None
}

fn try_load_env_file(path: &str) -> Option<String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Failed to read environment file {}: {}", path, e);
            return None;
        }
    };

    let mut loaded = 0;
    let mut skipped = 0;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = parse_env_line(line) else {
            continue;
        };
        if std::env::var_os(&key).is_some() {
            skipped += 1;
            debug!("Skipped (already set): {}", key);
        } else {
            debug!("Loaded: {}={}", key, value);
            std::env::set_var(&key, &value);
            loaded += 1;
        }
    }

    info!(
        "Loaded {} environment variables from {} ({} already set)",
        loaded, path, skipped
    );
    Some(path.to_string())
}

/// Parse `KEY=VALUE`, `KEY="VALUE"` or `KEY='VALUE'`
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() {
        return None;
    }

    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}

/// Where and how to reach ovsdb-server
#[derive(Debug, Clone)]
pub struct VsctlConfig {
    /// `unix:PATH` or `tcp:HOST:PORT`
    pub remote: String,
    /// Path of the `.ovsschema` file
    pub schema: PathBuf,
    pub retry: RetryPolicy,
    pub rpc_timeout: Duration,
    pub lock: Option<String>,
}

impl Default for VsctlConfig {
    fn default() -> Self {
        Self {
            remote: format!("unix:{}/db.sock", default_rundir()),
            schema: Path::new(DEFAULT_PKGDATADIR).join("vswitch.ovsschema"),
            retry: RetryPolicy::default(),
            rpc_timeout: IdlOptions::default().rpc_timeout,
            lock: None,
        }
    }
}

impl VsctlConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(rundir) = get("OVS_RUNDIR") {
            config.remote = format!("unix:{}/db.sock", rundir.trim_end_matches('/'));
        }
        if let Some(remote) = get("OVSDB_REMOTE") {
            config.remote = remote;
        }
        if let Some(pkgdatadir) = get("OVS_PKGDATADIR") {
            config.schema = Path::new(&pkgdatadir).join("vswitch.ovsschema");
        }
        if let Some(schema) = get("OVSDB_SCHEMA") {
            config.schema = PathBuf::from(schema);
        }
        if let Some(attempts) = get("OVSDB_MAX_ATTEMPTS") {
            let attempts: u32 = parse_number("OVSDB_MAX_ATTEMPTS", &attempts)?;
            if attempts == 0 {
                return Err(VsctlError::Config("OVSDB_MAX_ATTEMPTS must be at least 1".into()));
            }
            config.retry.max_attempts = attempts;
        }
        if let Some(deadline) = get("OVSDB_DEADLINE_MS") {
            let ms: u64 = parse_number("OVSDB_DEADLINE_MS", &deadline)?;
            config.retry.deadline = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(timeout) = get("OVSDB_RPC_TIMEOUT_MS") {
            config.rpc_timeout = Duration::from_millis(parse_number("OVSDB_RPC_TIMEOUT_MS", &timeout)?);
        }
        config.lock = get("OVSDB_LOCK");

        Ok(config)
    }

    /// Session options derived from this configuration
    pub fn idl_options(&self) -> IdlOptions {
        IdlOptions {
            rpc_timeout: self.rpc_timeout,
            lock_name: self.lock.clone(),
            ..IdlOptions::default()
        }
    }
}

fn default_rundir() -> &'static str {
    DEFAULT_RUNDIRS
        .iter()
        .copied()
        .find(|dir| Path::new(dir).is_dir())
        .unwrap_or(DEFAULT_RUNDIRS[0])
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| VsctlError::Config(format!("{} is not a valid number: {}", key, value)))
}
