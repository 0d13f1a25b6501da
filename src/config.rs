use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::{Path, PathBuf}, time::Duration};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    /// Lock files live here (`locks/port-<P>.lock`).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Per-port proxy config, proxy log and debug bundle.
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,

    /// Parent of the per-namespace resolver files (`<dir>/<ns>/resolv.conf`).
    #[serde(default = "default_netns_etc_dir")]
    pub netns_etc_dir: PathBuf,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    /// Used when the tunnel config carries no DNS line.
    #[serde(default = "default_nameserver")]
    pub nameserver: String,

    /// Host written into emitted connection strings. Probed when unset.
    #[serde(default)]
    pub public_host: Option<String>,

    #[serde(default = "default_kern_log")]
    pub kern_log: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// If set, logs will also be appended here.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level(), file: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_bin")]
    pub bin: PathBuf,

    /// Wait after launch before checking the socket table (ms).
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// HTTP header obfuscation used by the default identity.
    #[serde(default = "default_header_host")]
    pub default_header_host: String,
    #[serde(default = "default_header_path")]
    pub default_header_path: String,

    #[serde(default = "default_log_tail")]
    pub log_tail_lines: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bin: default_proxy_bin(),
            settle_ms: default_settle_ms(),
            default_header_host: default_header_host(),
            default_header_path: default_header_path(),
            log_tail_lines: default_log_tail(),
        }
    }
}

impl ProxyConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_echo_url")]
    pub echo_url: String,
    /// `curl --max-time` for the egress probe, seconds.
    #[serde(default = "default_echo_timeout")]
    pub echo_timeout_s: u64,

    #[serde(default = "default_geo_url")]
    pub geo_url: String,
    #[serde(default = "default_geo_timeout_ms")]
    pub geo_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub geo_enabled: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            echo_url: default_echo_url(),
            echo_timeout_s: default_echo_timeout(),
            geo_url: default_geo_url(),
            geo_timeout_ms: default_geo_timeout_ms(),
            geo_enabled: true,
        }
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_state_dir() -> PathBuf { PathBuf::from("/var/lib/wgns") }
fn default_run_dir() -> PathBuf { PathBuf::from("/tmp") }
fn default_netns_etc_dir() -> PathBuf { PathBuf::from("/etc/netns") }
fn default_nameserver() -> String { "1.1.1.1".to_string() }
fn default_kern_log() -> PathBuf { PathBuf::from("/var/log/kern.log") }
fn default_proxy_bin() -> PathBuf { PathBuf::from("/usr/local/bin/xray-ns") }
fn default_settle_ms() -> u64 { 1500 }
fn default_header_host() -> String { "iran.ir".to_string() }
fn default_header_path() -> String { "/".to_string() }
fn default_log_tail() -> usize { 20 }
fn default_echo_url() -> String { "http://icanhazip.com".to_string() }
fn default_echo_timeout() -> u64 { 1 }
fn default_geo_url() -> String { "http://ip-api.com/json".to_string() }
fn default_geo_timeout_ms() -> u64 { 800 }
fn default_true() -> bool { true }

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            state_dir: default_state_dir(),
            run_dir: default_run_dir(),
            netns_etc_dir: default_netns_etc_dir(),
            proxy: ProxyConfig::default(),
            probe: ProbeConfig::default(),
            nameserver: default_nameserver(),
            public_host: None,
            kern_log: default_kern_log(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&s).with_context(|| format!("parse json {}", path.display()))?;

        if let Some(h) = &cfg.public_host {
            if h.trim().is_empty() {
                cfg.public_host = None;
            }
        }

        Ok(cfg)
    }

    /// `load` when a path is given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}
