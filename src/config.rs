//! Runtime configuration
//!
//! Every field has a default, so an empty YAML document (or no file at all)
//! yields a working setup on a cgroup v2 host.

use crate::{InterposeError, Result};
use interpose_common::DEFAULT_REGISTRY_CAPACITY;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PROXY_PORT: u16 = 18000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the proxy listens on and connects are redirected to
    pub proxy_addr: Ipv4Addr,
    pub proxy_port: u16,
    /// cgroup v2 mount point; hooks attach here
    pub cgroup_root: PathBuf,
    /// Sub-group the proxy places itself into
    pub proxy_group: String,
    pub registry_capacity: u32,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub connect_timeout_ms: u64,
    pub tap_queue_depth: usize,
    pub reuse_port: bool,
    pub shutdown_grace_secs: u64,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_addr: Ipv4Addr::LOCALHOST,
            proxy_port: DEFAULT_PROXY_PORT,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            proxy_group: "interpose".to_string(),
            registry_capacity: DEFAULT_REGISTRY_CAPACITY,
            idle_timeout_secs: 120,
            sweep_interval_secs: 10,
            connect_timeout_ms: 5000,
            tap_queue_depth: 64,
            reuse_port: false,
            shutdown_grace_secs: 5,
            metrics_addr: None,
        }
    }
}

impl Config {
    /// Load a YAML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            InterposeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| InterposeError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxy_port == 0 {
            return Err(InterposeError::Config("proxy_port must be non-zero".into()));
        }
        if self.registry_capacity == 0 {
            return Err(InterposeError::Config(
                "registry_capacity must be non-zero".into(),
            ));
        }
        if self.idle_timeout_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(InterposeError::Config(
                "idle_timeout_secs and sweep_interval_secs must be non-zero".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(InterposeError::Config(
                "connect_timeout_ms must be non-zero".into(),
            ));
        }
        if self.tap_queue_depth == 0 {
            return Err(InterposeError::Config(
                "tap_queue_depth must be non-zero".into(),
            ));
        }
        if self.proxy_group.is_empty() || self.proxy_group.contains('/') {
            return Err(InterposeError::Config(format!(
                "invalid proxy_group {:?}",
                self.proxy_group
            )));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.proxy_addr, self.proxy_port))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
