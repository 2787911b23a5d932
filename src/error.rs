use std::net::{SocketAddr, SocketAddrV4};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InterposeError {
    #[error("kernel rejected {hook}: {reason}")]
    KernelRejection { hook: String, reason: String },

    #[error("hooks must be configured before they are attached")]
    NotConfigured,

    #[error("no original destination for {peer}: {reason}")]
    ResolutionMissing { peer: SocketAddr, reason: String },

    #[error("upstream {addr} unreachable: {source}")]
    UpstreamUnreachable {
        addr: SocketAddrV4,
        #[source]
        source: std::io::Error,
    },

    #[error("relay I/O error: {0}")]
    RelayIo(#[source] std::io::Error),

    #[error("decode failure: {0}")]
    DecodeFailure(String),

    #[error("cgroup error at {path}: {reason}")]
    Cgroup { path: String, reason: String },

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pre-flight check failed: {0}")]
    Preflight(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InterposeError {
    pub fn kernel(hook: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::KernelRejection {
            hook: hook.into(),
            reason: reason.to_string(),
        }
    }

    pub fn cgroup(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        Self::Cgroup {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, InterposeError>;
