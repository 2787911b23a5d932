pub mod cgroup;
pub mod cli;
pub mod config;
pub mod ebpf;
pub mod error;
pub mod metrics;
pub mod proxy;

pub use error::{InterposeError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
