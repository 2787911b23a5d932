pub mod commands;

use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "interpose")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Transparent cgroup-scoped TCP interception proxy powered by eBPF", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "YAML configuration file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Attach the interception hooks and run the proxy until signalled")]
    Start {
        #[arg(short, long, help = "Proxy listening port")]
        port: Option<u16>,

        #[arg(short, long, help = "Proxy listening address")]
        address: Option<Ipv4Addr>,

        #[arg(long, help = "cgroup v2 root the hooks attach to")]
        cgroup_root: Option<PathBuf>,

        #[arg(short, long, help = "Name of the proxy's own cgroup")]
        group: Option<String>,
    },
    #[command(about = "Stop a running proxy and remove its cgroup")]
    Stop {
        #[arg(long, help = "cgroup v2 root the hooks attach to")]
        cgroup_root: Option<PathBuf>,

        #[arg(short, long, help = "Name of the proxy's own cgroup")]
        group: Option<String>,
    },
}
