use crate::cgroup::CgroupManager;
use crate::cli::Commands;
use crate::config::Config;
use crate::{InterposeError, Result};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// How often `stop` checks whether the proxy has exited
const STOP_POLL: Duration = Duration::from_millis(200);

pub async fn handle_command(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Start {
            port,
            address,
            cgroup_root,
            group,
        } => {
            let config = apply_overrides(config, port, address, cgroup_root, group);
            config.validate()?;
            start(config).await
        }
        Commands::Stop { cgroup_root, group } => {
            let config = apply_overrides(config, None, None, cgroup_root, group);
            config.validate()?;
            stop(config).await
        }
    }
}

fn apply_overrides(
    mut config: Config,
    port: Option<u16>,
    address: Option<Ipv4Addr>,
    cgroup_root: Option<PathBuf>,
    group: Option<String>,
) -> Config {
    if let Some(port) = port {
        config.proxy_port = port;
    }
    if let Some(address) = address {
        config.proxy_addr = address;
    }
    if let Some(root) = cgroup_root {
        config.cgroup_root = root;
    }
    if let Some(group) = group {
        config.proxy_group = group;
    }
    config
}

#[cfg(not(target_os = "linux"))]
async fn start(_config: Config) -> Result<()> {
    Err(InterposeError::UnsupportedPlatform(format!(
        "interception hooks require Linux, running on {}",
        std::env::consts::OS
    )))
}

#[cfg(target_os = "linux")]
async fn start(config: Config) -> Result<()> {
    let cgroups = CgroupManager::new(&config.cgroup_root, &config.proxy_group);
    cgroups.verify_root()?;
    cgroups.ensure_group()?;

    let result = run_proxy(&config, &cgroups).await;

    if let Err(e) = cgroups.remove() {
        warn!("Failed to remove proxy cgroup: {}", e);
    }
    result
}

#[cfg(target_os = "linux")]
async fn run_proxy(config: &Config, cgroups: &CgroupManager) -> Result<()> {
    use crate::ebpf::loader::ProbeManager;
    use crate::ebpf::sweeper::{self, IdleSweeper};
    use crate::metrics::{PrometheusExporter, ProxyMetrics};
    use crate::proxy::{LogSink, OriginalDstResolver, Pipeline, PipelineConfig, ProxyListener};
    use aya_log::EbpfLogger;
    use interpose_common::{ipv4_to_raw, ProxyConfig};
    use std::sync::Arc;
    use tokio::signal::unix::{signal, SignalKind};
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    cgroups.join(std::process::id())?;
    let group_id = cgroups.group_id()?;
    info!(
        "Joined {} (cgroup id {})",
        cgroups.group_path().display(),
        group_id
    );

    let mut manager = ProbeManager::load(config.registry_capacity)?;

    if let Err(e) = EbpfLogger::init(manager.bpf_mut()) {
        warn!(
            "Failed to initialize EbpfLogger: {}. Kernel hook logs will not be visible.",
            e
        );
    }

    manager.configure(&ProxyConfig {
        proxy_addr: ipv4_to_raw(config.proxy_addr),
        proxy_port: config.proxy_port,
        _padding: 0,
        group_id,
    })?;

    let metrics = ProxyMetrics::new()?;
    let listener = ProxyListener::bind(config.listen_addr(), config.reuse_port)?;
    manager.attach_all(&config.cgroup_root)?;
    let registry = manager.take_registry()?;

    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();

    tokio::spawn(sweeper::run(
        registry,
        IdleSweeper::new(config.idle_timeout()),
        config.sweep_interval(),
        metrics.clone(),
        shutdown.clone(),
    ));

    if let Some(addr) = config.metrics_addr {
        let exporter = PrometheusExporter::bind(metrics.clone(), addr).await?;
        tokio::spawn(exporter.serve(shutdown.clone()));
    }

    let pipeline = Arc::new(Pipeline::new(
        Arc::new(OriginalDstResolver),
        Arc::new(LogSink),
        metrics,
        PipelineConfig {
            connect_timeout: config.connect_timeout(),
            tap_queue_depth: config.tap_queue_depth,
            listen_addr: config.listen_addr(),
        },
    ));
    let server = tokio::spawn(listener.serve(pipeline, shutdown.clone(), tracker.clone()));

    info!(
        "interpose running: redirecting {} to {}. Press Ctrl+C to exit.",
        config.cgroup_root.display(),
        config.listen_addr()
    );

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = terminate.recv() => info!("Termination signal received"),
    }

    // stop redirecting before the listener goes away
    manager.detach_all();
    shutdown.cancel();
    if let Err(e) = server.await {
        warn!("Listener task failed: {}", e);
    }

    tracker.close();
    if tokio::time::timeout(config.shutdown_grace(), tracker.wait())
        .await
        .is_err()
    {
        warn!(
            "{} connections still open after {:?}, dropping them",
            tracker.len(),
            config.shutdown_grace()
        );
    }

    info!("interpose stopped");
    Ok(())
}

async fn stop(config: Config) -> Result<()> {
    let cgroups = CgroupManager::new(&config.cgroup_root, &config.proxy_group);
    let own_pid = std::process::id();
    let pids: Vec<u32> = cgroups
        .pids()?
        .into_iter()
        .filter(|pid| *pid != own_pid)
        .collect();

    if pids.is_empty() {
        info!("No proxy running in {}", cgroups.group_path().display());
        return cgroups.remove();
    }

    for pid in &pids {
        info!("Sending SIGTERM to {}", pid);
        let ret = unsafe { libc::kill(*pid as libc::pid_t, libc::SIGTERM) };
        if ret != 0 {
            warn!(
                "Failed to signal {}: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }

    let deadline = config.shutdown_grace() + Duration::from_secs(5);
    let drained = tokio::time::timeout(deadline, async {
        loop {
            match cgroups.pids() {
                Ok(left) if left.iter().all(|pid| *pid == own_pid) => break,
                Ok(_) => {}
                Err(e) => warn!("Failed to read proxy cgroup: {}", e),
            }
            tokio::time::sleep(STOP_POLL).await;
        }
    })
    .await;

    if drained.is_err() {
        return Err(InterposeError::cgroup(
            &cgroups.group_path(),
            format!("proxy still running after {:?}", deadline),
        ));
    }

    cgroups.remove()?;
    info!("Proxy stopped");
    Ok(())
}
