//! Hook loading and lifecycle management

use crate::ebpf::maps::KernelRegistry;
use crate::ebpf::HookKind;
use crate::{InterposeError, Result};
use aya::{
    maps::{Array, HashMap},
    programs::{
        cgroup_sock_addr::CgroupSockAddrLinkId, cgroup_sockopt::CgroupSockoptLinkId,
        sock_ops::SockOpsLinkId, CgroupAttachMode, CgroupSockAddr, CgroupSockopt, SockOps,
    },
    Ebpf, EbpfLoader,
};
use interpose_common::{maps, peer_capacity, OriginalDest, PeerKey, ProxyConfig, SocketKey};
use std::fs::File;
use std::path::Path;
use tracing::{debug, info, warn};

/// Minimum kernel for cgroup sockopt hooks plus socket cookies in every
/// program type used here
const MIN_KERNEL: (u32, u32) = (5, 8);

enum Attachment {
    Connect4(CgroupSockAddrLinkId),
    SockOps(SockOpsLinkId),
    GetSockopt(CgroupSockoptLinkId),
}

impl Attachment {
    fn kind(&self) -> HookKind {
        match self {
            Attachment::Connect4(_) => HookKind::Connect4,
            Attachment::SockOps(_) => HookKind::SockOps,
            Attachment::GetSockopt(_) => HookKind::GetSockopt,
        }
    }
}

/// Owns the loaded eBPF object and every attachment made from it
pub struct ProbeManager {
    bpf: Ebpf,
    configured: bool,
    attachments: Vec<Attachment>,
}

impl ProbeManager {
    /// Load the interception hooks with room for `capacity` intercepted sockets
    pub fn load(capacity: u32) -> Result<Self> {
        run_preflight_checks()?;

        info!("Loading interception hooks (registry capacity {})...", capacity);
        let mut bpf = EbpfLoader::new()
            .set_max_entries(maps::SOCKS, capacity)
            .set_max_entries(maps::PEERS, peer_capacity(capacity))
            .load(aya::include_bytes_aligned!(concat!(
                env!("OUT_DIR"),
                "/interpose-hooks"
            )))
            .map_err(|e| InterposeError::kernel("object", e))?;

        for hook in HookKind::ALL {
            load_program(&mut bpf, hook)?;
            debug!("Loaded {} program", hook);
        }

        Ok(Self {
            bpf,
            configured: false,
            attachments: Vec::new(),
        })
    }

    /// Write the config cell read by every hook
    pub fn configure(&mut self, config: &ProxyConfig) -> Result<()> {
        if !config.is_configured() {
            return Err(InterposeError::Config(
                "proxy port must be set before configuring hooks".into(),
            ));
        }

        let map = self
            .bpf
            .map_mut(maps::CONFIG)
            .ok_or_else(|| InterposeError::kernel(maps::CONFIG, "map not found in eBPF object"))?;
        let mut cell: Array<_, ProxyConfig> =
            Array::try_from(map).map_err(|e| InterposeError::kernel(maps::CONFIG, e))?;
        cell.set(0, config, 0)
            .map_err(|e| InterposeError::kernel(maps::CONFIG, e))?;

        self.configured = true;
        info!(
            "Hooks configured: proxy {}:{}, proxy group id {}",
            interpose_common::raw_to_ipv4(config.proxy_addr),
            config.proxy_port,
            config.group_id
        );
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Attach one hook to `cgroup`. Rejected until `configure` has run.
    pub fn attach(&mut self, hook: HookKind, cgroup: &File) -> Result<()> {
        if !self.configured {
            return Err(InterposeError::NotConfigured);
        }

        let reject = |e: aya::programs::ProgramError| InterposeError::kernel(hook.as_str(), e);
        let attachment = match hook {
            HookKind::Connect4 => {
                let program: &mut CgroupSockAddr = program_mut(&mut self.bpf, hook)?;
                Attachment::Connect4(
                    program
                        .attach(cgroup, CgroupAttachMode::AllowMultiple)
                        .map_err(reject)?,
                )
            }
            HookKind::SockOps => {
                let program: &mut SockOps = program_mut(&mut self.bpf, hook)?;
                Attachment::SockOps(
                    program
                        .attach(cgroup, CgroupAttachMode::AllowMultiple)
                        .map_err(reject)?,
                )
            }
            HookKind::GetSockopt => {
                let program: &mut CgroupSockopt = program_mut(&mut self.bpf, hook)?;
                Attachment::GetSockopt(
                    program
                        .attach(cgroup, CgroupAttachMode::AllowMultiple)
                        .map_err(reject)?,
                )
            }
        };

        self.attachments.push(attachment);
        info!("Attached {} hook", hook);
        Ok(())
    }

    /// Attach every hook in order; on failure, undo whatever got attached.
    pub fn attach_all(&mut self, cgroup_root: &Path) -> Result<()> {
        let cgroup = File::open(cgroup_root).map_err(|e| InterposeError::cgroup(cgroup_root, e))?;

        for hook in HookKind::ALL {
            if let Err(e) = self.attach(hook, &cgroup) {
                self.detach_all();
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn attached(&self) -> Vec<HookKind> {
        self.attachments.iter().map(Attachment::kind).collect()
    }

    /// Detach in reverse attach order. Failures are logged, not fatal.
    pub fn detach_all(&mut self) {
        while let Some(attachment) = self.attachments.pop() {
            let hook = attachment.kind();
            let result = match attachment {
                Attachment::Connect4(link) => program_mut::<CgroupSockAddr>(&mut self.bpf, hook)
                    .and_then(|p| p.detach(link).map_err(|e| InterposeError::kernel(hook.as_str(), e))),
                Attachment::SockOps(link) => program_mut::<SockOps>(&mut self.bpf, hook)
                    .and_then(|p| p.detach(link).map_err(|e| InterposeError::kernel(hook.as_str(), e))),
                Attachment::GetSockopt(link) => program_mut::<CgroupSockopt>(&mut self.bpf, hook)
                    .and_then(|p| p.detach(link).map_err(|e| InterposeError::kernel(hook.as_str(), e))),
            };
            match result {
                Ok(()) => info!("Detached {} hook", hook),
                Err(e) => warn!("Failed to detach {} hook: {}", hook, e),
            }
        }
    }

    /// Hand the registry maps over to userspace (the sweeper)
    pub fn take_registry(&mut self) -> Result<KernelRegistry> {
        let socks = self
            .bpf
            .take_map(maps::SOCKS)
            .ok_or_else(|| InterposeError::kernel(maps::SOCKS, "map not found in eBPF object"))?;
        let peers = self
            .bpf
            .take_map(maps::PEERS)
            .ok_or_else(|| InterposeError::kernel(maps::PEERS, "map not found in eBPF object"))?;

        let socks: HashMap<_, SocketKey, OriginalDest> =
            HashMap::try_from(socks).map_err(|e| InterposeError::kernel(maps::SOCKS, e))?;
        let peers: HashMap<_, PeerKey, SocketKey> =
            HashMap::try_from(peers).map_err(|e| InterposeError::kernel(maps::PEERS, e))?;

        Ok(KernelRegistry::new(socks, peers))
    }

    /// Get mutable reference to the Ebpf object for initializing the EbpfLogger.
    pub fn bpf_mut(&mut self) -> &mut Ebpf {
        &mut self.bpf
    }
}

impl Drop for ProbeManager {
    fn drop(&mut self) {
        if !self.attachments.is_empty() {
            self.detach_all();
        }
    }
}

fn program_mut<'a, P>(bpf: &'a mut Ebpf, hook: HookKind) -> Result<&'a mut P>
where
    &'a mut P: TryFrom<&'a mut aya::programs::Program, Error = aya::programs::ProgramError>,
{
    let program = bpf.program_mut(hook.program_name()).ok_or_else(|| {
        InterposeError::kernel(hook.as_str(), format!("{} not found in eBPF object", hook.program_name()))
    })?;
    program
        .try_into()
        .map_err(|e| InterposeError::kernel(hook.as_str(), e))
}

fn load_program(bpf: &mut Ebpf, hook: HookKind) -> Result<()> {
    let reject = |e: aya::programs::ProgramError| InterposeError::kernel(hook.as_str(), e);
    match hook {
        HookKind::Connect4 => program_mut::<CgroupSockAddr>(bpf, hook)?.load().map_err(reject),
        HookKind::SockOps => program_mut::<SockOps>(bpf, hook)?.load().map_err(reject),
        HookKind::GetSockopt => program_mut::<CgroupSockopt>(bpf, hook)?.load().map_err(reject),
    }
}

/// Run pre-flight checks to validate the system can run the hooks
fn run_preflight_checks() -> Result<()> {
    info!("Running pre-flight checks...");

    check_kernel_version()?;
    check_btf();
    check_capabilities();

    info!("Pre-flight checks passed");
    Ok(())
}

fn check_kernel_version() -> Result<()> {
    let output = std::process::Command::new("uname")
        .arg("-r")
        .output()
        .map_err(|e| InterposeError::Preflight(format!("Failed to get kernel version: {}", e)))?;
    let release = String::from_utf8_lossy(&output.stdout);

    let (major, minor) = parse_kernel_release(&release).ok_or_else(|| {
        InterposeError::Preflight(format!("Could not parse kernel version: {}", release.trim()))
    })?;

    if (major, minor) < MIN_KERNEL {
        return Err(InterposeError::Preflight(format!(
            "Kernel {} is too old. Interception requires kernel {}.{}+",
            release.trim(),
            MIN_KERNEL.0,
            MIN_KERNEL.1
        )));
    }

    info!("Kernel version: {} (supported)", release.trim());
    Ok(())
}

/// `"6.1.0-18-amd64"` -> `(6, 1)`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()?;
    Some((major, minor))
}

fn check_btf() {
    if !Path::new("/sys/kernel/btf/vmlinux").exists() {
        warn!("BTF not found at /sys/kernel/btf/vmlinux");
        warn!("Hook loading may fail. Consider a kernel built with CONFIG_DEBUG_INFO_BTF=y");
        return;
    }
    info!("BTF available");
}

fn check_capabilities() {
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        warn!("Not running as root (euid={}). Ensure CAP_BPF, CAP_NET_ADMIN, and CAP_SYS_ADMIN capabilities are granted.", euid);
    } else {
        info!("Running with root privileges");
    }
}
