//! Kernel side of the interceptor: hook attachment and registry upkeep

#[cfg(target_os = "linux")]
pub mod loader;
#[cfg(target_os = "linux")]
pub mod maps;
pub mod sweeper;

/// The three cgroup programs making up the interception control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// `cgroup/connect4`: records the destination and rewrites the connect
    Connect4,
    /// `sockops`: ties established sockets to their local endpoint, clears on close
    SockOps,
    /// `cgroup/getsockopt`: answers `SO_ORIGINAL_DST`
    GetSockopt,
}

impl HookKind {
    /// Attach order. The resolver and the lifecycle tracker go in before the
    /// interceptor so nothing is redirected that cannot be resolved.
    pub const ALL: [HookKind; 3] = [HookKind::GetSockopt, HookKind::SockOps, HookKind::Connect4];

    pub const fn as_str(&self) -> &'static str {
        match self {
            HookKind::Connect4 => "connect4",
            HookKind::SockOps => "sock_ops",
            HookKind::GetSockopt => "getsockopt",
        }
    }

    /// Program symbol inside the eBPF object
    pub const fn program_name(&self) -> &'static str {
        match self {
            HookKind::Connect4 => "cg_connect4",
            HookKind::SockOps => "cg_sock_ops",
            HookKind::GetSockopt => "cg_sock_opt",
        }
    }
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
