//! cgroup v2 management for the proxy's own group
//!
//! The proxy runs inside a dedicated sub-group so the connect hook can tell
//! its upstream connects apart from application traffic. The group's identity
//! is the inode number of its directory, which is what
//! `bpf_get_current_cgroup_id` reports on cgroup v2.

use crate::{InterposeError, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PROCS_FILE: &str = "cgroup.procs";

pub struct CgroupManager {
    root: PathBuf,
    group: String,
}

impl CgroupManager {
    pub fn new(root: impl Into<PathBuf>, group: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            group: group.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn group_path(&self) -> PathBuf {
        self.root.join(&self.group)
    }

    /// Fail early when `root` is not a cgroup v2 mount
    pub fn verify_root(&self) -> Result<()> {
        if !self.root.join("cgroup.controllers").exists() {
            return Err(InterposeError::cgroup(
                &self.root,
                "not a cgroup v2 hierarchy (cgroup.controllers missing)",
            ));
        }
        Ok(())
    }

    /// Create the proxy group if it does not exist yet
    pub fn ensure_group(&self) -> Result<PathBuf> {
        let path = self.group_path();
        match fs::create_dir(&path) {
            Ok(()) => info!("Created cgroup {}", path.display()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Reusing cgroup {}", path.display())
            }
            Err(e) => return Err(InterposeError::cgroup(&path, e)),
        }
        Ok(path)
    }

    /// Move `pid` into the proxy group
    pub fn join(&self, pid: u32) -> Result<()> {
        let path = self.group_path();
        append_pid(&path.join(PROCS_FILE), pid)?;
        debug!("Moved pid {} into {}", pid, path.display());
        Ok(())
    }

    /// cgroup id of the proxy group
    pub fn group_id(&self) -> Result<u64> {
        let path = self.group_path();
        let metadata = fs::metadata(&path).map_err(|e| InterposeError::cgroup(&path, e))?;
        Ok(metadata.ino())
    }

    /// Pids currently in the proxy group; an absent group has none
    pub fn pids(&self) -> Result<Vec<u32>> {
        let procs = self.group_path().join(PROCS_FILE);
        let raw = match fs::read_to_string(&procs) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(InterposeError::cgroup(&procs, e)),
        };
        Ok(raw
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    /// Move every pid of the group back to the root group
    pub fn evacuate(&self) -> Result<usize> {
        let pids = self.pids()?;
        let root_procs = self.root.join(PROCS_FILE);
        for pid in &pids {
            append_pid(&root_procs, *pid)?;
        }
        Ok(pids.len())
    }

    /// Remove the proxy group. Members are moved to the root group first since
    /// the kernel refuses to remove a populated cgroup.
    pub fn remove(&self) -> Result<()> {
        let path = self.group_path();
        if !path.exists() {
            return Ok(());
        }
        let moved = self.evacuate()?;
        if moved > 0 {
            debug!("Moved {} pids out of {}", moved, path.display());
        }
        if remove_group_dir(&path)? {
            info!("Removed cgroup {}", path.display());
        }
        Ok(())
    }
}

/// `rmdir` the group; losing the race to another remover counts as done
fn remove_group_dir(path: &Path) -> Result<bool> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("cgroup {} already removed", path.display());
            Ok(false)
        }
        Err(e) => Err(InterposeError::cgroup(path, e)),
    }
}

fn append_pid(procs: &Path, pid: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(procs)
        .map_err(|e| InterposeError::cgroup(procs, e))?;
    writeln!(file, "{}", pid).map_err(|e| InterposeError::cgroup(procs, e))
}
