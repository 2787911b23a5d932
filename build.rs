use anyhow::{anyhow, Context};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const PROBE_PACKAGE: &str = "interpose-probes";
const PROBE_BINARY: &str = "interpose-hooks";

fn main() -> anyhow::Result<()> {
    println!("cargo:rerun-if-changed=interpose-probes/src");
    println!("cargo:rerun-if-changed=interpose-common/src");

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let probe_path = out_dir.join(PROBE_BINARY);

    // Skip eBPF build if we're already building for the eBPF target
    if env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default() == "bpf" {
        return Ok(());
    }

    // Skip eBPF build on non-Linux platforms
    if env::consts::OS != "linux" {
        return skip(
            &probe_path,
            &format!("eBPF compilation skipped on {}", env::consts::OS),
        );
    }

    // Skip eBPF build in CI (no bpf-linker available)
    if env::var("CI").is_ok() {
        return skip(&probe_path, "eBPF compilation skipped in CI");
    }

    if !bpf_linker_available() {
        return skip(&probe_path, "bpf-linker not found, eBPF compilation skipped");
    }

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?);
    let aya_build::cargo_metadata::Metadata { packages, .. } =
        aya_build::cargo_metadata::MetadataCommand::new()
            .manifest_path(manifest_dir.join(PROBE_PACKAGE).join("Cargo.toml"))
            .no_deps()
            .exec()
            .context("MetadataCommand::exec")?;

    let ebpf_package = packages
        .into_iter()
        .find(|pkg| pkg.name == PROBE_PACKAGE)
        .ok_or_else(|| anyhow!("{} package not found", PROBE_PACKAGE))?;

    aya_build::build_ebpf([ebpf_package])?;

    if !probe_path.exists() {
        return Err(anyhow!(
            "eBPF probe compilation failed: {} not found",
            probe_path.display()
        ));
    }

    Ok(())
}

/// Leave an empty object behind so the crate still builds; loading it at
/// runtime fails with a kernel rejection.
fn skip(probe_path: &Path, reason: &str) -> anyhow::Result<()> {
    println!("cargo:warning={}", reason);
    if !probe_path.exists() {
        fs::write(probe_path, b"").context("writing placeholder eBPF object")?;
    }
    Ok(())
}

fn bpf_linker_available() -> bool {
    Command::new("bpf-linker")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}
