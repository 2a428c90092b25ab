//! Kernel compatibility gate
//!
//! Runs once before any probe is loaded. A rejected kernel disables network
//! tracing only; the rest of the agent keeps running.
//!
//! Versions are handled as kernel version codes,
//! `(major << 16) | (minor << 8) | patch`, the same encoding as the
//! kernel's `KERNEL_VERSION` macro.

use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Oldest kernel the probes are known to work on
pub const MIN_KERNEL_VERSION: (u32, u32, u32) = (4, 4, 0);

/// Ubuntu 4.4.119 through 4.4.126 shipped a broken eBPF verifier backport
const DEFECTIVE_MAJOR_MINOR: (u32, u32) = (4, 4);
const DEFECTIVE_PATCHES: std::ops::RangeInclusive<u32> = 119..=126;

/// Compatibility errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompatError {
    #[error("Invalid kernel version string {0:?}, expected X.Y.Z")]
    Parse(String),

    #[error("Kernel {found} is older than the minimum supported version {minimum}")]
    BelowMinimum { found: String, minimum: String },

    #[error("Kernel {0} is in the range 4.4.119-4.4.126 which has a known eBPF defect")]
    KnownDefective(String),

    #[error("Kernel {0} is excluded by configuration")]
    Excluded(String),

    #[error("Failed to determine running kernel version: {0}")]
    Release(String),
}

pub type CompatResult<T> = Result<T, CompatError>;

/// Encode a kernel version
pub fn linux_kernel_version_code(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 16) | (minor.min(255) << 8) | patch.min(255)
}

/// Parse `"X.Y.Z"` into a kernel version code
pub fn string_to_kernel_code(version: &str) -> CompatResult<u32> {
    let parts: Vec<&str> = version.trim().split('.').collect();
    if parts.len() != 3 {
        return Err(CompatError::Parse(version.to_string()));
    }

    let mut nums = [0u32; 3];
    for (slot, part) in nums.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .map_err(|_| CompatError::Parse(version.to_string()))?;
    }

    Ok(linux_kernel_version_code(nums[0], nums[1], nums[2]))
}

/// Render a kernel version code as `"X.Y.Z"`
pub fn kernel_code_to_string(code: u32) -> String {
    format!("{}.{}.{}", code >> 16, (code >> 8) & 0xff, code & 0xff)
}

/// Decide whether tracing may run on the given kernel
pub fn verify_os_version(code: u32, excluded: &[String]) -> CompatResult<()> {
    let current = kernel_code_to_string(code);

    if excluded.iter().any(|v| v.trim() == current) {
        return Err(CompatError::Excluded(current));
    }

    let (major, minor, patch) = MIN_KERNEL_VERSION;
    let minimum = linux_kernel_version_code(major, minor, patch);
    if code < minimum {
        return Err(CompatError::BelowMinimum {
            found: current,
            minimum: kernel_code_to_string(minimum),
        });
    }

    let (major, minor) = DEFECTIVE_MAJOR_MINOR;
    let low = linux_kernel_version_code(major, minor, *DEFECTIVE_PATCHES.start());
    let high = linux_kernel_version_code(major, minor, *DEFECTIVE_PATCHES.end());
    if (low..=high).contains(&code) {
        return Err(CompatError::KnownDefective(current));
    }

    debug!("Kernel {} passed compatibility checks", current);
    Ok(())
}

/// Parse a kernel release such as `5.15.0-91-generic` or `6.1`
pub fn parse_release(release: &str) -> Option<(u32, u32, u32)> {
    let parts: Vec<&str> = release.trim().split('.').collect();

    if parts.len() >= 2 {
        let major = parts[0].parse().ok()?;
        let minor = parts[1].split('-').next()?.parse().ok()?;
        let patch = parts
            .get(2)
            .and_then(|p| p.split(|c: char| !c.is_ascii_digit()).next())
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);

        Some((major, minor, patch))
    } else {
        None
    }
}

/// Version code of the running kernel
pub fn current_kernel_version_code() -> CompatResult<u32> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map_err(|e| CompatError::Release(e.to_string()))?;
    let (major, minor, patch) =
        parse_release(&release).ok_or_else(|| CompatError::Release(release.trim().to_string()))?;
    Ok(linux_kernel_version_code(major, minor, patch))
}

/// Check if eBPF is available on this system
pub fn check_ebpf_available() -> bool {
    if !Path::new("/sys/fs/bpf").exists() {
        warn!("BPF filesystem not mounted at /sys/fs/bpf");
        return false;
    }

    if !Path::new("/sys/kernel/btf/vmlinux").exists() {
        warn!("BTF not available - CO-RE programs may not work");
    }

    true
}
