//! Probes the running kernel/process for the preconditions eBPF attachment
//! needs, and derives the monotone compile-flag ladder described for the
//! probe compiler. Grounded on `cognitod`'s `ensure_environment` /
//! `check_capabilities` / `check_kernel_version` / `parse_kernel_version`.

use std::fs;
use std::path::Path;

use caps::{CapSet, Capability};

use crate::error::MonitorError;

/// Compile-time feature flags derived from the kernel release, strictly
/// monotone in version (see §4.1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileFlags {
    pub kernel_version_4_0_plus: bool,
    pub advanced_features: bool,
    pub enhanced_process_info: bool,
    pub new_tracepoint_support: bool,
    pub security_features: bool,
}

impl CompileFlags {
    fn from_version(major: u32, minor: u32) -> Self {
        let v = (major, minor);
        CompileFlags {
            kernel_version_4_0_plus: v >= (4, 0),
            advanced_features: v >= (4, 18),
            enhanced_process_info: v >= (5, 0),
            new_tracepoint_support: v >= (5, 4),
            security_features: v >= (5, 8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Environment {
    pub kernel_version: (u32, u32, u32),
    pub compile_flags: CompileFlags,
    pub tracing_dir: &'static Path,
}

/// One no-argument `bpf()` dispatch is enough to tell "unavailable" from
/// "available but this particular subcommand was invalid": the syscall
/// returns `EINVAL`/`EPERM` when eBPF is compiled in, `ENOSYS` when it is not.
fn bpf_syscall_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        let ret = unsafe { libc::syscall(libc::SYS_bpf, -1, std::ptr::null::<u8>(), 0usize) };
        if ret < 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(0);
            errno != libc::ENOSYS
        } else {
            true
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

fn tracing_dir() -> Option<&'static Path> {
    const CANDIDATES: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];
    for candidate in CANDIDATES {
        if Path::new(candidate).join("events").is_dir() {
            return Some(Path::new(candidate));
        }
    }
    None
}

fn parse_kernel_version(raw: &str) -> Option<(u32, u32, u32)> {
    let version_part = raw.trim().split('-').next()?;
    let mut segments = version_part.split('.');
    let major = segments.next()?.parse().ok()?;
    let minor = segments.next().unwrap_or("0").parse().ok()?;
    let patch = segments.next().unwrap_or("0").parse().unwrap_or(0);
    Some((major, minor, patch))
}

fn check(check_name: &str, cond: bool, reason: &str) -> Result<(), MonitorError> {
    if cond {
        Ok(())
    } else {
        Err(MonitorError::Environment {
            check: check_name.to_string(),
            reason: reason.to_string(),
        })
    }
}

pub struct CapabilityChecker;

impl CapabilityChecker {
    /// Runs every sub-check and, on success, returns the cached
    /// `Environment` the rest of the process builds on. Each sub-check
    /// fails independently so the reported reason names the actual
    /// violated rule, not a generic "environment invalid".
    pub fn probe() -> Result<Environment, MonitorError> {
        check(
            "effective_uid",
            nix::unistd::geteuid().is_root(),
            "must run as root (or with an equivalent effective UID of 0)",
        )?;

        check(
            "bpf_syscall",
            bpf_syscall_available(),
            "bpf() syscall dispatches ENOSYS: kernel built without CONFIG_BPF_SYSCALL",
        )?;

        check(
            "bpffs",
            Path::new("/sys/fs/bpf").is_dir(),
            "/sys/fs/bpf is not mounted",
        )?;

        let tracing_dir = tracing_dir().ok_or_else(|| MonitorError::Environment {
            check: "tracing_dir".to_string(),
            reason: "neither /sys/kernel/tracing nor /sys/kernel/debug/tracing is populated"
                .to_string(),
        })?;

        check(
            "kprobe_events",
            tracing_dir.join("kprobe_events").exists(),
            "kprobe_events file missing under the tracing pseudo-filesystem",
        )?;

        for cap in [
            Capability::CAP_BPF,
            Capability::CAP_PERFMON,
            Capability::CAP_SYS_ADMIN,
        ] {
            let has_cap = caps::has_cap(None, CapSet::Effective, cap).map_err(|e| {
                MonitorError::Environment {
                    check: format!("capability:{cap:?}"),
                    reason: e.to_string(),
                }
            })?;
            check(
                &format!("capability:{cap:?}"),
                has_cap,
                &format!(
                    "missing {cap:?}; grant with `sudo setcap cap_bpf,cap_perfmon,cap_sys_admin+ep $(command -v monitord)`"
                ),
            )?;
        }

        let release = fs::read_to_string("/proc/sys/kernel/osrelease").map_err(|e| {
            MonitorError::Environment {
                check: "kernel_release".to_string(),
                reason: e.to_string(),
            }
        })?;
        let (major, minor, patch) =
            parse_kernel_version(&release).ok_or_else(|| MonitorError::Environment {
                check: "kernel_release".to_string(),
                reason: format!("unable to parse kernel release string `{release}`"),
            })?;
        check(
            "kernel_version",
            (major, minor) >= (4, 0),
            &format!("kernel {major}.{minor} predates the minimum supported 4.0"),
        )?;

        Ok(Environment {
            kernel_version: (major, minor, patch),
            compile_flags: CompileFlags::from_version(major, minor),
            tracing_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_flags_are_monotone() {
        let f = CompileFlags::from_version(5, 10);
        assert!(f.kernel_version_4_0_plus);
        assert!(f.advanced_features);
        assert!(f.enhanced_process_info);
        assert!(f.new_tracepoint_support);
        assert!(f.security_features);

        let f = CompileFlags::from_version(4, 5);
        assert!(f.kernel_version_4_0_plus);
        assert!(!f.advanced_features);
        assert!(!f.security_features);
    }

    #[test]
    fn parses_kernel_release_with_suffix() {
        assert_eq!(
            parse_kernel_version("5.15.0-105-generic"),
            Some((5, 15, 0))
        );
        assert_eq!(parse_kernel_version("6.1"), Some((6, 1, 0)));
        assert_eq!(parse_kernel_version(""), None);
    }
}
