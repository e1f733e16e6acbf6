//! Per-monitor bundle the factory builds once and hands to each monitor's
//! constructor: logger target, an output-controller producer handle once
//! registration happens, the probe's provenance, and the compile-flag
//! ladder derived by the capability checker.

use crate::capability::CompileFlags;
use crate::monitor::MonitorType;

/// Where a monitor's kernel logic originates. The original design named a
/// `<type>.c` file on disk; every monitor here is instead backed by one or
/// more named programs inside the single precompiled `probe-ebpf` object,
/// loaded once by `MonitorManager` (see SPEC_FULL.md §4.3).
#[derive(Debug, Clone, Copy)]
pub struct EbpfSource {
    pub monitor_type: MonitorType,
    pub program_names: &'static [&'static str],
}

#[derive(Clone)]
pub struct MonitorContext {
    pub monitor_type: MonitorType,
    pub log_target: String,
    pub ebpf_source: EbpfSource,
    pub compile_flags: CompileFlags,
}

impl MonitorContext {
    pub fn new(monitor_type: MonitorType, ebpf_source: EbpfSource, compile_flags: CompileFlags) -> Self {
        MonitorContext {
            monitor_type,
            log_target: format!("monitord::monitor::{}", monitor_type.as_str()),
            ebpf_source,
            compile_flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_target_is_namespaced_per_monitor() {
        let ctx = MonitorContext::new(
            MonitorType::Exec,
            EbpfSource {
                monitor_type: MonitorType::Exec,
                program_names: &["trace_exec"],
            },
            CompileFlags::default(),
        );
        assert_eq!(ctx.log_target, "monitord::monitor::exec");
    }
}
