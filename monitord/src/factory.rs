//! Builds one concrete monitor per enabled, selected `MonitorType`,
//! wrapping each in the closed `MonitorInstance` dispatch enum `manager.rs`
//! drives. Grounded on `cognitod`'s monitor-construction step in
//! `main.rs`, generalized from a fixed handful of hardcoded monitors to
//! the full `MonitorType::ALL` set driven by config.

use crate::capability::CompileFlags;
use crate::config::{ConfigStore, MonitorConfig};
use crate::context::{EbpfSource, MonitorContext};
use crate::error::MonitorError;
use crate::manager::MonitorInstance;
use crate::monitor::bio::BioMonitor;
use crate::monitor::exec::ExecMonitor;
use crate::monitor::func::FuncMonitor;
use crate::monitor::interrupt::InterruptMonitor;
use crate::monitor::open::OpenMonitor;
use crate::monitor::page_fault::PageFaultMonitor;
use crate::monitor::syscall::SyscallMonitor;
use crate::monitor::MonitorType;

fn ebpf_source(ty: MonitorType) -> EbpfSource {
    let program_names: &'static [&'static str] = match ty {
        MonitorType::Exec => &["trace_exec"],
        MonitorType::Syscall => &["trace_sys_enter", "trace_sys_exit"],
        MonitorType::Bio => &["trace_block_rq_complete"],
        MonitorType::Open => &[
            "trace_sys_enter_open",
            "trace_sys_exit_open",
            "trace_sys_enter_openat",
            "trace_sys_exit_openat",
            "trace_sys_enter_creat",
            "trace_sys_exit_creat",
        ],
        MonitorType::Func => &[], // resolved dynamically at load from kallsyms matches
        MonitorType::Interrupt => &["trace_irq_handler_entry", "trace_softirq_entry"],
        MonitorType::PageFault => &["trace_page_fault_user", "trace_page_fault_kernel"],
    };
    EbpfSource {
        monitor_type: ty,
        program_names,
    }
}

pub struct MonitorFactory<'a> {
    config: &'a ConfigStore,
    compile_flags: CompileFlags,
}

impl<'a> MonitorFactory<'a> {
    pub fn new(config: &'a ConfigStore, compile_flags: CompileFlags) -> Self {
        MonitorFactory {
            config,
            compile_flags,
        }
    }

    fn context(&self, ty: MonitorType) -> MonitorContext {
        MonitorContext::new(ty, ebpf_source(ty), self.compile_flags)
    }

    fn monitor_config(&self, ty: MonitorType) -> MonitorConfig {
        self.config.monitor_config(ty)
    }

    /// Builds every `MonitorType` in `selected` whose config has
    /// `enabled: true`. A type named in `selected` but missing from the
    /// config document, or present but `enabled: false`, is silently
    /// skipped — `selected` narrows, it does not force-enable.
    pub fn build(&self, selected: &[MonitorType]) -> Result<Vec<MonitorInstance>, MonitorError> {
        let mut monitors = Vec::new();
        for &ty in selected {
            let config = self.monitor_config(ty);
            if !config.enabled() {
                continue;
            }
            let ctx = self.context(ty);
            let instance = match ty {
                MonitorType::Exec => MonitorInstance::Exec(ExecMonitor::new(ctx, &config)?),
                MonitorType::Syscall => MonitorInstance::Syscall(SyscallMonitor::new(ctx, &config)?),
                MonitorType::Bio => MonitorInstance::Bio(BioMonitor::new(ctx, &config)?),
                MonitorType::Open => MonitorInstance::Open(OpenMonitor::new(ctx, &config)?),
                MonitorType::Func => MonitorInstance::Func(FuncMonitor::new(ctx, &config)?),
                MonitorType::Interrupt => MonitorInstance::Interrupt(InterruptMonitor::new(ctx, &config)?),
                MonitorType::PageFault => MonitorInstance::PageFault(PageFaultMonitor::new(ctx, &config)?),
            };
            monitors.push(instance);
        }
        Ok(monitors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn skips_monitors_not_enabled() {
        let store = ConfigStore::load(Path::new("/nonexistent/path.yaml")).unwrap();
        let factory = MonitorFactory::new(&store, CompileFlags::default());
        let built = factory.build(&MonitorType::ALL).unwrap();
        assert!(built.is_empty());
    }
}
