//! `interrupt` — aggregate snapshot-and-drain: per-(comm, irq kind, cpu)
//! interrupt counters. No filtering options; every row is emitted.

use std::sync::atomic::Ordering;
use std::time::Duration;

use probe_common::{irq_type, InterruptKey, InterruptStats};

use crate::config::MonitorConfig;
use crate::context::MonitorContext;
use crate::error::MonitorError;
use crate::monitor::aggregate::AggregateDriver;
use crate::monitor::{FieldValue, Monitor, MonitorState, MonitorType, Record};
use crate::output::ProducerHandle;

pub const CSV_HEADER: &[&str] = &[
    "timestamp",
    "time_str",
    "comm",
    "irq_type",
    "irq_type_str",
    "cpu",
    "count",
];

/// Highest-priority matching flag wins: `HARD > TIMER > NETWORK > BLOCK >
/// SOFT`, matching the original console formatter's precedence.
fn irq_type_str(flags: u32) -> &'static str {
    if flags & irq_type::HARDWARE != 0 {
        "HARD"
    } else if flags & irq_type::TIMER != 0 {
        "TIMER"
    } else if flags & irq_type::NETWORK != 0 {
        "NETWORK"
    } else if flags & irq_type::BLOCK != 0 {
        "BLOCK"
    } else if flags & irq_type::SOFTWARE != 0 {
        "SOFT"
    } else {
        "UNKNOWN"
    }
}

pub struct InterruptMonitor {
    ctx: MonitorContext,
    state: MonitorState,
    driver: AggregateDriver,
}

impl InterruptMonitor {
    pub fn new(ctx: MonitorContext, config: &MonitorConfig) -> Result<Self, MonitorError> {
        Self::validate_config(config)?;
        let interval = config.get_f64("interval")?.unwrap_or(2.0);
        Ok(InterruptMonitor {
            ctx,
            state: MonitorState::default(),
            driver: AggregateDriver::new("INTERRUPT_STATS", Duration::from_secs_f64(interval)),
        })
    }
}

fn to_record(key: InterruptKey, stats: InterruptStats) -> Option<Record> {
    Some(
        Record::new()
            .set(
                "comm",
                FieldValue::Str(probe_common::bytes_to_str(&key.comm).to_string()),
            )
            .set("irq_type", FieldValue::UInt(key.irq_type as u64))
            .set("irq_type_str", FieldValue::Str(irq_type_str(key.irq_type).to_string()))
            .set("cpu", FieldValue::UInt(key.cpu as u64))
            .set("count", FieldValue::UInt(stats.count)),
    )
}

impl Monitor for InterruptMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::Interrupt
    }

    fn validate_config(config: &MonitorConfig) -> Result<(), MonitorError> {
        config.reject_unknown_keys(&["enabled", "interval"])?;
        config.get_f64("interval")?;
        Ok(())
    }

    fn required_tracepoints(&self) -> &'static [&'static str] {
        &["irq:irq_handler_entry", "irq:softirq_entry"]
    }

    fn load(&self, ebpf: &mut aya::Ebpf) -> Result<(), MonitorError> {
        use aya::programs::TracePoint;

        if self.state.loaded.load(Ordering::Relaxed) {
            return Ok(());
        }
        for (prog_name, name) in [
            ("trace_irq_handler_entry", "irq_handler_entry"),
            ("trace_softirq_entry", "softirq_entry"),
        ] {
            let program: &mut TracePoint = ebpf
                .program_mut(prog_name)
                .ok_or_else(|| MonitorError::Load {
                    monitor: "interrupt".to_string(),
                    reason: format!("{prog_name} program not found in probe-ebpf object"),
                })?
                .try_into()
                .map_err(|e: aya::programs::ProgramError| MonitorError::Load {
                    monitor: "interrupt".to_string(),
                    reason: e.to_string(),
                })?;
            program.load().map_err(|e| MonitorError::Load {
                monitor: "interrupt".to_string(),
                reason: e.to_string(),
            })?;
            program.attach(name, "irq").map_err(|e| MonitorError::Load {
                monitor: "interrupt".to_string(),
                reason: e.to_string(),
            })?;
        }
        self.state.loaded.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn run(&self, tx: ProducerHandle) -> Result<(), MonitorError> {
        let _ = (tx, &self.ctx);
        self.state.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&self) {
        self.driver.stop();
        self.state.running.store(false, Ordering::Relaxed);
    }

    fn cleanup(&self) {
        self.state.loaded.store(false, Ordering::Relaxed);
    }

    fn csv_header(&self) -> &'static [&'static str] {
        CSV_HEADER
    }

    fn state(&self) -> &MonitorState {
        &self.state
    }
}

impl InterruptMonitor {
    pub fn spawn_drain(&self, ebpf: &mut aya::Ebpf, tx: ProducerHandle) -> Result<(), MonitorError> {
        self.driver.spawn(ebpf, tx, move |key, stats| to_record(key, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_is_hard_timer_network_block_soft() {
        assert_eq!(irq_type_str(irq_type::HARDWARE | irq_type::TIMER), "HARD");
        assert_eq!(irq_type_str(irq_type::TIMER | irq_type::NETWORK), "TIMER");
        assert_eq!(irq_type_str(irq_type::NETWORK | irq_type::BLOCK), "NETWORK");
        assert_eq!(irq_type_str(irq_type::BLOCK | irq_type::SOFTWARE), "BLOCK");
        assert_eq!(irq_type_str(irq_type::SOFTWARE), "SOFT");
        assert_eq!(irq_type_str(0), "UNKNOWN");
    }
}
