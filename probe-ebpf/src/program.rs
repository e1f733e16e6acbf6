use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_ktime_get_ns, bpf_probe_read_kernel_str_bytes,
        bpf_probe_read_user_str_bytes,
    },
    macros::{kprobe, map, tracepoint},
    maps::{HashMap, PerfEventArray},
    programs::{ProbeContext, TracePointContext},
};
use probe_common::{
    BioKey, BioStats, ExecEvent, FuncKey, FuncStats, InterruptKey, InterruptStats, OpenKey,
    OpenStartInfo, OpenStats, PageFaultKey, PageFaultStats, SyscallKey, SyscallStats,
    MAX_FUNC_PROBES,
};

#[map(name = "EXEC_EVENTS")]
static mut EXEC_EVENTS: PerfEventArray<ExecEvent> = PerfEventArray::new(0);

#[map(name = "SYSCALL_STATS")]
static mut SYSCALL_STATS: HashMap<SyscallKey, SyscallStats> = HashMap::with_max_entries(10_240, 0);

#[map(name = "SYSCALL_START")]
static mut SYSCALL_START: HashMap<u64, u64> = HashMap::with_max_entries(10_240, 0);

#[map(name = "BIO_STATS")]
static mut BIO_STATS: HashMap<BioKey, BioStats> = HashMap::with_max_entries(4_096, 0);

#[map(name = "OPEN_STATS")]
static mut OPEN_STATS: HashMap<OpenKey, OpenStats> = HashMap::with_max_entries(4_096, 0);

#[map(name = "OPEN_START")]
static mut OPEN_START: HashMap<u64, OpenStartInfo> = HashMap::with_max_entries(4_096, 0);

#[map(name = "FUNC_STATS")]
static mut FUNC_STATS: HashMap<FuncKey, FuncStats> = HashMap::with_max_entries(4_096, 0);

#[map(name = "INTERRUPT_STATS")]
static mut INTERRUPT_STATS: HashMap<InterruptKey, InterruptStats> =
    HashMap::with_max_entries(1_024, 0);

#[map(name = "PAGE_FAULT_STATS")]
static mut PAGE_FAULT_STATS: HashMap<PageFaultKey, PageFaultStats> =
    HashMap::with_max_entries(4_096, 0);

fn current_comm() -> [u8; 16] {
    bpf_get_current_comm().unwrap_or([0u8; 16])
}

/// Every handler below swallows its own errors and returns `0`: a kprobe or
/// tracepoint that returns a non-zero value aborts the attached call chain,
/// which a telemetry probe must never do.
fn try_or_zero<F: FnOnce() -> Result<(), i64>>(f: F) -> u32 {
    match f() {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

// ---------------------------------------------------------------- exec ----

#[tracepoint]
pub fn trace_exec(ctx: TracePointContext) -> u32 {
    try_or_zero(|| unsafe { try_trace_exec(ctx) })
}

unsafe fn try_trace_exec(ctx: TracePointContext) -> Result<(), i64> {
    let pid_tgid = aya_ebpf::helpers::bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as u32;
    let uid_gid = aya_ebpf::helpers::bpf_get_current_uid_gid();
    let uid = uid_gid as u32;

    let mut event = ExecEvent {
        pid,
        ppid: 0,
        uid,
        _pad: 0,
        ts_ns: bpf_ktime_get_ns(),
        comm: current_comm(),
        filename: [0u8; 256],
    };

    // `sched_process_exec` carries `filename` at a tracepoint-specific
    // offset; the read is bounds-checked for the verifier by aya's helper.
    const FILENAME_OFFSET: usize = 8;
    let _ = bpf_probe_read_kernel_str_bytes(
        ctx.as_ptr().add(FILENAME_OFFSET) as *const u8,
        &mut event.filename,
    );

    EXEC_EVENTS.output(&ctx, &event, 0);
    Ok(())
}

// -------------------------------------------------------------- syscall ---

#[tracepoint]
pub fn trace_sys_enter(ctx: TracePointContext) -> u32 {
    try_or_zero(|| unsafe { try_trace_sys_enter(ctx) })
}

unsafe fn try_trace_sys_enter(ctx: TracePointContext) -> Result<(), i64> {
    let pid_tgid = aya_ebpf::helpers::bpf_get_current_pid_tgid();
    let now = bpf_ktime_get_ns();
    SYSCALL_START
        .insert(&pid_tgid, &now, 0)
        .map_err(|_| 1i64)?;
    let _ = ctx;
    Ok(())
}

#[tracepoint]
pub fn trace_sys_exit(ctx: TracePointContext) -> u32 {
    try_or_zero(|| unsafe { try_trace_sys_exit(ctx) })
}

unsafe fn try_trace_sys_exit(ctx: TracePointContext) -> Result<(), i64> {
    let pid_tgid = aya_ebpf::helpers::bpf_get_current_pid_tgid();
    let start = SYSCALL_START.get(&pid_tgid).copied().unwrap_or(0);
    let now = bpf_ktime_get_ns();
    let dur = now.saturating_sub(start);
    SYSCALL_START.remove(&pid_tgid).ok();

    // `id` and `ret` live at fixed offsets in the `raw_syscalls:sys_exit`
    // tracepoint's format; both are read via the bounds-checked accessor.
    let syscall_nr: i64 = ctx.read_at(8).unwrap_or(-1);
    let ret: i64 = ctx.read_at(16).unwrap_or(0);

    let key = SyscallKey {
        comm: current_comm(),
        syscall_nr: syscall_nr as u32,
        _pad: 0,
    };

    update_syscall_stats(&key, dur, ret < 0);
    Ok(())
}

fn update_syscall_stats(key: &SyscallKey, dur_ns: u64, is_error: bool) {
    unsafe {
        if let Some(stats) = SYSCALL_STATS.get_ptr_mut(key) {
            let stats = &mut *stats;
            stats.count += 1;
            if is_error {
                stats.error_count += 1;
            }
            stats.total_ns += dur_ns;
            if stats.min_ns == 0 || dur_ns < stats.min_ns {
                stats.min_ns = dur_ns;
            }
            if dur_ns > stats.max_ns {
                stats.max_ns = dur_ns;
            }
        } else {
            let stats = SyscallStats {
                count: 1,
                error_count: if is_error { 1 } else { 0 },
                total_ns: dur_ns,
                min_ns: dur_ns,
                max_ns: dur_ns,
            };
            let _ = SYSCALL_STATS.insert(key, &stats, 0);
        }
    }
}

// ------------------------------------------------------------------ bio ---

#[tracepoint]
pub fn trace_block_rq_complete(ctx: TracePointContext) -> u32 {
    try_or_zero(|| unsafe { try_trace_block_rq_complete(ctx) })
}

unsafe fn try_trace_block_rq_complete(ctx: TracePointContext) -> Result<(), i64> {
    let nr_sector: u32 = ctx.read_at(24).unwrap_or(0);
    let rwbs: u32 = ctx.read_at(20).unwrap_or(0);
    let io_type = if rwbs & 0x1 != 0 {
        probe_common::io_type::WRITE
    } else {
        probe_common::io_type::READ
    };

    let key = BioKey {
        comm: current_comm(),
        io_type,
        _pad: 0,
    };
    let bytes = (nr_sector as u64) * 512;

    unsafe {
        if let Some(stats) = BIO_STATS.get_ptr_mut(&key) {
            let stats = &mut *stats;
            stats.count += 1;
            stats.total_bytes += bytes;
        } else {
            let stats = BioStats {
                count: 1,
                total_bytes: bytes,
                total_ns: 0,
                min_ns: 0,
                max_ns: 0,
            };
            let _ = BIO_STATS.insert(&key, &stats, 0);
        }
    }
    Ok(())
}

// ----------------------------------------------------------------- open ---

/// `open`/`openat`/`creat` are each their own syscall tracepoint pair, so
/// the filename argument (a still-live user pointer at syscall entry) can
/// be read straight out of the `sys_enter_*` format, unlike a single
/// `vfs_open` kprobe whose argument layout shifts across kernel versions.
macro_rules! open_family_probe {
    ($enter_fn:ident, $exit_fn:ident, $enter_tp:expr, $exit_tp:expr, $op:expr, $filename_offset:expr) => {
        #[tracepoint]
        pub fn $enter_fn(ctx: TracePointContext) -> u32 {
            try_or_zero(|| unsafe { try_open_enter(ctx, $op, $filename_offset) })
        }

        #[tracepoint]
        pub fn $exit_fn(ctx: TracePointContext) -> u32 {
            try_or_zero(|| unsafe { try_open_exit(ctx) })
        }
    };
}

unsafe fn try_open_enter(ctx: TracePointContext, operation: u32, filename_offset: usize) -> Result<(), i64> {
    let pid_tgid = aya_ebpf::helpers::bpf_get_current_pid_tgid();
    let filename_ptr: u64 = ctx.read_at(filename_offset).unwrap_or(0);

    let mut info = OpenStartInfo {
        start_ns: bpf_ktime_get_ns(),
        operation,
        _pad: 0,
        filename: [0u8; 128],
    };
    if filename_ptr != 0 {
        let _ = bpf_probe_read_user_str_bytes(filename_ptr as *const u8, &mut info.filename);
    }
    OPEN_START.insert(&pid_tgid, &info, 0).map_err(|_| 1i64)?;
    Ok(())
}

unsafe fn try_open_exit(ctx: TracePointContext) -> Result<(), i64> {
    let pid_tgid = aya_ebpf::helpers::bpf_get_current_pid_tgid();
    let info = OPEN_START.get(&pid_tgid).copied();
    OPEN_START.remove(&pid_tgid).ok();
    let info = match info {
        Some(info) => info,
        None => return Ok(()),
    };

    let now = bpf_ktime_get_ns();
    let dur = now.saturating_sub(info.start_ns);
    let ret: i64 = ctx.read_at(16).unwrap_or(0);

    let key = OpenKey {
        comm: current_comm(),
        operation: info.operation,
        _pad: 0,
        filename: info.filename,
    };

    unsafe {
        if let Some(stats) = OPEN_STATS.get_ptr_mut(&key) {
            let stats = &mut *stats;
            stats.count += 1;
            if ret < 0 {
                stats.errors += 1;
            }
            stats.total_ns += dur;
            if stats.min_ns == 0 || dur < stats.min_ns {
                stats.min_ns = dur;
            }
            if dur > stats.max_ns {
                stats.max_ns = dur;
            }
        } else {
            let stats = OpenStats {
                count: 1,
                errors: if ret < 0 { 1 } else { 0 },
                total_ns: dur,
                min_ns: dur,
                max_ns: dur,
                flags: 0,
                _pad: 0,
            };
            let _ = OPEN_STATS.insert(&key, &stats, 0);
        }
    }
    Ok(())
}

// `sys_enter_open(filename@16, flags@24, mode@32)`,
// `sys_enter_openat(dfd@16, filename@24, flags@32, mode@40)`,
// `sys_enter_creat(pathname@16, mode@24)`.
open_family_probe!(
    trace_sys_enter_open,
    trace_sys_exit_open,
    "syscalls:sys_enter_open",
    "syscalls:sys_exit_open",
    probe_common::open_op::OPEN,
    16
);
open_family_probe!(
    trace_sys_enter_openat,
    trace_sys_exit_openat,
    "syscalls:sys_enter_openat",
    "syscalls:sys_exit_openat",
    probe_common::open_op::OPENAT,
    24
);
open_family_probe!(
    trace_sys_enter_creat,
    trace_sys_exit_creat,
    "syscalls:sys_enter_creat",
    "syscalls:sys_exit_creat",
    probe_common::open_op::CREAT,
    16
);

// ----------------------------------------------------------------- func ---

/// Generates `trace_func_0 .. trace_func_{MAX_FUNC_PROBES-1}`: one tiny
/// kprobe per slot, each forwarding to `submit_func_event` with its own
/// compile-time id. The userspace `func` monitor attaches at most
/// `MAX_FUNC_PROBES` of these to kernel symbols matched from
/// `/proc/kallsyms`, by symbol name, at load time.
macro_rules! func_probe {
    ($name:ident, $id:expr) => {
        #[kprobe]
        pub fn $name(_ctx: ProbeContext) -> u32 {
            submit_func_event($id);
            0
        }
    };
}

fn submit_func_event(func_id: u32) {
    let key = FuncKey {
        comm: current_comm(),
        func_id,
        _pad: 0,
    };
    unsafe {
        if let Some(stats) = FUNC_STATS.get_ptr_mut(&key) {
            (&mut *stats).count += 1;
        } else {
            let stats = FuncStats { count: 1 };
            let _ = FUNC_STATS.insert(&key, &stats, 0);
        }
    }
}

func_probe!(trace_func_0, 0);
func_probe!(trace_func_1, 1);
func_probe!(trace_func_2, 2);
func_probe!(trace_func_3, 3);
func_probe!(trace_func_4, 4);
func_probe!(trace_func_5, 5);
func_probe!(trace_func_6, 6);
func_probe!(trace_func_7, 7);
func_probe!(trace_func_8, 8);
func_probe!(trace_func_9, 9);
func_probe!(trace_func_10, 10);
func_probe!(trace_func_11, 11);
func_probe!(trace_func_12, 12);
func_probe!(trace_func_13, 13);
func_probe!(trace_func_14, 14);
func_probe!(trace_func_15, 15);
func_probe!(trace_func_16, 16);
func_probe!(trace_func_17, 17);
func_probe!(trace_func_18, 18);
func_probe!(trace_func_19, 19);
func_probe!(trace_func_20, 20);
func_probe!(trace_func_21, 21);
func_probe!(trace_func_22, 22);
func_probe!(trace_func_23, 23);
func_probe!(trace_func_24, 24);
func_probe!(trace_func_25, 25);
func_probe!(trace_func_26, 26);
func_probe!(trace_func_27, 27);
func_probe!(trace_func_28, 28);
func_probe!(trace_func_29, 29);
func_probe!(trace_func_30, 30);
func_probe!(trace_func_31, 31);

const _: () = assert!(32 == MAX_FUNC_PROBES as usize);

// ------------------------------------------------------------ interrupt ---

#[tracepoint]
pub fn trace_irq_handler_entry(ctx: TracePointContext) -> u32 {
    try_or_zero(|| unsafe { try_trace_irq(ctx, probe_common::irq_type::HARDWARE) })
}

#[tracepoint]
pub fn trace_softirq_entry(ctx: TracePointContext) -> u32 {
    try_or_zero(|| unsafe { try_trace_irq(ctx, probe_common::irq_type::SOFTWARE) })
}

unsafe fn try_trace_irq(_ctx: TracePointContext, irq_type: u32) -> Result<(), i64> {
    let cpu = aya_ebpf::helpers::bpf_get_smp_processor_id();
    let key = InterruptKey {
        comm: current_comm(),
        irq_type,
        cpu,
    };
    unsafe {
        if let Some(stats) = INTERRUPT_STATS.get_ptr_mut(&key) {
            (&mut *stats).count += 1;
        } else {
            let stats = InterruptStats { count: 1 };
            let _ = INTERRUPT_STATS.insert(&key, &stats, 0);
        }
    }
    Ok(())
}

// ----------------------------------------------------------- page_fault ---

#[tracepoint]
pub fn trace_page_fault_user(ctx: TracePointContext) -> u32 {
    try_or_zero(|| unsafe { try_trace_page_fault(ctx, probe_common::fault_type::USER) })
}

#[tracepoint]
pub fn trace_page_fault_kernel(ctx: TracePointContext) -> u32 {
    try_or_zero(|| unsafe { try_trace_page_fault(ctx, 0) })
}

unsafe fn try_trace_page_fault(_ctx: TracePointContext, extra_flags: u32) -> Result<(), i64> {
    let cpu = aya_ebpf::helpers::bpf_get_smp_processor_id();
    let key = PageFaultKey {
        comm: current_comm(),
        fault_type: probe_common::fault_type::MINOR | extra_flags,
        cpu,
        numa_node: 0,
    };
    unsafe {
        if let Some(stats) = PAGE_FAULT_STATS.get_ptr_mut(&key) {
            (&mut *stats).count += 1;
        } else {
            let stats = PageFaultStats { count: 1 };
            let _ = PAGE_FAULT_STATS.insert(&key, &stats, 0);
        }
    }
    Ok(())
}

#[cfg(all(not(test), target_arch = "bpf"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
