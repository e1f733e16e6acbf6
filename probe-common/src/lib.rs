#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

//! Wire-format structs shared between `probe-ebpf` (kernel side) and
//! `monitord` (userspace side): aggregate map keys/values and the one
//! per-event perf record (`ExecEvent`).
//!
//! Every struct here is `repr(C)` and `Pod + Zeroable` so it can be read
//! straight out of a `HashMap`/`PerfEventArray` byte buffer with
//! `bytemuck`, matching the byte layout `probe-ebpf` writes.

use bytemuck::{Pod, Zeroable};

/// Upper bound on dynamically attached `func` kprobes. `probe-ebpf` declares
/// exactly this many `trace_func_N` kprobe slots at compile time, since
/// eBPF objects cannot be generated at runtime the way a BCC C template can.
pub const MAX_FUNC_PROBES: u32 = 32;

/// Fixed-width process name, matches `TASK_COMM_LEN` on Linux.
pub type Comm = [u8; 16];

/// Fixed-width filename buffer carried in wire structs. Truncated, not
/// NUL-padded beyond the first terminator.
pub type FileName = [u8; 256];

/// Fixed-width filename buffer for aggregate `open` keys; shorter than
/// `FileName` because it lives inside a hash-map key and is hashed/compared
/// byte-for-byte on every lookup.
pub type ShortFileName = [u8; 128];

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyscallCategory {
    FileIo = 0,
    Network = 1,
    Memory = 2,
    Process = 3,
    Signal = 4,
    Time = 5,
    Ipc = 6,
    Other = 7,
}

impl SyscallCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            SyscallCategory::FileIo => "file_io",
            SyscallCategory::Network => "network",
            SyscallCategory::Memory => "memory",
            SyscallCategory::Process => "process",
            SyscallCategory::Signal => "signal",
            SyscallCategory::Time => "time",
            SyscallCategory::Ipc => "ipc",
            SyscallCategory::Other => "other",
        }
    }
}

pub mod irq_type {
    pub const HARDWARE: u32 = 0x1;
    pub const SOFTWARE: u32 = 0x2;
    pub const TIMER: u32 = 0x4;
    pub const NETWORK: u32 = 0x8;
    pub const BLOCK: u32 = 0x10;
    pub const MIGRATE: u32 = 0x4000;
    pub const AFFINITY: u32 = 0x8000;
}

pub mod fault_type {
    pub const MINOR: u32 = 0x1;
    pub const MAJOR: u32 = 0x2;
    pub const WRITE: u32 = 0x4;
    pub const USER: u32 = 0x8;
    pub const SHARED: u32 = 0x10;
    pub const SWAP: u32 = 0x8000;
}

pub mod io_type {
    pub const READ: u32 = 0x1;
    pub const WRITE: u32 = 0x2;
}

pub mod open_op {
    pub const OPEN: u32 = 0x1;
    pub const OPENAT: u32 = 0x2;
    pub const CREAT: u32 = 0x3;
}

/// Per-exec perf event: one record per `execve`, decoded by the exec
/// monitor's streaming drain loop.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ExecEvent {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub _pad: u32,
    pub ts_ns: u64,
    pub comm: Comm,
    pub filename: FileName,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct SyscallKey {
    pub comm: Comm,
    pub syscall_nr: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct SyscallStats {
    pub count: u64,
    pub error_count: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct BioKey {
    pub comm: Comm,
    pub io_type: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct BioStats {
    pub count: u64,
    pub total_bytes: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

/// Per-pid_tgid bookkeeping between a `sys_enter_{open,openat,creat}`
/// tracepoint and its matching exit, carrying the filename read at entry
/// (a user-space pointer, only valid to read while the syscall is live) and
/// which of the three operations started it.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct OpenStartInfo {
    pub start_ns: u64,
    pub operation: u32,
    pub _pad: u32,
    pub filename: ShortFileName,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct OpenKey {
    pub comm: Comm,
    pub operation: u32,
    pub _pad: u32,
    pub filename: ShortFileName,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct OpenStats {
    pub count: u64,
    pub errors: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub flags: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct FuncKey {
    pub comm: Comm,
    pub func_id: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct FuncStats {
    pub count: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct InterruptKey {
    pub comm: Comm,
    pub irq_type: u32,
    pub cpu: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct InterruptStats {
    pub count: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct PageFaultKey {
    pub comm: Comm,
    pub fault_type: u32,
    pub cpu: u32,
    pub numa_node: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct PageFaultStats {
    pub count: u64,
}

/// Reads a NUL-terminated (or fully-populated) fixed byte buffer as a
/// lossy UTF-8 string, the way every monitor decodes `comm`/`filename`
/// fields coming out of kernel memory.
pub fn bytes_to_str(buf: &[u8]) -> &str {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    core::str::from_utf8(&buf[..len]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_event_layout() {
        assert_eq!(
            core::mem::size_of::<ExecEvent>(),
            4 + 4 + 4 + 4 + 8 + 16 + 256
        );
    }

    #[test]
    fn syscall_key_is_pod_sized() {
        assert_eq!(core::mem::size_of::<SyscallKey>(), 16 + 4 + 4);
    }

    #[test]
    fn bytes_to_str_stops_at_nul() {
        let mut buf = [0u8; 16];
        buf[..4].copy_from_slice(b"cat\0");
        assert_eq!(bytes_to_str(&buf), "cat");
    }

    #[test]
    fn syscall_category_names() {
        assert_eq!(SyscallCategory::FileIo.as_str(), "file_io");
        assert_eq!(SyscallCategory::Ipc.as_str(), "ipc");
    }
}
