//! x86_64 syscall-number to name/category lookup. Covers the syscalls the
//! original monitor's category buckets actually care about; anything not
//! listed here still gets recorded, just under `syscall_<nr>` / `other`.

use probe_common::SyscallCategory;

pub fn name_for(nr: u32) -> String {
    SYSCALLS
        .iter()
        .find(|(n, _, _)| *n == nr)
        .map(|(_, name, _)| name.to_string())
        .unwrap_or_else(|| format!("syscall_{nr}"))
}

pub fn category_for(nr: u32) -> SyscallCategory {
    SYSCALLS
        .iter()
        .find(|(n, _, _)| *n == nr)
        .map(|(_, _, cat)| *cat)
        .unwrap_or(SyscallCategory::Other)
}

use SyscallCategory::*;

const SYSCALLS: &[(u32, &str, SyscallCategory)] = &[
    (0, "read", FileIo),
    (1, "write", FileIo),
    (2, "open", FileIo),
    (3, "close", FileIo),
    (4, "stat", FileIo),
    (5, "fstat", FileIo),
    (8, "lseek", FileIo),
    (9, "mmap", Memory),
    (10, "mprotect", Memory),
    (11, "munmap", Memory),
    (12, "brk", Memory),
    (13, "rt_sigaction", Signal),
    (14, "rt_sigprocmask", Signal),
    (16, "ioctl", FileIo),
    (17, "pread64", FileIo),
    (18, "pwrite64", FileIo),
    (19, "readv", FileIo),
    (20, "writev", FileIo),
    (21, "access", FileIo),
    (22, "pipe", Ipc),
    (23, "select", FileIo),
    (32, "dup", FileIo),
    (33, "dup2", FileIo),
    (39, "getpid", Process),
    (41, "socket", Network),
    (42, "connect", Network),
    (43, "accept", Network),
    (44, "sendto", Network),
    (45, "recvfrom", Network),
    (46, "sendmsg", Network),
    (47, "recvmsg", Network),
    (48, "shutdown", Network),
    (49, "bind", Network),
    (50, "listen", Network),
    (56, "clone", Process),
    (57, "fork", Process),
    (58, "vfork", Process),
    (59, "execve", Process),
    (60, "exit", Process),
    (61, "wait4", Process),
    (62, "kill", Signal),
    (72, "fcntl", FileIo),
    (73, "flock", FileIo),
    (78, "getdents", FileIo),
    (79, "getcwd", FileIo),
    (82, "rename", FileIo),
    (83, "mkdir", FileIo),
    (84, "rmdir", FileIo),
    (85, "creat", FileIo),
    (86, "link", FileIo),
    (87, "unlink", FileIo),
    (89, "readlink", FileIo),
    (90, "chmod", FileIo),
    (92, "chown", FileIo),
    (95, "umask", FileIo),
    (96, "gettimeofday", Time),
    (97, "getrlimit", Process),
    (102, "getuid", Process),
    (137, "statfs", FileIo),
    (161, "chroot", FileIo),
    (186, "gettid", Process),
    (202, "futex", Signal),
    (213, "epoll_create", FileIo),
    (217, "getdents64", FileIo),
    (221, "fadvise64", FileIo),
    (228, "clock_gettime", Time),
    (230, "clock_nanosleep", Time),
    (231, "exit_group", Process),
    (232, "epoll_wait", FileIo),
    (233, "epoll_ctl", FileIo),
    (257, "openat", FileIo),
    (262, "newfstatat", FileIo),
    (263, "unlinkat", FileIo),
    (268, "fchmodat", FileIo),
    (269, "faccessat", FileIo),
    (281, "epoll_pwait", FileIo),
    (288, "accept4", Network),
    (290, "eventfd2", Ipc),
    (291, "epoll_create1", FileIo),
    (292, "dup3", FileIo),
    (293, "pipe2", Ipc),
    (302, "prlimit64", Process),
    (318, "getrandom", Other),
    (319, "memfd_create", Memory),
    (322, "execveat", Process),
    (435, "clone3", Process),
    (441, "epoll_pwait2", FileIo),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_syscalls_resolve() {
        assert_eq!(name_for(0), "read");
        assert_eq!(category_for(0), SyscallCategory::FileIo);
        assert_eq!(category_for(59), SyscallCategory::Process);
        assert_eq!(category_for(42), SyscallCategory::Network);
    }

    #[test]
    fn unknown_syscalls_fall_back() {
        assert_eq!(name_for(9999), "syscall_9999");
        assert_eq!(category_for(9999), SyscallCategory::Other);
    }
}
