//! Seccomp syscall allow-list for detector containers
//!
//! Default action is `SCMP_ACT_ERRNO`: anything not listed fails with
//! `EPERM` inside the container. Socket creation, `ptrace`, mount and
//! kernel module syscalls are deliberately absent. Process creation stays
//! allowed because ML runtimes fork worker processes; shell access is
//! already blocked by the installer scan and the minimal image.

use cmon_common::config::atomic_write;
use serde_json::{json, Value};
use std::path::Path;

/// Syscalls a Python/ML detector needs
const ALLOWED_SYSCALLS: &[&str] = &[
    // file I/O
    "read", "write", "readv", "writev", "pread64", "pwrite64", "preadv", "pwritev", "preadv2",
    "pwritev2", "open", "openat", "openat2", "close", "close_range", "creat", "lseek", "stat",
    "fstat", "lstat", "newfstatat", "statx", "statfs", "fstatfs", "access", "faccessat",
    "faccessat2", "readlink", "readlinkat", "getdents", "getdents64", "getcwd", "chdir", "fchdir",
    "rename", "renameat", "renameat2", "unlink", "unlinkat", "mkdir", "mkdirat", "rmdir",
    "link", "linkat", "symlink", "symlinkat", "truncate", "ftruncate", "fallocate", "fsync",
    "fdatasync", "sync_file_range", "flock", "fcntl", "dup", "dup2", "dup3", "pipe", "pipe2",
    "ioctl", "fadvise64", "sendfile", "copy_file_range", "splice", "tee", "umask", "chmod",
    "fchmod", "fchmodat", "utimensat", "getxattr", "lgetxattr", "fgetxattr", "listxattr",
    "flistxattr", "memfd_create",
    // memory
    "mmap", "munmap", "mprotect", "mremap", "madvise", "brk", "msync", "mincore", "mlock",
    "munlock", "get_mempolicy", "set_mempolicy", "mbind",
    // events and polling
    "poll", "ppoll", "select", "pselect6", "epoll_create", "epoll_create1", "epoll_ctl",
    "epoll_wait", "epoll_pwait", "epoll_pwait2", "eventfd", "eventfd2", "inotify_init",
    "inotify_init1", "inotify_add_watch", "inotify_rm_watch", "timerfd_create",
    "timerfd_settime", "timerfd_gettime", "signalfd", "signalfd4",
    // local IPC used by multiprocessing pools
    "socketpair", "sendmsg", "recvmsg", "sendto", "recvfrom", "shutdown", "getsockopt",
    "setsockopt", "getsockname", "getpeername",
    // processes and threads
    "clone", "clone3", "fork", "vfork", "execve", "execveat", "exit", "exit_group", "wait4",
    "waitid", "kill", "tgkill", "tkill", "getpid", "getppid", "gettid", "getpgrp", "getpgid",
    "setpgid", "getsid", "setsid", "set_tid_address", "set_robust_list", "get_robust_list",
    "futex", "futex_waitv", "sched_yield", "sched_getaffinity", "sched_setaffinity",
    "sched_getparam", "sched_getscheduler", "sched_get_priority_max", "sched_get_priority_min",
    "getpriority", "setpriority", "prctl", "arch_prctl", "rseq", "prlimit64", "getrlimit",
    "setrlimit", "getrusage", "capget",
    // identity
    "getuid", "geteuid", "getgid", "getegid", "getgroups", "getresuid", "getresgid",
    // signals
    "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "rt_sigsuspend", "rt_sigtimedwait",
    "rt_sigqueueinfo", "sigaltstack", "pause", "alarm",
    // time
    "clock_gettime", "clock_getres", "clock_nanosleep", "gettimeofday", "nanosleep", "time",
    "times", "getitimer", "setitimer",
    // misc
    "uname", "sysinfo", "getrandom", "restart_syscall",
];

/// Docker seccomp profile document
pub fn profile_document() -> Value {
    json!({
        "defaultAction": "SCMP_ACT_ERRNO",
        "defaultErrnoRet": 1,
        "architectures": ["SCMP_ARCH_X86_64", "SCMP_ARCH_X86", "SCMP_ARCH_AARCH64"],
        "syscalls": [
            { "names": ALLOWED_SYSCALLS, "action": "SCMP_ACT_ALLOW" }
        ]
    })
}

/// Write the profile to `path` (atomically, creating parent directories)
pub fn write_profile(path: &Path) -> cmon_common::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let encoded = serde_json::to_vec_pretty(&profile_document())?;
    atomic_write(path, &encoded)?;
    tracing::debug!(path = %path.display(), syscalls = ALLOWED_SYSCALLS.len(), "Wrote seccomp profile");
    Ok(())
}
