//! Thin wrappers over the POSIX calls the job monitor needs.
//!
//! This is the only module allowed to use `unsafe`; everything it exposes is
//! a safe function returning `io::Result`.

#![allow(unsafe_code)]

use crate::perf::Rusage;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// File descriptor on which a worker may write a pre-formatted error message.
pub const ERROR_CHANNEL_FD: RawFd = 4;

/// Signals the engine sends to processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Polite interrupt.
    Interrupt,
    /// Polite termination.
    Terminate,
    /// Unconditional kill.
    Kill,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Self::Interrupt => libc::SIGINT,
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Creates a close-on-exec pipe, returning `(read, write)`.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    // SAFETY: fds is a valid two-element array.
    check(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    // SAFETY: pipe succeeded, so both descriptors are open and owned by us.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(read.as_raw_fd())?;
    set_cloexec(write.as_raw_fd())?;
    Ok((read, write))
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    check(flags)?;
    // SAFETY: as above.
    check(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })
}

/// Arranges for `write_fd` to appear as fd 4 in the child, for the child
/// to be killed if the monitor dies, and for its address space to be capped
/// at `vmem_limit` bytes.
pub fn prepare_worker(
    command: &mut tokio::process::Command,
    write_fd: RawFd,
    vmem_limit: Option<u64>,
) {
    let hook = move || -> io::Result<()> {
        if write_fd == ERROR_CHANNEL_FD {
            // SAFETY: async-signal-safe fcntl on an inherited descriptor.
            let flags = unsafe { libc::fcntl(write_fd, libc::F_GETFD) };
            check(flags)?;
            // SAFETY: as above.
            check(unsafe { libc::fcntl(write_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) })?;
        } else {
            // SAFETY: dup2 is async-signal-safe; the new descriptor is not close-on-exec.
            check(unsafe { libc::dup2(write_fd, ERROR_CHANNEL_FD) })?;
        }
        #[cfg(target_os = "linux")]
        {
            // SAFETY: prctl with an integer argument.
            check(unsafe {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong)
            })?;
        }
        if let Some(bytes) = vmem_limit {
            set_address_space_limit(bytes)?;
        }
        Ok(())
    };
    // SAFETY: the hook only calls async-signal-safe functions and does not allocate.
    unsafe {
        command.pre_exec(hook);
    }
}

/// Makes this process a subreaper so orphaned grandchildren are reparented to it.
///
/// A no-op outside Linux.
pub fn set_child_subreaper() -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: prctl with an integer argument.
        check(unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1 as libc::c_ulong) })?;
    }
    Ok(())
}

/// Limits the calling process to `bytes` of address space.
fn set_address_space_limit(bytes: u64) -> io::Result<()> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: limit is a valid out-pointer.
    check(unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut limit) })?;
    let wanted = bytes as libc::rlim_t;
    if limit.rlim_max != libc::RLIM_INFINITY && wanted > limit.rlim_max {
        limit.rlim_cur = limit.rlim_max;
    } else {
        limit.rlim_cur = wanted;
    }
    // SAFETY: limit is a valid, initialised rlimit.
    check(unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) })
}

/// Whose resource usage [`rusage`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RusageWho {
    /// This process.
    Myself,
    /// Terminated and waited-for descendants.
    Children,
}

/// Reads `getrusage` for this process or its children.
pub fn rusage(who: RusageWho) -> io::Result<Rusage> {
    let which = match who {
        RusageWho::Myself => libc::RUSAGE_SELF,
        RusageWho::Children => libc::RUSAGE_CHILDREN,
    };
    // SAFETY: rusage is plain old data; getrusage fills it.
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: ru is a valid out-pointer.
    check(unsafe { libc::getrusage(which, &mut ru) })?;
    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    Ok(Rusage {
        user_time: seconds(ru.ru_utime),
        system_time: seconds(ru.ru_stime),
        max_rss_kb: i64::from(ru.ru_maxrss),
        minor_faults: i64::from(ru.ru_minflt),
        major_faults: i64::from(ru.ru_majflt),
        in_blocks: i64::from(ru.ru_inblock),
        out_blocks: i64::from(ru.ru_oublock),
        voluntary_switches: i64::from(ru.ru_nvcsw),
        involuntary_switches: i64::from(ru.ru_nivcsw),
    })
}

/// Size of a memory page in bytes.
#[must_use]
pub fn page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).unwrap_or(4096)
}

/// Sends `signal` to `pid`.
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill has no memory-safety preconditions.
    check(unsafe { libc::kill(pid, signal.as_raw()) })
}

/// Returns true if a process with this pid exists.
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
