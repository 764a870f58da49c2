/// Return the system hostname, or `"unknown"` if it cannot be determined.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".into())
    }

    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".into())
    }
}

/// Name of the user running this process, or `"unknown"`.
pub fn username() -> String {
    #[cfg(unix)]
    {
        use nix::unistd::{Uid, User};
        User::from_uid(Uid::current())
            .ok()
            .flatten()
            .map(|u| u.name)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown".into())
    }

    #[cfg(not(unix))]
    {
        std::env::var("USERNAME").unwrap_or_else(|_| "unknown".into())
    }
}

pub fn uid() -> u32 {
    #[cfg(unix)]
    {
        nix::unistd::getuid().as_raw()
    }

    #[cfg(not(unix))]
    {
        0
    }
}

pub fn gid() -> u32 {
    #[cfg(unix)]
    {
        nix::unistd::getgid().as_raw()
    }

    #[cfg(not(unix))]
    {
        0
    }
}

/// Whether a process with `pid` is running on this host.
///
/// On unix this probes with signal 0: `ESRCH` means gone, `EPERM` means it
/// exists under another user. Elsewhere liveness cannot be checked and every
/// PID is reported alive, so same-host locks are never reclaimed.
pub fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // 0 and negatives address process groups, not a single process.
        if raw <= 0 {
            return false;
        }
        match kill(Pid::from_raw(raw), None::<Signal>) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
