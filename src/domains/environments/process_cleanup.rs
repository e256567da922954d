use log::{debug, warn};
use std::time::Duration;
use tokio::time::sleep;

const POLL_SLICE: Duration = Duration::from_millis(100);

/// SIGTERM, wait up to `grace`, then SIGKILL. Returns `false` only when the
/// process could not be confirmed gone. With `group` set the signals go to
/// the whole process group led by `pid`.
#[cfg(unix)]
pub async fn terminate_pid(pid: u32, grace: Duration, group: bool) -> bool {
    let Ok(pid_t) = libc::pid_t::try_from(pid) else {
        warn!("Refusing to signal out-of-range pid {pid}");
        return false;
    };
    let target = if group { -pid_t } else { pid_t };

    debug!("Sending SIGTERM to process {pid} (group: {group})");
    let term_result = unsafe { libc::kill(target, libc::SIGTERM) };
    if term_result == -1 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => return true,
            Some(libc::EPERM) => warn!("Insufficient permissions to SIGTERM process {pid}"),
            _ => warn!("Failed to SIGTERM process {pid}: {err}"),
        }
    }

    let mut waited = Duration::ZERO;
    while waited < grace {
        if !process_alive(pid) {
            return true;
        }
        sleep(POLL_SLICE).await;
        waited += POLL_SLICE;
    }

    debug!("Escalating to SIGKILL for process {pid}");
    let kill_result = unsafe { libc::kill(target, libc::SIGKILL) };
    if kill_result == -1 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => return true,
            Some(libc::EPERM) => warn!("Failed to SIGKILL process {pid}: permission denied"),
            _ => warn!("Failed to SIGKILL process {pid}: {err}"),
        }
    }

    for _ in 0..10 {
        if !process_alive(pid) {
            return true;
        }
        sleep(POLL_SLICE).await;
    }

    if process_alive(pid) {
        if kill_result != -1 {
            // SIGKILL was delivered; what remains is a zombie awaiting its reaper.
            return true;
        }
        warn!("Process {pid} still alive after termination attempts");
        return false;
    }

    true
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid_t) = libc::pid_t::try_from(pid) else {
        return false;
    };
    let result = unsafe { libc::kill(pid_t, 0) };
    if result == 0 {
        return true;
    }
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::EPERM)
    )
}

/// Immediate SIGKILL to the process group led by `pid`, ignoring errors.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    if let Ok(pid_t) = libc::pid_t::try_from(pid) {
        let result = unsafe { libc::kill(-pid_t, libc::SIGKILL) };
        if result == -1 {
            debug!(
                "SIGKILL to process group {pid} failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) {}

#[cfg(not(unix))]
pub async fn terminate_pid(_pid: u32, _grace: Duration, _group: bool) -> bool {
    false
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}
