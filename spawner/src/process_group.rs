//! Process-group helpers for spawned applications.
//!
//! Every application becomes the leader of its own process group from inside
//! `pre_exec`, so a failed spawn can be torn down together with anything the
//! start command forked (shell wrappers, preloaders) by signalling the group.

use std::io;
use std::time::Duration;

use tokio::process::Child;

/// Put the calling process into its own process group. Async-signal-safe.
pub(crate) fn set_process_group() -> io::Result<()> {
    if unsafe { libc::setpgid(0, 0) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Send `SIGKILL` to the group led by `pid` (best-effort). A group that has
/// already disappeared (`ESRCH`) is not an error.
pub(crate) fn kill_process_group(pid: u32) -> io::Result<()> {
    let pgid = pid as libc::pid_t;
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

/// Kill the child's group and wait up to `reap_timeout` for the child to exit
/// so no zombie is left behind. Failures are logged, never raised.
pub(crate) async fn kill_and_reap(child: &mut Child, reap_timeout: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    if let Err(err) = kill_process_group(pid) {
        tracing::warn!("failed to kill process group {pid}: {err}");
        if let Err(err) = child.start_kill() {
            tracing::warn!("failed to kill process {pid}: {err}");
        }
    }
    match tokio::time::timeout(reap_timeout, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!("reaped process {pid}: {status}"),
        Ok(Err(err)) => tracing::warn!("failed to reap process {pid}: {err}"),
        Err(_) => tracing::warn!("process {pid} was not reaped within {reap_timeout:?}"),
    }
}
