//! Starts the application process.
//!
//! The child runs this sequence between `fork` and `exec`, all inside a
//! single `pre_exec` hook so the order is fixed:
//!
//! 1. `setgroups` with the target user's default group list
//! 2. `setgid` to the resolved primary group
//! 3. `setuid` to the resolved user
//! 4. `chdir` into the application root
//! 5. `setpgid(0, 0)`
//! 6. the child end of the control socketpair moves to fd 3
//!
//! Everything the hook touches is prepared before the fork, so the hook only
//! issues syscalls. stdin is `/dev/null`; stdout and stderr are duplicates of
//! the spawner's targets (or inherited). The handshake runs over its own
//! socketpair, announced to the child through [`CONTROL_FD_ENV_VAR`], so the
//! application's ordinary output never competes with it.

use std::ffi::CString;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::process::Stdio;

use libc::gid_t;
use libc::uid_t;
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::process::Command;

pub use crate::access::AccessProblem;
pub use crate::access::check_app_root_access;
use crate::options::Options;
use crate::privilege::ResolvedIdentity;
use crate::process_group::set_process_group;
use crate::request::CONNECT_PASSWORD_KEY;

const CONNECT_PASSWORD_LEN: usize = 32;

/// Names the descriptor the application writes its handshake to.
pub const CONTROL_FD_ENV_VAR: &str = "APPPOOL_CONTROL_FD";
const CHILD_CONTROL_FD: RawFd = 3;

/// A fresh per-process secret drawn from the thread-local CSPRNG.
pub fn generate_connect_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(CONNECT_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Variables added on top of the inherited environment, in the order the
/// child sees them applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedEnvironment {
    added: Vec<(String, String)>,
}

pub fn prepare_environment(options: &Options, connect_password: &str) -> PreparedEnvironment {
    let mut added = options.environment_variables.clone();
    added.push((
        CONNECT_PASSWORD_KEY.to_string(),
        connect_password.to_string(),
    ));
    tracing::trace!("prepared {} environment variables", added.len());
    PreparedEnvironment { added }
}

impl PreparedEnvironment {
    pub fn added(&self) -> &[(String, String)] {
        &self.added
    }

    /// `NAME=value` lines for diagnostics: inherited variables not overridden
    /// by the spawn options, then the added ones in order (duplicates kept).
    /// The connect password is never included.
    pub fn snapshot(&self) -> String {
        let mut snapshot = String::new();
        for (key, value) in std::env::vars_os() {
            let key = key.to_string_lossy();
            if self.added.iter().any(|(added, _)| *added == key) {
                continue;
            }
            snapshot.push_str(&format!("{key}={}\n", value.to_string_lossy()));
        }
        for (key, value) in &self.added {
            if key == CONNECT_PASSWORD_KEY {
                continue;
            }
            snapshot.push_str(&format!("{key}={value}\n"));
        }
        snapshot
    }
}

/// Identity change performed in the child. Built before the fork.
#[derive(Debug, Clone)]
struct PrivilegeDrop {
    uid: uid_t,
    gid: gid_t,
    groups: Vec<gid_t>,
}

impl PrivilegeDrop {
    fn apply(&self) -> io::Result<()> {
        if unsafe { libc::setgroups(self.groups.len() as _, self.groups.as_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::setgid(self.gid) } == -1 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::setuid(self.uid) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// What [`launch`] needs besides the options.
pub struct LaunchRequest<'a> {
    pub options: &'a Options,
    /// Identity to switch to, or `None` to keep the spawner's.
    pub switch_to: Option<&'a ResolvedIdentity>,
    pub environment: &'a PreparedEnvironment,
    /// Duplicated into the child as fd 1. `None` inherits the spawner's stdout.
    pub stdout: Option<&'a OwnedFd>,
    /// Duplicated into the child as fd 2. `None` inherits the spawner's stderr.
    pub stderr: Option<&'a OwnedFd>,
}

/// A freshly started application and the parent end of its control channel.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub child: Child,
    pub control_channel: UnixStream,
}

/// Forks and execs `options.start_command` (tokens used literally, no shell).
/// Must be called from within a tokio runtime.
pub fn launch(request: LaunchRequest<'_>) -> io::Result<LaunchedProcess> {
    let LaunchRequest {
        options,
        switch_to,
        environment,
        stdout,
        stderr,
    } = request;
    let Some((program, args)) = options.start_command.split_first() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "the start command is empty",
        ));
    };

    let privilege_drop = switch_to.map(|identity| PrivilegeDrop {
        uid: identity.uid,
        gid: identity.primary_gid,
        groups: identity.supplementary_gids.clone(),
    });
    let app_root = CString::new(options.app_root.as_os_str().as_bytes())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
    let stdout = duplicate_or_inherit(stdout)?;
    let stderr = duplicate_or_inherit(stderr)?;

    // Both ends are close-on-exec; only the child's copy at fd 3 survives exec.
    let (control_channel, child_end) = std::os::unix::net::UnixStream::pair()?;
    control_channel.set_nonblocking(true)?;
    let control_channel = UnixStream::from_std(control_channel)?;
    let child_end = OwnedFd::from(child_end);

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(
            environment
                .added()
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str())),
        )
        .env(CONTROL_FD_ENV_VAR, CHILD_CONTROL_FD.to_string())
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(false);

    unsafe {
        command.pre_exec(move || {
            if let Some(privilege_drop) = &privilege_drop {
                privilege_drop.apply()?;
            }
            if libc::chdir(app_root.as_ptr()) == -1 {
                return Err(io::Error::last_os_error());
            }
            set_process_group()?;
            install_control_fd(child_end.as_raw_fd())
        });
    }

    tracing::debug!(
        "launching {program:?} in {:?} as {}",
        options.app_root,
        switch_to.map_or_else(
            || "the spawner's own identity".to_string(),
            |identity| format!("{}:{}", identity.user_name, identity.group_name),
        )
    );
    let child = command.spawn()?;
    // Dropping `command` closes the parent's copy of the child end, so the
    // control channel reports EOF once the application closes fd 3.
    drop(command);
    Ok(LaunchedProcess {
        child,
        control_channel,
    })
}

fn duplicate_or_inherit(target: Option<&OwnedFd>) -> io::Result<Stdio> {
    Ok(match target {
        Some(fd) => Stdio::from(fd.try_clone()?),
        None => Stdio::inherit(),
    })
}

/// Runs in the child. `dup2` clears close-on-exec on the new descriptor; when
/// the socket already sits at fd 3 the flag is cleared in place.
fn install_control_fd(fd: RawFd) -> io::Result<()> {
    if fd == CHILD_CONTROL_FD {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags == -1
            || unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } == -1
        {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }
    if unsafe { libc::dup2(fd, CHILD_CONTROL_FD) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
