//! Checks that the target identity can reach the application root.
//!
//! A child that has already dropped privileges and then fails `chdir` only
//! reports `EACCES`, which tells the operator nothing about *which* directory
//! is wrong. The walk below runs in the spawner against the resolved
//! identity and names the first offending directory instead.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;

use path_absolutize::Absolutize;

use crate::privilege::ResolvedIdentity;

const READ: u32 = 0o4;
const EXECUTE: u32 = 0o1;

/// Why the application root is unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessProblem {
    /// An ancestor of the app root cannot be traversed.
    ParentDirectory { app_root: PathBuf, directory: PathBuf },
    /// The app root itself cannot be read or traversed.
    AppRoot { app_root: PathBuf },
    /// The app root or one of its ancestors cannot be inspected at all.
    Inspect {
        app_root: PathBuf,
        directory: PathBuf,
        message: String,
    },
}

impl AccessProblem {
    pub fn error_page(&self, identity: &ResolvedIdentity) -> String {
        let ResolvedIdentity {
            user_name,
            group_name,
            ..
        } = identity;
        match self {
            AccessProblem::ParentDirectory {
                app_root,
                directory,
            } => format!(
                "This web application process is being run as user '{user_name}' and group \
                 '{group_name}' and must be able to access its application root directory \
                 '{}'. However the parent directory '{}' has wrong permissions, thereby \
                 preventing this process from accessing its application root directory. \
                 Please fix the permissions of the directory '{}' first.\n",
                app_root.display(),
                directory.display(),
                directory.display(),
            ),
            AccessProblem::AppRoot { app_root } => format!(
                "This web application process is being run as user '{user_name}' and group \
                 '{group_name}' and must be able to access its application root directory \
                 '{}'. However this directory is not accessible because it has wrong \
                 permissions. Please fix these permissions first.\n",
                app_root.display(),
            ),
            AccessProblem::Inspect {
                app_root,
                directory,
                message,
            } => format!(
                "This web application process is being run as user '{user_name}' and group \
                 '{group_name}' and must be able to access its application root directory \
                 '{}'. However the directory '{}' cannot be inspected: {message}\n",
                app_root.display(),
                directory.display(),
            ),
        }
    }
}

/// Walks from `/` down to `app_root`. Every ancestor must be traversable and
/// `app_root` itself must be readable and traversable by `identity`. The
/// first failing directory in that order is reported.
pub fn check_app_root_access(
    app_root: &Path,
    identity: &ResolvedIdentity,
) -> io::Result<Result<(), AccessProblem>> {
    let app_root = app_root.absolutize()?.into_owned();
    let mut ancestors: Vec<&Path> = app_root.ancestors().skip(1).collect();
    ancestors.reverse();

    for directory in ancestors {
        match std::fs::metadata(directory) {
            Ok(metadata) => {
                if !permits(&metadata, identity, EXECUTE) {
                    return Ok(Err(AccessProblem::ParentDirectory {
                        app_root: app_root.clone(),
                        directory: directory.to_path_buf(),
                    }));
                }
            }
            Err(err) => {
                return Ok(Err(AccessProblem::Inspect {
                    app_root: app_root.clone(),
                    directory: directory.to_path_buf(),
                    message: err.to_string(),
                }));
            }
        }
    }

    match std::fs::metadata(&app_root) {
        Ok(metadata) if permits(&metadata, identity, READ | EXECUTE) => Ok(Ok(())),
        Ok(_) => Ok(Err(AccessProblem::AppRoot { app_root })),
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            Ok(Err(AccessProblem::AppRoot { app_root }))
        }
        Err(err) => Ok(Err(AccessProblem::Inspect {
            directory: app_root.clone(),
            app_root,
            message: err.to_string(),
        })),
    }
}

fn permits(metadata: &std::fs::Metadata, identity: &ResolvedIdentity, wanted: u32) -> bool {
    mode_permits(
        metadata.mode(),
        metadata.uid(),
        metadata.gid(),
        identity,
        wanted,
    )
}

/// Classic owner/group/other evaluation. Root may traverse anything.
fn mode_permits(
    mode: u32,
    owner_uid: u32,
    owner_gid: u32,
    identity: &ResolvedIdentity,
    wanted: u32,
) -> bool {
    if identity.is_root() {
        return true;
    }
    let bits = if identity.uid == owner_uid {
        (mode >> 6) & 0o7
    } else if identity.in_group(owner_gid) {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    };
    bits & wanted == wanted
}
