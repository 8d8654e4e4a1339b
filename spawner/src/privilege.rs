//! Decides which identity a spawned application runs as.
//!
//! Resolution order:
//!
//! - user: explicit `user` option, else the owner of the startup file, else
//!   the default user. `"root"`, unknown names and anything that resolves to
//!   uid 0 fall back to the default user.
//! - group: `!STARTUP_FILE!` selects the startup file's group; any other name
//!   selects that group; unset selects the target user's primary group. The
//!   root group and unknown names fall back to the default group.
//! - supplementary groups: the target user's `initgroups` list.
//!
//! Ownership is always read from the startup file itself with `lstat`, so a
//! symlink contributes its own owner, never its target's.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;

use libc::gid_t;
use libc::uid_t;

use crate::accounts::AccountDatabase;
use crate::accounts::GroupAccount;
use crate::accounts::UserAccount;
use crate::error::ConfigurationError;
use crate::options::Options;
use crate::options::STARTUP_FILE_GROUP;

const ROOT_USER: &str = "root";
const ROOT_UID: uid_t = 0;
const ROOT_GID: gid_t = 0;

/// Target identity for one spawn. Consumed by the child before `exec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub uid: uid_t,
    pub primary_gid: gid_t,
    pub supplementary_gids: Vec<gid_t>,
    /// For diagnostics only.
    pub user_name: String,
    /// For diagnostics only.
    pub group_name: String,
}

impl ResolvedIdentity {
    /// The identity of the calling process, used when no switching happens.
    pub fn current(accounts: &dyn AccountDatabase) -> io::Result<Self> {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let supplementary_gids = current_supplementary_groups()?;
        let user_name = accounts
            .user_by_uid(uid)?
            .map_or_else(|| uid.to_string(), |user| user.name);
        let group_name = accounts
            .group_by_gid(gid)?
            .map_or_else(|| gid.to_string(), |group| group.name);
        Ok(Self {
            uid,
            primary_gid: gid,
            supplementary_gids,
            user_name,
            group_name,
        })
    }

    pub fn is_root(&self) -> bool {
        self.uid == ROOT_UID
    }

    /// True if `gid` is the primary group or one of the supplementary groups.
    pub fn in_group(&self, gid: gid_t) -> bool {
        self.primary_gid == gid || self.supplementary_gids.contains(&gid)
    }
}

fn current_supplementary_groups() -> io::Result<Vec<gid_t>> {
    let count = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
    if count < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut groups: Vec<gid_t> = vec![0; count as usize];
    let count = unsafe { libc::getgroups(count, groups.as_mut_ptr()) };
    if count < 0 {
        return Err(io::Error::last_os_error());
    }
    groups.truncate(count as usize);
    Ok(groups)
}

/// Owner of the startup file as reported by `lstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOwner {
    pub uid: uid_t,
    pub gid: gid_t,
}

impl FileOwner {
    /// Reads the link's own metadata. Returns `None` if the file cannot be
    /// inspected, which makes the owner count as unknown.
    pub fn of_link(path: &Path) -> Option<Self> {
        match std::fs::symlink_metadata(path) {
            Ok(metadata) => Some(Self {
                uid: metadata.uid(),
                gid: metadata.gid(),
            }),
            Err(err) => {
                tracing::debug!("cannot lstat startup file {path:?}: {err}");
                None
            }
        }
    }
}

pub struct PrivilegeResolver {
    accounts: Arc<dyn AccountDatabase>,
    default_user: String,
    default_group: Option<String>,
}

impl PrivilegeResolver {
    /// `default_user`/`default_group` are the spawner-wide fallbacks; the
    /// per-spawn `Options` values take precedence when set.
    pub fn new(
        accounts: Arc<dyn AccountDatabase>,
        default_user: impl Into<String>,
        default_group: Option<String>,
    ) -> Self {
        Self {
            accounts,
            default_user: default_user.into(),
            default_group,
        }
    }

    /// Inspects `options.startup_file` (only when its owner matters) and
    /// resolves the target identity.
    pub fn resolve(&self, options: &Options) -> Result<ResolvedIdentity, ConfigurationError> {
        let needs_owner =
            options.user.is_none() || options.group.as_deref() == Some(STARTUP_FILE_GROUP);
        let owner = if needs_owner {
            FileOwner::of_link(&options.startup_file_path())
        } else {
            None
        };
        self.resolve_with_owner(options, owner)
    }

    pub fn resolve_with_owner(
        &self,
        options: &Options,
        startup_file_owner: Option<FileOwner>,
    ) -> Result<ResolvedIdentity, ConfigurationError> {
        let user = self.resolve_user(options, startup_file_owner)?;
        let group = self.resolve_group(options, &user, startup_file_owner)?;
        let supplementary_gids = self
            .accounts
            .default_groups(&user)
            .map_err(|source| ConfigurationError::AccountLookup { source })?;
        Ok(ResolvedIdentity {
            uid: user.uid,
            primary_gid: group.gid,
            supplementary_gids,
            user_name: user.name,
            group_name: group.name,
        })
    }

    fn resolve_user(
        &self,
        options: &Options,
        startup_file_owner: Option<FileOwner>,
    ) -> Result<UserAccount, ConfigurationError> {
        let candidate = match options.user.as_deref() {
            Some(ROOT_USER) => None,
            Some(name) => lookup(self.accounts.user_by_name(name))?,
            None => match startup_file_owner {
                Some(owner) => lookup(self.accounts.user_by_uid(owner.uid))?,
                None => None,
            },
        };
        match candidate {
            Some(user) if user.uid != ROOT_UID => Ok(user),
            _ => self.default_user(options),
        }
    }

    fn resolve_group(
        &self,
        options: &Options,
        user: &UserAccount,
        startup_file_owner: Option<FileOwner>,
    ) -> Result<GroupAccount, ConfigurationError> {
        let candidate = match options.group.as_deref() {
            Some(STARTUP_FILE_GROUP) => match startup_file_owner {
                Some(owner) => lookup(self.accounts.group_by_gid(owner.gid))?,
                None => None,
            },
            Some(name) => lookup(self.accounts.group_by_name(name))?,
            None => return self.primary_group_of(user),
        };
        match candidate {
            Some(group) if group.gid != ROOT_GID => Ok(group),
            _ => self.default_group(options),
        }
    }

    fn default_user(&self, options: &Options) -> Result<UserAccount, ConfigurationError> {
        let name = options.default_user.as_deref().unwrap_or(&self.default_user);
        lookup(self.accounts.user_by_name(name))?.ok_or(ConfigurationError::UnresolvableUser)
    }

    fn default_group(&self, options: &Options) -> Result<GroupAccount, ConfigurationError> {
        match options.default_group.as_deref().or(self.default_group.as_deref()) {
            Some(name) => lookup(self.accounts.group_by_name(name))?
                .ok_or(ConfigurationError::UnresolvableGroup),
            None => {
                let user = self
                    .default_user(options)
                    .map_err(|_| ConfigurationError::UnresolvableGroup)?;
                self.primary_group_of(&user)
            }
        }
    }

    /// The passwd entry's gid is authoritative even if no group entry names it.
    fn primary_group_of(&self, user: &UserAccount) -> Result<GroupAccount, ConfigurationError> {
        let name = lookup(self.accounts.group_by_gid(user.gid))?
            .map_or_else(|| user.gid.to_string(), |group| group.name);
        Ok(GroupAccount {
            name,
            gid: user.gid,
        })
    }
}

fn lookup<T>(result: io::Result<Option<T>>) -> Result<Option<T>, ConfigurationError> {
    result.map_err(|source| ConfigurationError::AccountLookup { source })
}

#[cfg(test)]
#[path = "privilege_tests.rs"]
mod tests;
