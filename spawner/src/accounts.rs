//! User and group lookups.
//!
//! Privilege resolution only talks to the [`AccountDatabase`] trait so that
//! the resolution rules can be exercised without touching `/etc/passwd`.
//! [`SystemAccounts`] is the production implementation backed by the
//! reentrant libc lookups (`getpwnam_r` and friends).

use std::ffi::CStr;
use std::ffi::CString;
use std::io;

use libc::c_char;
use libc::c_int;
use libc::gid_t;
use libc::uid_t;

/// Lookup buffers never grow beyond this many bytes.
const MAX_LOOKUP_BUFFER_LEN: usize = 1 << 20;
const FALLBACK_LOOKUP_BUFFER_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccount {
    pub name: String,
    pub uid: uid_t,
    /// Primary group from the passwd entry.
    pub gid: gid_t,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAccount {
    pub name: String,
    pub gid: gid_t,
}

pub trait AccountDatabase: Send + Sync {
    fn user_by_name(&self, name: &str) -> io::Result<Option<UserAccount>>;

    fn user_by_uid(&self, uid: uid_t) -> io::Result<Option<UserAccount>>;

    fn group_by_name(&self, name: &str) -> io::Result<Option<GroupAccount>>;

    fn group_by_gid(&self, gid: gid_t) -> io::Result<Option<GroupAccount>>;

    /// The supplementary groups `initgroups(3)` would install for `user`.
    fn default_groups(&self, user: &UserAccount) -> io::Result<Vec<gid_t>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAccounts;

impl AccountDatabase for SystemAccounts {
    fn user_by_name(&self, name: &str) -> io::Result<Option<UserAccount>> {
        let Ok(name) = CString::new(name) else {
            return Ok(None);
        };
        lookup_passwd(|entry, buf, buf_len, result| unsafe {
            libc::getpwnam_r(name.as_ptr(), entry, buf, buf_len, result)
        })
    }

    fn user_by_uid(&self, uid: uid_t) -> io::Result<Option<UserAccount>> {
        lookup_passwd(|entry, buf, buf_len, result| unsafe {
            libc::getpwuid_r(uid, entry, buf, buf_len, result)
        })
    }

    fn group_by_name(&self, name: &str) -> io::Result<Option<GroupAccount>> {
        let Ok(name) = CString::new(name) else {
            return Ok(None);
        };
        lookup_group(|entry, buf, buf_len, result| unsafe {
            libc::getgrnam_r(name.as_ptr(), entry, buf, buf_len, result)
        })
    }

    fn group_by_gid(&self, gid: gid_t) -> io::Result<Option<GroupAccount>> {
        lookup_group(|entry, buf, buf_len, result| unsafe {
            libc::getgrgid_r(gid, entry, buf, buf_len, result)
        })
    }

    fn default_groups(&self, user: &UserAccount) -> io::Result<Vec<gid_t>> {
        let name = CString::new(user.name.as_str())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "user name contains NUL"))?;
        let mut capacity: c_int = 32;
        loop {
            let mut groups: Vec<gid_t> = vec![0; capacity as usize];
            let mut count = capacity;
            let rc = get_group_list(&name, user.gid, &mut groups, &mut count);
            if rc == -1 {
                // `count` now holds the required size on glibc; elsewhere just grow.
                let next = if count > capacity {
                    count
                } else {
                    capacity.saturating_mul(2)
                };
                if next as usize > MAX_LOOKUP_BUFFER_LEN {
                    return Err(io::Error::other(format!(
                        "too many supplementary groups for user {}",
                        user.name
                    )));
                }
                capacity = next;
                continue;
            }
            groups.truncate(count.max(0) as usize);
            return Ok(groups);
        }
    }
}

#[cfg(not(target_vendor = "apple"))]
fn get_group_list(name: &CStr, gid: gid_t, groups: &mut [gid_t], count: &mut c_int) -> c_int {
    unsafe { libc::getgrouplist(name.as_ptr(), gid, groups.as_mut_ptr(), count) }
}

#[cfg(target_vendor = "apple")]
fn get_group_list(name: &CStr, gid: gid_t, groups: &mut [gid_t], count: &mut c_int) -> c_int {
    // Darwin declares the group list as `int`; gid_t has the same width.
    unsafe {
        libc::getgrouplist(
            name.as_ptr(),
            gid as c_int,
            groups.as_mut_ptr().cast::<c_int>(),
            count,
        )
    }
}

fn initial_buffer_len(name: c_int) -> usize {
    let suggested = unsafe { libc::sysconf(name) };
    if suggested > 0 {
        suggested as usize
    } else {
        FALLBACK_LOOKUP_BUFFER_LEN
    }
}

/// The `*_r` lookups report "no such entry" through several errno values
/// depending on the libc and the NSS backend.
fn is_not_found(rc: c_int) -> bool {
    matches!(rc, libc::ENOENT | libc::ESRCH | libc::EBADF | libc::EPERM)
}

fn lookup_passwd<F>(mut call: F) -> io::Result<Option<UserAccount>>
where
    F: FnMut(*mut libc::passwd, *mut c_char, usize, *mut *mut libc::passwd) -> c_int,
{
    let mut buf_len = initial_buffer_len(libc::_SC_GETPW_R_SIZE_MAX);
    loop {
        let mut buf: Vec<c_char> = vec![0; buf_len];
        let mut entry: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = call(&raw mut entry, buf.as_mut_ptr(), buf.len(), &raw mut result);
        if rc == libc::ERANGE && buf_len < MAX_LOOKUP_BUFFER_LEN {
            buf_len *= 2;
            continue;
        }
        if rc != 0 {
            if is_not_found(rc) {
                return Ok(None);
            }
            return Err(io::Error::from_raw_os_error(rc));
        }
        if result.is_null() {
            return Ok(None);
        }
        let name = unsafe { CStr::from_ptr(entry.pw_name) }
            .to_string_lossy()
            .into_owned();
        return Ok(Some(UserAccount {
            name,
            uid: entry.pw_uid,
            gid: entry.pw_gid,
        }));
    }
}

fn lookup_group<F>(mut call: F) -> io::Result<Option<GroupAccount>>
where
    F: FnMut(*mut libc::group, *mut c_char, usize, *mut *mut libc::group) -> c_int,
{
    let mut buf_len = initial_buffer_len(libc::_SC_GETGR_R_SIZE_MAX);
    loop {
        let mut buf: Vec<c_char> = vec![0; buf_len];
        let mut entry: libc::group = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::group = std::ptr::null_mut();
        let rc = call(&raw mut entry, buf.as_mut_ptr(), buf.len(), &raw mut result);
        if rc == libc::ERANGE && buf_len < MAX_LOOKUP_BUFFER_LEN {
            buf_len *= 2;
            continue;
        }
        if rc != 0 {
            if is_not_found(rc) {
                return Ok(None);
            }
            return Err(io::Error::from_raw_os_error(rc));
        }
        if result.is_null() {
            return Ok(None);
        }
        let name = unsafe { CStr::from_ptr(entry.gr_name) }
            .to_string_lossy()
            .into_owned();
        return Ok(Some(GroupAccount {
            name,
            gid: entry.gr_gid,
        }));
    }
}
