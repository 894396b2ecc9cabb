//! Dropping root privileges after the listener is bound.

use std::ffi::{CStr, CString};

#[derive(Debug, thiserror::Error)]
pub enum PrivilegeError {
    #[error("user name contains a NUL byte")]
    InvalidName,
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("failed to look up user {user}: {source}")]
    Lookup {
        user: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Identity of a local account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

/// Resolve `name` through the password database.
pub fn lookup_user(name: &str) -> Result<Account, PrivilegeError> {
    let c_name = CString::new(name).map_err(|_| PrivilegeError::InvalidName)?;
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    // SAFETY: an all-zero passwd is a valid out-parameter for getpwnam_r.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    // SAFETY: every pointer refers to live, correctly sized storage.
    let rc = unsafe {
        libc::getpwnam_r(
            c_name.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 {
        return Err(PrivilegeError::Lookup {
            user: name.to_string(),
            source: std::io::Error::from_raw_os_error(rc),
        });
    }
    if result.is_null() {
        return Err(PrivilegeError::UnknownUser(name.to_string()));
    }
    Ok(Account {
        uid: pwd.pw_uid,
        gid: pwd.pw_gid,
    })
}

/// Become `user` if running as root: clear supplementary groups, switch to
/// the user's primary group and uid, and set a 077 umask.
///
/// A no-op when not running as root.
pub fn drop_privileges(user: &str) -> Result<(), PrivilegeError> {
    // SAFETY: getuid has no preconditions.
    if unsafe { libc::getuid() } != 0 {
        tracing::debug!(user, "not running as root, keeping current identity");
        return Ok(());
    }
    let account = lookup_user(user)?;

    // SAFETY: plain syscalls on integer arguments; the group list is empty.
    unsafe {
        check("setgroups", libc::setgroups(0, std::ptr::null()))?;
        check("setgid", libc::setgid(account.gid))?;
        check("setuid", libc::setuid(account.uid))?;
        libc::umask(0o077);
    }
    tracing::info!(user, uid = account.uid, gid = account.gid, "dropped privileges");
    Ok(())
}

fn check(call: &'static str, rc: libc::c_int) -> Result<(), PrivilegeError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(PrivilegeError::Syscall {
            call,
            source: std::io::Error::last_os_error(),
        })
    }
}

/// Name of the account owning this process, if it can be resolved.
pub fn current_user() -> Option<String> {
    // SAFETY: getpwuid returns a pointer into static storage or null; the
    // name is copied out immediately.
    unsafe {
        let pwd = libc::getpwuid(libc::getuid());
        if pwd.is_null() || (*pwd).pw_name.is_null() {
            return None;
        }
        Some(CStr::from_ptr((*pwd).pw_name).to_string_lossy().into_owned())
    }
}
