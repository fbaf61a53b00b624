//! Account policy: which OS accounts a task may run as, and whether the
//! current process has the privilege to switch to one.

use crate::error::{SchedulerError, SchedulerResult};

/// Primary group ids that are always allowed to own a task, per §4.3.
pub const ALLOWED_ACCOUNT_GIDS: [u32; 3] = [0, 1000, 1001];

/// Returns `Ok(())` if `account` is allowed to own a task on this host.
///
/// On POSIX hosts this checks the account's primary gid against
/// `ALLOWED_ACCOUNT_GIDS`, falling back to supplemental group membership.
/// On non-POSIX hosts the only allowed account is the process's own user.
pub fn ensure_account_allowed(account: &str) -> SchedulerResult<()> {
    if !platform::account_allowed(account)? {
        return Err(SchedulerError::AccountNotAllowed(account.to_owned()));
    }
    Ok(())
}

/// Returns `Ok(())` if the current process may switch its effective user
/// to `account` before exec'ing a child (§4.3: requires uid 0 unless the
/// account is already the process's own).
pub fn ensure_may_switch_to(account: &str) -> SchedulerResult<()> {
    platform::ensure_may_switch_to(account)
}

/// The process's own account name, used as the default account and as the
/// sole allowed account on non-POSIX hosts.
pub fn current_account_name() -> SchedulerResult<String> {
    platform::current_account_name()
}

/// Every distinct account name whose primary or supplemental group is in
/// `ALLOWED_ACCOUNT_GIDS` (§4.3), sorted. On non-POSIX hosts this is just
/// the process's own account.
pub fn list_allowed_accounts() -> SchedulerResult<Vec<String>> {
    platform::list_allowed_accounts()
}

#[cfg(unix)]
mod platform {
    use super::*;
    use std::ffi::{CStr, CString};
    use std::ptr;
    use std::sync::Mutex;

    /// `getpwent`/`setpwent`/`endpwent` share global iteration state across
    /// the whole process; serialize access so concurrent account listings
    /// don't interleave.
    static PWENT_LOCK: Mutex<()> = Mutex::new(());

    /// Every account in `/etc/passwd` with an allowed primary gid, unioned
    /// with the membership list of each allowed gid's group, sorted and
    /// de-duplicated. Mirrors the reference's `list_allowed_accounts`.
    pub fn list_allowed_accounts() -> SchedulerResult<Vec<String>> {
        let mut accounts = std::collections::BTreeSet::new();
        {
            let _guard = PWENT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            unsafe {
                libc::setpwent();
                loop {
                    let entry = libc::getpwent();
                    if entry.is_null() {
                        break;
                    }
                    if ALLOWED_ACCOUNT_GIDS.contains(&(*entry).pw_gid) {
                        let name = CStr::from_ptr((*entry).pw_name).to_string_lossy().into_owned();
                        accounts.insert(name);
                    }
                }
                libc::endpwent();
            }
        }
        for gid in ALLOWED_ACCOUNT_GIDS {
            for member in group_members(gid)? {
                accounts.insert(member);
            }
        }
        Ok(accounts.into_iter().collect())
    }

    /// Members of the group with gid `gid`, or an empty list if the group
    /// does not exist on this host.
    fn group_members(gid: u32) -> SchedulerResult<Vec<String>> {
        let mut buf = vec![0_i8; 16384];
        let mut result: libc::group = unsafe { std::mem::zeroed() };
        let mut result_ptr: *mut libc::group = ptr::null_mut();
        let rc = unsafe {
            libc::getgrgid_r(gid, &mut result, buf.as_mut_ptr(), buf.len(), &mut result_ptr)
        };
        if rc != 0 || result_ptr.is_null() {
            return Ok(Vec::new());
        }
        let mut members = Vec::new();
        unsafe {
            let mut member_ptr = result.gr_mem;
            while !(*member_ptr).is_null() {
                members.push(CStr::from_ptr(*member_ptr).to_string_lossy().into_owned());
                member_ptr = member_ptr.add(1);
            }
        }
        Ok(members)
    }

    pub fn account_allowed(account: &str) -> SchedulerResult<bool> {
        let passwd = lookup_passwd(account)?;
        if ALLOWED_ACCOUNT_GIDS.contains(&passwd.gid) {
            return Ok(true);
        }
        let memberships = supplementary_gids(account, passwd.gid)?;
        Ok(memberships.iter().any(|gid| ALLOWED_ACCOUNT_GIDS.contains(gid)))
    }

    pub fn ensure_may_switch_to(account: &str) -> SchedulerResult<()> {
        let current_uid = unsafe { libc::getuid() };
        if current_uid == 0 {
            return Ok(());
        }
        let passwd = lookup_passwd(account)?;
        if passwd.uid == current_uid {
            return Ok(());
        }
        Err(SchedulerError::PrivilegeRequired(account.to_owned()))
    }

    pub fn current_account_name() -> SchedulerResult<String> {
        let uid = unsafe { libc::getuid() };
        let mut buf = vec![0_i8; 16384];
        let mut result: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result_ptr: *mut libc::passwd = ptr::null_mut();
        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                &mut result,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result_ptr,
            )
        };
        if rc != 0 || result_ptr.is_null() {
            return Err(SchedulerError::Internal(
                "could not resolve current account name".to_owned(),
            ));
        }
        let name = unsafe { CStr::from_ptr(result.pw_name) };
        Ok(name.to_string_lossy().into_owned())
    }

    pub(super) struct Passwd {
        pub uid: u32,
        pub gid: u32,
        pub home_dir: String,
    }

    pub(super) fn lookup_passwd(account: &str) -> SchedulerResult<Passwd> {
        let c_name = CString::new(account)
            .map_err(|_| SchedulerError::AccountMissing(account.to_owned()))?;
        let mut buf = vec![0_i8; 16384];
        let mut result: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result_ptr: *mut libc::passwd = ptr::null_mut();
        let rc = unsafe {
            libc::getpwnam_r(
                c_name.as_ptr(),
                &mut result,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result_ptr,
            )
        };
        if rc != 0 || result_ptr.is_null() {
            return Err(SchedulerError::AccountMissing(account.to_owned()));
        }
        let home_dir = unsafe { CStr::from_ptr(result.pw_dir) }
            .to_string_lossy()
            .into_owned();
        Ok(Passwd {
            uid: result.pw_uid,
            gid: result.pw_gid,
            home_dir,
        })
    }

    pub fn home_dir(account: &str) -> SchedulerResult<String> {
        Ok(lookup_passwd(account)?.home_dir)
    }

    /// Primary gid plus every group the account is a supplemental member
    /// of, de-duplicated and sorted (§4.3's switching order requirement).
    pub fn supplementary_gids(account: &str, primary_gid: u32) -> SchedulerResult<Vec<u32>> {
        let c_name = CString::new(account)
            .map_err(|_| SchedulerError::AccountMissing(account.to_owned()))?;
        let mut ngroups: libc::c_int = 64;
        let mut groups = vec![0_u32; ngroups as usize];
        let rc = unsafe {
            libc::getgrouplist(
                c_name.as_ptr(),
                primary_gid,
                groups.as_mut_ptr() as *mut libc::gid_t,
                &mut ngroups,
            )
        };
        if rc < 0 {
            groups.resize(ngroups as usize, 0);
            unsafe {
                libc::getgrouplist(
                    c_name.as_ptr(),
                    primary_gid,
                    groups.as_mut_ptr() as *mut libc::gid_t,
                    &mut ngroups,
                );
            }
        }
        groups.truncate(ngroups.max(0) as usize);
        groups.sort_unstable();
        groups.dedup();
        Ok(groups)
    }
}

#[cfg(not(unix))]
mod platform {
    use super::*;

    pub fn account_allowed(account: &str) -> SchedulerResult<bool> {
        Ok(account == current_account_name()?)
    }

    pub fn ensure_may_switch_to(account: &str) -> SchedulerResult<()> {
        if account == current_account_name()? {
            Ok(())
        } else {
            Err(SchedulerError::AccountNotAllowed(account.to_owned()))
        }
    }

    pub fn current_account_name() -> SchedulerResult<String> {
        std::env::var("USERNAME")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| SchedulerError::Internal("could not resolve current account name".to_owned()))
    }

    pub fn list_allowed_accounts() -> SchedulerResult<Vec<String>> {
        Ok(vec![current_account_name()?])
    }

    pub fn home_dir(_account: &str) -> SchedulerResult<String> {
        std::env::var("USERPROFILE")
            .or_else(|_| std::env::var("HOME"))
            .map_err(|_| SchedulerError::Internal("could not resolve home directory".to_owned()))
    }
}

pub use platform::home_dir;

/// Resolved uid/gid/home-dir/supplementary-groups for an account, used by
/// the executor to build its pre-exec privilege-drop closure.
#[cfg(unix)]
pub struct AccountInfo {
    pub uid: u32,
    pub gid: u32,
    pub home_dir: String,
    pub supplementary_gids: Vec<u32>,
}

#[cfg(unix)]
pub fn resolve_account(account: &str) -> SchedulerResult<AccountInfo> {
    let passwd = platform::lookup_passwd(account)?;
    let supplementary_gids = platform::supplementary_gids(account, passwd.gid)?;
    Ok(AccountInfo {
        uid: passwd.uid,
        gid: passwd.gid,
        home_dir: passwd.home_dir,
        supplementary_gids,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn root_primary_group_is_allowed() {
        // root (uid/gid 0) is always present on POSIX hosts and its
        // primary gid (0) is in ALLOWED_ACCOUNT_GIDS.
        assert!(ensure_account_allowed("root").is_ok());
    }

    #[test]
    fn unknown_account_is_missing() {
        let err = ensure_account_allowed("no-such-account-xyz123").unwrap_err();
        assert!(matches!(err, SchedulerError::AccountMissing(_)));
    }

    #[test]
    fn list_allowed_accounts_includes_root() {
        let accounts = list_allowed_accounts().unwrap();
        assert!(accounts.contains(&"root".to_owned()));
        let mut sorted = accounts.clone();
        sorted.sort();
        assert_eq!(accounts, sorted);
    }
}
