//! Scoped switches to the audio server owner's identity.
//!
//! The daemon must be root to write cpufreq attributes, but the audio server only accepts
//! clients running as its owner. Effective and saved ids are switched while the real ids
//! stay root, so root can always be restored.

use std::thread;
use std::time::Duration;

use nix::unistd::{Gid, Group, Uid, User, getgid, getuid, setresgid, setresuid};

use crate::constants::CONNECT_SETTLE_MS;
use crate::discovery::ProcessInfo;
use crate::error::{Error, Result};

/// Identity of the audio server owner, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivilegeContext {
    pub uid: Uid,
    pub gid: Gid,
}

impl PrivilegeContext {
    /// Resolves the configured owner, falling back to the discovered server process.
    ///
    /// `user`/`group` are names or numeric ids. A user without a group uses its primary
    /// group. `Ok(None)` means nobody to switch to; connections are made as root.
    pub fn resolve(
        user: Option<&str>,
        group: Option<&str>,
        discovered: impl FnOnce() -> Option<ProcessInfo>,
    ) -> Result<Option<Self>> {
        let gid = group.map(resolve_group).transpose()?;
        match user {
            Some(user) => {
                let (uid, primary) = resolve_user(user)?;
                Ok(Some(Self {
                    uid,
                    gid: gid.or(primary).unwrap_or_else(|| Gid::from_raw(0)),
                }))
            }
            None if gid.is_some() => Ok(gid.map(|gid| Self {
                uid: Uid::from_raw(0),
                gid,
            })),
            None => Ok(discovered().map(|p| Self {
                uid: p.uid,
                gid: p.gid,
            })),
        }
    }
}

fn resolve_user(user: &str) -> Result<(Uid, Option<Gid>)> {
    let by_name = User::from_name(user).ok().flatten();
    if let Some(u) = by_name {
        return Ok((u.uid, Some(u.gid)));
    }
    let uid = user
        .parse::<u32>()
        .map(Uid::from_raw)
        .map_err(|_| Error::Config(format!("failed to get UID for user {user}")))?;
    let primary = User::from_uid(uid).ok().flatten().map(|u| u.gid);
    Ok((uid, primary))
}

fn resolve_group(group: &str) -> Result<Gid> {
    if let Some(g) = Group::from_name(group).ok().flatten() {
        return Ok(g.gid);
    }
    group
        .parse::<u32>()
        .map(Gid::from_raw)
        .map_err(|_| Error::Config(format!("failed to get GID for group {group}")))
}

/// The process-wide identity switch, a seam so the gate can be exercised without root.
pub trait IdentitySwitch {
    fn assume(&self, ctx: &PrivilegeContext) -> Result<()>;
    fn restore(&self) -> Result<()>;
}

/// Switches the effective and saved ids of the whole process.
#[derive(Debug)]
pub struct ProcessIdentity {
    root_uid: Uid,
    root_gid: Gid,
}

impl ProcessIdentity {
    pub fn current() -> Self {
        Self {
            root_uid: getuid(),
            root_gid: getgid(),
        }
    }
}

impl IdentitySwitch for ProcessIdentity {
    fn assume(&self, ctx: &PrivilegeContext) -> Result<()> {
        // group first, changing it needs root
        setresgid(self.root_gid, ctx.gid, ctx.gid).map_err(|source| Error::Privilege {
            action: "setresgid",
            source,
        })?;
        setresuid(self.root_uid, ctx.uid, ctx.uid).map_err(|source| Error::Privilege {
            action: "setresuid",
            source,
        })
    }

    fn restore(&self) -> Result<()> {
        setresuid(self.root_uid, self.root_uid, self.root_uid).map_err(|source| {
            Error::Privilege {
                action: "restore uid",
                source,
            }
        })?;
        setresgid(self.root_gid, self.root_gid, self.root_gid).map_err(|source| {
            Error::Privilege {
                action: "restore gid",
                source,
            }
        })
    }
}

/// Brackets calls that must run as the audio server owner.
pub struct PrivilegeGate {
    ctx: Option<PrivilegeContext>,
    identity: Box<dyn IdentitySwitch + Send>,
}

/// Restores root when dropped, whatever way the scope is left.
struct Restore<'a>(&'a dyn IdentitySwitch);

impl Drop for Restore<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.restore() {
            log::error!("{e}");
        }
    }
}

impl PrivilegeGate {
    pub fn new(ctx: Option<PrivilegeContext>, identity: Box<dyn IdentitySwitch + Send>) -> Self {
        Self { ctx, identity }
    }

    pub fn for_process(ctx: Option<PrivilegeContext>) -> Self {
        Self::new(ctx, Box::new(ProcessIdentity::current()))
    }

    /// Runs `f` as the owner, then restores root.
    pub fn with_dropped_privileges<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        let Some(ctx) = &self.ctx else {
            return Ok(f());
        };
        log::trace!("assume user: uid:{} gid:{}", ctx.uid, ctx.gid);
        // a half-applied switch is undone too
        let _restore = Restore(self.identity.as_ref());
        self.identity.assume(ctx)?;
        Ok(f())
    }

    /// Like [`Self::with_dropped_privileges`], but holds the identity for a settle period
    /// after `f` succeeds, so the server can finish setting up the new client.
    pub fn connect_as_owner<T, E>(
        &self,
        f: impl FnOnce() -> std::result::Result<T, E>,
    ) -> Result<std::result::Result<T, E>> {
        self.with_dropped_privileges(|| {
            let result = f();
            if result.is_ok() {
                thread::yield_now();
                thread::sleep(Duration::from_millis(CONNECT_SETTLE_MS));
                thread::yield_now();
            }
            result
        })
    }
}
