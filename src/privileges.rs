//! Privilege guard
//!
//! Drops setuid/setgid elevation before any session resource is created
//! and verifies the drop actually stuck. Group identity goes first: once
//! the user id is dropped there is no authority left to change groups.

use anyhow::{bail, Context, Result};
use log::{info, warn};
use nix::unistd::{getegid, geteuid, getgid, getuid, setgid, setuid, Gid, Uid};

pub fn drop_privileges() -> Result<()> {
    if getuid().is_root() || getgid().as_raw() == 0 {
        warn!("running as the root user, this is dangerous");
        return Ok(());
    }

    if getuid() != geteuid() || getgid() != getegid() {
        info!("setuid/setgid elevation detected, dropping privileges");
        setgid(getgid()).context("Unable to drop the elevated group id, refusing to start")?;
        setuid(getuid()).context("Unable to drop the elevated user id, refusing to start")?;
    }

    // If either of these succeeds the drop did not actually relinquish
    // elevation, which is a security fault, not a recoverable condition.
    if setgid(Gid::from_raw(0)).is_ok() || setuid(Uid::from_raw(0)).is_ok() {
        bail!("Unable to drop privileges: elevated identity can still be re-acquired");
    }

    Ok(())
}
