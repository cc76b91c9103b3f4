//! Primary client supervision
//!
//! Forks the one permitted client process and bridges its lifetime into
//! the event loop: the child inherits the write end of a notification pipe
//! across exec, so the read end reports hangup exactly when the child (or
//! anything it handed the descriptor to) is gone. The blocking reap runs
//! only after that hangup fired, or after the loop was stopped for another
//! reason, and maps the wait status to a shell-style exit code.

#![allow(dead_code)]

use std::ffi::{CString, OsString};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::SigSet;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::event::{EventLoop, Interest, SourceAction, SourceToken};

/// Lifecycle of the supervised client. The state moves from `Running` to
/// exactly one terminal value, assigned by [`ChildProcess::reap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    ExitedNormally(i32),
    ExitedBySignal(i32),
    /// Waited on, but with a status that is neither a normal exit nor a
    /// signal termination.
    Reaped,
}

pub struct ChildProcess {
    pid: Pid,
    notify_read: Option<OwnedFd>,
    state: ChildState,
}

impl ChildProcess {
    /// Fork and exec the client. The child unblocks all signals, closes
    /// its copy of the pipe's read end and inherits the environment,
    /// including the advertised display-socket name.
    pub fn spawn(command: &[OsString]) -> Result<ChildProcess> {
        let program = command.first().context("empty client command")?;
        let program_c = CString::new(program.as_bytes())
            .context("client executable name contains a NUL byte")?;
        let argv: Vec<CString> = command
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<std::result::Result<_, _>>()
            .context("client argument contains a NUL byte")?;

        // Everything the child touches after fork is prepared up front:
        // the exec argv pointers and the failure message. The child only
        // makes async-signal-safe calls.
        let mut argv_ptrs: Vec<*const libc::c_char> =
            argv.iter().map(|arg| arg.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let exec_error = format!(
            "corral: failed to execute '{}'\n",
            program.to_string_lossy()
        );

        let (notify_read, notify_write) = notification_pipe()?;

        match unsafe { fork() }.context("Unable to fork")? {
            ForkResult::Child => {
                let _ = SigSet::empty().thread_set_mask();
                // Only the write end is the child's; it closes on exit.
                drop(notify_read);
                unsafe {
                    libc::execvp(program_c.as_ptr(), argv_ptrs.as_ptr());
                    libc::write(
                        libc::STDERR_FILENO,
                        exec_error.as_ptr() as *const _,
                        exec_error.len(),
                    );
                    libc::_exit(1);
                }
            }
            ForkResult::Parent { child } => {
                // Mark both ends close-on-exec so no later exec leaks
                // them, then give up the write end entirely.
                set_cloexec(notify_read.as_raw_fd())?;
                set_cloexec(notify_write.as_raw_fd())?;
                drop(notify_write);

                debug!("client process spawned with pid {}", child);
                Ok(ChildProcess {
                    pid: child,
                    notify_read: Some(notify_read),
                    state: ChildState::Running,
                })
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ChildState {
        self.state
    }

    /// Read end of the notification pipe, while still registered here.
    pub fn notify_fd(&self) -> Option<RawFd> {
        self.notify_read.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Register the pipe's read end as an event source awaiting hangup.
    /// When it fires, the source closes the descriptor, invokes `on_exit`
    /// and requests loop termination.
    pub fn register<T>(
        &mut self,
        event_loop: &mut EventLoop<T>,
        mut on_exit: impl FnMut(&mut T) + 'static,
    ) -> Option<SourceToken> {
        let notify_read = self.notify_read.take()?;
        let raw = notify_read.as_raw_fd();
        let pid = self.pid;
        let mut notify_read = Some(notify_read);
        Some(event_loop.add_fd(
            raw,
            Interest::HANGUP,
            Box::new(move |data, readiness, signal| {
                if readiness.hangup {
                    debug!("client process {} closed the notification pipe", pid);
                } else if readiness.error {
                    debug!("notification pipe for client {} errored", pid);
                }
                drop(notify_read.take());
                on_exit(data);
                signal.stop();
                SourceAction::Remove
            }),
        ))
    }

    /// Blocking wait for the child, mapping its termination reason to an
    /// exit code: a normal exit passes through verbatim, a signal death
    /// becomes 128 plus the signal number (shell convention), anything
    /// else maps to 0. Idempotent once a terminal state is reached.
    pub fn reap(&mut self) -> i32 {
        match self.state {
            ChildState::ExitedNormally(code) => return code,
            ChildState::ExitedBySignal(signum) => return 128 + signum,
            ChildState::Reaped => return 0,
            ChildState::Running => {}
        }
        match waitpid(self.pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                debug!("client exited normally with status {}", code);
                self.state = ChildState::ExitedNormally(code);
                code
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                let signum = signal as i32;
                debug!("client was terminated by signal {}", signum);
                self.state = ChildState::ExitedBySignal(signum);
                128 + signum
            }
            Ok(status) => {
                debug!("client produced wait status {:?}", status);
                self.state = ChildState::Reaped;
                0
            }
            Err(err) => {
                warn!("waiting for client {} failed: {}", self.pid, err);
                self.state = ChildState::Reaped;
                0
            }
        }
    }
}

/// Pipe whose write end survives exec in the child; close-on-exec is
/// applied in the parent only, after the fork.
fn notification_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        bail!(
            "Unable to create the notification pipe: {}",
            std::io::Error::last_os_error()
        );
    }
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((read, write))
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFD).context("Unable to read descriptor flags")?;
    let flags = FdFlag::from_bits_truncate(flags) | FdFlag::FD_CLOEXEC;
    fcntl(fd, FcntlArg::F_SETFD(flags)).context("Unable to set the CLOEXEC flag")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn command(parts: &[&str]) -> Vec<OsString> {
        parts.iter().map(OsString::from).collect()
    }

    fn wait_for_hangup(fd: RawFd) {
        let mut poll_fd = libc::pollfd {
            fd,
            events: 0,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut poll_fd, 1, 5000) };
        assert_eq!(ready, 1, "notification pipe did not report hangup");
        assert_ne!(poll_fd.revents & libc::POLLHUP, 0);
    }

    #[test]
    fn exit_status_passes_through() {
        let mut child = ChildProcess::spawn(&command(&["sh", "-c", "exit 7"])).unwrap();
        wait_for_hangup(child.notify_fd().unwrap());
        assert_eq!(child.reap(), 7);
        assert_eq!(child.state(), ChildState::ExitedNormally(7));
        // Second reap does not wait again.
        assert_eq!(child.reap(), 7);
    }

    #[test]
    fn clean_exit_maps_to_zero() {
        let mut child = ChildProcess::spawn(&command(&["true"])).unwrap();
        wait_for_hangup(child.notify_fd().unwrap());
        assert_eq!(child.reap(), 0);
    }

    #[test]
    fn signal_death_maps_to_128_plus_signum() {
        let mut child = ChildProcess::spawn(&command(&["sh", "-c", "kill -TERM $$"])).unwrap();
        wait_for_hangup(child.notify_fd().unwrap());
        assert_eq!(child.reap(), 128 + 15);
        assert_eq!(child.state(), ChildState::ExitedBySignal(15));
    }

    #[test]
    fn exec_failure_exits_nonzero() {
        let mut child =
            ChildProcess::spawn(&command(&["/nonexistent/corral-test-binary"])).unwrap();
        wait_for_hangup(child.notify_fd().unwrap());
        assert_eq!(child.reap(), 1);
    }

    #[test]
    fn notification_pipe_is_cloexec_in_parent() {
        let mut child = ChildProcess::spawn(&command(&["true"])).unwrap();
        let fd = child.notify_fd().unwrap();
        let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        wait_for_hangup(fd);
        child.reap();
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(ChildProcess::spawn(&[]).is_err());
    }

    #[test]
    fn register_consumes_the_notification_pipe() {
        let mut child = ChildProcess::spawn(&command(&["true"])).unwrap();
        let mut event_loop: EventLoop<u32> = EventLoop::new();
        assert!(child.register(&mut event_loop, |_| {}).is_some());
        // The pipe moved into the source; a second bridge cannot exist.
        assert!(child.register(&mut event_loop, |_| {}).is_none());
        assert!(child.notify_fd().is_none());
        let mut fired = 0u32;
        event_loop.run(&mut fired).unwrap();
        child.reap();
    }
}
