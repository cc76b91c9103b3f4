//! Termination signal bridge
//!
//! Blocks SIGINT and SIGTERM on the event-loop thread and receives them
//! through a signalfd registered as a loop source. Either signal requests
//! loop termination; no other signal is handled. Registration and
//! de-registration are symmetric, and the previous signal mask is restored
//! on unregister.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use anyhow::{Context, Result};
use log::{debug, warn};
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use super::{EventLoop, Interest, SourceAction, SourceToken};

pub struct SignalBridge {
    signal_fd: Rc<RefCell<SignalFd>>,
    old_mask: SigSet,
    token: Option<SourceToken>,
}

impl SignalBridge {
    /// Block INT/TERM and open the signalfd that receives them.
    pub fn install() -> Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);

        let old_mask = mask
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .context("Failed to block termination signals")?;

        let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .context("Failed to create signalfd")?;

        Ok(SignalBridge {
            signal_fd: Rc::new(RefCell::new(signal_fd)),
            old_mask,
            token: None,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.signal_fd.borrow().as_raw_fd()
    }

    /// Register the signalfd as a loop source. Receipt of either signal
    /// stops the loop; the two are not distinguished.
    pub fn register<T>(&mut self, event_loop: &mut EventLoop<T>) {
        let fd = self.raw_fd();
        let signal_fd = Rc::clone(&self.signal_fd);
        let token = event_loop.add_fd(
            fd,
            Interest::READABLE,
            Box::new(move |_data, _readiness, signal| {
                let mut signal_fd = signal_fd.borrow_mut();
                while let Ok(Some(info)) = signal_fd.read_signal() {
                    debug!("termination signal {} received", info.ssi_signo);
                }
                signal.stop();
                SourceAction::Keep
            }),
        );
        self.token = Some(token);
    }

    /// Remove the loop source and restore the previous signal mask.
    pub fn unregister<T>(&mut self, event_loop: &mut EventLoop<T>) {
        if let Some(token) = self.token.take() {
            event_loop.remove(token);
        }
        if let Err(err) = self.old_mask.thread_set_mask() {
            warn!("failed to restore the signal mask: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_and_restores_termination_signals() {
        let before = SigSet::thread_get_mask().unwrap();
        let term_blocked_before = before.contains(Signal::SIGTERM);

        let mut bridge = SignalBridge::install().unwrap();
        let during = SigSet::thread_get_mask().unwrap();
        assert!(during.contains(Signal::SIGINT));
        assert!(during.contains(Signal::SIGTERM));
        assert!(bridge.raw_fd() >= 0);

        let mut event_loop: EventLoop<()> = EventLoop::new();
        bridge.register(&mut event_loop);
        bridge.unregister(&mut event_loop);

        let after = SigSet::thread_get_mask().unwrap();
        assert_eq!(after.contains(Signal::SIGTERM), term_blocked_before);
    }
}
