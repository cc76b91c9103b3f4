//! Single-threaded readiness event loop
//!
//! Thin poll(2) wrapper dispatching fd readiness to registered callbacks.
//! Callbacks receive an explicit `&mut T` session reference instead of
//! reaching for globals, plus a [`LoopSignal`] to request cooperative
//! termination: the loop finishes the in-flight dispatch round and then
//! returns from [`EventLoop::run`].

mod signals;

pub use signals::SignalBridge;

use std::cell::Cell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use bitflags::bitflags;

bitflags! {
    /// Readiness a source wants to be woken for. Hangup and error
    /// conditions are always reported regardless of the mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: i16 {
        const READABLE = libc::POLLIN;
        const HANGUP = libc::POLLHUP;
    }
}

/// Readiness state delivered to a source callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    fn from_revents(revents: i16) -> Self {
        Readiness {
            readable: revents & libc::POLLIN != 0,
            hangup: revents & libc::POLLHUP != 0,
            error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
        }
    }
}

/// What the loop should do with a source after its callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceAction {
    Keep,
    Remove,
}

/// Identifies a registered source for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceToken(usize);

/// Shared stop flag; cloning hands the same flag to a callback.
#[derive(Clone)]
pub struct LoopSignal(Rc<Cell<bool>>);

impl LoopSignal {
    pub fn stop(&self) {
        self.0.set(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.get()
    }
}

type Callback<T> = Box<dyn FnMut(&mut T, Readiness, &LoopSignal) -> SourceAction>;

struct Source<T> {
    fd: RawFd,
    interest: Interest,
    callback: Callback<T>,
}

/// Poll-driven event loop over fd sources, generic over the session state
/// threaded into every callback.
pub struct EventLoop<T> {
    sources: Vec<Option<Source<T>>>,
    signal: LoopSignal,
}

impl<T> EventLoop<T> {
    pub fn new() -> Self {
        EventLoop {
            sources: Vec::new(),
            signal: LoopSignal(Rc::new(Cell::new(false))),
        }
    }

    /// Register `fd` with the given interest. The loop never takes
    /// ownership of the descriptor; the registrant keeps it alive until
    /// the source is removed.
    pub fn add_fd(&mut self, fd: RawFd, interest: Interest, callback: Callback<T>) -> SourceToken {
        let source = Source {
            fd,
            interest,
            callback,
        };
        for (index, slot) in self.sources.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(source);
                return SourceToken(index);
            }
        }
        self.sources.push(Some(source));
        SourceToken(self.sources.len() - 1)
    }

    pub fn remove(&mut self, token: SourceToken) {
        if let Some(slot) = self.sources.get_mut(token.0) {
            *slot = None;
        }
    }

    /// Dispatch readiness until a callback stops the loop. Returns early
    /// with an error only if poll itself fails, or if no sources remain.
    pub fn run(&mut self, data: &mut T) -> io::Result<()> {
        while !self.signal.is_stopped() {
            let active: Vec<(usize, RawFd, i16)> = self
                .sources
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    slot.as_ref()
                        .map(|source| (index, source.fd, source.interest.bits()))
                })
                .collect();
            if active.is_empty() {
                // Nothing left to wait on; running further would block forever.
                break;
            }

            let mut poll_fds: Vec<libc::pollfd> = active
                .iter()
                .map(|&(_, fd, events)| libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                })
                .collect();

            let ready = unsafe {
                libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, -1)
            };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }

            // Finish the whole dispatch round even if a callback requested
            // termination partway through.
            let signal = self.signal.clone();
            for (poll_fd, &(index, _, _)) in poll_fds.iter().zip(active.iter()) {
                if poll_fd.revents == 0 {
                    continue;
                }
                let readiness = Readiness::from_revents(poll_fd.revents);
                let action = match self.sources[index].as_mut() {
                    Some(source) => (source.callback)(data, readiness, &signal),
                    None => continue,
                };
                if action == SourceAction::Remove {
                    self.sources[index] = None;
                }
            }
        }
        Ok(())
    }
}
