//! Readiness reactor
//!
//! The core is single-threaded and cooperative: every operation that would
//! block on I/O returns to the reactor loop, which reports readable,
//! writable and exceptional transitions on registered descriptors. This
//! module defines the poll-shaped interface the coordinator consumes and a
//! mio-backed implementation of it.
//!
//! mio is edge-triggered: consumers must drain a descriptor fully on each
//! readiness report or they will stall waiting for a transition that
//! already happened.

use crate::error::{Result, TorError};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness mask bits.
pub type Mask = u8;

/// Descriptor has bytes to read.
pub const READABLE: Mask = 0b001;
/// Descriptor accepts writes.
pub const WRITABLE: Mask = 0b010;
/// Descriptor error or hangup.
pub const EXCEPTIONAL: Mask = 0b100;

/// A poll-shaped readiness source.
pub trait Reactor {
    /// Watch `fd` for the events in `mask` (replacing any previous mask).
    fn register(&mut self, fd: RawFd, mask: Mask) -> Result<()>;

    /// Stop watching `fd`.
    fn unregister(&mut self, fd: RawFd) -> Result<()>;

    /// Wait up to `timeout` (forever when `None`) and report transitions
    /// as `(fd, mask)` pairs.
    fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Mask)>>;
}

/// Reactor backed by mio's `Poll`.
pub struct PollReactor {
    poll: Poll,
    events: Events,
    registered: HashMap<RawFd, Mask>,
}

impl PollReactor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            poll: Poll::new().map_err(|e| TorError::Transport(format!("poll: {}", e)))?,
            events: Events::with_capacity(64),
            registered: HashMap::new(),
        })
    }

    fn interest(mask: Mask) -> Option<Interest> {
        let mut interest = None;
        if mask & READABLE != 0 {
            interest = Some(Interest::READABLE);
        }
        if mask & WRITABLE != 0 {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interest
    }
}

impl Reactor for PollReactor {
    fn register(&mut self, fd: RawFd, mask: Mask) -> Result<()> {
        let Some(interest) = Self::interest(mask) else {
            // Nothing left to watch.
            return self.unregister(fd);
        };

        let registry = self.poll.registry();
        let mut source = SourceFd(&fd);
        let res = if self.registered.contains_key(&fd) {
            registry.reregister(&mut source, Token(fd as usize), interest)
        } else {
            registry.register(&mut source, Token(fd as usize), interest)
        };
        res.map_err(|e| TorError::Transport(format!("register fd {}: {}", fd, e)))?;

        self.registered.insert(fd, mask);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        if self.registered.remove(&fd).is_some() {
            self.poll
                .registry()
                .deregister(&mut SourceFd(&fd))
                .map_err(|e| TorError::Transport(format!("unregister fd {}: {}", fd, e)))?;
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Mask)>> {
        self.poll
            .poll(&mut self.events, timeout)
            .map_err(|e| TorError::Transport(format!("poll: {}", e)))?;

        let mut out = Vec::new();
        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            let mut mask = 0;
            if event.is_readable() {
                mask |= READABLE;
            }
            if event.is_writable() {
                mask |= WRITABLE;
            }
            if event.is_error() || event.is_read_closed() || event.is_write_closed() {
                mask |= EXCEPTIONAL;
            }
            if mask != 0 {
                out.push((fd, mask));
            }
        }
        Ok(out)
    }
}
