//! Readiness set for one relay tick.
//!
//! Interests are rebuilt every tick and polled once. Readiness is
//! consumed: the first taker of a ready bit clears it, so two endpoints
//! sharing an fd cannot both act on the same event.

use std::io;
use std::os::fd::RawFd;

use libc::{nfds_t, pollfd, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

use super::Result;

// Error conditions wake the reader so the failure surfaces as a recv.
const READ_READY: libc::c_short = POLLIN | POLLHUP | POLLERR | POLLNVAL;
const WRITE_READY: libc::c_short = POLLOUT | POLLHUP | POLLERR | POLLNVAL;

pub struct PollSet {
    fds: Vec<pollfd>,
    ready: usize,
}

impl PollSet {
    pub fn new() -> Self {
        PollSet {
            fds: Vec::new(),
            ready: 0,
        }
    }

    /// Drop all interests from the previous tick.
    pub fn clear(&mut self) {
        self.fds.clear();
        self.ready = 0;
    }

    pub fn want_read(&mut self, fd: RawFd) {
        self.want(fd, POLLIN);
    }

    pub fn want_write(&mut self, fd: RawFd) {
        self.want(fd, POLLOUT);
    }

    fn want(&mut self, fd: RawFd, events: libc::c_short) {
        if fd < 0 {
            return;
        }
        match self.fds.iter_mut().find(|p| p.fd == fd) {
            Some(p) => p.events |= events,
            None => self.fds.push(pollfd {
                fd,
                events,
                revents: 0,
            }),
        }
    }

    /// Poll the gathered interests. Returns how many fds are ready;
    /// a signal interrupt counts as nothing ready.
    pub fn poll(&mut self, timeout_ms: i32) -> Result<usize> {
        self.ready = 0;
        if self.fds.is_empty() {
            return Ok(0);
        }
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err.into());
        }
        self.ready = rc as usize;
        Ok(self.ready)
    }

    pub fn ready(&self) -> usize {
        self.ready
    }

    /// True once if the fd is ready to read (or has an error pending).
    pub fn take_readable(&mut self, fd: RawFd) -> bool {
        self.take(fd, READ_READY)
    }

    /// True once if the fd is ready to write (or has an error pending).
    pub fn take_writable(&mut self, fd: RawFd) -> bool {
        self.take(fd, WRITE_READY)
    }

    fn take(&mut self, fd: RawFd, mask: libc::c_short) -> bool {
        match self.fds.iter_mut().find(|p| p.fd == fd) {
            Some(p) if p.revents & mask != 0 => {
                p.revents &= !mask;
                true
            }
            _ => false,
        }
    }
}

impl Default for PollSet {
    fn default() -> Self {
        Self::new()
    }
}
