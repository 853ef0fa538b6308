//! One directional half of a proxied exchange.
//!
//! A `Request` owns a single relay buffer and a position in the lifecycle
//! below; the inbound half reads from the client, the outbound half reads
//! from the origin (or a fetch stream), and each writes into its partner's
//! socket. Pairing is by index into the proxy's request map, never by
//! reference, so either half can die without dangling the other.

use std::io;
use std::os::fd::RawFd;
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::fetch::StreamId;
use crate::http::header::{self, HeaderPolicy};
use crate::http::{HttpInfo, MessageState, Verb, BUFFER_SIZE};
use crate::net::registry::SockEntry;

/// Millis slept before retrying a would-block send or receive.
const ROBUST_MILLIS: u64 = 40;

/// Request lifecycle. `Dormant` is the parked state of a freshly spawned
/// reply half: it must not read until its partner's first write lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqState {
    Dormant,
    Start,
    Wait,
    NeedRead,
    NeedWrite,
    Error,
    Done,
}

pub struct Request {
    pub index: u64,
    /// Partner that feeds us (the request we reply to).
    pub fwd: Option<u64>,
    /// Partner we feed (the reply spawned for us).
    pub back: Option<u64>,
    pub state: ReqState,
    /// True for the inbound (client-facing) half.
    pub origin: bool,
    pub src_fd: Option<RawFd>,
    pub dst_fd: Option<RawFd>,
    pub fetch: Option<StreamId>,
    pub verb: Verb,
    pub msg: MessageState,
    /// Origin-connection cap for this request's host; a `-single` rule
    /// lowers it to one.
    pub max_conn: u32,
    buffer: Vec<u8>,
    pub buffer_len: usize,
    /// Partial-header fill offset: the next read appends here.
    pub recv_off: usize,
    /// Partial-write drain offset: the next send resumes here.
    pub send_off: usize,
    /// Bytes relayed so far, not counting the buffer in flight.
    pub accum: i64,
    /// Messages completed on this half; zero means headers still pending.
    pub msg_count: u32,
    pub start_time: Instant,
    pub recent_time: Instant,
    /// When the destination socket was opened; ages keep-alive reuse.
    pub sock_time: Instant,
}

impl Request {
    pub fn new(index: u64, now: Instant) -> Self {
        Request {
            index,
            fwd: None,
            back: None,
            state: ReqState::Dormant,
            origin: false,
            src_fd: None,
            dst_fd: None,
            fetch: None,
            verb: Verb::None,
            msg: MessageState::new(),
            max_conn: 0,
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_len: 0,
            recv_off: 0,
            send_off: 0,
            accum: 0,
            msg_count: 0,
            start_time: now,
            recent_time: now,
            sock_time: now,
        }
    }

    pub fn host(&self) -> &str {
        &self.msg.host
    }

    pub fn buf(&self) -> &[u8] {
        &self.buffer[..self.buffer_len]
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Latch-aware state change: once in `Error` a request stays there.
    pub fn set_state(&mut self, state: ReqState) {
        if self.state != ReqState::Error {
            self.state = state;
        }
    }

    /// Latch `Error` and log the reason once.
    pub fn fail(&mut self, why: &str) {
        if self.state != ReqState::Error {
            warn!(index = self.index, host = %self.msg.host, why, "request failed");
        }
        self.state = ReqState::Error;
    }

    /// Run header extraction over the buffered bytes, rewriting them in
    /// place and shrinking the buffer when lines are removed.
    pub fn extract_header(&mut self, policy: &HeaderPolicy) {
        self.buffer_len = header::extract(
            &mut self.buffer,
            self.buffer_len,
            self.verb,
            &mut self.msg,
            policy,
        );
    }

    /// Feed the buffered bytes through the chunked-coding scanner.
    pub fn advance_chunks(&mut self) {
        self.msg.chunk.advance(&self.buffer[..self.buffer_len], 0);
    }

    /// Turn an inbound request into a reply relay for the fetch path: the
    /// request bytes are dropped and the next read is parsed as a fresh
    /// HTTP response.
    pub fn reset_for_reply(&mut self) {
        self.origin = false;
        self.verb = Verb::None;
        self.msg.info = HttpInfo::default();
        self.msg.chunk.reset();
        self.msg.msg_len = -1;
        self.msg_count = 0;
        self.buffer_len = 0;
        self.recv_off = 0;
        self.send_off = 0;
        self.accum = 0;
    }

    /// Whole message is buffered and drained: accumulated plus in-flight
    /// bytes reach the known length.
    pub fn message_complete(&self) -> bool {
        self.msg.msg_len >= 0 && self.accum + self.buffer_len as i64 >= self.msg.msg_len
    }

    /// Read into the buffer at the partial-header offset, retrying
    /// would-block and interrupts in place. On success the buffer holds
    /// `recv_off + n` bytes and the offset is consumed.
    pub fn recv_from(&mut self, se: &mut SockEntry) -> io::Result<usize> {
        let off = self.recv_off;
        self.recv_off = 0;
        if off >= self.buffer.len() {
            return Err(io::Error::new(io::ErrorKind::Other, "no buffer space"));
        }
        loop {
            match se.recv(&mut self.buffer[off..]) {
                Ok(n) => {
                    self.buffer_len = off + n;
                    return Ok(n);
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    thread::sleep(Duration::from_millis(ROBUST_MILLIS));
                }
                Err(e) => {
                    se.errors += 1;
                    return Err(e);
                }
            }
        }
    }

    /// Send the buffered bytes from the drain offset, retrying would-block
    /// and interrupts in place. A short write advances the offset and
    /// leaves it nonzero so the caller stays in `NeedWrite`.
    pub fn send_to(&mut self, se: &mut SockEntry) -> io::Result<usize> {
        let len = self.buffer_len - self.send_off;
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "nothing to send"));
        }
        loop {
            match se.send(&self.buffer[self.send_off..self.buffer_len]) {
                Ok(n) => {
                    if n < len {
                        warn!(index = self.index, sent = n, want = len, "short write");
                        self.send_off += n;
                    } else {
                        self.send_off = 0;
                    }
                    return Ok(n);
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    thread::sleep(Duration::from_millis(ROBUST_MILLIS));
                }
                Err(e) => {
                    se.errors += 1;
                    return Err(e);
                }
            }
        }
    }
}
