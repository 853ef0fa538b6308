//! Name-addressed content retrieval.
//!
//! A `FetchChannel` holds one nonblocking TCP connection to a local content
//! daemon and multiplexes fetch streams over it. Each stream names one
//! piece of content; the channel pipelines segment interests and reassembles
//! the arriving segments so callers see a plain byte stream.

pub mod wire;

pub use wire::Frame;

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, warn};

/// Segment payload size; every segment but the final one carries exactly
/// this many bytes.
pub const SEGMENT_SIZE: usize = 4096;

/// Outstanding segment interests per stream.
pub const PIPELINE: usize = 8;

/// How long an interest may stay unanswered before its stream times out.
pub const INTEREST_TIMEOUT: Duration = Duration::from_secs(15);

/// Longest content name the channel accepts.
pub const MAX_NAME: usize = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("can't connect to content daemon at {addr}: {source}")]
    Connect { addr: SocketAddr, source: io::Error },

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("channel closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

pub type StreamId = u32;

/// Version preference carried in interest flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
    Default,
    High,
    #[default]
    Highest,
}

impl ResolveMode {
    pub fn flags(self) -> u8 {
        match self {
            ResolveMode::Default => 0,
            ResolveMode::High => 1,
            ResolveMode::Highest => 2,
        }
    }
}

/// Outcome of a stream read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchRead {
    /// Bytes copied out.
    Data(usize),
    /// Nothing buffered yet.
    None,
    /// The oldest interest went unanswered too long.
    Timeout,
    /// Every segment through the final one has been consumed.
    End,
}

struct Stream {
    name: Bytes,
    flags: u8,
    /// Next segment index to request.
    next_interest: u64,
    /// Segment index the read cursor is in.
    read_seg: u64,
    /// Byte offset within that segment.
    read_off: usize,
    position: u64,
    /// Arrived segments not yet fully consumed.
    segments: HashMap<u64, Bytes>,
    /// Issued interests awaiting data, with their expiry deadlines.
    pending: VecDeque<(u64, Instant)>,
    final_seg: Option<u64>,
    timed_out: bool,
    ended: bool,
}

impl Stream {
    fn new(name: &[u8], flags: u8) -> Self {
        Stream {
            name: Bytes::copy_from_slice(name),
            flags,
            next_interest: 0,
            read_seg: 0,
            read_off: 0,
            position: 0,
            segments: HashMap::new(),
            pending: VecDeque::new(),
            final_seg: None,
            timed_out: false,
            ended: false,
        }
    }

    fn has_ready(&self) -> bool {
        self.ended || self.timed_out || self.segments.contains_key(&self.read_seg)
    }
}

/// Multiplexed fetch streams over one daemon connection.
pub struct FetchChannel {
    sock: Socket,
    next_id: StreamId,
    streams: HashMap<StreamId, Stream>,
    inbuf: BytesMut,
    outbuf: BytesMut,
    closed: bool,
}

impl FetchChannel {
    /// Connect to the content daemon. Failure here is fatal for the fetch
    /// path, so the caller decides whether to run without it.
    pub fn connect(addr: SocketAddr) -> Result<FetchChannel> {
        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        sock.connect_timeout(&addr.into(), CONNECT_TIMEOUT)
            .map_err(|source| Error::Connect { addr, source })?;
        sock.set_nonblocking(true)?;
        sock.set_nodelay(true)?;
        debug!(%addr, "content daemon connected");
        Ok(FetchChannel {
            sock,
            next_id: 1,
            streams: HashMap::new(),
            inbuf: BytesMut::with_capacity(SEGMENT_SIZE * 2),
            outbuf: BytesMut::new(),
            closed: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// True once the daemon link has failed; open always refuses then.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Start fetching the named content. The first window of interests is
    /// queued immediately and flushed on the next poll.
    pub fn open(&mut self, name: &[u8], mode: ResolveMode) -> Option<StreamId> {
        if self.closed {
            return None;
        }
        if let Err(e) = wire::check_name(name) {
            debug!(error = %e, "fetch open refused");
            return None;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.streams.insert(id, Stream::new(name, mode.flags()));
        self.fill_window(id);
        Some(id)
    }

    /// Drop a stream. Data frames still in flight for it are discarded
    /// when they arrive.
    pub fn close(&mut self, id: StreamId) {
        self.streams.remove(&id);
    }

    /// Absolute byte offset consumed so far.
    pub fn position(&self, id: StreamId) -> u64 {
        self.streams.get(&id).map(|st| st.position).unwrap_or(0)
    }

    /// Service the link: flush queued interests, drain arrived data,
    /// refill interest windows, expire stale streams. Returns how many
    /// streams have data, an end, or a timeout to report.
    pub fn poll(&mut self) -> usize {
        self.flush();
        self.drain_socket();
        self.decode_frames();

        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            self.fill_window(id);
        }
        let now = Instant::now();
        for st in self.streams.values_mut() {
            if st.timed_out || st.ended {
                continue;
            }
            if let Some((seg, deadline)) = st.pending.front() {
                if now >= *deadline {
                    debug!(segment = *seg, "interest timed out");
                    st.timed_out = true;
                }
            }
        }
        self.flush();

        self.streams.values().filter(|st| st.has_ready()).count()
    }

    /// Copy buffered stream bytes into `buf`.
    pub fn read(&mut self, id: StreamId, buf: &mut [u8]) -> FetchRead {
        let Some(st) = self.streams.get_mut(&id) else {
            return FetchRead::End;
        };
        let mut copied = 0;
        while copied < buf.len() {
            let Some(seg) = st.segments.get(&st.read_seg) else {
                break;
            };
            let take = (seg.len() - st.read_off).min(buf.len() - copied);
            buf[copied..copied + take].copy_from_slice(&seg[st.read_off..st.read_off + take]);
            st.read_off += take;
            st.position += take as u64;
            copied += take;
            if st.read_off >= seg.len() {
                let was_final = st.final_seg == Some(st.read_seg);
                st.segments.remove(&st.read_seg);
                if was_final {
                    st.ended = true;
                    break;
                }
                st.read_seg += 1;
                st.read_off = 0;
            } else {
                break;
            }
        }
        if copied > 0 {
            FetchRead::Data(copied)
        } else if st.ended {
            FetchRead::End
        } else if st.timed_out {
            FetchRead::Timeout
        } else {
            FetchRead::None
        }
    }

    fn fill_window(&mut self, id: StreamId) {
        let Some(st) = self.streams.get_mut(&id) else {
            return;
        };
        if st.timed_out || st.ended {
            return;
        }
        let deadline = Instant::now() + INTEREST_TIMEOUT;
        while st.pending.len() < PIPELINE {
            if let Some(fin) = st.final_seg {
                if st.next_interest > fin {
                    break;
                }
            }
            let seg = st.next_interest;
            st.next_interest += 1;
            wire::encode_interest(&mut self.outbuf, id, seg, st.flags, &st.name);
            st.pending.push_back((seg, deadline));
        }
    }

    fn flush(&mut self) {
        while !self.outbuf.is_empty() {
            match (&self.sock).write(&self.outbuf) {
                Ok(0) => {
                    self.mark_closed("write returned zero");
                    return;
                }
                Ok(n) => self.outbuf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.mark_closed(&e.to_string());
                    return;
                }
            }
        }
    }

    fn drain_socket(&mut self) {
        let mut tmp = [0u8; SEGMENT_SIZE];
        loop {
            match (&self.sock).read(&mut tmp) {
                Ok(0) => {
                    self.mark_closed("daemon hung up");
                    return;
                }
                Ok(n) => self.inbuf.extend_from_slice(&tmp[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.mark_closed(&e.to_string());
                    return;
                }
            }
        }
    }

    fn decode_frames(&mut self) {
        loop {
            match wire::decode_frame(&mut self.inbuf) {
                Ok(Some(Frame::Data {
                    stream,
                    segment,
                    flags,
                    payload,
                })) => self.accept_data(stream, segment, flags, payload),
                Ok(Some(Frame::Interest { .. })) => {
                    // only the daemon should see interests; drop it
                }
                Ok(None) => return,
                Err(e) => {
                    self.inbuf.clear();
                    self.mark_closed(&e.to_string());
                    return;
                }
            }
        }
    }

    fn accept_data(&mut self, stream: StreamId, segment: u64, flags: u8, payload: Bytes) {
        let Some(st) = self.streams.get_mut(&stream) else {
            // stream was closed while this frame was in flight
            return;
        };
        if let Some(pos) = st.pending.iter().position(|(seg, _)| *seg == segment) {
            st.pending.remove(pos);
        }
        if segment < st.read_seg {
            return;
        }
        if flags & wire::FLAG_FINAL != 0 {
            st.final_seg = Some(segment);
            st.pending.retain(|(seg, _)| *seg <= segment);
            if st.next_interest > segment + 1 {
                st.next_interest = segment + 1;
            }
            st.segments.retain(|seg, _| *seg <= segment);
        }
        st.segments.insert(segment, payload);
    }

    fn mark_closed(&mut self, why: &str) {
        if !self.closed {
            warn!(why, "content daemon link closed");
            self.closed = true;
        }
    }
}
