//! The dispatch loop and the per-request state machine.
//!
//! A single thread polls every live descriptor plus the fetch channel,
//! then steps each request through its lifecycle. Fetch-backed requests
//! are stepped first every tick so content responses never queue behind
//! new connections; plain-socket requests follow in creation order.

use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::thread;
use std::time::{Duration, Instant};

use socket2::Socket;
use tracing::{debug, info, warn};

use crate::fetch::{FetchChannel, FetchRead};
use crate::http::header::{self, HeaderCheck, HeaderPolicy};
use crate::http::{scan, Verb, BUFFER_SIZE, HEADER_SLACK, NAME_MAX, PART_MAX};
use crate::net::{self, PollSet, SocketTable};

use super::request::{ReqState, Request};
use super::routing::{RoutingTable, RuleFlags};
use super::{Config, Error, Result, Stats, FETCH_READ, MAX_BUSY, MAX_WAIT_MILLIS, TICK_MILLIS};

/// Routing verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Serve from the content channel.
    Fetch,
    /// `-fail` rule: close without answering.
    Reject,
    /// Relay to the origin over HTTP.
    Http,
}

/// Decide how to serve a request. `-proxy` rules are unwound first: when
/// the resource name itself starts with a host, that inner host is what
/// the rules are really about. Disqualification is never an error; the
/// request just stays on the HTTP path.
fn apply_routing(routes: &RoutingTable, rb: &mut Request) -> Route {
    if rb.verb != Verb::Get {
        return Route::Http;
    }
    let mut effective_host = rb.host().to_string();
    let mut effective_name = rb.msg.short_name.clone();
    let mut rule;
    loop {
        rule = routes.select(&effective_host);
        let Some(r) = rule else { break };
        if !r.flags.is_set(RuleFlags::PROXY) {
            break;
        }
        let name = effective_name.strip_prefix('/').unwrap_or(&effective_name);
        let hlen = scan::accept_host_name(name.as_bytes(), 0, NAME_MAX);
        if hlen == 0 {
            break;
        }
        effective_host = name[..hlen].to_string();
        effective_name = name[hlen..].to_string();
    }
    let Some(r) = rule else {
        return Route::Http;
    };

    let dots = effective_name.bytes().filter(|&c| c == b'.').count();
    let query = effective_name.bytes().filter(|&c| c == b'?').count();
    let flags = r.flags;
    let mut fetch_ok = true;
    let mut reject = false;
    if flags.is_set(RuleFlags::NEED_DOT) && dots == 0 {
        fetch_ok = false;
    }
    if flags.is_set(RuleFlags::NO_COOKIE) && rb.msg.info.cookie {
        fetch_ok = false;
    }
    if flags.is_set(RuleFlags::NO_REFERER) && rb.msg.info.has_referer {
        fetch_ok = false;
    }
    if flags.is_set(RuleFlags::NO_QUERY) && query > 0 {
        fetch_ok = false;
    }
    if flags.is_set(RuleFlags::SINGLE_CONN) {
        fetch_ok = false;
        rb.max_conn = 1;
    }
    if flags.is_set(RuleFlags::FAIL_QUICK) {
        fetch_ok = false;
        reject = true;
    }
    if rb.msg.info.has_range {
        // the content channel cannot serve partial ranges
        fetch_ok = false;
    }
    if rb.msg.request_line.len() + 2 >= NAME_MAX {
        fetch_ok = false;
    }
    if reject {
        Route::Reject
    } else if fetch_ok {
        Route::Fetch
    } else {
        debug!(host = %rb.host(), name = %rb.msg.short_name, "fetch disqualified, using HTTP");
        Route::Http
    }
}

/// Pick the verb off a request line and, for the absolute
/// `scheme://host[:port]` form, the host named there. Origin-form
/// requests leave the host to the `Host:` line.
fn parse_request_line(buf: &[u8]) -> std::result::Result<(Verb, Option<(String, u16)>), &'static str> {
    let vend = scan::accept_part(buf, 0, PART_MAX);
    let verb = Verb::from_token(&buf[..vend]);
    let mut pos = scan::skip_over_blank(buf, vend);
    let mut try_host = verb == Verb::Connect;
    match verb {
        Verb::Connect => {}
        Verb::Head | Verb::Get | Verb::Post | Verb::Put | Verb::Trace | Verb::Options => {
            let npos = pos + scan::accept_host_name(buf, pos, PART_MAX);
            if npos > pos {
                if buf.get(npos) != Some(&b':') || buf.get(npos + 1) != Some(&b'/') {
                    return Err("bad protocol syntax");
                }
                pos = npos + 2;
                if buf.get(pos) == Some(&b'/') {
                    pos += 1;
                }
                try_host = true;
            }
        }
        Verb::None | Verb::Delete => return Err("unrecognized HTTP verb"),
    }
    if !try_host {
        return Ok((verb, None));
    }
    let hlen = scan::accept_host_name(buf, pos, NAME_MAX);
    if hlen == 0 {
        return Err("bad host name");
    }
    let (_, port) = scan::accept_host_port(buf, pos + hlen);
    let host = String::from_utf8_lossy(&buf[pos..pos + hlen]).into_owned();
    Ok((verb, Some((host, port))))
}

pub struct Proxy {
    cfg: Config,
    policy: HeaderPolicy,
    listener: Socket,
    listener_fd: RawFd,
    fetch: FetchChannel,
    routes: RoutingTable,
    table: SocketTable,
    poll: PollSet,
    requests: BTreeMap<u64, Request>,
    next_index: u64,
    changes: u64,
    stats: Stats,
    start: Instant,
}

impl Proxy {
    /// Set up everything the loop needs. Any failure here is fatal; the
    /// process should exit nonzero.
    pub fn new(cfg: Config) -> Result<Proxy> {
        let routes = RoutingTable::load(&cfg.route_file);
        let fetch = FetchChannel::connect(cfg.content_daemon)?;

        // a previous instance may not have closed its port cleanly, so
        // wait out the old bind for a while
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.port));
        let mut tries = 0u32;
        let listener = loop {
            match net::listen(addr) {
                Ok(s) => break s,
                Err(net::Error::Io(e))
                    if e.kind() == io::ErrorKind::AddrInUse && tries < 120 =>
                {
                    if tries == 0 {
                        info!(port = cfg.port, "waiting for proxy port");
                    }
                    tries += 1;
                    thread::sleep(Duration::from_secs(1));
                }
                Err(net::Error::Io(e)) => {
                    return Err(Error::Bind {
                        port: cfg.port,
                        source: e,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        };
        let listener_fd = listener.as_raw_fd();
        info!(port = cfg.port, fd = listener_fd, "listening");

        let policy = HeaderPolicy {
            default_keep_alive: cfg.default_keep_alive,
            remove_proxy: cfg.remove_proxy,
            remove_host: cfg.remove_host,
            host_from_get: cfg.host_from_get,
        };
        Ok(Proxy {
            cfg,
            policy,
            listener,
            listener_fd,
            fetch,
            routes,
            table: SocketTable::new(),
            poll: PollSet::new(),
            requests: BTreeMap::new(),
            next_index: 0,
            changes: 0,
            stats: Stats::default(),
            start: Instant::now(),
        })
    }

    /// Address the listener actually bound; useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()?
            .as_socket()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::Other, "listener has no IP address")))
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Run until externally terminated.
    pub fn run(&mut self) -> Result<()> {
        let mut wait_millis = 1u64;
        loop {
            let changes = self.changes;

            self.build_interest();
            let ready = self.poll.poll(TICK_MILLIS)?;

            self.scan_fetch_requests();
            if ready > 0 {
                self.scan_http_requests();
            }
            self.scan_timeouts();
            self.scan_waiting();
            // requests that failed outside the readiness scan (bad
            // connects, timed-out waiters) still get torn down
            self.reap_finished();

            if changes == self.changes {
                // idle tick: back off and do the slow housekeeping
                thread::sleep(Duration::from_millis(wait_millis));
                if wait_millis < MAX_WAIT_MILLIS {
                    wait_millis += 1;
                }
                let now = Instant::now();
                self.table.sweep_idle(now);
                self.table.prune_addr_cache(now, 600, 300);
            } else {
                wait_millis = 1;
                self.show_stats();
            }
        }
    }

    fn build_interest(&mut self) {
        self.poll.clear();
        self.poll.want_read(self.fetch.fd());
        if self.requests.len() < MAX_BUSY {
            self.poll.want_read(self.listener_fd);
        }
        for rb in self.requests.values() {
            if rb.fetch.is_none() {
                if let Some(fd) = rb.src_fd {
                    if matches!(rb.state, ReqState::Start | ReqState::NeedRead) {
                        self.poll.want_read(fd);
                    }
                }
            }
            if let Some(fd) = rb.dst_fd {
                if rb.state == ReqState::NeedWrite {
                    self.poll.want_write(fd);
                }
            }
        }
    }

    /// Fetch-backed requests run every tick, ahead of any socket work.
    fn scan_fetch_requests(&mut self) {
        self.fetch.poll();
        let ids: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, rb)| rb.fetch.is_some())
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            let Some(state) = self.requests.get(&id).map(|rb| rb.state) else {
                continue;
            };
            match state {
                ReqState::NeedRead | ReqState::NeedWrite => self.step(id),
                ReqState::Done | ReqState::Error => self.destroy(id),
                _ => {}
            }
        }
    }

    fn scan_http_requests(&mut self) {
        if self.poll.take_readable(self.listener_fd) {
            self.accept_client();
        }
        let ids: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, rb)| rb.fetch.is_none())
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            if !self.requests.contains_key(&id) {
                // torn down as someone's partner earlier this pass
                continue;
            }
            self.step(id);
        }
        self.reap_finished();
    }

    /// Tear down finished non-fetch requests with their partners: the
    /// feeding half goes either way, the reply half only on abnormal
    /// endings.
    fn reap_finished(&mut self) {
        let ids: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, rb)| {
                rb.fetch.is_none() && matches!(rb.state, ReqState::Done | ReqState::Error)
            })
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            let Some(rb) = self.requests.get(&id) else {
                continue;
            };
            let state = rb.state;
            let fwd = rb.fwd;
            let back = rb.back;
            self.destroy(id);
            if let Some(f) = fwd {
                // the request that fed us is finished either way
                self.destroy(f);
            } else if state == ReqState::Error {
                // abort the reply half only on abnormal endings
                if let Some(b) = back {
                    self.destroy(b);
                }
            }
        }
    }

    /// Close out requests stuck waiting to read, and their partners.
    fn scan_timeouts(&mut self) {
        let now = Instant::now();
        let limit = Duration::from_secs(self.cfg.timeout_secs);
        let stale: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, rb)| {
                rb.state == ReqState::NeedRead
                    && now.saturating_duration_since(rb.recent_time) > limit
            })
            .map(|(&id, _)| id)
            .collect();
        for id in stale {
            let Some(rb) = self.requests.get_mut(&id) else {
                continue;
            };
            rb.msg.info.force_close = true;
            warn!(
                index = id,
                host = %rb.host(),
                idle_secs = now.saturating_duration_since(rb.recent_time).as_secs(),
                "request timed out"
            );
            let fwd = rb.fwd;
            let back = rb.back;
            self.destroy(id);
            if let Some(f) = fwd {
                self.destroy(f);
            }
            if let Some(b) = back {
                self.destroy(b);
            }
        }
    }

    fn scan_waiting(&mut self) {
        let ids: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, rb)| rb.state == ReqState::Wait)
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            self.step(id);
        }
    }

    fn accept_client(&mut self) {
        match self.table.accept(&self.listener) {
            Ok(Some(fd)) => {
                self.next_index += 1;
                let mut rb = Request::new(self.next_index, Instant::now());
                rb.src_fd = Some(fd);
                rb.origin = true;
                rb.set_state(ReqState::Start);
                debug!(index = rb.index, fd, "client accepted");
                self.requests.insert(rb.index, rb);
                self.changes += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }

    fn step(&mut self, id: u64) {
        let Some(mut rb) = self.requests.remove(&id) else {
            return;
        };
        match rb.state {
            ReqState::Start => self.step_start(&mut rb),
            ReqState::Wait => self.step_wait(&mut rb),
            ReqState::NeedRead => self.step_read(&mut rb),
            ReqState::NeedWrite => self.step_write(&mut rb),
            _ => {}
        }
        self.requests.insert(id, rb);
    }

    /// First read on an inbound connection: buffer the request header,
    /// parse it, and decide where the answer comes from.
    fn step_start(&mut self, rb: &mut Request) {
        let Some(src) = rb.src_fd else {
            rb.fail("no client socket");
            self.changes += 1;
            return;
        };
        if !self.poll.take_readable(src) {
            return;
        }
        let now = Instant::now();
        rb.start_time = now;
        rb.recent_time = now;
        rb.max_conn = self.cfg.max_conn;

        let Some(se) = self.table.get_mut(src) else {
            rb.fail("client socket gone");
            self.changes += 1;
            return;
        };
        match rb.recv_from(se) {
            Err(_) => {
                rb.fail("receive failed");
                self.changes += 1;
                return;
            }
            Ok(0) => {
                // client went away before saying anything
                rb.msg.info.keep_alive = -1;
                rb.set_state(ReqState::Done);
                self.changes += 1;
                return;
            }
            Ok(_) => {}
        }
        self.stats.requests += 1;
        self.changes += 1;

        match header::check(rb.buf(), true) {
            HeaderCheck::Invalid => {
                rb.fail("invalid header");
                return;
            }
            HeaderCheck::Incomplete => {
                rb.recv_off = rb.buffer_len;
                if rb.buffer_len + HEADER_SLACK > BUFFER_SIZE {
                    rb.fail("header too long");
                }
                return;
            }
            HeaderCheck::Complete => {}
        }

        let (verb, line_host) = match parse_request_line(rb.buf()) {
            Ok(parsed) => parsed,
            Err(why) => {
                rb.fail(why);
                return;
            }
        };
        rb.verb = verb;
        if let Some((host, port)) = line_host {
            rb.msg.set_host(&host, port);
        }

        rb.extract_header(&self.policy);
        rb.msg_count += 1;

        if rb.verb == Verb::Connect {
            rb.fail("unsupported HTTP verb CONNECT");
            return;
        }
        if rb.host().is_empty() {
            rb.fail("no host in request");
            return;
        }

        match apply_routing(&self.routes, rb) {
            Route::Fetch => {
                let name = format!(
                    "/{}/http/{}{}",
                    self.cfg.content_root,
                    rb.host(),
                    rb.msg.short_name
                );
                if let Some(sid) = self.fetch.open(name.as_bytes(), self.cfg.resolve) {
                    info!(index = rb.index, name, "serving from fetch channel");
                    rb.fetch = Some(sid);
                    // the reply goes back out the client socket
                    self.table.acquire(src);
                    rb.dst_fd = Some(src);
                    rb.reset_for_reply();
                    rb.set_state(ReqState::NeedRead);
                    rb.recent_time = Instant::now();
                    self.stats.replies += 1;
                    self.stats.replies_fetch += 1;
                    return;
                }
                debug!(index = rb.index, name, "fetch open refused, using HTTP");
            }
            Route::Reject => {
                info!(index = rb.index, host = %rb.host(), "fast reject");
                rb.msg.info.force_close = true;
                rb.set_state(ReqState::Done);
                // the empty answer still counts as a reply
                self.stats.replies += 1;
                return;
            }
            Route::Http => {}
        }

        rb.set_state(ReqState::Wait);
        self.stats.replies += 1;
    }

    /// Wait for a free origin slot for this host, then connect and send.
    fn step_wait(&mut self, rb: &mut Request) {
        let active = self
            .requests
            .values()
            .filter(|each| {
                each.dst_fd.is_some()
                    && matches!(each.state, ReqState::NeedRead | ReqState::NeedWrite)
                    && each.host().eq_ignore_ascii_case(rb.host())
            })
            .count();
        if (active as u32) < rb.max_conn {
            self.continue_request(rb, None);
        }
    }

    /// Send the buffered request to the origin, reusing `reuse` when a
    /// keep-alive socket was handed over, and spawn the dormant reply
    /// half. A failed send on a reused socket falls back to a fresh
    /// connection.
    fn continue_request(&mut self, rb: &mut Request, reuse: Option<RawFd>) {
        let mut dst = None;
        if let Some(fd) = reuse {
            if self.table.acquire(fd) {
                debug!(index = rb.index, fd, host = %rb.host(), "reusing origin socket");
                let sent = match self.table.get_mut(fd) {
                    Some(se) => matches!(rb.send_to(se), Ok(n) if n > 0),
                    None => false,
                };
                if sent {
                    dst = Some(fd);
                } else {
                    debug!(index = rb.index, fd, "reuse failed");
                    self.table.release(fd);
                }
            }
        }
        if dst.is_none() {
            let fd = match self.table.connect(rb.host(), rb.msg.port) {
                Ok(fd) => fd,
                Err(e) => {
                    rb.fail(&format!("no socket for {}: {}", rb.host(), e));
                    self.changes += 1;
                    return;
                }
            };
            if let Some(se) = self.table.get_mut(fd) {
                se.link_host(rb.host());
                se.keep_alive = if !rb.msg.info.force_close && rb.msg.info.keep_alive > 0 {
                    rb.msg.info.keep_alive
                } else {
                    -1
                };
                match rb.send_to(se) {
                    Ok(n) if n > 0 => dst = Some(fd),
                    _ => {
                        self.table.release(fd);
                        rb.fail("request not sent");
                        self.changes += 1;
                        return;
                    }
                }
            }
        }
        let Some(dst) = dst else {
            rb.fail("no destination socket");
            self.changes += 1;
            return;
        };
        rb.dst_fd = Some(dst);
        self.spawn_reply(rb, dst);
        rb.set_state(ReqState::NeedWrite);
        rb.recent_time = Instant::now();
        self.changes += 1;
    }

    /// Create the outbound half: it reads the origin socket and writes
    /// back to the client. It stays dormant until the request's first
    /// write completes.
    fn spawn_reply(&mut self, parent: &mut Request, origin_fd: RawFd) {
        self.next_index += 1;
        let mut rb = Request::new(self.next_index, Instant::now());
        self.table.acquire(origin_fd);
        rb.src_fd = Some(origin_fd);
        if let Some(client_fd) = parent.src_fd {
            self.table.acquire(client_fd);
            rb.dst_fd = Some(client_fd);
        }
        rb.msg.set_host(parent.host(), parent.msg.port);
        rb.msg.request_line = parent.msg.request_line.clone();
        rb.msg.short_name = parent.msg.short_name.clone();
        rb.max_conn = parent.max_conn;
        if parent.msg.info.keep_alive > rb.msg.info.keep_alive {
            rb.msg.info.keep_alive = parent.msg.info.keep_alive;
        }
        parent.back = Some(rb.index);
        rb.fwd = Some(parent.index);
        debug!(index = rb.index, parent = parent.index, fd = origin_fd, "reply spawned");
        self.requests.insert(rb.index, rb);
    }

    /// Pull the next slice of the message and hand it to the partner
    /// socket. The single buffer is the back-pressure: no further read
    /// happens until the matching write drains.
    fn step_read(&mut self, rb: &mut Request) {
        let now = Instant::now();
        if let Some(sid) = rb.fetch {
            let off = rb.recv_off;
            rb.recv_off = 0;
            let end = (off + FETCH_READ).min(BUFFER_SIZE);
            match self.fetch.read(sid, &mut rb.buf_mut()[off..end]) {
                FetchRead::None => {
                    rb.recv_off = off;
                    return;
                }
                FetchRead::Timeout => {
                    rb.fail("fetch stream timed out");
                    self.changes += 1;
                    return;
                }
                FetchRead::End => {
                    self.note_done(rb);
                    return;
                }
                FetchRead::Data(n) => {
                    rb.buffer_len = off + n;
                    self.stats.reply_reads_fetch += 1;
                    self.stats.reply_bytes_fetch += n as u64;
                }
            }
        } else {
            let Some(src) = rb.src_fd else {
                rb.fail("no source socket");
                self.changes += 1;
                return;
            };
            if !self.poll.take_readable(src) {
                return;
            }
            let Some(se) = self.table.get_mut(src) else {
                rb.fail("source socket gone");
                self.changes += 1;
                return;
            };
            match rb.recv_from(se) {
                Err(_) => {
                    rb.fail("receive failed");
                    self.changes += 1;
                    return;
                }
                Ok(0) => {
                    // orderly close marks the end of the message
                    self.note_done(rb);
                    return;
                }
                Ok(_) => {}
            }
        }
        let nb = rb.buffer_len;
        if !rb.origin {
            self.stats.reply_reads += 1;
            self.stats.reply_bytes += nb as u64;
        }
        debug!(index = rb.index, bytes = nb, host = %rb.host(), "read");

        if rb.msg_count == 0 {
            // reply headers: stored content is a full HTTP response too
            match header::check(rb.buf(), false) {
                HeaderCheck::Invalid => {
                    rb.fail("invalid reply header");
                    self.changes += 1;
                    return;
                }
                HeaderCheck::Incomplete => {
                    rb.recv_off = rb.buffer_len;
                    if rb.buffer_len + HEADER_SLACK > BUFFER_SIZE {
                        rb.fail("header too long");
                        self.changes += 1;
                    } else {
                        debug!(index = rb.index, "need additional header bytes");
                    }
                    return;
                }
                HeaderCheck::Complete => {}
            }
            rb.extract_header(&self.policy);
        } else if rb.msg.chunk.state().is_active() {
            rb.advance_chunks();
            match rb.msg.chunk.state() {
                crate::http::ChunkState::Done => {
                    rb.msg.msg_len = rb.accum + nb as i64;
                    debug!(index = rb.index, msg_len = rb.msg.msg_len, "chunking done");
                }
                crate::http::ChunkState::Error => {
                    // assume the message ends here and close after
                    rb.msg.msg_len = rb.accum + nb as i64;
                    rb.msg.info.force_close = true;
                    debug!(index = rb.index, "chunking error, assume last packet");
                }
                _ => {}
            }
        }

        // a finished keep-alive response can hand its origin socket to a
        // request already waiting on the same host
        if rb.message_complete()
            && !rb.origin
            && rb.src_fd.is_some()
            && !rb.msg.info.force_close
            && rb.msg.info.keep_alive > 0
        {
            if let Some(wid) = self.find_waiter(rb, now) {
                if let Some(mut waiter) = self.requests.remove(&wid) {
                    waiter.sock_time = rb.sock_time;
                    self.continue_request(&mut waiter, rb.src_fd);
                    self.requests.insert(wid, waiter);
                }
            }
        }

        rb.msg_count += 1;
        rb.recent_time = now;

        let Some(dst) = rb.dst_fd else {
            rb.fail("no destination socket");
            self.changes += 1;
            return;
        };
        let Some(se) = self.table.get_mut(dst) else {
            rb.fail("destination socket gone");
            self.changes += 1;
            return;
        };
        if rb.send_to(se).is_err() {
            rb.fail("send failed");
        }
        rb.set_state(ReqState::NeedWrite);
        self.changes += 1;
    }

    /// Finish draining the buffer, then flip back to reading. Completing
    /// the first write also releases the dormant reply half.
    fn step_write(&mut self, rb: &mut Request) {
        let Some(dst) = rb.dst_fd else {
            rb.fail("no destination socket");
            self.changes += 1;
            return;
        };
        if !self.poll.take_writable(dst) {
            return;
        }
        if rb.send_off > 0 {
            // earlier write was short; push the rest
            let Some(se) = self.table.get_mut(dst) else {
                rb.fail("destination socket gone");
                self.changes += 1;
                return;
            };
            if rb.send_to(se).is_err() {
                rb.fail("send failed");
            }
            self.changes += 1;
            return;
        }
        let now = Instant::now();
        let nb = rb.buffer_len;
        rb.accum += nb as i64;
        rb.buffer_len = 0;
        rb.set_state(ReqState::NeedRead);
        rb.recent_time = now;
        if rb.fetch.is_none() {
            if let Some(bid) = rb.back {
                if let Some(reply) = self.requests.get_mut(&bid) {
                    if reply.state == ReqState::Dormant {
                        // the request is on the wire; let answers flow
                        reply.set_state(ReqState::NeedRead);
                        reply.recent_time = now;
                    }
                }
            }
        }
        debug!(index = rb.index, bytes = nb, accum = rb.accum, "wrote");
        if rb.msg.msg_len >= 0 && rb.accum >= rb.msg.msg_len {
            self.note_done(rb);
        }
        self.changes += 1;
    }

    /// Oldest request still waiting on the same host, young enough for
    /// the reply's advertised keep-alive window.
    fn find_waiter(&self, rb: &Request, now: Instant) -> Option<u64> {
        let window = rb.msg.info.keep_alive as u64;
        self.requests
            .values()
            .find(|each| {
                each.fetch.is_none()
                    && each.state == ReqState::Wait
                    && each.host().eq_ignore_ascii_case(rb.host())
                    && now.saturating_duration_since(rb.sock_time).as_secs() < window
            })
            .map(|each| each.index)
    }

    fn note_done(&mut self, rb: &mut Request) {
        rb.set_state(ReqState::Done);
        let dt = rb.start_time.elapsed().as_secs_f64();
        debug!(
            index = rb.index,
            host = %rb.host(),
            bytes = rb.accum,
            secs = format!("{dt:.3}"),
            "done"
        );
        self.changes += 1;
    }

    /// Tear one request down: unlink its partner, give back its socket
    /// references exactly once, and drop any fetch stream.
    fn destroy(&mut self, id: u64) {
        let Some(rb) = self.requests.remove(&id) else {
            return;
        };
        if let Some(f) = rb.fwd {
            if let Some(p) = self.requests.get_mut(&f) {
                p.back = None;
            }
        }
        if let Some(b) = rb.back {
            if let Some(p) = self.requests.get_mut(&b) {
                p.fwd = None;
            }
        }
        if let Some(fd) = rb.src_fd {
            self.table.release(fd);
        }
        if let Some(fd) = rb.dst_fd {
            self.table.release(fd);
        }
        if let Some(sid) = rb.fetch {
            self.fetch.close(sid);
        }
        debug!(index = rb.index, state = ?rb.state, "request destroyed");
        self.changes += 1;
    }

    fn show_stats(&self) {
        let s = &self.stats;
        debug!(
            uptime_secs = self.start.elapsed().as_secs(),
            socks = self.table.len(),
            requests = s.requests,
            replies = s.replies,
            reads = s.reply_reads,
            bytes = s.reply_bytes,
            replies_fetch = s.replies_fetch,
            reads_fetch = s.reply_reads_fetch,
            bytes_fetch = s.reply_bytes_fetch,
            "stats"
        );
    }
}
