//! Refcounted socket table.
//!
//! Relay endpoints name their sockets by raw fd and bump a reference count
//! while they hold one. The socket closes when the count returns to zero.
//! A small resolver cache keeps repeated connects to the same origin from
//! hitting DNS every time.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use super::{Error, Result, DEFAULT_HTTP_PORT};

/// How long a connect may block before we give up on an origin.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// One tracked socket.
pub struct SockEntry {
    sock: Socket,
    owned: u32,
    /// Origin host this socket talks to; empty until linked to a request.
    pub host: String,
    pub port: u16,
    /// Reuse window in seconds advertised by the origin, -1 when reuse
    /// is off for this socket.
    pub keep_alive: i64,
    /// Transport failures seen on this socket.
    pub errors: u32,
    /// Last time traffic moved here.
    pub stamp: Instant,
    peer: Option<SocketAddr>,
}

impl SockEntry {
    fn new(sock: Socket, host: &str, port: u16) -> Self {
        let peer = sock.peer_addr().ok().and_then(|a| a.as_socket());
        SockEntry {
            sock,
            owned: 1,
            host: host.to_string(),
            port,
            keep_alive: -1,
            errors: 0,
            stamp: Instant::now(),
            peer,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Record the origin host once it is known. Later requests on the same
    /// socket keep the first name.
    pub fn link_host(&mut self, host: &str) {
        if self.host.is_empty() && !host.is_empty() {
            self.host = host.to_string();
        }
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (&self.sock).read(buf)?;
        self.stamp = Instant::now();
        Ok(n)
    }

    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = (&self.sock).write(buf)?;
        self.stamp = Instant::now();
        Ok(n)
    }
}

struct CachedAddr {
    addr: SocketAddr,
    resolved: Instant,
    used: Instant,
}

/// All sockets the relay currently holds, keyed by fd.
pub struct SocketTable {
    entries: HashMap<RawFd, SockEntry>,
    addr_cache: HashMap<String, CachedAddr>,
    changes: u64,
}

impl SocketTable {
    pub fn new() -> Self {
        SocketTable {
            entries: HashMap::new(),
            addr_cache: HashMap::new(),
            changes: 0,
        }
    }

    /// Monotonic count of adopt and close events.
    pub fn changes(&self) -> u64 {
        self.changes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, fd: RawFd) -> Option<&SockEntry> {
        self.entries.get(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut SockEntry> {
        self.entries.get_mut(&fd)
    }

    /// Take ownership of a socket, starting its count at one.
    pub fn adopt(&mut self, sock: Socket, host: &str, port: u16) -> RawFd {
        let fd = sock.as_raw_fd();
        self.entries.insert(fd, SockEntry::new(sock, host, port));
        self.changes += 1;
        fd
    }

    /// Bump the count on a held socket. Returns false if the fd is not
    /// in the table.
    pub fn acquire(&mut self, fd: RawFd) -> bool {
        match self.entries.get_mut(&fd) {
            Some(se) => {
                se.owned += 1;
                true
            }
            None => false,
        }
    }

    /// Drop one reference. The socket closes when the last holder lets go.
    pub fn release(&mut self, fd: RawFd) {
        if let Some(se) = self.entries.get_mut(&fd) {
            se.owned = se.owned.saturating_sub(1);
            if se.owned == 0 {
                self.entries.remove(&fd);
                self.changes += 1;
                debug!(fd, "socket closed");
            }
        }
    }

    /// Connect to an origin and adopt the socket. Port zero selects the
    /// protocol default.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<RawFd> {
        let port = if port == 0 { DEFAULT_HTTP_PORT } else { port };
        let addr = self.resolve(host, port)?;
        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        sock.connect_timeout(&addr.into(), CONNECT_TIMEOUT)?;
        sock.set_nonblocking(true)?;
        sock.set_nodelay(true)?;
        let fd = sock.as_raw_fd();
        debug!(host, port, fd, "connected");
        Ok(self.adopt(sock, host, port))
    }

    /// Accept one connection from a nonblocking listener, or None when
    /// nothing is pending. Peers from non-IP families are dropped.
    pub fn accept(&mut self, listener: &Socket) -> Result<Option<RawFd>> {
        loop {
            match listener.accept() {
                Ok((sock, peer)) => {
                    if peer.as_socket().is_none() {
                        debug!("dropping non-IP peer");
                        continue;
                    }
                    sock.set_nonblocking(true)?;
                    sock.set_nodelay(true)?;
                    return Ok(Some(self.adopt(sock, "", 0)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn resolve(&mut self, host: &str, port: u16) -> Result<SocketAddr> {
        let key = format!("{host}:{port}");
        if let Some(hit) = self.addr_cache.get_mut(&key) {
            hit.used = Instant::now();
            return Ok(hit.addr);
        }
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Resolve(host.to_string()))?;
        let now = Instant::now();
        self.addr_cache.insert(
            key,
            CachedAddr {
                addr,
                resolved: now,
                used: now,
            },
        );
        Ok(addr)
    }

    /// Idle-tick backstop: drop any entry nobody holds, and retire the
    /// reuse window on sockets idle past it. Retired sockets stay open for
    /// their holders; they just stop being handed to new requests.
    pub fn sweep_idle(&mut self, now: Instant) {
        let before = self.entries.len();
        self.entries.retain(|_, se| se.owned > 0);
        self.changes += (before - self.entries.len()) as u64;
        for se in self.entries.values_mut() {
            if se.keep_alive > 0
                && now.saturating_duration_since(se.stamp).as_secs() as i64 >= se.keep_alive
            {
                se.keep_alive = -1;
            }
        }
    }

    /// Age out resolver entries: resolved too long ago (the address may
    /// have moved) or unused too long (nobody cares any more).
    pub fn prune_addr_cache(&mut self, now: Instant, max_age_secs: u64, max_idle_secs: u64) {
        self.addr_cache.retain(|_, c| {
            now.saturating_duration_since(c.resolved).as_secs() < max_age_secs
                && now.saturating_duration_since(c.used).as_secs() < max_idle_secs
        });
    }
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    #[test]
    fn test_refcount_closes_at_zero() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(50));
        });

        let stream = TcpStream::connect(addr).unwrap();
        let sock = Socket::from(stream);
        let mut table = SocketTable::new();
        let fd = table.adopt(sock, "localhost", addr.port());

        assert_eq!(table.changes(), 1);
        assert!(table.acquire(fd));
        table.release(fd);
        assert!(table.get(fd).is_some());
        table.release(fd);
        assert!(table.get(fd).is_none());
        assert_eq!(table.changes(), 2);

        handle.join().unwrap();
    }

    #[test]
    fn test_acquire_unknown_fd() {
        let mut table = SocketTable::new();
        assert!(!table.acquire(999));
        table.release(999); // must not panic
    }

    #[test]
    fn test_connect_and_send() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            use std::io::Read as _;
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello");
        });

        let mut table = SocketTable::new();
        let fd = table.connect("127.0.0.1", addr.port()).unwrap();
        let se = table.get_mut(fd).unwrap();
        let mut sent = 0;
        while sent < 5 {
            match se.send(&b"hello"[sent..]) {
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("send failed: {e}"),
            }
        }
        table.release(fd);

        handle.join().unwrap();
    }

    #[test]
    fn test_accept_none_when_idle() {
        let listener = crate::net::listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut table = SocketTable::new();
        assert!(table.accept(&listener).unwrap().is_none());
    }

    #[test]
    fn test_link_host_keeps_first() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"x").unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut table = SocketTable::new();
        let fd = table.adopt(Socket::from(stream), "", 0);
        let se = table.get_mut(fd).unwrap();
        se.link_host("example.com");
        se.link_host("other.org");
        assert_eq!(se.host, "example.com");

        handle.join().unwrap();
    }

    #[test]
    fn test_sweep_idle_retires_reuse() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(50));
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut table = SocketTable::new();
        let fd = table.adopt(Socket::from(stream), "example.com", 80);
        let se = table.get_mut(fd).unwrap();
        se.keep_alive = 5;
        let later = se.stamp + Duration::from_secs(10);
        table.sweep_idle(later);
        assert_eq!(table.get(fd).unwrap().keep_alive, -1);
        assert!(table.get(fd).is_some());

        handle.join().unwrap();
    }

    fn cache_entry(table: &mut SocketTable, key: &str, resolved: Instant, used: Instant) {
        table.addr_cache.insert(
            key.to_string(),
            CachedAddr {
                addr: "127.0.0.1:80".parse().unwrap(),
                resolved,
                used,
            },
        );
    }

    #[test]
    fn test_prune_addr_cache_age_and_idle() {
        let mut table = SocketTable::new();
        let base = Instant::now();
        let now = base + Duration::from_secs(700);
        // resolved long ago, even if touched recently
        cache_entry(&mut table, "ancient:80", base, now - Duration::from_secs(1));
        // resolved recently but nobody has used it in a while
        cache_entry(
            &mut table,
            "forgotten:80",
            now - Duration::from_secs(100),
            now - Duration::from_secs(400),
        );
        // fresh on both counts
        cache_entry(
            &mut table,
            "busy:80",
            now - Duration::from_secs(100),
            now - Duration::from_secs(10),
        );
        table.prune_addr_cache(now, 600, 300);
        assert_eq!(table.addr_cache.len(), 1);
        assert!(table.addr_cache.contains_key("busy:80"));
    }

    #[test]
    fn test_resolve_hit_refreshes_use_stamp() {
        let mut table = SocketTable::new();
        let base = Instant::now();
        cache_entry(&mut table, "127.0.0.1:80", base, base);
        thread::sleep(Duration::from_millis(5));
        let addr = table.resolve("127.0.0.1", 80).unwrap();
        assert_eq!(addr, "127.0.0.1:80".parse().unwrap());
        assert!(table.addr_cache["127.0.0.1:80"].used > base);
    }
}
