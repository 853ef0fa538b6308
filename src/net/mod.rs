//! Socket plumbing for the relay.
//!
//! Everything here is nonblocking: sockets are registered in a refcounted
//! table, readiness comes from a single poll set, and the relay loop above
//! decides who reads or writes. No socket is shared across threads.

pub mod poll;
pub mod registry;

pub use poll::PollSet;
pub use registry::{SockEntry, SocketTable};

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

/// Listen backlog for the client-facing socket.
pub const LISTEN_BACKLOG: i32 = 10;

/// Default port when a request names none.
pub const DEFAULT_HTTP_PORT: u16 = 80;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no address for {0}")]
    Resolve(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Open a nonblocking listener on the given address.
pub fn listen(addr: SocketAddr) -> Result<Socket> {
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    sock.bind(&addr.into())?;
    sock.listen(LISTEN_BACKLOG)?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_ephemeral() {
        let sock = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = sock.local_addr().unwrap().as_socket().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_listen_port_conflict() {
        let first = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap().as_socket().unwrap();
        // second bind on the same port must fail while the first is open
        assert!(listen(addr).is_err());
    }
}
