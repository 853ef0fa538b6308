//! The relay itself.
//!
//! One `Proxy` owns every live `Request`, the socket table, the poll set
//! and the fetch channel, and drives them from a single-threaded dispatch
//! loop. Request-level failures never travel as errors: they latch the
//! request's `Error` state and the loop reaps it on the next pass.

pub mod request;
pub mod routing;
pub mod server;

pub use request::{ReqState, Request};
pub use routing::{HostRule, RoutingTable, RuleFlags};
pub use server::Proxy;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use thiserror::Error;

use crate::fetch::ResolveMode;

/// Most requests allowed live at once; the listener leaves the poll set
/// while at or above this.
pub const MAX_BUSY: usize = 16;

/// Largest single read taken from a fetch stream.
pub const FETCH_READ: usize = 4096;

/// Backoff cap for an idle loop, in milliseconds.
pub const MAX_WAIT_MILLIS: u64 = 64;

/// Poll timeout per tick, in milliseconds.
pub const TICK_MILLIS: i32 = 20;

#[derive(Error, Debug)]
pub enum Error {
    #[error("can't bind port {port}: {source}")]
    Bind { port: u16, source: std::io::Error },

    #[error(transparent)]
    Net(#[from] crate::net::Error),

    #[error(transparent)]
    Fetch(#[from] crate::fetch::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Everything the loop needs to know, fixed at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Root namespace for content names on the fetch channel.
    pub content_root: String,
    pub content_daemon: SocketAddr,
    pub route_file: PathBuf,
    pub default_keep_alive: i64,
    /// Seconds a request may sit in NeedRead before the sweep closes it.
    pub timeout_secs: u64,
    /// Concurrent origin connections per host, per request.
    pub max_conn: u32,
    pub remove_proxy: bool,
    pub remove_host: bool,
    pub host_from_get: bool,
    pub resolve: ResolveMode,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8080,
            content_root: "TestCCN".to_string(),
            content_daemon: SocketAddr::from((Ipv4Addr::LOCALHOST, 9695)),
            route_file: PathBuf::from("ccgate.list"),
            default_keep_alive: 13,
            timeout_secs: 30,
            max_conn: 2,
            remove_proxy: false,
            remove_host: true,
            host_from_get: false,
            resolve: ResolveMode::Highest,
        }
    }
}

/// Process-wide relay counters, logged when a tick changed something.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub requests: u64,
    pub replies: u64,
    pub replies_fetch: u64,
    pub reply_reads: u64,
    pub reply_bytes: u64,
    pub reply_reads_fetch: u64,
    pub reply_bytes_fetch: u64,
}
