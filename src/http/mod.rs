//! HTTP/1.x message scanning for the relay path.
//!
//! This module provides the incremental header parser, the chunked
//! transfer-encoding scanner, and the byte-scanning primitives they share.
//! Messages are never materialized: everything operates in place on each
//! request's receive buffer, and failures surface as parsed facts
//! (`bad_header`, forced close) rather than errors.

pub mod chunk;
pub mod header;
pub mod scan;

pub use chunk::{ChunkScanner, ChunkState};
pub use header::{check, extract, HeaderCheck, HeaderPolicy};

/// Receive buffer capacity per request; one buffer is the whole in-flight
/// window for a relay direction.
pub const BUFFER_SIZE: usize = 4400 * 4;

/// Slack that must remain free while a header is still accumulating.
pub const HEADER_SLACK: usize = 1000;

/// Longest accepted host name or content name.
pub const NAME_MAX: usize = 256;

/// Longest token taken from a request line.
pub const PART_MAX: usize = 40;

/// Request verbs recognized on the wire. `None` marks a reply (status
/// lines have no verb).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    None,
    Head,
    Get,
    Post,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
}

impl Verb {
    pub fn from_token(tok: &[u8]) -> Verb {
        match tok {
            b"HEAD" => Verb::Head,
            b"GET" => Verb::Get,
            b"POST" => Verb::Post,
            b"PUT" => Verb::Put,
            b"DELETE" => Verb::Delete,
            b"TRACE" => Verb::Trace,
            b"OPTIONS" => Verb::Options,
            b"CONNECT" => Verb::Connect,
            _ => Verb::None,
        }
    }
}

/// Recognized header fields and derived flags for one message.
#[derive(Debug, Default, Clone)]
pub struct HttpInfo {
    pub version: i32,
    pub subversion: i32,
    pub header_len: usize,
    /// Numeric status code; 0 on requests.
    pub code: i64,
    pub bad_header: bool,
    pub force_close: bool,
    pub cookie: bool,
    pub has_range: bool,
    pub has_referer: bool,
    /// Advertised keep-alive seconds; 0 until seen.
    pub keep_alive: i64,
    pub proxy_conn: bool,
    pub proxy_keep_alive: i64,
    pub transfer_encoding: bool,
    pub transfer_chunked: bool,
}

/// Parsed facts and decode state for the message currently occupying a
/// request buffer. Reset by each header extraction.
#[derive(Debug, Default)]
pub struct MessageState {
    pub info: HttpInfo,
    pub chunk: ChunkScanner,
    /// Total message length in bytes, -1 while unknown.
    pub msg_len: i64,
    /// Effective target host; empty until parsed.
    pub host: String,
    /// Target port; 0 selects the protocol default at connect time.
    pub port: u16,
    /// First header line, kept for diagnostics.
    pub request_line: String,
    /// GET resource path; the content key on the fetch channel.
    pub short_name: String,
}

impl MessageState {
    pub fn new() -> Self {
        MessageState {
            msg_len: -1,
            ..Default::default()
        }
    }

    pub fn set_host(&mut self, host: &str, port: u16) {
        self.host = host.to_string();
        self.port = port;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_from_token() {
        assert_eq!(Verb::from_token(b"GET"), Verb::Get);
        assert_eq!(Verb::from_token(b"DELETE"), Verb::Delete);
        assert_eq!(Verb::from_token(b"get"), Verb::None);
        assert_eq!(Verb::from_token(b"FETCH"), Verb::None);
    }

    #[test]
    fn test_message_state_defaults() {
        let msg = MessageState::new();
        assert_eq!(msg.msg_len, -1);
        assert!(msg.host.is_empty());
        assert_eq!(msg.chunk.state(), ChunkState::Inactive);
    }
}
