//! HTTP/1.x header scanning and in-place rewriting.
//!
//! Two passes over the same receive buffer: `check` decides whether a full
//! header section has arrived, `extract` walks it line by line, records the
//! recognized fields and may remove or replace lines by shifting the tail
//! of the buffer down. Both passes work on raw bytes; nothing here
//! allocates per line.

use tracing::debug;

use super::chunk::ChunkState;
use super::scan;
use super::{MessageState, Verb, NAME_MAX};

/// Outcome of the completeness pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCheck {
    /// First line cannot be an HTTP/1.x message.
    Invalid,
    /// No terminating blank line yet; read more and retry.
    Incomplete,
    /// A full header section is buffered.
    Complete,
}

/// Scan `buf` for a CRLF-terminated blank line. The first line must carry
/// an HTTP/1.x version token: trailing for request lines (`from_client`),
/// leading for status lines.
pub fn check(buf: &[u8], from_client: bool) -> HeaderCheck {
    let len = buf.len();
    let mut pos = 0;
    let mut line = 0;
    let mut line_len = 0usize;
    let mut ver_pos = 0usize;
    let mut lag = 0u8;
    while pos < len {
        let c = buf[pos];
        pos += 1;
        if c == b'\n' && lag == b'\r' {
            if line == 0 && line_len > 8 {
                let tok = if from_client { &buf[ver_pos..] } else { buf };
                if !(tok.starts_with(b"HTTP/1.1") || tok.starts_with(b"HTTP/1.0")) {
                    return HeaderCheck::Invalid;
                }
            } else if line > 0 && line_len == 0 {
                return HeaderCheck::Complete;
            }
            line += 1;
            line_len = 0;
        } else if c == b'\r' {
            // the LF decides the line break
        } else if c == b' ' {
            line_len += 1;
            ver_pos = pos;
        } else {
            line_len += 1;
        }
        lag = c;
    }
    HeaderCheck::Incomplete
}

fn extract_version(msg: &mut MessageState, s: &[u8]) {
    msg.info.version = 0;
    msg.info.subversion = 0;
    if s.starts_with(b"HTTP/1.1") {
        msg.info.version = 1;
        msg.info.subversion = 1;
    } else if s.starts_with(b"HTTP/1.0") {
        msg.info.version = 1;
        msg.info.subversion = 0;
    }
}

/// Rewriting policy, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct HeaderPolicy {
    pub default_keep_alive: i64,
    /// Strip `Proxy-Connection` lines from forwarded requests.
    pub remove_proxy: bool,
    /// Strip a matching `http://host[:port]` prefix from the request line.
    pub remove_host: bool,
    /// The request-line host wins over the `Host:` line.
    pub host_from_get: bool,
}

/// Walk a complete header section in `buf[..len]`, fill in `msg`, and
/// apply line removals and the request-line host strip in place.
/// Returns the new buffer length.
///
/// Failures do not travel as errors: a malformed header latches
/// `msg.info.bad_header` and pins the message length to the header, so the
/// caller relays what it has and closes.
pub fn extract(buf: &mut [u8], mut len: usize, verb: Verb, msg: &mut MessageState, policy: &HeaderPolicy) -> usize {
    let mut pos = 0usize;
    let mut lines = 0u32;
    let mut content_len: i64 = -1;
    let mut lag = 0u8;

    msg.chunk.reset();
    msg.msg_len = -1;

    loop {
        let line_start = pos;
        let mut line_len = 0usize;
        let mut colon_pos: Option<usize> = None;
        if pos == len {
            // ran out of bytes without a blank line
            msg.info.bad_header = true;
        }
        while pos < len {
            let c = buf[pos];
            pos += 1;
            if c == b'\r' {
                // tolerated here, the LF ends the line
            } else if c == b'\n' {
                lag = c;
                break;
            } else {
                if c == b':' && colon_pos.is_none() {
                    colon_pos = Some(pos);
                }
                line_len += 1;
            }
            lag = c;
        }
        if line_len == 0 {
            break;
        }
        lines += 1;

        if lines == 1 {
            let line = &buf[line_start..line_start + line_len];
            msg.request_line = String::from_utf8_lossy(line).into_owned();
            if verb != Verb::None {
                // request: the version token trails the line
                let mut last_blank = line_len;
                while last_blank > 0 {
                    last_blank -= 1;
                    if line[last_blank] == b' ' {
                        extract_version(msg, &line[last_blank + 1..]);
                        break;
                    }
                }
            } else {
                // status line: version leads, then the numeric code
                extract_version(msg, line);
                let bpos = scan::skip_to_blank(line, 0);
                let bpos = scan::skip_over_blank(line, bpos);
                msg.info.code = scan::eval_uint(line, bpos);
            }
        } else if let Some(cp) = colon_pos {
            let key_len = 1 + cp - line_start;
            let key_end = (line_start + key_len).min(len);
            let post_start = key_end;
            let post_end = (line_start + line_len).min(len);

            let mut remove = false;
            let mut replace: Vec<u8> = Vec::new();
            let mut keep = policy.default_keep_alive;
            if msg.info.keep_alive > keep {
                keep = msg.info.keep_alive;
            }

            let key = &buf[line_start..key_end];
            let post = &buf[post_start..post_end.max(post_start)];
            if key.starts_with(b"Content-Length: ") {
                content_len = scan::eval_uint(post, 0);
            } else if key.starts_with(b"Connection: ") {
                if post.starts_with(b"close") {
                    msg.info.force_close = true;
                } else if post.starts_with(b"Keep-Alive") || post.starts_with(b"keep-alive") {
                    remove = keep < 0;
                    msg.info.keep_alive = keep;
                }
            } else if key.starts_with(b"Transfer-Encoding: ") {
                msg.info.transfer_encoding = true;
                if post.starts_with(b"chunked") {
                    msg.info.transfer_chunked = true;
                }
            } else if key.starts_with(b"Proxy-Connection: ") {
                remove = policy.remove_proxy;
                msg.info.proxy_conn = true;
                if post.starts_with(b"keep-alive") {
                    msg.info.proxy_keep_alive = keep;
                }
            } else if key.starts_with(b"Cookie: ") {
                msg.info.cookie = true;
            } else if key.starts_with(b"Range: ") {
                msg.info.has_range = true;
            } else if key.starts_with(b"Referer: ") {
                msg.info.has_referer = true;
            } else if key.starts_with(b"Keep-Alive: ") {
                remove = keep < 0;
                msg.info.keep_alive = keep;
                if !post.is_empty() {
                    if post[0].is_ascii_digit() {
                        msg.info.keep_alive = scan::eval_uint(post, 0);
                    } else {
                        // timeout=/max= options; the first recognized one wins
                        let mut p = 0usize;
                        let mut c = post[0];
                        while c.is_ascii_alphabetic() {
                            if post[p..].starts_with(b"timeout=") {
                                p += 8;
                                c = *post.get(p).unwrap_or(&0);
                                msg.info.keep_alive = scan::eval_uint(post, p);
                            } else if post[p..].starts_with(b"max=") {
                                p += 4;
                                c = *post.get(p).unwrap_or(&0);
                                msg.info.keep_alive = scan::eval_uint(post, p);
                            } else {
                                break;
                            }
                        }
                    }
                }
            } else if key.starts_with(b"Host: ") {
                let host_len = scan::accept_host_name(post, 0, NAME_MAX);
                let header_host = String::from_utf8_lossy(&post[..host_len]).into_owned();
                if !policy.host_from_get || msg.host.is_empty() {
                    // the Host: line names the effective target
                    if host_len > 0 {
                        let (plen, port) = scan::accept_host_port(post, host_len);
                        let port = if plen == 0 { msg.port } else { port };
                        msg.host = header_host;
                        msg.port = port;
                    }
                } else if !msg.host.as_bytes().eq_ignore_ascii_case(header_host.as_bytes()) {
                    // request-line host wins; swap the stale line out
                    remove = true;
                    replace.extend_from_slice(b"Host: ");
                    replace.extend_from_slice(msg.host.as_bytes());
                    replace.extend_from_slice(b"\r\n");
                }
            }

            if verb != Verb::None && remove {
                debug!(line = lines, "removing header line");
                let rem = len - pos;
                let add = replace.len();
                buf.copy_within(pos..pos + rem, line_start + add);
                buf[line_start..line_start + add].copy_from_slice(&replace);
                let removed = pos - line_start;
                pos = line_start + add;
                len = len - removed + add;
            }
        }
    }
    if lag != b'\n' {
        msg.info.bad_header = true;
    }

    if verb == Verb::Get {
        msg.short_name = extract_short_name(buf, len, msg).unwrap_or_default();
        if policy.remove_host {
            let delta = try_host_strip(buf, len, msg);
            pos -= delta;
            len -= delta;
        }
    }

    msg.info.header_len = pos;

    if msg.info.bad_header {
        debug!("bad header, relaying as-is");
        msg.msg_len = pos as i64;
        return len;
    }
    if msg.info.version != 1 {
        debug!("unsupported HTTP version");
        msg.msg_len = pos as i64;
        return len;
    }
    if msg.info.transfer_encoding {
        content_len = -1;
    }
    if pos > 0 && content_len >= 0 {
        msg.msg_len = (pos as i64).saturating_add(content_len);
        if msg.msg_len == i64::MAX {
            // nonsense length, drain and close when the peer does
            msg.info.force_close = true;
        }
        if msg.msg_len < len as i64 {
            // bytes past the declared message are dropped
            debug!(msg_len = msg.msg_len, len, "truncating buffer");
            len = msg.msg_len as usize;
            msg.info.force_close = true;
        }
    }
    if msg.info.subversion != 1 {
        // probably HTTP/1.0, keep it simple
        msg.info.force_close = true;
    }
    if msg.info.code >= 400 {
        msg.msg_len = len as i64;
        msg.info.force_close = true;
    } else if msg.info.code == 204 || msg.info.code == 304 {
        // no content either way, force a single packet
        msg.msg_len = len as i64;
    }

    if msg.info.transfer_chunked {
        msg.chunk.start(msg.info.header_len);
        msg.chunk.advance(&buf[..len], 0);
        match msg.chunk.state() {
            ChunkState::Done | ChunkState::Error => msg.msg_len = len as i64,
            _ => {}
        }
    } else if verb == Verb::Get && msg.msg_len < msg.info.header_len as i64 {
        // a GET carries no body
        msg.msg_len = msg.info.header_len as i64;
    }
    len
}

fn skip_over_verb(buf: &[u8], len: usize) -> Option<usize> {
    let mut pos = 0;
    while pos < len {
        let c = buf[pos];
        pos += 1;
        if c == b' ' {
            break;
        }
        if !c.is_ascii_alphabetic() {
            return None;
        }
    }
    while pos < len && buf[pos] == b' ' {
        pos += 1;
    }
    Some(pos)
}

fn host_prefix_end(buf: &[u8], len: usize, addr_start: usize, host: &str) -> Option<usize> {
    let proto = b"http://";
    let rest = &buf[addr_start..len];
    if !rest.starts_with(proto) || !rest[proto.len()..].starts_with(host.as_bytes()) {
        return None;
    }
    let mut pos = addr_start + proto.len() + host.len();
    if pos < len && buf[pos] == b':' {
        pos += 1;
        while pos < len && buf[pos].is_ascii_digit() {
            pos += 1;
        }
    }
    Some(pos)
}

/// Resource path of a GET line, with any `http://host[:port]` prefix for
/// our known host skipped. The content key on the fetch channel.
fn extract_short_name(buf: &[u8], len: usize, msg: &MessageState) -> Option<String> {
    let mut start = skip_over_verb(buf, len)?;
    if buf.get(start) != Some(&b'/') {
        if msg.info.version != 1 || msg.info.subversion > 1 || msg.host.is_empty() {
            return None;
        }
        start = host_prefix_end(buf, len, start, &msg.host)?;
    }
    let mut pos = start;
    while pos < len && buf[pos] > b' ' {
        pos += 1;
    }
    if pos <= start {
        return None;
    }
    Some(String::from_utf8_lossy(&buf[start..pos]).into_owned())
}

/// Rewrite `VERB http://host[:port]/path ...` to `VERB /path ...` in place.
/// Returns the number of bytes removed (0 when nothing matched).
fn try_host_strip(buf: &mut [u8], len: usize, msg: &MessageState) -> usize {
    if msg.info.version != 1 || msg.info.subversion > 1 || msg.host.is_empty() {
        return 0;
    }
    let mut addr_start = None;
    for i in 0..len {
        let c = buf[i];
        if c <= b' ' {
            if c == b' ' {
                addr_start = Some(i + 1);
            }
            break;
        }
    }
    let addr_start = match addr_start {
        Some(p) => p,
        None => return 0,
    };
    let pos = match host_prefix_end(buf, len, addr_start, &msg.host) {
        Some(p) => p,
        None => return 0,
    };
    let delta = pos - addr_start;
    buf.copy_within(pos..len, addr_start);
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::BUFFER_SIZE;

    fn msg_with_host(host: &str, port: u16) -> MessageState {
        let mut msg = MessageState::new();
        msg.host = host.to_string();
        msg.port = port;
        msg
    }

    fn run_extract(
        raw: &[u8],
        verb: Verb,
        msg: &mut MessageState,
        policy: &HeaderPolicy,
    ) -> (Vec<u8>, usize) {
        let mut buf = vec![0u8; BUFFER_SIZE];
        buf[..raw.len()].copy_from_slice(raw);
        let new_len = extract(&mut buf, raw.len(), verb, msg, policy);
        (buf, new_len)
    }

    #[test]
    fn test_check_request_incremental() {
        let full = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        for cut in 1..full.len() {
            assert_eq!(check(&full[..cut], true), HeaderCheck::Incomplete, "cut {}", cut);
        }
        assert_eq!(check(full, true), HeaderCheck::Complete);
    }

    #[test]
    fn test_check_reply() {
        assert_eq!(check(b"HTTP/1.1 200 OK\r\n", false), HeaderCheck::Incomplete);
        assert_eq!(check(b"HTTP/1.1 200 OK\r\n\r\n", false), HeaderCheck::Complete);
    }

    #[test]
    fn test_check_rejects_non_http() {
        assert_eq!(check(b"SSH-2.0-OpenSSH_8.9 hello\r\n", true), HeaderCheck::Invalid);
        assert_eq!(check(b"MALFORMED 200 FOO/9.9\r\n", false), HeaderCheck::Invalid);
    }

    #[test]
    fn test_extract_reply_with_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut msg = MessageState::new();
        let (_, new_len) = run_extract(raw, Verb::None, &mut msg, &HeaderPolicy::default());
        assert_eq!(new_len, raw.len());
        assert_eq!(msg.info.code, 200);
        assert_eq!(msg.info.header_len, 38);
        assert_eq!(msg.msg_len, raw.len() as i64);
        assert!(!msg.info.force_close);
        assert_eq!(msg.request_line, "HTTP/1.1 200 OK");
    }

    #[test]
    fn test_extract_reply_truncates_overread() {
        // five declared, five extra pipelined bytes
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhelloEXTRA";
        let mut msg = MessageState::new();
        let (_, new_len) = run_extract(raw, Verb::None, &mut msg, &HeaderPolicy::default());
        assert_eq!(new_len, raw.len() - 5);
        assert!(msg.info.force_close);
        assert_eq!(msg.msg_len, new_len as i64);
    }

    #[test]
    fn test_extract_absurd_content_length_saturates() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 99999999999999999999\r\n\r\n";
        let mut msg = MessageState::new();
        run_extract(raw, Verb::None, &mut msg, &HeaderPolicy::default());
        assert_eq!(msg.msg_len, i64::MAX);
        assert!(msg.info.force_close);
    }

    #[test]
    fn test_extract_error_codes_force_close() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 100\r\n\r\n";
        let mut msg = MessageState::new();
        let (_, new_len) = run_extract(raw, Verb::None, &mut msg, &HeaderPolicy::default());
        assert!(msg.info.force_close);
        assert_eq!(msg.msg_len, new_len as i64);
    }

    #[test]
    fn test_extract_304_single_packet() {
        let raw = b"HTTP/1.1 304 Not Modified\r\nContent-Length: 999\r\n\r\n";
        let mut msg = MessageState::new();
        let (_, new_len) = run_extract(raw, Verb::None, &mut msg, &HeaderPolicy::default());
        assert_eq!(msg.msg_len, new_len as i64);
        assert!(!msg.info.force_close);
    }

    #[test]
    fn test_extract_http10_forces_close() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n";
        let mut msg = MessageState::new();
        run_extract(raw, Verb::None, &mut msg, &HeaderPolicy::default());
        assert!(msg.info.force_close);
        assert_eq!(msg.info.subversion, 0);
    }

    #[test]
    fn test_extract_connection_close_and_keep_alive() {
        let raw = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n";
        let mut msg = MessageState::new();
        run_extract(raw, Verb::None, &mut msg, &HeaderPolicy::default());
        assert!(msg.info.force_close);

        let raw = b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nKeep-Alive: timeout=15, max=100\r\n\r\n";
        let mut msg = MessageState::new();
        let policy = HeaderPolicy {
            default_keep_alive: 13,
            ..Default::default()
        };
        run_extract(raw, Verb::None, &mut msg, &policy);
        assert!(!msg.info.force_close);
        assert_eq!(msg.info.keep_alive, 15);
    }

    #[test]
    fn test_extract_keep_alive_bare_seconds() {
        let raw = b"HTTP/1.1 200 OK\r\nKeep-Alive: 42\r\n\r\n";
        let mut msg = MessageState::new();
        run_extract(raw, Verb::None, &mut msg, &HeaderPolicy::default());
        assert_eq!(msg.info.keep_alive, 42);
    }

    #[test]
    fn test_extract_chunked_reply_done() {
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let mut raw = head.to_vec();
        raw.extend_from_slice(b"5\r\nhello\r\n0\r\n\r\n");
        let mut msg = MessageState::new();
        let (_, new_len) = run_extract(&raw, Verb::None, &mut msg, &HeaderPolicy::default());
        assert!(msg.info.transfer_chunked);
        assert_eq!(msg.chunk.state(), ChunkState::Done);
        assert_eq!(msg.msg_len, (head.len() + 15) as i64);
        assert_eq!(new_len, head.len() + 15);
    }

    #[test]
    fn test_extract_chunked_reply_in_progress() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nff\r\npartial";
        let mut msg = MessageState::new();
        run_extract(raw, Verb::None, &mut msg, &HeaderPolicy::default());
        assert!(msg.chunk.state().is_active());
        assert_eq!(msg.msg_len, -1);
    }

    #[test]
    fn test_extract_request_host_from_header() {
        let raw = b"GET /path HTTP/1.1\r\nHost: www.example.com:8080\r\n\r\n";
        let mut msg = MessageState::new();
        run_extract(raw, Verb::Get, &mut msg, &HeaderPolicy::default());
        assert_eq!(msg.host, "www.example.com");
        assert_eq!(msg.port, 8080);
        assert_eq!(msg.short_name, "/path");
        assert_eq!(msg.msg_len, msg.info.header_len as i64);
    }

    #[test]
    fn test_extract_request_host_port_inherited() {
        let raw = b"GET /path HTTP/1.1\r\nHost: www.example.com\r\n\r\n";
        let mut msg = msg_with_host("old.example.com", 8080);
        run_extract(raw, Verb::Get, &mut msg, &HeaderPolicy::default());
        assert_eq!(msg.host, "www.example.com");
        assert_eq!(msg.port, 8080);
    }

    #[test]
    fn test_extract_request_line_host_agrees_with_header() {
        // same effective target whether taken from the line or the header
        let raw = b"GET http://h.example.com:81/x HTTP/1.1\r\nHost: h.example.com:81\r\n\r\n";
        let mut from_line = msg_with_host("h.example.com", 81);
        let policy = HeaderPolicy {
            host_from_get: true,
            ..Default::default()
        };
        run_extract(raw, Verb::Get, &mut from_line, &policy);

        let mut from_header = MessageState::new();
        run_extract(raw, Verb::Get, &mut from_header, &HeaderPolicy::default());

        assert_eq!(from_line.host, from_header.host);
        assert_eq!(from_line.port, from_header.port);
    }

    #[test]
    fn test_extract_rewrites_mismatched_host_line() {
        let raw = b"GET /x HTTP/1.1\r\nHost: wrong.example.com\r\nAccept: */*\r\n\r\n";
        let mut msg = msg_with_host("right.example.com", 0);
        let policy = HeaderPolicy {
            host_from_get: true,
            ..Default::default()
        };
        let (buf, new_len) = run_extract(raw, Verb::Get, &mut msg, &policy);
        let text = std::str::from_utf8(&buf[..new_len]).unwrap();
        assert!(text.contains("Host: right.example.com\r\n"));
        assert!(!text.contains("wrong"));
        assert!(text.contains("Accept: */*\r\n"));
        assert_eq!(msg.host, "right.example.com");
    }

    #[test]
    fn test_extract_removes_proxy_connection() {
        let raw = b"GET /x HTTP/1.1\r\nProxy-Connection: keep-alive\r\nHost: h\r\n\r\n";
        let mut msg = MessageState::new();
        let policy = HeaderPolicy {
            remove_proxy: true,
            default_keep_alive: 13,
            ..Default::default()
        };
        let (buf, new_len) = run_extract(raw, Verb::Get, &mut msg, &policy);
        let text = std::str::from_utf8(&buf[..new_len]).unwrap();
        assert!(!text.contains("Proxy-Connection"));
        assert!(text.contains("Host: h\r\n"));
        assert_eq!(new_len, raw.len() - "Proxy-Connection: keep-alive\r\n".len());
        assert!(msg.info.proxy_conn);
        assert_eq!(msg.info.proxy_keep_alive, 13);
    }

    #[test]
    fn test_host_prefix_strip_shrinks_line() {
        let raw = b"GET http://h.example.com:8080/a/b?q=1 HTTP/1.1\r\nHost: h.example.com\r\n\r\n";
        let mut msg = msg_with_host("h.example.com", 8080);
        let policy = HeaderPolicy {
            remove_host: true,
            host_from_get: true,
            ..Default::default()
        };
        let (buf, new_len) = run_extract(raw, Verb::Get, &mut msg, &policy);
        let text = std::str::from_utf8(&buf[..new_len]).unwrap();
        assert!(text.starts_with("GET /a/b?q=1 HTTP/1.1\r\n"));
        assert_eq!(new_len, raw.len() - "http://h.example.com:8080".len());
        assert_eq!(msg.short_name, "/a/b?q=1");
    }

    #[test]
    fn test_short_name_origin_form() {
        let raw = b"GET /just/a/path HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut msg = MessageState::new();
        run_extract(raw, Verb::Get, &mut msg, &HeaderPolicy::default());
        assert_eq!(msg.short_name, "/just/a/path");
    }

    #[test]
    fn test_unterminated_header_is_bad() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5";
        let mut msg = MessageState::new();
        run_extract(raw, Verb::None, &mut msg, &HeaderPolicy::default());
        assert!(msg.info.bad_header);
        assert_eq!(msg.msg_len, msg.info.header_len as i64);
    }
}
