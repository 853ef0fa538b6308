//! Byte-level scanning helpers.
//!
//! The header rewriter works in place on a raw receive buffer, so these
//! helpers operate on byte slices with explicit positions instead of
//! allocating intermediate strings.

/// A blank is any ASCII control or space byte.
pub fn is_blank(c: u8) -> bool {
    c <= b' '
}

pub fn hex_digit(c: u8) -> Option<u32> {
    (c as char).to_digit(16)
}

/// Advance `pos` past any run of blanks.
pub fn skip_over_blank(buf: &[u8], mut pos: usize) -> usize {
    while pos < buf.len() && is_blank(buf[pos]) {
        pos += 1;
    }
    pos
}

/// Advance `pos` to the next blank (or the end of the buffer).
pub fn skip_to_blank(buf: &[u8], mut pos: usize) -> usize {
    while pos < buf.len() && !is_blank(buf[pos]) {
        pos += 1;
    }
    pos
}

/// Index one past the next LF at or after `pos`, or `buf.len()` when the
/// buffer ends without one.
pub fn next_line(buf: &[u8], pos: usize) -> usize {
    match buf[pos..].iter().position(|&c| c == b'\n') {
        Some(i) => pos + i + 1,
        None => buf.len(),
    }
}

/// Parse an unsigned decimal number starting at `pos`. Returns 0 when no
/// digits are present; saturates instead of wrapping on absurd inputs.
pub fn eval_uint(buf: &[u8], mut pos: usize) -> i64 {
    let mut n: i64 = 0;
    while pos < buf.len() && buf[pos].is_ascii_digit() {
        n = n.saturating_mul(10).saturating_add(i64::from(buf[pos] - b'0'));
        pos += 1;
    }
    n
}

/// Accept a run of non-blank bytes starting at `pos`, at most `max` long.
/// Returns the end of the run; the part itself is `buf[pos..end]`.
pub fn accept_part(buf: &[u8], pos: usize, max: usize) -> usize {
    let mut end = pos;
    while end < buf.len() && end - pos < max && !is_blank(buf[end]) {
        end += 1;
    }
    end
}

/// Number of leading bytes at `pos` that form a host name: letters,
/// digits, dots, hyphens and underscores, capped at `max`.
pub fn accept_host_name(buf: &[u8], pos: usize, max: usize) -> usize {
    let mut n = 0;
    while pos + n < buf.len() && n < max {
        let c = buf[pos + n];
        if c.is_ascii_alphanumeric() || c == b'.' || c == b'-' || c == b'_' {
            n += 1;
        } else {
            break;
        }
    }
    n
}

/// Parse a `:port` suffix at `pos`. Returns the bytes consumed (including
/// the colon) and the port value, or `(0, 0)` when there is no usable
/// port at that position.
pub fn accept_host_port(buf: &[u8], pos: usize) -> (usize, u16) {
    if pos >= buf.len() || buf[pos] != b':' {
        return (0, 0);
    }
    let mut n = 1;
    let mut port: u32 = 0;
    while pos + n < buf.len() && buf[pos + n].is_ascii_digit() {
        port = port * 10 + u32::from(buf[pos + n] - b'0');
        if port > u32::from(u16::MAX) {
            return (0, 0);
        }
        n += 1;
    }
    if n == 1 {
        return (0, 0);
    }
    (n, port as u16)
}
