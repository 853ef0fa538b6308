//! Chunked transfer-encoding scanner.
//!
//! Finds the end of a chunked body without copying. `advance` walks the
//! buffer by byte position and carries the remaining skip distance across
//! calls, so a chunk split over several reads resumes exactly where the
//! previous buffer ended.

use super::scan::hex_digit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Not scanning a chunked body.
    Inactive,
    /// Zero-length chunk seen; the body ends here.
    Done,
    /// Malformed framing; the caller treats the message as ended.
    Error,
    /// Skipping chunk payload, expecting the CR that follows it.
    SkipBody,
    /// Expecting the LF that ends the payload CRLF.
    BodyNl,
    /// Accumulating the hex length of the next chunk.
    SizeAccum,
    /// Expecting the LF that ends the size line.
    SizeNl,
}

impl ChunkState {
    /// True for states that consume bytes.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ChunkState::SkipBody | ChunkState::BodyNl | ChunkState::SizeAccum | ChunkState::SizeNl
        )
    }
}

#[derive(Debug)]
pub struct ChunkScanner {
    state: ChunkState,
    /// Bytes to jump before the next byte of interest. Doubles as the
    /// carry when a skip runs past the end of the current buffer.
    rem: usize,
    accum: u32,
    accum_len: u32,
}

impl ChunkScanner {
    pub fn new() -> Self {
        ChunkScanner {
            state: ChunkState::Inactive,
            rem: 0,
            accum: 0,
            accum_len: 0,
        }
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn remaining(&self) -> usize {
        self.rem
    }

    pub fn reset(&mut self) {
        *self = ChunkScanner::new();
    }

    /// Begin scanning a chunked body that starts `header_len` bytes into
    /// the buffer handed to the next `advance` call.
    pub fn start(&mut self, header_len: usize) {
        self.state = ChunkState::SizeAccum;
        self.rem = header_len;
        self.accum = 0;
        self.accum_len = 0;
    }

    /// Consume chunk framing from `buf[pos..]`. Returns the position where
    /// scanning stopped: `buf.len()` when more bytes are needed (the
    /// shortfall is carried), or the position at which the state became
    /// `Done` or `Error`.
    pub fn advance(&mut self, buf: &[u8], mut pos: usize) -> usize {
        let len = buf.len();
        loop {
            pos += self.rem;
            if pos >= len {
                // continue with the next buffer
                self.rem = pos - len;
                return len;
            }
            self.rem = 0;
            let c = buf[pos];
            match self.state {
                ChunkState::SkipBody => {
                    if c != b'\r' {
                        self.state = ChunkState::Error;
                        return pos;
                    }
                    self.state = ChunkState::BodyNl;
                    pos += 1;
                }
                ChunkState::BodyNl => {
                    if c != b'\n' {
                        self.state = ChunkState::Error;
                        return pos;
                    }
                    self.state = ChunkState::SizeAccum;
                    self.accum = 0;
                    self.accum_len = 0;
                    pos += 1;
                }
                ChunkState::SizeAccum => {
                    loop {
                        let c = buf[pos];
                        if c == b' ' {
                            // blanks inside the size field occur in the wild
                        } else if let Some(h) = hex_digit(c) {
                            let next = self.accum.wrapping_mul(16).wrapping_add(h);
                            if (next >> 4) != self.accum {
                                // length does not fit in 32 bits
                                self.state = ChunkState::Error;
                                return pos;
                            }
                            self.accum = next;
                            self.accum_len += 1;
                        } else {
                            // only a CR may end the size field
                            if c != b'\r' || self.accum_len == 0 {
                                self.state = ChunkState::Error;
                                return pos;
                            }
                            self.state = ChunkState::SizeNl;
                            pos += 1;
                            break;
                        }
                        pos += 1;
                        if pos >= len {
                            return pos;
                        }
                    }
                }
                ChunkState::SizeNl => {
                    if c != b'\n' {
                        self.state = ChunkState::Error;
                        return pos;
                    }
                    pos += 1;
                    if self.accum == 0 {
                        self.state = ChunkState::Done;
                        return pos;
                    }
                    self.state = ChunkState::SkipBody;
                    self.rem = self.accum as usize;
                    self.accum = 0;
                }
                // Inactive, Done and Error absorb without advancing.
                _ => return pos,
            }
        }
    }
}

impl Default for ChunkScanner {
    fn default() -> Self {
        Self::new()
    }
}
