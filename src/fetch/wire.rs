//! Frame codec for the content daemon link.
//!
//! Two frame types travel the link: INTEREST (us to the daemon, naming a
//! segment we want) and DATA (daemon to us, carrying one segment). All
//! integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Error, Result, MAX_NAME, SEGMENT_SIZE};

/// Frame type tags.
pub const FRAME_INTEREST: u8 = 0x1;
pub const FRAME_DATA: u8 = 0x2;

/// DATA flag marking the final segment of a stream.
pub const FLAG_FINAL: u8 = 0x1;

/// Fixed part of an INTEREST frame: type, stream, segment, flags, name len.
pub const INTEREST_HEADER_SIZE: usize = 16;

/// Fixed part of a DATA frame: type, stream, segment, flags, payload len.
pub const DATA_HEADER_SIZE: usize = 18;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Interest {
        stream: u32,
        segment: u64,
        flags: u8,
        name: Bytes,
    },
    Data {
        stream: u32,
        segment: u64,
        flags: u8,
        payload: Bytes,
    },
}

pub fn check_name(name: &[u8]) -> Result<()> {
    if name.len() > MAX_NAME {
        return Err(Error::NameTooLong(name.len()));
    }
    Ok(())
}

/// Append an INTEREST frame to the output buffer.
pub fn encode_interest(buf: &mut BytesMut, stream: u32, segment: u64, flags: u8, name: &[u8]) {
    buf.put_u8(FRAME_INTEREST);
    buf.put_u32(stream);
    buf.put_u64(segment);
    buf.put_u8(flags);
    buf.put_u16(name.len() as u16);
    buf.put_slice(name);
}

/// Append a DATA frame to the output buffer.
pub fn encode_data(buf: &mut BytesMut, stream: u32, segment: u64, flags: u8, payload: &[u8]) {
    buf.put_u8(FRAME_DATA);
    buf.put_u32(stream);
    buf.put_u64(segment);
    buf.put_u8(flags);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Pull one complete frame off the front of the accumulation buffer.
/// Returns None while the buffer holds only a partial frame.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.is_empty() {
        return Ok(None);
    }
    match buf[0] {
        FRAME_INTEREST => {
            if buf.len() < INTEREST_HEADER_SIZE {
                return Ok(None);
            }
            let name_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
            if name_len > MAX_NAME {
                return Err(Error::Frame(format!("interest name {} bytes", name_len)));
            }
            if buf.len() < INTEREST_HEADER_SIZE + name_len {
                return Ok(None);
            }
            let mut frame = buf.split_to(INTEREST_HEADER_SIZE + name_len);
            frame.advance(1);
            let stream = frame.get_u32();
            let segment = frame.get_u64();
            let flags = frame.get_u8();
            frame.advance(2);
            Ok(Some(Frame::Interest {
                stream,
                segment,
                flags,
                name: frame.freeze(),
            }))
        }
        FRAME_DATA => {
            if buf.len() < DATA_HEADER_SIZE {
                return Ok(None);
            }
            let payload_len =
                u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]) as usize;
            if payload_len > SEGMENT_SIZE {
                return Err(Error::Frame(format!("data payload {} bytes", payload_len)));
            }
            if buf.len() < DATA_HEADER_SIZE + payload_len {
                return Ok(None);
            }
            let mut frame = buf.split_to(DATA_HEADER_SIZE + payload_len);
            frame.advance(1);
            let stream = frame.get_u32();
            let segment = frame.get_u64();
            let flags = frame.get_u8();
            frame.advance(4);
            Ok(Some(Frame::Data {
                stream,
                segment,
                flags,
                payload: frame.freeze(),
            }))
        }
        t => Err(Error::Frame(format!("unknown frame type 0x{:x}", t))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_round_trip() {
        let mut buf = BytesMut::new();
        encode_interest(&mut buf, 7, 3, 2, b"/TestCCN/http/example.com/index.html");

        // header layout: type, stream, segment, flags, name len
        assert_eq!(buf[0], FRAME_INTEREST);
        assert_eq!(&buf[1..5], &[0, 0, 0, 7]);
        assert_eq!(&buf[5..13], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(buf[13], 2);

        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Interest {
                stream: 7,
                segment: 3,
                flags: 2,
                name: Bytes::from_static(b"/TestCCN/http/example.com/index.html"),
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_data_round_trip() {
        let mut buf = BytesMut::new();
        encode_data(&mut buf, 1, 0, FLAG_FINAL, b"hello");

        let frame = decode_frame(&mut buf).unwrap().unwrap();
        match frame {
            Frame::Data {
                stream,
                segment,
                flags,
                payload,
            } => {
                assert_eq!(stream, 1);
                assert_eq!(segment, 0);
                assert_eq!(flags & FLAG_FINAL, FLAG_FINAL);
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("wrong frame: {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut full = BytesMut::new();
        encode_data(&mut full, 1, 0, 0, &[0xAA; 100]);

        let mut buf = BytesMut::new();
        for cut in [1, DATA_HEADER_SIZE - 1, DATA_HEADER_SIZE, DATA_HEADER_SIZE + 50] {
            buf.clear();
            buf.extend_from_slice(&full[..cut]);
            assert!(decode_frame(&mut buf).unwrap().is_none(), "cut at {}", cut);
        }

        buf.clear();
        buf.extend_from_slice(&full);
        assert!(decode_frame(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = BytesMut::new();
        encode_data(&mut buf, 1, 0, 0, b"abc");
        encode_data(&mut buf, 1, 1, FLAG_FINAL, b"de");

        let first = decode_frame(&mut buf).unwrap().unwrap();
        let second = decode_frame(&mut buf).unwrap().unwrap();
        assert!(decode_frame(&mut buf).unwrap().is_none());

        match (first, second) {
            (
                Frame::Data {
                    segment: 0,
                    payload: p0,
                    ..
                },
                Frame::Data {
                    segment: 1,
                    payload: p1,
                    ..
                },
            ) => {
                assert_eq!(&p0[..], b"abc");
                assert_eq!(&p1[..], b"de");
            }
            other => panic!("wrong frames: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x7F, 0, 0, 0, 1]);
        assert!(decode_frame(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(FRAME_DATA);
        buf.put_u32(1);
        buf.put_u64(0);
        buf.put_u8(0);
        buf.put_u32(SEGMENT_SIZE as u32 + 1);
        assert!(decode_frame(&mut buf).is_err());
    }

    #[test]
    fn test_name_cap() {
        assert!(check_name(&[b'a'; MAX_NAME]).is_ok());
        assert!(check_name(&[b'a'; MAX_NAME + 1]).is_err());
    }
}
