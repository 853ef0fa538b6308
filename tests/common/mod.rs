//! Shared scaffolding for proxy integration tests: a scripted content
//! daemon, a proxy spawner, and raw-socket read helpers.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;

use ccgate::fetch::{wire, Frame, SEGMENT_SIZE};
use ccgate::proxy::{Config, Proxy};

/// Accept one daemon connection and answer every interest with slices of
/// `content`, whatever the name. Runs until the proxy drops the link.
pub fn spawn_content_daemon(content: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut inbuf = BytesMut::new();
        let mut tmp = [0u8; 4096];
        loop {
            let n = match conn.read(&mut tmp) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            inbuf.extend_from_slice(&tmp[..n]);
            while let Ok(Some(frame)) = wire::decode_frame(&mut inbuf) {
                let Frame::Interest {
                    stream, segment, ..
                } = frame
                else {
                    continue;
                };
                let start = (segment as usize) * SEGMENT_SIZE;
                if start > content.len() {
                    continue;
                }
                let end = (start + SEGMENT_SIZE).min(content.len());
                let flags = if end == content.len() {
                    wire::FLAG_FINAL
                } else {
                    0
                };
                let mut out = BytesMut::new();
                wire::encode_data(&mut out, stream, segment, flags, &content[start..end]);
                if conn.write_all(&out).is_err() {
                    return;
                }
            }
        }
    });
    addr
}

/// Start a proxy on an ephemeral port and run its loop on a background
/// thread. The loop never returns, so the thread is left detached.
pub fn spawn_proxy(mut cfg: Config) -> SocketAddr {
    cfg.port = 0;
    let mut proxy = Proxy::new(cfg).unwrap();
    let addr = proxy.local_addr().unwrap();
    thread::spawn(move || {
        let _ = proxy.run();
    });
    addr
}

/// Write a routing list into `dir` and return its path.
pub fn write_routes(dir: &tempfile::TempDir, text: &str) -> PathBuf {
    let path = dir.path().join("routes.list");
    std::fs::write(&path, text).unwrap();
    path
}

/// Read until the peer closes, with a generous timeout.
pub fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) => panic!("read failed after {} bytes: {e}", out.len()),
        }
    }
    out
}

/// Read until the blank line ending an HTTP header section.
pub fn read_header(stream: &mut TcpStream) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    while !out.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(0) => panic!("peer closed mid-header after {} bytes", out.len()),
            Ok(_) => out.push(byte[0]),
            Err(e) => panic!("header read failed: {e}"),
        }
    }
    out
}

/// Read exactly `n` more bytes.
pub fn read_exact_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    stream.read_exact(&mut out).unwrap();
    out
}
