//! ccgate - HTTP forwarding proxy with a content-centric fetch path.
//!
//! A single-threaded relay: clients speak ordinary HTTP/1.x to the proxy,
//! which either forwards to the origin over reused keep-alive sockets or,
//! for hosts named in a routing list, pulls the response out of a local
//! content daemon over a segment-framed fetch channel.

pub mod fetch;
pub mod http;
pub mod net;
pub mod proxy;
