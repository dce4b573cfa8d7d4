//! Access to the local bundle store over its HTTP interface.
//!
//! The daemon serves manifests and payloads over a small REST surface; the
//! engine only ever issues GETs for the bundle it is about to announce.
//! All socket I/O is non-blocking and bounded by one absolute deadline per
//! fetch, so a slow or dead daemon costs a tick, never a stall.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace};

use crate::bundle::{Bid, Version};


const STORE_EVENT: Token = Token(0);


/// The store the engine announces bundles out of.
pub trait Store {

    /// Fetch the manifest and body bytes of the given bundle version.
    fn fetch(&mut self, bid: &Bid, version: Version) -> Result<(Vec<u8>, Vec<u8>), StoreError>;

}


/// Store error while fetching bundle content.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An I/O error on the way to the daemon.
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    /// The fetch did not complete before its absolute deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The daemon answered with an unexpected status code.
    #[error("unexpected status: {0}")]
    Status(u16),
    /// The response could not be parsed at all.
    #[error("malformed response")]
    MalformedResponse,
}


/// A store client speaking HTTP to a local Rhizome-like daemon, with a
/// Basic credential. Requests use standard CRLF terminators and the
/// `Authorization` spelling; responses are accepted from both HTTP/1.0 and
/// HTTP/1.1 daemons and read until the daemon closes the connection.
pub struct HttpStore {
    addr: SocketAddr,
    /// `user:password` pair, base64-encoded on the wire.
    credential: String,
    /// Overall budget for one fetch (both requests).
    timeout: Duration,
}

impl std::fmt::Debug for HttpStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStore")
            .field("addr", &self.addr)
            .field("credential", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpStore {

    pub fn new(addr: SocketAddr, credential: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr,
            credential: credential.into(),
            timeout,
        }
    }

    /// Issue one GET and return the response body, enforcing the deadline
    /// across connect, request and response.
    fn get(&self, path: &str, deadline: Instant) -> Result<Vec<u8>, StoreError> {

        trace!("GET {path}");

        let mut stream = TcpStream::connect(self.addr)?;
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(4);
        poll.registry().register(&mut stream, STORE_EVENT, Interest::WRITABLE)?;

        // Wait for the non-blocking connect to resolve.
        loop {
            wait(&mut poll, &mut events, deadline)?;
            if let Some(e) = stream.take_error()? {
                return Err(e.into());
            }
            match stream.peer_addr() {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::NotConnected => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let request = format!(
            "GET {path} HTTP/1.1\r\n\
            Host: {}\r\n\
            Authorization: Basic {}\r\n\
            Accept: */*\r\n\
            Connection: close\r\n\
            \r\n",
            self.addr,
            base64::encode(self.credential.as_bytes()),
        );

        let mut written = 0;
        while written < request.len() {
            match stream.write(&request.as_bytes()[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait(&mut poll, &mut events, deadline)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        poll.registry().reregister(&mut stream, STORE_EVENT, Interest::READABLE)?;

        let mut response = Vec::new();
        let mut buf = [0; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait(&mut poll, &mut events, deadline)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        let (status, body) = parse_response(&response)?;
        if status != 200 {
            return Err(StoreError::Status(status));
        }

        Ok(body)

    }

}

impl Store for HttpStore {

    fn fetch(&mut self, bid: &Bid, version: Version) -> Result<(Vec<u8>, Vec<u8>), StoreError> {

        let deadline = Instant::now() + self.timeout;
        let hex = bid.hex();

        let manifest = self.get(&format!("/restful/rhizome/{hex}.rhm"), deadline)?;
        let body = self.get(&format!("/restful/rhizome/{hex}/raw.bin"), deadline)?;

        debug!("fetched {bid:?} version {version}: manifest {} bytes, body {} bytes",
            manifest.len(), body.len());

        Ok((manifest, body))

    }

}


/// Block until the socket is ready again or the deadline passes.
fn wait(poll: &mut Poll, events: &mut Events, deadline: Instant) -> Result<(), StoreError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(StoreError::DeadlineExceeded);
    }
    poll.poll(events, Some(deadline - now))?;
    if events.is_empty() {
        return Err(StoreError::DeadlineExceeded);
    }
    Ok(())
}


/// Split a raw response into status code and body. Any `HTTP/1.x` status
/// line is accepted, and header lines may be terminated by either CRLF or
/// bare LF.
fn parse_response(raw: &[u8]) -> Result<(u16, Vec<u8>), StoreError> {

    let (head, body) = split_head(raw).ok_or(StoreError::MalformedResponse)?;

    let status_line = head.split(|&b| b == b'\n').next().unwrap_or(&[]);
    let status_line = std::str::from_utf8(status_line)
        .map_err(|_| StoreError::MalformedResponse)?
        .trim_end_matches('\r');

    if !status_line.starts_with("HTTP/1.") {
        return Err(StoreError::MalformedResponse);
    }

    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or(StoreError::MalformedResponse)?;

    Ok((status, body.to_vec()))

}

/// Find the header terminator and split around it.
fn split_head(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((&raw[..pos], &raw[pos + 4..]));
    }
    if let Some(pos) = raw.windows(2).position(|w| w == b"\n\n") {
        return Some((&raw[..pos], &raw[pos + 2..]));
    }
    None
}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn parses_both_http_versions() {

        let (status, body) = parse_response(
            b"HTTP/1.0 200 OK\r\nContent-Type: application/octet-stream\r\n\r\npayload"
        ).unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"payload");

        let (status, body) = parse_response(
            b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nother"
        ).unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"other");

    }

    #[test]
    fn parses_bare_lf_headers() {
        let (status, body) = parse_response(
            b"HTTP/1.0 404 Not Found\nServer: old\n\nmissing"
        ).unwrap();
        assert_eq!(status, 404);
        assert_eq!(body, b"missing");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse_response(b"payload only"), Err(StoreError::MalformedResponse)));
        assert!(matches!(
            parse_response(b"ICY 200 OK\r\n\r\nbody"),
            Err(StoreError::MalformedResponse)
        ));
        assert!(matches!(
            parse_response(b"HTTP/1.1 nope\r\n\r\nbody"),
            Err(StoreError::MalformedResponse)
        ));
    }

    #[test]
    fn empty_body() {
        let (status, body) = parse_response(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert_eq!(status, 200);
        assert!(body.is_empty());
    }

}
