//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Status code and body of a raw HTTP/1.1 response.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: String,
}

pub fn build_request(method: &str, path: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    request.push_str(body);
    request
}

pub fn parse_response(raw: &str) -> RawResponse {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    RawResponse {
        status,
        head: head.to_string(),
        body: body.to_string(),
    }
}

/// Blocking request over plain TCP.
pub fn send(addr: SocketAddr, method: &str, path: &str, body: &str) -> RawResponse {
    send_with_headers(addr, method, path, &[], body)
}

pub fn send_with_headers(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> RawResponse {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("set timeout");
    stream
        .write_all(build_request(method, path, headers, body).as_bytes())
        .expect("write request");

    let mut raw = String::new();
    stream.read_to_string(&mut raw).expect("read response");
    parse_response(&raw)
}

/// Async request over any stream (plain or TLS).
pub async fn send_async<S>(mut stream: S, method: &str, path: &str, body: &str) -> RawResponse
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(build_request(method, path, &[], body).as_bytes())
        .await
        .expect("write request");

    let mut raw = Vec::new();
    // TLS peers may close without close_notify; keep what was read.
    let _ = stream.read_to_end(&mut raw).await;
    parse_response(&String::from_utf8_lossy(&raw))
}
