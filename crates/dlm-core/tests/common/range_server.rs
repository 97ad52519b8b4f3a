//! Minimal HTTP/1.1 server with HEAD and Range GET support for integration
//! tests.
//!
//! Serves a single static body. GET with `Range: bytes=s-[e]` answers 206
//! Partial Content with the matching slice. The body can be written in small
//! delayed pieces so an in-flight transfer stays interruptible long enough
//! for pause/cancel tests, or cut short to simulate a dying peer.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// If false, HEAD returns 405 (simulates servers that block HEAD).
    pub head_allowed: bool,
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// If true, every request answers 404.
    pub not_found: bool,
    /// Body write granularity.
    pub chunk_size: usize,
    /// Sleep between body chunks; keeps transfers slow enough to interrupt.
    pub chunk_delay: Option<Duration>,
    /// Close the connection after this many body bytes (dying peer).
    pub fail_after: Option<usize>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            head_allowed: true,
            support_ranges: true,
            not_found: false,
            chunk_size: 1024,
            chunk_delay: None,
            fail_after: None,
        }
    }
}

/// Starts a server in a background thread serving `body`. Returns the base
/// URL (e.g. "http://127.0.0.1:12345/"). Runs until the process exits.
pub fn start(body: Vec<u8>) -> String {
    start_with_options(body, RangeServerOptions::default())
}

/// Like `start`, with a throttle so transfers take roughly
/// `body_len / 1024 * 10ms` and stay interruptible.
pub fn start_throttled(body: Vec<u8>) -> String {
    start_with_options(
        body,
        RangeServerOptions {
            chunk_delay: Some(Duration::from_millis(10)),
            ..RangeServerOptions::default()
        },
    )
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            thread::spawn(move || handle(stream, &body, opts));
        }
    });
    format!("http://127.0.0.1:{}/", port)
}

fn handle(mut stream: std::net::TcpStream, body: &[u8], opts: RangeServerOptions) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, range) = parse_request(request);
    let total = body.len() as u64;

    if opts.not_found {
        let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found");
        return;
    }

    if method.eq_ignore_ascii_case("HEAD") {
        if !opts.head_allowed {
            let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n");
            return;
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\n\r\n",
            total
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n");
        return;
    }

    let (status, content_range, slice) = match range.filter(|_| opts.support_ranges && total > 0) {
        Some((start, end_incl)) => {
            let start = start.min(total);
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start > end_incl {
                ("416 Range Not Satisfiable", Some(format!("bytes */{}", total)), &body[0..0])
            } else {
                let slice = &body[start as usize..=end_incl as usize];
                (
                    "206 Partial Content",
                    Some(format!("bytes {}-{}/{}", start, end_incl, total)),
                    slice,
                )
            }
        }
        None => ("200 OK", None, body),
    };

    let mut response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\n",
        status,
        slice.len()
    );
    if let Some(content_range) = content_range {
        response.push_str(&format!("Content-Range: {}\r\n", content_range));
    }
    response.push_str("\r\n");
    if stream.write_all(response.as_bytes()).is_err() {
        return;
    }

    let mut sent = 0usize;
    for chunk in slice.chunks(opts.chunk_size.max(1)) {
        if let Some(limit) = opts.fail_after {
            if sent >= limit {
                return; // cut the connection mid-body
            }
        }
        if stream.write_all(chunk).is_err() {
            return;
        }
        let _ = stream.flush();
        sent += chunk.len();
        if let Some(delay) = opts.chunk_delay {
            thread::sleep(delay);
        }
    }
}

/// Returns (method, optional (start, end_inclusive)) for `Range: bytes=X-[Y]`.
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(spec) = value.strip_prefix("bytes=") {
                    if let Some((start, end)) = spec.split_once('-') {
                        let start = start.trim().parse::<u64>().unwrap_or(0);
                        let end = end.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, range)
}
