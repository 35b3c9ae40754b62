//! Minimal HTTP/1.1 file server for integration tests.
//!
//! Serves one static body on every path. Honours `Range: bytes=N-` with
//! 206 Partial Content unless told otherwise, and can cut the first response
//! short to simulate a dropped connection.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// Answer every request with this status and an empty body.
    pub fail_status: Option<u16>,
    /// Close the connection after this many body bytes on the first GET.
    pub truncate_first: Option<usize>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            fail_status: None,
            truncate_first: None,
        }
    }
}

/// A running server. `requests` records the range start of every GET
/// (`None` when no Range header was sent).
pub struct RangeServer {
    pub url: String,
    pub requests: Arc<Mutex<Vec<Option<u64>>>>,
}

pub fn start(body: Vec<u8>) -> RangeServer {
    start_with_options(body, RangeServerOptions::default())
}

/// The server thread runs until the process exits.
pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let truncated = Arc::new(AtomicBool::new(false));
    {
        let requests = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let body = Arc::clone(&body);
                let requests = requests.clone();
                let truncated = truncated.clone();
                thread::spawn(move || handle(stream, &body, opts, &requests, &truncated));
            }
        });
    }
    RangeServer {
        url: format!("http://127.0.0.1:{}/", port),
        requests,
    }
}

fn handle(
    mut stream: TcpStream,
    body: &[u8],
    opts: RangeServerOptions,
    requests: &Mutex<Vec<Option<u64>>>,
    truncated: &AtomicBool,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let Ok(request) = std::str::from_utf8(&buf[..n]) else {
        return;
    };
    let (method, range_start) = parse_request(request);
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }
    requests.lock().unwrap().push(range_start);

    if let Some(status) = opts.fail_status {
        let response = format!(
            "HTTP/1.1 {} Test Failure\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    let total = body.len();
    let (status, content_range, slice) = match range_start {
        Some(start) if opts.support_ranges => {
            let start = start as usize;
            if start >= total {
                ("416 Range Not Satisfiable", format!("bytes */{}", total), &body[0..0])
            } else {
                (
                    "206 Partial Content",
                    format!("bytes {}-{}/{}", start, total - 1, total),
                    &body[start..],
                )
            }
        }
        _ => (
            "200 OK",
            format!("bytes 0-{}/{}", total.saturating_sub(1), total),
            body,
        ),
    };
    let content_range = if status.starts_with("200") {
        String::new()
    } else {
        format!("Content-Range: {}\r\n", content_range)
    };
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
        status,
        slice.len(),
        content_range
    );
    let _ = stream.write_all(head.as_bytes());

    let cut = opts
        .truncate_first
        .filter(|_| !truncated.swap(true, Ordering::SeqCst));
    match cut {
        Some(limit) => {
            let _ = stream.write_all(&slice[..limit.min(slice.len())]);
            let _ = stream.flush();
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        None => {
            let _ = stream.write_all(slice);
        }
    }
}

/// Returns the method and the start of a `Range: bytes=N-` header.
fn parse_request(request: &str) -> (&str, Option<u64>) {
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
                let value = value.trim().to_ascii_lowercase();
                if let Some(bounds) = value.strip_prefix("bytes=") {
                    if let Some((start, _)) = bounds.split_once('-') {
                        range = start.trim().parse::<u64>().ok();
                    }
                }
            }
        }
    }
    (method, range)
}
