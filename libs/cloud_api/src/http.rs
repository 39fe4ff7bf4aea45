//! Minimal keep-alive HTTP/1.1 client for bulk payload transfer: ranged
//! `GET`s against block-checksum streams and whole-file downloads (§4.3).
//! Deliberately hand-rolled rather than built on a general HTTP stack: the
//! contract here is narrow (one request in flight per connection, two
//! response headers ever consulted) and the pool already does connection
//! management, so pulling in a full client would duplicate that work
//! without buying anything back.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CloudApiError;
use crate::pool::{ConnectionPool, PooledConnection};

#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    pub from: u64,
    pub to: u64,
}

/// A request/response pair bound to one pooled socket. Holds whatever of
/// the response body hasn't been consumed yet so `readall` can drain the
/// header-parse buffer before touching the socket again.
pub struct HttpConnection {
    conn: Option<PooledConnection>,
    content_length: Option<u64>,
    bytes_consumed: u64,
    keepalive_timeout_secs: Option<u64>,
    pending: Vec<u8>,
}

fn build_request(host: &str, path: &str, range: Option<ByteRange>, extra_headers: &HashMap<String, String>) -> Vec<u8> {
    let mut req = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: keep-alive\r\n");
    if let Some(r) = range {
        req.push_str(&format!("Range: bytes={}-{}\r\n", r.from, r.to));
    }
    for (k, v) in extra_headers {
        req.push_str(&format!("{k}: {v}\r\n"));
    }
    req.push_str("\r\n");
    req.into_bytes()
}

/// Parses a status line + header block from `buf`, returning the status
/// code, a case-folded header map, and how many bytes of `buf` the
/// header block consumed (the remainder is body that arrived in the same
/// read and must be treated as already-buffered).
fn parse_response_head(buf: &[u8]) -> Result<(u16, HashMap<String, String>, usize), CloudApiError> {
    let header_end = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| CloudApiError::Protocol("response header not terminated".into()))?
        + 4;

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| CloudApiError::Protocol("response head is not valid utf-8".into()))?;
    let mut lines = head.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| CloudApiError::Protocol("missing status line".into()))?;
    let code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CloudApiError::Protocol(format!("malformed status line '{status_line}'")))?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    Ok((code, headers, header_end))
}

fn parse_keepalive_timeout(headers: &HashMap<String, String>) -> Option<u64> {
    let raw = headers.get("keep-alive")?;
    raw.split(',')
        .find_map(|part| part.trim().strip_prefix("timeout="))
        .and_then(|n| n.trim().parse().ok())
}

pub struct HttpClient {
    pool: Arc<ConnectionPool>,
    /// Prewarm dials in flight, keyed by host. `connect` waits out the
    /// matching entry (if any) before acquiring from the pool, so a
    /// `connect`/`connect_multihost` racing a background
    /// `connect_and_cache_host` for the same host picks up the
    /// freshly-dialed socket from the cache instead of paying for a
    /// second dial.
    prewarming: Mutex<HashMap<String, tokio::sync::oneshot::Receiver<()>>>,
}

impl HttpClient {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            prewarming: Mutex::new(HashMap::new()),
        }
    }

    /// Issues one ranged (or whole-entity) `GET`, consuming the status
    /// line and headers. Fails on any non-2xx response.
    pub async fn connect(
        &self,
        host: &str,
        path: &str,
        range: Option<ByteRange>,
        extra_headers: &HashMap<String, String>,
    ) -> Result<HttpConnection, CloudApiError> {
        self.await_prewarm(host).await;
        self.pool.set_server(host.to_owned()).await;
        let mut conn = self.pool.acquire().await?;

        let request = build_request(host, path, range, extra_headers);
        conn.socket
            .write_all(&request)
            .await
            .map_err(CloudApiError::Network)?;

        self.read_response_head(conn).await
    }

    /// Tries, in order, `hosts`' cached sockets, then any in-flight
    /// prewarmed dial, then a fresh connection — the first host to
    /// succeed wins.
    pub async fn connect_multihost(
        &self,
        hosts: &[String],
        path: &str,
        range: Option<ByteRange>,
        extra_headers: &HashMap<String, String>,
    ) -> Result<(HttpConnection, String), CloudApiError> {
        let mut last_err = None;
        for host in hosts {
            match self.connect(host, path, range, extra_headers).await {
                Ok(conn) => return Ok((conn, host.clone())),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(CloudApiError::PoolExhausted))
    }

    /// Starts a background dial to `host` whose socket lands in the pool
    /// cache once established, so a subsequent `connect`/`connect_multihost`
    /// pays no connect latency.
    pub async fn connect_and_cache_host(self: &Arc<Self>, host: String) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.prewarming.lock().await.insert(host.clone(), rx);
        let this = self.clone();
        tokio::spawn(async move {
            this.pool.set_server(host).await;
            let _ = this.pool.prepare().await;
            let _ = tx.send(());
        });
    }

    /// Waits out any in-flight `connect_and_cache_host` dial for `host`
    /// per §4.3 ("then any in-flight prewarmed dial"), so a `connect` that
    /// races a background prewarm is handed the freshly-cached socket by
    /// the pool instead of paying for a second dial. A no-op once the
    /// prewarm has landed or if none was ever started.
    async fn await_prewarm(&self, host: &str) {
        let rx = self.prewarming.lock().await.remove(host);
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }

    async fn read_response_head(&self, mut conn: PooledConnection) -> Result<HttpConnection, CloudApiError> {
        let mut buf = vec![0u8; 8192];
        let mut filled = 0;
        loop {
            if filled == buf.len() {
                buf.resize(buf.len() * 2, 0);
            }
            let n = conn
                .socket
                .read(&mut buf[filled..])
                .await
                .map_err(CloudApiError::Network)?;
            if n == 0 {
                return Err(CloudApiError::Protocol("connection closed before headers completed".into()));
            }
            filled += n;
            if buf[..filled].windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        buf.truncate(filled);

        let (status, headers, header_end) = parse_response_head(&buf)?;
        if !(200..300).contains(&status) {
            return Err(CloudApiError::HttpStatus(format!(
                "status {status}: {}",
                headers.get("x-error").cloned().unwrap_or_default()
            )));
        }

        let content_length = headers.get("content-length").and_then(|v| v.parse().ok());
        let keepalive_timeout_secs = parse_keepalive_timeout(&headers);
        let pending = buf[header_end..].to_vec();

        Ok(HttpConnection {
            conn: Some(conn),
            content_length,
            bytes_consumed: 0,
            keepalive_timeout_secs,
            pending,
        })
    }

    /// Reads exactly `n` bytes (or fewer, if content-length says the body
    /// is shorter), preferring whatever already arrived with the headers
    /// before touching the socket again.
    pub async fn readall(&self, http_conn: &mut HttpConnection, n: usize) -> Result<Vec<u8>, CloudApiError> {
        let want = match http_conn.content_length {
            Some(len) => n.min((len - http_conn.bytes_consumed) as usize),
            None => n,
        };
        let mut out = Vec::with_capacity(want);

        let from_pending = http_conn.pending.len().min(want);
        out.extend(http_conn.pending.drain(..from_pending));

        let conn = http_conn
            .conn
            .as_mut()
            .ok_or_else(|| CloudApiError::Protocol("connection already closed".into()))?;
        while out.len() < want {
            let mut chunk = vec![0u8; want - out.len()];
            let n = conn.socket.read(&mut chunk).await.map_err(CloudApiError::Network)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        http_conn.bytes_consumed += out.len() as u64;
        Ok(out)
    }

    /// Sends a pipelined follow-up request on the same connection, ahead
    /// of reading the prior response's body.
    pub async fn request_next(
        &self,
        http_conn: &mut HttpConnection,
        host: &str,
        path: &str,
        range: Option<ByteRange>,
    ) -> Result<(), CloudApiError> {
        let conn = http_conn
            .conn
            .as_mut()
            .ok_or_else(|| CloudApiError::Protocol("connection already closed".into()))?;
        let request = build_request(host, path, range, &HashMap::new());
        conn.socket.write_all(&request).await.map_err(CloudApiError::Network)?;
        Ok(())
    }

    /// Parses the next pipelined response on a connection whose prior body
    /// has already been fully drained via [`Self::readall`].
    pub async fn next_response(&self, http_conn: HttpConnection) -> Result<HttpConnection, CloudApiError> {
        let conn = http_conn
            .conn
            .ok_or_else(|| CloudApiError::Protocol("connection already closed".into()))?;
        self.read_response_head(conn).await
    }

    /// Returns the socket to the pool if keep-alive was generous and the
    /// full body was drained; otherwise discards it, matching §4.3's
    /// `keepalive > 5 AND all content-length bytes consumed` rule.
    pub fn close(&self, http_conn: HttpConnection) {
        let Some(conn) = http_conn.conn else { return };
        let fully_drained = match http_conn.content_length {
            Some(len) => http_conn.bytes_consumed >= len,
            None => true,
        };
        let worth_keeping = http_conn.keepalive_timeout_secs.unwrap_or(0) > 5 && fully_drained;
        if worth_keeping {
            let pool = self.pool.clone();
            tokio::spawn(async move { pool.release(conn).await });
        } else {
            debug!("closing http connection instead of caching it");
            self.pool.release_bad(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_head_extracts_status_and_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\nKeep-Alive: timeout=15\r\n\r\nbody-bytes";
        let (status, headers, header_end) = parse_response_head(raw).unwrap();
        assert_eq!(status, 200);
        assert_eq!(headers.get("content-length").unwrap(), "42");
        assert_eq!(&raw[header_end..], b"body-bytes");
        assert_eq!(parse_keepalive_timeout(&headers), Some(15));
    }

    #[test]
    fn parse_response_head_rejects_missing_terminator() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n";
        assert!(parse_response_head(raw).is_err());
    }

    #[tokio::test]
    async fn await_prewarm_blocks_until_the_dial_finishes_then_drains_the_entry() {
        let pool = Arc::new(ConnectionPool::new(crate::config::CloudApiConfig::default()).unwrap());
        let client = Arc::new(HttpClient::new(pool));
        let (tx, rx) = tokio::sync::oneshot::channel();
        client.prewarming.lock().await.insert("host.invalid".to_owned(), rx);

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.await_prewarm("host.invalid").await })
        };
        tx.send(()).unwrap();
        waiter.await.unwrap();

        assert!(!client.prewarming.lock().await.contains_key("host.invalid"));
    }

    #[tokio::test]
    async fn await_prewarm_is_a_noop_without_an_in_flight_dial() {
        let pool = Arc::new(ConnectionPool::new(crate::config::CloudApiConfig::default()).unwrap());
        let client = HttpClient::new(pool);
        client.await_prewarm("nothing-pending.invalid").await;
    }

    #[test]
    fn build_request_includes_range_header() {
        let req = build_request(
            "example.invalid",
            "/f/abc",
            Some(ByteRange { from: 10, to: 19 }),
            &HashMap::new(),
        );
        let text = String::from_utf8(req).unwrap();
        assert!(text.contains("Range: bytes=10-19\r\n"));
        assert!(text.starts_with("GET /f/abc HTTP/1.1\r\n"));
    }
}
