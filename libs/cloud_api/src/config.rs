//! Tunables for the connection pool and HTTP/RPC clients, sourced from the
//! `setting` catalog table (§6) at runtime and expressible as TOML for
//! local testing, matching the rest of the workspace's config pattern.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudApiConfig {
    /// Hostname of the currently selected API backend (`setting.api_server`).
    pub api_server: String,
    pub use_ssl: bool,
    /// Upper bound on active+cached sockets; `ConnectionPool::acquire`
    /// blocks once this many are outstanding.
    pub max_pooled_connections: usize,
    #[serde(with = "humantime_serde")]
    pub socket_cache_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// `PSYNC_MAX_COPY_FROM_REQ`: largest byte range a single
    /// `upload_writefromfile`/`upload_writefromupload` request may cover.
    pub max_copy_from_request_bytes: u64,
    /// `PSYNC_MAX_PENDING_UPLOAD_REQS`: outstanding pipelined requests per
    /// resumable upload.
    pub max_pending_upload_requests: usize,
}

impl Default for CloudApiConfig {
    fn default() -> Self {
        Self {
            api_server: "api.example.invalid".to_owned(),
            use_ssl: true,
            max_pooled_connections: 16,
            socket_cache_ttl: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_copy_from_request_bytes: 64 * 1024 * 1024,
            max_pending_upload_requests: 4,
        }
    }
}
