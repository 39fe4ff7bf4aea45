//! Client surface for talking to the API host: a bounded, health-checked
//! socket pool (§4.2), a hand-rolled keep-alive HTTP/1.1 client for bulk
//! transfer (§4.3), and the binary RPC protocol the rest of the sync
//! engine drives uploads, renames, and deletes through (§6).
//!
//! No other crate is expected to dial a socket or format a wire frame
//! directly — everything needed to talk to the backend lives here.

pub mod config;
pub mod error;
pub mod http;
pub mod pool;
pub mod protocol;

pub use config::CloudApiConfig;
pub use error::CloudApiError;
pub use http::{ByteRange, HttpClient, HttpConnection};
pub use pool::{ConnectionPool, PooledConnection, Socket};
pub use protocol::{call, call_pooled, verbs, BlockChecksumHeader, Param, Request, Response, Verb};
