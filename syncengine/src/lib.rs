//! The sync engine library: a shadow catalog (A), a connection pool and
//! HTTP client (B, C — in the sibling `cloud_api` crate), block-level
//! diffing (D — in the sibling `blocksync` crate), a filesystem scanner
//! (E), a resumable-upload task queue (F), a speed governor (G), and a
//! path-ignore filter (H), wired together the way the teacher's
//! `pageserver` crate wires its tenant/timeline machinery around a shared
//! repository handle: modules talk to each other through catalog rows, not
//! through direct references, so the scanner and the upload worker can run
//! as independent threads.

pub mod catalog;
pub mod config;
pub mod error;
pub mod ignore;
pub mod scanner;
pub mod speed;
pub mod status;
pub mod taskqueue;
