//! Content-defined block matching for resumable, deduplicated uploads.
//!
//! Given the block checksum stream the server returns for an existing
//! remote file (or for a prior, interrupted upload), this crate finds which
//! byte ranges of a local file already exist at that source, so the upload
//! worker only has to send the bytes that are actually new.
//!
//! The pieces compose as: [`adler`] rolling checksum primitives, a
//! [`table::ChecksumTable`] built from one source's blocks, [`scan`] to walk
//! a local file with a sliding window against that table, and [`plan`] to
//! turn the matches from one or more sources into a single coalesced
//! transfer plan.

pub mod adler;
pub mod plan;
pub mod scan;
pub mod table;

pub use adler::{adler32, adler32_fresh, adler32_roll};
pub use plan::{Action, Plan, Segment};
pub use scan::{scan_for_matches, Match};
pub use table::{BlockChecksum, ChecksumTable, MAX_ADLER_COLLISIONS};
