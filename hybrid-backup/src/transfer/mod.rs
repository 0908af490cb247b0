//! Transfer integrity (per-file SHA-256 digests) and size formatting.

pub mod checksum;
pub mod progress;

pub use checksum::{ChecksumSet, CHECKSUM_FILE};
