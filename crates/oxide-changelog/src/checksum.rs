//! Checksums of migration scripts.
//!
//! The checksum is the MD5 hex digest of the raw script text, as stored in
//! the `MD5SUM` column of `DATABASECHANGELOG`.

use md5::{Digest, Md5};

/// Computes the checksum of a script.
#[must_use]
pub fn checksum(script: &str) -> String {
    format!("{:x}", Md5::digest(script.as_bytes()))
}
