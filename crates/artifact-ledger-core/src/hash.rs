//! Streaming SHA-256 content hashing.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::LedgerError;

/// Files are read in fixed 1 MiB chunks so memory stays bounded regardless of size.
pub const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// Hash a file on disk and return the lowercase hex SHA-256 digest.
///
/// # Errors
/// Returns [`LedgerError::UnreadableFile`] when the file cannot be opened or a read fails
/// part-way through.
pub fn hash_file(path: &Path) -> Result<String, LedgerError> {
    let file = File::open(path).map_err(|err| LedgerError::unreadable(path, err))?;
    hash_reader(file).map_err(|err| LedgerError::unreadable(path, err))
}

/// Hash any byte stream in [`HASH_CHUNK_SIZE`] chunks.
///
/// # Errors
/// Propagates read errors other than `Interrupted`.
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; HASH_CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Canonical form of a recorded digest: trimmed, lowercase, without an `sha256:` prefix.
#[must_use]
pub fn normalize_digest(raw: &str) -> String {
    let trimmed = raw.trim();
    let bare = trimmed
        .get(..7)
        .filter(|prefix| prefix.eq_ignore_ascii_case("sha256:"))
        .map_or(trimmed, |_| &trimmed[7..]);
    bare.to_ascii_lowercase()
}
