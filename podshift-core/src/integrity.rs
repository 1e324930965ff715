// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Checksums for bundle files and migration records.
//!
//! Artifacts use SHA-256 (`sha256:<hex>`); record files carry a CRC32 trailer
//! to detect torn writes. Mismatches are errors, never warnings.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Prefix identifying the digest algorithm in stored checksums.
pub const CHECKSUM_PREFIX: &str = "sha256:";

/// Size of the read buffer used when hashing files.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Size and checksum of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size_bytes: u64,
    pub checksum: String,
}

/// Hash an in-memory payload.
pub fn checksum_bytes(data: &[u8]) -> String {
    format!("{}{}", CHECKSUM_PREFIX, hex::encode(Sha256::digest(data)))
}

/// Stream a file through SHA-256. Blocking; call from `spawn_blocking` in
/// async code.
pub fn digest_file(path: &Path) -> std::io::Result<FileDigest> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    let mut size_bytes = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size_bytes += n as u64;
    }

    Ok(FileDigest {
        size_bytes,
        checksum: format!("{}{}", CHECKSUM_PREFIX, hex::encode(hasher.finalize())),
    })
}

/// Whether a stored checksum string is well formed.
pub fn is_valid_checksum(checksum: &str) -> bool {
    checksum
        .strip_prefix(CHECKSUM_PREFIX)
        .map(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

/// CRC32 of a record payload.
pub fn record_crc(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Append a `\n#crc32=<hex>` trailer to a record payload.
pub fn seal_record(payload: &[u8]) -> Vec<u8> {
    let mut sealed = payload.to_vec();
    sealed.extend_from_slice(format!("\n#crc32={:08x}\n", record_crc(payload)).as_bytes());
    sealed
}

/// Split a sealed record and verify its trailer. Returns the payload.
pub fn unseal_record(sealed: &[u8]) -> Result<&[u8], String> {
    let text = std::str::from_utf8(sealed).map_err(|e| format!("not UTF-8: {}", e))?;
    let trimmed = text.trim_end_matches('\n');
    let (payload, trailer) = trimmed
        .rsplit_once("\n#crc32=")
        .ok_or_else(|| "missing crc32 trailer".to_string())?;

    let expected =
        u32::from_str_radix(trailer.trim(), 16).map_err(|e| format!("bad crc32 trailer: {}", e))?;
    let actual = record_crc(payload.as_bytes());
    if actual != expected {
        return Err(format!(
            "crc32 mismatch: expected {:#010x}, got {:#010x}",
            expected, actual
        ));
    }

    Ok(&sealed[..payload.len()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_bytes_format() {
        let sum = checksum_bytes(b"hello");
        assert!(is_valid_checksum(&sum));
        assert_eq!(
            sum,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_digest_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c1.tar");
        let data = vec![7u8; 200_000];
        std::fs::write(&path, &data).unwrap();

        let digest = digest_file(&path).unwrap();
        assert_eq!(digest.size_bytes, 200_000);
        assert_eq!(digest.checksum, checksum_bytes(&data));
    }

    #[test]
    fn test_invalid_checksums() {
        assert!(!is_valid_checksum(""));
        assert!(!is_valid_checksum("md5:abcd"));
        assert!(!is_valid_checksum("sha256:xyz"));
    }

    #[test]
    fn test_record_seal_roundtrip() {
        let payload = br#"{"state":"Captured"}"#;
        let sealed = seal_record(payload);
        assert_eq!(unseal_record(&sealed).unwrap(), payload);
    }

    #[test]
    fn test_record_torn_write_detected() {
        let sealed = seal_record(br#"{"state":"Captured"}"#);
        let mut torn = sealed.clone();
        torn[3] ^= 0x01;
        assert!(unseal_record(&torn).is_err());

        let truncated = &sealed[..10];
        assert!(unseal_record(truncated).is_err());
    }
}
