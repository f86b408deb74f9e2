// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Digest primitives composed by the verifiers.
//!
//! The engine never hashes anything other than a concatenation of byte
//! strings: a block's bytes for a leaf hash, or two digests for a chain link
//! or tree parent. [`ContentHasher::hash`] takes the parts separately so
//! callers never have to allocate the concatenation.

use crate::error::{AuthflowError, Result};
use bytes::Bytes;
use sha2::Digest;
use std::fmt::Debug;
use std::sync::Arc;

pub trait ContentHasher: Send + Sync + Debug {
    /// Node-style algorithm name, as it appears in algorithm identifiers.
    fn name(&self) -> &str;

    /// Width of every digest this hasher produces.
    fn output_len(&self) -> usize;

    /// Digest of the concatenation of `parts`.
    fn hash(&self, parts: &[&[u8]]) -> Bytes;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sha2Hasher {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

fn digest_parts<D: Digest>(parts: &[&[u8]]) -> Bytes {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    Bytes::copy_from_slice(&hasher.finalize())
}

impl ContentHasher for Sha2Hasher {
    fn name(&self) -> &str {
        match self {
            Sha2Hasher::Sha224 => "sha224",
            Sha2Hasher::Sha256 => "sha256",
            Sha2Hasher::Sha384 => "sha384",
            Sha2Hasher::Sha512 => "sha512",
        }
    }

    fn output_len(&self) -> usize {
        match self {
            Sha2Hasher::Sha224 => 28,
            Sha2Hasher::Sha256 => 32,
            Sha2Hasher::Sha384 => 48,
            Sha2Hasher::Sha512 => 64,
        }
    }

    fn hash(&self, parts: &[&[u8]]) -> Bytes {
        match self {
            Sha2Hasher::Sha224 => digest_parts::<sha2::Sha224>(parts),
            Sha2Hasher::Sha256 => digest_parts::<sha2::Sha256>(parts),
            Sha2Hasher::Sha384 => digest_parts::<sha2::Sha384>(parts),
            Sha2Hasher::Sha512 => digest_parts::<sha2::Sha512>(parts),
        }
    }
}

/// Resolve a hash name from an algorithm identifier.
pub fn hasher_by_name(name: &str) -> Result<Arc<dyn ContentHasher>> {
    let hasher = match name.to_ascii_lowercase().as_str() {
        "sha224" => Sha2Hasher::Sha224,
        "sha256" => Sha2Hasher::Sha256,
        "sha384" => Sha2Hasher::Sha384,
        "sha512" => Sha2Hasher::Sha512,
        _ => {
            return Err(AuthflowError::UnsupportedAlgorithm(format!(
                "unknown hash {name}"
            )));
        }
    };
    Ok(Arc::new(hasher))
}

/// Short hex rendering for log lines and error messages.
pub(crate) fn short_hex(digest: &[u8]) -> String {
    let shown = digest.len().min(8);
    let mut s = hex::encode(&digest[..shown]);
    if shown < digest.len() {
        s.push_str("..");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_matches_single_shot() {
        let hasher = Sha2Hasher::Sha256;
        let split = hasher.hash(&[&b"hello "[..], &b"world"[..]]);
        let whole = hasher.hash(&[&b"hello world"[..]]);
        assert_eq!(split, whole);
        assert_eq!(
            hex::encode(&whole),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_output_lengths() {
        for name in ["sha224", "sha256", "sha384", "sha512"] {
            let hasher = hasher_by_name(name).unwrap();
            assert_eq!(hasher.hash(&[&b"x"[..]]).len(), hasher.output_len());
            assert_eq!(hasher.name(), name);
        }
    }

    #[test]
    fn test_unknown_hash_rejected() {
        assert!(matches!(
            hasher_by_name("md5"),
            Err(AuthflowError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_short_hex() {
        assert_eq!(short_hex(&[0xab, 0xcd]), "abcd");
        assert_eq!(short_hex(&[0u8; 32]), "0000000000000000..");
    }
}
