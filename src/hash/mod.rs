//! Streaming multi-digest hashing.
//!
//! A [`MultiHasher`] computes every requested [`HashKind`] in one pass over
//! the transferred bytes, so integrity checking never re-reads the source.

mod quickxor;

pub use quickxor::QuickXor;

use crate::object::HashKind;
use md5::{Digest as Md5Digest, Md5};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256};
use std::collections::HashMap;
use whirlpool::{Digest as WhirlpoolDigest, Whirlpool};
use xxhash_rust::xxh3::Xxh3;

/// Trait for hash algorithm implementations
pub trait Hasher: Send {
    /// Update the hasher with new data
    fn update(&mut self, data: &[u8]);

    /// Finalize the hash and return the raw digest
    fn finalize(self: Box<Self>) -> Vec<u8>;

    /// Get the output size in bytes
    fn output_size(&self) -> usize;
}

// MD5 wrapper
struct Md5Wrapper(Md5);

impl Hasher for Md5Wrapper {
    fn update(&mut self, data: &[u8]) {
        Md5Digest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        Md5Digest::finalize(self.0).to_vec()
    }

    fn output_size(&self) -> usize {
        16
    }
}

// SHA1 wrapper
struct Sha1Wrapper(Sha1);

impl Hasher for Sha1Wrapper {
    fn update(&mut self, data: &[u8]) {
        Sha1Digest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        Sha1Digest::finalize(self.0).to_vec()
    }

    fn output_size(&self) -> usize {
        20
    }
}

// SHA-256 wrapper
struct Sha256Wrapper(Sha256);

impl Hasher for Sha256Wrapper {
    fn update(&mut self, data: &[u8]) {
        Sha2Digest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        Sha2Digest::finalize(self.0).to_vec()
    }

    fn output_size(&self) -> usize {
        32
    }
}

// Whirlpool wrapper
struct WhirlpoolWrapper(Whirlpool);

impl Hasher for WhirlpoolWrapper {
    fn update(&mut self, data: &[u8]) {
        WhirlpoolDigest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        WhirlpoolDigest::finalize(self.0).to_vec()
    }

    fn output_size(&self) -> usize {
        64
    }
}

// CRC32 wrapper
struct Crc32Wrapper(crc32fast::Hasher);

impl Hasher for Crc32Wrapper {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_be_bytes().to_vec()
    }

    fn output_size(&self) -> usize {
        4
    }
}

// XXH3 64-bit wrapper
struct Xxh3Wrapper(Xxh3);

impl Hasher for Xxh3Wrapper {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        self.0.digest().to_be_bytes().to_vec()
    }

    fn output_size(&self) -> usize {
        8
    }
}

// XXH3 128-bit wrapper
struct Xxh128Wrapper(Xxh3);

impl Hasher for Xxh128Wrapper {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        self.0.digest128().to_be_bytes().to_vec()
    }

    fn output_size(&self) -> usize {
        16
    }
}

// QuickXOR wrapper
struct QuickXorWrapper(QuickXor);

impl Hasher for QuickXorWrapper {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_vec()
    }

    fn output_size(&self) -> usize {
        20
    }
}

/// Construct a hasher for one kind.
pub fn new_hasher(kind: HashKind) -> Box<dyn Hasher> {
    match kind {
        HashKind::Md5 => Box::new(Md5Wrapper(Md5::new())),
        HashKind::Sha1 => Box::new(Sha1Wrapper(Sha1::new())),
        HashKind::Sha256 => Box::new(Sha256Wrapper(Sha256::new())),
        HashKind::Crc32 => Box::new(Crc32Wrapper(crc32fast::Hasher::new())),
        HashKind::Xxh3 => Box::new(Xxh3Wrapper(Xxh3::new())),
        HashKind::Xxh3_128 => Box::new(Xxh128Wrapper(Xxh3::new())),
        HashKind::QuickXor => Box::new(QuickXorWrapper(QuickXor::new())),
        HashKind::Whirlpool => Box::new(WhirlpoolWrapper(Whirlpool::new())),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Computes several digests over one stream of updates.
pub struct MultiHasher {
    hashers: Vec<(HashKind, Box<dyn Hasher>)>,
}

impl MultiHasher {
    pub fn new(kinds: &[HashKind]) -> Self {
        Self {
            hashers: kinds.iter().map(|&k| (k, new_hasher(k))).collect(),
        }
    }

    /// A hasher that computes nothing; `update` is a no-op.
    pub fn empty() -> Self {
        Self { hashers: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.hashers.is_empty()
    }

    pub fn kinds(&self) -> Vec<HashKind> {
        self.hashers.iter().map(|(k, _)| *k).collect()
    }

    pub fn update(&mut self, data: &[u8]) {
        for (_, hasher) in &mut self.hashers {
            hasher.update(data);
        }
    }

    /// Finish all digests, as lowercase hex keyed by kind.
    pub fn finalize(self) -> HashMap<HashKind, String> {
        self.hashers
            .into_iter()
            .map(|(kind, hasher)| (kind, to_hex(&hasher.finalize())))
            .collect()
    }
}

/// One-shot digest of an in-memory buffer.
pub fn hash_bytes(kind: HashKind, data: &[u8]) -> String {
    let mut hasher = new_hasher(kind);
    hasher.update(data);
    to_hex(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            hash_bytes(HashKind::Md5, b"hello world"),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
        assert_eq!(
            hash_bytes(HashKind::Sha1, b"hello world"),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
        assert_eq!(
            hash_bytes(HashKind::Sha256, b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(hash_bytes(HashKind::Crc32, b"hello world"), "0d4a1185");
        assert_eq!(
            hash_bytes(HashKind::Whirlpool, b""),
            "19fa61d75522a4669b44e39c1d2e1726c530232130d407f89afee0964997f7a7\
             3e83be698b288febcf88e3e03c4f0757ea8964e59b63d93708b138cc42a66eb3"
        );
    }

    #[test]
    fn test_digest_widths() {
        for kind in HashKind::ALL {
            let digest = hash_bytes(kind, b"abc");
            assert_eq!(digest.len(), kind.hex_len(), "width mismatch for {kind}");
        }
    }

    #[test]
    fn test_multi_hasher_matches_single_pass() {
        let kinds = [HashKind::Md5, HashKind::Sha256, HashKind::Xxh3];
        let data = b"some moderately sized test payload".repeat(100);

        let mut multi = MultiHasher::new(&kinds);
        for chunk in data.chunks(13) {
            multi.update(chunk);
        }
        let digests = multi.finalize();

        for kind in kinds {
            assert_eq!(digests[&kind], hash_bytes(kind, &data));
        }
    }

    #[test]
    fn test_empty_multi_hasher() {
        let mut multi = MultiHasher::empty();
        assert!(multi.is_empty());
        multi.update(b"ignored");
        assert!(multi.finalize().is_empty());
    }
}
