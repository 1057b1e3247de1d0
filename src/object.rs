//! Uniform representation of remote entries.
//!
//! An [`Object`] is an immutable snapshot of a file-like entity as reported
//! by a backend; refreshing any attribute means fetching a new snapshot.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

/// Size value used when a backend cannot report one (streaming objects).
pub const UNKNOWN_SIZE: i64 = -1;

/// A hash algorithm a backend may support server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum HashKind {
    Md5,
    Sha1,
    Sha256,
    Crc32,
    Xxh3,
    Xxh3_128,
    QuickXor,
    Whirlpool,
}

impl HashKind {
    /// All kinds, ordered by preference for integrity checking: collision
    /// resistance first, then digest width.
    pub const ALL: [HashKind; 8] = [
        HashKind::Sha256,
        HashKind::Whirlpool,
        HashKind::Sha1,
        HashKind::Md5,
        HashKind::QuickXor,
        HashKind::Xxh3_128,
        HashKind::Xxh3,
        HashKind::Crc32,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HashKind::Md5 => "md5",
            HashKind::Sha1 => "sha1",
            HashKind::Sha256 => "sha256",
            HashKind::Crc32 => "crc32",
            HashKind::Xxh3 => "xxh3",
            HashKind::Xxh3_128 => "xxh128",
            HashKind::QuickXor => "quickxor",
            HashKind::Whirlpool => "whirlpool",
        }
    }

    /// Hex digest width for this kind.
    pub fn hex_len(self) -> usize {
        match self {
            HashKind::Md5 => 32,
            HashKind::Sha1 => 40,
            HashKind::Sha256 => 64,
            HashKind::Crc32 => 8,
            HashKind::Xxh3 => 16,
            HashKind::Xxh3_128 => 32,
            HashKind::QuickXor => 40,
            HashKind::Whirlpool => 128,
        }
    }

    /// The most preferred kind present in both sets, if any.
    pub fn preferred_common(a: &[HashKind], b: &[HashKind]) -> Option<HashKind> {
        HashKind::ALL
            .iter()
            .copied()
            .find(|kind| a.contains(kind) && b.contains(kind))
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable descriptor of a file-like entity on a remote.
#[derive(Debug, Clone)]
pub struct Object {
    /// Remote path, relative to the backend root.
    pub path: String,
    /// Size in bytes; [`UNKNOWN_SIZE`] when the backend cannot tell.
    pub size: i64,
    /// Modification time, if the backend records one.
    pub mod_time: Option<DateTime<Utc>>,
    /// Server-side digests, lowercase hex, keyed by kind.
    pub hashes: HashMap<HashKind, String>,
    pub mime_type: Option<String>,
    pub storage_class: Option<String>,
}

impl Object {
    pub fn new(path: impl Into<String>, size: i64) -> Self {
        Self {
            path: path.into(),
            size,
            mod_time: None,
            hashes: HashMap::new(),
            mime_type: None,
            storage_class: None,
        }
    }

    pub fn with_mod_time(mut self, mod_time: DateTime<Utc>) -> Self {
        self.mod_time = Some(mod_time);
        self
    }

    pub fn with_hash(mut self, kind: HashKind, digest: impl Into<String>) -> Self {
        self.hashes.insert(kind, digest.into());
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    /// The digest of `kind`, if this snapshot carries it.
    pub fn hash(&self, kind: HashKind) -> Option<&str> {
        self.hashes.get(&kind).map(String::as_str)
    }

    pub fn has_known_size(&self) -> bool {
        self.size >= 0
    }

    /// The final path component.
    pub fn name(&self) -> &str {
        crate::path::name(&self.path)
    }
}

/// A directory on a remote. Contents are enumerated lazily through
/// [`crate::backend::Backend::list`], never held by reference.
#[derive(Debug, Clone)]
pub struct Directory {
    pub path: String,
    /// Number of entries, when the backend reports it.
    pub count: Option<u64>,
    /// Total size of contents, when the backend reports it.
    pub size: Option<i64>,
    pub mod_time: Option<DateTime<Utc>>,
}

impl Directory {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            count: None,
            size: None,
            mod_time: None,
        }
    }

    pub fn name(&self) -> &str {
        crate::path::name(&self.path)
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone)]
pub enum Entry {
    File(Object),
    Dir(Directory),
}

impl Entry {
    pub fn path(&self) -> &str {
        match self {
            Entry::File(o) => &o.path,
            Entry::Dir(d) => &d.path,
        }
    }

    pub fn name(&self) -> &str {
        crate::path::name(self.path())
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Dir(_))
    }

    pub fn as_file(&self) -> Option<&Object> {
        match self {
            Entry::File(o) => Some(o),
            Entry::Dir(_) => None,
        }
    }
}
