//! Unified storage backend trait for all storage providers.
//!
//! The engine sees remotes exclusively through [`Backend`]; capability
//! flags are data the planner and transfer engine read to pick strategies,
//! never type parameters.

pub mod local;
pub mod memory;
pub mod object_store;

use crate::error::{Error, Result};
use crate::object::{Entry, HashKind, Object};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Streaming byte source handed between backends and the transfer engine.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Static description of what a remote can do.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Names compare equal regardless of case.
    pub case_insensitive: bool,
    /// Reads and writes stream; no full-object buffering required.
    pub can_stream: bool,
    /// `open` honors a byte range.
    pub can_range_read: bool,
    /// Session-based multi-part upload is offered.
    pub multipart: bool,
    /// Same-remote copy without moving bytes through the engine.
    pub server_side_copy: bool,
    /// Same-remote rename/move.
    pub server_side_move: bool,
    /// `put` over an existing object leaves the old content visible until
    /// the new content is committed.
    pub atomic_overwrite: bool,
    /// Directories exist independently of their contents.
    pub empty_dirs: bool,
    /// Modification times can be set after upload.
    pub set_mod_time: bool,
    /// Granularity of stored modification times.
    pub mtime_precision: Duration,
    /// Maximum length of one path component, when the remote enforces one.
    pub max_filename_len: Option<usize>,
    /// `/` separates directories rather than being part of object names.
    pub slash_is_separator: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            case_insensitive: false,
            can_stream: false,
            can_range_read: false,
            multipart: false,
            server_side_copy: false,
            server_side_move: false,
            atomic_overwrite: false,
            empty_dirs: false,
            set_mod_time: false,
            mtime_precision: Duration::from_secs(1),
            max_filename_len: None,
            slash_is_separator: true,
        }
    }
}

impl Capabilities {
    /// Local filesystem capabilities.
    pub fn local() -> Self {
        Self {
            can_stream: true,
            can_range_read: true,
            server_side_move: true,
            empty_dirs: true,
            set_mod_time: true,
            mtime_precision: Duration::from_nanos(100),
            case_insensitive: cfg!(any(windows, target_os = "macos")),
            ..Self::default()
        }
    }

    /// Typical object store (S3-like) capabilities.
    pub fn object_store() -> Self {
        Self {
            can_stream: true,
            can_range_read: true,
            atomic_overwrite: true,
            mtime_precision: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

/// Metadata applied when writing an object.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub mod_time: Option<DateTime<Utc>>,
    pub mime_type: Option<String>,
    pub storage_class: Option<String>,
}

impl PutOptions {
    /// Carry over the metadata of a source object.
    pub fn from_object(obj: &Object) -> Self {
        Self {
            mod_time: obj.mod_time,
            mime_type: obj.mime_type.clone(),
            storage_class: obj.storage_class.clone(),
        }
    }
}

/// An open multi-part upload session.
///
/// Parts may be uploaded concurrently and in any order; `complete` commits
/// them in index order. A session that is neither completed nor aborted
/// leaks server-side state, so the transfer engine always settles it.
#[async_trait]
pub trait MultipartUpload: Send + Sync {
    async fn upload_part(&self, index: usize, data: Bytes) -> Result<()>;

    /// Commit all uploaded parts as the final object.
    async fn complete(&self) -> Result<Object>;

    /// Discard the session and any uploaded parts.
    async fn abort(&self) -> Result<()>;
}

/// Unified storage backend trait for all storage providers.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Instance label for logs, e.g. `"s3:bucket"` or `"local:/srv/data"`.
    fn name(&self) -> &str;

    fn caps(&self) -> &Capabilities;

    /// Hash kinds this remote can report server-side.
    fn hashes_supported(&self) -> &[HashKind];

    /// List one directory level. `NotFound` when the directory is absent.
    async fn list(&self, dir: &str) -> Result<Vec<Entry>>;

    /// Describe one object. `NotFound` when absent.
    async fn stat(&self, path: &str) -> Result<Object>;

    /// Open a streaming reader, optionally over a byte range
    /// (honored iff `caps.can_range_read`).
    async fn open(&self, path: &str, range: Option<Range<u64>>) -> Result<ByteStream>;

    /// Write an object from a stream. `size_hint` is the expected length or
    /// [`crate::object::UNKNOWN_SIZE`].
    async fn put(
        &self,
        path: &str,
        reader: ByteStream,
        size_hint: i64,
        opts: &PutOptions,
    ) -> Result<Object>;

    /// Start a multi-part upload session. Offered iff `caps.multipart`.
    async fn multipart_put(
        &self,
        path: &str,
        size: i64,
        opts: &PutOptions,
    ) -> Result<Arc<dyn MultipartUpload>> {
        let _ = (path, size, opts);
        Err(Error::unsupported("multipart upload"))
    }

    async fn delete(&self, path: &str) -> Result<()>;

    async fn mkdir(&self, path: &str) -> Result<()>;

    async fn rmdir(&self, path: &str) -> Result<()>;

    /// Server-side move. Offered iff `caps.server_side_move`.
    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let _ = (src, dst);
        Err(Error::unsupported("rename"))
    }

    /// Server-side copy. Offered iff `caps.server_side_copy`.
    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let _ = (src, dst);
        Err(Error::unsupported("copy"))
    }

    /// Set an object's modification time. Offered iff `caps.set_mod_time`.
    async fn set_mod_time(&self, path: &str, mod_time: DateTime<Utc>) -> Result<()> {
        let _ = (path, mod_time);
        Err(Error::unsupported("set_mod_time"))
    }
}

/// Whether two handles point at the same remote instance. Server-side
/// copy/move is only attempted within one instance.
pub fn same_remote(a: &Arc<dyn Backend>, b: &Arc<dyn Backend>) -> bool {
    Arc::ptr_eq(a, b)
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Backend").field(&self.name()).finish()
    }
}

/// Key-value configuration for a backend factory.
pub type BackendConfig = HashMap<String, String>;

type Factory = Arc<dyn Fn(&BackendConfig) -> Result<Arc<dyn Backend>> + Send + Sync>;

/// Maps scheme names to backend factories. Built once at startup from the
/// built-in drivers; callers may register more.
pub struct Registry {
    factories: HashMap<String, Factory>,
}

impl Registry {
    /// A registry with every built-in driver registered.
    pub fn with_builtin() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("local", |config| local::from_config(config));
        registry.register("memory", |config| memory::from_config(config));
        for scheme in object_store::SCHEMES {
            registry.register(scheme, move |config| {
                object_store::from_config(scheme, config)
            });
        }
        registry
    }

    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&BackendConfig) -> Result<Arc<dyn Backend>> + Send + Sync + 'static,
    {
        self.factories.insert(scheme.to_string(), Arc::new(factory));
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<_> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Instantiate a backend for `scheme` from its configuration.
    pub fn create(&self, scheme: &str, config: &BackendConfig) -> Result<Arc<dyn Backend>> {
        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| Error::fatal(format!("unknown backend scheme '{scheme}'")))?;
        factory(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_builtin_schemes() {
        let registry = Registry::with_builtin();
        let schemes = registry.schemes();
        assert!(schemes.contains(&"local".to_string()));
        assert!(schemes.contains(&"memory".to_string()));
        assert!(schemes.contains(&"s3".to_string()));
        assert!(registry.create("nope", &BackendConfig::new()).is_err());
    }

    #[test]
    fn test_same_remote_is_identity() {
        let a: Arc<dyn Backend> = Arc::new(memory::MemoryBackend::new("a"));
        let b: Arc<dyn Backend> = Arc::new(memory::MemoryBackend::new("b"));
        assert!(same_remote(&a, &a.clone()));
        assert!(!same_remote(&a, &b));
    }
}
