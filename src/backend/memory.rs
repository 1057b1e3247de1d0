//! In-process backend for tests and dry development.
//!
//! Stores objects in a `BTreeMap`, supports every optional capability, and
//! can inject scripted failures or misreport digests so that retry,
//! integrity, and cleanup paths can be exercised deterministically.

use crate::backend::{Backend, ByteStream, Capabilities, MultipartUpload, PutOptions};
use crate::error::{Error, ErrorKind, Result};
use crate::hash::MultiHasher;
use crate::object::{Directory, Entry, HashKind, Object, UNKNOWN_SIZE};
use crate::path;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    List,
    Stat,
    Open,
    Put,
    UploadPart,
    Complete,
    Delete,
    Mkdir,
    Rmdir,
    Rename,
    Copy,
    SetModTime,
}

#[derive(Debug)]
struct Fault {
    op: Op,
    path_fragment: Option<String>,
    kind: ErrorKind,
    remaining: u32,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    mod_time: DateTime<Utc>,
    mime_type: Option<String>,
    hashes: HashMap<HashKind, String>,
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<String, StoredObject>,
    dirs: BTreeSet<String>,
}

struct Inner {
    name: String,
    caps: Capabilities,
    hash_kinds: Vec<HashKind>,
    state: Mutex<State>,
    faults: Mutex<Vec<Fault>>,
    wrong_hash: Mutex<HashSet<String>>,
    open_sessions: AtomicUsize,
}

impl Inner {
    fn check_fault(&self, op: Op, path: &str) -> Result<()> {
        let mut faults = self.faults.lock().unwrap();
        for fault in faults.iter_mut() {
            if fault.op != op || fault.remaining == 0 {
                continue;
            }
            if let Some(fragment) = &fault.path_fragment {
                if !path.contains(fragment.as_str()) {
                    continue;
                }
            }
            fault.remaining -= 1;
            return Err(Error::new(fault.kind, "injected fault")
                .with_path(path));
        }
        Ok(())
    }

    fn store(&self, target: &str, data: Bytes, opts: &PutOptions) -> Object {
        let mut hasher = MultiHasher::new(&self.hash_kinds);
        hasher.update(&data);
        let hashes = hasher.finalize();

        let stored = StoredObject {
            data,
            mod_time: opts.mod_time.unwrap_or_else(Utc::now),
            mime_type: opts.mime_type.clone(),
            hashes,
        };
        let object = self.object_for(target, &stored);
        self.state
            .lock()
            .unwrap()
            .files
            .insert(target.to_string(), stored);
        object
    }

    fn object_for(&self, target: &str, stored: &StoredObject) -> Object {
        let corrupt = self.wrong_hash.lock().unwrap().contains(target);
        let mut object = Object::new(target, stored.data.len() as i64)
            .with_mod_time(stored.mod_time);
        object.mime_type = stored.mime_type.clone();
        for (&kind, digest) in &stored.hashes {
            let digest = if corrupt { flip_digest(digest) } else { digest.clone() };
            object.hashes.insert(kind, digest);
        }
        object
    }

    fn is_dir(&self, state: &State, dir: &str) -> bool {
        if dir.is_empty() {
            return true;
        }
        if state.dirs.contains(dir) {
            return true;
        }
        let prefix = format!("{dir}/");
        state.files.range(prefix.clone()..).next().map_or(false, |(p, _)| p.starts_with(&prefix))
            || state.dirs.range(prefix.clone()..).next().map_or(false, |p| p.starts_with(&prefix))
    }
}

fn flip_digest(digest: &str) -> String {
    let mut chars: Vec<char> = digest.chars().collect();
    if let Some(first) = chars.first_mut() {
        *first = if *first == '0' { 'f' } else { '0' };
    }
    chars.into_iter().collect()
}

/// In-memory backend instance.
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new(name: &str) -> Self {
        let caps = Capabilities {
            can_stream: true,
            can_range_read: true,
            multipart: true,
            server_side_copy: true,
            server_side_move: true,
            atomic_overwrite: true,
            empty_dirs: true,
            set_mod_time: true,
            mtime_precision: std::time::Duration::from_nanos(1),
            ..Capabilities::default()
        };
        Self {
            inner: Arc::new(Inner {
                name: format!("mem:{name}"),
                caps,
                hash_kinds: vec![HashKind::Md5, HashKind::Sha256],
                state: Mutex::new(State::default()),
                faults: Mutex::new(Vec::new()),
                wrong_hash: Mutex::new(HashSet::new()),
                open_sessions: AtomicUsize::new(0),
            }),
        }
    }

    /// Adjust the advertised capabilities (test setup).
    pub fn with_caps(self, adjust: impl FnOnce(&mut Capabilities)) -> Self {
        let mut inner = Arc::try_unwrap(self.inner)
            .ok()
            .expect("with_caps before the backend is shared");
        adjust(&mut inner.caps);
        Self { inner: Arc::new(inner) }
    }

    /// Replace the supported hash kinds (test setup).
    pub fn with_hashes(self, kinds: Vec<HashKind>) -> Self {
        let mut inner = Arc::try_unwrap(self.inner)
            .ok()
            .expect("with_hashes before the backend is shared");
        inner.hash_kinds = kinds;
        Self { inner: Arc::new(inner) }
    }

    /// Insert an object directly, bypassing faults.
    pub fn seed(&self, target: &str, data: &[u8], mod_time: DateTime<Utc>) -> Object {
        let opts = PutOptions {
            mod_time: Some(mod_time),
            ..PutOptions::default()
        };
        self.inner.store(target, Bytes::copy_from_slice(data), &opts)
    }

    /// Create a directory directly, bypassing faults.
    pub fn seed_dir(&self, target: &str) {
        self.inner.state.lock().unwrap().dirs.insert(target.to_string());
    }

    /// Raw contents of an object, if present.
    pub fn contents(&self, target: &str) -> Option<Vec<u8>> {
        self.inner
            .state
            .lock()
            .unwrap()
            .files
            .get(target)
            .map(|stored| stored.data.to_vec())
    }

    /// All object paths, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        self.inner.state.lock().unwrap().files.keys().cloned().collect()
    }

    /// Snapshot of one object, if present.
    pub fn object(&self, target: &str) -> Option<Object> {
        let state = self.inner.state.lock().unwrap();
        state.files.get(target).map(|stored| self.inner.object_for(target, stored))
    }

    /// Fail the next `count` invocations of `op` (optionally only for paths
    /// containing `fragment`) with `kind`.
    pub fn inject_fault(&self, op: Op, fragment: Option<&str>, kind: ErrorKind, count: u32) {
        self.inner.faults.lock().unwrap().push(Fault {
            op,
            path_fragment: fragment.map(str::to_string),
            kind,
            remaining: count,
        });
    }

    /// Report corrupted digests for `target` from now on.
    pub fn report_wrong_hash(&self, target: &str) {
        self.inner.wrong_hash.lock().unwrap().insert(target.to_string());
    }

    /// Multi-part sessions that are neither completed nor aborted.
    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }
}

/// Registry factory.
pub fn from_config(config: &super::BackendConfig) -> Result<Arc<dyn Backend>> {
    let name = config.get("name").map(String::as_str).unwrap_or("default");
    Ok(Arc::new(MemoryBackend::new(name)))
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn caps(&self) -> &Capabilities {
        &self.inner.caps
    }

    fn hashes_supported(&self) -> &[HashKind] {
        &self.inner.hash_kinds
    }

    async fn list(&self, dir: &str) -> Result<Vec<Entry>> {
        self.inner.check_fault(Op::List, dir)?;
        let state = self.inner.state.lock().unwrap();
        if !self.inner.is_dir(&state, dir) {
            return Err(Error::dir_not_found(dir));
        }

        let mut entries = Vec::new();
        let mut seen_dirs = BTreeSet::new();
        let prefix = if dir.is_empty() { String::new() } else { format!("{dir}/") };

        for (file_path, stored) in state.files.range(prefix.clone()..) {
            let Some(rest) = file_path.strip_prefix(&prefix) else { break };
            match rest.split_once('/') {
                None => entries.push(Entry::File(self.inner.object_for(file_path, stored))),
                Some((child, _)) => {
                    seen_dirs.insert(path::join(dir, child));
                }
            }
        }
        for dir_path in state.dirs.range(prefix.clone()..) {
            let Some(rest) = dir_path.strip_prefix(prefix.as_str()) else { break };
            match rest.split_once('/') {
                None if !rest.is_empty() => {
                    seen_dirs.insert(dir_path.clone());
                }
                Some((child, _)) => {
                    seen_dirs.insert(path::join(dir, child));
                }
                None => {}
            }
        }
        for dir_path in seen_dirs {
            entries.push(Entry::Dir(Directory::new(dir_path)));
        }
        Ok(entries)
    }

    async fn stat(&self, target: &str) -> Result<Object> {
        self.inner.check_fault(Op::Stat, target)?;
        let state = self.inner.state.lock().unwrap();
        state
            .files
            .get(target)
            .map(|stored| self.inner.object_for(target, stored))
            .ok_or_else(|| Error::not_found(target))
    }

    async fn open(&self, target: &str, range: Option<Range<u64>>) -> Result<ByteStream> {
        self.inner.check_fault(Op::Open, target)?;
        let state = self.inner.state.lock().unwrap();
        let stored = state.files.get(target).ok_or_else(|| Error::not_found(target))?;
        let data = match range {
            Some(range) => {
                let start = (range.start as usize).min(stored.data.len());
                let end = (range.end as usize).min(stored.data.len());
                stored.data.slice(start..end)
            }
            None => stored.data.clone(),
        };
        Ok(Box::new(std::io::Cursor::new(data.to_vec())))
    }

    async fn put(
        &self,
        target: &str,
        mut reader: ByteStream,
        size_hint: i64,
        opts: &PutOptions,
    ) -> Result<Object> {
        self.inner.check_fault(Op::Put, target)?;
        let mut data = if size_hint == UNKNOWN_SIZE {
            Vec::new()
        } else {
            Vec::with_capacity(size_hint as usize)
        };
        reader.read_to_end(&mut data).await?;
        Ok(self.inner.store(target, Bytes::from(data), opts))
    }

    async fn multipart_put(
        &self,
        target: &str,
        _size: i64,
        opts: &PutOptions,
    ) -> Result<Arc<dyn MultipartUpload>> {
        if !self.inner.caps.multipart {
            return Err(Error::unsupported("multipart upload"));
        }
        self.inner.check_fault(Op::Put, target)?;
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemorySession {
            inner: Arc::clone(&self.inner),
            target: target.to_string(),
            opts: opts.clone(),
            parts: Mutex::new(BTreeMap::new()),
            settled: AtomicUsize::new(0),
        }))
    }

    async fn delete(&self, target: &str) -> Result<()> {
        self.inner.check_fault(Op::Delete, target)?;
        let mut state = self.inner.state.lock().unwrap();
        state
            .files
            .remove(target)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(target))
    }

    async fn mkdir(&self, target: &str) -> Result<()> {
        self.inner.check_fault(Op::Mkdir, target)?;
        if !target.is_empty() {
            self.inner.state.lock().unwrap().dirs.insert(target.to_string());
        }
        Ok(())
    }

    async fn rmdir(&self, target: &str) -> Result<()> {
        self.inner.check_fault(Op::Rmdir, target)?;
        let mut state = self.inner.state.lock().unwrap();
        let prefix = format!("{target}/");
        let has_children = state.files.keys().any(|p| p.starts_with(&prefix))
            || state.dirs.iter().any(|p| p.starts_with(&prefix));
        if has_children {
            return Err(Error::no_retry("directory not empty").with_path(target));
        }
        state.dirs.remove(target);
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.inner.check_fault(Op::Rename, src)?;
        let mut state = self.inner.state.lock().unwrap();
        let stored = state.files.remove(src).ok_or_else(|| Error::not_found(src))?;
        state.files.insert(dst.to_string(), stored);
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        self.inner.check_fault(Op::Copy, src)?;
        let mut state = self.inner.state.lock().unwrap();
        let stored = state.files.get(src).cloned().ok_or_else(|| Error::not_found(src))?;
        state.files.insert(dst.to_string(), stored);
        Ok(())
    }

    async fn set_mod_time(&self, target: &str, mod_time: DateTime<Utc>) -> Result<()> {
        self.inner.check_fault(Op::SetModTime, target)?;
        let mut state = self.inner.state.lock().unwrap();
        let stored = state
            .files
            .get_mut(target)
            .ok_or_else(|| Error::not_found(target))?;
        stored.mod_time = mod_time;
        Ok(())
    }
}

struct MemorySession {
    inner: Arc<Inner>,
    target: String,
    opts: PutOptions,
    parts: Mutex<BTreeMap<usize, Bytes>>,
    /// 0 = open, 1 = settled; completing or aborting twice is a bug upstream.
    settled: AtomicUsize,
}

impl MemorySession {
    fn settle(&self) -> bool {
        let already = self.settled.swap(1, Ordering::SeqCst);
        if already == 0 {
            self.inner.open_sessions.fetch_sub(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl MultipartUpload for MemorySession {
    async fn upload_part(&self, index: usize, data: Bytes) -> Result<()> {
        self.inner.check_fault(Op::UploadPart, &self.target)?;
        self.parts.lock().unwrap().insert(index, data);
        Ok(())
    }

    async fn complete(&self) -> Result<Object> {
        self.inner.check_fault(Op::Complete, &self.target)?;
        if !self.settle() {
            return Err(Error::no_retry("multipart session already settled"));
        }
        let parts = std::mem::take(&mut *self.parts.lock().unwrap());
        let mut data = Vec::new();
        for (_, part) in parts {
            data.extend_from_slice(&part);
        }
        Ok(self.inner.store(&self.target, Bytes::from(data), &self.opts))
    }

    async fn abort(&self) -> Result<()> {
        self.settle();
        self.parts.lock().unwrap().clear();
        Ok(())
    }
}
