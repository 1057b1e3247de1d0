//! Local filesystem backend.
//!
//! Rooted at a directory; remote paths map directly beneath it. Writes are
//! not atomic with respect to overwrite, so the transfer engine routes them
//! through temp names.

use crate::backend::{Backend, ByteStream, Capabilities, PutOptions};
use crate::error::{Error, Result};
use crate::hash::MultiHasher;
use crate::object::{Directory, Entry, HashKind, Object, UNKNOWN_SIZE};
use crate::path;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const HASH_KINDS: [HashKind; 4] = [
    HashKind::Md5,
    HashKind::Sha1,
    HashKind::Sha256,
    HashKind::Xxh3,
];

pub struct LocalBackend {
    name: String,
    root: PathBuf,
    caps: Capabilities,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            name: format!("local:{}", root.display()),
            root,
            caps: Capabilities::local(),
        }
    }

    fn full_path(&self, target: &str) -> PathBuf {
        if target.is_empty() {
            self.root.clone()
        } else {
            self.root.join(target)
        }
    }
}

/// Registry factory; requires a `root` key.
pub fn from_config(config: &super::BackendConfig) -> Result<Arc<dyn Backend>> {
    let root = config
        .get("root")
        .ok_or_else(|| Error::fatal("local backend requires a 'root' setting"))?;
    Ok(Arc::new(LocalBackend::new(root)))
}

fn entry_mod_time(metadata: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    metadata.modified().ok().map(DateTime::<Utc>::from)
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn caps(&self) -> &Capabilities {
        &self.caps
    }

    fn hashes_supported(&self) -> &[HashKind] {
        &HASH_KINDS
    }

    async fn list(&self, dir: &str) -> Result<Vec<Entry>> {
        let full = self.full_path(dir);
        let mut read_dir = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| Error::from(e).with_path(dir))?;

        let mut entries = Vec::new();
        while let Some(dirent) = read_dir.next_entry().await? {
            let name = match dirent.file_name().into_string() {
                Ok(name) => name,
                Err(_) => {
                    tracing::warn!(dir, "skipping entry with non-UTF-8 name");
                    continue;
                }
            };
            let metadata = dirent.metadata().await?;
            let entry_path = path::join(dir, &name);

            if metadata.is_dir() {
                let mut directory = Directory::new(entry_path);
                directory.mod_time = entry_mod_time(&metadata);
                entries.push(Entry::Dir(directory));
            } else {
                let mut object = Object::new(entry_path, metadata.len() as i64);
                object.mod_time = entry_mod_time(&metadata);
                entries.push(Entry::File(object));
            }
        }
        Ok(entries)
    }

    async fn stat(&self, target: &str) -> Result<Object> {
        let metadata = tokio::fs::metadata(self.full_path(target))
            .await
            .map_err(|e| Error::from(e).with_path(target))?;
        if metadata.is_dir() {
            return Err(Error::not_found(target));
        }
        let mut object = Object::new(target, metadata.len() as i64);
        object.mod_time = entry_mod_time(&metadata);
        Ok(object)
    }

    async fn open(&self, target: &str, range: Option<Range<u64>>) -> Result<ByteStream> {
        let mut file = tokio::fs::File::open(self.full_path(target))
            .await
            .map_err(|e| Error::from(e).with_path(target))?;
        match range {
            Some(range) => {
                file.seek(std::io::SeekFrom::Start(range.start)).await?;
                Ok(Box::new(file.take(range.end - range.start)))
            }
            None => Ok(Box::new(file)),
        }
    }

    async fn put(
        &self,
        target: &str,
        mut reader: ByteStream,
        size_hint: i64,
        opts: &PutOptions,
    ) -> Result<Object> {
        let full = self.full_path(target);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&full)
            .await
            .map_err(|e| Error::from(e).with_path(target))?;
        let mut hasher = MultiHasher::new(&HASH_KINDS);
        let mut written = 0u64;
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            written += n as u64;
        }
        file.flush().await?;

        if size_hint != UNKNOWN_SIZE && size_hint as u64 != written {
            return Err(Error::no_retry(format!(
                "short write: expected {size_hint} bytes, wrote {written}"
            ))
            .with_path(target));
        }

        let std_file = file.into_std().await;
        if let Some(mod_time) = opts.mod_time {
            std_file
                .set_modified(SystemTime::from(mod_time))
                .map_err(|e| Error::from(e).with_path(target))?;
        }
        drop(std_file);

        let mut object = Object::new(target, written as i64);
        object.mod_time = Some(opts.mod_time.unwrap_or_else(Utc::now));
        object.hashes = hasher.finalize();
        Ok(object)
    }

    async fn delete(&self, target: &str) -> Result<()> {
        tokio::fs::remove_file(self.full_path(target))
            .await
            .map_err(|e| Error::from(e).with_path(target))
    }

    async fn mkdir(&self, target: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.full_path(target))
            .await
            .map_err(|e| Error::from(e).with_path(target))
    }

    async fn rmdir(&self, target: &str) -> Result<()> {
        tokio::fs::remove_dir(self.full_path(target))
            .await
            .map_err(|e| Error::from(e).with_path(target))
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let to = self.full_path(dst);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(self.full_path(src), to)
            .await
            .map_err(|e| Error::from(e).with_path(src))
    }

    async fn set_mod_time(&self, target: &str, mod_time: DateTime<Utc>) -> Result<()> {
        let file = std::fs::File::open(self.full_path(target))
            .map_err(|e| Error::from(e).with_path(target))?;
        file.set_modified(SystemTime::from(mod_time))
            .map_err(|e| Error::from(e).with_path(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mod_time(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_put_list_stat_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let be = LocalBackend::new(tmp.path());

        let reader: ByteStream = Box::new(std::io::Cursor::new(b"hello world".to_vec()));
        let opts = PutOptions {
            mod_time: Some(mod_time(0)),
            ..PutOptions::default()
        };
        let put = be.put("dir/a.txt", reader, 11, &opts).await.unwrap();
        assert_eq!(put.size, 11);
        assert_eq!(
            put.hash(HashKind::Md5).unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );

        let root = be.list("").await.unwrap();
        assert_eq!(root.len(), 1);
        assert!(root[0].is_dir());

        let stat = be.stat("dir/a.txt").await.unwrap();
        assert_eq!(stat.size, 11);
        // stat is cheap: no digest computation.
        assert!(stat.hashes.is_empty());
        assert_eq!(stat.mod_time.unwrap(), mod_time(0));

        be.delete("dir/a.txt").await.unwrap();
        assert_eq!(
            be.stat("dir/a.txt").await.unwrap_err().kind(),
            crate::error::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_ranged_open() {
        let tmp = tempfile::tempdir().unwrap();
        let be = LocalBackend::new(tmp.path());
        let reader: ByteStream = Box::new(std::io::Cursor::new(b"0123456789".to_vec()));
        be.put("r.bin", reader, 10, &PutOptions::default()).await.unwrap();

        let mut ranged = be.open("r.bin", Some(2..6)).await.unwrap();
        let mut out = Vec::new();
        ranged.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"2345");
    }

    #[tokio::test]
    async fn test_rename_and_rmdir() {
        let tmp = tempfile::tempdir().unwrap();
        let be = LocalBackend::new(tmp.path());
        let reader: ByteStream = Box::new(std::io::Cursor::new(b"x".to_vec()));
        be.put("d/a", reader, 1, &PutOptions::default()).await.unwrap();

        be.rename("d/a", "e/b").await.unwrap();
        assert!(be.stat("e/b").await.is_ok());

        be.rmdir("d").await.unwrap();
        assert!(be.rmdir("e").await.is_err()); // not empty
    }

    #[tokio::test]
    async fn test_short_write_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let be = LocalBackend::new(tmp.path());
        let reader: ByteStream = Box::new(std::io::Cursor::new(b"abc".to_vec()));
        let err = be.put("s.bin", reader, 10, &PutOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("short write"));
    }
}
