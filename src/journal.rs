//! Resume journal sidecar.
//!
//! Records every completed transfer as one JSON line keyed by the
//! (source, destination, root) triple. A later run over the same triple
//! skips objects whose source snapshot still matches their record, saving
//! the equality re-check. The engine itself stays stateless; deleting the
//! journal file is always safe.

use crate::error::{Error, Result};
use crate::object::{HashKind, Object};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    path: String,
    size: i64,
    mod_time: Option<DateTime<Utc>>,
    hash_kind: Option<HashKind>,
    digest: Option<String>,
}

/// Append-only journal of completed transfers.
pub struct Journal {
    state: Mutex<JournalState>,
}

struct JournalState {
    file: std::fs::File,
    entries: HashMap<String, Record>,
}

/// Build the journal key for one sync triple.
pub fn journal_key(src_name: &str, dst_name: &str, root: &str) -> String {
    format!("{src_name}|{dst_name}|{root}")
}

impl Journal {
    /// Open or create the journal at `path`. A file recorded under a
    /// different key is discarded and restarted.
    pub fn open(path: &Path, key: &str) -> Result<Self> {
        let mut entries = HashMap::new();
        let mut reuse = false;

        if let Ok(existing) = std::fs::File::open(path) {
            let mut lines = std::io::BufReader::new(existing).lines();
            if let Some(Ok(first)) = lines.next() {
                if let Ok(header) = serde_json::from_str::<Header>(&first) {
                    if header.key == key {
                        reuse = true;
                        for line in lines {
                            let line = line.map_err(Error::from)?;
                            if let Ok(record) = serde_json::from_str::<Record>(&line) {
                                entries.insert(record.path.clone(), record);
                            }
                        }
                    }
                }
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(reuse)
            .write(true)
            .truncate(!reuse)
            .open(path)?;
        if !reuse {
            let header = serde_json::to_string(&Header { key: key.to_string() })
                .map_err(|e| Error::no_retry(e.to_string()))?;
            writeln!(file, "{header}")?;
            file.flush()?;
        }

        Ok(Self {
            state: Mutex::new(JournalState { file, entries }),
        })
    }

    /// Whether `obj` still matches its completed-transfer record.
    pub fn matches(&self, rel_path: &str, obj: &Object) -> bool {
        let state = self.state.lock().unwrap();
        let Some(record) = state.entries.get(rel_path) else {
            return false;
        };
        if record.size != obj.size {
            return false;
        }
        if let (Some(kind), Some(digest)) = (record.hash_kind, record.digest.as_deref()) {
            if let Some(current) = obj.hash(kind) {
                return current == digest;
            }
        }
        match (record.mod_time, obj.mod_time) {
            (Some(recorded), Some(current)) => recorded == current,
            _ => false,
        }
    }

    /// Record a completed transfer of `obj`.
    pub fn record(&self, rel_path: &str, obj: &Object, kind: Option<HashKind>) -> Result<()> {
        let record = Record {
            path: rel_path.to_string(),
            size: obj.size,
            mod_time: obj.mod_time,
            hash_kind: kind,
            digest: kind.and_then(|k| obj.hash(k).map(str::to_string)),
        };
        let line = serde_json::to_string(&record).map_err(|e| Error::no_retry(e.to_string()))?;

        let mut state = self.state.lock().unwrap();
        writeln!(state.file, "{line}")?;
        state.file.flush()?;
        state.entries.insert(record.path.clone(), record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Journal sidecar location for test and CLI convenience.
pub fn default_journal_path(base: &Path) -> PathBuf {
    base.join("driftsync-journal.jsonl")
}
