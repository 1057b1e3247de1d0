//! Lockstep walk of two remote trees.
//!
//! Source and destination are listed one directory level at a time, both
//! sides concurrently; the two listings are merged by (case-normalized)
//! name into [`Pair`]s and the walk descends into matched directories in
//! order, so pairs arrive in one deterministic total order. A bounded
//! channel provides back-pressure: memory stays proportional to tree depth
//! times fanout, not tree size.

use crate::backend::Backend;
use crate::context::EngineContext;
use crate::error::{Error, ErrorKind, Result};
use crate::object::Entry;
use crate::path;
use crate::retry;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A matched or half-matched (source, destination) tuple. At least one side
/// is present.
#[derive(Debug, Clone)]
pub struct Pair {
    /// Path relative to the walk root, taken from the source side when
    /// present.
    pub path: String,
    pub src: Option<Entry>,
    pub dst: Option<Entry>,
    /// Two names on a case-sensitive side collided under case folding.
    pub case_clash: bool,
}

/// The parallel walker.
pub struct March {
    ctx: EngineContext,
    src: Arc<dyn Backend>,
    dst: Arc<dyn Backend>,
    root: String,
    case_fold: bool,
}

impl March {
    pub fn new(
        ctx: EngineContext,
        src: Arc<dyn Backend>,
        dst: Arc<dyn Backend>,
        root: impl Into<String>,
    ) -> Self {
        let case_fold = src.caps().case_insensitive || dst.caps().case_insensitive;
        Self {
            ctx,
            src,
            dst,
            root: root.into(),
            case_fold,
        }
    }

    /// Start walking; pairs stream out of the returned receiver. A fatal
    /// error (missing source root, cancellation) arrives as the final item.
    pub fn run(self) -> mpsc::Receiver<Result<Pair>> {
        let (tx, rx) = mpsc::channel(self.ctx.opts.march_queue);
        tokio::spawn(async move {
            if let Err(err) = self.level(String::new(), true, true, true, &tx).await {
                let _ = tx.send(Err(err)).await;
            }
        });
        rx
    }

    fn key(&self, name: &str) -> String {
        if self.case_fold {
            path::fold(name)
        } else {
            name.to_string()
        }
    }

    async fn list_side(
        &self,
        backend: &Arc<dyn Backend>,
        present: bool,
        dir_abs: &str,
        required: bool,
    ) -> Result<Option<Vec<Entry>>> {
        if !present {
            return Ok(Some(Vec::new()));
        }
        let listed = retry::with_retries(&self.ctx, "list", || backend.list(dir_abs)).await;
        match listed {
            Ok(entries) => Ok(Some(entries)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if required {
                    Err(Error::dir_not_found(dir_abs))
                } else {
                    tracing::debug!(dir = dir_abs, backend = backend.name(), "directory vanished mid-walk");
                    Ok(Some(Vec::new()))
                }
            }
            Err(err) => {
                // A failed listing poisons the whole subtree: acting on a
                // partial view could delete objects that still exist.
                tracing::warn!(dir = dir_abs, backend = backend.name(), error = %err, "listing failed; skipping subtree");
                self.ctx.accountant.record_error(err.kind());
                Ok(None)
            }
        }
    }

    /// Sort one side by comparison key and collect keys that collide on a
    /// case-sensitive remote.
    fn prepare(
        &self,
        mut entries: Vec<Entry>,
        side_case_sensitive: bool,
        clashes: &mut HashSet<String>,
    ) -> Vec<(String, Entry)> {
        let mut keyed: Vec<(String, Entry)> = entries
            .drain(..)
            .map(|entry| (self.key(entry.name()), entry))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name().cmp(b.1.name())));

        if self.case_fold && side_case_sensitive {
            for window in keyed.windows(2) {
                if window[0].0 == window[1].0 && window[0].1.name() != window[1].1.name() {
                    clashes.insert(window[0].0.clone());
                }
            }
        }
        keyed.dedup_by(|a, b| a.0 == b.0);
        keyed
    }

    fn level<'a>(
        &'a self,
        dir_rel: String,
        src_present: bool,
        dst_present: bool,
        is_root: bool,
        tx: &'a mpsc::Sender<Result<Pair>>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.ctx.check_cancelled()?;

            let dir_abs = path::join(&self.root, &dir_rel);
            let (src_listed, dst_listed) = tokio::join!(
                self.list_side(&self.src, src_present, &dir_abs, is_root),
                self.list_side(&self.dst, dst_present, &dir_abs, false),
            );
            let (Some(src_entries), Some(dst_entries)) = (src_listed?, dst_listed?) else {
                return Ok(());
            };

            let mut clashes = HashSet::new();
            let src_sensitive = !self.src.caps().case_insensitive;
            let dst_sensitive = !self.dst.caps().case_insensitive;
            let src_sorted = self.prepare(src_entries, src_sensitive, &mut clashes);
            let dst_sorted = self.prepare(dst_entries, dst_sensitive, &mut clashes);

            let mut i = 0;
            let mut j = 0;
            while i < src_sorted.len() || j < dst_sorted.len() {
                self.ctx.check_cancelled()?;

                let take_src = match (src_sorted.get(i), dst_sorted.get(j)) {
                    (Some((sk, _)), Some((dk, _))) => {
                        if sk == dk {
                            None // matched below
                        } else {
                            Some(sk < dk)
                        }
                    }
                    (Some(_), None) => Some(true),
                    (None, Some(_)) => Some(false),
                    (None, None) => unreachable!(),
                };

                let (key, src_entry, dst_entry) = match take_src {
                    None => {
                        let (key, src_entry) = &src_sorted[i];
                        let (_, dst_entry) = &dst_sorted[j];
                        i += 1;
                        j += 1;
                        (key.clone(), Some(src_entry.clone()), Some(dst_entry.clone()))
                    }
                    Some(true) => {
                        let (key, src_entry) = &src_sorted[i];
                        i += 1;
                        (key.clone(), Some(src_entry.clone()), None)
                    }
                    Some(false) => {
                        let (key, dst_entry) = &dst_sorted[j];
                        j += 1;
                        (key.clone(), None, Some(dst_entry.clone()))
                    }
                };

                let name = src_entry
                    .as_ref()
                    .or(dst_entry.as_ref())
                    .map(|entry| entry.name().to_string())
                    .unwrap_or_default();
                let pair_path = path::join(&dir_rel, &name);
                let case_clash = clashes.contains(&key);

                let src_is_dir = src_entry.as_ref().map(Entry::is_dir);
                let dst_is_dir = dst_entry.as_ref().map(Entry::is_dir);

                let pair = Pair {
                    path: pair_path.clone(),
                    src: src_entry,
                    dst: dst_entry,
                    case_clash,
                };
                if tx.send(Ok(pair)).await.is_err() {
                    return Err(Error::cancelled());
                }

                // Descend unless the pair is irreconcilable: a type clash
                // (file vs dir) or a case clash gets no action, so its
                // subtree must not produce any either.
                let type_clash = matches!((src_is_dir, dst_is_dir), (Some(true), Some(false)) | (Some(false), Some(true)));
                if case_clash || type_clash {
                    continue;
                }
                let descend_src = src_is_dir == Some(true);
                let descend_dst = dst_is_dir == Some(true);
                if descend_src || descend_dst {
                    self.level(pair_path, descend_src, descend_dst, false, tx)
                        .await?;
                }
            }
            Ok(())
        })
    }
}
