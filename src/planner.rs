//! Decides what to do with every pair the tree walk yields.
//!
//! Equality is capability-aware: sizes first, then a digest of the
//! preferred shared hash kind, then modification times within tolerance.
//! Deletes are ordered per the configured delete mode; the default defers
//! them until every copy succeeded, so a failed sync leaves the
//! destination a superset of the source, never missing data.

use crate::accounting::Summary;
use crate::backend::Backend;
use crate::config::DeleteMode;
use crate::context::EngineContext;
use crate::error::{Error, ErrorKind, Result};
use crate::journal::{journal_key, Journal};
use crate::march::{March, Pair};
use crate::object::{Entry, HashKind, Object};
use crate::path;
use crate::retry;
use crate::scheduler::Scheduler;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// The planner's decision for one pair. Paths are relative to the sync
/// root.
#[derive(Debug, Clone)]
pub enum Action {
    Copy { src: Object, dest: String },
    Update { src: Object, dest: String },
    Mkdir { path: String },
    Delete { path: String, object: Option<Object> },
    Rmdir { path: String },
    Rename { from: String, to: String },
    Skip { path: String, reason: String },
    Conflict { path: String, reason: String },
}

impl Action {
    pub fn path(&self) -> &str {
        match self {
            Action::Copy { dest, .. } | Action::Update { dest, .. } => dest,
            Action::Mkdir { path }
            | Action::Delete { path, .. }
            | Action::Rmdir { path }
            | Action::Skip { path, .. }
            | Action::Conflict { path, .. } => path,
            Action::Rename { to, .. } => to,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Action::Copy { .. } => "copy",
            Action::Update { .. } => "update",
            Action::Mkdir { .. } => "mkdir",
            Action::Delete { .. } => "delete",
            Action::Rmdir { .. } => "rmdir",
            Action::Rename { .. } => "rename",
            Action::Skip { .. } => "skip",
            Action::Conflict { .. } => "conflict",
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Action::Skip { .. })
    }

    fn is_delete_like(&self) -> bool {
        matches!(self, Action::Delete { .. } | Action::Rmdir { .. })
    }
}

/// How two object snapshots are compared.
#[derive(Debug, Clone)]
pub struct EqualityPolicy {
    pub size_only: bool,
    pub ignore_times: bool,
    /// Effective mtime tolerance: the configured window or the coarser of
    /// the two remotes' precisions, whichever is larger.
    pub tolerance: Duration,
    /// Preferred hash kind both remotes support, if any.
    pub shared_kind: Option<HashKind>,
}

impl EqualityPolicy {
    pub fn new(opts: &crate::config::SyncOptions, src: &dyn Backend, dst: &dyn Backend) -> Self {
        let tolerance = opts
            .mtime_tolerance
            .max(src.caps().mtime_precision)
            .max(dst.caps().mtime_precision);
        Self {
            size_only: opts.size_only,
            ignore_times: opts.ignore_times,
            tolerance,
            shared_kind: HashKind::preferred_common(src.hashes_supported(), dst.hashes_supported()),
        }
    }
}

/// Capability-aware equality between a source and destination snapshot.
pub fn equal(src: &Object, dst: &Object, policy: &EqualityPolicy) -> bool {
    if src.has_known_size() && dst.has_known_size() && src.size != dst.size {
        return false;
    }
    if policy.size_only {
        return true;
    }
    if policy.ignore_times {
        return false;
    }
    if let Some(kind) = policy.shared_kind {
        if let (Some(a), Some(b)) = (src.hash(kind), dst.hash(kind)) {
            return a == b;
        }
    }
    match (src.mod_time, dst.mod_time) {
        (Some(a), Some(b)) => {
            let delta = if a >= b { a - b } else { b - a };
            delta.to_std().map(|d| d <= policy.tolerance).unwrap_or(false)
        }
        _ => false,
    }
}

/// One-way copy: source objects are created or updated on the destination;
/// destination-only entries are left alone.
pub async fn copy(
    ctx: &EngineContext,
    src: Arc<dyn Backend>,
    dst: Arc<dyn Backend>,
    root: &str,
) -> Result<Summary> {
    run(ctx, src, dst, root, false).await
}

/// One-way sync: like [`copy`], but destination-only entries are deleted
/// per the configured delete mode.
pub async fn sync(
    ctx: &EngineContext,
    src: Arc<dyn Backend>,
    dst: Arc<dyn Backend>,
    root: &str,
) -> Result<Summary> {
    run(ctx, src, dst, root, true).await
}

fn classify(
    pair: &Pair,
    policy: &EqualityPolicy,
    delete_extra: bool,
    journal: Option<&Journal>,
) -> Option<Action> {
    if pair.case_clash {
        return Some(Action::Conflict {
            path: pair.path.clone(),
            reason: "name collision on case-insensitive remote".to_string(),
        });
    }

    match (&pair.src, &pair.dst) {
        (Some(Entry::File(src_obj)), None) => {
            if let Some(journal) = journal {
                if journal.matches(&pair.path, src_obj) {
                    return Some(Action::Skip {
                        path: pair.path.clone(),
                        reason: "recorded in resume journal".to_string(),
                    });
                }
            }
            Some(Action::Copy {
                src: src_obj.clone(),
                dest: pair.path.clone(),
            })
        }
        (Some(Entry::File(src_obj)), Some(Entry::File(dst_obj))) => {
            if let Some(journal) = journal {
                if journal.matches(&pair.path, src_obj) {
                    return Some(Action::Skip {
                        path: pair.path.clone(),
                        reason: "recorded in resume journal".to_string(),
                    });
                }
            }
            if equal(src_obj, dst_obj, policy) {
                Some(Action::Skip {
                    path: pair.path.clone(),
                    reason: "unchanged".to_string(),
                })
            } else {
                Some(Action::Update {
                    src: src_obj.clone(),
                    dest: pair.path.clone(),
                })
            }
        }
        (Some(Entry::File(_)), Some(Entry::Dir(_))) => Some(Action::Conflict {
            path: pair.path.clone(),
            reason: "source file would replace destination directory".to_string(),
        }),
        (Some(Entry::Dir(_)), Some(Entry::File(_))) => Some(Action::Conflict {
            path: pair.path.clone(),
            reason: "source directory would replace destination file".to_string(),
        }),
        (Some(Entry::Dir(_)), None) => Some(Action::Mkdir {
            path: pair.path.clone(),
        }),
        (Some(Entry::Dir(_)), Some(Entry::Dir(_))) => None,
        (None, Some(Entry::File(dst_obj))) => delete_extra.then(|| Action::Delete {
            path: pair.path.clone(),
            object: Some(dst_obj.clone()),
        }),
        (None, Some(Entry::Dir(_))) => delete_extra.then(|| Action::Rmdir {
            path: pair.path.clone(),
        }),
        (None, None) => unreachable!("a pair always has at least one side"),
    }
}

async fn run(
    ctx: &EngineContext,
    src: Arc<dyn Backend>,
    dst: Arc<dyn Backend>,
    root: &str,
    delete_extra: bool,
) -> Result<Summary> {
    path::validate(root)?;

    let policy = EqualityPolicy::new(&ctx.opts, src.as_ref(), dst.as_ref());
    if policy.shared_kind.is_none() && !ctx.opts.size_only {
        tracing::warn!(
            src = src.name(),
            dst = dst.name(),
            "no common hash kind, comparing by size and modification time only"
        );
    }

    let journal = match &ctx.opts.journal {
        Some(journal_path) => Some(Arc::new(Journal::open(
            journal_path,
            &journal_key(src.name(), dst.name(), root),
        )?)),
        None => None,
    };

    let dry_run = ctx.opts.dry_run;
    let materialize = ctx.opts.track_renames
        || (delete_extra && ctx.opts.delete_mode == DeleteMode::Before);
    let scheduler = if dry_run {
        None
    } else {
        Some(Scheduler::new(
            ctx.clone(),
            src.clone(),
            dst.clone(),
            root.to_string(),
            journal.clone(),
        ))
    };

    let mut deferred_deletes: Vec<Action> = Vec::new();
    let mut collected: Vec<Action> = Vec::new();
    let mut walk_error: Option<Error> = None;

    let mut pairs = March::new(ctx.clone(), src.clone(), dst.clone(), root).run();
    while let Some(item) = pairs.recv().await {
        let pair = match item {
            Ok(pair) => pair,
            Err(err) => {
                walk_error = Some(err);
                break;
            }
        };
        let Some(action) = classify(&pair, &policy, delete_extra, journal.as_deref()) else {
            continue;
        };
        ctx.reporter.planned(&action);
        if materialize {
            collected.push(action);
            continue;
        }
        if let Err(err) = dispatch(ctx, scheduler.as_ref(), &dst, root, &mut deferred_deletes, action).await
        {
            walk_error = Some(err);
            break;
        }
    }
    drop(pairs);

    if let Some(err) = walk_error {
        if let Some(scheduler) = scheduler {
            scheduler.drain().await;
        }
        if err.kind() == ErrorKind::Cancelled {
            // Cancellation still produces a final summary.
            ctx.accountant.set_cancelled();
            let summary = ctx.accountant.summary();
            ctx.reporter.summary(&summary);
            return Ok(summary);
        }
        return Err(err);
    }

    if materialize {
        let mut actions = collected;
        if ctx.opts.track_renames {
            actions = convert_renames(actions, policy.shared_kind);
        }
        if delete_extra && ctx.opts.delete_mode == DeleteMode::Before {
            let (deletes, rest): (Vec<_>, Vec<_>) =
                actions.into_iter().partition(Action::is_delete_like);
            if !dry_run {
                run_deletes_now(ctx, &dst, root, deletes).await;
            }
            actions = rest;
        }
        for action in actions {
            if let Err(err) =
                dispatch(ctx, scheduler.as_ref(), &dst, root, &mut deferred_deletes, action).await
            {
                if err.kind() != ErrorKind::Cancelled {
                    tracing::error!(error = %err, "dispatch failed");
                }
                break;
            }
        }
    }

    if let Some(scheduler) = scheduler {
        scheduler.drain().await;
    }

    if !deferred_deletes.is_empty() {
        if ctx.accountant.transfers_failed() > 0 {
            ctx.accountant.set_deletes_skipped();
            tracing::warn!(
                held = deferred_deletes.len(),
                "not deleting destination objects: there were transfer errors"
            );
        } else if ctx.cancel.is_cancelled() {
            ctx.accountant.set_deletes_skipped();
        } else if !dry_run {
            run_deletes_now(ctx, &dst, root, deferred_deletes).await;
        }
    }

    if ctx.cancel.is_cancelled() {
        ctx.accountant.set_cancelled();
    }
    let summary = ctx.accountant.summary();
    ctx.reporter.summary(&summary);
    Ok(summary)
}

/// Route one action: directories inline (they must exist before their
/// children copy), deferred deletes aside, everything else to the pools.
async fn dispatch(
    ctx: &EngineContext,
    scheduler: Option<&Scheduler>,
    dst: &Arc<dyn Backend>,
    root: &str,
    deferred_deletes: &mut Vec<Action>,
    action: Action,
) -> Result<()> {
    if action.is_delete_like() && ctx.opts.delete_mode == DeleteMode::After {
        deferred_deletes.push(action);
        return Ok(());
    }

    let Some(scheduler) = scheduler else {
        // Dry run: keep the same accounting the real run would produce for
        // decisions that touch nothing.
        match &action {
            Action::Skip { .. } => ctx.accountant.check(),
            Action::Conflict { .. } => ctx.accountant.record_error(ErrorKind::Conflict),
            _ => {}
        }
        return Ok(());
    };

    match action {
        Action::Mkdir { path: rel } => {
            make_dir(ctx, dst, root, &rel).await;
            Ok(())
        }
        other => scheduler.submit(other).await,
    }
}

/// Create one destination directory, counting failures. The planner awaits
/// this inline so a directory exists before anything copies into it; the
/// scheduler delegates here for directly submitted mkdir actions.
pub(crate) async fn make_dir(ctx: &EngineContext, dst: &Arc<dyn Backend>, root: &str, rel: &str) {
    let abs = path::join(root, rel);
    if let Err(err) = retry::with_retries(ctx, "mkdir", || dst.mkdir(&abs)).await {
        ctx.accountant.record_error(err.kind());
        tracing::error!(path = rel, error = %err, "mkdir failed");
    }
}

/// Execute deletes immediately: objects concurrently under the checker
/// budget, then directories deepest-first.
async fn run_deletes_now(
    ctx: &EngineContext,
    dst: &Arc<dyn Backend>,
    root: &str,
    actions: Vec<Action>,
) {
    let semaphore = Arc::new(Semaphore::new(ctx.opts.checkers.max(1)));
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut rmdirs: Vec<String> = Vec::new();

    for action in actions {
        match action {
            Action::Delete { path: rel, .. } => {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let worker_ctx = ctx.clone();
                let worker_dst = Arc::clone(dst);
                let abs = path::join(root, &rel);
                workers.spawn(async move {
                    let _permit = permit;
                    match retry::with_retries(&worker_ctx, "delete", || worker_dst.delete(&abs))
                        .await
                    {
                        Ok(()) => {
                            worker_ctx.accountant.delete();
                            worker_ctx.reporter.deleted(&rel);
                        }
                        Err(err) => {
                            worker_ctx.accountant.record_error(err.kind());
                            tracing::error!(path = rel.as_str(), error = %err, "delete failed");
                        }
                    }
                });
            }
            Action::Rmdir { path: rel } => rmdirs.push(rel),
            _ => {}
        }
    }
    while workers.join_next().await.is_some() {}

    rmdirs.sort_by_key(|rel| std::cmp::Reverse(path::depth(rel)));
    for rel in rmdirs {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let abs = path::join(root, &rel);
        match retry::with_retries(ctx, "rmdir", || dst.rmdir(&abs)).await {
            Ok(()) => {
                ctx.accountant.delete();
                ctx.reporter.deleted(&rel);
            }
            Err(err) => {
                tracing::warn!(path = rel.as_str(), error = %err, "could not remove directory");
            }
        }
    }
}

/// Second pass for rename tracking: a pending delete whose (size, digest)
/// matches a pending copy becomes a server-side rename instead.
fn convert_renames(actions: Vec<Action>, kind: Option<HashKind>) -> Vec<Action> {
    let Some(kind) = kind else { return actions };

    let mut candidates: HashMap<(i64, String), Vec<String>> = HashMap::new();
    for action in &actions {
        if let Action::Delete {
            path,
            object: Some(object),
        } = action
        {
            if let Some(digest) = object.hash(kind) {
                candidates
                    .entry((object.size, digest.to_string()))
                    .or_default()
                    .push(path.clone());
            }
        }
    }

    // Decide matches in copy order.
    let mut rename_sources: HashMap<String, String> = HashMap::new(); // dest -> from
    let mut consumed_deletes: HashSet<String> = HashSet::new();
    for action in &actions {
        if let Action::Copy { src, dest } = action {
            let matched = src.hash(kind).and_then(|digest| {
                candidates
                    .get_mut(&(src.size, digest.to_string()))
                    .and_then(|paths| {
                        while let Some(candidate) = paths.pop() {
                            if !consumed_deletes.contains(&candidate) {
                                return Some(candidate);
                            }
                        }
                        None
                    })
            });
            if let Some(from) = matched {
                consumed_deletes.insert(from.clone());
                rename_sources.insert(dest.clone(), from);
            }
        }
    }

    actions
        .into_iter()
        .filter_map(|action| match action {
            Action::Copy { src, dest } => match rename_sources.remove(&dest) {
                Some(from) => Some(Action::Rename { from, to: dest }),
                None => Some(Action::Copy { src, dest }),
            },
            Action::Delete { ref path, .. } if consumed_deletes.contains(path) => None,
            other => Some(other),
        })
        .collect()
}
