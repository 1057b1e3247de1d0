//! Bounded worker pools executing planner actions.
//!
//! Copy/Update go to the transfer pool, Delete/Skip and friends to the
//! checker pool, Rename to its own pool; a global semaphore caps total
//! outstanding remote operations. The action queue is bounded, so a slow
//! remote back-pressures the planner instead of ballooning memory.

use crate::backend::Backend;
use crate::context::EngineContext;
use crate::error::{Error, ErrorKind, Result};
use crate::journal::Journal;
use crate::object::HashKind;
use crate::path;
use crate::planner::Action;
use crate::retry;
use crate::transfer::{self, TransferOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

struct Pools {
    transfers: Arc<Semaphore>,
    checkers: Arc<Semaphore>,
    renamers: Arc<Semaphore>,
    global: Arc<Semaphore>,
}

/// Dispatches actions to bounded worker pools.
pub struct Scheduler {
    ctx: EngineContext,
    tx: mpsc::Sender<Action>,
    dispatcher: JoinHandle<()>,
    ticker: JoinHandle<()>,
    ticker_stop: CancellationToken,
}

impl Scheduler {
    pub fn new(
        ctx: EngineContext,
        src: Arc<dyn Backend>,
        dst: Arc<dyn Backend>,
        root: String,
        journal: Option<Arc<Journal>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Action>(ctx.opts.march_queue);
        let pools = Pools {
            transfers: Arc::new(Semaphore::new(ctx.opts.transfers.max(1))),
            checkers: Arc::new(Semaphore::new(ctx.opts.checkers.max(1))),
            renamers: Arc::new(Semaphore::new(ctx.opts.renamers().max(1))),
            global: Arc::new(Semaphore::new(ctx.opts.max_outstanding.max(1))),
        };

        let dispatcher = tokio::spawn(dispatch_loop(
            ctx.clone(),
            src,
            dst,
            root,
            journal,
            rx,
            pools,
        ));

        let ticker_stop = CancellationToken::new();
        let ticker = tokio::spawn(progress_loop(ctx.clone(), ticker_stop.clone()));

        Self {
            ctx,
            tx,
            dispatcher,
            ticker,
            ticker_stop,
        }
    }

    /// Enqueue one action; applies back-pressure when the queue is full.
    pub async fn submit(&self, action: Action) -> Result<()> {
        if self.ctx.cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        self.tx.send(action).await.map_err(|_| Error::cancelled())
    }

    /// Close the queue and wait for every worker to finish. Under
    /// cancellation the wait is bounded by `cancellation_grace`.
    pub async fn drain(self) {
        drop(self.tx);
        let mut dispatcher = self.dispatcher;
        tokio::select! {
            _ = &mut dispatcher => {}
            _ = self.ctx.cancel.cancelled() => {
                if tokio::time::timeout(self.ctx.opts.cancellation_grace, &mut dispatcher)
                    .await
                    .is_err()
                {
                    tracing::warn!("cancellation grace expired, abandoning in-flight workers");
                    dispatcher.abort();
                }
            }
        }
        self.ticker_stop.cancel();
        let _ = self.ticker.await;
    }
}

async fn dispatch_loop(
    ctx: EngineContext,
    src: Arc<dyn Backend>,
    dst: Arc<dyn Backend>,
    root: String,
    journal: Option<Arc<Journal>>,
    mut rx: mpsc::Receiver<Action>,
    pools: Pools,
) {
    let mut workers: JoinSet<()> = JoinSet::new();

    while let Some(action) = rx.recv().await {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if matches!(action, Action::Copy { .. } | Action::Update { .. })
            && ctx.transfer_limit_reached()
        {
            ctx.accountant.set_limit_reached();
            tracing::warn!(path = action.path(), "transfer limit reached, not scheduling");
            continue;
        }

        let pool = match &action {
            Action::Copy { .. } | Action::Update { .. } => &pools.transfers,
            Action::Rename { .. } => &pools.renamers,
            _ => &pools.checkers,
        };
        let pool_permit = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            permit = pool.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let global_permit = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            permit = pools.global.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let worker_ctx = ctx.clone();
        let worker_src = Arc::clone(&src);
        let worker_dst = Arc::clone(&dst);
        let worker_root = root.clone();
        let worker_journal = journal.clone();
        workers.spawn(async move {
            let _permits = (pool_permit, global_permit);
            run_action(
                worker_ctx,
                worker_src,
                worker_dst,
                worker_root,
                worker_journal,
                action,
            )
            .await;
        });

        // Reap finished workers so the set stays small.
        while workers.try_join_next().is_some() {}
    }

    while workers.join_next().await.is_some() {}
}

async fn run_action(
    ctx: EngineContext,
    src: Arc<dyn Backend>,
    dst: Arc<dyn Backend>,
    root: String,
    journal: Option<Arc<Journal>>,
    action: Action,
) {
    match action {
        Action::Copy { src: object, dest } | Action::Update { src: object, dest } => {
            // Re-check the byte budget now that earlier transfers finished.
            if ctx.transfer_limit_reached() {
                ctx.accountant.set_limit_reached();
                tracing::warn!(path = dest.as_str(), "transfer limit reached, not transferring");
                return;
            }
            run_transfer(&ctx, &src, &dst, &root, journal, object, dest).await;
        }
        Action::Delete { path: rel, .. } => {
            let abs = path::join(&root, &rel);
            match retry::with_retries(&ctx, "delete", || dst.delete(&abs)).await {
                Ok(()) => {
                    ctx.accountant.delete();
                    ctx.reporter.deleted(&rel);
                }
                Err(err) => record_failure(&ctx, &err, &rel),
            }
        }
        Action::Rmdir { path: rel } => {
            let abs = path::join(&root, &rel);
            match retry::with_retries(&ctx, "rmdir", || dst.rmdir(&abs)).await {
                Ok(()) => {
                    ctx.accountant.delete();
                    ctx.reporter.deleted(&rel);
                }
                Err(err) => {
                    // Children may have been kept on purpose (conflicts,
                    // failed deletes); an undeletable directory is not fatal.
                    tracing::warn!(path = rel.as_str(), error = %err, "could not remove directory");
                }
            }
        }
        Action::Rename { from, to } => {
            let from_abs = path::join(&root, &from);
            let to_abs = path::join(&root, &to);
            match retry::with_retries(&ctx, "rename", || dst.rename(&from_abs, &to_abs)).await {
                Ok(()) => {
                    ctx.accountant.rename();
                    tracing::info!(from = from.as_str(), to = to.as_str(), "renamed");
                }
                Err(err) => record_failure(&ctx, &err, &from),
            }
        }
        Action::Skip { path: rel, reason } => {
            ctx.accountant.check();
            ctx.reporter.skipped(&rel, &reason);
        }
        Action::Conflict { path: rel, reason } => {
            ctx.accountant.record_error(ErrorKind::Conflict);
            tracing::warn!(path = rel.as_str(), reason = reason.as_str(), "conflict, no action taken");
            ctx.reporter.skipped(&rel, &reason);
        }
        Action::Mkdir { path: rel } => {
            // The planner normally runs mkdir inline, before the
            // directory's children are queued; share its implementation
            // for actions submitted straight to the pools.
            crate::planner::make_dir(&ctx, &dst, &root, &rel).await;
        }
    }
}

async fn run_transfer(
    ctx: &EngineContext,
    src: &Arc<dyn Backend>,
    dst: &Arc<dyn Backend>,
    root: &str,
    journal: Option<Arc<Journal>>,
    object: crate::object::Object,
    dest_rel: String,
) {
    let dst_abs = path::join(root, &dest_rel);
    let mut requeued = false;
    loop {
        match transfer::transfer(ctx, src, &object, dst, &dst_abs).await {
            Ok(TransferOutcome::Copied(_)) => {
                if let Some(journal) = &journal {
                    let kind =
                        HashKind::preferred_common(src.hashes_supported(), dst.hashes_supported());
                    if let Err(err) = journal.record(&dest_rel, &object, kind) {
                        tracing::warn!(path = dest_rel.as_str(), error = %err, "journal write failed");
                    }
                }
                break;
            }
            Ok(TransferOutcome::Skipped(_)) => break,
            Err(err)
                if err.kind() == ErrorKind::Transient
                    && !requeued
                    && !ctx.cancel.is_cancelled() =>
            {
                // The whole retry budget drained on transient failures; give
                // the action one fresh pass before declaring it failed.
                tracing::warn!(path = dest_rel.as_str(), "re-queueing transfer after transient failure");
                requeued = true;
            }
            Err(err) => {
                record_failure(ctx, &err, &dest_rel);
                break;
            }
        }
    }
}

fn record_failure(ctx: &EngineContext, err: &Error, rel: &str) {
    if err.kind() == ErrorKind::Cancelled {
        ctx.accountant.set_cancelled();
        return;
    }
    ctx.accountant.record_error(err.kind());
    if err.kind() == ErrorKind::Fatal {
        ctx.accountant.set_fatal();
        ctx.cancel.cancel();
    } else if ctx.opts.fail_fast {
        ctx.cancel.cancel();
    }
    tracing::error!(path = rel, error = %err, "action failed permanently");
}

async fn progress_loop(ctx: EngineContext, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                for progress in ctx.accountant.running() {
                    ctx.reporter.transfer_progress(
                        &progress.path,
                        progress.bytes,
                        progress.bps,
                        progress.eta,
                    );
                }
            }
        }
    }
}
