//! Copies one source object to a destination path.
//!
//! Strategy order: skip when already equal, server-side copy within one
//! remote, multi-part for large objects, streaming single PUT otherwise.
//! Non-atomic destinations are written through a `.partial` temp name and
//! renamed on success, so a failed transfer never leaves a partial object
//! visible at its final path. Whole-transfer retries restart from the
//! precondition check; checksum mismatches get their own, separate budget.

pub mod multipart;

use crate::accounting::{TransferId, TransferState};
use crate::backend::{same_remote, Backend, ByteStream, PutOptions};
use crate::context::EngineContext;
use crate::error::{Error, ErrorKind, Result};
use crate::hash::MultiHasher;
use crate::object::Object;
use crate::planner::{equal, EqualityPolicy};
use crate::retry;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Result of one transfer request.
#[derive(Debug)]
pub enum TransferOutcome {
    /// The object was copied; the snapshot describes the destination.
    Copied(Object),
    /// The destination was already up to date.
    Skipped(&'static str),
}

enum CopyResult {
    UpToDate,
    Committed(Object),
}

/// Copy `src_obj` to `dst_path` on `dst`.
pub async fn transfer(
    ctx: &EngineContext,
    src: &Arc<dyn Backend>,
    src_obj: &Object,
    dst: &Arc<dyn Backend>,
    dst_path: &str,
) -> Result<TransferOutcome> {
    let policy = EqualityPolicy::new(&ctx.opts, src.as_ref(), dst.as_ref());

    // Precondition: a fresh stat, not the (possibly stale) listing.
    if let Some(existing) = stat_optional(ctx, dst, dst_path).await? {
        if equal(src_obj, &existing, &policy) {
            ctx.accountant.check();
            ctx.reporter.skipped(dst_path, "already up to date");
            return Ok(TransferOutcome::Skipped("already up to date"));
        }
    }

    let id = ctx.accountant.start_transfer(dst_path, src_obj.size);
    ctx.reporter.transfer_started(dst_path, src_obj.size);
    let started = Instant::now();

    let mut checksum_budget = ctx.opts.max_checksum_retries;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        ctx.accountant.add_attempt(id);
        ctx.accountant.set_state(id, TransferState::Running);

        match copy_attempt(ctx, id, src, src_obj, dst, dst_path, &policy, attempt > 1).await {
            Ok(CopyResult::UpToDate) => {
                ctx.accountant.transfer_done(id);
                ctx.reporter.skipped(dst_path, "already up to date");
                return Ok(TransferOutcome::Skipped("already up to date"));
            }
            Ok(CopyResult::Committed(object)) => {
                ctx.accountant.transfer_done(id);
                ctx.reporter.transfer_finished(
                    dst_path,
                    object.size.max(0) as u64,
                    started.elapsed(),
                    policy.shared_kind.is_some(),
                );
                return Ok(TransferOutcome::Copied(object));
            }
            Err(err) if err.kind() == ErrorKind::Cancelled => {
                ctx.accountant.transfer_aborted(id);
                return Err(err);
            }
            Err(err) if err.kind() == ErrorKind::Checksum && checksum_budget > 0 => {
                checksum_budget -= 1;
                tracing::warn!(path = dst_path, error = %err, "checksum mismatch, re-running transfer");
            }
            Err(err) if err.is_retryable() && attempt < ctx.opts.retries.max(1) => {
                tracing::warn!(path = dst_path, attempt, error = %err, "transfer attempt failed, restarting");
                let delay = retry::backoff_delay(ctx.opts.retry_base, ctx.opts.retry_cap, attempt - 1);
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        ctx.accountant.transfer_aborted(id);
                        return Err(Error::cancelled());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => {
                ctx.accountant.transfer_failed(id, &err);
                ctx.reporter
                    .transfer_failed(dst_path, err.kind(), err.message(), attempt);
                return Err(err);
            }
        }
    }
}

async fn stat_optional(
    ctx: &EngineContext,
    backend: &Arc<dyn Backend>,
    target: &str,
) -> Result<Option<Object>> {
    match retry::with_retries(ctx, "stat", || backend.stat(target)).await {
        Ok(object) => Ok(Some(object)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

#[allow(clippy::too_many_arguments)]
async fn copy_attempt(
    ctx: &EngineContext,
    id: TransferId,
    src: &Arc<dyn Backend>,
    src_obj: &Object,
    dst: &Arc<dyn Backend>,
    dst_path: &str,
    policy: &EqualityPolicy,
    recheck: bool,
) -> Result<CopyResult> {
    if recheck {
        if let Some(existing) = stat_optional(ctx, dst, dst_path).await? {
            if equal(src_obj, &existing, policy) {
                return Ok(CopyResult::UpToDate);
            }
        }
    }

    if ctx.opts.server_side
        && same_remote(src, dst)
        && dst.caps().server_side_copy
        && src_obj.path != dst_path
    {
        return server_side_copy(ctx, src_obj, dst, dst_path, policy).await;
    }

    stream_copy(ctx, id, src, src_obj, dst, dst_path, policy).await
}

/// Same-remote copy without moving bytes through the engine; verified by a
/// stat afterwards.
async fn server_side_copy(
    ctx: &EngineContext,
    src_obj: &Object,
    dst: &Arc<dyn Backend>,
    dst_path: &str,
    policy: &EqualityPolicy,
) -> Result<CopyResult> {
    retry::with_retries(ctx, "copy", || dst.copy(&src_obj.path, dst_path)).await?;
    let committed = retry::with_retries(ctx, "stat", || dst.stat(dst_path)).await?;

    if src_obj.has_known_size() && committed.has_known_size() && committed.size != src_obj.size {
        let _ = dst.delete(dst_path).await;
        return Err(Error::checksum(format!(
            "server-side copy size mismatch: {} != {}",
            committed.size, src_obj.size
        ))
        .with_path(dst_path));
    }
    if let Some(kind) = policy.shared_kind {
        if let (Some(want), Some(got)) = (src_obj.hash(kind), committed.hash(kind)) {
            if want != got {
                let _ = dst.delete(dst_path).await;
                return Err(Error::checksum(format!(
                    "server-side copy {kind} mismatch"
                ))
                .with_path(dst_path));
            }
        }
    }
    tracing::debug!(path = dst_path, "server-side copy");
    Ok(CopyResult::Committed(committed))
}

fn temp_name(dst_path: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{dst_path}.{suffix}.partial")
}

#[allow(clippy::too_many_arguments)]
async fn stream_copy(
    ctx: &EngineContext,
    id: TransferId,
    src: &Arc<dyn Backend>,
    src_obj: &Object,
    dst: &Arc<dyn Backend>,
    dst_path: &str,
    policy: &EqualityPolicy,
) -> Result<CopyResult> {
    let use_temp = !dst.caps().atomic_overwrite;
    let target = if use_temp {
        temp_name(dst_path)
    } else {
        dst_path.to_string()
    };

    let (mut committed, src_digest) =
        match write_object(ctx, id, src, src_obj, dst, &target, policy).await {
            Ok(pair) => pair,
            Err(err) => {
                if use_temp {
                    let _ = dst.delete(&target).await;
                }
                return Err(err);
            }
        };

    // Integrity: the digest computed while reading the source must match
    // what the destination reports for the committed object.
    ctx.accountant.set_state(id, TransferState::Checking);
    if let (Some(kind), Some(src_digest)) = (policy.shared_kind, src_digest.as_deref()) {
        let dst_digest = match committed.hash(kind) {
            Some(digest) => Some(digest.to_string()),
            None => stat_optional(ctx, dst, &target)
                .await?
                .and_then(|o| o.hash(kind).map(str::to_string)),
        };
        match dst_digest {
            Some(dst_digest) if dst_digest != src_digest => {
                let _ = dst.delete(&target).await;
                return Err(Error::checksum(format!(
                    "{kind} mismatch after upload: {src_digest} != {dst_digest}"
                ))
                .with_path(dst_path));
            }
            Some(_) => {}
            None => {
                tracing::debug!(path = dst_path, kind = %kind, "destination reported no digest to verify");
            }
        }
    }

    if use_temp {
        if let Err(err) = publish(ctx, dst, &target, dst_path).await {
            let _ = dst.delete(&target).await;
            return Err(err);
        }
        committed.path = dst_path.to_string();
    }

    // Propagate the source mtime where the destination allows it.
    if let Some(mod_time) = src_obj.mod_time {
        if dst.caps().set_mod_time {
            if committed.mod_time != Some(mod_time) {
                match retry::with_retries(ctx, "set_mod_time", || {
                    dst.set_mod_time(dst_path, mod_time)
                })
                .await
                {
                    Ok(()) => committed.mod_time = Some(mod_time),
                    Err(err) if err.kind() == ErrorKind::Unsupported => {}
                    Err(err) => {
                        tracing::warn!(path = dst_path, error = %err, "failed to set modification time");
                    }
                }
            }
        } else {
            tracing::debug!(path = dst_path, "destination keeps its own modification time");
        }
    }

    Ok(CopyResult::Committed(committed))
}

/// Move the committed temp object to its final name.
async fn publish(
    ctx: &EngineContext,
    dst: &Arc<dyn Backend>,
    temp_path: &str,
    final_path: &str,
) -> Result<()> {
    match retry::with_retries(ctx, "rename", || dst.rename(temp_path, final_path)).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::Unsupported && dst.caps().server_side_copy => {
            retry::with_retries(ctx, "copy", || dst.copy(temp_path, final_path)).await?;
            if let Err(cleanup) = dst.delete(temp_path).await {
                tracing::warn!(path = temp_path, error = %cleanup, "failed to remove temp object");
            }
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Stream the source into `target`, hashing and throttling along the way.
/// Returns the committed destination snapshot and the digest of the bytes
/// actually read from the source.
async fn write_object(
    ctx: &EngineContext,
    id: TransferId,
    src: &Arc<dyn Backend>,
    src_obj: &Object,
    dst: &Arc<dyn Backend>,
    target: &str,
    policy: &EqualityPolicy,
) -> Result<(Object, Option<String>)> {
    let reader = retry::with_retries(ctx, "open", || src.open(&src_obj.path, None)).await?;
    let mut hasher = match policy.shared_kind {
        Some(kind) => MultiHasher::new(&[kind]),
        None => MultiHasher::empty(),
    };
    let put_opts = PutOptions::from_object(src_obj);

    let use_multipart = src_obj.has_known_size()
        && src_obj.size as u64 >= ctx.opts.multipart_threshold
        && dst.caps().multipart;

    let object = if use_multipart {
        multipart::upload(
            ctx,
            id,
            reader,
            dst,
            target,
            src_obj.size,
            &put_opts,
            &mut hasher,
        )
        .await?
    } else {
        let (object, total) =
            single_put(ctx, id, reader, dst, target, src_obj.size, &put_opts, &mut hasher).await?;
        if src_obj.has_known_size() && total != src_obj.size as u64 {
            let _ = dst.delete(target).await;
            return Err(Error::transient(format!(
                "short read from source: got {total} of {} bytes",
                src_obj.size
            ))
            .with_path(&src_obj.path));
        }
        object
    };

    if src_obj.has_known_size() && object.has_known_size() && object.size != src_obj.size {
        let _ = dst.delete(target).await;
        return Err(Error::checksum(format!(
            "size changed during transfer: expected {}, committed {}",
            src_obj.size, object.size
        ))
        .with_path(&src_obj.path));
    }

    let digests = hasher.finalize();
    let src_digest = policy.shared_kind.and_then(|kind| digests.get(&kind).cloned());

    // The listing may have carried a source digest; disagreement means the
    // object changed while we read it.
    if let (Some(kind), Some(read_digest)) = (policy.shared_kind, src_digest.as_deref()) {
        if let Some(declared) = src_obj.hash(kind) {
            if declared != read_digest {
                let _ = dst.delete(target).await;
                return Err(Error::transient("source changed during transfer")
                    .with_path(&src_obj.path));
            }
        }
    }

    Ok((object, src_digest))
}

#[allow(clippy::too_many_arguments)]
async fn single_put(
    ctx: &EngineContext,
    id: TransferId,
    mut reader: ByteStream,
    dst: &Arc<dyn Backend>,
    target: &str,
    size: i64,
    put_opts: &PutOptions,
    hasher: &mut MultiHasher,
) -> Result<(Object, u64)> {
    let (read_half, mut write_half) = tokio::io::duplex(256 * 1024);
    let put_fut = dst.put(target, Box::new(read_half), size, put_opts);

    let pump_ctx = ctx;
    let hasher_ref = &mut *hasher;
    let pump_fut = async move {
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            pump_ctx.check_cancelled()?;
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            pump_ctx.limiter.throttle(n, &pump_ctx.cancel).await?;
            hasher_ref.update(&buf[..n]);
            pump_ctx.accountant.record_bytes(id, n as u64);
            write_half
                .write_all(&buf[..n])
                .await
                .map_err(|_| Error::transient("destination closed the stream"))?;
            total += n as u64;
        }
        write_half
            .shutdown()
            .await
            .map_err(|_| Error::transient("destination closed the stream"))?;
        drop(write_half);
        Ok::<u64, Error>(total)
    };

    let (put_result, pump_result) = tokio::join!(put_fut, pump_fut);
    match (put_result, pump_result) {
        (_, Err(pump_err)) => {
            // The destination may have committed a truncated object.
            let _ = dst.delete(target).await;
            Err(pump_err)
        }
        (Err(put_err), Ok(_)) => Err(put_err),
        (Ok(object), Ok(total)) => Ok((object, total)),
    }
}
