//! Session-based multi-part upload.
//!
//! The source is read sequentially (so digests stay in order) while parts
//! upload concurrently, each with its own low-level retry budget. Any
//! failure aborts the session so no server-side state leaks.

use crate::accounting::TransferId;
use crate::backend::{Backend, ByteStream, MultipartUpload, PutOptions};
use crate::context::EngineContext;
use crate::error::{Error, Result};
use crate::hash::MultiHasher;
use crate::object::Object;
use crate::retry;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Read up to `size` bytes, short only at end of stream.
async fn read_chunk(reader: &mut ByteStream, size: usize) -> Result<Vec<u8>> {
    let mut chunk = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = reader.read(&mut chunk[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    chunk.truncate(filled);
    Ok(chunk)
}

/// Upload `reader` to `target` through a multi-part session.
pub async fn upload(
    ctx: &EngineContext,
    id: TransferId,
    mut reader: ByteStream,
    dst: &Arc<dyn Backend>,
    target: &str,
    size: i64,
    put_opts: &PutOptions,
    hasher: &mut MultiHasher,
) -> Result<Object> {
    let session = retry::with_retries(ctx, "multipart_put", || {
        dst.multipart_put(target, size, put_opts)
    })
    .await?;

    match upload_parts(ctx, id, &mut reader, &session, hasher).await {
        Ok(()) => {
            match retry::with_retries(ctx, "multipart_complete", || session.complete()).await {
                Ok(object) => Ok(object),
                Err(err) => {
                    if let Err(abort_err) = session.abort().await {
                        tracing::warn!(path = target, error = %abort_err, "multipart abort failed");
                    }
                    Err(err)
                }
            }
        }
        Err(err) => {
            if let Err(abort_err) = session.abort().await {
                tracing::warn!(path = target, error = %abort_err, "multipart abort failed");
            }
            Err(err)
        }
    }
}

async fn upload_parts(
    ctx: &EngineContext,
    id: TransferId,
    reader: &mut ByteStream,
    session: &Arc<dyn MultipartUpload>,
    hasher: &mut MultiHasher,
) -> Result<()> {
    let concurrency = ctx.opts.multipart_concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut uploads: JoinSet<Result<()>> = JoinSet::new();
    let mut index = 0usize;

    loop {
        ctx.check_cancelled()?;

        let chunk = read_chunk(reader, ctx.opts.multipart_chunk).await?;
        if chunk.is_empty() {
            break;
        }

        ctx.limiter.throttle(chunk.len(), &ctx.cancel).await?;
        hasher.update(&chunk);
        ctx.accountant.record_bytes(id, chunk.len() as u64);

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::cancelled())?;
        let session = Arc::clone(session);
        let part_ctx = ctx.clone();
        let data = Bytes::from(chunk);
        let part_index = index;
        index += 1;

        uploads.spawn(async move {
            let _permit = permit;
            retry::with_retries(&part_ctx, "upload_part", || {
                session.upload_part(part_index, data.clone())
            })
            .await
        });

        // Surface part failures early instead of reading the whole source.
        while let Some(joined) = uploads.try_join_next() {
            joined.map_err(|e| Error::no_retry(format!("part upload task failed: {e}")))??;
        }
    }

    while let Some(joined) = uploads.join_next().await {
        joined.map_err(|e| Error::no_retry(format!("part upload task failed: {e}")))??;
    }
    Ok(())
}
