//! Chunked parallel fetch: range-split one resource across the worker pool.
//!
//! Probes the remote size, plans near-equal chunks, downloads each with its
//! own ranged GET writing at its offset into a shared temp file, then
//! publishes the result with an atomic rename. The first chunk error aborts
//! the remaining chunks and removes the temp file; either the complete file
//! appears, or nothing does.

use anyhow::{anyhow, bail, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::chunk::{self, Chunk};
use crate::fetch::{self, FetchError};
use crate::pool::WorkerPool;
use crate::probe;
use crate::storage::ChunkWriter;

/// Downloads `url` into `output_path` using up to `chunks` concurrent ranged
/// GETs on `pool`. Returns the number of bytes written.
///
/// Blocks the calling thread until every chunk has finished; call it from
/// outside the pool, or the wait can starve the workers it needs.
pub fn fetch_parallel(
    url: &str,
    output_path: &Path,
    chunks: usize,
    timeout: Duration,
    pool: &WorkerPool,
) -> Result<u64> {
    let total = probe::content_length(url, timeout)?;
    if total == 0 {
        bail!("remote resource {} is empty", url);
    }

    let plan = chunk::plan(total, chunks.max(1));
    tracing::info!(
        "fetching {} ({} bytes) in {} chunk(s)",
        url,
        total,
        plan.len()
    );

    let writer = ChunkWriter::create(output_path, total)?;
    let abort = Arc::new(AtomicBool::new(false));
    let first_error: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));
    let done = Arc::new((Mutex::new(0usize), Condvar::new()));

    for chunk in plan.iter().copied() {
        let url = url.to_string();
        let writer = writer.clone();
        let abort = Arc::clone(&abort);
        let first_error = Arc::clone(&first_error);
        let done = Arc::clone(&done);
        pool.enqueue(move || {
            if !abort.load(Ordering::Acquire) {
                if let Err(e) = fetch_chunk(&url, chunk, &writer, &abort, timeout) {
                    abort.store(true, Ordering::Release);
                    let mut slot = first_error.lock().unwrap();
                    if slot.is_none() {
                        tracing::error!(
                            "chunk {}-{} of {} failed: {:#}",
                            chunk.start,
                            chunk.end,
                            url,
                            e
                        );
                        *slot = Some(e);
                    }
                }
            }
            let (count, ready) = &*done;
            *count.lock().unwrap() += 1;
            ready.notify_one();
        });
    }

    // completion latch
    {
        let (count, ready) = &*done;
        let mut finished = count.lock().unwrap();
        while *finished < plan.len() {
            finished = ready.wait(finished).unwrap();
        }
    }

    if let Some(e) = first_error.lock().unwrap().take() {
        if let Err(cleanup) = writer.discard() {
            tracing::warn!("temp cleanup after failed fetch: {:#}", cleanup);
        }
        return Err(e);
    }

    writer.sync()?;
    writer.finalize(output_path)?;
    tracing::info!("fetched {} -> {}", url, output_path.display());
    Ok(total)
}

fn fetch_chunk(
    url: &str,
    chunk: Chunk,
    writer: &ChunkWriter,
    abort: &AtomicBool,
    timeout: Duration,
) -> Result<()> {
    let mut offset = chunk.start;
    let result = fetch::fetch(
        url,
        chunk.start,
        chunk.end - 1,
        timeout,
        |data| {
            if abort.load(Ordering::Acquire) {
                return Ok(0);
            }
            writer.write_at(offset, data)?;
            offset += data.len() as u64;
            Ok(data.len())
        },
        |_total, _received| !abort.load(Ordering::Acquire),
    );

    match result {
        Ok(()) => {
            let written = offset - chunk.start;
            // a server ignoring Range answers 200 with the full body; detect
            // anything that is not exactly this chunk's bytes
            if written != chunk.len() {
                bail!(
                    "chunk {}-{}: wrote {} of {} bytes",
                    chunk.start,
                    chunk.end,
                    written,
                    chunk.len()
                );
            }
            Ok(())
        }
        Err(FetchError::Aborted) => Err(anyhow!(
            "chunk {}-{} aborted after sibling failure",
            chunk.start,
            chunk.end
        )),
        Err(e) => Err(anyhow::Error::new(e)),
    }
}
