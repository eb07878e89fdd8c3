//! Stream source for one object.
//!
//! Chunk indexes are dealt to a pool of download workers; completed chunks
//! land in an out-of-order map and `read` drains them strictly by file
//! offset. A new index is dispatched only when an emitted chunk has been
//! fully consumed, so no more than `concurrent_downloads` requests are ever
//! outstanding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{Backend, ErrorLatch};
use crate::error::Error;
use crate::status::{ProgressTicker, StatusHandle};

/// Default chunk size for downloads: 10 MB.
const DEFAULT_CHUNK_SIZE: u64 = 10_000_000;

struct Shared {
    completed: Mutex<HashMap<u64, Bytes>>,
    notify: Notify,
    latch: ErrorLatch,
}

/// Reads one object (or a byte range of it) as an ordered stream.
pub struct Reader {
    cancel: CancellationToken,
    shared: Arc<Shared>,
    dispatch: Option<mpsc::Sender<u64>>,
    workers: Vec<JoinHandle<()>>,
    nchunks: u64,
    emit: u64,
    next_dispatch: u64,
    cur: Option<Bytes>,
    closed: bool,
    #[allow(dead_code)]
    status: StatusHandle,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader").finish_non_exhaustive()
    }
}

/// Knobs for [`Reader`] construction.
#[derive(Clone, Debug)]
pub struct ReaderOptions {
    /// Bytes per ranged request.
    pub chunk_size: u64,
    /// Maximum ranged requests in flight.
    pub concurrent_downloads: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrent_downloads: 1,
        }
    }
}

impl Reader {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: Arc<Backend>,
        status: StatusHandle,
        cancel: &CancellationToken,
        bucket_name: String,
        name: String,
        opts: ReaderOptions,
        offset: u64,
        length: u64,
    ) -> Self {
        let cancel = cancel.child_token();
        let chunk_size = opts.chunk_size.max(1);
        let concurrency = opts.concurrent_downloads.max(1);
        let nchunks = length.div_ceil(chunk_size);
        status.set_total(nchunks);

        let shared = Arc::new(Shared {
            completed: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            latch: ErrorLatch::new(),
        });

        let (tx, rx) = mpsc::channel::<u64>(concurrency);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            workers.push(tokio::spawn(download_worker(
                backend.clone(),
                cancel.clone(),
                bucket_name.clone(),
                name.clone(),
                offset,
                length,
                chunk_size,
                shared.clone(),
                rx.clone(),
                status.ticker(),
            )));
        }

        // Seed the window; the channel is sized so these never block.
        let seed = concurrency.min(nchunks as usize) as u64;
        for idx in 0..seed {
            let _ = tx.try_send(idx);
        }
        debug!(object = %name, nchunks, concurrency, "reader pipeline started");

        Self {
            cancel,
            shared,
            dispatch: Some(tx),
            workers,
            nchunks,
            emit: 0,
            next_dispatch: seed,
            cur: None,
            closed: false,
            status,
        }
    }

    /// Copies the next run of in-order bytes into `out`. Returns `Ok(0)` at
    /// end of stream. Blocks while the next in-order chunk is still in
    /// flight.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize, Error> {
        if self.closed {
            return Err(Error::Cancelled);
        }
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(cur) = self.cur.as_mut() {
                if cur.is_empty() {
                    self.cur = None;
                    self.emit += 1;
                    // One chunk consumed frees one dispatch slot.
                    if self.next_dispatch < self.nchunks {
                        let idx = self.next_dispatch;
                        self.next_dispatch += 1;
                        if let Some(tx) = self.dispatch.as_ref() {
                            // A failed send means the workers died; the
                            // latch surfaces it on the next pass.
                            let _ = tx.send(idx).await;
                        }
                    }
                    continue;
                }
                let n = cur.len().min(out.len());
                out[..n].copy_from_slice(&cur[..n]);
                cur.advance(n);
                return Ok(n);
            }

            if self.emit >= self.nchunks {
                return Ok(0);
            }
            // Arm the notifier before checking state so a deposit between
            // the check and the await cannot be missed.
            let notified = self.shared.notify.notified();
            if let Some(e) = self.shared.latch.get() {
                return Err(e);
            }
            let next = self.shared.completed.lock().unwrap().remove(&self.emit);
            if let Some(bytes) = next {
                self.cur = Some(bytes);
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = notified => {}
            }
        }
    }

    /// Drains the remaining stream into `writer`.
    pub async fn copy_to<W>(&mut self, writer: &mut W) -> Result<u64, Error>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                writer.flush().await?;
                return Ok(total);
            }
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }

    /// Cancels outstanding workers and releases buffered chunks. Reads after
    /// close fail.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cancel.cancel();
        self.dispatch = None;
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
        self.shared.completed.lock().unwrap().clear();
        self.cur = None;
        Ok(())
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One download worker: takes chunk indexes off the channel, fetches the
/// corresponding byte range (retries handled a layer down), and deposits the
/// result for in-order emission.
#[allow(clippy::too_many_arguments)]
async fn download_worker(
    backend: Arc<Backend>,
    cancel: CancellationToken,
    bucket_name: String,
    name: String,
    base_offset: u64,
    length: u64,
    chunk_size: u64,
    shared: Arc<Shared>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<u64>>>,
    progress: ProgressTicker,
) {
    let end = base_offset + length;
    loop {
        let idx = { rx.lock().await.recv().await };
        let Some(idx) = idx else {
            return;
        };
        let off = base_offset + idx * chunk_size;
        let len = chunk_size.min(end - off);
        debug!(chunk = idx, off, len, "fetching range");
        match backend
            .download_range(&cancel, &bucket_name, &name, off, len)
            .await
        {
            Ok(bytes) => {
                shared.completed.lock().unwrap().insert(idx, bytes);
                progress.tick();
                shared.notify.notify_waiters();
            }
            Err(e) => {
                if !e.is_cancelled() {
                    warn!(chunk = idx, "range download failed: {e}");
                }
                shared.latch.set(e);
                shared.notify.notify_waiters();
                return;
            }
        }
    }
}
