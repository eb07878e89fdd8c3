//! Stream sink for one object.
//!
//! Bytes accumulate in the current chunk buffer; a full chunk is handed to a
//! pool of upload workers over a bounded channel, which is also the
//! backpressure signal. The small-file/multipart decision is deferred: an
//! object that fits in one chunk is sent with a single `b2_upload_file` at
//! close, anything larger goes through the large-file protocol. In-memory
//! chunks are capped at `concurrent_uploads` in flight plus the one being
//! filled plus one in the channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use b2_protocol::constants::{LAST_MODIFIED_KEY, MAX_FILE_INFO_ENTRIES};
use b2_protocol::types::{FileAction, FileVersion, UploadEndpoint};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, ErrorLatch};
use crate::buffer::{ChunkSource, FileBuffer, MemoryBuffer, WriteBuffer};
use crate::client::Attrs;
use crate::error::Error;
use crate::status::{ProgressTicker, StatusHandle};

/// Default chunk size for uploads: 100 MB.
const DEFAULT_CHUNK_SIZE: u64 = 100_000_000;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// List page sizes used while rehydrating an unfinished large file.
const RESUME_VERSION_PAGE: u32 = 100;
const RESUME_PART_PAGE: u32 = 1000;

/// A cut chunk in transit to a worker. `number` is the 1-based part number.
struct Chunk {
    number: u32,
    size: u64,
    sha1: String,
    data: ChunkSource,
}

struct LargeState {
    hashes: HashMap<u32, String>,
    size: u64,
}

/// An open large file shared between the writer and its workers.
struct LargeFile {
    file_id: String,
    /// Part SHAs recorded server-side before this writer started; consulted
    /// to skip re-uploads during resume.
    resumed: HashMap<u32, String>,
    state: Mutex<LargeState>,
}

impl LargeFile {
    fn record(&self, number: u32, sha1: String, size: u64) {
        let mut state = self.state.lock().unwrap();
        state.hashes.insert(number, sha1);
        state.size += size;
    }

    /// The part SHAs ordered by part number, ready for finish.
    fn ordered_hashes(&self) -> Result<Vec<String>, Error> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::with_capacity(state.hashes.len());
        for number in 1..=state.hashes.len() as u32 {
            match state.hashes.get(&number) {
                Some(sha) => out.push(sha.clone()),
                None => {
                    return Err(Error::Resume(format!(
                        "no recorded digest for part {number}"
                    )))
                }
            }
        }
        Ok(out)
    }
}

/// Writes one object as a stream.
///
/// Configuration methods consume the writer and must come before the first
/// `write`. `close` finalizes the upload and is idempotent; every call after
/// the first returns the parked result.
pub struct Writer {
    backend: Arc<Backend>,
    cancel: CancellationToken,
    bucket_id: String,
    name: String,
    resolved: Arc<Mutex<Option<FileVersion>>>,
    status: StatusHandle,

    chunk_size: u64,
    concurrent_uploads: usize,
    resume: bool,
    use_file_buffer: bool,
    content_type: String,
    info: HashMap<String, String>,
    last_modified: Option<DateTime<Utc>>,

    started: bool,
    cbuf: Option<Box<dyn WriteBuffer>>,
    cidx: u32,
    ready: Option<mpsc::Sender<Chunk>>,
    workers: Vec<JoinHandle<()>>,
    large: Option<Arc<LargeFile>>,
    latch: Arc<ErrorLatch>,
    done: Option<Result<(), Error>>,
}

impl Writer {
    pub(crate) fn new(
        backend: Arc<Backend>,
        status: StatusHandle,
        cancel: &CancellationToken,
        bucket_id: String,
        name: String,
        resolved: Arc<Mutex<Option<FileVersion>>>,
    ) -> Self {
        Self {
            backend,
            cancel: cancel.child_token(),
            bucket_id,
            name,
            resolved,
            status,
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrent_uploads: 1,
            resume: false,
            use_file_buffer: false,
            content_type: DEFAULT_CONTENT_TYPE.to_owned(),
            info: HashMap::new(),
            last_modified: None,
            started: false,
            cbuf: None,
            cidx: 0,
            ready: None,
            workers: Vec::new(),
            large: None,
            latch: Arc::new(ErrorLatch::new()),
            done: None,
        }
    }

    /// Chunk size in bytes. Values below the service minimum are raised
    /// silently on first use.
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Number of concurrent upload workers for the multipart path. Values
    /// below 1 are treated as 1.
    pub fn with_concurrent_uploads(mut self, n: usize) -> Self {
        self.concurrent_uploads = n;
        self
    }

    /// Continue a previously interrupted large upload of the same object,
    /// skipping parts the service already has.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Stage chunks in unlinked temporary files instead of memory.
    pub fn with_file_buffers(mut self, enabled: bool) -> Self {
        self.use_file_buffer = enabled;
        self
    }

    /// Content type, info entries, and the synthetic last-modified entry.
    pub fn with_attrs(mut self, attrs: Attrs) -> Self {
        if let Some(ct) = attrs.content_type {
            self.content_type = ct;
        }
        self.info = attrs.info;
        self.last_modified = attrs.last_modified;
        self
    }

    /// Appends to the stream. Never blocks on network I/O directly; it blocks
    /// only when every worker is busy and the hand-off channel is full.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if self.done.is_some() {
            return Err(Error::Config("write after close".into()));
        }
        if let Some(e) = self.latch.get() {
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.start()?;
        let mut rest = buf;
        while !rest.is_empty() {
            if self.buffered() == self.chunk_size {
                // More bytes beyond a full chunk: this object is multipart.
                self.send_chunk().await?;
            }
            let room = (self.chunk_size - self.buffered()) as usize;
            let take = room.min(rest.len());
            let Some(cbuf) = self.cbuf.as_mut() else {
                return Err(Error::Config("writer has no active buffer".into()));
            };
            cbuf.write(&rest[..take])?;
            rest = &rest[take..];
        }
        Ok(buf.len())
    }

    /// Drains `reader` into this writer.
    pub async fn copy_from<R>(&mut self, reader: &mut R) -> Result<u64, Error>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            self.write(&buf[..n]).await?;
            total += n as u64;
        }
    }

    /// Finalizes the object: a single upload for streams that fit in one
    /// chunk, otherwise the last part plus `b2_finish_large_file`. Exactly
    /// one of {simple upload, finish, cancel} happens, no matter how often
    /// close is called.
    pub async fn close(&mut self) -> Result<(), Error> {
        if let Some(parked) = &self.done {
            return parked.clone();
        }
        let result = self.finish().await;
        self.done = Some(result.clone());
        result
    }

    /// The file version created by a successful close, if any.
    pub fn file_version(&self) -> Option<FileVersion> {
        self.resolved.lock().unwrap().clone()
    }

    fn buffered(&self) -> u64 {
        self.cbuf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    fn new_buffer(&self) -> Result<Box<dyn WriteBuffer>, Error> {
        Ok(if self.use_file_buffer {
            Box::new(FileBuffer::new()?)
        } else {
            Box::new(MemoryBuffer::new())
        })
    }

    /// Freezes configuration on first use.
    fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Ok(());
        }
        if let Some(ts) = self.last_modified {
            self.info
                .insert(LAST_MODIFIED_KEY.to_owned(), ts.timestamp_millis().to_string());
        }
        if self.info.len() > MAX_FILE_INFO_ENTRIES {
            return Err(Error::Config(format!(
                "info map has {} entries; the service allows {}",
                self.info.len(),
                MAX_FILE_INFO_ENTRIES
            )));
        }
        let min = self.backend.min_part_size();
        if self.chunk_size < min {
            debug!(
                configured = self.chunk_size,
                min, "raising chunk size to the service minimum"
            );
            self.chunk_size = min;
        }
        if self.concurrent_uploads < 1 {
            self.concurrent_uploads = 1;
        }
        self.cbuf = Some(self.new_buffer()?);
        self.started = true;
        Ok(())
    }

    /// Hands the current chunk to the workers and installs a fresh buffer.
    async fn send_chunk(&mut self) -> Result<(), Error> {
        let (sha1, size, data) = {
            let Some(cbuf) = self.cbuf.as_ref() else {
                return Err(Error::Config("writer has no active buffer".into()));
            };
            (cbuf.sha1_hex(), cbuf.len(), cbuf.payload()?)
        };
        if self.large.is_none() {
            self.open_large(&sha1).await?;
        }
        self.cbuf = Some(self.new_buffer()?);
        self.cidx += 1;
        let number = self.cidx;

        let Some(large) = self.large.as_ref() else {
            return Err(Error::Config("multipart state missing".into()));
        };
        if let Some(recorded) = large.resumed.get(&number) {
            if *recorded == sha1 {
                debug!(part = number, "part already uploaded; skipping");
                self.status.ticker().tick();
                return Ok(());
            }
            let err = Error::Resume(format!(
                "part {number} does not match the previously uploaded part"
            ));
            self.latch.set(err.clone());
            return Err(err);
        }

        if let Some(e) = self.latch.get() {
            return Err(e);
        }
        let Some(tx) = self.ready.as_ref() else {
            return Err(Error::Config("multipart state missing".into()));
        };
        let chunk = Chunk {
            number,
            size,
            sha1,
            data,
        };
        if tx.send(chunk).await.is_err() {
            // Every worker has exited; the latch says why.
            return Err(self.latch.get().unwrap_or(Error::Cancelled));
        }
        Ok(())
    }

    /// Starts (or resumes) the large file and spawns the worker pool.
    async fn open_large(&mut self, first_chunk_sha: &str) -> Result<(), Error> {
        let mut resumed = None;
        if self.resume {
            if let Some((file_id, parts)) = self.find_unfinished().await? {
                // Commit to the existing file only if our first chunk agrees
                // with what the service already has for part 1.
                let diverged =
                    matches!(parts.get(&1), Some((sha, _)) if sha != first_chunk_sha);
                if diverged {
                    debug!(file_id = %file_id, "existing upload diverges at part 1; starting fresh");
                } else {
                    resumed = Some((file_id, parts));
                }
            }
        }
        let large = match resumed {
            Some((file_id, parts)) => {
                info!(file_id = %file_id, parts = parts.len(), object = %self.name, "resuming large file");
                let mut hashes = HashMap::new();
                let mut shas = HashMap::new();
                let mut size = 0;
                for (number, (sha, len)) in parts {
                    hashes.insert(number, sha.clone());
                    shas.insert(number, sha);
                    size += len;
                }
                LargeFile {
                    file_id,
                    resumed: shas,
                    state: Mutex::new(LargeState { hashes, size }),
                }
            }
            None => {
                let started = self
                    .backend
                    .start_large_file(
                        &self.cancel,
                        &self.bucket_id,
                        &self.name,
                        &self.content_type,
                        &self.info,
                    )
                    .await?;
                debug!(file_id = %started.file_id, object = %self.name, "started large file");
                LargeFile {
                    file_id: started.file_id,
                    resumed: HashMap::new(),
                    state: Mutex::new(LargeState {
                        hashes: HashMap::new(),
                        size: 0,
                    }),
                }
            }
        };

        let large = Arc::new(large);
        let (tx, rx) = mpsc::channel::<Chunk>(1);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..self.concurrent_uploads {
            self.workers.push(tokio::spawn(upload_worker(
                self.backend.clone(),
                self.cancel.clone(),
                large.clone(),
                rx.clone(),
                self.latch.clone(),
                self.status.ticker(),
            )));
        }
        self.ready = Some(tx);
        self.large = Some(large);
        Ok(())
    }

    /// Looks for an unfinished large file of the same name and returns its
    /// id plus `{part number → (sha1, length)}`.
    async fn find_unfinished(
        &self,
    ) -> Result<Option<(String, HashMap<u32, (String, u64)>)>, Error> {
        let versions = self
            .backend
            .list_file_versions(
                &self.cancel,
                &self.bucket_id,
                RESUME_VERSION_PAGE,
                Some(self.name.clone()),
                None,
            )
            .await?;
        let Some(unfinished) = versions
            .files
            .iter()
            .find(|f| f.file_name == self.name && f.action == Some(FileAction::Start))
        else {
            return Ok(None);
        };
        let mut parts = HashMap::new();
        let mut start = None;
        loop {
            let page = self
                .backend
                .list_parts(&self.cancel, &unfinished.file_id, RESUME_PART_PAGE, start)
                .await?;
            for p in page.parts {
                parts.insert(p.part_number, (p.content_sha1, p.content_length));
            }
            match page.next_part_number {
                Some(n) => start = Some(n),
                None => break,
            }
        }
        Ok(Some((unfinished.file_id.clone(), parts)))
    }

    async fn finish(&mut self) -> Result<(), Error> {
        self.start()?;
        if self.large.is_none() {
            return self.simple_upload().await;
        }

        let mut flush_err = None;
        if self.latch.get().is_none() && self.buffered() > 0 {
            if let Err(e) = self.send_chunk().await {
                flush_err = Some(e);
            }
        }

        // Closing the channel lets the workers drain and exit.
        self.ready = None;
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
        let Some(large) = self.large.clone() else {
            return Err(Error::Config("multipart state missing".into()));
        };

        if let Some(e) = self.latch.get().or(flush_err) {
            warn!(object = %self.name, "abandoning large file: {e}");
            self.backend
                .cancel_large_file_best_effort(&large.file_id)
                .await;
            return Err(e);
        }

        self.status.set_total(self.cidx as u64);
        let hashes = large.ordered_hashes()?;
        info!(object = %self.name, parts = hashes.len(), "finishing large file");
        match self
            .backend
            .finish_large_file(&self.cancel, &large.file_id, hashes)
            .await
        {
            Ok(version) => {
                *self.resolved.lock().unwrap() = Some(version);
                Ok(())
            }
            Err(e) => {
                if e.is_cancelled() {
                    self.backend
                        .cancel_large_file_best_effort(&large.file_id)
                        .await;
                }
                Err(e)
            }
        }
    }

    /// One `b2_upload_file` for streams that never outgrew a single chunk.
    async fn simple_upload(&mut self) -> Result<(), Error> {
        if let Some(e) = self.latch.get() {
            return Err(e);
        }
        let Some(cbuf) = self.cbuf.take() else {
            return Err(Error::Config("writer has no active buffer".into()));
        };
        let sha1 = cbuf.sha1_hex();
        let size = cbuf.len();
        let data = cbuf.payload()?;
        drop(cbuf);
        debug!(object = %self.name, size, "uploading in one shot");
        self.status.set_total(1);
        let version = self
            .backend
            .upload_file(
                &self.cancel,
                &self.bucket_id,
                &self.name,
                &self.content_type,
                &sha1,
                size,
                &self.info,
                data,
            )
            .await?;
        self.status.ticker().tick();
        *self.resolved.lock().unwrap() = Some(version);
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One upload worker: pulls chunks off the channel until it closes, keeping
/// a lazily acquired part-upload endpoint for its lifetime. The first failure
/// latches and stops this worker.
async fn upload_worker(
    backend: Arc<Backend>,
    cancel: CancellationToken,
    large: Arc<LargeFile>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Chunk>>>,
    latch: Arc<ErrorLatch>,
    progress: ProgressTicker,
) {
    let mut endpoint: Option<UploadEndpoint> = None;
    loop {
        let chunk = { rx.lock().await.recv().await };
        let Some(chunk) = chunk else {
            return;
        };
        debug!(part = chunk.number, size = chunk.size, "uploading part");
        let result = backend
            .upload_part(
                &cancel,
                &large.file_id,
                &mut endpoint,
                chunk.number,
                &chunk.sha1,
                chunk.size,
                chunk.data,
            )
            .await;
        match result {
            Ok(()) => {
                large.record(chunk.number, chunk.sha1, chunk.size);
                progress.tick();
            }
            Err(e) => {
                warn!(part = chunk.number, "part upload failed: {e}");
                latch.set(e);
                return;
            }
        }
    }
}
