//! The decision layer between the engine and the RPC leaves.
//!
//! Every call runs inside two nested loops. The inner one handles expired
//! authorization: on [`Action::ReAuthenticate`] the stored credentials are
//! replayed through `b2_authorize_account` and the call retried exactly once.
//! The outer one handles transient failures: [`Action::Retry`] and
//! [`Action::AttemptNewUpload`] sleep on a cancellable backoff timer and go
//! again, without limit; bounding total time is the caller's job, via the
//! cancellation token. [`Action::Punt`] surfaces immediately.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use b2_protocol::types::{
    Authorization, Bucket, DownloadAuthorization, FileVersion, Key, LifecycleRule, ListFileNames,
    ListFileVersions, ListKeys, ListParts, UploadEndpoint,
};
use b2_protocol::{Action, ProtocolError};
use bytes::Bytes;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::ChunkSource;
use crate::error::Error;
use crate::raw::RawClient;

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_CEILING: Duration = Duration::from_secs(15);

/// Local retry schedule: exponential from 500 ms, doubling until the delay
/// clears 15 s, additive after that. A server-supplied `Retry-After` takes
/// precedence and reseeds the growth.
struct BackoffSchedule {
    next: Duration,
}

impl BackoffSchedule {
    fn new() -> Self {
        Self {
            next: BACKOFF_INITIAL,
        }
    }

    fn advance(&mut self) -> Duration {
        let cur = self.next;
        self.next = if cur >= BACKOFF_CEILING {
            cur + BACKOFF_INITIAL
        } else {
            cur * 2
        };
        cur
    }

    /// Picks the next delay. A server-supplied value is authoritative and
    /// reseeds local growth.
    fn next_delay(&mut self, server: Option<Duration>) -> Duration {
        match server {
            Some(d) => {
                self.next = d * 2;
                d
            }
            None => self.advance(),
        }
    }

    /// Sleeps for the next delay, racing the cancellation token.
    async fn wait(
        &mut self,
        cancel: &CancellationToken,
        server: Option<Duration>,
    ) -> Result<(), Error> {
        let delay = with_jitter(self.next_delay(server));
        debug!(delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Uniform jitter of ±1% around `d`.
fn with_jitter(d: Duration) -> Duration {
    let r = rand::thread_rng().gen::<f64>();
    d.mul_f64(1.0 + (r - 0.5) * 0.02)
}

/// Write-once error cell shared between a transfer handle and its workers.
///
/// Readers observe either "no error yet" or one stable, final value.
#[derive(Default)]
pub(crate) struct ErrorLatch {
    cell: RwLock<Option<Error>>,
}

impl ErrorLatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, err: Error) {
        let mut guard = self.cell.write().unwrap();
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub(crate) fn get(&self) -> Option<Error> {
        self.cell.read().unwrap().clone()
    }
}

#[derive(Clone)]
struct Credentials {
    key_id: String,
    key: String,
}

/// Owns the session state and wraps the raw operation set with retry policy.
pub(crate) struct Backend {
    raw: Arc<dyn RawClient>,
    creds: Credentials,
    auth: RwLock<Authorization>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

impl Backend {
    /// Authorizes and returns a live backend. The initial authorize runs
    /// under the backoff loop; bad credentials punt (401 on
    /// `b2_authorize_account` is terminal).
    pub(crate) async fn connect(
        raw: Arc<dyn RawClient>,
        cancel: &CancellationToken,
        key_id: &str,
        key: &str,
    ) -> Result<Self, Error> {
        let creds = Credentials {
            key_id: key_id.to_owned(),
            key: key.to_owned(),
        };
        let auth = authorize(&*raw, cancel, &creds).await?;
        Ok(Self {
            raw,
            creds,
            auth: RwLock::new(auth),
        })
    }

    fn auth(&self) -> Authorization {
        self.auth.read().unwrap().clone()
    }

    /// Smallest part size the service will accept, learned at authorization.
    pub(crate) fn min_part_size(&self) -> u64 {
        self.auth().minimum_part_size
    }

    async fn reauthorize(&self, cancel: &CancellationToken) -> Result<(), Error> {
        info!("authorization expired; re-authorizing account");
        let fresh = authorize(&*self.raw, cancel, &self.creds).await?;
        *self.auth.write().unwrap() = fresh;
        Ok(())
    }

    /// Runs one RPC under the full policy: reauth once, back off forever.
    async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, Error>
    where
        F: FnMut(Authorization) -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        let mut schedule = BackoffSchedule::new();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match op(self.auth()).await {
                Ok(v) => return Ok(v),
                Err(e) => match e.action() {
                    Action::ReAuthenticate => {
                        self.reauthorize(cancel).await?;
                        // Exactly one retry at this level; a second
                        // ReAuthenticate bubbles up.
                        match op(self.auth()).await {
                            Ok(v) => return Ok(v),
                            Err(e2) => match e2.action() {
                                Action::Retry | Action::AttemptNewUpload => {
                                    schedule.wait(cancel, e2.retry_delay()).await?
                                }
                                _ => return Err(e2.into()),
                            },
                        }
                    }
                    Action::Retry | Action::AttemptNewUpload => {
                        debug!("transient failure, will retry: {e}");
                        schedule.wait(cancel, e.retry_delay()).await?
                    }
                    Action::Punt => return Err(e.into()),
                },
            }
        }
    }

    /// Like [`Backend::run`], for operations bound to an upload endpoint.
    ///
    /// `slot` caches the endpoint across calls (workers hold one for their
    /// whole lifetime); [`Action::AttemptNewUpload`] clears it so the next
    /// attempt re-acquires before retrying.
    async fn run_upload<T, A, AFut, F, Fut>(
        &self,
        cancel: &CancellationToken,
        slot: &mut Option<UploadEndpoint>,
        mut acquire: A,
        mut op: F,
    ) -> Result<T, Error>
    where
        A: FnMut(Authorization) -> AFut,
        AFut: Future<Output = Result<UploadEndpoint, ProtocolError>>,
        F: FnMut(UploadEndpoint) -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        let mut schedule = BackoffSchedule::new();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let endpoint = match slot.as_ref() {
                Some(ep) => ep.clone(),
                None => {
                    let ep = self.run(cancel, &mut acquire).await?;
                    *slot = Some(ep.clone());
                    ep
                }
            };
            match op(endpoint.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) => match e.action() {
                    Action::ReAuthenticate => {
                        self.reauthorize(cancel).await?;
                        match op(endpoint).await {
                            Ok(v) => return Ok(v),
                            Err(e2) => match e2.action() {
                                Action::Retry => schedule.wait(cancel, e2.retry_delay()).await?,
                                Action::AttemptNewUpload => {
                                    *slot = None;
                                    schedule.wait(cancel, e2.retry_delay()).await?;
                                }
                                _ => return Err(e2.into()),
                            },
                        }
                    }
                    Action::Retry => {
                        debug!("transient upload failure, will retry: {e}");
                        schedule.wait(cancel, e.retry_delay()).await?
                    }
                    Action::AttemptNewUpload => {
                        debug!("upload endpoint rejected, will re-acquire: {e}");
                        *slot = None;
                        schedule.wait(cancel, e.retry_delay()).await?
                    }
                    Action::Punt => return Err(e.into()),
                },
            }
        }
    }

    pub(crate) async fn create_bucket(
        &self,
        cancel: &CancellationToken,
        name: &str,
        bucket_type: &str,
        bucket_info: &HashMap<String, String>,
        lifecycle: &[LifecycleRule],
    ) -> Result<Bucket, Error> {
        let raw = self.raw.clone();
        let (name, bucket_type) = (name.to_owned(), bucket_type.to_owned());
        let (bucket_info, lifecycle) = (bucket_info.clone(), lifecycle.to_vec());
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let name = name.clone();
            let bucket_type = bucket_type.clone();
            let bucket_info = bucket_info.clone();
            let lifecycle = lifecycle.clone();
            async move {
                raw.create_bucket(&auth, &name, &bucket_type, &bucket_info, &lifecycle)
                    .await
            }
        })
        .await
    }

    pub(crate) async fn list_buckets(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Bucket>, Error> {
        let raw = self.raw.clone();
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            async move { raw.list_buckets(&auth).await }
        })
        .await
    }

    pub(crate) async fn update_bucket(
        &self,
        cancel: &CancellationToken,
        bucket_id: &str,
        bucket_type: Option<String>,
        bucket_info: Option<HashMap<String, String>>,
        lifecycle: Option<Vec<LifecycleRule>>,
        if_revision_is: Option<u64>,
    ) -> Result<Bucket, Error> {
        let raw = self.raw.clone();
        let bucket_id = bucket_id.to_owned();
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let bucket_id = bucket_id.clone();
            let bucket_type = bucket_type.clone();
            let bucket_info = bucket_info.clone();
            let lifecycle = lifecycle.clone();
            async move {
                raw.update_bucket(
                    &auth,
                    &bucket_id,
                    bucket_type.as_deref(),
                    bucket_info.as_ref(),
                    lifecycle.as_deref(),
                    if_revision_is,
                )
                .await
            }
        })
        .await
    }

    pub(crate) async fn delete_bucket(
        &self,
        cancel: &CancellationToken,
        bucket_id: &str,
    ) -> Result<(), Error> {
        let raw = self.raw.clone();
        let bucket_id = bucket_id.to_owned();
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let bucket_id = bucket_id.clone();
            async move { raw.delete_bucket(&auth, &bucket_id).await }
        })
        .await
    }

    /// The simple (non-multipart) upload path: acquire an endpoint for the
    /// bucket, POST the whole object, re-acquiring on demand.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn upload_file(
        &self,
        cancel: &CancellationToken,
        bucket_id: &str,
        file_name: &str,
        content_type: &str,
        sha1_hex: &str,
        content_length: u64,
        info: &HashMap<String, String>,
        data: ChunkSource,
    ) -> Result<FileVersion, Error> {
        let mut slot = None;
        let raw = self.raw.clone();
        let raw_op = self.raw.clone();
        let bucket_id = bucket_id.to_owned();
        let (file_name, content_type, sha1_hex) =
            (file_name.to_owned(), content_type.to_owned(), sha1_hex.to_owned());
        let info = info.clone();
        self.run_upload(
            cancel,
            &mut slot,
            move |auth| {
                let raw = raw.clone();
                let bucket_id = bucket_id.clone();
                async move { raw.get_upload_url(&auth, &bucket_id).await }
            },
            move |endpoint| {
                let raw = raw_op.clone();
                let file_name = file_name.clone();
                let content_type = content_type.clone();
                let sha1_hex = sha1_hex.clone();
                let info = info.clone();
                let data = data.clone();
                async move {
                    raw.upload_file(
                        &endpoint,
                        &file_name,
                        &content_type,
                        &sha1_hex,
                        content_length,
                        &info,
                        &data,
                    )
                    .await
                }
            },
        )
        .await
    }

    pub(crate) async fn start_large_file(
        &self,
        cancel: &CancellationToken,
        bucket_id: &str,
        file_name: &str,
        content_type: &str,
        info: &HashMap<String, String>,
    ) -> Result<FileVersion, Error> {
        let raw = self.raw.clone();
        let (bucket_id, file_name, content_type) = (
            bucket_id.to_owned(),
            file_name.to_owned(),
            content_type.to_owned(),
        );
        let info = info.clone();
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let bucket_id = bucket_id.clone();
            let file_name = file_name.clone();
            let content_type = content_type.clone();
            let info = info.clone();
            async move {
                raw.start_large_file(&auth, &bucket_id, &file_name, &content_type, &info)
                    .await
            }
        })
        .await
    }

    /// Uploads one part. `slot` is the worker's cached endpoint, acquired
    /// lazily on the first part and replaced whenever the service rejects it.
    pub(crate) async fn upload_part(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
        slot: &mut Option<UploadEndpoint>,
        part_number: u32,
        sha1_hex: &str,
        content_length: u64,
        data: ChunkSource,
    ) -> Result<(), Error> {
        let raw = self.raw.clone();
        let raw_op = self.raw.clone();
        let file_id = file_id.to_owned();
        let sha1_hex = sha1_hex.to_owned();
        self.run_upload(
            cancel,
            slot,
            move |auth| {
                let raw = raw.clone();
                let file_id = file_id.clone();
                async move { raw.get_upload_part_url(&auth, &file_id).await }
            },
            move |endpoint| {
                let raw = raw_op.clone();
                let sha1_hex = sha1_hex.clone();
                let data = data.clone();
                async move {
                    raw.upload_part(&endpoint, part_number, &sha1_hex, content_length, &data)
                        .await
                }
            },
        )
        .await
    }

    pub(crate) async fn finish_large_file(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
        part_sha1_array: Vec<String>,
    ) -> Result<FileVersion, Error> {
        let raw = self.raw.clone();
        let file_id = file_id.to_owned();
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let file_id = file_id.clone();
            let shas = part_sha1_array.clone();
            async move { raw.finish_large_file(&auth, &file_id, &shas).await }
        })
        .await
    }

    pub(crate) async fn cancel_large_file(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
    ) -> Result<(), Error> {
        let raw = self.raw.clone();
        let file_id = file_id.to_owned();
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let file_id = file_id.clone();
            async move { raw.cancel_large_file(&auth, &file_id).await }
        })
        .await
    }

    /// Best-effort cancel for abandoned large files, under a fresh
    /// short-lived context so it works even when the caller's token is
    /// already cancelled.
    pub(crate) async fn cancel_large_file_best_effort(&self, file_id: &str) {
        let cancel = CancellationToken::new();
        let attempt = self.cancel_large_file(&cancel, file_id);
        match tokio::time::timeout(Duration::from_secs(10), attempt).await {
            Ok(Ok(())) => debug!(file_id, "cancelled unfinished large file"),
            Ok(Err(e)) => warn!(file_id, "failed to cancel large file: {e}"),
            Err(_) => warn!(file_id, "timed out cancelling large file"),
        }
    }

    pub(crate) async fn list_file_names(
        &self,
        cancel: &CancellationToken,
        bucket_id: &str,
        max_file_count: u32,
        start_file_name: Option<String>,
    ) -> Result<ListFileNames, Error> {
        let raw = self.raw.clone();
        let bucket_id = bucket_id.to_owned();
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let bucket_id = bucket_id.clone();
            let start = start_file_name.clone();
            async move {
                raw.list_file_names(&auth, &bucket_id, max_file_count, start.as_deref())
                    .await
            }
        })
        .await
    }

    pub(crate) async fn list_file_versions(
        &self,
        cancel: &CancellationToken,
        bucket_id: &str,
        max_file_count: u32,
        start_file_name: Option<String>,
        start_file_id: Option<String>,
    ) -> Result<ListFileVersions, Error> {
        let raw = self.raw.clone();
        let bucket_id = bucket_id.to_owned();
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let bucket_id = bucket_id.clone();
            let start_name = start_file_name.clone();
            let start_id = start_file_id.clone();
            async move {
                raw.list_file_versions(
                    &auth,
                    &bucket_id,
                    max_file_count,
                    start_name.as_deref(),
                    start_id.as_deref(),
                )
                .await
            }
        })
        .await
    }

    pub(crate) async fn list_parts(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
        max_part_count: u32,
        start_part_number: Option<u32>,
    ) -> Result<ListParts, Error> {
        let raw = self.raw.clone();
        let file_id = file_id.to_owned();
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let file_id = file_id.clone();
            async move {
                raw.list_parts(&auth, &file_id, max_part_count, start_part_number)
                    .await
            }
        })
        .await
    }

    pub(crate) async fn hide_file(
        &self,
        cancel: &CancellationToken,
        bucket_id: &str,
        file_name: &str,
    ) -> Result<FileVersion, Error> {
        let raw = self.raw.clone();
        let (bucket_id, file_name) = (bucket_id.to_owned(), file_name.to_owned());
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let bucket_id = bucket_id.clone();
            let file_name = file_name.clone();
            async move { raw.hide_file(&auth, &bucket_id, &file_name).await }
        })
        .await
    }

    pub(crate) async fn delete_file_version(
        &self,
        cancel: &CancellationToken,
        file_name: &str,
        file_id: &str,
    ) -> Result<(), Error> {
        let raw = self.raw.clone();
        let (file_name, file_id) = (file_name.to_owned(), file_id.to_owned());
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let file_name = file_name.clone();
            let file_id = file_id.clone();
            async move { raw.delete_file_version(&auth, &file_name, &file_id).await }
        })
        .await
    }

    pub(crate) async fn get_file_info(
        &self,
        cancel: &CancellationToken,
        file_id: &str,
    ) -> Result<FileVersion, Error> {
        let raw = self.raw.clone();
        let file_id = file_id.to_owned();
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let file_id = file_id.clone();
            async move { raw.get_file_info(&auth, &file_id).await }
        })
        .await
    }

    pub(crate) async fn get_download_authorization(
        &self,
        cancel: &CancellationToken,
        bucket_id: &str,
        file_name_prefix: &str,
        valid_for: Duration,
    ) -> Result<DownloadAuthorization, Error> {
        let raw = self.raw.clone();
        let (bucket_id, prefix) = (bucket_id.to_owned(), file_name_prefix.to_owned());
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let bucket_id = bucket_id.clone();
            let prefix = prefix.clone();
            async move {
                raw.get_download_authorization(&auth, &bucket_id, &prefix, valid_for)
                    .await
            }
        })
        .await
    }

    pub(crate) async fn create_key(
        &self,
        cancel: &CancellationToken,
        key_name: &str,
        capabilities: Vec<String>,
        valid_for: Option<Duration>,
        bucket_id: Option<String>,
        name_prefix: Option<String>,
    ) -> Result<Key, Error> {
        let raw = self.raw.clone();
        let key_name = key_name.to_owned();
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let key_name = key_name.clone();
            let capabilities = capabilities.clone();
            let bucket_id = bucket_id.clone();
            let name_prefix = name_prefix.clone();
            async move {
                raw.create_key(
                    &auth,
                    &key_name,
                    &capabilities,
                    valid_for,
                    bucket_id.as_deref(),
                    name_prefix.as_deref(),
                )
                .await
            }
        })
        .await
    }

    pub(crate) async fn delete_key(
        &self,
        cancel: &CancellationToken,
        application_key_id: &str,
    ) -> Result<(), Error> {
        let raw = self.raw.clone();
        let key_id = application_key_id.to_owned();
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let key_id = key_id.clone();
            async move { raw.delete_key(&auth, &key_id).await }
        })
        .await
    }

    pub(crate) async fn list_keys(
        &self,
        cancel: &CancellationToken,
        max_key_count: u32,
        start_application_key_id: Option<String>,
    ) -> Result<ListKeys, Error> {
        let raw = self.raw.clone();
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let start = start_application_key_id.clone();
            async move { raw.list_keys(&auth, max_key_count, start.as_deref()).await }
        })
        .await
    }

    /// Downloads one byte range and drains it into memory, verifying the
    /// advertised length. Short bodies count as transient stream failures.
    pub(crate) async fn download_range(
        &self,
        cancel: &CancellationToken,
        bucket_name: &str,
        file_name: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, Error> {
        let raw = self.raw.clone();
        let (bucket_name, file_name) = (bucket_name.to_owned(), file_name.to_owned());
        self.run(cancel, move |auth| {
            let raw = raw.clone();
            let bucket_name = bucket_name.clone();
            let file_name = file_name.clone();
            async move {
                let dl = raw
                    .download_file_by_name(&auth, &bucket_name, &file_name, offset, Some(length))
                    .await?;
                let body = dl.collect().await?;
                if body.len() as u64 != length {
                    return Err(ProtocolError::Stream(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("range body: got {} bytes, want {length}", body.len()),
                    )));
                }
                Ok(body)
            }
        })
        .await
    }
}

/// Authorize with backoff but with reauthentication disabled: a 401 here
/// means the credentials themselves are wrong, which is terminal.
async fn authorize(
    raw: &dyn RawClient,
    cancel: &CancellationToken,
    creds: &Credentials,
) -> Result<Authorization, Error> {
    let mut schedule = BackoffSchedule::new();
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match raw.authorize_account(&creds.key_id, &creds.key).await {
            Ok(auth) => return Ok(auth),
            Err(e) => match e.action() {
                Action::Retry | Action::AttemptNewUpload => {
                    debug!("authorize failed transiently, will retry: {e}");
                    schedule.wait(cancel, e.retry_delay()).await?
                }
                _ => return Err(e.into()),
            },
        }
    }
}
