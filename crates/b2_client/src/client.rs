//! The public surface: [`Client`] → [`Bucket`] → [`Object`] → transfer
//! handles.
//!
//! Handles are cheap to clone and hold no network state of their own; the
//! client owns the backend and the status registry, everything else keeps a
//! non-owning reference back to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use b2_protocol::constants::LAST_MODIFIED_KEY;
use b2_protocol::types::{FileVersion, Key as ApiKey, LifecycleRule};
use b2_protocol::ProtocolClient;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::error::Error;
use crate::raw::RawClient;
use crate::reader::{Reader, ReaderOptions};
use crate::status::{StatusRegistry, StatusSnapshot, TransferKind};
use crate::writer::Writer;

/// Root handle for one account session.
///
/// Re-authorizes transparently when the service expires the session token.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    backend: Arc<Backend>,
    registry: Arc<StatusRegistry>,
}

impl Client {
    /// Authorizes against the live service.
    pub async fn connect(
        cancel: &CancellationToken,
        key_id: &str,
        key: &str,
    ) -> Result<Self, Error> {
        Self::connect_raw(cancel, Arc::new(ProtocolClient::new()), key_id, key).await
    }

    /// Authorizes against any [`RawClient`] implementation.
    pub(crate) async fn connect_raw(
        cancel: &CancellationToken,
        raw: Arc<dyn RawClient>,
        key_id: &str,
        key: &str,
    ) -> Result<Self, Error> {
        let backend = Arc::new(Backend::connect(raw, cancel, key_id, key).await?);
        Ok(Self {
            inner: Arc::new(ClientInner {
                backend,
                registry: Arc::new(StatusRegistry::default()),
            }),
        })
    }

    /// Returns the named bucket, reusing it if the account already has one
    /// and creating a private bucket otherwise.
    pub async fn bucket(&self, cancel: &CancellationToken, name: &str) -> Result<Bucket, Error> {
        let existing = self.inner.backend.list_buckets(cancel).await?;
        if let Some(api) = existing.into_iter().find(|b| b.bucket_name == name) {
            return Ok(Bucket::from_api(self.clone(), api));
        }
        self.create_bucket(cancel, name, BucketAttrs::default()).await
    }

    pub async fn create_bucket(
        &self,
        cancel: &CancellationToken,
        name: &str,
        attrs: BucketAttrs,
    ) -> Result<Bucket, Error> {
        let api = self
            .inner
            .backend
            .create_bucket(
                cancel,
                name,
                attrs.bucket_type.as_str(),
                &attrs.info,
                &attrs.lifecycle,
            )
            .await?;
        Ok(Bucket::from_api(self.clone(), api))
    }

    /// All buckets in the account.
    pub async fn buckets(&self, cancel: &CancellationToken) -> Result<Vec<Bucket>, Error> {
        let list = self.inner.backend.list_buckets(cancel).await?;
        Ok(list
            .into_iter()
            .map(|api| Bucket::from_api(self.clone(), api))
            .collect())
    }

    /// Live transfers, for monitoring.
    pub fn status(&self) -> StatusSnapshot {
        self.inner.registry.snapshot()
    }

    pub async fn create_key(
        &self,
        cancel: &CancellationToken,
        key_name: &str,
        capabilities: Vec<String>,
        valid_for: Option<Duration>,
        bucket_id: Option<String>,
        name_prefix: Option<String>,
    ) -> Result<Key, Error> {
        let api = self
            .inner
            .backend
            .create_key(cancel, key_name, capabilities, valid_for, bucket_id, name_prefix)
            .await?;
        Ok(Key {
            client: self.clone(),
            state: api,
        })
    }

    pub async fn list_keys(
        &self,
        cancel: &CancellationToken,
        max_count: u32,
        start_key_id: Option<String>,
    ) -> Result<(Vec<Key>, Option<String>), Error> {
        let page = self
            .inner
            .backend
            .list_keys(cancel, max_count, start_key_id)
            .await?;
        let keys = page
            .keys
            .into_iter()
            .map(|state| Key {
                client: self.clone(),
                state,
            })
            .collect();
        Ok((keys, page.next_application_key_id))
    }
}

/// An application key in the account.
///
/// The secret is only present on the handle returned by
/// [`Client::create_key`]; listed keys carry metadata alone.
#[derive(Clone)]
pub struct Key {
    client: Client,
    state: ApiKey,
}

impl Key {
    pub fn id(&self) -> &str {
        &self.state.application_key_id
    }

    pub fn name(&self) -> &str {
        &self.state.key_name
    }

    pub fn capabilities(&self) -> &[String] {
        &self.state.capabilities
    }

    /// The key material itself, when freshly created.
    pub fn secret(&self) -> Option<&str> {
        self.state.application_key.as_deref()
    }

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.state
            .expiration_timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// Revokes this key.
    pub async fn delete(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.client
            .inner
            .backend
            .delete_key(cancel, &self.state.application_key_id)
            .await
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BucketType {
    #[default]
    Private,
    Public,
}

impl BucketType {
    fn as_str(&self) -> &'static str {
        match self {
            BucketType::Private => "allPrivate",
            BucketType::Public => "allPublic",
        }
    }

    fn from_wire(s: &str) -> Self {
        match s {
            "allPublic" => BucketType::Public,
            _ => BucketType::Private,
        }
    }
}

/// Mutable bucket attributes. `revision` is maintained by the service and
/// used for optimistic concurrency on update.
#[derive(Clone, Debug, Default)]
pub struct BucketAttrs {
    pub bucket_type: BucketType,
    pub info: HashMap<String, String>,
    pub lifecycle: Vec<LifecycleRule>,
    pub revision: u64,
}

struct BucketCore {
    id: String,
    name: String,
}

/// A reference to one bucket.
#[derive(Clone)]
pub struct Bucket {
    client: Client,
    core: Arc<BucketCore>,
    attrs: Arc<Mutex<BucketAttrs>>,
}

impl Bucket {
    fn from_api(client: Client, api: b2_protocol::types::Bucket) -> Self {
        let attrs = BucketAttrs {
            bucket_type: BucketType::from_wire(&api.bucket_type),
            info: api.bucket_info,
            lifecycle: api.lifecycle_rules,
            revision: api.revision,
        };
        Self {
            client,
            core: Arc::new(BucketCore {
                id: api.bucket_id,
                name: api.bucket_name,
            }),
            attrs: Arc::new(Mutex::new(attrs)),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Attributes as of the last fetch or update through this handle.
    pub fn attrs(&self) -> BucketAttrs {
        self.attrs.lock().unwrap().clone()
    }

    /// Applies `attrs` if nobody else has updated the bucket since this
    /// handle last saw it; a lost race surfaces as an update-conflict error.
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        attrs: BucketAttrs,
    ) -> Result<BucketAttrs, Error> {
        let revision = self.attrs.lock().unwrap().revision;
        let api = self
            .client
            .inner
            .backend
            .update_bucket(
                cancel,
                &self.core.id,
                Some(attrs.bucket_type.as_str().to_owned()),
                Some(attrs.info),
                Some(attrs.lifecycle),
                Some(revision),
            )
            .await?;
        let fresh = BucketAttrs {
            bucket_type: BucketType::from_wire(&api.bucket_type),
            info: api.bucket_info,
            lifecycle: api.lifecycle_rules,
            revision: api.revision,
        };
        *self.attrs.lock().unwrap() = fresh.clone();
        Ok(fresh)
    }

    /// Removes the bucket, which must be empty.
    pub async fn delete(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.client.inner.backend.delete_bucket(cancel, &self.core.id).await
    }

    /// A reference to the named object. Nothing is fetched until the object
    /// is read, written, or stat'ed.
    pub fn object(&self, name: &str) -> Object {
        Object {
            client: self.client.clone(),
            core: self.core.clone(),
            name: name.to_owned(),
            resolved: Arc::new(Mutex::new(None)),
        }
    }

    /// One page of current file names, starting at `start`.
    pub async fn list_file_names(
        &self,
        cancel: &CancellationToken,
        max_count: u32,
        start: Option<String>,
    ) -> Result<(Vec<ObjectAttrs>, Option<String>), Error> {
        let page = self
            .client
            .inner
            .backend
            .list_file_names(cancel, &self.core.id, max_count, start)
            .await?;
        Ok((
            page.files.into_iter().map(ObjectAttrs::from).collect(),
            page.next_file_name,
        ))
    }

    /// One page of all file versions, including unfinished and hidden ones.
    pub async fn list_file_versions(
        &self,
        cancel: &CancellationToken,
        max_count: u32,
        start_name: Option<String>,
        start_id: Option<String>,
    ) -> Result<(Vec<ObjectAttrs>, Option<String>, Option<String>), Error> {
        let page = self
            .client
            .inner
            .backend
            .list_file_versions(cancel, &self.core.id, max_count, start_name, start_id)
            .await?;
        Ok((
            page.files.into_iter().map(ObjectAttrs::from).collect(),
            page.next_file_name,
            page.next_file_id,
        ))
    }

    /// A token third parties can use to download objects under `prefix`.
    pub async fn download_auth_token(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
        valid_for: Duration,
    ) -> Result<String, Error> {
        let auth = self
            .client
            .inner
            .backend
            .get_download_authorization(cancel, &self.core.id, prefix, valid_for)
            .await?;
        Ok(auth.authorization_token)
    }
}

/// Attributes of one file version.
#[derive(Clone, Debug)]
pub struct ObjectAttrs {
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub sha1: Option<String>,
    pub info: HashMap<String, String>,
    pub upload_timestamp: Option<DateTime<Utc>>,
    /// Caller-supplied mtime, when the uploader stored one.
    pub last_modified: Option<DateTime<Utc>>,
}

impl From<FileVersion> for ObjectAttrs {
    fn from(v: FileVersion) -> Self {
        let last_modified = v
            .file_info
            .get(LAST_MODIFIED_KEY)
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        let upload_timestamp = (v.upload_timestamp > 0)
            .then(|| Utc.timestamp_millis_opt(v.upload_timestamp).single())
            .flatten();
        Self {
            name: v.file_name,
            size: v.content_length,
            content_type: v.content_type,
            sha1: v.content_sha1,
            info: v.file_info,
            upload_timestamp,
            last_modified,
        }
    }
}

/// Attributes applied to an upload.
#[derive(Clone, Debug, Default)]
pub struct Attrs {
    pub content_type: Option<String>,
    pub info: HashMap<String, String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// A named entity within a bucket, resolved lazily to a concrete server-side
/// file version.
#[derive(Clone)]
pub struct Object {
    client: Client,
    core: Arc<BucketCore>,
    name: String,
    resolved: Arc<Mutex<Option<FileVersion>>>,
}

impl Object {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, cancel: &CancellationToken) -> Result<FileVersion, Error> {
        if let Some(v) = self.resolved.lock().unwrap().clone() {
            return Ok(v);
        }
        let page = self
            .client
            .inner
            .backend
            .list_file_names(cancel, &self.core.id, 1, Some(self.name.clone()))
            .await?;
        let found = page
            .files
            .into_iter()
            .find(|f| f.file_name == self.name)
            .ok_or_else(|| Error::NotFound(self.name.clone()))?;
        *self.resolved.lock().unwrap() = Some(found.clone());
        Ok(found)
    }

    pub async fn attrs(&self, cancel: &CancellationToken) -> Result<ObjectAttrs, Error> {
        // With a known file id, the per-file record is authoritative;
        // otherwise resolve by name first.
        let known = self.resolved.lock().unwrap().clone();
        if let Some(version) = known {
            let fresh = self
                .client
                .inner
                .backend
                .get_file_info(cancel, &version.file_id)
                .await?;
            *self.resolved.lock().unwrap() = Some(fresh.clone());
            return Ok(ObjectAttrs::from(fresh));
        }
        Ok(ObjectAttrs::from(self.resolve(cancel).await?))
    }

    /// A stream sink replacing this object's contents. All I/O runs under a
    /// child of `cancel`.
    pub fn writer(&self, cancel: &CancellationToken) -> Writer {
        let status = self.client.inner.registry.register(
            TransferKind::Writer,
            format!("{}/{}", self.core.name, self.name),
        );
        Writer::new(
            self.client.inner.backend.clone(),
            status,
            cancel,
            self.core.id.clone(),
            self.name.clone(),
            self.resolved.clone(),
        )
    }

    /// A stream source over the whole object.
    pub async fn reader(
        &self,
        cancel: &CancellationToken,
        opts: ReaderOptions,
    ) -> Result<Reader, Error> {
        let version = self.resolve(cancel).await?;
        Ok(self.make_reader(cancel, opts, 0, version.content_length))
    }

    /// A stream source over `[offset, offset+length)`. A negative `length`
    /// reads to end of file.
    pub async fn range_reader(
        &self,
        cancel: &CancellationToken,
        opts: ReaderOptions,
        offset: u64,
        length: i64,
    ) -> Result<Reader, Error> {
        let version = self.resolve(cancel).await?;
        let available = version.content_length.saturating_sub(offset);
        let length = if length < 0 {
            available
        } else {
            (length as u64).min(available)
        };
        Ok(self.make_reader(cancel, opts, offset, length))
    }

    fn make_reader(
        &self,
        cancel: &CancellationToken,
        opts: ReaderOptions,
        offset: u64,
        length: u64,
    ) -> Reader {
        let status = self.client.inner.registry.register(
            TransferKind::Reader,
            format!("{}/{}", self.core.name, self.name),
        );
        Reader::new(
            self.client.inner.backend.clone(),
            status,
            cancel,
            self.core.name.clone(),
            self.name.clone(),
            opts,
            offset,
            length,
        )
    }

    /// Removes the current version. Older versions of the same name, if any,
    /// become visible again.
    pub async fn delete(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let version = self.resolve(cancel).await?;
        self.client
            .inner
            .backend
            .delete_file_version(cancel, &version.file_name, &version.file_id)
            .await?;
        *self.resolved.lock().unwrap() = None;
        Ok(())
    }

    /// Hides the object from listings and downloads. Visibility is
    /// eventually consistent service-side.
    pub async fn hide(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.client
            .inner
            .backend
            .hide_file(cancel, &self.core.id, &self.name)
            .await?;
        *self.resolved.lock().unwrap() = None;
        Ok(())
    }
}
