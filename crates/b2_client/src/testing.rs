//! A programmable in-memory [`RawClient`] for driving the engine in tests.
//!
//! The fake keeps buckets, files, and unfinished large files in memory,
//! counts every call by operation name, and can be loaded with error
//! sequences that are handed out one per call. Part-level injections target a
//! specific part number, which keeps multi-worker tests deterministic.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use b2_protocol::types::{
    Authorization, Bucket, DownloadAuthorization, FileAction, FileDownload, FileVersion, Key,
    LifecycleRule, ListFileNames, ListFileVersions, ListKeys, ListParts, Part, UploadEndpoint,
};
use b2_protocol::{Method, ProtocolError};
use bytes::Bytes;

use crate::buffer::{sha1_hex, ChunkSource};
use crate::raw::RawClient;

/// Shorthand for a structured API error.
pub(crate) fn err(method: Method, status: u16) -> ProtocolError {
    ProtocolError::api(method, status, "injected")
}

pub(crate) fn err_with_retry_after(method: Method, status: u16, secs: u64) -> ProtocolError {
    ProtocolError::Api {
        method,
        status,
        message: "injected".into(),
        retry_after: Some(Duration::from_secs(secs)),
    }
}

#[derive(Clone)]
struct FakeFile {
    id: String,
    data: Bytes,
    content_type: String,
    sha1: String,
    info: HashMap<String, String>,
}

struct FakeLarge {
    name: String,
    bucket: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct FakeBucket {
    id: String,
    bucket_type: String,
    info: HashMap<String, String>,
    lifecycle: Vec<LifecycleRule>,
    revision: u64,
    files: BTreeMap<String, FakeFile>,
    hidden: HashSet<String>,
}

#[derive(Default)]
struct FakeState {
    buckets: BTreeMap<String, FakeBucket>,
    larges: HashMap<String, FakeLarge>,
    keys: Vec<Key>,
    next_id: u64,
    auths: u64,
}

pub(crate) struct FakeRaw {
    state: Mutex<FakeState>,
    counts: Mutex<HashMap<&'static str, usize>>,
    errors: Mutex<HashMap<&'static str, VecDeque<ProtocolError>>>,
    part_errors: Mutex<HashMap<u32, VecDeque<ProtocolError>>>,
    min_part_size: AtomicUsize,
    downloads_in_flight: AtomicUsize,
    downloads_high_water: AtomicUsize,
}

impl FakeRaw {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            counts: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
            part_errors: Mutex::new(HashMap::new()),
            min_part_size: AtomicUsize::new(5),
            downloads_in_flight: AtomicUsize::new(0),
            downloads_high_water: AtomicUsize::new(0),
        })
    }

    /// Queues an error for the next call to `op`.
    pub(crate) fn push_error(&self, op: &'static str, e: ProtocolError) {
        self.errors.lock().unwrap().entry(op).or_default().push_back(e);
    }

    /// Queues an error for the next upload of the given part number.
    pub(crate) fn push_part_error(&self, part_number: u32, e: ProtocolError) {
        self.part_errors
            .lock()
            .unwrap()
            .entry(part_number)
            .or_default()
            .push_back(e);
    }

    pub(crate) fn calls(&self, op: &str) -> usize {
        self.counts.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    pub(crate) fn set_min_part_size(&self, n: usize) {
        self.min_part_size.store(n, Ordering::SeqCst);
    }

    /// High-water mark of concurrent range downloads.
    pub(crate) fn max_downloads_in_flight(&self) -> usize {
        self.downloads_high_water.load(Ordering::SeqCst)
    }

    /// Finished contents of a file, if present.
    pub(crate) fn file_contents(&self, bucket: &str, name: &str) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        let b = state.buckets.get(bucket)?;
        b.files.get(name).map(|f| f.data.clone())
    }

    /// Number of unfinished large files.
    pub(crate) fn unfinished_large_files(&self) -> usize {
        self.state.lock().unwrap().larges.len()
    }

    /// Pre-seeds a finished file, bypassing the upload path.
    pub(crate) fn seed_file(&self, bucket: &str, name: &str, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("4_z{}", state.next_id);
        let b = state
            .buckets
            .entry(bucket.to_owned())
            .or_insert_with(|| FakeBucket {
                id: format!("bkt-{bucket}"),
                bucket_type: "allPrivate".into(),
                revision: 1,
                ..FakeBucket::default()
            });
        b.files.insert(
            name.to_owned(),
            FakeFile {
                id,
                data: Bytes::copy_from_slice(data),
                content_type: "application/octet-stream".into(),
                sha1: sha1_hex(data),
                info: HashMap::new(),
            },
        );
    }

    /// Pre-seeds an unfinished large file with the given parts, as if a
    /// previous writer died mid-upload. Returns the file id.
    pub(crate) fn seed_unfinished_large(
        &self,
        bucket: &str,
        name: &str,
        parts: &[&[u8]],
    ) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("4_z{}", state.next_id);
        let bucket_id = state
            .buckets
            .get(bucket)
            .map(|b| b.id.clone())
            .unwrap_or_else(|| format!("bkt-{bucket}"));
        let mut stored = BTreeMap::new();
        for (i, data) in parts.iter().enumerate() {
            stored.insert(
                i as u32 + 1,
                (sha1_hex(data), Bytes::copy_from_slice(data)),
            );
        }
        state.larges.insert(
            id.clone(),
            FakeLarge {
                name: name.to_owned(),
                bucket: bucket_id,
                parts: stored,
            },
        );
        id
    }

    fn tick(&self, op: &'static str) -> Result<(), ProtocolError> {
        *self.counts.lock().unwrap().entry(op).or_insert(0) += 1;
        if let Some(queue) = self.errors.lock().unwrap().get_mut(op) {
            if let Some(e) = queue.pop_front() {
                return Err(e);
            }
        }
        Ok(())
    }

    fn new_id(&self) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        format!("4_z{}", state.next_id)
    }

    fn version_of(name: &str, file: &FakeFile) -> FileVersion {
        FileVersion {
            file_id: file.id.clone(),
            file_name: name.to_owned(),
            action: Some(FileAction::Upload),
            content_length: file.data.len() as u64,
            content_sha1: Some(file.sha1.clone()),
            content_type: Some(file.content_type.clone()),
            file_info: file.info.clone(),
            upload_timestamp: 0,
        }
    }
}

#[async_trait]
impl RawClient for FakeRaw {
    async fn authorize_account(
        &self,
        _key_id: &str,
        _key: &str,
    ) -> Result<Authorization, ProtocolError> {
        self.tick("authorize_account")?;
        let mut state = self.state.lock().unwrap();
        state.auths += 1;
        Ok(Authorization {
            account_id: "acct".into(),
            authorization_token: format!("tok-{}", state.auths),
            api_url: "fake://api".into(),
            download_url: "fake://download".into(),
            minimum_part_size: self.min_part_size.load(Ordering::SeqCst) as u64,
        })
    }

    async fn create_bucket(
        &self,
        _auth: &Authorization,
        name: &str,
        bucket_type: &str,
        info: &HashMap<String, String>,
        lifecycle: &[LifecycleRule],
    ) -> Result<Bucket, ProtocolError> {
        self.tick("create_bucket")?;
        let mut state = self.state.lock().unwrap();
        if state.buckets.contains_key(name) {
            return Err(ProtocolError::api(
                Method::CreateBucket,
                400,
                "duplicate bucket name",
            ));
        }
        state.next_id += 1;
        let id = format!("bkt-{}", state.next_id);
        state.buckets.insert(
            name.to_owned(),
            FakeBucket {
                id: id.clone(),
                bucket_type: bucket_type.to_owned(),
                info: info.clone(),
                lifecycle: lifecycle.to_vec(),
                revision: 1,
                ..FakeBucket::default()
            },
        );
        Ok(Bucket {
            bucket_id: id,
            bucket_name: name.to_owned(),
            bucket_type: bucket_type.to_owned(),
            bucket_info: info.clone(),
            lifecycle_rules: lifecycle.to_vec(),
            revision: 1,
        })
    }

    async fn list_buckets(&self, _auth: &Authorization) -> Result<Vec<Bucket>, ProtocolError> {
        self.tick("list_buckets")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .buckets
            .iter()
            .map(|(name, b)| Bucket {
                bucket_id: b.id.clone(),
                bucket_name: name.clone(),
                bucket_type: b.bucket_type.clone(),
                bucket_info: b.info.clone(),
                lifecycle_rules: b.lifecycle.clone(),
                revision: b.revision,
            })
            .collect())
    }

    async fn update_bucket(
        &self,
        _auth: &Authorization,
        bucket_id: &str,
        bucket_type: Option<&str>,
        info: Option<&HashMap<String, String>>,
        lifecycle: Option<&[LifecycleRule]>,
        if_revision_is: Option<u64>,
    ) -> Result<Bucket, ProtocolError> {
        self.tick("update_bucket")?;
        let mut state = self.state.lock().unwrap();
        let Some((name, b)) = state
            .buckets
            .iter_mut()
            .find(|(_, b)| b.id == bucket_id)
            .map(|(n, b)| (n.clone(), b))
        else {
            return Err(ProtocolError::api(Method::UpdateBucket, 404, "no such bucket"));
        };
        if let Some(want) = if_revision_is {
            if want != b.revision {
                return Err(ProtocolError::api(
                    Method::UpdateBucket,
                    409,
                    "conflict: bucket revision changed",
                ));
            }
        }
        if let Some(t) = bucket_type {
            b.bucket_type = t.to_owned();
        }
        if let Some(i) = info {
            b.info = i.clone();
        }
        if let Some(l) = lifecycle {
            b.lifecycle = l.to_vec();
        }
        b.revision += 1;
        Ok(Bucket {
            bucket_id: b.id.clone(),
            bucket_name: name,
            bucket_type: b.bucket_type.clone(),
            bucket_info: b.info.clone(),
            lifecycle_rules: b.lifecycle.clone(),
            revision: b.revision,
        })
    }

    async fn delete_bucket(
        &self,
        _auth: &Authorization,
        bucket_id: &str,
    ) -> Result<(), ProtocolError> {
        self.tick("delete_bucket")?;
        let mut state = self.state.lock().unwrap();
        let Some(name) = state
            .buckets
            .iter()
            .find(|(_, b)| b.id == bucket_id)
            .map(|(n, _)| n.clone())
        else {
            return Err(ProtocolError::api(Method::DeleteBucket, 404, "no such bucket"));
        };
        if !state.buckets[&name].files.is_empty() {
            return Err(ProtocolError::api(Method::DeleteBucket, 400, "bucket not empty"));
        }
        state.buckets.remove(&name);
        Ok(())
    }

    async fn get_upload_url(
        &self,
        _auth: &Authorization,
        bucket_id: &str,
    ) -> Result<UploadEndpoint, ProtocolError> {
        self.tick("get_upload_url")?;
        Ok(UploadEndpoint {
            upload_url: format!("fake://upload/{bucket_id}"),
            authorization_token: "up-tok".into(),
        })
    }

    async fn upload_file(
        &self,
        endpoint: &UploadEndpoint,
        file_name: &str,
        content_type: &str,
        sha1: &str,
        content_length: u64,
        info: &HashMap<String, String>,
        data: &ChunkSource,
    ) -> Result<FileVersion, ProtocolError> {
        self.tick("upload_file")?;
        let bucket_id = endpoint
            .upload_url
            .strip_prefix("fake://upload/")
            .unwrap_or_default()
            .to_owned();
        let bytes = data.read_bytes()?;
        if bytes.len() as u64 != content_length || sha1_hex(&bytes) != sha1 {
            return Err(ProtocolError::api(
                Method::UploadFile,
                400,
                "content does not match declared length/sha1",
            ));
        }
        let id = self.new_id();
        let mut state = self.state.lock().unwrap();
        let Some(b) = state.buckets.values_mut().find(|b| b.id == bucket_id) else {
            return Err(ProtocolError::api(Method::UploadFile, 404, "no such bucket"));
        };
        let file = FakeFile {
            id: id.clone(),
            data: bytes,
            content_type: content_type.to_owned(),
            sha1: sha1.to_owned(),
            info: info.clone(),
        };
        b.hidden.remove(file_name);
        let version = Self::version_of(file_name, &file);
        b.files.insert(file_name.to_owned(), file);
        Ok(version)
    }

    async fn start_large_file(
        &self,
        _auth: &Authorization,
        bucket_id: &str,
        file_name: &str,
        _content_type: &str,
        _info: &HashMap<String, String>,
    ) -> Result<FileVersion, ProtocolError> {
        self.tick("start_large_file")?;
        let id = self.new_id();
        let mut state = self.state.lock().unwrap();
        state.larges.insert(
            id.clone(),
            FakeLarge {
                name: file_name.to_owned(),
                bucket: bucket_id.to_owned(),
                parts: BTreeMap::new(),
            },
        );
        Ok(FileVersion {
            file_id: id,
            file_name: file_name.to_owned(),
            action: Some(FileAction::Start),
            content_length: 0,
            content_sha1: None,
            content_type: None,
            file_info: HashMap::new(),
            upload_timestamp: 0,
        })
    }

    async fn get_upload_part_url(
        &self,
        _auth: &Authorization,
        file_id: &str,
    ) -> Result<UploadEndpoint, ProtocolError> {
        self.tick("get_upload_part_url")?;
        Ok(UploadEndpoint {
            upload_url: format!("fake://part/{file_id}"),
            authorization_token: "part-tok".into(),
        })
    }

    async fn upload_part(
        &self,
        endpoint: &UploadEndpoint,
        part_number: u32,
        sha1: &str,
        content_length: u64,
        data: &ChunkSource,
    ) -> Result<(), ProtocolError> {
        self.tick("upload_part")?;
        if let Some(queue) = self.part_errors.lock().unwrap().get_mut(&part_number) {
            if let Some(e) = queue.pop_front() {
                return Err(e);
            }
        }
        let file_id = endpoint
            .upload_url
            .strip_prefix("fake://part/")
            .unwrap_or_default()
            .to_owned();
        let bytes = data.read_bytes()?;
        if bytes.len() as u64 != content_length || sha1_hex(&bytes) != sha1 {
            return Err(ProtocolError::api(
                Method::UploadPart,
                400,
                "content does not match declared length/sha1",
            ));
        }
        let mut state = self.state.lock().unwrap();
        let Some(large) = state.larges.get_mut(&file_id) else {
            return Err(ProtocolError::api(Method::UploadPart, 404, "no such large file"));
        };
        large.parts.insert(part_number, (sha1.to_owned(), bytes));
        Ok(())
    }

    async fn finish_large_file(
        &self,
        _auth: &Authorization,
        file_id: &str,
        part_sha1_array: &[String],
    ) -> Result<FileVersion, ProtocolError> {
        self.tick("finish_large_file")?;
        let mut state = self.state.lock().unwrap();
        let Some(large) = state.larges.remove(file_id) else {
            return Err(ProtocolError::api(
                Method::FinishLargeFile,
                404,
                "no such large file",
            ));
        };
        if large.parts.len() != part_sha1_array.len() {
            return Err(ProtocolError::api(
                Method::FinishLargeFile,
                400,
                "part count does not match sha array",
            ));
        }
        let mut data = Vec::new();
        for (i, sha) in part_sha1_array.iter().enumerate() {
            let number = i as u32 + 1;
            let Some((stored_sha, bytes)) = large.parts.get(&number) else {
                return Err(ProtocolError::api(
                    Method::FinishLargeFile,
                    400,
                    "missing part",
                ));
            };
            if stored_sha != sha {
                return Err(ProtocolError::api(
                    Method::FinishLargeFile,
                    400,
                    "part sha mismatch",
                ));
            }
            data.extend_from_slice(bytes);
        }
        let sha1 = sha1_hex(&data);
        let file = FakeFile {
            id: file_id.to_owned(),
            data: data.into(),
            content_type: "application/octet-stream".into(),
            sha1,
            info: HashMap::new(),
        };
        let version = Self::version_of(&large.name, &file);
        let Some(b) = state.buckets.values_mut().find(|b| b.id == large.bucket) else {
            return Err(ProtocolError::api(
                Method::FinishLargeFile,
                404,
                "no such bucket",
            ));
        };
        b.hidden.remove(&large.name);
        b.files.insert(large.name.clone(), file);
        Ok(version)
    }

    async fn cancel_large_file(
        &self,
        _auth: &Authorization,
        file_id: &str,
    ) -> Result<(), ProtocolError> {
        self.tick("cancel_large_file")?;
        let mut state = self.state.lock().unwrap();
        if state.larges.remove(file_id).is_none() {
            return Err(ProtocolError::api(
                Method::CancelLargeFile,
                404,
                "no such large file",
            ));
        }
        Ok(())
    }

    async fn list_file_names(
        &self,
        _auth: &Authorization,
        bucket_id: &str,
        max_file_count: u32,
        start_file_name: Option<&str>,
    ) -> Result<ListFileNames, ProtocolError> {
        self.tick("list_file_names")?;
        let state = self.state.lock().unwrap();
        let Some(b) = state.buckets.values().find(|b| b.id == bucket_id) else {
            return Err(ProtocolError::api(Method::ListFileNames, 404, "no such bucket"));
        };
        let mut files: Vec<FileVersion> = b
            .files
            .iter()
            .filter(|(name, _)| !b.hidden.contains(*name))
            .filter(|(name, _)| start_file_name.is_none_or(|s| name.as_str() >= s))
            .map(|(name, f)| Self::version_of(name, f))
            .collect();
        let next_file_name = if files.len() > max_file_count as usize {
            files.truncate(max_file_count as usize);
            files.last().map(|f| f.file_name.clone())
        } else {
            None
        };
        Ok(ListFileNames {
            files,
            next_file_name,
        })
    }

    async fn list_file_versions(
        &self,
        _auth: &Authorization,
        bucket_id: &str,
        max_file_count: u32,
        start_file_name: Option<&str>,
        _start_file_id: Option<&str>,
    ) -> Result<ListFileVersions, ProtocolError> {
        self.tick("list_file_versions")?;
        let state = self.state.lock().unwrap();
        let Some(b) = state.buckets.values().find(|b| b.id == bucket_id) else {
            return Err(ProtocolError::api(
                Method::ListFileVersions,
                404,
                "no such bucket",
            ));
        };
        let mut files: Vec<FileVersion> = b
            .files
            .iter()
            .map(|(name, f)| Self::version_of(name, f))
            .collect();
        for (id, large) in &state.larges {
            if large.bucket == bucket_id {
                files.push(FileVersion {
                    file_id: id.clone(),
                    file_name: large.name.clone(),
                    action: Some(FileAction::Start),
                    content_length: 0,
                    content_sha1: None,
                    content_type: None,
                    file_info: HashMap::new(),
                    upload_timestamp: 0,
                });
            }
        }
        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        files.retain(|f| start_file_name.is_none_or(|s| f.file_name.as_str() >= s));
        files.truncate(max_file_count as usize);
        Ok(ListFileVersions {
            files,
            next_file_name: None,
            next_file_id: None,
        })
    }

    async fn list_parts(
        &self,
        _auth: &Authorization,
        file_id: &str,
        max_part_count: u32,
        start_part_number: Option<u32>,
    ) -> Result<ListParts, ProtocolError> {
        self.tick("list_parts")?;
        let state = self.state.lock().unwrap();
        let Some(large) = state.larges.get(file_id) else {
            return Err(ProtocolError::api(Method::ListParts, 404, "no such large file"));
        };
        let start = start_part_number.unwrap_or(1);
        let mut parts: Vec<Part> = large
            .parts
            .iter()
            .filter(|(n, _)| **n >= start)
            .map(|(n, (sha, bytes))| Part {
                part_number: *n,
                content_length: bytes.len() as u64,
                content_sha1: sha.clone(),
            })
            .collect();
        let next_part_number = if parts.len() > max_part_count as usize {
            parts.truncate(max_part_count as usize);
            parts.last().map(|p| p.part_number + 1)
        } else {
            None
        };
        Ok(ListParts {
            parts,
            next_part_number,
        })
    }

    async fn hide_file(
        &self,
        _auth: &Authorization,
        bucket_id: &str,
        file_name: &str,
    ) -> Result<FileVersion, ProtocolError> {
        self.tick("hide_file")?;
        let id = self.new_id();
        let mut state = self.state.lock().unwrap();
        let Some(b) = state.buckets.values_mut().find(|b| b.id == bucket_id) else {
            return Err(ProtocolError::api(Method::HideFile, 404, "no such bucket"));
        };
        b.hidden.insert(file_name.to_owned());
        Ok(FileVersion {
            file_id: id,
            file_name: file_name.to_owned(),
            action: Some(FileAction::Hide),
            content_length: 0,
            content_sha1: None,
            content_type: None,
            file_info: HashMap::new(),
            upload_timestamp: 0,
        })
    }

    async fn delete_file_version(
        &self,
        _auth: &Authorization,
        file_name: &str,
        file_id: &str,
    ) -> Result<(), ProtocolError> {
        self.tick("delete_file_version")?;
        let mut state = self.state.lock().unwrap();
        for b in state.buckets.values_mut() {
            if b.files.get(file_name).is_some_and(|f| f.id == file_id) {
                b.files.remove(file_name);
                b.hidden.remove(file_name);
                return Ok(());
            }
        }
        Err(ProtocolError::api(
            Method::DeleteFileVersion,
            404,
            "no such file version",
        ))
    }

    async fn get_file_info(
        &self,
        _auth: &Authorization,
        file_id: &str,
    ) -> Result<FileVersion, ProtocolError> {
        self.tick("get_file_info")?;
        let state = self.state.lock().unwrap();
        for b in state.buckets.values() {
            for (name, f) in &b.files {
                if f.id == file_id {
                    return Ok(Self::version_of(name, f));
                }
            }
        }
        Err(ProtocolError::api(Method::GetFileInfo, 404, "no such file"))
    }

    async fn get_download_authorization(
        &self,
        _auth: &Authorization,
        bucket_id: &str,
        file_name_prefix: &str,
        _valid_for: Duration,
    ) -> Result<DownloadAuthorization, ProtocolError> {
        self.tick("get_download_authorization")?;
        Ok(DownloadAuthorization {
            bucket_id: bucket_id.to_owned(),
            file_name_prefix: file_name_prefix.to_owned(),
            authorization_token: "dl-tok".into(),
        })
    }

    async fn create_key(
        &self,
        auth: &Authorization,
        key_name: &str,
        capabilities: &[String],
        _valid_for: Option<Duration>,
        bucket_id: Option<&str>,
        name_prefix: Option<&str>,
    ) -> Result<Key, ProtocolError> {
        self.tick("create_key")?;
        let key = Key {
            application_key_id: self.new_id(),
            key_name: key_name.to_owned(),
            account_id: auth.account_id.clone(),
            capabilities: capabilities.to_vec(),
            application_key: Some("secret".into()),
            expiration_timestamp: None,
            bucket_id: bucket_id.map(str::to_owned),
            name_prefix: name_prefix.map(str::to_owned),
        };
        // Listings never reveal the key material again.
        let mut stored = key.clone();
        stored.application_key = None;
        self.state.lock().unwrap().keys.push(stored);
        Ok(key)
    }

    async fn delete_key(
        &self,
        _auth: &Authorization,
        application_key_id: &str,
    ) -> Result<(), ProtocolError> {
        self.tick("delete_key")?;
        let mut state = self.state.lock().unwrap();
        let Some(pos) = state
            .keys
            .iter()
            .position(|k| k.application_key_id == application_key_id)
        else {
            return Err(ProtocolError::api(Method::DeleteKey, 404, "no such key"));
        };
        state.keys.remove(pos);
        Ok(())
    }

    async fn list_keys(
        &self,
        _auth: &Authorization,
        _max_key_count: u32,
        _start_application_key_id: Option<&str>,
    ) -> Result<ListKeys, ProtocolError> {
        self.tick("list_keys")?;
        Ok(ListKeys {
            keys: self.state.lock().unwrap().keys.clone(),
            next_application_key_id: None,
        })
    }

    async fn download_file_by_name(
        &self,
        _auth: &Authorization,
        bucket_name: &str,
        file_name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<FileDownload, ProtocolError> {
        self.tick("download_file_by_name")?;
        let data = {
            let state = self.state.lock().unwrap();
            let Some(b) = state.buckets.get(bucket_name) else {
                return Err(ProtocolError::api(
                    Method::DownloadFileByName,
                    404,
                    "no such bucket",
                ));
            };
            if b.hidden.contains(file_name) {
                return Err(ProtocolError::api(
                    Method::DownloadFileByName,
                    404,
                    "file is hidden",
                ));
            }
            let Some(f) = b.files.get(file_name) else {
                return Err(ProtocolError::api(
                    Method::DownloadFileByName,
                    404,
                    "no such file",
                ));
            };
            f.clone()
        };

        // Track overlap so tests can assert the in-flight cap. The yields
        // give other workers a chance to run while this "request" is open.
        let current = self.downloads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.downloads_high_water.fetch_max(current, Ordering::SeqCst);
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        self.downloads_in_flight.fetch_sub(1, Ordering::SeqCst);

        let end = match length {
            Some(len) => (offset + len).min(data.data.len() as u64),
            None => data.data.len() as u64,
        };
        if offset > data.data.len() as u64 {
            return Err(ProtocolError::api(
                Method::DownloadFileByName,
                416,
                "range not satisfiable",
            ));
        }
        let slice = data.data.slice(offset as usize..end as usize);
        let content_length = slice.len() as u64;
        Ok(FileDownload {
            file_id: Some(data.id),
            content_length,
            content_type: Some(data.content_type),
            content_sha1: Some(data.sha1),
            info: data.info,
            body: Box::pin(futures::stream::iter(vec![Ok(slice)])),
        })
    }
}
