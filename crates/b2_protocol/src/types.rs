//! Response models for the B2 v1 API.
//!
//! Request bodies are private to [`crate::http`]; only what callers consume
//! lives here.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use serde::Deserialize;

/// Session material returned by `b2_authorize_account`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub account_id: String,
    pub authorization_token: String,
    /// Base URL for all control calls in this session.
    pub api_url: String,
    /// Base URL for `b2_download_file_by_name`.
    pub download_url: String,
    /// Smallest part size the service will accept for multipart uploads.
    pub minimum_part_size: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub bucket_id: String,
    pub bucket_name: String,
    pub bucket_type: String,
    #[serde(default)]
    pub bucket_info: HashMap<String, String>,
    #[serde(default)]
    pub lifecycle_rules: Vec<LifecycleRule>,
    #[serde(default)]
    pub revision: u64,
}

#[derive(Clone, Debug, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleRule {
    pub file_name_prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_from_uploading_to_hiding: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_from_hiding_to_deleting: Option<u32>,
}

/// Lifecycle stage of a file version.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    /// An unfinished large file.
    Start,
    Upload,
    Hide,
    Folder,
    #[serde(other)]
    Unknown,
}

/// A concrete server-side file version.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVersion {
    pub file_id: String,
    pub file_name: String,
    #[serde(default)]
    pub action: Option<FileAction>,
    #[serde(default, alias = "size")]
    pub content_length: u64,
    #[serde(default)]
    pub content_sha1: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub file_info: HashMap<String, String>,
    /// Millis since epoch.
    #[serde(default)]
    pub upload_timestamp: i64,
}

/// A transient (url, token) pair for uploading a file or a part.
///
/// Logically single-use: after any failure the server may reject reuse, and a
/// fresh endpoint must be acquired.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEndpoint {
    pub upload_url: String,
    pub authorization_token: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// 1-based.
    pub part_number: u32,
    pub content_length: u64,
    pub content_sha1: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListBuckets {
    pub buckets: Vec<Bucket>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFileNames {
    pub files: Vec<FileVersion>,
    pub next_file_name: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFileVersions {
    pub files: Vec<FileVersion>,
    pub next_file_name: Option<String>,
    pub next_file_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParts {
    pub parts: Vec<Part>,
    pub next_part_number: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadAuthorization {
    pub bucket_id: String,
    pub file_name_prefix: String,
    pub authorization_token: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Key {
    pub application_key_id: String,
    pub key_name: String,
    pub account_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Only present in the `b2_create_key` response.
    #[serde(default)]
    pub application_key: Option<String>,
    #[serde(default)]
    pub expiration_timestamp: Option<i64>,
    #[serde(default)]
    pub bucket_id: Option<String>,
    #[serde(default)]
    pub name_prefix: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListKeys {
    pub keys: Vec<Key>,
    pub next_application_key_id: Option<String>,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// A streaming download plus the metadata decoded from its headers.
pub struct FileDownload {
    pub file_id: Option<String>,
    pub content_length: u64,
    pub content_type: Option<String>,
    pub content_sha1: Option<String>,
    pub info: HashMap<String, String>,
    pub body: ByteStream,
}

impl FileDownload {
    /// Drains the body into a single buffer.
    pub async fn collect(self) -> io::Result<Bytes> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        if chunks.len() == 1 {
            return Ok(chunks.into_iter().next().unwrap_or_default());
        }
        let mut buf = Vec::with_capacity(self.content_length as usize);
        for chunk in chunks {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.into())
    }
}

impl std::fmt::Debug for FileDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDownload")
            .field("file_id", &self.file_id)
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .field("content_sha1", &self.content_sha1)
            .finish_non_exhaustive()
    }
}
