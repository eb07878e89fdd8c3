use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The B2 operation an error originated from.
///
/// The classifier keys off this: a 401 means something different coming back
/// from `b2_authorize_account` than from `b2_upload_part`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    AuthorizeAccount,
    CreateBucket,
    ListBuckets,
    UpdateBucket,
    DeleteBucket,
    GetUploadUrl,
    UploadFile,
    StartLargeFile,
    GetUploadPartUrl,
    UploadPart,
    FinishLargeFile,
    CancelLargeFile,
    ListFileNames,
    ListFileVersions,
    ListParts,
    DownloadFileByName,
    HideFile,
    DeleteFileVersion,
    GetFileInfo,
    GetDownloadAuthorization,
    CreateKey,
    DeleteKey,
    ListKeys,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::AuthorizeAccount => "b2_authorize_account",
            Method::CreateBucket => "b2_create_bucket",
            Method::ListBuckets => "b2_list_buckets",
            Method::UpdateBucket => "b2_update_bucket",
            Method::DeleteBucket => "b2_delete_bucket",
            Method::GetUploadUrl => "b2_get_upload_url",
            Method::UploadFile => "b2_upload_file",
            Method::StartLargeFile => "b2_start_large_file",
            Method::GetUploadPartUrl => "b2_get_upload_part_url",
            Method::UploadPart => "b2_upload_part",
            Method::FinishLargeFile => "b2_finish_large_file",
            Method::CancelLargeFile => "b2_cancel_large_file",
            Method::ListFileNames => "b2_list_file_names",
            Method::ListFileVersions => "b2_list_file_versions",
            Method::ListParts => "b2_list_parts",
            Method::DownloadFileByName => "b2_download_file_by_name",
            Method::HideFile => "b2_hide_file",
            Method::DeleteFileVersion => "b2_delete_file_version",
            Method::GetFileInfo => "b2_get_file_info",
            Method::GetDownloadAuthorization => "b2_get_download_authorization",
            Method::CreateKey => "b2_create_key",
            Method::DeleteKey => "b2_delete_key",
            Method::ListKeys => "b2_list_keys",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller of a failed RPC should do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// The account token expired; re-issue `b2_authorize_account` and retry.
    ReAuthenticate,
    /// The upload endpoint is no longer usable; acquire a fresh one and retry.
    AttemptNewUpload,
    /// Transient; retry the same call after a delay.
    Retry,
    /// Terminal; surface to the caller.
    Punt,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The service answered with a non-success status.
    #[error("{method}: {message} (status {status})")]
    Api {
        method: Method,
        status: u16,
        message: String,
        /// Server-supplied `Retry-After`, when present.
        retry_after: Option<Duration>,
    },

    /// The request never produced a decodable response (connect failure,
    /// reset mid-body, bad JSON).
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    /// A download body failed or ended short while being consumed.
    #[error("stream: {0}")]
    Stream(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn api(method: Method, status: u16, message: impl Into<String>) -> Self {
        ProtocolError::Api {
            method,
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProtocolError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Server-suggested delay before the next attempt, if one was sent.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            ProtocolError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classifies this error into the action the retry layer should take.
    ///
    /// Rules are evaluated top-down; the first match wins.
    pub fn action(&self) -> Action {
        let (method, status, retry_after) = match self {
            // Transport-level failures carry no protocol verdict; treat as
            // transient with no suggested delay.
            ProtocolError::Transport(_) | ProtocolError::Stream(_) => return Action::Retry,
            ProtocolError::Api {
                method,
                status,
                retry_after,
                ..
            } => (*method, *status, *retry_after),
        };
        if retry_after.is_some_and(|d| !d.is_zero()) {
            return Action::Retry;
        }
        let upload = matches!(method, Method::UploadFile | Method::UploadPart);
        if (500..600).contains(&status) && upload {
            // The endpoint token may have been invalidated along with the
            // failed request.
            return Action::AttemptNewUpload;
        }
        match status {
            401 if method == Method::AuthorizeAccount => Action::Punt,
            401 if upload => Action::AttemptNewUpload,
            401 => Action::ReAuthenticate,
            408 | 429 | 500 | 503 => Action::Retry,
            _ => Action::Punt,
        }
    }
}
