//! The RPC leaves: one HTTP round-trip per B2 operation.
//!
//! This layer is deliberately policy-free. It never retries, never sleeps,
//! and never touches tokens beyond putting them in headers; callers hold the
//! [`Authorization`] state and decide what a failure means via
//! [`ProtocolError::action`].

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::TryStreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, RANGE, RETRY_AFTER};
use reqwest::{Body, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{API_BASE, API_PATH, CONNECT_TIMEOUT};
use crate::error::{Method, ProtocolError};
use crate::types::{
    Authorization, Bucket, DownloadAuthorization, FileDownload, FileVersion, Key, LifecycleRule,
    ListBuckets, ListFileNames, ListFileVersions, ListKeys, ListParts, UploadEndpoint,
};

#[derive(Clone)]
pub struct ProtocolClient {
    http: reqwest::Client,
}

impl Default for ProtocolClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Wraps `b2_authorize_account`. The only call that uses HTTP Basic.
    pub async fn authorize_account(
        &self,
        key_id: &str,
        key: &str,
    ) -> Result<Authorization, ProtocolError> {
        let method = Method::AuthorizeAccount;
        let basic = BASE64.encode(format!("{key_id}:{key}"));
        let url = format!("{API_BASE}{API_PATH}{method}");
        let resp = self
            .http
            .get(&url)
            .header(AUTHORIZATION, format!("Basic {basic}"))
            .send()
            .await?;
        decode(method, resp).await
    }

    pub async fn create_bucket(
        &self,
        auth: &Authorization,
        name: &str,
        bucket_type: &str,
        info: &HashMap<String, String>,
        lifecycle: &[LifecycleRule],
    ) -> Result<Bucket, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            account_id: &'a str,
            bucket_name: &'a str,
            bucket_type: &'a str,
            bucket_info: &'a HashMap<String, String>,
            lifecycle_rules: &'a [LifecycleRule],
        }
        self.call(
            auth,
            Method::CreateBucket,
            &Req {
                account_id: &auth.account_id,
                bucket_name: name,
                bucket_type,
                bucket_info: info,
                lifecycle_rules: lifecycle,
            },
        )
        .await
    }

    pub async fn list_buckets(&self, auth: &Authorization) -> Result<ListBuckets, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            account_id: &'a str,
        }
        self.call(
            auth,
            Method::ListBuckets,
            &Req {
                account_id: &auth.account_id,
            },
        )
        .await
    }

    /// Wraps `b2_update_bucket`. `if_revision_is` makes the update
    /// conditional server-side; a mismatch comes back as 409.
    pub async fn update_bucket(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        bucket_type: Option<&str>,
        info: Option<&HashMap<String, String>>,
        lifecycle: Option<&[LifecycleRule]>,
        if_revision_is: Option<u64>,
    ) -> Result<Bucket, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            account_id: &'a str,
            bucket_id: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            bucket_type: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            bucket_info: Option<&'a HashMap<String, String>>,
            #[serde(skip_serializing_if = "Option::is_none")]
            lifecycle_rules: Option<&'a [LifecycleRule]>,
            #[serde(skip_serializing_if = "Option::is_none")]
            if_revision_is: Option<u64>,
        }
        self.call(
            auth,
            Method::UpdateBucket,
            &Req {
                account_id: &auth.account_id,
                bucket_id,
                bucket_type,
                bucket_info: info,
                lifecycle_rules: lifecycle,
                if_revision_is,
            },
        )
        .await
    }

    pub async fn delete_bucket(
        &self,
        auth: &Authorization,
        bucket_id: &str,
    ) -> Result<(), ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            account_id: &'a str,
            bucket_id: &'a str,
        }
        let _: serde_json::Value = self
            .call(
                auth,
                Method::DeleteBucket,
                &Req {
                    account_id: &auth.account_id,
                    bucket_id,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn get_upload_url(
        &self,
        auth: &Authorization,
        bucket_id: &str,
    ) -> Result<UploadEndpoint, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            bucket_id: &'a str,
        }
        self.call(auth, Method::GetUploadUrl, &Req { bucket_id }).await
    }

    /// Wraps `b2_upload_file`. POSTs raw bytes to a previously acquired
    /// upload endpoint; this does not go through the session API URL.
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_file(
        &self,
        endpoint: &UploadEndpoint,
        file_name: &str,
        content_type: &str,
        sha1_hex: &str,
        content_length: u64,
        info: &HashMap<String, String>,
        body: Body,
    ) -> Result<FileVersion, ProtocolError> {
        let method = Method::UploadFile;
        let mut req = self
            .http
            .post(&endpoint.upload_url)
            .header(AUTHORIZATION, &endpoint.authorization_token)
            .header("X-Bz-File-Name", urlencoding::encode(file_name).into_owned())
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, content_length)
            .header("X-Bz-Content-Sha1", sha1_hex);
        for (k, v) in info {
            req = req.header(format!("X-Bz-Info-{k}"), v.as_str());
        }
        let resp = req.body(body).send().await?;
        decode(method, resp).await
    }

    pub async fn start_large_file(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        file_name: &str,
        content_type: &str,
        info: &HashMap<String, String>,
    ) -> Result<FileVersion, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            bucket_id: &'a str,
            file_name: &'a str,
            content_type: &'a str,
            file_info: &'a HashMap<String, String>,
        }
        self.call(
            auth,
            Method::StartLargeFile,
            &Req {
                bucket_id,
                file_name,
                content_type,
                file_info: info,
            },
        )
        .await
    }

    pub async fn get_upload_part_url(
        &self,
        auth: &Authorization,
        file_id: &str,
    ) -> Result<UploadEndpoint, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            file_id: &'a str,
        }
        self.call(auth, Method::GetUploadPartUrl, &Req { file_id }).await
    }

    /// Wraps `b2_upload_part`. Part numbers are 1-based.
    pub async fn upload_part(
        &self,
        endpoint: &UploadEndpoint,
        part_number: u32,
        sha1_hex: &str,
        content_length: u64,
        body: Body,
    ) -> Result<(), ProtocolError> {
        let method = Method::UploadPart;
        let resp = self
            .http
            .post(&endpoint.upload_url)
            .header(AUTHORIZATION, &endpoint.authorization_token)
            .header("X-Bz-Part-Number", part_number)
            .header(CONTENT_LENGTH, content_length)
            .header("X-Bz-Content-Sha1", sha1_hex)
            .body(body)
            .send()
            .await?;
        let _: serde_json::Value = decode(method, resp).await?;
        Ok(())
    }

    pub async fn finish_large_file(
        &self,
        auth: &Authorization,
        file_id: &str,
        part_sha1_array: &[String],
    ) -> Result<FileVersion, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            file_id: &'a str,
            part_sha1_array: &'a [String],
        }
        self.call(
            auth,
            Method::FinishLargeFile,
            &Req {
                file_id,
                part_sha1_array,
            },
        )
        .await
    }

    pub async fn cancel_large_file(
        &self,
        auth: &Authorization,
        file_id: &str,
    ) -> Result<(), ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            file_id: &'a str,
        }
        let _: serde_json::Value = self
            .call(auth, Method::CancelLargeFile, &Req { file_id })
            .await?;
        Ok(())
    }

    pub async fn list_file_names(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        max_file_count: u32,
        start_file_name: Option<&str>,
    ) -> Result<ListFileNames, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            bucket_id: &'a str,
            max_file_count: u32,
            #[serde(skip_serializing_if = "Option::is_none")]
            start_file_name: Option<&'a str>,
        }
        self.call(
            auth,
            Method::ListFileNames,
            &Req {
                bucket_id,
                max_file_count,
                start_file_name,
            },
        )
        .await
    }

    pub async fn list_file_versions(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        max_file_count: u32,
        start_file_name: Option<&str>,
        start_file_id: Option<&str>,
    ) -> Result<ListFileVersions, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            bucket_id: &'a str,
            max_file_count: u32,
            #[serde(skip_serializing_if = "Option::is_none")]
            start_file_name: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            start_file_id: Option<&'a str>,
        }
        self.call(
            auth,
            Method::ListFileVersions,
            &Req {
                bucket_id,
                max_file_count,
                start_file_name,
                start_file_id,
            },
        )
        .await
    }

    pub async fn list_parts(
        &self,
        auth: &Authorization,
        file_id: &str,
        max_part_count: u32,
        start_part_number: Option<u32>,
    ) -> Result<ListParts, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            file_id: &'a str,
            max_part_count: u32,
            #[serde(skip_serializing_if = "Option::is_none")]
            start_part_number: Option<u32>,
        }
        self.call(
            auth,
            Method::ListParts,
            &Req {
                file_id,
                max_part_count,
                start_part_number,
            },
        )
        .await
    }

    pub async fn hide_file(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        file_name: &str,
    ) -> Result<FileVersion, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            bucket_id: &'a str,
            file_name: &'a str,
        }
        self.call(
            auth,
            Method::HideFile,
            &Req {
                bucket_id,
                file_name,
            },
        )
        .await
    }

    pub async fn delete_file_version(
        &self,
        auth: &Authorization,
        file_name: &str,
        file_id: &str,
    ) -> Result<(), ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            file_name: &'a str,
            file_id: &'a str,
        }
        let _: serde_json::Value = self
            .call(
                auth,
                Method::DeleteFileVersion,
                &Req { file_name, file_id },
            )
            .await?;
        Ok(())
    }

    pub async fn get_file_info(
        &self,
        auth: &Authorization,
        file_id: &str,
    ) -> Result<FileVersion, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            file_id: &'a str,
        }
        self.call(auth, Method::GetFileInfo, &Req { file_id }).await
    }

    pub async fn get_download_authorization(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        file_name_prefix: &str,
        valid_for: Duration,
    ) -> Result<DownloadAuthorization, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            bucket_id: &'a str,
            file_name_prefix: &'a str,
            valid_duration_in_seconds: u64,
        }
        self.call(
            auth,
            Method::GetDownloadAuthorization,
            &Req {
                bucket_id,
                file_name_prefix,
                valid_duration_in_seconds: valid_for.as_secs().max(1),
            },
        )
        .await
    }

    pub async fn create_key(
        &self,
        auth: &Authorization,
        key_name: &str,
        capabilities: &[String],
        valid_for: Option<Duration>,
        bucket_id: Option<&str>,
        name_prefix: Option<&str>,
    ) -> Result<Key, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            account_id: &'a str,
            key_name: &'a str,
            capabilities: &'a [String],
            #[serde(skip_serializing_if = "Option::is_none")]
            valid_duration_in_seconds: Option<u64>,
            #[serde(skip_serializing_if = "Option::is_none")]
            bucket_id: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            name_prefix: Option<&'a str>,
        }
        self.call(
            auth,
            Method::CreateKey,
            &Req {
                account_id: &auth.account_id,
                key_name,
                capabilities,
                valid_duration_in_seconds: valid_for.map(|d| d.as_secs()),
                bucket_id,
                name_prefix,
            },
        )
        .await
    }

    pub async fn delete_key(
        &self,
        auth: &Authorization,
        application_key_id: &str,
    ) -> Result<(), ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            application_key_id: &'a str,
        }
        let _: serde_json::Value = self
            .call(auth, Method::DeleteKey, &Req { application_key_id })
            .await?;
        Ok(())
    }

    pub async fn list_keys(
        &self,
        auth: &Authorization,
        max_key_count: u32,
        start_application_key_id: Option<&str>,
    ) -> Result<ListKeys, ProtocolError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Req<'a> {
            account_id: &'a str,
            max_key_count: u32,
            #[serde(skip_serializing_if = "Option::is_none")]
            start_application_key_id: Option<&'a str>,
        }
        self.call(
            auth,
            Method::ListKeys,
            &Req {
                account_id: &auth.account_id,
                max_key_count,
                start_application_key_id,
            },
        )
        .await
    }

    /// Wraps `b2_download_file_by_name`, the one non-JSON leaf. `length` of
    /// `None` reads from `offset` to EOF; `offset == 0 && length == None`
    /// requests the whole file with no `Range` header.
    pub async fn download_file_by_name(
        &self,
        auth: &Authorization,
        bucket_name: &str,
        file_name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<FileDownload, ProtocolError> {
        let method = Method::DownloadFileByName;
        let url = format!("{}/file/{bucket_name}/{file_name}", auth.download_url);
        let mut req = self
            .http
            .get(&url)
            .header(AUTHORIZATION, &auth.authorization_token);
        if let Some(range) = byte_range(offset, length) {
            req = req.header(RANGE, range);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(wire_error(method, resp).await);
        }

        let headers = resp.headers().clone();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let content_sha1 = headers
            .get("X-Bz-Content-Sha1")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let file_id = headers
            .get("X-Bz-File-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let mut info = HashMap::new();
        for (name, value) in headers.iter() {
            let Some(key) = name.as_str().strip_prefix("x-bz-info-") else {
                continue;
            };
            if let Ok(v) = value.to_str() {
                info.insert(key.to_owned(), v.to_owned());
            }
        }

        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(FileDownload {
            file_id,
            content_length,
            content_type,
            content_sha1,
            info,
            body: Box::pin(stream),
        })
    }

    /// Shared JSON control-call path: POST to the session API URL, decode the
    /// response, or turn a non-200 into a structured error.
    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        auth: &Authorization,
        method: Method,
        req: &Req,
    ) -> Result<Resp, ProtocolError> {
        let url = format!("{}{API_PATH}{method}", auth.api_url);
        let resp = self
            .http
            .post(&url)
            .header(AUTHORIZATION, &auth.authorization_token)
            .json(req)
            .send()
            .await?;
        decode(method, resp).await
    }
}

fn byte_range(offset: u64, length: Option<u64>) -> Option<String> {
    match (offset, length) {
        (0, None) => None,
        (off, None) => Some(format!("bytes={off}-")),
        (off, Some(len)) => Some(format!("bytes={off}-{}", off + len.saturating_sub(1))),
    }
}

async fn decode<Resp: DeserializeOwned>(
    method: Method,
    resp: Response,
) -> Result<Resp, ProtocolError> {
    if resp.status() != StatusCode::OK {
        return Err(wire_error(method, resp).await);
    }
    resp.json().await.map_err(ProtocolError::from)
}

/// Builds a structured error from a non-success response.
async fn wire_error(method: Method, resp: Response) -> ProtocolError {
    #[derive(Deserialize)]
    struct ErrMsg {
        #[serde(default)]
        message: String,
    }
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let message = match resp.json::<ErrMsg>().await {
        Ok(m) if !m.message.is_empty() => m.message,
        _ => "no error detail".to_owned(),
    };
    debug!(%method, status, retry_after = ?retry_after, "api error: {message}");
    ProtocolError::Api {
        method,
        status,
        message,
        retry_after,
    }
}
