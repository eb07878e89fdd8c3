//! The capability seam between the engine and the wire layer.
//!
//! [`RawClient`] mirrors the B2 operation set one-to-one. The engine only
//! ever talks to this trait; production wires it to
//! [`b2_protocol::ProtocolClient`], tests substitute a programmable fake that
//! records calls and injects error sequences.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use b2_protocol::types::{
    Authorization, Bucket, DownloadAuthorization, FileDownload, FileVersion, Key, LifecycleRule,
    ListFileNames, ListFileVersions, ListKeys, ListParts, UploadEndpoint,
};
use b2_protocol::{ProtocolClient, ProtocolError};

use crate::buffer::ChunkSource;

#[async_trait]
pub(crate) trait RawClient: Send + Sync + 'static {
    async fn authorize_account(
        &self,
        key_id: &str,
        key: &str,
    ) -> Result<Authorization, ProtocolError>;

    async fn create_bucket(
        &self,
        auth: &Authorization,
        name: &str,
        bucket_type: &str,
        info: &HashMap<String, String>,
        lifecycle: &[LifecycleRule],
    ) -> Result<Bucket, ProtocolError>;

    async fn list_buckets(&self, auth: &Authorization) -> Result<Vec<Bucket>, ProtocolError>;

    async fn update_bucket(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        bucket_type: Option<&str>,
        info: Option<&HashMap<String, String>>,
        lifecycle: Option<&[LifecycleRule]>,
        if_revision_is: Option<u64>,
    ) -> Result<Bucket, ProtocolError>;

    async fn delete_bucket(
        &self,
        auth: &Authorization,
        bucket_id: &str,
    ) -> Result<(), ProtocolError>;

    async fn get_upload_url(
        &self,
        auth: &Authorization,
        bucket_id: &str,
    ) -> Result<UploadEndpoint, ProtocolError>;

    #[allow(clippy::too_many_arguments)]
    async fn upload_file(
        &self,
        endpoint: &UploadEndpoint,
        file_name: &str,
        content_type: &str,
        sha1_hex: &str,
        content_length: u64,
        info: &HashMap<String, String>,
        data: &ChunkSource,
    ) -> Result<FileVersion, ProtocolError>;

    async fn start_large_file(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        file_name: &str,
        content_type: &str,
        info: &HashMap<String, String>,
    ) -> Result<FileVersion, ProtocolError>;

    async fn get_upload_part_url(
        &self,
        auth: &Authorization,
        file_id: &str,
    ) -> Result<UploadEndpoint, ProtocolError>;

    async fn upload_part(
        &self,
        endpoint: &UploadEndpoint,
        part_number: u32,
        sha1_hex: &str,
        content_length: u64,
        data: &ChunkSource,
    ) -> Result<(), ProtocolError>;

    async fn finish_large_file(
        &self,
        auth: &Authorization,
        file_id: &str,
        part_sha1_array: &[String],
    ) -> Result<FileVersion, ProtocolError>;

    async fn cancel_large_file(
        &self,
        auth: &Authorization,
        file_id: &str,
    ) -> Result<(), ProtocolError>;

    async fn list_file_names(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        max_file_count: u32,
        start_file_name: Option<&str>,
    ) -> Result<ListFileNames, ProtocolError>;

    async fn list_file_versions(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        max_file_count: u32,
        start_file_name: Option<&str>,
        start_file_id: Option<&str>,
    ) -> Result<ListFileVersions, ProtocolError>;

    async fn list_parts(
        &self,
        auth: &Authorization,
        file_id: &str,
        max_part_count: u32,
        start_part_number: Option<u32>,
    ) -> Result<ListParts, ProtocolError>;

    async fn hide_file(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        file_name: &str,
    ) -> Result<FileVersion, ProtocolError>;

    async fn delete_file_version(
        &self,
        auth: &Authorization,
        file_name: &str,
        file_id: &str,
    ) -> Result<(), ProtocolError>;

    async fn get_file_info(
        &self,
        auth: &Authorization,
        file_id: &str,
    ) -> Result<FileVersion, ProtocolError>;

    async fn get_download_authorization(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        file_name_prefix: &str,
        valid_for: Duration,
    ) -> Result<DownloadAuthorization, ProtocolError>;

    async fn create_key(
        &self,
        auth: &Authorization,
        key_name: &str,
        capabilities: &[String],
        valid_for: Option<Duration>,
        bucket_id: Option<&str>,
        name_prefix: Option<&str>,
    ) -> Result<Key, ProtocolError>;

    async fn delete_key(
        &self,
        auth: &Authorization,
        application_key_id: &str,
    ) -> Result<(), ProtocolError>;

    async fn list_keys(
        &self,
        auth: &Authorization,
        max_key_count: u32,
        start_application_key_id: Option<&str>,
    ) -> Result<ListKeys, ProtocolError>;

    async fn download_file_by_name(
        &self,
        auth: &Authorization,
        bucket_name: &str,
        file_name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<FileDownload, ProtocolError>;
}

#[async_trait]
impl RawClient for ProtocolClient {
    async fn authorize_account(
        &self,
        key_id: &str,
        key: &str,
    ) -> Result<Authorization, ProtocolError> {
        ProtocolClient::authorize_account(self, key_id, key).await
    }

    async fn create_bucket(
        &self,
        auth: &Authorization,
        name: &str,
        bucket_type: &str,
        info: &HashMap<String, String>,
        lifecycle: &[LifecycleRule],
    ) -> Result<Bucket, ProtocolError> {
        ProtocolClient::create_bucket(self, auth, name, bucket_type, info, lifecycle).await
    }

    async fn list_buckets(&self, auth: &Authorization) -> Result<Vec<Bucket>, ProtocolError> {
        Ok(ProtocolClient::list_buckets(self, auth).await?.buckets)
    }

    async fn update_bucket(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        bucket_type: Option<&str>,
        info: Option<&HashMap<String, String>>,
        lifecycle: Option<&[LifecycleRule]>,
        if_revision_is: Option<u64>,
    ) -> Result<Bucket, ProtocolError> {
        ProtocolClient::update_bucket(
            self,
            auth,
            bucket_id,
            bucket_type,
            info,
            lifecycle,
            if_revision_is,
        )
        .await
    }

    async fn delete_bucket(
        &self,
        auth: &Authorization,
        bucket_id: &str,
    ) -> Result<(), ProtocolError> {
        ProtocolClient::delete_bucket(self, auth, bucket_id).await
    }

    async fn get_upload_url(
        &self,
        auth: &Authorization,
        bucket_id: &str,
    ) -> Result<UploadEndpoint, ProtocolError> {
        ProtocolClient::get_upload_url(self, auth, bucket_id).await
    }

    async fn upload_file(
        &self,
        endpoint: &UploadEndpoint,
        file_name: &str,
        content_type: &str,
        sha1_hex: &str,
        content_length: u64,
        info: &HashMap<String, String>,
        data: &ChunkSource,
    ) -> Result<FileVersion, ProtocolError> {
        let body = data.to_body()?;
        ProtocolClient::upload_file(
            self,
            endpoint,
            file_name,
            content_type,
            sha1_hex,
            content_length,
            info,
            body,
        )
        .await
    }

    async fn start_large_file(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        file_name: &str,
        content_type: &str,
        info: &HashMap<String, String>,
    ) -> Result<FileVersion, ProtocolError> {
        ProtocolClient::start_large_file(self, auth, bucket_id, file_name, content_type, info)
            .await
    }

    async fn get_upload_part_url(
        &self,
        auth: &Authorization,
        file_id: &str,
    ) -> Result<UploadEndpoint, ProtocolError> {
        ProtocolClient::get_upload_part_url(self, auth, file_id).await
    }

    async fn upload_part(
        &self,
        endpoint: &UploadEndpoint,
        part_number: u32,
        sha1_hex: &str,
        content_length: u64,
        data: &ChunkSource,
    ) -> Result<(), ProtocolError> {
        let body = data.to_body()?;
        ProtocolClient::upload_part(self, endpoint, part_number, sha1_hex, content_length, body)
            .await
    }

    async fn finish_large_file(
        &self,
        auth: &Authorization,
        file_id: &str,
        part_sha1_array: &[String],
    ) -> Result<FileVersion, ProtocolError> {
        ProtocolClient::finish_large_file(self, auth, file_id, part_sha1_array).await
    }

    async fn cancel_large_file(
        &self,
        auth: &Authorization,
        file_id: &str,
    ) -> Result<(), ProtocolError> {
        ProtocolClient::cancel_large_file(self, auth, file_id).await
    }

    async fn list_file_names(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        max_file_count: u32,
        start_file_name: Option<&str>,
    ) -> Result<ListFileNames, ProtocolError> {
        ProtocolClient::list_file_names(self, auth, bucket_id, max_file_count, start_file_name)
            .await
    }

    async fn list_file_versions(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        max_file_count: u32,
        start_file_name: Option<&str>,
        start_file_id: Option<&str>,
    ) -> Result<ListFileVersions, ProtocolError> {
        ProtocolClient::list_file_versions(
            self,
            auth,
            bucket_id,
            max_file_count,
            start_file_name,
            start_file_id,
        )
        .await
    }

    async fn list_parts(
        &self,
        auth: &Authorization,
        file_id: &str,
        max_part_count: u32,
        start_part_number: Option<u32>,
    ) -> Result<ListParts, ProtocolError> {
        ProtocolClient::list_parts(self, auth, file_id, max_part_count, start_part_number).await
    }

    async fn hide_file(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        file_name: &str,
    ) -> Result<FileVersion, ProtocolError> {
        ProtocolClient::hide_file(self, auth, bucket_id, file_name).await
    }

    async fn delete_file_version(
        &self,
        auth: &Authorization,
        file_name: &str,
        file_id: &str,
    ) -> Result<(), ProtocolError> {
        ProtocolClient::delete_file_version(self, auth, file_name, file_id).await
    }

    async fn get_file_info(
        &self,
        auth: &Authorization,
        file_id: &str,
    ) -> Result<FileVersion, ProtocolError> {
        ProtocolClient::get_file_info(self, auth, file_id).await
    }

    async fn get_download_authorization(
        &self,
        auth: &Authorization,
        bucket_id: &str,
        file_name_prefix: &str,
        valid_for: Duration,
    ) -> Result<DownloadAuthorization, ProtocolError> {
        ProtocolClient::get_download_authorization(
            self,
            auth,
            bucket_id,
            file_name_prefix,
            valid_for,
        )
        .await
    }

    async fn create_key(
        &self,
        auth: &Authorization,
        key_name: &str,
        capabilities: &[String],
        valid_for: Option<Duration>,
        bucket_id: Option<&str>,
        name_prefix: Option<&str>,
    ) -> Result<Key, ProtocolError> {
        ProtocolClient::create_key(
            self,
            auth,
            key_name,
            capabilities,
            valid_for,
            bucket_id,
            name_prefix,
        )
        .await
    }

    async fn delete_key(
        &self,
        auth: &Authorization,
        application_key_id: &str,
    ) -> Result<(), ProtocolError> {
        ProtocolClient::delete_key(self, auth, application_key_id).await
    }

    async fn list_keys(
        &self,
        auth: &Authorization,
        max_key_count: u32,
        start_application_key_id: Option<&str>,
    ) -> Result<ListKeys, ProtocolError> {
        ProtocolClient::list_keys(self, auth, max_key_count, start_application_key_id).await
    }

    async fn download_file_by_name(
        &self,
        auth: &Authorization,
        bucket_name: &str,
        file_name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<FileDownload, ProtocolError> {
        ProtocolClient::download_file_by_name(self, auth, bucket_name, file_name, offset, length)
            .await
    }
}
