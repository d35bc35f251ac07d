//! S3 storage backend

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart as S3CompletedPart, ObjectCannedAcl,
    ServerSideEncryption, StorageClass,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::media::params::WriteParams;
use crate::{Error, Result};

use super::{CompletedPart, Listing, ObjectBackend, ObjectMeta, PresignParams};

/// Connection settings for an S3-compatible service
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub use_ssl: bool,
}

impl S3Settings {
    /// Endpoint override honouring `use_ssl`.
    ///
    /// Without an explicit endpoint and with TLS disabled, the regional
    /// AWS endpoint is addressed over plain HTTP.
    pub fn endpoint_url(&self) -> Option<String> {
        match (&self.endpoint, self.use_ssl) {
            (Some(endpoint), true) => Some(endpoint.clone()),
            (Some(endpoint), false) => Some(match endpoint.strip_prefix("https://") {
                Some(rest) => format!("http://{rest}"),
                None => endpoint.clone(),
            }),
            (None, true) => None,
            (None, false) => self
                .region
                .as_ref()
                .map(|region| format!("http://s3.{region}.amazonaws.com")),
        }
    }
}

/// S3 storage backend
pub struct S3Storage {
    client: Client,
    bucket: String,
}

macro_rules! apply_write_params {
    ($builder:expr, $params:expr) => {{
        let params: &WriteParams = $params;
        let mut builder = $builder
            .set_acl(params.acl.as_deref().map(ObjectCannedAcl::from))
            .content_type(&params.content_type)
            .set_content_encoding(params.content_encoding.clone())
            .set_cache_control(params.cache_control.clone())
            .set_content_disposition(params.content_disposition.clone())
            .set_content_language(params.content_language.clone())
            .set_storage_class(params.storage_class.as_deref().map(StorageClass::from))
            .set_server_side_encryption(
                params
                    .server_side_encryption
                    .as_deref()
                    .map(ServerSideEncryption::from),
            );
        if !params.metadata.is_empty() {
            builder = builder.set_metadata(Some(params.metadata.clone().into_iter().collect()));
        }
        builder
    }};
}

impl S3Storage {
    pub async fn new(settings: S3Settings) -> Result<Self> {
        if settings.bucket.trim().is_empty() {
            return Err(Error::config("S3 bucket name must be specified"));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let (Some(access_key), Some(secret_key)) = (&settings.access_key, &settings.secret_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "coursemedia",
            ));
        }
        let config = loader.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&config);

        if let Some(endpoint_url) = settings.endpoint_url() {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint_url)
                .force_path_style(true);
        }

        let s3_config = s3_config_builder.build();
        let client = Client::from_conf(s3_config);

        Ok(Self::from_client(client, settings.bucket))
    }

    /// Wrap an already configured client
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Map an SDK error, turning HTTP 404 into `Error::NotFound`.
    fn map_sdk_error<E>(err: SdkError<E>, op: &str, key: &str) -> Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if status_of(&err) == Some(404) {
            return Error::not_found(key);
        }
        Error::storage(format!("S3 {} failed for {}: {}", op, key, DisplayErrorContext(&err)))
    }
}

fn status_of<E>(err: &SdkError<E>) -> Option<u16> {
    match err {
        SdkError::ServiceError(service_err) => Some(service_err.raw().status().as_u16()),
        _ => None,
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl ObjectBackend for S3Storage {
    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        tracing::debug!(bucket = %self.bucket, %key, "S3 head");
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "head", key))?;

        Ok(ObjectMeta {
            key: key.to_string(),
            size: response.content_length().unwrap_or_default().max(0) as u64,
            e_tag: response.e_tag().map(str::to_string),
            last_modified: response.last_modified().and_then(to_chrono),
            content_type: response.content_type().map(str::to_string),
        })
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        tracing::debug!(bucket = %self.bucket, %key, "S3 get");
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "get", key))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| Error::storage(format!("S3 body read failed: {}", e)))?;

        Ok(data.into_bytes())
    }

    async fn put(&self, key: &str, data: Bytes, params: &WriteParams) -> Result<()> {
        tracing::debug!(bucket = %self.bucket, %key, bytes = data.len(), "S3 put");
        apply_write_params!(self.client.put_object(), params)
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "put", key))?;

        Ok(())
    }

    async fn put_if_absent(&self, key: &str, data: Bytes, params: &WriteParams) -> Result<bool> {
        tracing::debug!(bucket = %self.bucket, %key, "S3 conditional put");
        let result = apply_write_params!(self.client.put_object(), params)
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .body(ByteStream::from(data))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            // 412: object exists, 409: a concurrent conditional write won
            Err(err) if matches!(status_of(&err), Some(412) | Some(409)) => Ok(false),
            Err(err) => Err(Self::map_sdk_error(err, "put", key)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        tracing::debug!(bucket = %self.bucket, %key, "S3 delete");
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "delete", key))?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| Self::map_sdk_error(e, "list", prefix))?;
            objects.extend(page.contents().iter().filter_map(|obj| {
                obj.key().map(|key| ObjectMeta {
                    key: key.to_string(),
                    size: obj.size().unwrap_or_default().max(0) as u64,
                    e_tag: obj.e_tag().map(str::to_string),
                    last_modified: obj.last_modified().and_then(to_chrono),
                    // ListObjectsV2 does not report it
                    content_type: None,
                })
            }));
        }

        tracing::debug!(bucket = %self.bucket, %prefix, count = objects.len(), "S3 list");
        Ok(objects)
    }

    async fn list_delimited(&self, prefix: &str, delimiter: &str) -> Result<Listing> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .delimiter(delimiter)
            .into_paginator()
            .send();

        let mut listing = Listing::default();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| Self::map_sdk_error(e, "list", prefix))?;
            listing.prefixes.extend(
                page.common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix().map(str::to_string)),
            );
            listing.keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );
        }

        Ok(listing)
    }

    async fn create_multipart(&self, key: &str, params: &WriteParams) -> Result<String> {
        let response = apply_write_params!(self.client.create_multipart_upload(), params)
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "create multipart upload", key))?;

        let upload_id = response
            .upload_id()
            .ok_or_else(|| Error::storage(format!("S3 returned no upload id for {}", key)))?
            .to_string();

        tracing::debug!(bucket = %self.bucket, %key, %upload_id, "S3 multipart upload started");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<String> {
        tracing::debug!(%key, part_number, bytes = data.len(), "S3 upload part");
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "upload part", key))?;

        Ok(response.e_tag().unwrap_or_default().to_string())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|part| {
                        S3CompletedPart::builder()
                            .e_tag(&part.e_tag)
                            .part_number(part.part_number)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "complete multipart upload", key))?;

        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "abort multipart upload", key))?;

        Ok(())
    }

    async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
        params: &PresignParams,
    ) -> Result<String> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| Error::config(format!("invalid URL expiry: {}", e)))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_response_content_type(params.response_content_type.clone())
            .set_response_content_disposition(params.response_content_disposition.clone())
            .set_response_cache_control(params.response_cache_control.clone())
            .set_version_id(params.version_id.clone())
            .presigned(presigning)
            .await
            .map_err(|e| Self::map_sdk_error(e, "presign", key))?;

        Ok(request.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_storage() -> S3Storage {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new(
                "AKIDEXAMPLE",
                "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY",
                None,
                None,
                "test",
            ))
            .endpoint_url("http://localhost:9000")
            .force_path_style(true)
            .build();
        S3Storage::from_client(Client::from_conf(config), "course-media")
    }

    #[test]
    fn test_endpoint_url_respects_use_ssl() {
        let mut settings = S3Settings {
            bucket: "b".into(),
            region: Some("eu-west-1".into()),
            endpoint: Some("https://minio.local:9000".into()),
            use_ssl: true,
            ..Default::default()
        };
        assert_eq!(settings.endpoint_url().as_deref(), Some("https://minio.local:9000"));

        settings.use_ssl = false;
        assert_eq!(settings.endpoint_url().as_deref(), Some("http://minio.local:9000"));

        settings.endpoint = None;
        assert_eq!(
            settings.endpoint_url().as_deref(),
            Some("http://s3.eu-west-1.amazonaws.com")
        );

        settings.use_ssl = true;
        assert_eq!(settings.endpoint_url(), None);
    }

    #[tokio::test]
    async fn test_presign_get_is_signed_offline() {
        let storage = offline_storage();
        let url = storage
            .presign_get("media/img.jpg", Duration::from_secs(3600), &PresignParams::default())
            .await
            .unwrap();

        assert!(url.starts_with("http://localhost:9000/course-media/media/img.jpg?"));
        assert!(url.contains("X-Amz-Expires=3600"));
        assert!(url.contains("X-Amz-Signature="));
    }

    #[tokio::test]
    async fn test_presign_get_merges_response_overrides() {
        let storage = offline_storage();
        let params = PresignParams {
            response_content_disposition: Some("attachment".to_string()),
            ..Default::default()
        };
        let url = storage
            .presign_get("notes.pdf", Duration::from_secs(60), &params)
            .await
            .unwrap();

        assert!(url.contains("response-content-disposition=attachment"));
        assert!(url.contains("X-Amz-Expires=60"));
    }

    #[tokio::test]
    async fn test_new_requires_bucket() {
        let result = S3Storage::new(S3Settings::default()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
