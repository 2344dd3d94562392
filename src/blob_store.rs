use crate::config::BlobStoreConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur against the blob store
#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error("blob store configuration error: {0}")]
    Config(String),

    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

/// Reference to an uploaded object
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Object key, unique per upload attempt
    pub key: String,
    /// Time-limited access URL, regenerable from the key
    pub signed_url: String,
    /// When the signed URL expires
    pub expires_at: DateTime<Utc>,
}

/// Client for an S3-compatible object store.
///
/// Callers must pass non-empty `data` and `owner_id` to `upload`; the
/// pipeline validates both before any call is made.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload bytes under a fresh key scoped to the owner and return the
    /// key together with a signed access URL
    async fn upload(
        &self,
        data: &[u8],
        filename: &str,
        owner_id: &str,
    ) -> Result<StoredObject, BlobStoreError>;

    /// Regenerate a signed URL for an existing key without re-uploading.
    ///
    /// Signing is a pure computation over key and credentials; it does not
    /// check that the object exists.
    async fn signed_url(
        &self,
        key: &str,
        expiry: Option<Duration>,
    ) -> Result<String, BlobStoreError>;

    /// Best-effort delete, used as compensation after a later pipeline step
    /// fails. Returns `false` instead of an error so cleanup can never fail
    /// the caller.
    async fn delete(&self, key: &str) -> bool;
}

/// Blob store client for Cloudflare R2 (or any S3-compatible endpoint)
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    signed_url_expiry: Duration,
}

impl S3BlobStore {
    /// Create a new blob store client
    pub async fn new(config: &BlobStoreConfig) -> Result<Self, BlobStoreError> {
        if config.bucket.is_empty() {
            return Err(BlobStoreError::Config("bucket name is not set".to_string()));
        }

        let endpoint_url = config.endpoint_url.as_deref().ok_or_else(|| {
            BlobStoreError::Config("endpoint URL is not set".to_string())
        })?;

        // Credentials are injected through the standard AWS env vars in
        // deployment; fail fast instead of surfacing a signing error later.
        for var in ["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"] {
            if std::env::var(var).map(|v| v.is_empty()).unwrap_or(true) {
                return Err(BlobStoreError::Config(format!("{var} is not set")));
            }
        }

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let s3_config = S3ConfigBuilder::from(&aws_config)
            .endpoint_url(endpoint_url)
            .force_path_style(config.force_path_style)
            .build();
        let client = S3Client::from_conf(s3_config);

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "Blob store client initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            signed_url_expiry: Duration::from_secs(config.signed_url_expiry_secs),
        })
    }

    async fn presign(&self, key: &str, expiry: Duration) -> Result<String, BlobStoreError> {
        let presigning_config = PresigningConfig::expires_in(expiry)
            .map_err(|e| BlobStoreError::Config(format!("invalid signed URL expiry: {e}")))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| BlobStoreError::Unavailable(DisplayErrorContext(e).to_string()))?;

        Ok(presigned.uri().to_string())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, data), fields(owner_id = %owner_id, size_bytes = data.len()))]
    async fn upload(
        &self,
        data: &[u8],
        filename: &str,
        owner_id: &str,
    ) -> Result<StoredObject, BlobStoreError> {
        let key = object_key(owner_id, filename);
        let content_type = content_type_for(filename);

        debug!(object_key = %key, content_type = %content_type, "Uploading deposit image");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data.to_vec()))
            .content_type(content_type)
            .metadata("owner-id", owner_id)
            .metadata("original-filename", filename)
            .send()
            .await
            .map_err(|e| BlobStoreError::Unavailable(DisplayErrorContext(e).to_string()))?;

        let signed_url = self.presign(&key, self.signed_url_expiry).await?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.signed_url_expiry)
                .map_err(|e| BlobStoreError::Config(format!("signed URL expiry out of range: {e}")))?;

        info!(
            object_key = %key,
            size_bytes = data.len(),
            "Deposit image uploaded"
        );

        Ok(StoredObject {
            key,
            signed_url,
            expires_at,
        })
    }

    async fn signed_url(
        &self,
        key: &str,
        expiry: Option<Duration>,
    ) -> Result<String, BlobStoreError> {
        self.presign(key, expiry.unwrap_or(self.signed_url_expiry))
            .await
    }

    #[instrument(skip(self), fields(object_key = %key))]
    async fn delete(&self, key: &str) -> bool {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => {
                debug!(object_key = %key, "Object deleted from blob store");
                true
            }
            Err(e) => {
                warn!(
                    object_key = %key,
                    error = %DisplayErrorContext(e),
                    "Failed to delete object from blob store"
                );
                false
            }
        }
    }
}

/// Generate a unique object key scoped under the owner.
/// Format: deposits/{owner_id}/{uuid}.{ext}
fn object_key(owner_id: &str, filename: &str) -> String {
    format!(
        "deposits/{owner}/{id}.{ext}",
        owner = sanitize_path_component(owner_id),
        id = Uuid::new_v4(),
        ext = file_extension(filename)
    )
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Extract the lowercased file extension, defaulting to "jpg"
fn file_extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "jpg".to_string())
}

/// Get content type from the filename extension.
/// Falls back to a generic binary type if unrecognized.
fn content_type_for(filename: &str) -> String {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, e)| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpeg" | "jpg" => "image/jpeg".to_string(),
        "png" => "image/png".to_string(),
        "webp" => "image/webp".to_string(),
        "bmp" => "image/bmp".to_string(),
        "gif" => "image/gif".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}
