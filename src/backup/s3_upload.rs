// infrahub-backup/src/backup/s3_upload.rs
use anyhow::{Context, Result};
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use tracing::info;

use crate::config::S3Config;

/// Object key for an archive: its file name.
pub fn object_key(archive: &Path) -> Result<String> {
    archive
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("Backup path {} has no file name", archive.display()))
}

async fn client_for(storage: &S3Config) -> s3::Client {
    let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
        .region(Region::new(storage.region.clone()))
        .credentials_provider(s3::config::Credentials::new(
            &storage.access_key_id,
            &storage.secret_access_key,
            None,
            None,
            "Static",
        ));
    if let Some(endpoint) = &storage.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    let sdk_config = loader.load().await;

    // Custom endpoints (MinIO and friends) generally need path-style addressing.
    let s3_config = s3::config::Builder::from(&sdk_config)
        .force_path_style(storage.endpoint_url.is_some())
        .build();
    s3::Client::from_conf(s3_config)
}

/// Uploads a finished backup archive; returns the object key.
///
/// The local archive is left untouched whatever the outcome.
pub async fn upload_backup(storage: &S3Config, archive: &Path) -> Result<String> {
    storage.validate().context("Invalid S3 configuration")?;
    let key = object_key(archive)?;

    info!(
        "Uploading {} to S3 bucket {} with key {}",
        archive.display(),
        storage.bucket_name,
        key
    );

    let client = client_for(storage).await;
    let body = ByteStream::from_path(archive)
        .await
        .with_context(|| format!("Failed to create ByteStream from file: {}", archive.display()))?;

    client
        .put_object()
        .bucket(&storage.bucket_name)
        .key(&key)
        .content_type("application/gzip")
        .body(body)
        .send()
        .await
        .with_context(|| {
            format!(
                "Failed to upload file {} to S3 bucket {} with key {}",
                archive.display(),
                storage.bucket_name,
                key
            )
        })?;

    info!("✅ Uploaded backup to s3://{}/{}", storage.bucket_name, key);
    Ok(key)
}
