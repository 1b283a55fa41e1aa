//! Upload of decoded images to the object store.
//!
//! Every image goes to one S3-compatible bucket with its content type and a
//! long-lived cache directive. A local filesystem mirror can receive the same
//! bytes for debugging; failures there are logged and otherwise ignored.

use crate::config::ObjectStoreConfig;
use crate::errors::RelayError;
use crate::images::PreparedImage;
use crate::metrics_defs::{IMAGES_DISCARDED, IMAGES_UPLOADED};
use object_store::aws::{AmazonS3Builder, AwsAuthorizer, AwsCredential};
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions};
use reqwest::StatusCode;
use shared::counter;
use std::sync::Arc;

pub struct ImageStore {
    store: Arc<dyn ObjectStore>,
    mirror: Option<Arc<dyn ObjectStore>>,
    cache_control: String,
}

impl ImageStore {
    pub fn new(store: Arc<dyn ObjectStore>, cache_control: impl Into<String>) -> Self {
        Self {
            store,
            mirror: None,
            cache_control: cache_control.into(),
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn ObjectStore>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Builds the S3 client (path-style addressing) and the optional mirror.
    pub fn from_config(config: &ObjectStoreConfig) -> Result<Self, RelayError> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_virtual_hosted_style_request(false)
            .with_allow_http(config.allow_http);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint.as_str().trim_end_matches('/'));
        }
        if !config.access_key_id.is_empty() {
            builder = builder
                .with_access_key_id(&config.access_key_id)
                .with_secret_access_key(&config.secret_access_key);
        }

        let store = Self::new(Arc::new(builder.build()?), config.cache_control.clone());

        let Some(mirror_dir) = &config.mirror_dir else {
            return Ok(store);
        };

        let mirror = std::fs::create_dir_all(mirror_dir)
            .map_err(|e| object_store::Error::Generic {
                store: "LocalFileSystem",
                source: Box::new(e),
            })
            .and_then(|_| LocalFileSystem::new_with_prefix(mirror_dir));
        match mirror {
            Ok(mirror) => Ok(store.with_mirror(Arc::new(mirror))),
            Err(e) => {
                tracing::warn!(
                    dir = %mirror_dir.display(),
                    error = %e,
                    "Local image mirror unavailable, continuing without it"
                );
                Ok(store)
            }
        }
    }

    /// Uploads one image. Overwrites any object already stored at the key.
    pub async fn upload(&self, image: &PreparedImage) -> Result<(), RelayError> {
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, image.format.content_type().into());
        attributes.insert(Attribute::CacheControl, self.cache_control.clone().into());

        let opts = PutOptions {
            attributes,
            ..Default::default()
        };

        self.store
            .put_opts(&image.key, image.data.clone().into(), opts)
            .await?;

        counter!(IMAGES_UPLOADED, "role" => image.role.as_str()).increment(1);
        tracing::debug!(key = %image.key, bytes = image.data.len(), "Uploaded image");

        if let Some(mirror) = &self.mirror
            && let Err(e) = mirror.put(&image.key, image.data.clone().into()).await
        {
            tracing::warn!(key = %image.key, error = %e, "Failed to mirror image locally");
        }

        Ok(())
    }

    /// Deletes objects uploaded for records that were never published.
    pub async fn discard(&self, keys: &[ObjectPath]) {
        for key in keys {
            match self.store.delete(key).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {
                    counter!(IMAGES_DISCARDED).increment(1);
                    tracing::info!(key = %key, "Discarded unpublished image");
                }
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Failed to discard unpublished image");
                }
            }

            if let Some(mirror) = &self.mirror {
                let _ = mirror.delete(key).await;
            }
        }
    }
}

/// Creates the bucket unless it already exists.
///
/// `object_store` has no bucket management, so this sends signed requests to
/// the endpoint. A `HEAD /<bucket>` comes first and the bucket is created only
/// when that answers 404, which keeps credentials scoped to one bucket usable.
pub async fn ensure_bucket(config: &ObjectStoreConfig) -> Result<(), RelayError> {
    let endpoint = match &config.endpoint {
        Some(endpoint) => endpoint.as_str().trim_end_matches('/').to_string(),
        None => format!("https://s3.{}.amazonaws.com", config.region),
    };
    let url = format!("{endpoint}/{}", config.bucket);
    let client = reqwest::Client::new();

    let head = signed_request(&client, config, reqwest::Method::HEAD, &url, String::new())?;
    let response = client
        .execute(head)
        .await
        .map_err(|e| RelayError::BucketSetup(e.to_string()))?;
    if bucket_exists(&config.bucket, response.status())? {
        tracing::debug!(bucket = %config.bucket, "Bucket exists");
        return Ok(());
    }

    let body = match config.region.as_str() {
        "us-east-1" => String::new(),
        region => format!(
            "<CreateBucketConfiguration><LocationConstraint>{region}</LocationConstraint></CreateBucketConfiguration>"
        ),
    };
    let put = signed_request(&client, config, reqwest::Method::PUT, &url, body)?;
    let response = client
        .execute(put)
        .await
        .map_err(|e| RelayError::BucketSetup(e.to_string()))?;
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    bucket_created(&config.bucket, status, &text)?;

    tracing::info!(bucket = %config.bucket, "Created bucket");
    Ok(())
}

fn signed_request(
    client: &reqwest::Client,
    config: &ObjectStoreConfig,
    method: reqwest::Method,
    url: &str,
    body: String,
) -> Result<reqwest::Request, RelayError> {
    let mut request = client
        .request(method, url)
        .body(body)
        .build()
        .map_err(|e| RelayError::BucketSetup(e.to_string()))?;

    let credential = AwsCredential {
        key_id: config.access_key_id.clone(),
        secret_key: config.secret_access_key.clone(),
        token: None,
    };
    AwsAuthorizer::new(&credential, "s3", &config.region).authorize(&mut request, None);
    Ok(request)
}

/// Maps the answer to `HEAD /<bucket>`. `Ok(false)` means the bucket has to
/// be created.
fn bucket_exists(bucket: &str, status: StatusCode) -> Result<bool, RelayError> {
    match status {
        status if status.is_success() => Ok(true),
        StatusCode::NOT_FOUND => Ok(false),
        status => Err(RelayError::BucketSetup(format!(
            "checking bucket {bucket} returned {status}"
        ))),
    }
}

/// Maps the answer to `PUT /<bucket>`.
fn bucket_created(bucket: &str, status: StatusCode, body: &str) -> Result<(), RelayError> {
    if status.is_success() {
        return Ok(());
    }
    // Another client created it between the check and the create
    if status == StatusCode::CONFLICT && body.contains("<Code>BucketAlreadyOwnedByYou</Code>") {
        return Ok(());
    }
    if status == StatusCode::CONFLICT && body.contains("<Code>BucketAlreadyExists</Code>") {
        return Err(RelayError::BucketSetup(format!(
            "bucket {bucket} is owned by another account"
        )));
    }
    Err(RelayError::BucketSetup(format!(
        "creating bucket {bucket} returned {status}: {body}"
    )))
}
