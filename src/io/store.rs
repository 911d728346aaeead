//! Object store configuration for S3 and local filesystem access.
//!
//! Retries for transient failures live here, in the transport layer; the
//! array fetcher above never retries on its own.

use crate::config::{PublishConfig, StoreConfig};
use anyhow::Result;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::prefix::PrefixStore;
use object_store::{BackoffConfig, ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Client options for chunk-sized range reads against S3-compatible stores.
fn create_client_options(allow_http: bool) -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(60))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(64)
        .with_allow_http(allow_http)
}

/// Retry configuration for transient failures (429 and 5xx).
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an anonymous S3 client for a public bucket.
pub fn create_anonymous_store(
    bucket: &str,
    region: &str,
    endpoint: Option<&str>,
) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating anonymous S3 client for bucket: {}", bucket);

    let allow_http = endpoint.is_some_and(|e| e.starts_with("http://"));
    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region(region)
        .with_client_options(create_client_options(allow_http))
        .with_retry(create_retry_config())
        .with_skip_signature(true)
        .with_virtual_hosted_style_request(false);

    if let Some(endpoint) = endpoint {
        builder = builder.with_endpoint(endpoint);
    }

    Ok(Arc::new(builder.build()?))
}

/// Create an authenticated S3 client.
///
/// Credentials and region are loaded from (in order):
/// - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION)
/// - AWS config files (~/.aws/credentials, ~/.aws/config)
/// - EC2 instance profile (IMDS)
fn create_authenticated_store(
    bucket: &str,
    endpoint: Option<&str>,
) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating authenticated S3 client for bucket: {}", bucket);

    let allow_http = endpoint.is_some_and(|e| e.starts_with("http://"));
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options(allow_http))
        .with_retry(create_retry_config());

    match endpoint {
        Some(endpoint) => builder = builder.with_endpoint(endpoint).with_virtual_hosted_style_request(false),
        None => builder = builder.with_virtual_hosted_style_request(true),
    }

    Ok(Arc::new(builder.build()?))
}

fn create_local_store(local_path: &str) -> Result<Arc<dyn ObjectStore>> {
    let path = std::path::Path::new(local_path);
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    tracing::info!("Creating LocalFileSystem store at: {}", path.display());
    Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
}

/// Create the store chunked image arrays are read from.
/// A configured local_path wins over the bucket.
pub fn create_array_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match (&config.local_path, &config.bucket) {
        (Some(local_path), _) => create_local_store(local_path),
        (None, Some(bucket)) if config.anonymous => {
            create_anonymous_store(bucket, &config.region, config.endpoint.as_deref())
        }
        (None, Some(bucket)) => create_authenticated_store(bucket, config.endpoint.as_deref()),
        (None, None) => anyhow::bail!("Invalid config: no array store"),
    }
}

/// Create the store annotations are published to (always authenticated for S3).
pub fn create_publish_store(config: &PublishConfig) -> Result<Arc<dyn ObjectStore>> {
    match (&config.local_path, &config.bucket) {
        (Some(local_path), _) => create_local_store(local_path),
        (None, Some(bucket)) => {
            let store = create_authenticated_store(bucket, None)?;
            match config.prefix.as_deref() {
                Some(prefix) if !prefix.is_empty() => {
                    Ok(Arc::new(PrefixStore::new(store, prefix)))
                }
                _ => Ok(store),
            }
        }
        (None, None) => anyhow::bail!("Invalid config: no publish destination"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_anonymous_store_with_endpoint() {
        let result = create_anonymous_store(
            "idr",
            "us-east-1",
            Some("https://minio-dev.openmicroscopy.org/"),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_create_array_store_prefers_local_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StoreConfig {
            local_path: Some(dir.path().join("arrays").to_string_lossy().to_string()),
            ..StoreConfig::default()
        };
        assert!(create_array_store(&config).is_ok());
        assert!(dir.path().join("arrays").exists());
    }

    #[test]
    fn test_create_array_store_requires_destination() {
        let config = StoreConfig {
            local_path: None,
            bucket: None,
            ..StoreConfig::default()
        };
        assert!(create_array_store(&config).is_err());
    }

    #[test]
    fn test_create_publish_store_local() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = PublishConfig {
            local_path: Some(dir.path().to_string_lossy().to_string()),
            ..PublishConfig::default()
        };
        assert!(create_publish_store(&config).is_ok());
    }
}
