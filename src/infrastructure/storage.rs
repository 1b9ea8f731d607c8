use crate::config::StorageConfig;
use crate::services::storage::{MemoryStorageService, S3StorageService, StorageService};
use anyhow::{Context, Result, bail};
use aws_sdk_s3::config::Region;
use std::sync::Arc;
use tracing::{info, warn};

/// Base URL retrieval references are built on
pub fn public_base(config: &StorageConfig) -> String {
    if let Some(url) = &config.public_url {
        return url.trim_end_matches('/').to_string();
    }
    match &config.endpoint {
        Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket),
        None => format!("https://{}.s3.amazonaws.com", config.bucket),
    }
}

pub async fn setup_storage(config: &StorageConfig) -> Result<Arc<dyn StorageService>> {
    match config.backend.as_str() {
        "memory" => {
            let base = public_base(config);
            info!("🧠 In-memory storage (references under {})", base);
            Ok(Arc::new(MemoryStorageService::new(base)))
        }
        "s3" => setup_s3(config).await,
        other => bail!("Unknown STORAGE_BACKEND '{}', expected 's3' or 'memory'", other),
    }
}

async fn setup_s3(config: &StorageConfig) -> Result<Arc<dyn StorageService>> {
    let access_key = config
        .access_key
        .clone()
        .context("STORAGE_ACCESS_KEY must be set for the s3 backend")?;
    let secret_key = config
        .secret_key
        .clone()
        .context("STORAGE_SECRET_KEY must be set for the s3 backend")?;
    let bucket = config.bucket.clone();

    info!(
        "☁️  S3 Storage: {} (Bucket: {})",
        config.endpoint.as_deref().unwrap_or("aws default"),
        bucket
    );

    let mut loader = aws_config::from_env()
        .region(Region::new("us-east-1"))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "static",
        ));
    if let Some(endpoint) = &config.endpoint {
        loader = loader.endpoint_url(endpoint);
    }
    let aws_config = loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(config.endpoint.is_some())
        .build();

    let s3_client = aws_sdk_s3::Client::from_conf(s3_config);

    // Uploads would fail anyway; say so early but let diagnostics report the details
    match s3_client.head_bucket().bucket(&bucket).send().await {
        Ok(_) => info!("✅ Bucket '{}' is ready", bucket),
        Err(e) => warn!("⚠️  Bucket '{}' is not reachable: {}", bucket, e),
    }

    Ok(Arc::new(S3StorageService::new(
        s3_client,
        bucket,
        public_base(config),
        config.part_size,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_base() {
        let mut config = StorageConfig::default();
        assert_eq!(public_base(&config), "https://site-assets.s3.amazonaws.com");

        config.endpoint = Some("http://localhost:9000/".to_string());
        assert_eq!(public_base(&config), "http://localhost:9000/site-assets");

        config.public_url = Some("https://cdn.example.org/".to_string());
        assert_eq!(public_base(&config), "https://cdn.example.org");
    }

    #[tokio::test]
    async fn test_unknown_backend_rejected() {
        let config = StorageConfig {
            backend: "ftp".to_string(),
            ..StorageConfig::default()
        };
        assert!(setup_storage(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_s3_requires_credentials() {
        let config = StorageConfig::default();
        let err = setup_storage(&config).await.err().unwrap();
        assert!(err.to_string().contains("STORAGE_ACCESS_KEY"));
    }
}
