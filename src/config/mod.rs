use std::env;
use std::time::Duration;

/// Default accepted image types for site assets
pub const DEFAULT_ALLOWED_MIMES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Upload pipeline configuration
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Maximum file size in bytes (default: 5 MB)
    pub max_file_size: usize,

    /// Accepted MIME types
    pub allowed_mimes: Vec<String>,

    /// Inputs larger than this are run through the compressor (default: 1 MB)
    pub compression_threshold: usize,

    /// Bounding box for compressed images
    pub max_width: u32,
    pub max_height: u32,

    /// Re-encode quality in 0.0..=1.0 (default: 0.85)
    pub quality: f32,

    /// Stall / timeout / retry timings
    pub watchdog: WatchdogConfig,

    pub diagnostics: DiagnosticsConfig,

    pub storage: StorageConfig,
}

/// Timings for the stall detector, timeout guard and retry policy
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// How often the stall detector samples the session (default: 5s)
    pub stall_check_interval: Duration,

    /// Time without progress before a started transfer counts as stalled (default: 10s)
    pub stall_threshold: Duration,

    /// Delay before a stalled transfer is retried (default: 2s)
    pub retry_delay: Duration,

    /// Automatic attempts per user-initiated upload (default: 3)
    pub max_attempts: u32,

    /// Absolute ceiling measured from `start()` (default: 120s)
    pub session_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Ceiling for the live test upload (default: 30s)
    pub test_upload_timeout: Duration,

    /// URL fetched to detect content blockers; its path looks like an ad resource on purpose
    pub canary_url: String,

    /// Canary request timeout (default: 2s)
    pub canary_timeout: Duration,

    /// host:port used to decide whether the network is reachable at all
    pub probe_addr: String,

    /// Folder the live test upload writes into
    pub folder: String,

    /// Timeout applied to the storage reachability check
    pub storage_check_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// "s3" or "memory" (default: "s3")
    pub backend: String,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: String,
    /// Base for retrieval URLs; defaults to `{endpoint}/{bucket}`
    pub public_url: Option<String>,
    /// Multipart part size in bytes (default: 5 MB, the S3 minimum)
    pub part_size: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stall_check_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(10),
            retry_delay: Duration::from_secs(2),
            max_attempts: 3,
            session_timeout: Duration::from_secs(120),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            test_upload_timeout: Duration::from_secs(30),
            canary_url: "https://pagead2.googlesyndication.com/pagead/js/adsbygoogle.js"
                .to_string(),
            canary_timeout: Duration::from_millis(2000),
            probe_addr: "1.1.1.1:443".to_string(),
            folder: "diagnostics".to_string(),
            storage_check_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "s3".to_string(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            bucket: "site-assets".to_string(),
            public_url: None,
            part_size: 5 * 1024 * 1024,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 5 * 1024 * 1024, // 5 MB
            allowed_mimes: DEFAULT_ALLOWED_MIMES.iter().map(|m| m.to_string()).collect(),
            compression_threshold: 1024 * 1024, // 1 MB
            max_width: 1920,
            max_height: 1080,
            quality: 0.85,
            watchdog: WatchdogConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

impl UploadConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        let watchdog = WatchdogConfig {
            stall_check_interval: env_secs("UPLOAD_STALL_CHECK_SECS")
                .unwrap_or(default.watchdog.stall_check_interval),
            stall_threshold: env_secs("UPLOAD_STALL_THRESHOLD_SECS")
                .unwrap_or(default.watchdog.stall_threshold),
            retry_delay: env_secs("UPLOAD_RETRY_DELAY_SECS")
                .unwrap_or(default.watchdog.retry_delay),
            max_attempts: env_parse("UPLOAD_MAX_ATTEMPTS").unwrap_or(default.watchdog.max_attempts),
            session_timeout: env_secs("UPLOAD_TIMEOUT_SECS")
                .unwrap_or(default.watchdog.session_timeout),
        };

        let diagnostics = DiagnosticsConfig {
            test_upload_timeout: env_secs("DIAGNOSTICS_TEST_UPLOAD_TIMEOUT_SECS")
                .unwrap_or(default.diagnostics.test_upload_timeout),
            canary_url: env::var("DIAGNOSTICS_CANARY_URL")
                .unwrap_or(default.diagnostics.canary_url),
            canary_timeout: env_parse::<u64>("DIAGNOSTICS_CANARY_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.diagnostics.canary_timeout),
            probe_addr: env::var("DIAGNOSTICS_PROBE_ADDR")
                .unwrap_or(default.diagnostics.probe_addr),
            folder: env::var("DIAGNOSTICS_FOLDER").unwrap_or(default.diagnostics.folder),
            storage_check_timeout: default.diagnostics.storage_check_timeout,
        };

        let storage = StorageConfig {
            backend: env::var("STORAGE_BACKEND").unwrap_or(default.storage.backend),
            endpoint: env::var("STORAGE_ENDPOINT").ok(),
            access_key: env::var("STORAGE_ACCESS_KEY").ok(),
            secret_key: env::var("STORAGE_SECRET_KEY").ok(),
            bucket: env::var("STORAGE_BUCKET").unwrap_or(default.storage.bucket),
            public_url: env::var("STORAGE_PUBLIC_URL").ok(),
            part_size: env_parse("STORAGE_PART_SIZE").unwrap_or(default.storage.part_size),
        };

        Self {
            max_file_size: env_parse("UPLOAD_MAX_FILE_SIZE").unwrap_or(default.max_file_size),

            allowed_mimes: env::var("UPLOAD_ALLOWED_MIMES")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(default.allowed_mimes),

            compression_threshold: env_parse("UPLOAD_COMPRESSION_THRESHOLD")
                .unwrap_or(default.compression_threshold),

            max_width: env_parse("UPLOAD_MAX_WIDTH").unwrap_or(default.max_width),
            max_height: env_parse("UPLOAD_MAX_HEIGHT").unwrap_or(default.max_height),

            quality: env_parse::<f32>("UPLOAD_QUALITY")
                .map(|q| q.clamp(0.05, 1.0))
                .unwrap_or(default.quality),

            watchdog,
            diagnostics,
            storage,
        }
    }

    /// Config for local development: in-memory storage, no canary
    pub fn development() -> Self {
        let mut config = Self::default();
        config.storage.backend = "memory".to_string();
        config.storage.public_url = Some("http://localhost:9000/site-assets".to_string());
        config.diagnostics.canary_url = "http://127.0.0.1:9/canary.js".to_string();
        config
    }

    /// Config for production: everything from the environment, S3 enforced
    pub fn production() -> Self {
        let mut config = Self::from_env();
        config.storage.backend = "s3".to_string();
        config
    }
}
