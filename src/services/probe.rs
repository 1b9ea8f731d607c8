use async_trait::async_trait;
use serde::Serialize;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Round-trip times above these map to the slower connection classes
const TWO_G_RTT_MS: u128 = 1400;
const THREE_G_RTT_MS: u128 = 270;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionClass {
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
}

impl ConnectionClass {
    pub fn from_rtt(rtt: Duration) -> Self {
        let ms = rtt.as_millis();
        if ms > TWO_G_RTT_MS {
            ConnectionClass::TwoG
        } else if ms > THREE_G_RTT_MS {
            ConnectionClass::ThreeG
        } else {
            ConnectionClass::FourG
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionClass::TwoG => "2g",
            ConnectionClass::ThreeG => "3g",
            ConnectionClass::FourG => "4g",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Offline,
    Online {
        class: ConnectionClass,
        rtt: Duration,
    },
    /// The platform gives no usable signal
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    BinaryFiles,
    RasterImaging,
    BackgroundWorkers,
    KeyValueStorage,
    DiskCache,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 5] = [
        CapabilityKind::BinaryFiles,
        CapabilityKind::RasterImaging,
        CapabilityKind::BackgroundWorkers,
        CapabilityKind::KeyValueStorage,
        CapabilityKind::DiskCache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::BinaryFiles => "binary_files",
            CapabilityKind::RasterImaging => "raster_imaging",
            CapabilityKind::BackgroundWorkers => "background_workers",
            CapabilityKind::KeyValueStorage => "key_value_storage",
            CapabilityKind::DiskCache => "disk_cache",
        }
    }

    /// Uploads cannot work at all without this one
    pub fn is_required(&self) -> bool {
        matches!(self, CapabilityKind::BinaryFiles)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub kind: CapabilityKind,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl MemoryUsage {
    pub fn ratio(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.limit_bytes as f64
    }
}

/// Read-only view of the environment the uploader runs in
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    async fn network(&self) -> NetworkStatus;

    async fn capabilities(&self) -> Vec<Capability>;

    /// `None` when the platform does not expose memory figures
    async fn memory(&self) -> Option<MemoryUsage>;

    /// Fetches `url` within `timeout`. Any failure is returned as a message.
    async fn fetch_canary(&self, url: &str, timeout: Duration) -> Result<(), String>;
}

/// Probe backed by the real host: a TCP connect for the network, temp files for
/// capabilities, `/proc/meminfo` for memory and an HTTP GET for the canary.
pub struct SystemProbe {
    probe_addr: String,
    connect_timeout: Duration,
    http: reqwest::Client,
}

impl SystemProbe {
    pub fn new(probe_addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            probe_addr: probe_addr.into(),
            connect_timeout,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EnvironmentProbe for SystemProbe {
    async fn network(&self) -> NetworkStatus {
        if self.probe_addr.is_empty() {
            return NetworkStatus::Unknown;
        }

        let started = Instant::now();
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.probe_addr)).await {
            Ok(Ok(_stream)) => {
                let rtt = started.elapsed();
                debug!("Network probe {} answered in {:?}", self.probe_addr, rtt);
                NetworkStatus::Online {
                    class: ConnectionClass::from_rtt(rtt),
                    rtt,
                }
            }
            Ok(Err(e)) => {
                debug!("Network probe {} failed: {}", self.probe_addr, e);
                NetworkStatus::Offline
            }
            Err(_) => {
                debug!("Network probe {} timed out", self.probe_addr);
                NetworkStatus::Offline
            }
        }
    }

    async fn capabilities(&self) -> Vec<Capability> {
        let background = tokio::task::spawn_blocking(|| std::thread::available_parallelism().is_ok())
            .await
            .unwrap_or(false);

        let checks = tokio::task::spawn_blocking(move || {
            CapabilityKind::ALL
                .iter()
                .map(|&kind| Capability {
                    kind,
                    available: match kind {
                        CapabilityKind::BinaryFiles => probe_binary_files(),
                        CapabilityKind::RasterImaging => probe_raster(),
                        CapabilityKind::BackgroundWorkers => background,
                        CapabilityKind::KeyValueStorage => is_writable_location(data_dir()),
                        CapabilityKind::DiskCache => is_writable_location(cache_dir()),
                    },
                })
                .collect::<Vec<_>>()
        })
        .await;

        checks.unwrap_or_else(|_| {
            CapabilityKind::ALL
                .iter()
                .map(|&kind| Capability {
                    kind,
                    available: false,
                })
                .collect()
        })
    }

    async fn memory(&self) -> Option<MemoryUsage> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
        parse_meminfo(&meminfo)
    }

    async fn fetch_canary(&self, url: &str, timeout: Duration) -> Result<(), String> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("Canary returned {}", response.status()))
        }
    }
}

/// Used / limit from `/proc/meminfo` (kB values)
pub fn parse_meminfo(meminfo: &str) -> Option<MemoryUsage> {
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kb_value(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kb_value(rest);
        }
    }

    let total = total.filter(|&t| t > 0)?;
    let available = available?.min(total);
    Some(MemoryUsage {
        used_bytes: (total - available) * 1024,
        limit_bytes: total * 1024,
    })
}

fn parse_kb_value(s: &str) -> Option<u64> {
    s.split_whitespace().next().and_then(|v| v.parse().ok())
}

fn probe_binary_files() -> bool {
    let payload = [0u8, 0xFF, 0x7F, 0x80, 0x0A, 0x0D];
    let Ok(mut file) = tempfile::tempfile() else {
        return false;
    };
    let mut back = Vec::new();
    file.write_all(&payload).is_ok()
        && file.seek(SeekFrom::Start(0)).is_ok()
        && file.read_to_end(&mut back).is_ok()
        && back == payload
}

fn probe_raster() -> bool {
    let pixel = image::DynamicImage::new_rgba8(1, 1);
    let mut out = Vec::new();
    if pixel
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .is_err()
    {
        return false;
    }
    image::load_from_memory(&out).is_ok()
}

/// Whether files could be written at `dir`. Tries the directory itself when it
/// exists, otherwise its nearest existing ancestor, inside a scratch directory
/// that is removed again. Nothing is created at `dir`.
fn is_writable_location(dir: Option<PathBuf>) -> bool {
    let Some(dir) = dir else {
        return false;
    };
    let Some(existing) = dir.ancestors().find(|p| p.is_dir()) else {
        return false;
    };
    match tempfile::tempdir_in(existing) {
        Ok(scratch) => tempfile::NamedTempFile::new_in(scratch.path()).is_ok(),
        Err(_) => false,
    }
}

fn data_dir() -> Option<PathBuf> {
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
        .map(|d| d.join("site-asset-uploader"))
}

fn cache_dir() -> Option<PathBuf> {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
        .map(|d| d.join("site-asset-uploader"))
}
