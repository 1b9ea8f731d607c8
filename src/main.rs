use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use site_asset_uploader::config::UploadConfig;
use site_asset_uploader::infrastructure::storage;
use site_asset_uploader::models::{DiagnosticStatus, UploadEvent, UploadRequest};
use site_asset_uploader::{DEFAULT_SLOT, UploadClient};
use std::path::PathBuf;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Use the development preset (in-memory storage)
    #[arg(long, global = true)]
    dev: bool,

    /// Override STORAGE_BACKEND (s3, memory)
    #[arg(long, global = true)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload one image
    Upload {
        file: PathBuf,

        /// Target folder in the bucket
        #[arg(short, long, default_value = "uploads")]
        folder: String,

        /// Logical upload slot
        #[arg(short, long, default_value = DEFAULT_SLOT)]
        slot: String,
    },
    /// Run the environment checks and print the report as JSON
    Diagnose,
    /// Upload a 1x1 test image end to end
    TestUpload,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "site_asset_uploader=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = if args.dev {
        UploadConfig::development()
    } else {
        UploadConfig::from_env()
    };
    if let Some(backend) = args.backend {
        config.storage.backend = backend;
    }

    info!(
        "🛡️  Upload Config: Max Size={}MB, Compress Above={}KB, Timeout={}s",
        config.max_file_size / 1024 / 1024,
        config.compression_threshold / 1024,
        config.watchdog.session_timeout.as_secs()
    );

    let storage = storage::setup_storage(&config.storage).await?;
    let client = UploadClient::new(storage, config.clone());

    match args.command {
        Command::Upload { file, folder, slot } => {
            let request = UploadRequest::from_path(&file, &folder, &config)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            run_upload(&client, &slot, request).await
        }
        Command::Diagnose => {
            let report = client.run_diagnostics().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::TestUpload => {
            let result = client.test_upload().await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.status == DiagnosticStatus::Fail {
                bail!("Test upload failed");
            }
            Ok(())
        }
    }
}

async fn run_upload(client: &UploadClient, slot: &str, request: UploadRequest) -> anyhow::Result<()> {
    let mut handle = match client.start_upload(slot, request).await {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("{} ({})", err, err.guidance());
            bail!("Upload rejected: {}", err.kind().as_str());
        }
    };

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                info!("⌨️  Ctrl+C received, cancelling upload...");
                interrupted = true;
                client.cancel_upload(slot);
            }
            event = handle.next_event() => match event {
                Some(UploadEvent::Progress(p)) => {
                    eprintln!("{:>5.1}% {}", p.percent, p.phase.as_str());
                }
                Some(UploadEvent::Stalled { error, attempt, will_retry }) => {
                    eprintln!("{} (attempt {}){}", error, attempt, if will_retry { ", retrying" } else { "" });
                }
                Some(UploadEvent::Retrying { attempt }) => {
                    eprintln!("Starting attempt {}", attempt);
                }
                Some(UploadEvent::Succeeded(receipt)) => {
                    println!("{}", receipt.url);
                    return Ok(());
                }
                Some(UploadEvent::Failed(err)) => {
                    eprintln!("{}. {}", err, err.guidance());
                    if err.offers_manual_retry() {
                        eprintln!("Run the same command again to retry.");
                    }
                    bail!("Upload failed: {}", err.kind().as_str());
                }
                None => bail!("Upload ended without a result"),
            }
        }
    }
}
