use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use pasta_core::config::{resolve_config_path, UploadConfig};
use pasta_core::progress::format_bytes;
use pasta_core::types::types::{TransferReport, UploadError};
use pasta_core::uploader::chunk_planner;
use pasta_core::uploader::http_uploader::HttpUploader;
use pasta_core::uploader::transfer_coordinator::{TransferSettings, DEFAULT_MAX_WORKERS};

mod clipboard;
mod terminal_observer;
use clipboard::ClipboardHook;
use terminal_observer::TerminalProgressObserver;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Expiry the server reads as "never".
const PERMANENT_EXPIRY: &str = "100y";

#[derive(Parser)]
#[command(name = "pasta", about = "Chunked parallel file uploader for Zipline")]
struct Args {
    /// File to upload
    file: PathBuf,

    /// Maximum number of views (0 = unlimited)
    #[arg(default_value_t = 0)]
    max_views: u32,

    /// Chunk size in MB
    #[arg(short, long = "chunk-size", default_value_t = 10)]
    chunk_size: u64,

    /// Number of parallel uploads
    #[arg(short, long, default_value_t = DEFAULT_MAX_WORKERS)]
    workers: usize,

    /// Extra attempts per chunk after a network error or 5xx response
    #[arg(short, long, default_value_t = 0)]
    retries: u32,

    /// Silent mode - output only the URLs
    #[arg(short, long)]
    silent: bool,

    /// Config file providing `host` and `authorization_token`
    #[arg(long)]
    config: Option<PathBuf>,

    /// Password protect the upload
    #[arg(short, long)]
    password: Option<String>,

    /// Folder to place the upload in
    #[arg(short, long)]
    folder: Option<String>,

    /// Never expire the upload
    #[arg(long, conflicts_with = "expires")]
    permanent: bool,

    /// Expiry passed to the server as-is (e.g. "7d")
    #[arg(long)]
    expires: Option<String>,

    /// Don't copy the URLs to the clipboard
    #[arg(long)]
    no_clipboard: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    let interactive = !args.silent && std::io::stdout().is_terminal();

    match run(args, interactive).await {
        Ok(report) if report.outcome.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args, interactive: bool) -> Result<TransferReport, UploadError> {
    let config_path = resolve_config_path(args.config.clone());
    log::debug!("[pasta] config: {}", config_path.display());
    let config = UploadConfig::load(&config_path)?;

    let chunk_size = args.chunk_size.checked_mul(BYTES_PER_MB).ok_or_else(|| {
        UploadError::InvalidConfiguration(format!("chunk size of {} MB is too large", args.chunk_size))
    })?;
    let settings = TransferSettings {
        chunk_size,
        max_workers: args.workers,
        max_retries: args.retries,
    };

    let (mut uploader, metadata) = HttpUploader::from_config(&config, settings)?;

    let mut metadata = metadata.with_max_views(args.max_views);
    if let Some(password) = &args.password {
        metadata = metadata.with_password(password);
    }
    if let Some(folder) = &args.folder {
        metadata = metadata.with_folder(folder);
    }
    if args.permanent {
        metadata = metadata.with_deletes_at(PERMANENT_EXPIRY);
    } else if let Some(expires) = &args.expires {
        metadata = metadata.with_deletes_at(expires);
    }

    if interactive {
        print_header(&args, &settings);
        uploader.add_observer(Box::new(TerminalProgressObserver::new()));
        if !args.no_clipboard {
            uploader.add_post_upload_hook(Box::new(ClipboardHook));
        }
    }

    let report = uploader.upload(&args.file, metadata).await?;
    print_report(&report, interactive);
    Ok(report)
}

fn print_header(args: &Args, settings: &TransferSettings) {
    let name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| args.file.display().to_string());
    println!("Uploading file: {}", name);

    if args.max_views > 0 {
        println!("Max views: {}", args.max_views);
    }

    // Best effort; the uploader reports a missing file properly.
    if let Ok(meta) = std::fs::metadata(&args.file) {
        let size = meta.len();
        let chunks = chunk_planner::plan(size, settings.chunk_size)
            .map(|c| c.len())
            .unwrap_or(0);
        println!("File size: {}", format_bytes(size));
        println!("Chunks: {} x {}", chunks, format_bytes(settings.chunk_size));
    }
    println!("Parallel connections: {}", settings.max_workers);
    println!();
}

fn print_report(report: &TransferReport, interactive: bool) {
    let outcome = &report.outcome;

    if !outcome.is_success() {
        let failed = outcome.failed();
        eprintln!();
        eprintln!("Some chunks failed:");
        for chunk in failed {
            eprintln!("  Chunk {}: {}", chunk.index, chunk.error);
        }
        eprintln!("Error: {} of {} chunks failed to upload", failed.len(), report.chunk_count);
        return;
    }

    if interactive {
        println!();
        println!(
            "All {} chunks uploaded successfully in {:.1}s",
            report.chunk_count,
            report.elapsed.as_secs_f64()
        );
        println!("URLs:");
        for chunk in outcome.succeeded() {
            println!("  Part {}: {}", chunk.index, chunk.url);
        }
    } else {
        for url in outcome.urls() {
            println!("{}", url);
        }
    }
}
