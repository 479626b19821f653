// SPDX-FileCopyrightText: 2025 payload-dumper contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Instant,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::{
    cli::{status, warning},
    format::{ota, payload::{self, ExtractOptions, Payload}},
    progress::TerminalProgress,
    source::{self, FileSource, HttpOptions, HttpSource, ReadAt},
    util,
};

/// Extract partition images from an Android A/B OTA payload.
///
/// The input may be a raw payload.bin, an OTA zip containing payload.bin as
/// a stored entry, or an HTTP(S) URL of such a zip served by an origin that
/// supports byte ranges.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path or URL of the payload or OTA zip.
    input: String,

    /// List partitions in the payload without extracting.
    #[arg(short, long)]
    list: bool,

    /// Output directory for extracted images.
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Extract only the listed partitions (comma-separated).
    #[arg(short, long, value_name = "NAME", value_delimiter = ',')]
    partitions: Vec<String>,

    /// Number of extraction threads (defaults to the number of CPUs).
    #[arg(short, long, value_name = "N", default_value_t = 0)]
    concurrency: usize,

    /// Disable SHA-256 verification of operation data.
    #[arg(long)]
    no_verify: bool,

    /// User-Agent for HTTP requests.
    #[arg(short, long, value_name = "STR")]
    user_agent: Option<String>,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(format!(
        "extracted_{}",
        chrono::Local::now().format("%Y%m%d_%H%M%S"),
    ))
}

fn list_partitions(payload: &Payload) {
    println!("Partitions in payload:");

    for p in &payload.manifest.partitions {
        let size = p
            .new_partition_info
            .as_ref()
            .and_then(|info| info.size)
            .unwrap_or(0);

        println!(
            "  {:<20} {:>10}  ({} ops)",
            p.partition_name,
            util::format_size(size),
            p.operations.len(),
        );
    }
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging();
    logging_initialized.store(true, Ordering::SeqCst);

    let input = cli.input.as_str();
    let remote = source::is_url(input);

    if !remote && !Path::new(input).exists() {
        bail!("File does not exist: {input}");
    }

    status!("Source: {input}{}", if remote { " (remote)" } else { "" });

    // Keep a concrete handle to the HTTP backend so the download counter
    // stays readable after extraction.
    let http_source = if remote {
        let mut options = HttpOptions::default();
        if let Some(ua) = &cli.user_agent {
            options.user_agent = ua.clone();
        }

        let http = HttpSource::open(input, options)
            .with_context(|| format!("Failed to open URL: {input}"))?;

        Some(Arc::new(http))
    } else {
        None
    };

    let raw: Arc<dyn ReadAt> = match &http_source {
        Some(http) => http.clone(),
        None => {
            let path = Path::new(input);
            let file = FileSource::open(path)
                .with_context(|| format!("Failed to open for reading: {path:?}"))?;
            Arc::new(file)
        }
    };

    // URLs always refer to OTA zips; local files only when named *.zip.
    let payload_source: Arc<dyn ReadAt> = if remote || input.ends_with(".zip") {
        let member = ota::open_payload_entry(raw.clone())
            .with_context(|| format!("Failed to locate {} in archive", ota::PATH_PAYLOAD))?;
        Arc::new(member)
    } else {
        raw
    };

    let payload = Payload::parse(payload_source.as_ref())
        .context("Failed to parse payload")?;

    status!("Payload version: {}", payload.version);
    status!("Number of partitions: {}", payload.manifest.partitions.len());

    if cli.list {
        list_partitions(&payload);
        return Ok(());
    }

    if !payload.is_full_ota() {
        warning!("Payload is a delta OTA; source-dependent operations will fail");
    }

    let verify = !cli.no_verify;
    status!(
        "Hash verification: {}",
        if verify { "enabled" } else { "disabled" },
    );

    let concurrency = if cli.concurrency == 0 {
        thread::available_parallelism().map_or(4, |n| n.get())
    } else {
        cli.concurrency
    };
    let output = cli.output.unwrap_or_else(default_output_dir);

    status!("Output directory: {output:?}");
    status!("Concurrency: {concurrency} thread(s)");

    let options = ExtractOptions {
        concurrency,
        verify,
    };
    let progress = TerminalProgress::new();

    let start = Instant::now();
    let result = payload::extract_partitions(
        payload_source.as_ref(),
        &payload,
        &output,
        &cli.partitions,
        &options,
        &progress,
    );
    let elapsed = start.elapsed();

    if let Some(http) = &http_source {
        let downloaded = http.bytes_downloaded();
        status!("Total downloaded: {}", util::format_size(downloaded));

        let secs = elapsed.as_secs_f64();
        if result.is_ok() && secs > 0.0 {
            status!(
                "Average download speed: {}/s",
                util::format_size((downloaded as f64 / secs) as u64),
            );
        }
    }

    result.context("Extraction failed")?;

    status!("Extraction completed in {:.1}s", elapsed.as_secs_f64());

    Ok(())
}
