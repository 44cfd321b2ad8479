use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, eyre};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use asyncimage::domain::{Completion, ImageId, LoadLocation, LoadOutcome};
use asyncimage::infrastructure::image::DEFAULT_LOADER_NAME;
use asyncimage::infrastructure::{AppConfig, CliArgs, ConfigStorage, ImageLoader, MemoryImageCache};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = &config.log_path {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let storage = ConfigStorage::new()?;
    let mut config = storage.load_config(args.config.as_deref())?;
    config.merge_with_args(args);
    Ok(config)
}

/// File name for a persisted copy of `id`.
fn output_file_name(id: &ImageId) -> String {
    let extension = Path::new(id.as_str().split(['?', '#']).next().unwrap_or_default())
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("img")
        .to_ascii_lowercase();
    format!("{}.{extension}", id.digest())
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    id: &'a str,
    success: bool,
    location: LoadLocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<'a> From<&'a LoadOutcome> for Report<'a> {
    fn from(outcome: &'a LoadOutcome) -> Self {
        let image = outcome.image();
        Self {
            id: outcome.id.as_str(),
            success: outcome.is_success(),
            location: outcome.location,
            width: image.map(|i| i.width()),
            height: image.map(|i| i.height()),
            error: outcome.error().map(ToString::to_string),
        }
    }
}

fn print_outcome(outcome: &LoadOutcome, json: bool) -> Result<()> {
    let report = Report::from(outcome);
    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else if let (Some(width), Some(height)) = (report.width, report.height) {
        println!("ok\t{}\t{width}x{height}\t{}", report.location, report.id);
    } else {
        println!(
            "failed\t{}\t{}",
            report.id,
            report.error.unwrap_or_default()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!(version = asyncimage::VERSION, ids = args.ids.len(), "Starting asyncimage");

    let cache = Arc::new(MemoryImageCache::new(
        config.cache.count_limit,
        config.cache.total_cost_limit,
    ));
    let loader = ImageLoader::builder(DEFAULT_LOADER_NAME)
        .config(config.loader_config())
        .cache(cache.clone())
        .build()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for raw in &args.ids {
        let id = ImageId::new(raw.as_str());
        let completion = Completion::channel(tx.clone());
        match &config.output_dir {
            Some(dir) => {
                let destination = dir.join(output_file_name(&id));
                loader.load_to_file(id, destination, None, Some(completion));
            }
            None => loader.load(id, None, Some(completion)),
        }
    }
    drop(tx);

    let mut failed = 0usize;
    while let Some(outcome) = rx.recv().await {
        if !outcome.is_success() {
            failed += 1;
        }
        print_outcome(&outcome, args.json)?;
    }

    debug!(stats = %cache.stats(), "Finished loading");

    if failed > 0 {
        return Err(eyre!("{failed} of {} loads failed", args.ids.len()));
    }
    Ok(())
}
