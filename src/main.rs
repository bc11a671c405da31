use std::path::Path;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod ann;
mod app;
mod cli;
mod config;
mod eid;
mod embedding;
mod ingest;
mod lifecycle;
mod query;
mod records;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::AppFactory;
use ingest::{BulkItem, IngestSource};
use records::Owner;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

fn ingest_source(sources: Vec<String>) -> IngestSource {
    match sources.as_slice() {
        [single] if Path::new(single).is_dir() => IngestSource::Directory(single.into()),
        _ => IngestSource::Uris(sources),
    }
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = cli::Args::parse();
    let config = AppFactory::load_config()?;

    match args.command {
        cli::Command::Config {} => {
            println!("{}", serde_yml::to_string(&config)?);
            Ok(())
        }

        cli::Command::Init {} => {
            let app = AppFactory::create_app(config)?;
            let deployment = app.initialize()?;
            println!("{}", serde_json::to_string_pretty(&deployment)?);
            Ok(())
        }

        cli::Command::Ingest { sources, user } => {
            let owner = match user {
                Some(id) => Owner::from_parts("user", Some(&id))?,
                None => Owner::Admin,
            };

            let app = AppFactory::create_app(config)?;
            let report = app.ingest(ingest_source(sources), &owner)?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.nothing_to_do() {
                log::warn!("no images found to ingest");
            } else {
                log::info!(
                    "{} images indexed, {} skipped, {} ignored",
                    report.succeeded(),
                    report.skipped(),
                    report.ignored.len()
                );
            }
            Ok(())
        }

        cli::Command::Bulk {
            manifest,
            batch_size,
        } => {
            if batch_size == Some(0) {
                bail!("--batch-size must be greater than 0");
            }

            let data = std::fs::read(&manifest)
                .with_context(|| format!("Failed to read {}", manifest.display()))?;
            let items: Vec<BulkItem> =
                serde_json::from_slice(&data).context("Manifest is malformed")?;

            let app = AppFactory::create_app(config)?;
            let report = app.bulk_index(&items, batch_size)?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            log::info!(
                "{} images indexed in {} batches, {} batches failed",
                report.succeeded(),
                report.batches.len(),
                report.failed_batches()
            );
            Ok(())
        }

        cli::Command::Search {
            image,
            k,
            filter,
            download,
        } => {
            let app = AppFactory::create_app(config)?;
            let results = app.search(&image, k, filter.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&results)?);

            if let Some(out_dir) = download {
                let report = app.materialize(&results, &out_dir)?;
                log::info!(
                    "{} of {} results downloaded to {}",
                    report.written.len(),
                    results.len(),
                    out_dir.display()
                );
            }
            Ok(())
        }

        cli::Command::Serve {} => {
            let app = AppFactory::create_app(config)?;
            web::start_daemon(app)
        }
    }
}
