//! HCS Batch
//!
//! Batch image analysis over high-content-screening collections: read
//! multi-channel planes from chunked OME-Zarr arrays through a byte-bounded
//! cache, run each image through its own clone of an analysis pipeline, and
//! publish the per-image results as one typed table linked to the plate or
//! dataset.
//!
//! # Architecture
//!
//! - **I/O**: Zarr v2/v3 chunk reads over object_store with a shared LRU cache
//! - **Template**: pipeline definitions, normalization, clone + inject + run
//! - **Batch**: unit enumeration, bounded-concurrency driver, metrics
//! - **Results**: per-unit frames, aggregation, schema inference, publishing
//!
//! # Usage
//!
//! ```no_run
//! use hcs_batch::{run_batch, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("config.yaml".as_ref())?;
//!     let report = run_batch(config, "plate.yaml".as_ref()).await?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod collection;
pub mod config;
pub mod error;
pub mod io;
pub mod results;
pub mod template;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{BatchDriver, BatchOptions, BatchReport, Metrics, UnitFailure};
pub use collection::{CollectionProvider, CollectionRef, ManifestProvider, WorkUnit};
pub use config::Config;
pub use error::{Error, ErrorKind};
pub use io::{ArrayFetcher, ChunkCache, ChunkedArray};
pub use results::{ObjectStoreSink, Publisher};
pub use template::{AnalysisEngine, CommandEngine, PipelineTemplate};

use anyhow::{Context, Result};
use config::PlaneSourceMode;
use std::path::Path;
use std::sync::Arc;

/// Run one batch over the collection described by `manifest`.
pub async fn run_batch(config: Config, manifest: &Path) -> Result<BatchReport> {
    config.validate()?;

    tracing::info!("Starting batch analysis");

    // Template problems end the batch before any unit is touched
    let template = PipelineTemplate::load(&config.pipeline.path, config.pipeline.strip_stages)?;
    tracing::info!(
        "Pipeline '{}' ready with {} analysis stages",
        template.name(),
        template.len()
    );

    let provider = Arc::new(
        ManifestProvider::from_file(manifest)
            .with_context(|| format!("loading manifest {}", manifest.display()))?,
    );
    let collection_id = provider.collection_ref().id.clone();

    let program = config
        .pipeline
        .engine
        .program
        .clone()
        .context("pipeline.engine.program must be set to run a batch")?;
    let engine = Arc::new(CommandEngine::new(program, config.pipeline.engine.args.clone()));

    let metrics = Metrics::new();

    let publish_store = io::create_publish_store(&config.publish)?;
    let publisher = Publisher::new(Arc::new(ObjectStoreSink::new(publish_store)), config.publish.clone())
        .with_metrics(metrics.clone());

    let mut driver = BatchDriver::new(
        provider,
        template,
        engine,
        publisher,
        BatchOptions::from_config(&config),
    )
    .with_metrics(metrics.clone());

    if config.batch.plane_source != PlaneSourceMode::Direct {
        let array_store = io::create_array_store(&config.store)?;
        tracing::info!(
            "Reading arrays from {} (cache {:.0} MiB)",
            config.store.root_template,
            config.batch.cache_bytes as f64 / (1024.0 * 1024.0)
        );
        let fetcher = ArrayFetcher::new(
            array_store,
            config.store.root_template.clone(),
            config.batch.cache_bytes,
            Some(metrics),
        );
        driver = driver.with_fetcher(Arc::new(fetcher));
    }

    let report = driver.run(&collection_id).await?;
    Ok(report)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
