//! HCS Batch CLI
//!
//! Analyze the images of a plate or dataset and publish the results table.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hcs_batch::{build_runtime, init_rayon, run_batch, Config, PipelineTemplate};

const DEFAULT_MANIFEST: &str = "manifest.yaml";

#[derive(Parser)]
#[command(name = "hcs-batch")]
#[command(about = "Batch image analysis over HCS plates and datasets", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override concurrency level
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Override the number of units analyzed (0 = no limit)
    #[arg(long, global = true)]
    limit: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the batch (default if no command specified)
    Run {
        /// Collection manifest (YAML or JSON)
        #[arg(short, long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,
    },

    /// Validate configuration
    Validate,

    /// Load and normalize the pipeline template, then list its stages
    InspectTemplate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => {
            run_command(&cli.config, Path::new(DEFAULT_MANIFEST), cli.concurrency, cli.limit)?;
        }

        Some(Commands::Run { ref manifest }) => {
            run_command(&cli.config, manifest, cli.concurrency, cli.limit)?;
        }

        Some(Commands::Validate) => {
            validate_command(&cli.config)?;
        }

        Some(Commands::InspectTemplate) => {
            inspect_template_command(&cli.config)?;
        }

        Some(Commands::GenerateConfig { ref output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(config_path: &Path) -> Result<Config> {
    Config::from_file(config_path)
        .with_context(|| format!("loading configuration {}", config_path.display()))
}

fn run_command(
    config_path: &Path,
    manifest: &Path,
    concurrency: Option<usize>,
    limit: Option<usize>,
) -> Result<()> {
    let mut config = load_config(config_path)?;

    // Apply overrides
    if let Some(c) = concurrency {
        config.processing.concurrency = c;
    }
    if let Some(l) = limit {
        config.batch.limit = (l > 0).then_some(l);
    }

    config.validate()?;

    // Initialize Rayon
    init_rayon(config.processing.rayon_threads)?;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.processing.worker_threads)?;
    let report = runtime.block_on(async { run_batch(config, manifest).await })?;

    println!("{report}");
    Ok(())
}

fn validate_command(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn inspect_template_command(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let template = PipelineTemplate::load(&config.pipeline.path, config.pipeline.strip_stages)?;

    println!("\n=== Pipeline '{}' ===", template.name());
    println!("Source: {}", template.source().display());
    println!("Analysis stages: {}", template.len());
    for (i, stage) in template.stages().iter().enumerate() {
        println!("  {:>2}. {}", i + 1, stage.name());
    }
    println!("Channel inputs: {}", config.pipeline.channel_names.join(", "));
    println!(
        "Results table: <output_dir>/{}.csv",
        config.pipeline.results_name
    );
    println!("=====================\n");

    Ok(())
}

fn generate_config_command(output: &Path) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# HCS Batch Configuration

# === STORE: Where chunked image arrays are read from ===
# Choose ONE of: local_path (local disk) OR bucket (S3)
store:
  # Option 1: Read from a local directory
  # local_path: "/data/zarr"

  # Option 2: Read from S3 (the public IDR bucket by default)
  bucket: "idr"
  endpoint: "https://minio-dev.openmicroscopy.org/"
  region: "us-east-1"
  anonymous: true

  # Array root per unit; {collection}, {index} and {resolution} are substituted
  root_template: "zarr/v0.1-extra/plate-{collection}.zarr/{index}/{resolution}"

# === BATCH: Which units, and what happens on failure ===
batch:
  # Analyze only the first N children (null = all)
  limit: 5

  # fail-fast: abort on the first failed unit
  # best-effort: record failures and continue
  failure_policy: best-effort

  # per-unit-file: link each unit's CSV individually
  # concatenate: one table with every detected object
  # reduce-mean: one table with per-image means
  aggregation_mode: reduce-mean

  # Chunk cache budget in bytes (2 GiB)
  cache_bytes: 2147483648

  # Multiresolution level ("0" is full resolution)
  resolution_level: "0"

  # chunked: always read chunked arrays
  # direct: always use the manifest's pixel files
  # auto: chunked, falling back to pixel files
  plane_source: auto

# === PIPELINE: Analysis template and engine ===
pipeline:
  path: "pipelines/ExamplePercentPositive.cppipe"

  # Table the pipeline writes, without extension
  results_name: "Nuclei"

  # Logical input names for channels 0, 1, ...
  channel_names: ["OrigBlue", "OrigGreen"]

  # Leading acquisition stages removed on load
  strip_stages: 4

  engine:
    # Program invoked once per analysis stage
    program: "cellprofiler-stage"
    args: []
    headless: true

# === PUBLISH: Where results go ===
# Choose ONE of: local_path OR bucket+prefix
publish:
  local_path: "annotations"
  # bucket: "results-bucket"
  # prefix: "hcs-batch"

  table_name: "idr0002_cellprofiler"
  file_namespace: "cellprofiler.demo.namespace"
  table_namespace: "openmicroscopy.org/omero/bulk_annotations"

  # unit: link per-unit files to their image
  # collection: link them to the plate or dataset
  file_link_target: unit

  # Tables are written here first and kept if the upload fails
  # work_dir: "/tmp/hcs-batch"

# === PROCESSING: Performance tuning ===
processing:
  # Units analyzed concurrently (1 = sequential)
  concurrency: 1

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 8

  # Rayon thread pool size for chunk decoding (null = num CPUs)
  # rayon_threads: 8

  # Fail a unit that runs longer than this
  # unit_timeout_secs: 600

  # Print progress metrics during the batch
  enable_metrics: true

  # Metrics reporting interval in seconds
  metrics_interval_secs: 10

  # Save final metrics as JSON
  # metrics_output_path: "metrics.json"
"#;

    std::fs::write(output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
