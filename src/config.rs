//! Configuration for batch analysis runs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where chunked image arrays are read from
    #[serde(default)]
    pub store: StoreConfig,

    /// Batch shape: limit, failure policy, aggregation
    #[serde(default)]
    pub batch: BatchConfig,

    /// Pipeline template and engine
    pub pipeline: PipelineConfig,

    /// Where results are published
    #[serde(default)]
    pub publish: PublishConfig,

    /// Concurrency and metrics
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Chunked array store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Local directory holding the arrays. Mutually exclusive with bucket.
    #[serde(default)]
    pub local_path: Option<String>,

    /// S3 bucket holding the arrays
    #[serde(default = "default_store_bucket")]
    pub bucket: Option<String>,

    /// Custom S3 endpoint (MinIO, Ceph, ...)
    #[serde(default = "default_store_endpoint")]
    pub endpoint: Option<String>,

    /// S3 region
    #[serde(default = "default_region")]
    pub region: String,

    /// Read without credentials
    #[serde(default = "default_true")]
    pub anonymous: bool,

    /// Array root inside the store.
    /// Placeholders: `{collection}`, `{index}`, `{resolution}`.
    #[serde(default = "default_root_template")]
    pub root_template: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            local_path: None,
            bucket: default_store_bucket(),
            endpoint: default_store_endpoint(),
            region: default_region(),
            anonymous: true,
            root_template: default_root_template(),
        }
    }
}

/// What to do when a single work unit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Abort the batch on the first unit failure
    FailFast,
    /// Record the failure and keep going
    BestEffort,
}

/// How per-unit results are turned into annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationMode {
    /// Upload each unit's result file and link it individually
    PerUnitFile,
    /// One table holding every per-object row of every unit
    Concatenate,
    /// One table holding the per-image mean of every numeric column
    ReduceMean,
}

/// Where channel planes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlaneSourceMode {
    /// Always slice the chunked remote array
    Chunked,
    /// Always use the provider's pixel accessor
    Direct,
    /// Prefer the chunked array, fall back to the pixel accessor
    Auto,
}

/// Batch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum number of work units; `null` processes every child
    #[serde(default = "default_limit")]
    pub limit: Option<usize>,

    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,

    #[serde(default = "default_aggregation_mode")]
    pub aggregation_mode: AggregationMode,

    /// Chunk cache capacity in bytes
    #[serde(default = "default_cache_bytes")]
    pub cache_bytes: u64,

    /// Multiresolution level to fetch ("0" is full resolution)
    #[serde(default = "default_resolution_level")]
    pub resolution_level: String,

    #[serde(default = "default_plane_source")]
    pub plane_source: PlaneSourceMode,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            failure_policy: default_failure_policy(),
            aggregation_mode: default_aggregation_mode(),
            cache_bytes: default_cache_bytes(),
            resolution_level: default_resolution_level(),
            plane_source: default_plane_source(),
        }
    }
}

/// Pipeline template configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Path to the pipeline definition (.cppipe, .json, .yaml)
    pub path: PathBuf,

    /// Base name of the results table the pipeline writes (`<name>.csv`)
    #[serde(default = "default_results_name")]
    pub results_name: String,

    /// Logical input names bound to channels 0, 1, ...
    #[serde(default = "default_channel_names")]
    pub channel_names: Vec<String>,

    /// Number of leading acquisition stages to strip on load
    #[serde(default = "default_strip_stages")]
    pub strip_stages: usize,

    /// External engine invocation
    #[serde(default)]
    pub engine: EngineConfig,
}

/// External analysis engine invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker program run once per analysis stage
    #[serde(default)]
    pub program: Option<String>,

    /// Extra arguments placed before the per-stage arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Run without any display
    #[serde(default = "default_true")]
    pub headless: bool,
}

/// Which object a per-unit result file is linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileLinkTarget {
    Unit,
    Collection,
}

/// Publishing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Local directory receiving annotations. Mutually exclusive with bucket.
    #[serde(default)]
    pub local_path: Option<String>,

    /// S3 bucket receiving annotations
    #[serde(default)]
    pub bucket: Option<String>,

    /// S3 key prefix for annotations
    #[serde(default)]
    pub prefix: Option<String>,

    /// Name of the aggregated table
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Namespace attached to per-unit file annotations
    #[serde(default = "default_file_namespace")]
    pub file_namespace: String,

    /// Namespace attached to the aggregated table annotation
    #[serde(default = "default_table_namespace")]
    pub table_namespace: String,

    #[serde(default = "default_file_link_target")]
    pub file_link_target: FileLinkTarget,

    /// Directory where tables are written before upload and kept on failure
    #[serde(default)]
    pub work_dir: Option<String>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            local_path: Some("annotations".to_string()),
            bucket: None,
            prefix: None,
            table_name: default_table_name(),
            file_namespace: default_file_namespace(),
            table_namespace: default_table_namespace(),
            file_link_target: default_file_link_target(),
            work_dir: None,
        }
    }
}

impl PublishConfig {
    /// Directory for locally preserved tables.
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("hcs-batch"))
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of work units processed concurrently (1 = sequential)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for chunk decoding
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Fail a unit that takes longer than this many seconds
    #[serde(default)]
    pub unit_timeout_secs: Option<u64>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            worker_threads: None,
            rayon_threads: None,
            unit_timeout_secs: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        // local_path takes precedence over the default public bucket
        if self.store.local_path.is_none() && self.store.bucket.is_none() {
            anyhow::bail!("store: must specify either local_path or bucket");
        }
        if !self.store.root_template.contains("{index}") {
            anyhow::bail!("store: root_template must contain an {{index}} placeholder");
        }

        match (&self.publish.local_path, &self.publish.bucket) {
            (Some(_), Some(_)) => anyhow::bail!("publish: cannot specify both local_path and bucket"),
            (None, None) => anyhow::bail!("publish: must specify either local_path or bucket"),
            _ => {}
        }

        if self.batch.limit == Some(0) {
            anyhow::bail!("batch: limit must be > 0 (use null for no limit)");
        }
        if self.batch.cache_bytes == 0 {
            anyhow::bail!("batch: cache_bytes must be > 0");
        }
        if self.batch.resolution_level.is_empty() {
            anyhow::bail!("batch: resolution_level must not be empty");
        }
        if self.pipeline.results_name.is_empty() {
            anyhow::bail!("pipeline: results_name must not be empty");
        }
        if self.processing.concurrency == 0 {
            anyhow::bail!("processing: concurrency must be > 0");
        }
        if self.processing.unit_timeout_secs == Some(0) {
            anyhow::bail!("processing: unit_timeout_secs must be > 0 when set");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_store_bucket() -> Option<String> { Some("idr".to_string()) }
fn default_store_endpoint() -> Option<String> { Some("https://minio-dev.openmicroscopy.org/".to_string()) }
fn default_region() -> String { "us-east-1".to_string() }
fn default_root_template() -> String {
    "zarr/v0.1-extra/plate-{collection}.zarr/{index}/{resolution}".to_string()
}
fn default_true() -> bool { true }
fn default_limit() -> Option<usize> { Some(5) }
fn default_failure_policy() -> FailurePolicy { FailurePolicy::BestEffort }
fn default_aggregation_mode() -> AggregationMode { AggregationMode::ReduceMean }
fn default_cache_bytes() -> u64 { 2048 * 1024 * 1024 }
fn default_resolution_level() -> String { "0".to_string() }
fn default_plane_source() -> PlaneSourceMode { PlaneSourceMode::Auto }
fn default_results_name() -> String { "Nuclei".to_string() }
fn default_channel_names() -> Vec<String> { vec!["OrigBlue".to_string(), "OrigGreen".to_string()] }
fn default_strip_stages() -> usize { 4 }
fn default_table_name() -> String { "idr0002_cellprofiler".to_string() }
fn default_file_namespace() -> String { "cellprofiler.demo.namespace".to_string() }
fn default_table_namespace() -> String { "openmicroscopy.org/omero/bulk_annotations".to_string() }
fn default_file_link_target() -> FileLinkTarget { FileLinkTarget::Unit }
fn default_concurrency() -> usize { 1 }
fn default_metrics_interval() -> u64 { 10 }

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
pipeline:
  path: pipelines/ExamplePercentPositive.cppipe
"#;

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.batch.limit, Some(5));
        assert_eq!(config.batch.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(config.batch.aggregation_mode, AggregationMode::ReduceMean);
        assert_eq!(config.batch.cache_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.batch.resolution_level, "0");
        assert_eq!(config.pipeline.results_name, "Nuclei");
        assert_eq!(config.pipeline.channel_names, vec!["OrigBlue", "OrigGreen"]);
        assert_eq!(config.pipeline.strip_stages, 4);
        assert_eq!(config.store.bucket.as_deref(), Some("idr"));
        assert!(config.store.anonymous);
        assert_eq!(config.processing.concurrency, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_kebab_case_enums() {
        let yaml = r#"
pipeline:
  path: p.cppipe
batch:
  limit: null
  failure_policy: fail-fast
  aggregation_mode: per-unit-file
  plane_source: direct
publish:
  local_path: /tmp/out
  file_link_target: collection
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.batch.limit, None);
        assert_eq!(config.batch.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.batch.aggregation_mode, AggregationMode::PerUnitFile);
        assert_eq!(config.batch.plane_source, PlaneSourceMode::Direct);
        assert_eq!(config.publish.file_link_target, FileLinkTarget::Collection);
    }

    #[test]
    fn test_json_roundtrip_through_yaml() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        let yaml = config.to_yaml().unwrap();
        let again = Config::from_yaml(&yaml).unwrap();
        assert_eq!(again.store.root_template, config.store.root_template);

        let json = r#"{"pipeline": {"path": "p.json"}, "batch": {"limit": 2}}"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.batch.limit, Some(2));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.store.bucket = None;
        assert!(config.validate().is_err(), "no array store");

        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.publish.bucket = Some("results".to_string());
        assert!(config.validate().is_err(), "publish local_path and bucket both set");

        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.batch.limit = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.processing.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::from_yaml(MINIMAL).unwrap();
        config.store.root_template = "plate.zarr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_detects_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"pipeline": {"path": "p.cppipe"}}"#).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.pipeline.path, PathBuf::from("p.cppipe"));
    }
}
