//! Batch analysis driver.
//!
//! Per batch: resolve the collection, enumerate its units, then for each unit
//! fetch its channel planes, inject them into a fresh clone of the pipeline
//! template, run the clone and capture its results table. Units run with
//! bounded concurrency; publishing happens once, after every started unit
//! has finished.

use crate::batch::{Metrics, MetricsReporter};
use crate::collection::{CollectionProvider, CollectionRef, WorkUnit};
use crate::config::{AggregationMode, Config, FailurePolicy, PlaneSourceMode};
use crate::error::{Error, ErrorKind, Result};
use crate::io::ArrayFetcher;
use crate::results::{AnnotationRef, Publisher, ResultFrame, UnitResult};
use crate::template::{AnalysisEngine, EngineSettings, PipelineTemplate};
use futures::stream::{self, StreamExt};
use ndarray::Array2;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Options for one batch run.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Maximum number of units; `None` processes every child
    pub limit: Option<usize>,

    pub failure_policy: FailurePolicy,

    pub aggregation_mode: AggregationMode,

    /// Multiresolution level to read planes from
    pub resolution_level: String,

    pub plane_source: PlaneSourceMode,

    /// Logical input names for channels 0, 1, ...
    pub channel_names: Vec<String>,

    /// Base name of the table each run writes
    pub results_name: String,

    pub headless: bool,

    /// Units processed concurrently
    pub concurrency: usize,

    /// Per-unit deadline
    pub unit_timeout: Option<Duration>,

    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the batch
    pub metrics_output_path: Option<String>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            limit: Some(5),
            failure_policy: FailurePolicy::BestEffort,
            aggregation_mode: AggregationMode::ReduceMean,
            resolution_level: "0".to_string(),
            plane_source: PlaneSourceMode::Auto,
            channel_names: vec!["OrigBlue".to_string(), "OrigGreen".to_string()],
            results_name: "Nuclei".to_string(),
            headless: true,
            concurrency: 1,
            unit_timeout: None,
            enable_metrics: false,
            metrics_interval_secs: 10,
            metrics_output_path: None,
        }
    }
}

impl BatchOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            limit: config.batch.limit,
            failure_policy: config.batch.failure_policy,
            aggregation_mode: config.batch.aggregation_mode,
            resolution_level: config.batch.resolution_level.clone(),
            plane_source: config.batch.plane_source,
            channel_names: config.pipeline.channel_names.clone(),
            results_name: config.pipeline.results_name.clone(),
            headless: config.pipeline.engine.headless,
            concurrency: config.processing.concurrency,
            unit_timeout: config.processing.unit_timeout_secs.map(Duration::from_secs),
            enable_metrics: config.processing.enable_metrics,
            metrics_interval_secs: config.processing.metrics_interval_secs,
            metrics_output_path: config.processing.metrics_output_path.clone(),
        }
    }

    /// Logical name for channel `c`.
    ///
    /// Channels past the configured names are named by index only; the
    /// pipeline does not consume them.
    pub fn channel_name(&self, c: usize) -> String {
        match self.channel_names.get(c) {
            Some(name) => name.clone(),
            None => format!("Channel{c}"),
        }
    }
}

/// A unit that failed under the best-effort policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFailure {
    pub unit_id: String,
    pub unit_name: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl UnitFailure {
    fn new(unit: &WorkUnit, err: &Error) -> Self {
        Self {
            unit_id: unit.id.clone(),
            unit_name: unit.name.clone(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of a completed batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub collection: CollectionRef,

    pub aggregation_mode: AggregationMode,

    /// Units enumerated after applying the limit
    pub attempted: usize,

    /// Identifiers of units that produced results, in collection order
    pub succeeded: Vec<String>,

    pub failures: Vec<UnitFailure>,

    /// Annotations created by publishing
    pub published: Vec<AnnotationRef>,

    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({}): succeeded {}, failed {}, attempted {}, published {} annotation(s) in {:.1}s",
            self.collection.kind,
            self.collection.id,
            self.collection.name,
            self.succeeded.len(),
            self.failures.len(),
            self.attempted,
            self.published.len(),
            self.elapsed.as_secs_f64()
        )?;
        for failure in &self.failures {
            write!(f, "\n  {} {}: {}", failure.kind, failure.unit_id, failure.message)?;
        }
        for annotation in &self.published {
            write!(f, "\n  published {} {}", annotation.id, annotation.location)?;
        }
        Ok(())
    }
}

/// Drives one collection through the analysis pipeline.
pub struct BatchDriver {
    provider: Arc<dyn CollectionProvider>,
    fetcher: Option<Arc<ArrayFetcher>>,
    template: Arc<PipelineTemplate>,
    engine: Arc<dyn AnalysisEngine>,
    publisher: Publisher,
    metrics: Arc<Metrics>,
    options: BatchOptions,
}

impl BatchDriver {
    /// Create a driver. `template` must already be normalized.
    pub fn new(
        provider: Arc<dyn CollectionProvider>,
        template: PipelineTemplate,
        engine: Arc<dyn AnalysisEngine>,
        publisher: Publisher,
        options: BatchOptions,
    ) -> Self {
        Self {
            provider,
            fetcher: None,
            template: Arc::new(template),
            engine,
            publisher,
            metrics: Metrics::new(),
            options,
        }
    }

    /// Read planes from chunked arrays through `fetcher`.
    pub fn with_fetcher(mut self, fetcher: Arc<ArrayFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Children of `collection` in native order, truncated to the limit.
    ///
    /// A unit listed twice is analyzed once. Repeats do not count against
    /// the limit: when they shorten a full page the full listing is read.
    pub async fn enumerate(&self, collection: &CollectionRef) -> Result<Vec<WorkUnit>> {
        let listed = self.provider.children(collection, self.options.limit).await?;
        let page_len = listed.len();
        let mut units = dedupe_units(listed, collection);

        if let Some(limit) = self.options.limit {
            if units.len() < limit && page_len >= limit {
                tracing::debug!("Repeated images in the first {} children of {}, listing all", limit, collection.id);
                units = dedupe_units(self.provider.children(collection, None).await?, collection);
            }
            units.truncate(limit);
        }
        Ok(units)
    }

    /// Run the batch over the collection `collection_id`.
    ///
    /// Per-unit failures are recorded under best-effort and end the batch
    /// under fail-fast. Batch-level failures (template, schema inference,
    /// publishing) always end it. Nothing is published unless every started
    /// unit has finished and the policy allowed the batch to complete.
    pub async fn run(&self, collection_id: &str) -> Result<BatchReport> {
        let start = Instant::now();
        let collection = self.provider.collection(collection_id).await?;
        let units = self.enumerate(&collection).await?;
        let attempted = units.len();

        tracing::info!(
            "Analyzing {} units of {} {} ({} concurrent, {:?}, {:?})",
            attempted,
            collection.kind,
            collection.id,
            self.options.concurrency,
            self.options.failure_policy,
            self.options.aggregation_mode
        );

        // Start metrics reporter if enabled
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.options.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.options.metrics_interval_secs,
                attempted as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let outcome = self.analyze_and_publish(&collection, units).await;

        // Shutdown metrics reporter on every exit path
        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        if self.options.enable_metrics {
            MetricsReporter::new(self.metrics.clone(), self.options.metrics_interval_secs, attempted as u64)
                .print_summary();
            if let Some(ref path) = self.options.metrics_output_path {
                if let Err(e) = self.metrics.snapshot().save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        let (succeeded, failures, published) = outcome?;
        let report = BatchReport {
            collection,
            aggregation_mode: self.options.aggregation_mode,
            attempted,
            succeeded,
            failures,
            published,
            elapsed: start.elapsed(),
        };
        tracing::info!("{}", report);
        Ok(report)
    }

    async fn analyze_and_publish(
        &self,
        collection: &CollectionRef,
        units: Vec<WorkUnit>,
    ) -> Result<(Vec<String>, Vec<UnitFailure>, Vec<AnnotationRef>)> {
        let (mut results, failures) = self.analyze_all(collection, units).await?;
        results.sort_by_key(|r| r.unit.position);

        let published = self
            .publisher
            .publish(collection, &results, self.options.aggregation_mode)
            .await?;
        let succeeded = results.iter().map(|r| r.unit.id.clone()).collect();
        Ok((succeeded, failures, published))
    }

    /// Analyze every unit, honoring the failure policy.
    ///
    /// Once a unit has ended the batch no further units start, but units
    /// already running are allowed to finish.
    async fn analyze_all(
        &self,
        collection: &CollectionRef,
        units: Vec<WorkUnit>,
    ) -> Result<(Vec<UnitResult>, Vec<UnitFailure>)> {
        let aborted = AtomicBool::new(false);
        let aborted = &aborted;

        let mut outcomes = stream::iter(units)
            .map(|unit| async move {
                if aborted.load(Ordering::Acquire) {
                    return (unit, None);
                }
                let outcome = self.analyze_unit_with_deadline(collection, unit.clone()).await;
                if let Err(ref e) = outcome {
                    if e.is_batch_fatal() || self.options.failure_policy == FailurePolicy::FailFast {
                        aborted.store(true, Ordering::Release);
                    }
                }
                (unit, Some(outcome))
            })
            .buffer_unordered(self.options.concurrency.max(1));

        let mut results = Vec::new();
        let mut failures = Vec::new();
        let mut fatal: Option<Error> = None;
        let mut not_started = 0usize;

        while let Some((unit, outcome)) = outcomes.next().await {
            match outcome {
                None => not_started += 1,
                Some(Ok(result)) => {
                    self.metrics.add_unit_succeeded();
                    tracing::info!("Analyzed image {} ({}): {} rows", unit.id, unit.name, result.frame.n_rows());
                    results.push(result);
                }
                Some(Err(e)) => {
                    self.metrics.add_unit_failed();
                    if e.is_batch_fatal() || self.options.failure_policy == FailurePolicy::FailFast {
                        tracing::error!("Image {} failed, aborting batch: {}", unit.id, e);
                        fatal.get_or_insert(e);
                    } else {
                        tracing::warn!("Image {} failed ({}): {}", unit.id, e.kind(), e);
                        failures.push(UnitFailure::new(&unit, &e));
                    }
                }
            }
        }

        if let Some(e) = fatal {
            if not_started > 0 {
                tracing::warn!("{} units were not started", not_started);
            }
            return Err(e);
        }

        failures.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        Ok((results, failures))
    }

    async fn analyze_unit_with_deadline(&self, collection: &CollectionRef, unit: WorkUnit) -> Result<UnitResult> {
        match self.options.unit_timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.analyze_unit(collection, unit))
                .await
                .map_err(|_| Error::Timeout(deadline.as_secs()))?,
            None => self.analyze_unit(collection, unit).await,
        }
    }

    /// FETCH, INJECT, EXECUTE and COLLECT for one unit.
    pub async fn analyze_unit(&self, collection: &CollectionRef, unit: WorkUnit) -> Result<UnitResult> {
        let fetch_start = Instant::now();
        let planes = self.fetch_planes(collection, &unit).await?;
        self.metrics.add_fetch_time(fetch_start.elapsed());

        let mut clone = self.template.as_ref().clone();
        for (c, plane) in planes.into_iter().enumerate() {
            clone = clone.inject(c, plane, self.options.channel_name(c));
        }

        // Unique output directory per unit; removed when the result is dropped
        let workspace = tempfile::Builder::new()
            .prefix(&format!("hcs-{}-", unit.id))
            .tempdir()
            .map_err(|e| Error::AnalysisExecution {
                stage: "workspace".to_string(),
                message: e.to_string(),
            })?;
        let settings = EngineSettings {
            output_dir: workspace.path().to_path_buf(),
            headless: self.options.headless,
            results_name: self.options.results_name.clone(),
        };

        let analysis_start = Instant::now();
        let engine = self.engine.clone();
        let table_path = tokio::task::spawn_blocking(move || clone.run(engine.as_ref(), &settings))
            .await
            .map_err(|e| Error::AnalysisExecution {
                stage: "runtime".to_string(),
                message: format!("analysis task failed: {e}"),
            })??;
        self.metrics.add_analysis_time(analysis_start.elapsed());

        let mut frame = ResultFrame::from_csv_path(&table_path)?;
        frame.tag_with_unit(&unit)?;
        Ok(UnitResult::new(unit, table_path, frame, Some(workspace)))
    }

    /// Every channel plane of `unit` at `t = 0, z = 0`, channel order.
    async fn fetch_planes(&self, collection: &CollectionRef, unit: &WorkUnit) -> Result<Vec<Array2<f64>>> {
        match (self.options.plane_source, &self.fetcher) {
            (PlaneSourceMode::Direct, _) | (PlaneSourceMode::Auto, None) => self.fetch_direct(unit).await,
            (PlaneSourceMode::Chunked, None) => Err(Error::Config(
                "plane_source is chunked but no array fetcher is configured".to_string(),
            )),
            (PlaneSourceMode::Chunked, Some(fetcher)) => self.fetch_chunked(fetcher, collection, unit).await,
            (PlaneSourceMode::Auto, Some(fetcher)) => match self.fetch_chunked(fetcher, collection, unit).await {
                Ok(planes) => Ok(planes),
                Err(e @ (Error::Transport { .. } | Error::Schema { .. })) if self.provider.pixels(unit).is_some() => {
                    tracing::warn!("Chunked read of image {} failed ({}), using direct pixel access", unit.id, e);
                    self.fetch_direct(unit).await
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn fetch_chunked(
        &self,
        fetcher: &ArrayFetcher,
        collection: &CollectionRef,
        unit: &WorkUnit,
    ) -> Result<Vec<Array2<f64>>> {
        let array = fetcher
            .open(&collection.id, unit.array_index, &self.options.resolution_level)
            .await?;
        let mut planes = Vec::with_capacity(unit.size_c);
        for c in 0..unit.size_c {
            planes.push(array.read_plane(0, c as u64, 0).await?);
            self.metrics.add_plane_fetched();
        }
        Ok(planes)
    }

    async fn fetch_direct(&self, unit: &WorkUnit) -> Result<Vec<Array2<f64>>> {
        let pixels = self
            .provider
            .pixels(unit)
            .ok_or_else(|| Error::Provider(format!("no pixel access for image {}", unit.id)))?;
        let mut planes = Vec::with_capacity(unit.size_c);
        for c in 0..unit.size_c {
            planes.push(pixels.get_plane(0, c, 0).await?);
            self.metrics.add_plane_fetched();
        }
        Ok(planes)
    }
}

/// Drop repeated unit ids, keeping the first occurrence.
fn dedupe_units(mut units: Vec<WorkUnit>, collection: &CollectionRef) -> Vec<WorkUnit> {
    let mut seen = HashSet::new();
    units.retain(|unit| {
        let first = seen.insert(unit.id.clone());
        if !first {
            tracing::warn!("Image {} listed twice in {} {}, skipping repeat", unit.id, collection.kind, collection.id);
        }
        first
    });
    units
}
