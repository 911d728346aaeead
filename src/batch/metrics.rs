//! Batch progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

const MIB: f64 = 1024.0 * 1024.0;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters shared by the fetcher, chunk cache, driver and publisher.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Work units whose analysis produced a result table
    pub units_succeeded: AtomicU64,

    /// Work units recorded as failures
    pub units_failed: AtomicU64,

    /// Channel planes handed to pipeline clones
    pub planes_fetched: AtomicU64,

    /// Chunk objects read from the remote store
    pub chunk_reads: AtomicU64,

    /// Compressed bytes read from the remote store
    pub bytes_read: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-phase timing (in microseconds for precision)
    /// Time spent fetching planes (microseconds)
    pub fetch_us: AtomicU64,

    /// Time spent running pipeline clones (microseconds)
    pub analysis_us: AtomicU64,

    /// Time spent aggregating and publishing (microseconds)
    pub publish_us: AtomicU64,

    // Cache metrics
    /// Chunk cache hits
    pub chunk_cache_hits: AtomicU64,

    /// Chunk cache misses
    pub chunk_cache_misses: AtomicU64,

    /// Requests that waited on an in-flight fetch of the same chunk
    pub chunk_cache_coalesced: AtomicU64,

    /// Current chunk cache size in bytes
    pub chunk_cache_bytes: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_unit_succeeded(&self) {
        self.units_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_unit_failed(&self) {
        self.units_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_plane_fetched(&self) {
        self.planes_fetched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one remote chunk read of `bytes` compressed bytes.
    pub fn add_chunk_read(&self, bytes: u64) {
        self.chunk_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_fetch_time(&self, duration: Duration) {
        self.fetch_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_analysis_time(&self, duration: Duration) {
        self.analysis_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_publish_time(&self, duration: Duration) {
        self.publish_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_cache_hit(&self) {
        self.chunk_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cache_miss(&self) {
        self.chunk_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a coalesced cache request (waited on in-flight fetch).
    pub fn add_cache_coalesced(&self) {
        self.chunk_cache_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_cache_bytes(&self, bytes: u64) {
        self.chunk_cache_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Remote read throughput in MiB/s.
    pub fn read_throughput_mibps(&self) -> f64 {
        let bytes = self.bytes_read.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            bytes as f64 / MIB / elapsed
        } else {
            0.0
        }
    }

    /// Completed units (succeeded or failed) per minute.
    pub fn units_per_minute(&self) -> f64 {
        let units = self.units_succeeded.load(Ordering::Relaxed) + self.units_failed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            units as f64 * 60.0 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            units_succeeded: self.units_succeeded.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            planes_fetched: self.planes_fetched.load(Ordering::Relaxed),
            chunk_reads: self.chunk_reads.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            read_throughput_mibps: self.read_throughput_mibps(),
            units_per_minute: self.units_per_minute(),
            fetch_secs: self.fetch_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            analysis_secs: self.analysis_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            publish_secs: self.publish_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            chunk_cache_hits: self.chunk_cache_hits.load(Ordering::Relaxed),
            chunk_cache_misses: self.chunk_cache_misses.load(Ordering::Relaxed),
            chunk_cache_coalesced: self.chunk_cache_coalesced.load(Ordering::Relaxed),
            chunk_cache_bytes: self.chunk_cache_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub units_succeeded: u64,
    pub units_failed: u64,
    pub planes_fetched: u64,
    pub chunk_reads: u64,
    pub bytes_read: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub read_throughput_mibps: f64,
    pub units_per_minute: f64,
    /// Time spent fetching planes (seconds, summed across units)
    pub fetch_secs: f64,
    /// Time spent in pipeline clones (seconds, summed across units)
    pub analysis_secs: f64,
    pub publish_secs: f64,
    pub chunk_cache_hits: u64,
    pub chunk_cache_misses: u64,
    pub chunk_cache_coalesced: u64,
    pub chunk_cache_bytes: u64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    /// Effective cache hit rate in percent, counting coalesced requests as hits.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.chunk_cache_hits + self.chunk_cache_misses + self.chunk_cache_coalesced;
        if total > 0 {
            (self.chunk_cache_hits + self.chunk_cache_coalesced) as f64 / total as f64 * 100.0
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total_phase = self.fetch_secs + self.analysis_secs + self.publish_secs;
        let (fetch_pct, analysis_pct, publish_pct) = if total_phase > 0.0 {
            (
                self.fetch_secs / total_phase * 100.0,
                self.analysis_secs / total_phase * 100.0,
                self.publish_secs / total_phase * 100.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        write!(
            f,
            "Units: {} ok, {} failed | Planes: {} | \
             Read: {} chunks, {:.1} MiB @ {:.1} MiB/s | \
             Rate: {:.1} units/min | Elapsed: {:.1}s | \
             Time: fetch {:.0}% analysis {:.0}% publish {:.0}% | \
             Cache: {:.0}%",
            self.units_succeeded,
            self.units_failed,
            self.planes_fetched,
            self.chunk_reads,
            self.bytes_read as f64 / MIB,
            self.read_throughput_mibps,
            self.units_per_minute,
            self.elapsed.as_secs_f64(),
            fetch_pct,
            analysis_pct,
            publish_pct,
            self.cache_hit_rate(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_units: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_units: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_units,
        }
    }

    /// Log progress every interval until `shutdown` fires.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let done = snapshot.units_succeeded + snapshot.units_failed;
                    let progress = if self.total_units > 0 {
                        done as f64 / self.total_units as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Batch Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Units succeeded: {}", snapshot.units_succeeded);
        println!("Units failed: {}", snapshot.units_failed);
        println!("Planes fetched: {}", snapshot.planes_fetched);
        println!("Chunk reads: {}", snapshot.chunk_reads);
        println!("Data read: {:.1} MiB", snapshot.bytes_read as f64 / MIB);
        println!("Read throughput: {:.1} MiB/s", snapshot.read_throughput_mibps);

        let total_phase = snapshot.fetch_secs + snapshot.analysis_secs + snapshot.publish_secs;
        if total_phase > 0.0 {
            println!("\n--- Phase Time Breakdown ---");
            println!("Fetch:     {:>7.1}s ({:>5.1}%)", snapshot.fetch_secs, snapshot.fetch_secs / total_phase * 100.0);
            println!("Analysis:  {:>7.1}s ({:>5.1}%)", snapshot.analysis_secs, snapshot.analysis_secs / total_phase * 100.0);
            println!("Publish:   {:>7.1}s ({:>5.1}%)", snapshot.publish_secs, snapshot.publish_secs / total_phase * 100.0);
        }

        let cache_total = snapshot.chunk_cache_hits + snapshot.chunk_cache_misses + snapshot.chunk_cache_coalesced;
        if cache_total > 0 {
            println!("\n--- Chunk Cache ---");
            println!(
                "{} hits, {} misses, {} coalesced ({:.1}% effective hit rate)",
                snapshot.chunk_cache_hits,
                snapshot.chunk_cache_misses,
                snapshot.chunk_cache_coalesced,
                snapshot.cache_hit_rate()
            );
            println!("Resident: {:.1} MiB", snapshot.chunk_cache_bytes as f64 / MIB);
        }
        println!("=====================\n");
    }
}
