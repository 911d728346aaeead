//! Lazy reads from chunked Zarr arrays.
//!
//! Metadata parsing and chunk decoding (Zarr v2 and v3, blosc, zstd, gzip
//! and zlib compressors, either byte order, `C` or `F` layout) are done by
//! `zarrs`. Only the chunks overlapping a requested region are retrieved,
//! and each decoded chunk goes through the shared [`ChunkCache`] so it is
//! read from the store at most once while resident.

use super::chunk_cache::{ChunkCache, ChunkKey, DecodedChunk};
use crate::batch::Metrics;
use crate::error::{Error, Result};
use futures::future::try_join_all;
use ndarray::{Array2, ArrayD, ArrayViewD, IxDyn, Slice};
use object_store::ObjectStore;
use rayon::prelude::*;
use std::ops::Range;
use std::sync::Arc;
use zarrs::array::{Array, ArrayCreateError, ArrayError, DataType};
use zarrs_object_store::AsyncObjectStore;

type ZarrArray = Array<AsyncObjectStore<Arc<dyn ObjectStore>>>;

/// Retrieve one chunk as `$t` and widen it to `f64`. Absent chunks are `None`.
macro_rules! retrieve_as_f64 {
    ($array:expr, $indices:expr, $metrics:expr, $t:ty) => {{
        let elements: Option<Vec<$t>> = $array.async_retrieve_chunk_elements_if_exists::<$t>($indices).await?;
        elements.map(|elements| {
            if let Some(m) = $metrics {
                m.add_chunk_read((elements.len() * std::mem::size_of::<$t>()) as u64);
            }
            elements.into_par_iter().map(|v| v as f64).collect::<Vec<f64>>()
        })
    }};
}

/// Fill value bytes widened to `f64`.
macro_rules! fill_as_f64 {
    ($bytes:expr, $t:ty) => {{
        let raw: [u8; std::mem::size_of::<$t>()] = $bytes.try_into().ok()?;
        Some(<$t>::from_ne_bytes(raw) as f64)
    }};
}

/// Handle on one chunked array. Cheap to hold; reads are lazy.
pub struct ChunkedArray {
    array: ZarrArray,
    root: String,
    chunks: Vec<u64>,
    fill_value: f64,
    cache: Arc<ChunkCache>,
    metrics: Option<Arc<Metrics>>,
}

impl ChunkedArray {
    /// Open the array at `root`. Both `.zarray` and `zarr.json` are recognised.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        root: &str,
        cache: Arc<ChunkCache>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        let root = root.trim_matches('/').to_string();
        let zarr_store = Arc::new(AsyncObjectStore::new(store));

        let array = ZarrArray::async_open(zarr_store, &format!("/{root}"))
            .await
            .map_err(|e| match e {
                ArrayCreateError::StorageError(e) => Error::transport(&root, e),
                e => Error::schema(&root, e.to_string()),
            })?;

        let fill_value = fill_value_f64(&array)
            .ok_or_else(|| Error::schema(&root, format!("unsupported data type {:?}", array.data_type())))?;

        let ndim = array.shape().len();
        let chunks: Vec<u64> = array
            .chunk_shape(&vec![0; ndim])
            .map_err(|e| Error::schema(&root, e.to_string()))?
            .iter()
            .map(|c| c.get())
            .collect();

        tracing::debug!(
            "Opened {}: shape={:?} chunks={:?} dtype={:?}",
            root,
            array.shape(),
            chunks,
            array.data_type()
        );

        Ok(Self {
            array,
            root,
            chunks,
            fill_value,
            cache,
            metrics,
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn shape(&self) -> &[u64] {
        self.array.shape()
    }

    /// Shape of one (full, padded) chunk.
    pub fn chunk_shape(&self) -> &[u64] {
        &self.chunks
    }

    /// Number of channels of a `(t, c, z, y, x)` array.
    pub fn size_c(&self) -> Result<usize> {
        self.require_5d()?;
        Ok(self.shape()[1] as usize)
    }

    /// Read the 2-D `(y, x)` plane at `(t, c, z)`.
    pub async fn read_plane(&self, t: u64, c: u64, z: u64) -> Result<Array2<f64>> {
        self.require_5d()?;
        let (height, width) = (self.shape()[3], self.shape()[4]);
        let region = [t..t + 1, c..c + 1, z..z + 1, 0..height, 0..width];
        let data = self.read_region(&region).await?;
        data.into_shape_with_order((height as usize, width as usize))
            .map_err(|e| Error::schema(&self.root, format!("plane reshape failed: {e}")))
    }

    /// Read an arbitrary hyper-rectangle, one range per axis.
    pub async fn read_region(&self, region: &[Range<u64>]) -> Result<ArrayD<f64>> {
        let shape = self.shape();
        if region.len() != shape.len() {
            return Err(Error::schema(
                &self.root,
                format!("region has {} axes, array has {}", region.len(), shape.len()),
            ));
        }
        for (axis, (range, &len)) in region.iter().zip(shape).enumerate() {
            if range.start >= range.end || range.end > len {
                return Err(Error::schema(
                    &self.root,
                    format!("region {:?} out of bounds on axis {} (len {})", range, axis, len),
                ));
            }
        }

        let out_shape: Vec<usize> = region.iter().map(|r| (r.end - r.start) as usize).collect();
        let mut out = ArrayD::from_elem(IxDyn(&out_shape), self.fill_value);

        let grid = chunk_grid(region, &self.chunks);
        tracing::debug!("Reading {} chunks from {} for region {:?}", grid.len(), self.root, region);

        let fetched = try_join_all(grid.iter().map(|coords| self.chunk(coords))).await?;

        let chunk_shape: Vec<usize> = self.chunks.iter().map(|&c| c as usize).collect();
        for (coords, chunk) in grid.iter().zip(fetched) {
            let Some(values) = chunk.values.as_deref() else {
                continue; // absent chunk reads as fill_value
            };
            let view = ArrayViewD::from_shape(IxDyn(&chunk_shape), values).map_err(|e| {
                Error::schema(&self.root, format!("chunk {:?} does not match chunk shape: {e}", coords))
            })?;

            // Overlap of this chunk with the region, per axis, in global coordinates
            let overlap: Vec<(u64, u64, u64)> = coords
                .iter()
                .zip(&self.chunks)
                .zip(region)
                .map(|((&ci, &cs), r)| {
                    let chunk_start = ci * cs;
                    (chunk_start, r.start.max(chunk_start), r.end.min(chunk_start + cs))
                })
                .collect();

            let src = view.slice_each_axis(|ax| {
                let (chunk_start, lo, hi) = overlap[ax.axis.index()];
                Slice::from((lo - chunk_start) as usize..(hi - chunk_start) as usize)
            });
            let mut dst = out.slice_each_axis_mut(|ax| {
                let (_, lo, hi) = overlap[ax.axis.index()];
                let start = region[ax.axis.index()].start;
                Slice::from((lo - start) as usize..(hi - start) as usize)
            });
            dst.assign(&src);
        }

        Ok(out)
    }

    fn require_5d(&self) -> Result<()> {
        let ndim = self.shape().len();
        if ndim != 5 {
            return Err(Error::schema(
                &self.root,
                format!("expected a 5-D (t, c, z, y, x) array, got {ndim} dims"),
            ));
        }
        Ok(())
    }

    /// Fetch one decoded chunk through the cache.
    async fn chunk(&self, coords: &[u64]) -> Result<Arc<DecodedChunk>> {
        let key = ChunkKey::new(self.root.clone(), coords);

        self.cache
            .get_or_fetch(key, || async move {
                let values = self
                    .retrieve(coords)
                    .await
                    .map_err(|e| match e {
                        ArrayError::StorageError(e) => Error::transport(&self.root, e),
                        e => Error::schema(&self.root, format!("chunk {coords:?}: {e}")),
                    })?;
                if values.is_none() {
                    tracing::debug!("Chunk {:?} of {} absent, using fill value", coords, self.root);
                }
                Ok(DecodedChunk { values })
            })
            .await
    }

    async fn retrieve(&self, coords: &[u64]) -> std::result::Result<Option<Vec<f64>>, ArrayError> {
        let metrics = self.metrics.as_ref();
        let values = match self.array.data_type() {
            DataType::UInt8 => retrieve_as_f64!(self.array, coords, metrics, u8),
            DataType::UInt16 => retrieve_as_f64!(self.array, coords, metrics, u16),
            DataType::UInt32 => retrieve_as_f64!(self.array, coords, metrics, u32),
            DataType::UInt64 => retrieve_as_f64!(self.array, coords, metrics, u64),
            DataType::Int8 => retrieve_as_f64!(self.array, coords, metrics, i8),
            DataType::Int16 => retrieve_as_f64!(self.array, coords, metrics, i16),
            DataType::Int32 => retrieve_as_f64!(self.array, coords, metrics, i32),
            DataType::Int64 => retrieve_as_f64!(self.array, coords, metrics, i64),
            DataType::Float32 => retrieve_as_f64!(self.array, coords, metrics, f32),
            DataType::Float64 => retrieve_as_f64!(self.array, coords, metrics, f64),
            // Rejected when the array was opened
            _ => None,
        };
        Ok(values)
    }
}

/// The array fill value as `f64`, or `None` for non-numeric data types.
fn fill_value_f64(array: &ZarrArray) -> Option<f64> {
    let bytes = array.fill_value().as_ne_bytes();
    match array.data_type() {
        DataType::UInt8 => fill_as_f64!(bytes, u8),
        DataType::UInt16 => fill_as_f64!(bytes, u16),
        DataType::UInt32 => fill_as_f64!(bytes, u32),
        DataType::UInt64 => fill_as_f64!(bytes, u64),
        DataType::Int8 => fill_as_f64!(bytes, i8),
        DataType::Int16 => fill_as_f64!(bytes, i16),
        DataType::Int32 => fill_as_f64!(bytes, i32),
        DataType::Int64 => fill_as_f64!(bytes, i64),
        DataType::Float32 => fill_as_f64!(bytes, f32),
        DataType::Float64 => fill_as_f64!(bytes, f64),
        _ => None,
    }
}

/// Chunk coordinates overlapping `region`, in row-major order.
fn chunk_grid(region: &[Range<u64>], chunks: &[u64]) -> Vec<Vec<u64>> {
    let bounds: Vec<(u64, u64)> = region
        .iter()
        .zip(chunks)
        .map(|(r, &c)| (r.start / c, (r.end - 1) / c))
        .collect();

    let mut grid = vec![Vec::with_capacity(bounds.len())];
    for &(lo, hi) in &bounds {
        grid = grid
            .into_iter()
            .flat_map(|prefix| {
                (lo..=hi).map(move |i| {
                    let mut next = prefix.clone();
                    next.push(i);
                    next
                })
            })
            .collect();
    }
    grid
}
