//! Collection provider backed by a YAML or JSON manifest file.
//!
//! ```yaml
//! kind: plate
//! id: "422"
//! name: plate1_1_013
//! wells:
//!   - id: "9510"
//!     row: 0
//!     column: 0
//!     images:
//!       - id: "171499"
//!         name: "plate1_1_013 [Well 1, Field 1]"
//!         size_c: 2
//! ```
//!
//! Datasets list `images` directly instead of `wells`. An image may carry
//! `array_index` (defaults to its position) and `pixels`, a directory of raw
//! planes named `t{t}_c{c}_z{z}.f64` for direct access.

use super::{CollectionKind, CollectionProvider, CollectionRef, PlaneAccessor, WellRef, WorkUnit};
use crate::error::{Error, Result};
use async_trait::async_trait;
use ndarray::Array2;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct Manifest {
    kind: CollectionKind,
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    wells: Vec<WellEntry>,
    #[serde(default)]
    images: Vec<ImageEntry>,
}

#[derive(Debug, Deserialize)]
struct WellEntry {
    id: String,
    row: u32,
    column: u32,
    #[serde(default)]
    images: Vec<ImageEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct ImageEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    size_c: usize,
    #[serde(default)]
    array_index: Option<usize>,
    #[serde(default)]
    pixels: Option<PixelSource>,
}

#[derive(Debug, Clone, Deserialize)]
struct PixelSource {
    dir: PathBuf,
    height: usize,
    width: usize,
}

/// Serves one collection described by a manifest.
pub struct ManifestProvider {
    collection: CollectionRef,
    units: Vec<WorkUnit>,
    pixels: HashMap<String, Arc<RawPlaneAccessor>>,
}

impl ManifestProvider {
    /// Load a manifest; relative pixel directories resolve against its location.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Provider(format!("failed to read manifest {}: {e}", path.display())))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text, base),
            _ => Self::from_yaml(&text, base),
        }
    }

    pub fn from_yaml(text: &str, base: &Path) -> Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(text)
            .map_err(|e| Error::Provider(format!("invalid manifest: {e}")))?;
        Self::build(manifest, base)
    }

    pub fn from_json(text: &str, base: &Path) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(text)
            .map_err(|e| Error::Provider(format!("invalid manifest: {e}")))?;
        Self::build(manifest, base)
    }

    fn build(manifest: Manifest, base: &Path) -> Result<Self> {
        let collection = CollectionRef {
            kind: manifest.kind,
            name: manifest.name.unwrap_or_else(|| manifest.id.clone()),
            id: manifest.id,
        };

        // Plates analyze the first image of every well
        let entries: Vec<(ImageEntry, Option<WellRef>)> = match collection.kind {
            CollectionKind::Plate => manifest
                .wells
                .into_iter()
                .filter_map(|well| {
                    let well_ref = WellRef {
                        id: well.id,
                        row: well.row,
                        column: well.column,
                    };
                    match well.images.into_iter().next() {
                        Some(image) => Some((image, Some(well_ref))),
                        None => {
                            tracing::warn!("Well {} has no images, skipping", well_ref.id);
                            None
                        }
                    }
                })
                .collect(),
            CollectionKind::Dataset => manifest.images.into_iter().map(|i| (i, None)).collect(),
        };

        let mut units = Vec::with_capacity(entries.len());
        let mut pixels = HashMap::new();
        for (position, (image, well)) in entries.into_iter().enumerate() {
            if let Some(source) = image.pixels {
                let dir = if source.dir.is_absolute() {
                    source.dir
                } else {
                    base.join(source.dir)
                };
                pixels.insert(
                    image.id.clone(),
                    Arc::new(RawPlaneAccessor::new(dir, source.height, source.width)),
                );
            }
            units.push(WorkUnit {
                name: image.name.unwrap_or_else(|| image.id.clone()),
                id: image.id,
                position,
                array_index: image.array_index.unwrap_or(position),
                size_c: image.size_c,
                well,
            });
        }

        tracing::info!(
            "Manifest {} {} ({}): {} work units",
            collection.kind, collection.id, collection.name, units.len()
        );

        Ok(Self {
            collection,
            units,
            pixels,
        })
    }

    /// The single collection this manifest describes.
    pub fn collection_ref(&self) -> &CollectionRef {
        &self.collection
    }
}

#[async_trait]
impl CollectionProvider for ManifestProvider {
    async fn collection(&self, id: &str) -> Result<CollectionRef> {
        if id != self.collection.id {
            return Err(Error::Provider(format!(
                "unknown collection '{id}' (manifest describes '{}')",
                self.collection.id
            )));
        }
        Ok(self.collection.clone())
    }

    async fn children(&self, collection: &CollectionRef, limit: Option<usize>) -> Result<Vec<WorkUnit>> {
        if collection.id != self.collection.id {
            return Err(Error::Provider(format!("unknown collection '{}'", collection.id)));
        }
        let take = limit.unwrap_or(usize::MAX);
        Ok(self.units.iter().take(take).cloned().collect())
    }

    fn pixels(&self, unit: &WorkUnit) -> Option<Arc<dyn PlaneAccessor>> {
        self.pixels
            .get(&unit.id)
            .map(|p| p.clone() as Arc<dyn PlaneAccessor>)
    }
}

/// Reads raw little-endian `f64` planes from `t{t}_c{c}_z{z}.f64` files.
#[derive(Debug, Clone)]
pub struct RawPlaneAccessor {
    dir: PathBuf,
    height: usize,
    width: usize,
}

impl RawPlaneAccessor {
    pub fn new(dir: PathBuf, height: usize, width: usize) -> Self {
        Self { dir, height, width }
    }

    pub fn plane_path(&self, t: usize, c: usize, z: usize) -> PathBuf {
        self.dir.join(format!("t{t}_c{c}_z{z}.f64"))
    }
}

#[async_trait]
impl PlaneAccessor for RawPlaneAccessor {
    async fn get_plane(&self, t: usize, c: usize, z: usize) -> Result<Array2<f64>> {
        let path = self.plane_path(t, c, z);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::Provider(format!("failed to read plane {}: {e}", path.display())))?;

        let expected = self.height * self.width * 8;
        if bytes.len() != expected {
            return Err(Error::Provider(format!(
                "plane {} has {} bytes, expected {}",
                path.display(),
                bytes.len(),
                expected
            )));
        }
        let values: Vec<f64> = bytes
            .chunks_exact(8)
            .map(|b| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                f64::from_le_bytes(raw)
            })
            .collect();
        Array2::from_shape_vec((self.height, self.width), values)
            .map_err(|e| Error::Provider(format!("plane {}: {e}", path.display())))
    }
}
