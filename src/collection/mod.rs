//! Collections (plates, datasets) and the work units they yield.

mod manifest;

pub use manifest::{ManifestProvider, RawPlaneAccessor};

use crate::error::Result;
use async_trait::async_trait;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    /// Children are wells; each well contributes its first image
    Plate,
    /// Children are images
    Dataset,
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionKind::Plate => f.write_str("plate"),
            CollectionKind::Dataset => f.write_str("dataset"),
        }
    }
}

/// Top-level container a batch runs over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionRef {
    pub kind: CollectionKind,
    pub id: String,
    pub name: String,
}

/// Parent well of a plate image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WellRef {
    pub id: String,
    pub row: u32,
    pub column: u32,
}

/// One image to analyze.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkUnit {
    /// Image identifier
    pub id: String,
    pub name: String,
    /// Position in the collection's native order
    pub position: usize,
    /// Index of this image's array under the collection root
    pub array_index: usize,
    pub size_c: usize,
    pub well: Option<WellRef>,
}

/// Direct per-plane pixel access for one image.
#[async_trait]
pub trait PlaneAccessor: Send + Sync {
    /// The `(y, x)` plane at `(t, c, z)`.
    async fn get_plane(&self, t: usize, c: usize, z: usize) -> Result<Array2<f64>>;
}

/// Source of collections and their children.
#[async_trait]
pub trait CollectionProvider: Send + Sync {
    /// Resolve a collection by identifier.
    async fn collection(&self, id: &str) -> Result<CollectionRef>;

    /// Children in stable native order, at most `limit` of them.
    async fn children(&self, collection: &CollectionRef, limit: Option<usize>) -> Result<Vec<WorkUnit>>;

    /// Pixel accessor for a unit, if the provider can serve pixels directly.
    fn pixels(&self, unit: &WorkUnit) -> Option<Arc<dyn PlaneAccessor>>;
}
