//! Unit results, aggregation into one table, and publishing.

pub mod aggregate;
mod frame;
mod publish;

pub use aggregate::{collect, infer_schema, AggregatedTable, ColumnKind, ColumnSchema, RefTarget};
pub use frame::{Column, ResultFrame, Value, CELL_COUNT_COLUMN, IMAGE_COLUMN, WELL_COLUMN};
pub use publish::{
    AnnotationKind, AnnotationRef, AnnotationSink, ColumnData, LinkTarget, ObjectStoreSink, Publisher,
    TypedColumn, TypedTable, CSV_MIME_TYPE, PARQUET_MIME_TYPE,
};

use crate::collection::WorkUnit;
use std::path::PathBuf;

/// The captured output of one successfully analyzed unit.
#[derive(Debug)]
pub struct UnitResult {
    pub unit: WorkUnit,
    /// Results table the pipeline wrote
    pub table_path: PathBuf,
    /// Parsed table tagged with the unit's references
    pub frame: ResultFrame,
    /// Keeps the unit's output directory alive until publishing is done
    _workspace: Option<tempfile::TempDir>,
}

impl UnitResult {
    pub fn new(unit: WorkUnit, table_path: PathBuf, frame: ResultFrame, workspace: Option<tempfile::TempDir>) -> Self {
        Self {
            unit,
            table_path,
            frame,
            _workspace: workspace,
        }
    }
}
