//! Publishing results as annotations on the collection or its units.
//!
//! Aggregated tables are published exactly once per batch and linked to the
//! collection. Per-unit files are uploaded and linked one by one. Publishing
//! is not idempotent: every call creates new annotations.

use super::aggregate::{self, AggregatedTable, ColumnKind, ColumnSchema};
use super::frame::Value;
use super::UnitResult;
use crate::batch::Metrics;
use crate::collection::{CollectionRef, WorkUnit};
use crate::config::{AggregationMode, FileLinkTarget, PublishConfig};
use crate::error::{Error, Result};
use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutPayload};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub const CSV_MIME_TYPE: &str = "text/csv";
pub const PARQUET_MIME_TYPE: &str = "application/vnd.apache.parquet";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    File,
    Table,
}

/// Opaque reference to a published annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationRef {
    pub id: String,
    pub kind: AnnotationKind,
    pub namespace: String,
    /// Where the sink stored the payload
    pub location: String,
}

/// Object an annotation is linked to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkTarget {
    /// `plate`, `dataset` or `image`
    pub kind: String,
    pub id: String,
}

impl LinkTarget {
    pub fn collection(collection: &CollectionRef) -> Self {
        Self {
            kind: collection.kind.to_string(),
            id: collection.id.clone(),
        }
    }

    pub fn unit(unit: &WorkUnit) -> Self {
        Self {
            kind: "image".to_string(),
            id: unit.id.clone(),
        }
    }
}

/// Column storage matching a [`ColumnKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Text(Vec<String>),
    Int(Vec<i64>),
    Float(Vec<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedColumn {
    pub schema: ColumnSchema,
    pub data: ColumnData,
}

/// An aggregated table with every column converted to its inferred kind.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedTable {
    pub columns: Vec<TypedColumn>,
    pub n_rows: usize,
}

impl TypedTable {
    /// Convert `table` under `schema`. Reference columns hold identifiers as text.
    pub fn build(table: &AggregatedTable, schema: &[ColumnSchema]) -> Result<Self> {
        let mut columns = Vec::with_capacity(schema.len());
        for column_schema in schema {
            let column = table.frame.column(&column_schema.name).ok_or_else(|| Error::UnsupportedColumn {
                column: column_schema.name.clone(),
                message: "not present in table".to_string(),
            })?;
            let unsupported = |value: &Value| Error::UnsupportedColumn {
                column: column_schema.name.clone(),
                message: format!("value '{value}' does not fit {:?}", column_schema.kind),
            };

            let data = match column_schema.kind {
                ColumnKind::Reference(_) => ColumnData::Text(column.values.iter().map(Value::to_string).collect()),
                ColumnKind::Integer => ColumnData::Int(
                    column
                        .values
                        .iter()
                        .map(|v| match v {
                            Value::Int(i) => Ok(*i),
                            other => Err(unsupported(other)),
                        })
                        .collect::<Result<_>>()?,
                ),
                ColumnKind::Float => ColumnData::Float(
                    column
                        .values
                        .iter()
                        .map(|v| v.as_f64().ok_or_else(|| unsupported(v)))
                        .collect::<Result<_>>()?,
                ),
            };
            columns.push(TypedColumn {
                schema: column_schema.clone(),
                data,
            });
        }
        Ok(Self {
            columns,
            n_rows: table.frame.n_rows(),
        })
    }

    pub fn schema(&self) -> Vec<ColumnSchema> {
        self.columns.iter().map(|c| c.schema.clone()).collect()
    }

    /// Arrow form; reference fields carry `reference = image|well` metadata.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut fields = Vec::with_capacity(self.columns.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.columns.len());

        for column in &self.columns {
            let name = column.schema.name.as_str();
            let field = match column.schema.kind {
                ColumnKind::Reference(target) => Field::new(name, DataType::Utf8, false).with_metadata(
                    HashMap::from([("reference".to_string(), target.as_str().to_string())]),
                ),
                ColumnKind::Integer => Field::new(name, DataType::Int64, false),
                ColumnKind::Float => Field::new(name, DataType::Float64, false),
            };
            let array: ArrayRef = match &column.data {
                ColumnData::Text(values) => Arc::new(StringArray::from(values.clone())),
                ColumnData::Int(values) => Arc::new(Int64Array::from(values.clone())),
                ColumnData::Float(values) => Arc::new(Float64Array::from(values.clone())),
            };
            fields.push(field);
            arrays.push(array);
        }

        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
            .map_err(|e| Error::publish(format!("failed to build record batch: {e}"), None))
    }

    /// Encode as a zstd-compressed Parquet file.
    pub fn to_parquet(&self) -> Result<Vec<u8>> {
        let batch = self.to_record_batch()?;
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::default()))
            .build();

        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))
            .map_err(|e| Error::publish(format!("failed to create parquet writer: {e}"), None))?;
        writer
            .write(&batch)
            .map_err(|e| Error::publish(format!("failed to write parquet: {e}"), None))?;
        writer
            .close()
            .map_err(|e| Error::publish(format!("failed to finish parquet: {e}"), None))?;
        Ok(buffer)
    }
}

/// Destination for result annotations.
#[async_trait]
pub trait AnnotationSink: Send + Sync {
    /// Upload a local file as a file annotation.
    async fn upload_file(&self, path: &Path, mime_type: &str, namespace: &str) -> Result<AnnotationRef>;

    /// Persist a typed table as a table annotation.
    async fn upload_table(&self, name: &str, namespace: &str, table: &TypedTable) -> Result<AnnotationRef>;

    /// Attach an annotation to an object.
    async fn link(&self, target: &LinkTarget, annotation: &AnnotationRef) -> Result<()>;
}

#[derive(Serialize)]
struct AnnotationRecord<'a> {
    #[serde(flatten)]
    annotation: &'a AnnotationRef,
    name: &'a str,
    mime_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    columns: Option<Vec<ColumnSchema>>,
}

#[derive(Serialize, Deserialize)]
struct LinkRecord {
    target: LinkTarget,
    annotation: AnnotationRef,
}

/// Annotation sink over an object store.
///
/// Layout:
/// - `annotations/<uuid>/<file>` payload plus `annotations/<uuid>/annotation.json`
/// - `links/<kind>/<id>/<uuid>.json` one record per link
pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreSink {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    async fn put(&self, location: &str, bytes: Vec<u8>) -> Result<()> {
        self.store
            .put(&StorePath::from(location), PutPayload::from(bytes))
            .await
            .map_err(|e| Error::publish(format!("failed to write {location}: {e}"), None))?;
        Ok(())
    }

    async fn put_annotation(
        &self,
        annotation: &AnnotationRef,
        name: &str,
        mime_type: &str,
        payload: Vec<u8>,
        columns: Option<Vec<ColumnSchema>>,
    ) -> Result<()> {
        self.put(&annotation.location, payload).await?;
        let record = AnnotationRecord {
            annotation,
            name,
            mime_type,
            columns,
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|e| Error::publish(e, None))?;
        self.put(&format!("annotations/{}/annotation.json", annotation.id), json).await
    }

    /// Annotations linked to `target`, in no particular order.
    pub async fn links(&self, target: &LinkTarget) -> Result<Vec<AnnotationRef>> {
        let prefix = StorePath::from(format!("links/{}/{}", target.kind, target.id));
        let objects: Vec<_> = self
            .store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(|e| Error::publish(format!("failed to list links: {e}"), None))?;

        let mut annotations = Vec::with_capacity(objects.len());
        for meta in objects {
            let bytes = self
                .store
                .get(&meta.location)
                .await
                .map_err(|e| Error::publish(e, None))?
                .bytes()
                .await
                .map_err(|e| Error::publish(e, None))?;
            let record: LinkRecord = serde_json::from_slice(&bytes).map_err(|e| Error::publish(e, None))?;
            annotations.push(record.annotation);
        }
        Ok(annotations)
    }
}

#[async_trait]
impl AnnotationSink for ObjectStoreSink {
    async fn upload_file(&self, path: &Path, mime_type: &str, namespace: &str) -> Result<AnnotationRef> {
        let payload = tokio::fs::read(path)
            .await
            .map_err(|e| Error::publish(format!("failed to read {}: {e}", path.display()), None))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("results")
            .to_string();

        let id = Uuid::new_v4().to_string();
        let annotation = AnnotationRef {
            location: format!("annotations/{id}/{name}"),
            id,
            kind: AnnotationKind::File,
            namespace: namespace.to_string(),
        };
        self.put_annotation(&annotation, &name, mime_type, payload, None).await?;
        tracing::debug!("Uploaded {} as {}", path.display(), annotation.location);
        Ok(annotation)
    }

    async fn upload_table(&self, name: &str, namespace: &str, table: &TypedTable) -> Result<AnnotationRef> {
        let payload = table.to_parquet()?;
        let id = Uuid::new_v4().to_string();
        let annotation = AnnotationRef {
            location: format!("annotations/{id}/{name}.parquet"),
            id,
            kind: AnnotationKind::Table,
            namespace: namespace.to_string(),
        };
        self.put_annotation(&annotation, name, PARQUET_MIME_TYPE, payload, Some(table.schema()))
            .await?;
        Ok(annotation)
    }

    async fn link(&self, target: &LinkTarget, annotation: &AnnotationRef) -> Result<()> {
        let record = LinkRecord {
            target: target.clone(),
            annotation: annotation.clone(),
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|e| Error::publish(e, None))?;
        self.put(&format!("links/{}/{}/{}.json", target.kind, target.id, annotation.id), json)
            .await
    }
}

/// Turns a batch's unit results into annotations.
pub struct Publisher {
    sink: Arc<dyn AnnotationSink>,
    config: PublishConfig,
    metrics: Option<Arc<Metrics>>,
}

impl Publisher {
    pub fn new(sink: Arc<dyn AnnotationSink>, config: PublishConfig) -> Self {
        Self {
            sink,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish `results` according to `mode`.
    ///
    /// Aggregating modes validate the schema before anything is uploaded, so
    /// an unsupported column never leaves a partial table behind.
    pub async fn publish(
        &self,
        collection: &CollectionRef,
        results: &[UnitResult],
        mode: AggregationMode,
    ) -> Result<Vec<AnnotationRef>> {
        if results.is_empty() {
            tracing::warn!("No successful units in {} {}, nothing to publish", collection.kind, collection.id);
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let published = match mode {
            AggregationMode::PerUnitFile => self.publish_files(collection, results).await,
            AggregationMode::Concatenate | AggregationMode::ReduceMean => {
                self.publish_table(collection, results, mode).await.map(|a| vec![a])
            }
        };
        if let Some(ref m) = self.metrics {
            m.add_publish_time(start.elapsed());
        }
        published
    }

    async fn publish_files(&self, collection: &CollectionRef, results: &[UnitResult]) -> Result<Vec<AnnotationRef>> {
        let mut ordered: Vec<&UnitResult> = results.iter().collect();
        ordered.sort_by_key(|r| r.unit.position);

        let mut published = Vec::with_capacity(ordered.len());
        for result in ordered {
            let target = match self.config.file_link_target {
                FileLinkTarget::Unit => LinkTarget::unit(&result.unit),
                FileLinkTarget::Collection => LinkTarget::collection(collection),
            };
            let annotation = match self
                .sink
                .upload_file(&result.table_path, CSV_MIME_TYPE, &self.config.file_namespace)
                .await
            {
                Ok(annotation) => annotation,
                Err(e) => return Err(partial_failure(e, &result.unit.id, published)),
            };
            let linked = self.sink.link(&target, &annotation).await;
            published.push(annotation);
            if let Err(e) = linked {
                return Err(partial_failure(e, &result.unit.id, published));
            }
            tracing::info!("Linked results of image {} to {} {}", result.unit.id, target.kind, target.id);
        }
        Ok(published)
    }

    async fn publish_table(
        &self,
        collection: &CollectionRef,
        results: &[UnitResult],
        mode: AggregationMode,
    ) -> Result<AnnotationRef> {
        let table = aggregate::collect(results, mode)?;
        let schema = aggregate::infer_schema(&table)?;
        let typed = TypedTable::build(&table, &schema)?;
        drop(table);

        // Keep a local copy until the upload is confirmed
        let work_dir = self.config.work_dir();
        std::fs::create_dir_all(&work_dir)
            .map_err(|e| Error::publish(format!("failed to create {}: {e}", work_dir.display()), None))?;
        let local = work_dir.join(format!("{}-{}.parquet", self.config.table_name, Uuid::new_v4()));
        std::fs::write(&local, typed.to_parquet()?)
            .map_err(|e| Error::publish(format!("failed to write {}: {e}", local.display()), None))?;

        let target = LinkTarget::collection(collection);
        let uploaded = async {
            let annotation = self
                .sink
                .upload_table(&self.config.table_name, &self.config.table_namespace, &typed)
                .await?;
            self.sink.link(&target, &annotation).await?;
            Ok::<_, Error>(annotation)
        }
        .await;

        match uploaded {
            Ok(annotation) => {
                if let Err(e) = std::fs::remove_file(&local) {
                    tracing::debug!("Could not remove {}: {}", local.display(), e);
                }
                tracing::info!(
                    "Published table '{}' ({} rows, {} columns) to {} {}",
                    self.config.table_name,
                    typed.n_rows,
                    typed.columns.len(),
                    target.kind,
                    target.id
                );
                Ok(annotation)
            }
            Err(e) => {
                let message = match e {
                    Error::Publish { message, .. } => message,
                    other => other.to_string(),
                };
                tracing::error!("Publishing failed, table kept at {}", local.display());
                Err(Error::publish(message, Some(local)))
            }
        }
    }
}

/// A per-unit publish that stopped at `unit_id`, carrying what was already published.
fn partial_failure(err: Error, unit_id: &str, published: Vec<AnnotationRef>) -> Error {
    tracing::error!(
        "Publishing stopped at image {} with {} annotation(s) already created",
        unit_id,
        published.len()
    );
    err.with_published(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionKind;
    use crate::testing::{unit_result, RecordingSink};
    use object_store::memory::InMemory;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn plate() -> CollectionRef {
        CollectionRef {
            kind: CollectionKind::Plate,
            id: "422".to_string(),
            name: "plate1_1_013".to_string(),
        }
    }

    fn config(work_dir: &tempfile::TempDir) -> PublishConfig {
        PublishConfig {
            work_dir: Some(work_dir.path().to_string_lossy().to_string()),
            ..PublishConfig::default()
        }
    }

    fn results() -> Vec<UnitResult> {
        vec![
            unit_result(0, "ObjectNumber,Area\n1,10\n2,20\n"),
            unit_result(1, "ObjectNumber,Area\n1,6\n"),
        ]
    }

    #[test]
    fn test_parquet_schema_and_metadata() {
        let table = collect_table(&results(), AggregationMode::ReduceMean);
        let schema = aggregate::infer_schema(&table).unwrap();
        let typed = TypedTable::build(&table, &schema).unwrap();

        let bytes = bytes::Bytes::from(typed.to_parquet().unwrap());
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes).unwrap().build().unwrap();
        let batches: Vec<RecordBatch> = reader.collect::<std::result::Result<_, _>>().unwrap();
        let batch = &batches[0];

        assert_eq!(batch.num_rows(), 2);
        let image = batch.schema().field_with_name("Image").unwrap().clone();
        assert_eq!(image.data_type(), &DataType::Utf8);
        assert_eq!(image.metadata().get("reference").map(String::as_str), Some("image"));
        assert_eq!(
            batch.schema().field_with_name("Area").unwrap().data_type(),
            &DataType::Float64
        );
    }

    fn collect_table(results: &[UnitResult], mode: AggregationMode) -> AggregatedTable {
        aggregate::collect(results, mode).unwrap()
    }

    #[test]
    fn test_typed_table_integer_columns() {
        let table = collect_table(&results(), AggregationMode::Concatenate);
        let schema = aggregate::infer_schema(&table).unwrap();
        let typed = TypedTable::build(&table, &schema).unwrap();
        let area = typed.columns.iter().find(|c| c.schema.name == "Area").unwrap();
        assert_eq!(area.data, ColumnData::Int(vec![10, 20, 6]));
    }

    #[tokio::test]
    async fn test_reduce_mean_publishes_one_table_on_collection() {
        let work = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let publisher = Publisher::new(sink.clone(), config(&work));

        let published = publisher
            .publish(&plate(), &results(), AggregationMode::ReduceMean)
            .await
            .unwrap();

        assert_eq!(published.len(), 1);
        assert_eq!(published[0].kind, AnnotationKind::Table);
        assert_eq!(published[0].namespace, "openmicroscopy.org/omero/bulk_annotations");
        let links = sink.links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].0, LinkTarget::collection(&plate()));
        assert_eq!(sink.tables()[0].n_rows, 2);
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0, "local copy removed");
    }

    #[tokio::test]
    async fn test_per_unit_files_link_each_unit() {
        let work = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let publisher = Publisher::new(sink.clone(), config(&work));

        let published = publisher
            .publish(&plate(), &results(), AggregationMode::PerUnitFile)
            .await
            .unwrap();

        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|a| a.kind == AnnotationKind::File));
        let targets: Vec<_> = sink.links().into_iter().map(|(t, _)| t.id).collect();
        assert_eq!(targets, vec!["img-0", "img-1"]);
        assert_eq!(sink.files()[0].1, CSV_MIME_TYPE);
        assert_eq!(sink.files()[0].2, "cellprofiler.demo.namespace");
    }

    #[tokio::test]
    async fn test_per_unit_files_linked_to_collection() {
        let work = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut config = config(&work);
        config.file_link_target = FileLinkTarget::Collection;
        let publisher = Publisher::new(sink.clone(), config);

        publisher.publish(&plate(), &results(), AggregationMode::PerUnitFile).await.unwrap();
        assert!(sink.links().iter().all(|(t, _)| t.kind == "plate" && t.id == "422"));
    }

    #[tokio::test]
    async fn test_failed_upload_preserves_table() {
        let work = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::failing());
        let publisher = Publisher::new(sink.clone(), config(&work));

        let err = publisher
            .publish(&plate(), &results(), AggregationMode::Concatenate)
            .await
            .unwrap_err();
        match err {
            Error::Publish { preserved: Some(path), .. } => {
                assert!(path.exists());
                assert!(path.starts_with(work.path()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_partial_file_publish_reports_created_annotations() {
        let work = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::failing_after(2));
        let publisher = Publisher::new(sink.clone(), config(&work));
        let results: Vec<_> = (0..4).map(|p| unit_result(p, "ObjectNumber,Area\n1,10\n")).collect();

        let err = publisher
            .publish(&plate(), &results, AggregationMode::PerUnitFile)
            .await
            .unwrap_err();
        match err {
            Error::Publish { published, preserved, .. } => {
                assert_eq!(published.len(), 2);
                let linked: Vec<_> = sink.links().into_iter().map(|(_, a)| a).collect();
                assert_eq!(published, linked);
                assert!(preserved.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unsupported_column_publishes_nothing() {
        let work = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let publisher = Publisher::new(sink.clone(), config(&work));
        let results = vec![unit_result(0, "ObjectNumber,Class\n1,mitotic\n")];

        let err = publisher
            .publish(&plate(), &results, AggregationMode::Concatenate)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedColumn { .. }));
        assert!(sink.tables().is_empty());
        assert!(sink.links().is_empty());
    }

    #[tokio::test]
    async fn test_empty_results_publish_nothing() {
        let work = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let publisher = Publisher::new(sink.clone(), config(&work));
        let published = publisher.publish(&plate(), &[], AggregationMode::ReduceMean).await.unwrap();
        assert!(published.is_empty());
    }

    #[tokio::test]
    async fn test_object_store_sink_roundtrip() {
        let store = Arc::new(InMemory::new());
        let sink = ObjectStoreSink::new(store.clone());
        let dir = tempfile::TempDir::new().unwrap();
        let csv = dir.path().join("Nuclei.csv");
        std::fs::write(&csv, "ObjectNumber\n1\n").unwrap();

        let annotation = sink.upload_file(&csv, CSV_MIME_TYPE, "cellprofiler.demo.namespace").await.unwrap();
        assert!(annotation.location.ends_with("/Nuclei.csv"));
        let target = LinkTarget {
            kind: "image".to_string(),
            id: "171499".to_string(),
        };
        sink.link(&target, &annotation).await.unwrap();
        sink.link(&target, &annotation).await.unwrap();

        let linked = sink.links(&target).await.unwrap();
        assert_eq!(linked, vec![annotation.clone()]);

        let stored = store
            .get(&StorePath::from(annotation.location.as_str()))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&stored[..], b"ObjectNumber\n1\n");

        // Re-publishing creates a second annotation
        let again = sink.upload_file(&csv, CSV_MIME_TYPE, "cellprofiler.demo.namespace").await.unwrap();
        sink.link(&target, &again).await.unwrap();
        assert_eq!(sink.links(&target).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_object_store_sink_table() {
        let store = Arc::new(InMemory::new());
        let sink = ObjectStoreSink::new(store.clone());
        let table = collect_table(&results(), AggregationMode::ReduceMean);
        let typed = TypedTable::build(&table, &aggregate::infer_schema(&table).unwrap()).unwrap();

        let annotation = sink
            .upload_table("idr0002_cellprofiler", "openmicroscopy.org/omero/bulk_annotations", &typed)
            .await
            .unwrap();
        assert!(annotation.location.ends_with("idr0002_cellprofiler.parquet"));

        let record = store
            .get(&StorePath::from(format!("annotations/{}/annotation.json", annotation.id)))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&record).unwrap();
        assert_eq!(json["mime_type"], PARQUET_MIME_TYPE);
        assert_eq!(json["kind"], "table");
        assert_eq!(json["columns"][0]["name"], "Image");
    }
}
