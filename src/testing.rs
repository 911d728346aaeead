//! Fixtures shared by unit and batch tests.

use crate::collection::{
    CollectionKind, CollectionProvider, CollectionRef, PlaneAccessor, WellRef, WorkUnit,
};
use crate::error::{Error, Result};
use crate::results::{
    AnnotationKind, AnnotationRef, AnnotationSink, LinkTarget, ResultFrame, TypedTable, UnitResult,
};
use crate::template::{AnalysisEngine, EngineSettings, ModuleSpec, PipelineTemplate, RunContext};
use async_trait::async_trait;
use ndarray::Array2;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutPayload};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Pixel value that makes [`ScriptedEngine`] fail a stage.
pub const FAIL_MARKER: f64 = -1.0;

pub const PLANE_HEIGHT: usize = 4;
pub const PLANE_WIDTH: usize = 4;

/// A tagged unit result at `position` with image `img-{position}` in well `well-{position}`.
pub fn unit_result(position: usize, csv: &str) -> UnitResult {
    let unit = unit(position, 2);
    let mut frame = ResultFrame::from_csv_reader(csv.as_bytes()).unwrap();
    frame.tag_with_unit(&unit).unwrap();
    let workspace = tempfile::Builder::new()
        .prefix(&format!("img-{position}-"))
        .tempdir()
        .unwrap();
    let table_path = workspace.path().join("Nuclei.csv");
    std::fs::write(&table_path, csv).unwrap();
    UnitResult::new(unit, table_path, frame, Some(workspace))
}

pub fn unit(position: usize, size_c: usize) -> WorkUnit {
    WorkUnit {
        id: format!("img-{position}"),
        name: format!("Well {position}, Field 1"),
        position,
        array_index: position,
        size_c,
        well: Some(WellRef {
            id: format!("well-{position}"),
            row: 0,
            column: position as u32,
        }),
    }
}

/// Pixel value of channel `c` for the unit at `position`.
pub fn pixel_value(position: usize, c: usize) -> f64 {
    (position as f64 + 1.0) * 10f64.powi(c as i32)
}

/// Constant planes; channel `c` holds `base * 10^c`.
pub struct MemoryPlanes {
    base: f64,
}

#[async_trait]
impl PlaneAccessor for MemoryPlanes {
    async fn get_plane(&self, _t: usize, c: usize, _z: usize) -> Result<Array2<f64>> {
        let value = if self.base == FAIL_MARKER {
            FAIL_MARKER
        } else {
            self.base * 10f64.powi(c as i32)
        };
        Ok(Array2::from_elem((PLANE_HEIGHT, PLANE_WIDTH), value))
    }
}

/// A plate held in memory, one image per well, with direct pixel access.
pub struct MemoryProvider {
    collection: CollectionRef,
    units: Vec<WorkUnit>,
    pixels: HashMap<String, Arc<MemoryPlanes>>,
    pub children_requests: Mutex<Vec<Option<usize>>>,
}

impl MemoryProvider {
    pub fn plate(id: &str, wells: usize, size_c: usize) -> Self {
        let units: Vec<WorkUnit> = (0..wells).map(|p| unit(p, size_c)).collect();
        let pixels = units
            .iter()
            .map(|u| (u.id.clone(), Arc::new(MemoryPlanes { base: pixel_value(u.position, 0) })))
            .collect();
        Self {
            collection: CollectionRef {
                kind: CollectionKind::Plate,
                id: id.to_string(),
                name: format!("plate-{id}"),
            },
            units,
            pixels,
            children_requests: Mutex::new(Vec::new()),
        }
    }

    /// Make every stage fail for the unit at `position`.
    pub fn with_corrupt_unit(mut self, position: usize) -> Self {
        let id = self.units[position].id.clone();
        self.pixels.insert(id, Arc::new(MemoryPlanes { base: FAIL_MARKER }));
        self
    }

    pub fn with_unit_name(mut self, position: usize, name: &str) -> Self {
        self.units[position].name = name.to_string();
        self
    }

    /// List the unit at `position` a second time, right after itself.
    pub fn with_repeated_unit(mut self, position: usize) -> Self {
        let repeat = self.units[position].clone();
        self.units.insert(position + 1, repeat);
        self
    }

    pub fn without_pixels(mut self) -> Self {
        self.pixels.clear();
        self
    }

    pub fn collection_ref(&self) -> &CollectionRef {
        &self.collection
    }
}

#[async_trait]
impl CollectionProvider for MemoryProvider {
    async fn collection(&self, id: &str) -> Result<CollectionRef> {
        if id == self.collection.id {
            Ok(self.collection.clone())
        } else {
            Err(Error::Provider(format!("unknown collection '{id}'")))
        }
    }

    async fn children(&self, _collection: &CollectionRef, limit: Option<usize>) -> Result<Vec<WorkUnit>> {
        self.children_requests.lock().unwrap().push(limit);
        Ok(self.units.iter().take(limit.unwrap_or(usize::MAX)).cloned().collect())
    }

    fn pixels(&self, unit: &WorkUnit) -> Option<Arc<dyn PlaneAccessor>> {
        self.pixels.get(&unit.id).map(|p| p.clone() as Arc<dyn PlaneAccessor>)
    }
}

/// Writes a deterministic results table from the bound planes.
///
/// Each stage fails if `OrigBlue` is unbound or holds [`FAIL_MARKER`].
/// Otherwise it writes two objects whose area derives from `OrigBlue` and
/// whose intensity derives from `OrigGreen`.
#[derive(Default)]
pub struct ScriptedEngine {
    /// Bound input names seen by each executed stage
    pub bindings: Mutex<Vec<(String, Vec<String>)>>,
}

impl AnalysisEngine for ScriptedEngine {
    fn execute_stage(&self, stage: &ModuleSpec, ctx: &mut RunContext, settings: &EngineSettings) -> anyhow::Result<()> {
        let names = ctx.image_names().map(str::to_string).collect();
        self.bindings.lock().unwrap().push((stage.name.clone(), names));

        let blue = ctx
            .image("OrigBlue")
            .ok_or_else(|| anyhow::anyhow!("OrigBlue is not bound"))?;
        let blue = blue[[0, 0]];
        if blue == FAIL_MARKER {
            anyhow::bail!("no objects found");
        }
        let green = ctx.image("OrigGreen").map(|p| p[[0, 0]]).unwrap_or(f64::NAN);

        let mut csv = String::from("ImageNumber,ObjectNumber,AreaShape_Area,Intensity_MeanIntensity_OrigGreen\n");
        for object in 1..=2 {
            let area = blue as i64 * 10 + object;
            csv.push_str(&format!("1,{object},{area},{}\n", green / 100.0));
        }
        std::fs::write(settings.results_path(), csv)?;
        Ok(())
    }
}

/// Records uploads and links in memory.
#[derive(Default)]
pub struct RecordingSink {
    /// Uploads accepted before every further upload fails
    fail_after: Option<usize>,
    files: Mutex<Vec<(PathBuf, String, String)>>,
    tables: Mutex<Vec<TypedTable>>,
    links: Mutex<Vec<(LinkTarget, AnnotationRef)>>,
}

impl RecordingSink {
    /// A sink whose every upload fails.
    pub fn failing() -> Self {
        Self::failing_after(0)
    }

    /// A sink that accepts `uploads` uploads and fails the rest.
    pub fn failing_after(uploads: usize) -> Self {
        Self {
            fail_after: Some(uploads),
            ..Self::default()
        }
    }

    fn rejects_upload(&self) -> bool {
        let uploads = self.files.lock().unwrap().len() + self.tables.lock().unwrap().len();
        self.fail_after.is_some_and(|limit| uploads >= limit)
    }

    pub fn files(&self) -> Vec<(PathBuf, String, String)> {
        self.files.lock().unwrap().clone()
    }

    pub fn tables(&self) -> Vec<TypedTable> {
        self.tables.lock().unwrap().clone()
    }

    pub fn links(&self) -> Vec<(LinkTarget, AnnotationRef)> {
        self.links.lock().unwrap().clone()
    }

    fn annotation(&self, kind: AnnotationKind, namespace: &str, location: String) -> AnnotationRef {
        let n = self.files.lock().unwrap().len() + self.tables.lock().unwrap().len();
        AnnotationRef {
            id: format!("ann-{n}"),
            kind,
            namespace: namespace.to_string(),
            location,
        }
    }
}

#[async_trait]
impl AnnotationSink for RecordingSink {
    async fn upload_file(&self, path: &Path, mime_type: &str, namespace: &str) -> Result<AnnotationRef> {
        if self.rejects_upload() {
            return Err(Error::publish("sink unavailable", None));
        }
        // The unit's output must still exist when it is uploaded
        assert!(path.exists(), "{} was removed before upload", path.display());
        let annotation = self.annotation(AnnotationKind::File, namespace, path.display().to_string());
        self.files
            .lock()
            .unwrap()
            .push((path.to_path_buf(), mime_type.to_string(), namespace.to_string()));
        Ok(annotation)
    }

    async fn upload_table(&self, name: &str, namespace: &str, table: &TypedTable) -> Result<AnnotationRef> {
        if self.rejects_upload() {
            return Err(Error::publish("sink unavailable", None));
        }
        let annotation = self.annotation(AnnotationKind::Table, namespace, name.to_string());
        self.tables.lock().unwrap().push(table.clone());
        Ok(annotation)
    }

    async fn link(&self, target: &LinkTarget, annotation: &AnnotationRef) -> Result<()> {
        self.links.lock().unwrap().push((target.clone(), annotation.clone()));
        Ok(())
    }
}

/// A text pipeline: four acquisition modules, then two analysis modules.
pub const SAMPLE_PIPELINE: &str = "CellProfiler Pipeline: http://www.cellprofiler.org
Version:5
DateRevision:421
ModuleCount:6
HasImagePlaneDetails:False

Images:[module_num:1|svn_version:'Unknown'|variable_revision_number:2|enabled:True]
    :
    Filter images?:Images only

Metadata:[module_num:2|svn_version:'Unknown'|variable_revision_number:6|enabled:True]
    Extract metadata?:No

NamesAndTypes:[module_num:3|svn_version:'Unknown'|variable_revision_number:8|enabled:True]
    Assign a name to:Images matching rules

Groups:[module_num:4|svn_version:'Unknown'|variable_revision_number:2|enabled:True]
    Do you want to group your images?:No

IdentifyPrimaryObjects:[module_num:5|svn_version:'Unknown'|variable_revision_number:14|enabled:True]
    Select the input image:OrigBlue
    Name the primary objects to be identified:Nuclei

ExportToSpreadsheet:[module_num:6|svn_version:'Unknown'|variable_revision_number:13|enabled:True]
    Select the column delimiter:Comma (\",\")
";

/// Write [`SAMPLE_PIPELINE`] under `dir` and load it.
pub fn sample_template(dir: &Path) -> PipelineTemplate {
    let path = dir.join("ExamplePercentPositive.cppipe");
    std::fs::write(&path, SAMPLE_PIPELINE).unwrap();
    PipelineTemplate::load(&path, 4).unwrap()
}

/// Store a `(1, size_c, 1, H, W)` float64 array at `root`, one chunk per channel,
/// holding the same values [`MemoryPlanes`] serves for `position`.
pub async fn put_unit_array(store: &InMemory, root: &str, position: usize, size_c: usize) {
    let zarray = format!(
        r#"{{"zarr_format": 2, "shape": [1, {size_c}, 1, {PLANE_HEIGHT}, {PLANE_WIDTH}],
            "chunks": [1, 1, 1, {PLANE_HEIGHT}, {PLANE_WIDTH}], "dtype": "<f8",
            "compressor": null, "fill_value": 0, "order": "C", "filters": null}}"#
    );
    store
        .put(&StorePath::from(format!("{root}/.zarray")), PutPayload::from(zarray.into_bytes()))
        .await
        .unwrap();
    for c in 0..size_c {
        let value = pixel_value(position, c);
        let bytes: Vec<u8> = std::iter::repeat(value)
            .take(PLANE_HEIGHT * PLANE_WIDTH)
            .flat_map(f64::to_le_bytes)
            .collect();
        store
            .put(&StorePath::from(format!("{root}/0.{c}.0.0.0")), PutPayload::from(bytes))
            .await
            .unwrap();
    }
}
