//! Pipeline templates: load once, normalize, clone per unit, inject, run.

use super::cppipe;
use super::engine::{AnalysisEngine, EngineSettings, RunContext};
use crate::error::{Error, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name reported for injected input stages.
pub const INJECT_STAGE_NAME: &str = "InjectImage";

/// One `name: value` setting of an analysis module, in definition order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub name: String,
    pub value: String,
}

/// An analysis module as declared in the pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub name: String,

    /// Disabled modules stay in the pipeline but are skipped at run time
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(default)]
    pub settings: Vec<Setting>,
}

fn default_true() -> bool {
    true
}

/// An in-memory plane bound to a logical input name.
#[derive(Debug, Clone)]
pub struct InjectedPlane {
    pub logical_name: String,
    pub channel: usize,
    pub plane: Arc<Array2<f64>>,
}

#[derive(Debug, Clone)]
pub enum Stage {
    /// Binds a plane; consumed by later modules
    Inject(InjectedPlane),
    Module(ModuleSpec),
}

impl Stage {
    pub fn name(&self) -> &str {
        match self {
            Stage::Inject(_) => INJECT_STAGE_NAME,
            Stage::Module(m) => &m.name,
        }
    }
}

/// JSON / YAML pipeline definition.
#[derive(Debug, Deserialize)]
struct PipelineDefinition {
    #[serde(default)]
    name: Option<String>,
    stages: Vec<ModuleSpec>,
}

/// A named, ordered sequence of stages.
///
/// Templates are never mutated once normalized: every unit works on its own
/// `clone()`, and [`PipelineTemplate::inject`] consumes that clone.
#[derive(Debug, Clone)]
pub struct PipelineTemplate {
    name: String,
    source: PathBuf,
    stages: Vec<Stage>,
}

impl PipelineTemplate {
    /// Load a definition and strip its leading `strip` acquisition stages.
    pub fn load(path: &Path, strip: usize) -> Result<Self> {
        Self::parse_file(path)?.normalize(strip)
    }

    /// Parse a definition file without normalizing it.
    ///
    /// `.json`, `.yaml` and `.yml` are structured definitions; anything else
    /// is read as a CellProfiler text pipeline.
    pub fn parse_file(path: &Path) -> Result<Self> {
        let load_error = |message: String| Error::TemplateLoad {
            path: path.to_path_buf(),
            message,
        };

        let text = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("pipeline")
            .to_string();

        let (name, modules) = match ext {
            "json" => {
                let def: PipelineDefinition =
                    serde_json::from_str(&text).map_err(|e| load_error(e.to_string()))?;
                (def.name.unwrap_or(stem), def.stages)
            }
            "yaml" | "yml" => {
                let def: PipelineDefinition =
                    serde_yaml::from_str(&text).map_err(|e| load_error(e.to_string()))?;
                (def.name.unwrap_or(stem), def.stages)
            }
            _ => (stem, cppipe::parse(&text).map_err(load_error)?.modules),
        };

        tracing::info!("Loaded pipeline '{}' with {} stages from {}", name, modules.len(), path.display());

        Ok(Self {
            name,
            source: path.to_path_buf(),
            stages: modules.into_iter().map(Stage::Module).collect(),
        })
    }

    /// Remove the first `strip` stages, logging each one.
    pub fn normalize(mut self, strip: usize) -> Result<Self> {
        if self.stages.len() < strip {
            return Err(Error::TemplateShape {
                found: self.stages.len(),
                required: strip,
            });
        }

        for removed in self.stages.drain(..strip) {
            tracing::info!("Removed stage: {}", removed.name());
        }

        tracing::info!("Pipeline stages:");
        for (i, stage) in self.stages.iter().enumerate() {
            tracing::info!("  {} {}", i + 1, stage.name());
        }
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// File the template was loaded from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Logical names of injected planes, evaluation order.
    pub fn injected_names(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter_map(|s| match s {
                Stage::Inject(p) => Some(p.logical_name.as_str()),
                Stage::Module(_) => None,
            })
            .collect()
    }

    /// Prepend a stage binding `plane` to `logical_name`.
    ///
    /// Injected stages always go to index 0; they only bind data, so their
    /// relative order does not matter.
    pub fn inject(mut self, channel: usize, plane: Array2<f64>, logical_name: impl Into<String>) -> Self {
        self.stages.insert(
            0,
            Stage::Inject(InjectedPlane {
                logical_name: logical_name.into(),
                channel,
                plane: Arc::new(plane),
            }),
        );
        self
    }

    /// Execute every stage in order and return the results table location.
    ///
    /// Stops at the first failing stage. Blocking; callers on an async
    /// runtime should use `spawn_blocking`.
    pub fn run(&self, engine: &dyn AnalysisEngine, settings: &EngineSettings) -> Result<PathBuf> {
        let mut ctx = RunContext::new(settings.output_dir.clone());
        let mut last_stage: &str = INJECT_STAGE_NAME;

        for stage in &self.stages {
            match stage {
                Stage::Inject(input) => ctx.bind(input.logical_name.clone(), input.plane.clone()),
                Stage::Module(module) if !module.enabled => {
                    tracing::debug!("Skipping disabled stage {}", module.name);
                }
                Stage::Module(module) => {
                    last_stage = module.name.as_str();
                    engine
                        .execute_stage(module, &mut ctx, settings)
                        .map_err(|e| Error::AnalysisExecution {
                            stage: module.name.clone(),
                            message: format!("{e:#}"),
                        })?;
                }
            }
        }

        let results = settings.results_path();
        if !results.exists() {
            return Err(Error::AnalysisExecution {
                stage: last_stage.to_string(),
                message: format!("no results table at {}", results.display()),
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const FIVE_STAGES: &str = "CellProfiler Pipeline: http://www.cellprofiler.org
Version:5
ModuleCount:6

Images:[module_num:1|enabled:True]
    Filter images?:Images only

Metadata:[module_num:2|enabled:True]
    Extract metadata?:No

NamesAndTypes:[module_num:3|enabled:True]
    Assign a name to:Images matching rules

Groups:[module_num:4|enabled:True]
    Do you want to group your images?:No

IdentifyPrimaryObjects:[module_num:5|enabled:True]
    Select the input image:OrigBlue

MeasureObjectIntensity:[module_num:6|enabled:False]
    Select images to measure:OrigGreen
";

    /// Records stage names; fails on `fail_on`; writes the table on `ExportToSpreadsheet`.
    #[derive(Default)]
    struct RecordingEngine {
        seen: Mutex<Vec<(String, Vec<String>)>>,
        fail_on: Option<String>,
    }

    impl AnalysisEngine for RecordingEngine {
        fn execute_stage(&self, stage: &ModuleSpec, ctx: &mut RunContext, settings: &EngineSettings) -> anyhow::Result<()> {
            let bound = ctx.image_names().map(str::to_string).collect();
            self.seen.lock().unwrap().push((stage.name.clone(), bound));
            if self.fail_on.as_deref() == Some(stage.name.as_str()) {
                anyhow::bail!("segmentation failed");
            }
            std::fs::write(settings.results_path(), "ImageNumber,ObjectNumber\n1,1\n")?;
            Ok(())
        }
    }

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn settings(dir: &tempfile::TempDir) -> EngineSettings {
        EngineSettings {
            output_dir: dir.path().to_path_buf(),
            headless: true,
            results_name: "Nuclei".to_string(),
        }
    }

    #[test]
    fn test_load_strips_acquisition_stages() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write(&dir, "ExamplePercentPositive.cppipe", FIVE_STAGES);

        let raw = PipelineTemplate::parse_file(&path).unwrap();
        let template = PipelineTemplate::load(&path, 4).unwrap();
        assert_eq!(template.len(), raw.len() - 4);
        assert_eq!(template.name(), "ExamplePercentPositive");
        assert_eq!(template.stages()[0].name(), "IdentifyPrimaryObjects");
    }

    #[test]
    fn test_too_few_stages_is_shape_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write(
            &dir,
            "short.yaml",
            "stages:\n  - name: Images\n  - name: Metadata\n  - name: NamesAndTypes\n",
        );
        let err = PipelineTemplate::load(&path, 4).unwrap_err();
        assert!(matches!(err, Error::TemplateShape { found: 3, required: 4 }));

        // Exactly four stages normalizes to an empty pipeline
        let path = write(
            &dir,
            "four.json",
            r#"{"name": "four", "stages": [{"name": "A"}, {"name": "B"}, {"name": "C"}, {"name": "D"}]}"#,
        );
        assert!(PipelineTemplate::load(&path, 4).unwrap().is_empty());
    }

    #[test]
    fn test_missing_or_malformed_is_load_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = PipelineTemplate::load(&dir.path().join("absent.cppipe"), 4).unwrap_err();
        assert!(matches!(err, Error::TemplateLoad { .. }));

        let path = write(&dir, "bad.json", "{not json");
        let err = PipelineTemplate::load(&path, 4).unwrap_err();
        assert!(matches!(err, Error::TemplateLoad { .. }));
    }

    #[test]
    fn test_clones_are_isolated() {
        let dir = tempfile::TempDir::new().unwrap();
        let template = PipelineTemplate::load(&write(&dir, "p.cppipe", FIVE_STAGES), 4).unwrap();

        let a = template.clone().inject(0, Array2::zeros((2, 2)), "OrigBlue");
        let b = template.clone();

        assert_eq!(a.len(), template.len() + 1);
        assert_eq!(b.len(), template.len());
        assert!(b.injected_names().is_empty());
        assert_eq!(a.injected_names(), vec!["OrigBlue"]);
    }

    #[test]
    fn test_inject_prepends() {
        let dir = tempfile::TempDir::new().unwrap();
        let template = PipelineTemplate::load(&write(&dir, "p.cppipe", FIVE_STAGES), 4).unwrap();

        let clone = template
            .clone()
            .inject(0, Array2::zeros((2, 2)), "OrigBlue")
            .inject(1, Array2::ones((2, 2)), "OrigGreen");

        assert_eq!(clone.stages()[0].name(), INJECT_STAGE_NAME);
        assert_eq!(clone.injected_names(), vec!["OrigGreen", "OrigBlue"]);
        assert_eq!(clone.stages()[2].name(), "IdentifyPrimaryObjects");
    }

    #[test]
    fn test_run_binds_inputs_and_skips_disabled() {
        let dir = tempfile::TempDir::new().unwrap();
        let template = PipelineTemplate::load(&write(&dir, "p.cppipe", FIVE_STAGES), 4).unwrap();
        let out = tempfile::TempDir::new().unwrap();
        let engine = RecordingEngine::default();

        let clone = template
            .clone()
            .inject(0, Array2::zeros((2, 2)), "OrigBlue")
            .inject(1, Array2::zeros((2, 2)), "OrigGreen");
        let results = clone.run(&engine, &settings(&out)).unwrap();

        assert_eq!(results, out.path().join("Nuclei.csv"));
        let seen = engine.seen.lock().unwrap();
        assert_eq!(seen.len(), 1, "disabled stage must not run");
        assert_eq!(seen[0].0, "IdentifyPrimaryObjects");
        assert_eq!(seen[0].1, vec!["OrigBlue", "OrigGreen"]);
    }

    #[test]
    fn test_run_failure_names_stage() {
        let dir = tempfile::TempDir::new().unwrap();
        let template = PipelineTemplate::load(&write(&dir, "p.cppipe", FIVE_STAGES), 4).unwrap();
        let out = tempfile::TempDir::new().unwrap();
        let engine = RecordingEngine {
            fail_on: Some("IdentifyPrimaryObjects".to_string()),
            ..Default::default()
        };

        let err = template.run(&engine, &settings(&out)).unwrap_err();
        match err {
            Error::AnalysisExecution { stage, message } => {
                assert_eq!(stage, "IdentifyPrimaryObjects");
                assert!(message.contains("segmentation failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_run_without_results_table_fails() {
        let out = tempfile::TempDir::new().unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let path = write(&dir, "p.yaml", "stages:\n  - name: A\n  - name: B\n");
        let template = PipelineTemplate::load(&path, 2).unwrap();

        let err = template.run(&RecordingEngine::default(), &settings(&out)).unwrap_err();
        assert!(matches!(err, Error::AnalysisExecution { .. }));
    }
}
