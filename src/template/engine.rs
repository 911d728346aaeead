//! Bridge to the external analysis engine.
//!
//! The engine executes one analysis module at a time against a
//! [`RunContext`] holding the planes bound so far. Output location and
//! headless mode are passed in explicitly with every call.

use super::pipeline::ModuleSpec;
use anyhow::Context;
use ndarray::Array2;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// Per-run engine settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Directory the engine writes its tables to; unique per unit
    pub output_dir: PathBuf,
    pub headless: bool,
    /// Base name of the results table (`<output_dir>/<results_name>.csv`)
    pub results_name: String,
}

impl EngineSettings {
    pub fn results_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.csv", self.results_name))
    }
}

/// State of one pipeline run: named input planes and the output directory.
#[derive(Debug)]
pub struct RunContext {
    images: BTreeMap<String, Arc<Array2<f64>>>,
    output_dir: PathBuf,
    /// Set once the inputs have been written for an out-of-process engine
    inputs_manifest: Option<PathBuf>,
}

impl RunContext {
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            images: BTreeMap::new(),
            output_dir,
            inputs_manifest: None,
        }
    }

    /// Bind a plane to a logical name, replacing an earlier binding.
    pub fn bind(&mut self, name: String, plane: Arc<Array2<f64>>) {
        self.images.insert(name, plane);
        self.inputs_manifest = None;
    }

    pub fn image(&self, name: &str) -> Option<&Array2<f64>> {
        self.images.get(name).map(|p| p.as_ref())
    }

    /// Bound names in sorted order.
    pub fn image_names(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(String::as_str)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

/// A synchronous, stage-granular analysis engine.
pub trait AnalysisEngine: Send + Sync {
    /// Execute one analysis module. Any error fails the run at this stage.
    fn execute_stage(
        &self,
        stage: &ModuleSpec,
        ctx: &mut RunContext,
        settings: &EngineSettings,
    ) -> anyhow::Result<()>;
}

#[derive(Serialize)]
struct InputEntry {
    file: String,
    height: usize,
    width: usize,
    dtype: &'static str,
}

/// Runs an external program once per analysis stage.
///
/// Invocation: `<program> <args..> --stage <stage.json> --inputs <inputs.json>
/// --output-dir <dir> [--headless]`. Planes are written once per run as raw
/// little-endian `f64` files next to `inputs.json`.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn workspace(ctx: &RunContext) -> PathBuf {
        ctx.output_dir.join(".inputs")
    }

    /// Write bound planes and `inputs.json` unless already written.
    fn materialize_inputs(ctx: &mut RunContext) -> anyhow::Result<PathBuf> {
        if let Some(ref manifest) = ctx.inputs_manifest {
            return Ok(manifest.clone());
        }
        let workspace = Self::workspace(ctx);
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("Failed to create {}", workspace.display()))?;

        // Logical names are free text; files are named by binding order
        let mut entries = BTreeMap::new();
        for (i, (name, plane)) in ctx.images.iter().enumerate() {
            let file = format!("input-{i}.f64");
            let bytes: Vec<u8> = plane.iter().flat_map(|v| v.to_le_bytes()).collect();
            std::fs::write(workspace.join(&file), bytes)
                .with_context(|| format!("Failed to write input plane {name} to {file}"))?;
            let (height, width) = plane.dim();
            entries.insert(
                name.clone(),
                InputEntry {
                    file,
                    height,
                    width,
                    dtype: "<f8",
                },
            );
        }

        let manifest = workspace.join("inputs.json");
        std::fs::write(&manifest, serde_json::to_vec_pretty(&entries)?)?;
        ctx.inputs_manifest = Some(manifest.clone());
        Ok(manifest)
    }
}

impl AnalysisEngine for CommandEngine {
    fn execute_stage(
        &self,
        stage: &ModuleSpec,
        ctx: &mut RunContext,
        settings: &EngineSettings,
    ) -> anyhow::Result<()> {
        let inputs = Self::materialize_inputs(ctx)?;
        let stage_file = Self::workspace(ctx).join("stage.json");
        std::fs::write(&stage_file, serde_json::to_vec_pretty(stage)?)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--stage")
            .arg(&stage_file)
            .arg("--inputs")
            .arg(&inputs)
            .arg("--output-dir")
            .arg(&settings.output_dir);
        if settings.headless {
            command.arg("--headless");
        }

        tracing::debug!("Running stage {} via {}", stage.name, self.program);
        let output = command
            .output()
            .with_context(|| format!("Failed to launch {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} exited with {}: {}", self.program, output.status, stderr.trim());
        }
        Ok(())
    }
}
