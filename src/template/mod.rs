//! Pipeline template management and the analysis engine bridge.

mod cppipe;
mod engine;
mod pipeline;

pub use cppipe::{parse as parse_cppipe, CppipeDocument};
pub use engine::{AnalysisEngine, CommandEngine, EngineSettings, RunContext};
pub use pipeline::{InjectedPlane, ModuleSpec, PipelineTemplate, Setting, Stage, INJECT_STAGE_NAME};
