//! Parser for CellProfiler text pipelines (`.cppipe`).
//!
//! ```text
//! CellProfiler Pipeline: http://www.cellprofiler.org
//! Version:5
//! ModuleCount:2
//!
//! Images:[module_num:1|svn_version:'Unknown'|enabled:True]
//!     Filter images?:Images only
//!
//! IdentifyPrimaryObjects:[module_num:2|enabled:True]
//!     Select the input image:OrigBlue
//! ```

use super::pipeline::{ModuleSpec, Setting};
use std::collections::BTreeMap;

const MAGIC: &str = "CellProfiler Pipeline:";

/// A parsed `.cppipe` document.
#[derive(Debug, Clone, PartialEq)]
pub struct CppipeDocument {
    /// Header `Key:Value` lines in file order, the magic line excluded
    pub header: Vec<(String, String)>,
    pub modules: Vec<ModuleSpec>,
}

impl CppipeDocument {
    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.header
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse a `.cppipe` document. Errors are plain messages; the caller
/// attaches the file path.
pub fn parse(text: &str) -> Result<CppipeDocument, String> {
    let mut lines = text.lines().enumerate().peekable();

    match lines.next() {
        Some((_, first)) if first.trim_start_matches('\u{feff}').starts_with(MAGIC) => {}
        _ => return Err(format!("missing '{}' header", MAGIC.trim_end_matches(':'))),
    }

    let mut header = Vec::new();
    while let Some((_, line)) = lines.next_if(|(_, l)| !l.trim().is_empty()) {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| format!("malformed header line '{line}'"))?;
        header.push((key.trim().to_string(), value.trim().to_string()));
    }

    let mut modules: Vec<ModuleSpec> = Vec::new();
    for (number, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(char::is_whitespace) {
            let module = modules
                .last_mut()
                .ok_or_else(|| format!("line {}: setting outside of a module", number + 1))?;
            let (name, value) = line.trim().split_once(':').unwrap_or((line.trim(), ""));
            module.settings.push(Setting {
                name: name.to_string(),
                value: value.to_string(),
            });
        } else {
            modules.push(parse_module_header(line).map_err(|e| format!("line {}: {e}", number + 1))?);
        }
    }

    let doc = CppipeDocument { header, modules };
    if let Some(declared) = doc.header_value("ModuleCount") {
        let declared: usize = declared
            .parse()
            .map_err(|_| format!("invalid ModuleCount '{declared}'"))?;
        if declared != doc.modules.len() {
            return Err(format!(
                "ModuleCount is {declared} but {} modules were found",
                doc.modules.len()
            ));
        }
    }
    Ok(doc)
}

/// `Name:[key:value|key:value|...]`
fn parse_module_header(line: &str) -> Result<ModuleSpec, String> {
    let (name, rest) = line
        .split_once(":[")
        .ok_or_else(|| format!("expected 'Name:[attributes]', got '{line}'"))?;
    let attrs = rest
        .trim_end()
        .strip_suffix(']')
        .ok_or_else(|| format!("unterminated attribute list in '{line}'"))?;

    let attributes: BTreeMap<String, String> = attrs
        .split('|')
        .filter(|a| !a.is_empty())
        .map(|a| match a.split_once(':') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (a.to_string(), String::new()),
        })
        .collect();

    let enabled = attributes
        .get("enabled")
        .map_or(true, |v| !v.eq_ignore_ascii_case("false"));

    Ok(ModuleSpec {
        name: name.trim().to_string(),
        enabled,
        attributes,
        settings: Vec::new(),
    })
}
