//! Cross-unit aggregation: concatenation, per-image mean, schema inference.

use super::frame::{Column, ResultFrame, Value, IMAGE_COLUMN, WELL_COLUMN};
use super::UnitResult;
use crate::config::AggregationMode;
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;

/// What a reference column points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefTarget {
    Image,
    Well,
}

impl RefTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefTarget::Image => "image",
            RefTarget::Well => "well",
        }
    }
}

/// Kind of a published table column, decided once at inference time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Reference(RefTarget),
    Integer,
    Float,
}

/// A named, typed column of the published table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    pub kind: ColumnKind,
}

/// The union of a batch's unit results, possibly reduced.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedTable {
    pub frame: ResultFrame,
    /// Group-by key when the table holds per-group means
    pub reduced_by: Option<String>,
    /// Identifiers of the units whose rows are in the table
    pub unit_ids: Vec<String>,
}

/// Concatenate tagged unit results and optionally reduce them.
///
/// Results are ordered by their position in the collection first, so the
/// table does not depend on the order units finished in.
pub fn collect(results: &[UnitResult], mode: AggregationMode) -> Result<AggregatedTable> {
    let mut ordered: Vec<&UnitResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.unit.position);

    let unit_ids = ordered.iter().map(|r| r.unit.id.clone()).collect();
    let frame = concatenate(ordered.iter().map(|r| &r.frame))?;

    match mode {
        AggregationMode::ReduceMean => {
            let reduced = reduce_mean(&frame, IMAGE_COLUMN)?;
            // pre-reduction rows are released here
            drop(frame);
            Ok(AggregatedTable {
                frame: reduced,
                reduced_by: Some(IMAGE_COLUMN.to_string()),
                unit_ids,
            })
        }
        AggregationMode::Concatenate | AggregationMode::PerUnitFile => Ok(AggregatedTable {
            frame,
            reduced_by: None,
            unit_ids,
        }),
    }
}

/// Stack frames row-wise. Columns are the union in order of first
/// appearance; cells a frame lacks are missing.
pub fn concatenate<'a>(frames: impl IntoIterator<Item = &'a ResultFrame>) -> Result<ResultFrame> {
    let frames: Vec<&ResultFrame> = frames.into_iter().collect();
    let total_rows: usize = frames.iter().map(|f| f.n_rows()).sum();

    let mut order: Vec<String> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for frame in &frames {
        for name in frame.column_names() {
            if !index.contains_key(name) {
                index.insert(name.to_string(), order.len());
                order.push(name.to_string());
            }
        }
    }

    let mut columns: Vec<Column> = order
        .into_iter()
        .map(|name| Column {
            name,
            values: Vec::with_capacity(total_rows),
        })
        .collect();

    for frame in &frames {
        for column in columns.iter_mut() {
            match frame.column(&column.name) {
                Some(source) => column.values.extend(source.values.iter().cloned()),
                None => column
                    .values
                    .extend(std::iter::repeat(Value::Missing).take(frame.n_rows())),
            }
        }
    }

    ResultFrame::from_columns(columns)
}

/// Group rows by `key` and average every numeric column per group.
///
/// The key and the well reference are kept as-is (the well is constant per
/// image). Text columns cannot be averaged and are dropped. Missing cells do
/// not count towards a mean.
pub fn reduce_mean(frame: &ResultFrame, key: &str) -> Result<ResultFrame> {
    let key_column = frame.column(key).ok_or_else(|| Error::UnsupportedColumn {
        column: key.to_string(),
        message: "group-by column missing from results".to_string(),
    })?;

    // Groups in order of first appearance
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    let mut group_index: HashMap<String, usize> = HashMap::new();
    for (row, value) in key_column.values.iter().enumerate() {
        let label = value.to_string();
        let slot = *group_index.entry(label.clone()).or_insert_with(|| {
            groups.push((label, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(row);
    }

    let mut columns = vec![Column {
        name: key.to_string(),
        values: groups
            .iter()
            .map(|(_, rows)| key_column.values[rows[0]].clone())
            .collect(),
    }];

    for column in frame.columns() {
        if column.name == key {
            continue;
        }
        if column.name == WELL_COLUMN {
            columns.push(Column {
                name: column.name.clone(),
                values: groups
                    .iter()
                    .map(|(_, rows)| column.values[rows[0]].clone())
                    .collect(),
            });
            continue;
        }
        if column.values.iter().any(Value::is_text) {
            tracing::warn!("Dropping non-numeric column '{}' from per-{} means", column.name, key);
            continue;
        }
        let means = groups
            .iter()
            .map(|(_, rows)| {
                // Missing and NaN cells are skipped, not counted
                let present: Vec<f64> = rows
                    .iter()
                    .filter_map(|&r| column.values[r].as_f64())
                    .filter(|v| !v.is_nan())
                    .collect();
                if present.is_empty() {
                    Value::Float(f64::NAN)
                } else {
                    Value::Float(present.iter().sum::<f64>() / present.len() as f64)
                }
            })
            .collect();
        columns.push(Column {
            name: column.name.clone(),
            values: means,
        });
    }

    ResultFrame::from_columns(columns)
}

/// Decide each column's kind.
///
/// `Image` and `Well` are references; all-integer columns are integers;
/// numeric columns with any float or missing cell are floats. Anything else
/// fails before a table is written.
pub fn infer_schema(table: &AggregatedTable) -> Result<Vec<ColumnSchema>> {
    table
        .frame
        .columns()
        .iter()
        .map(|column| {
            let kind = match column.name.as_str() {
                IMAGE_COLUMN => ColumnKind::Reference(RefTarget::Image),
                WELL_COLUMN => ColumnKind::Reference(RefTarget::Well),
                _ => numeric_kind(column)?,
            };
            Ok(ColumnSchema {
                name: column.name.clone(),
                kind,
            })
        })
        .collect()
}

fn numeric_kind(column: &Column) -> Result<ColumnKind> {
    let mut kind = ColumnKind::Integer;
    for value in &column.values {
        match value {
            Value::Int(_) => {}
            Value::Float(_) | Value::Missing => kind = ColumnKind::Float,
            Value::Text(text) => {
                return Err(Error::UnsupportedColumn {
                    column: column.name.clone(),
                    message: format!("non-numeric value '{text}'"),
                })
            }
        }
    }
    Ok(kind)
}
