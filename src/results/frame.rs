//! Column-oriented result frames parsed from per-unit CSV tables.

use crate::collection::WorkUnit;
use crate::error::{Error, Result};
use std::io::Read;
use std::path::Path;

/// Image reference column added to every unit's rows.
pub const IMAGE_COLUMN: &str = "Image";
/// Well reference column, present for plate units.
pub const WELL_COLUMN: &str = "Well";
/// Number of detected objects in the unit, repeated on each row.
pub const CELL_COUNT_COLUMN: &str = "Cell_Count";

/// One cell of a result frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Missing,
}

impl Value {
    /// Parse a CSV field. Empty fields are missing.
    pub fn parse(field: &str) -> Self {
        let field = field.trim();
        if field.is_empty() {
            return Value::Missing;
        }
        if let Ok(i) = field.parse::<i64>() {
            return Value::Int(i);
        }
        match field.parse::<f64>() {
            Ok(f) => Value::Float(f),
            Err(_) => Value::Text(field.to_string()),
        }
    }

    /// Numeric view; `None` for text, NaN for missing.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Missing => Some(f64::NAN),
            Value::Text(_) => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Value::Text(_))
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Missing => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

/// A table of named, equally long columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultFrame {
    columns: Vec<Column>,
    n_rows: usize,
}

impl ResultFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a delimited file with a header row.
    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| Error::AnalysisExecution {
            stage: "results".to_string(),
            message: format!("failed to open {}: {e}", path.display()),
        })?;
        Self::from_csv_reader(file).map_err(|e| match e {
            Error::AnalysisExecution { stage, message } => Error::AnalysisExecution {
                stage,
                message: format!("{}: {message}", path.display()),
            },
            other => other,
        })
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let invalid = |e: csv::Error| Error::AnalysisExecution {
            stage: "results".to_string(),
            message: format!("malformed results table: {e}"),
        };

        let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers = rdr.headers().map_err(invalid)?.clone();

        let mut columns: Vec<Column> = headers
            .iter()
            .map(|name| Column {
                name: name.to_string(),
                values: Vec::new(),
            })
            .collect();

        let mut n_rows = 0;
        for record in rdr.records() {
            let record = record.map_err(invalid)?;
            for (column, field) in columns.iter_mut().zip(record.iter()) {
                column.values.push(Value::parse(field));
            }
            n_rows += 1;
        }

        Ok(Self { columns, n_rows })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Add a column, or replace one of the same name.
    ///
    /// The first column added to an empty frame sets the row count.
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) -> Result<()> {
        if self.columns.is_empty() {
            self.n_rows = values.len();
        } else if values.len() != self.n_rows {
            return Err(Error::UnsupportedColumn {
                column: name.to_string(),
                message: format!("has {} rows, frame has {}", values.len(), self.n_rows),
            });
        }
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(existing) => existing.values = values,
            None => self.columns.push(Column {
                name: name.to_string(),
                values,
            }),
        }
        Ok(())
    }

    /// Add `Image`, `Well` (plate units only) and `Cell_Count` columns.
    pub fn tag_with_unit(&mut self, unit: &WorkUnit) -> Result<()> {
        let n = self.n_rows;
        self.set_column(IMAGE_COLUMN, vec![Value::Text(unit.id.clone()); n])?;
        if let Some(ref well) = unit.well {
            self.set_column(WELL_COLUMN, vec![Value::Text(well.id.clone()); n])?;
        }
        self.set_column(CELL_COUNT_COLUMN, vec![Value::Int(n as i64); n])
    }

    /// Build a frame from complete columns. All columns must have equal length.
    pub fn from_columns(columns: Vec<Column>) -> Result<Self> {
        let mut frame = Self::new();
        for column in columns {
            frame.set_column(&column.name, column.values)?;
        }
        Ok(frame)
    }

    /// Values of one row in column order.
    pub fn row(&self, index: usize) -> Vec<&Value> {
        self.columns.iter().map(|c| &c.values[index]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::WellRef;

    const NUCLEI: &str = "ImageNumber,ObjectNumber,AreaShape_Area,Intensity_MeanIntensity_OrigGreen\n\
                          1,1,120,0.25\n\
                          1,2,98,\n\
                          1,3,143,0.5\n";

    fn unit() -> WorkUnit {
        WorkUnit {
            id: "171499".to_string(),
            name: "A1".to_string(),
            position: 0,
            array_index: 0,
            size_c: 2,
            well: Some(WellRef {
                id: "9510".to_string(),
                row: 0,
                column: 0,
            }),
        }
    }

    #[test]
    fn test_value_parse() {
        assert_eq!(Value::parse("42"), Value::Int(42));
        assert_eq!(Value::parse("-1.5e3"), Value::Float(-1500.0));
        assert_eq!(Value::parse(" "), Value::Missing);
        assert_eq!(Value::parse("nucleus"), Value::Text("nucleus".to_string()));
        assert!(matches!(Value::parse("nan"), Value::Float(f) if f.is_nan()));
    }

    #[test]
    fn test_from_csv() {
        let frame = ResultFrame::from_csv_reader(NUCLEI.as_bytes()).unwrap();
        assert_eq!(frame.n_rows(), 3);
        assert_eq!(frame.n_columns(), 4);
        let intensity = frame.column("Intensity_MeanIntensity_OrigGreen").unwrap();
        assert_eq!(intensity.values[1], Value::Missing);
        assert_eq!(frame.column("AreaShape_Area").unwrap().values[2], Value::Int(143));
    }

    #[test]
    fn test_ragged_csv_is_error() {
        let err = ResultFrame::from_csv_reader("a,b\n1,2\n3\n".as_bytes()).unwrap_err();
        assert!(matches!(err, Error::AnalysisExecution { .. }));
    }

    #[test]
    fn test_tag_with_unit() {
        let mut frame = ResultFrame::from_csv_reader(NUCLEI.as_bytes()).unwrap();
        frame.tag_with_unit(&unit()).unwrap();

        let names: Vec<_> = frame.column_names().collect();
        assert_eq!(&names[4..], ["Image", "Well", "Cell_Count"]);
        assert_eq!(frame.column("Cell_Count").unwrap().values, vec![Value::Int(3); 3]);
        assert_eq!(frame.row(0)[4], &Value::Text("171499".to_string()));
    }

    #[test]
    fn test_tag_dataset_unit_has_no_well() {
        let mut frame = ResultFrame::from_csv_reader(NUCLEI.as_bytes()).unwrap();
        let mut unit = unit();
        unit.well = None;
        frame.tag_with_unit(&unit).unwrap();
        assert!(frame.column("Well").is_none());
    }

    #[test]
    fn test_set_column_length_mismatch() {
        let mut frame = ResultFrame::from_csv_reader(NUCLEI.as_bytes()).unwrap();
        assert!(frame.set_column("Extra", vec![Value::Int(1)]).is_err());
    }

    #[test]
    fn test_from_csv_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("Nuclei.csv");
        std::fs::write(&path, NUCLEI).unwrap();
        assert_eq!(ResultFrame::from_csv_path(&path).unwrap().n_rows(), 3);
        assert!(ResultFrame::from_csv_path(&dir.path().join("missing.csv")).is_err());
    }
}
