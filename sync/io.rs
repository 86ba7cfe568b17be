//! Tab-separated text input and output.
//!
//! Subject matrices are stored one file per subject, one row per time point
//! and one column per vertex, without a header. Result fields are written as
//! a header row followed by one row per vertex.

use ndarray::{Array2, ArrayView1, ArrayView2};
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::normalize::normalize_data;
use crate::stats::LabelMask;
use crate::types::{SubjectCohort, SubjectSource, SyncError, check_memory_budget, ensure_shape};

#[derive(Error, Debug)]
pub enum TextIoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed delimited file: {0}")]
    Csv(#[from] csv::Error),
    #[error("'{path}' row {row} column {column}: '{value}' is not a number.")]
    NotANumber {
        path: PathBuf,
        row: usize,
        column: usize,
        value: String,
    },
    #[error("'{0}' contains no values.")]
    Empty(PathBuf),
    #[error("Column '{name}' has {found} values but {expected} rows are being written.")]
    ColumnLength {
        name: String,
        expected: usize,
        found: usize,
    },
}

fn parse_field(path: &Path, row: usize, column: usize, text: &str) -> Result<f64, TextIoError> {
    text.parse().map_err(|_| TextIoError::NotANumber {
        path: path.to_path_buf(),
        row,
        column,
        value: text.to_string(),
    })
}

/// Reads a headerless tab-separated matrix. Every row must have the same
/// number of fields.
pub fn read_matrix(path: &Path) -> Result<Array2<f64>, TextIoError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut values = Vec::new();
    let mut rows = 0;
    for record in reader.records() {
        let record = record?;
        for (column, field) in record.iter().enumerate() {
            values.push(parse_field(path, rows, column, field)?);
        }
        rows += 1;
    }
    if rows == 0 || values.is_empty() {
        return Err(TextIoError::Empty(path.to_path_buf()));
    }
    let columns = values.len() / rows;
    Array2::from_shape_vec((rows, columns), values).map_err(|e| {
        TextIoError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    })
}

/// Reads one label per vertex. Labels may be split over rows and columns in
/// any layout; they are taken in reading order.
pub fn read_label_mask(path: &Path) -> Result<LabelMask, TextIoError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut labels = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        for (column, field) in record.iter().enumerate().filter(|(_, f)| !f.is_empty()) {
            labels.push(parse_field(path, row, column, field)?);
        }
    }
    if labels.is_empty() {
        return Err(TextIoError::Empty(path.to_path_buf()));
    }
    let mask = LabelMask::from_labels(&labels);
    log::info!(
        "Loaded mask with {} of {} vertices inside",
        mask.count_inside(),
        mask.len()
    );
    Ok(mask)
}

/// Subjects read from `<dir>/<id><extension>` on demand.
///
/// Every load reads, truncates and normalizes the file again, so the
/// resident footprint stays at a few subjects regardless of cohort size.
#[derive(Clone, Debug)]
pub struct TextSubjectSource {
    paths: Vec<PathBuf>,
    time_points: Option<usize>,
    dims: (usize, usize),
}

impl TextSubjectSource {
    /// Resolves the file of every subject and reads the first one to fix the
    /// shared dimensions.
    pub fn open(
        dir: &Path,
        ids: &[String],
        extension: &str,
        time_points: Option<usize>,
    ) -> Result<Self, SyncError> {
        let paths: Vec<PathBuf> = ids
            .iter()
            .map(|id| dir.join(format!("{id}{extension}")))
            .collect();
        if let Some((subject, missing)) = paths.iter().enumerate().find(|(_, p)| !p.is_file()) {
            return Err(SyncError::Source {
                subject,
                message: format!("file '{}' does not exist", missing.display()),
            });
        }
        let mut source = Self {
            paths,
            time_points,
            dims: (0, 0),
        };
        if !source.paths.is_empty() {
            source.dims = source.read(0)?.dim();
        }
        log::info!(
            "Found {} subject files in '{}' with {} time points and {} vertices",
            source.paths.len(),
            dir.display(),
            source.dims.0,
            source.dims.1
        );
        Ok(source)
    }

    fn read(&self, index: usize) -> Result<Array2<f64>, SyncError> {
        let path = self.paths.get(index).ok_or_else(|| SyncError::Source {
            subject: index,
            message: format!("index out of range for {} subject files", self.paths.len()),
        })?;
        let raw = read_matrix(path).map_err(|e| SyncError::Source {
            subject: index,
            message: e.to_string(),
        })?;
        let view = match self.time_points {
            Some(required) if raw.nrows() < required => {
                return Err(SyncError::InsufficientTimePoints {
                    subject: index,
                    found: raw.nrows(),
                    required,
                });
            }
            Some(required) => raw.slice(ndarray::s![..required, ..]),
            None => raw.view(),
        };
        Ok(normalize_data(view).data)
    }

    /// Reads every subject into memory after checking the cohort against
    /// `budget_bytes`.
    pub fn load_cohort(&self, budget_bytes: usize) -> Result<SubjectCohort, SyncError> {
        check_memory_budget(self.paths.len(), self.dims.0, self.dims.1, budget_bytes)?;
        let subjects = (0..self.paths.len())
            .map(|index| self.load(index).map(Cow::into_owned))
            .collect::<Result<Vec<_>, _>>()?;
        SubjectCohort::new(subjects)
    }
}

impl SubjectSource for TextSubjectSource {
    fn n_subjects(&self) -> usize {
        self.paths.len()
    }

    fn dims(&self) -> (usize, usize) {
        self.dims
    }

    fn load(&self, index: usize) -> Result<Cow<'_, Array2<f64>>, SyncError> {
        let matrix = self.read(index)?;
        ensure_shape("subject file", self.dims, matrix.dim())?;
        Ok(Cow::Owned(matrix))
    }
}

/// Writes a headerless tab-separated matrix.
pub fn write_matrix(path: &Path, matrix: ArrayView2<f64>) -> Result<(), TextIoError> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut line_buffer = String::with_capacity(matrix.ncols() * 24);
    let mut ryu_buffer = ryu::Buffer::new();
    for row in matrix.rows() {
        line_buffer.clear();
        for (i, &value) in row.iter().enumerate() {
            if i > 0 {
                line_buffer.push('\t');
            }
            line_buffer.push_str(ryu_buffer.format(value));
        }
        writeln!(writer, "{line_buffer}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes named columns of equal length under a header row.
pub fn write_columns(path: &Path, columns: &[(&str, ArrayView1<f64>)]) -> Result<(), TextIoError> {
    let rows = columns.first().map_or(0, |(_, c)| c.len());
    if let Some((name, column)) = columns.iter().find(|(_, c)| c.len() != rows) {
        return Err(TextIoError::ColumnLength {
            name: name.to_string(),
            expected: rows,
            found: column.len(),
        });
    }

    let mut writer = BufWriter::new(File::create(path)?);
    let header: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
    writeln!(writer, "{}", header.join("\t"))?;

    let mut line_buffer = String::with_capacity(columns.len() * 24);
    let mut ryu_buffer = ryu::Buffer::new();
    for row in 0..rows {
        line_buffer.clear();
        for (i, (_, column)) in columns.iter().enumerate() {
            if i > 0 {
                line_buffer.push('\t');
            }
            line_buffer.push_str(ryu_buffer.format(column[row]));
        }
        writeln!(writer, "{line_buffer}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes `id<TAB>value` rows, used for per-subject summaries.
pub fn write_labeled_values(
    path: &Path,
    header: (&str, &str),
    rows: impl IntoIterator<Item = (String, f64)>,
) -> Result<(), TextIoError> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "{}\t{}", header.0, header.1)?;
    let mut ryu_buffer = ryu::Buffer::new();
    for (label, value) in rows {
        writeln!(writer, "{label}\t{}", ryu_buffer.format(value))?;
    }
    writer.flush()?;
    Ok(())
}
