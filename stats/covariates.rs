//! Subject covariate table.
//!
//! A tab-separated file with a header row and one row per subject. Rows whose
//! exclusion flag is non-zero are dropped at load time. Every column is read as
//! text first so subject identifiers keep leading zeros; numeric columns are
//! then cast to `f64` and validated for missing and non-finite values. A
//! nuisance column may hold sex as `F`/`M`, coded as 1/0.

use ahash::AHashMap;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CovariateError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the covariate table. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to a number. Offending value: '{value}'."
    )]
    ColumnWrongType { column_name: String, value: String },
    #[error("Missing values were found in the required column '{0}'.")]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Subject '{0}' appears more than once in the covariate table.")]
    DuplicateSubject(String),
    #[error("No subjects remain after applying the exclusion flag.")]
    NoSubjects,
}

/// Column names used when reading the table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CovariateColumns {
    pub subject: String,
    pub exclude: String,
    pub atlas: String,
    pub main: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nuisance1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nuisance2: Option<String>,
}

impl Default for CovariateColumns {
    fn default() -> Self {
        Self {
            subject: "participant_id".to_string(),
            exclude: "exclude".to_string(),
            atlas: "atlas".to_string(),
            main: "main".to_string(),
            nuisance1: None,
            nuisance2: None,
        }
    }
}

impl CovariateColumns {
    fn nuisance(&self) -> impl Iterator<Item = &str> {
        self.nuisance1
            .iter()
            .chain(self.nuisance2.iter())
            .map(String::as_str)
    }
}

#[derive(Clone, Debug)]
pub struct CovariateTable {
    ids: Vec<String>,
    atlas: Vec<bool>,
    main: Array1<f64>,
    /// `Subjects x k`, `k` at most two.
    nuisance: Array2<f64>,
    index: AHashMap<String, usize>,
}

fn string_column(df: &DataFrame, column_name: &str) -> Result<Vec<String>, CovariateError> {
    let column = df.column(column_name)?;
    if column.null_count() > 0 {
        return Err(CovariateError::MissingValuesFound(column_name.to_string()));
    }
    let casted = column.cast(&DataType::String)?;
    Ok(casted
        .str()?
        .into_iter()
        .map(|value| value.unwrap_or_default().trim().to_string())
        .collect())
}

fn parse_value(column_name: &str, text: &str, sex_coding: bool) -> Result<f64, CovariateError> {
    if sex_coding {
        match text {
            "F" => return Ok(1.0),
            "M" => return Ok(0.0),
            _ => {}
        }
    }
    let value: f64 = text.parse().map_err(|_| CovariateError::ColumnWrongType {
        column_name: column_name.to_string(),
        value: text.to_string(),
    })?;
    if !value.is_finite() {
        return Err(CovariateError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(value)
}

fn numeric_column(
    df: &DataFrame,
    column_name: &str,
    sex_coding: bool,
) -> Result<Vec<f64>, CovariateError> {
    let texts = string_column(df, column_name)?;
    if texts.iter().any(|t| t.is_empty()) {
        return Err(CovariateError::MissingValuesFound(column_name.to_string()));
    }
    texts
        .iter()
        .map(|text| parse_value(column_name, text, sex_coding))
        .collect()
}

impl CovariateTable {
    pub fn load(path: &Path, columns: &CovariateColumns) -> Result<Self, CovariateError> {
        log::info!("Loading covariates from '{}'", path.display());
        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_infer_schema_length(Some(0))
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        let present: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let required = [
            columns.subject.as_str(),
            columns.exclude.as_str(),
            columns.atlas.as_str(),
            columns.main.as_str(),
        ];
        for name in required.into_iter().chain(columns.nuisance()) {
            if !present.contains(name) {
                return Err(CovariateError::ColumnNotFound(name.to_string()));
            }
        }

        let ids = string_column(&df, &columns.subject)?;
        let exclude = numeric_column(&df, &columns.exclude, false)?;
        let atlas = numeric_column(&df, &columns.atlas, false)?;
        let main = numeric_column(&df, &columns.main, false)?;
        let nuisance = columns
            .nuisance()
            .map(|name| numeric_column(&df, name, true))
            .collect::<Result<Vec<_>, _>>()?;

        let keep: Vec<usize> = (0..ids.len()).filter(|&i| exclude[i] == 0.0).collect();
        log::info!(
            "{} of {} subjects kept after exclusion",
            keep.len(),
            ids.len()
        );
        if keep.is_empty() {
            return Err(CovariateError::NoSubjects);
        }

        let mut nuisance_matrix = Array2::zeros((keep.len(), nuisance.len()));
        for (row, &i) in keep.iter().enumerate() {
            for (col, values) in nuisance.iter().enumerate() {
                nuisance_matrix[[row, col]] = values[i];
            }
        }

        Self::from_parts(
            keep.iter().map(|&i| ids[i].clone()).collect(),
            keep.iter().map(|&i| atlas[i] == 1.0).collect(),
            keep.iter().map(|&i| main[i]).collect(),
            nuisance_matrix,
        )
    }

    /// Builds a table from already validated columns.
    pub fn from_parts(
        ids: Vec<String>,
        atlas: Vec<bool>,
        main: Array1<f64>,
        nuisance: Array2<f64>,
    ) -> Result<Self, CovariateError> {
        let mut index = AHashMap::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            if index.insert(id.clone(), i).is_some() {
                return Err(CovariateError::DuplicateSubject(id.clone()));
            }
        }
        if ids.is_empty() {
            return Err(CovariateError::NoSubjects);
        }
        Ok(Self {
            ids,
            atlas,
            main,
            nuisance,
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn main(&self) -> &Array1<f64> {
        &self.main
    }

    pub fn nuisance(&self) -> &Array2<f64> {
        &self.nuisance
    }

    pub fn is_atlas(&self, row: usize) -> bool {
        self.atlas[row]
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Rows flagged for atlas construction.
    pub fn atlas_rows(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| self.atlas[i]).collect()
    }

    /// Rows used for hypothesis testing: every row with `test_all`, otherwise
    /// the rows not used for the atlas.
    pub fn test_rows(&self, test_all: bool) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| test_all || !self.atlas[i])
            .collect()
    }

    /// Sub-table with the given rows, in that order.
    pub fn subset(&self, rows: &[usize]) -> Result<Self, CovariateError> {
        let mut nuisance = Array2::zeros((rows.len(), self.nuisance.ncols()));
        for (out, &row) in rows.iter().enumerate() {
            nuisance.row_mut(out).assign(&self.nuisance.row(row));
        }
        Self::from_parts(
            rows.iter().map(|&i| self.ids[i].clone()).collect(),
            rows.iter().map(|&i| self.atlas[i]).collect(),
            rows.iter().map(|&i| self.main[i]).collect(),
            nuisance,
        )
    }
}
