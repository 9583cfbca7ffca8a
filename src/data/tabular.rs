//! Tabular datasets loaded from CSV files, plus constructors for the three
//! fairness benchmarks (COMPAS, Communities & Crime, NYC stop-question-frisk).

use std::path::Path;

use candle_core::{Device, Tensor};
use ndarray::{Array1, Array2, ArrayView1};

use crate::data::dataset::LabeledDataset;
use crate::{FbError, Result};

/// In-memory tabular dataset: a dense feature matrix plus optional `s`/`y`
/// label vectors.
pub struct TabularDataset {
    x: Array2<f32>,
    s: Option<Array1<i64>>,
    y: Option<Array1<i64>>,
}

impl TabularDataset {
    pub fn from_arrays(
        x: Array2<f32>,
        s: Option<Array1<i64>>,
        y: Option<Array1<i64>>,
    ) -> Result<Self> {
        let n = x.nrows();
        if let Some(s) = &s {
            if s.len() != n {
                return Err(FbError::Data(format!(
                    "'s' has {} entries for {} samples",
                    s.len(),
                    n
                )));
            }
        }
        if let Some(y) = &y {
            if y.len() != n {
                return Err(FbError::Data(format!(
                    "'y' has {} entries for {} samples",
                    y.len(),
                    n
                )));
            }
        }
        Ok(Self { x, s, y })
    }

    /// Load from a headered CSV file.
    ///
    /// `sens_col` and `target_col` name the columns read as `s` and `y`;
    /// every other column is parsed as an f32 feature.
    pub fn from_csv<P: AsRef<Path>>(
        path: P,
        sens_col: Option<&str>,
        target_col: &str,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();

        let target_idx = headers
            .iter()
            .position(|h| h == target_col)
            .ok_or_else(|| {
                FbError::Data(format!("column '{target_col}' not found in {path:?}"))
            })?;
        let sens_idx = match sens_col {
            Some(name) => Some(headers.iter().position(|h| h == name).ok_or_else(|| {
                FbError::Data(format!("column '{name}' not found in {path:?}"))
            })?),
            None => None,
        };

        let mut features: Vec<f32> = Vec::new();
        let mut s_vals: Vec<i64> = Vec::new();
        let mut y_vals: Vec<i64> = Vec::new();
        let mut num_features = 0usize;
        let mut num_rows = 0usize;

        for record in reader.records() {
            let record = record?;
            let mut row = Vec::with_capacity(headers.len());
            for (col, field) in record.iter().enumerate() {
                let parse = |what: &str| -> Result<f64> {
                    field.trim().parse::<f64>().map_err(|_| {
                        FbError::Data(format!(
                            "row {num_rows}: cannot parse {what} value '{field}' in {path:?}"
                        ))
                    })
                };
                if col == target_idx {
                    y_vals.push(parse("target")? as i64);
                } else if Some(col) == sens_idx {
                    s_vals.push(parse("sensitive")? as i64);
                } else {
                    row.push(parse("feature")? as f32);
                }
            }
            if num_rows == 0 {
                num_features = row.len();
            } else if row.len() != num_features {
                return Err(FbError::Data(format!(
                    "row {num_rows} has {} features, expected {num_features}",
                    row.len()
                )));
            }
            features.extend(row);
            num_rows += 1;
        }

        if num_rows == 0 {
            return Err(FbError::Data(format!("{path:?} contains no data rows")));
        }

        log::info!(
            "Loaded tabular dataset from {path:?}: {num_rows} rows, {num_features} features"
        );

        let x = Array2::from_shape_vec((num_rows, num_features), features)
            .map_err(|e| FbError::Data(format!("feature matrix shape error: {e}")))?;
        Self::from_arrays(
            x,
            sens_idx.map(|_| Array1::from_vec(s_vals)),
            Some(Array1::from_vec(y_vals)),
        )
    }

    pub fn num_features(&self) -> usize {
        self.x.ncols()
    }
}

impl LabeledDataset for TabularDataset {
    fn len(&self) -> usize {
        self.x.nrows()
    }

    fn s(&self) -> Option<ArrayView1<'_, i64>> {
        self.s.as_ref().map(|s| s.view())
    }

    fn y(&self) -> Option<ArrayView1<'_, i64>> {
        self.y.as_ref().map(|y| y.view())
    }

    fn load_input(&self, index: usize, device: &Device) -> Result<Tensor> {
        let row = self.x.row(index);
        let vals: Vec<f32> = row.to_vec();
        Ok(Tensor::from_slice(&vals, (vals.len(),), device)?)
    }
}

/// Sensitive-feature choices for the COMPAS recidivism dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompasSens {
    Sex,
    Race,
    RaceSex,
}

impl CompasSens {
    pub fn column(&self) -> &'static str {
        match self {
            CompasSens::Sex => "sex",
            CompasSens::Race => "race",
            CompasSens::RaceSex => "race_sex",
        }
    }
}

/// Sensitive-feature choices for the Communities & Crime dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CrimeSens {
    RaceBinary,
}

impl CrimeSens {
    pub fn column(&self) -> &'static str {
        match self {
            CrimeSens::RaceBinary => "race_binary",
        }
    }
}

/// Sensitive-feature choices for the NYC stop-question-frisk dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SqfSens {
    Sex,
    Race,
    RaceSex,
}

impl SqfSens {
    pub fn column(&self) -> &'static str {
        match self {
            SqfSens::Sex => "sex",
            SqfSens::Race => "race",
            SqfSens::RaceSex => "race_sex",
        }
    }
}

/// COMPAS recidivism dataset; `y` is two-year recidivism.
pub fn compas<P: AsRef<Path>>(path: P, sens: CompasSens) -> Result<TabularDataset> {
    TabularDataset::from_csv(path, Some(sens.column()), "two_year_recid")
}

/// Communities & Crime dataset; `y` is the binarized high-crime indicator.
pub fn crime<P: AsRef<Path>>(path: P, sens: CrimeSens) -> Result<TabularDataset> {
    TabularDataset::from_csv(path, Some(sens.column()), "high_crime")
}

/// NYC stop-question-frisk dataset; `y` indicates whether a weapon was found.
pub fn sqf<P: AsRef<Path>>(path: P, sens: SqfSens) -> Result<TabularDataset> {
    TabularDataset::from_csv(path, Some(sens.column()), "weapon")
}
