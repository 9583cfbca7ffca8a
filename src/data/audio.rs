//! Audio datasets. Currently the Ecoacoustics soundscape corpus, read as
//! preprocessed spectrogram segments plus a metadata CSV.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_npy::ReadNpyExt;

use crate::data::dataset::LabeledDataset;
use crate::{FbError, Result};

/// Which soundscape annotation is used as the target label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundscapeAttr {
    Habitat,
    Site,
}

impl SoundscapeAttr {
    fn column(&self) -> &'static str {
        match self {
            SoundscapeAttr::Habitat => "habitat",
            SoundscapeAttr::Site => "site",
        }
    }
}

const METADATA_FILENAME: &str = "metadata.csv";
const PROCESSED_DIR: &str = "processed_audio";

/// Ecoacoustics dataset.
///
/// Expects `root/metadata.csv` with at least `filename`, `habitat` and
/// `site` columns, and `root/processed_audio/<filename>` spectrogram
/// segments stored as 2-D f32 `.npy` arrays. Audio decoding and
/// spectrogram extraction happen upstream; this dataset only reads the
/// preprocessed segments.
pub struct Ecoacoustics {
    segment_dir: PathBuf,
    filenames: Vec<String>,
    y: Array1<i64>,
    class_names: Vec<String>,
}

impl Ecoacoustics {
    pub fn new<P: AsRef<Path>>(root: P, target_attr: SoundscapeAttr) -> Result<Self> {
        let root = root.as_ref();
        let metadata_path = root.join(METADATA_FILENAME);
        if !metadata_path.exists() {
            return Err(FbError::Data(format!(
                "missing metadata file {metadata_path:?}; the dataset must be downloaded \
                 and preprocessed beforehand"
            )));
        }
        let segment_dir = root.join(PROCESSED_DIR);

        let mut reader = csv::Reader::from_path(&metadata_path)?;
        let headers = reader.headers()?.clone();
        let file_col = headers
            .iter()
            .position(|h| h == "filename")
            .ok_or_else(|| {
                FbError::Data(format!("column 'filename' not found in {metadata_path:?}"))
            })?;
        let target_col = headers
            .iter()
            .position(|h| h == target_attr.column())
            .ok_or_else(|| {
                FbError::Data(format!(
                    "column '{}' not found in {metadata_path:?}",
                    target_attr.column()
                ))
            })?;

        let mut filenames = Vec::new();
        let mut raw_labels = Vec::new();
        for record in reader.records() {
            let record = record?;
            let name = record.get(file_col).unwrap_or("").trim();
            let label = record.get(target_col).unwrap_or("").trim();
            if name.is_empty() || label.is_empty() {
                return Err(FbError::Data(format!(
                    "empty filename or label in {metadata_path:?}"
                )));
            }
            filenames.push(name.to_string());
            raw_labels.push(label.to_string());
        }
        if filenames.is_empty() {
            return Err(FbError::Data(format!(
                "{metadata_path:?} contains no data rows"
            )));
        }

        // Stable label encoding: values numbered in order of first appearance.
        let mut encoding: BTreeMap<String, i64> = BTreeMap::new();
        for label in &raw_labels {
            let next = encoding.len() as i64;
            encoding.entry(label.clone()).or_insert(next);
        }
        let mut by_name: Vec<(String, i64)> =
            encoding.iter().map(|(k, &v)| (k.clone(), v)).collect();
        by_name.sort_by_key(|(_, v)| *v);
        let class_names = by_name.into_iter().map(|(k, _)| k).collect();
        let y = raw_labels.iter().map(|l| encoding[l]).collect::<Vec<_>>();

        log::info!(
            "Loaded Ecoacoustics metadata: {} segments, {} '{}' classes",
            filenames.len(),
            encoding.len(),
            target_attr.column()
        );

        Ok(Self {
            segment_dir,
            filenames,
            y: Array1::from_vec(y),
            class_names,
        })
    }

    /// Class name for an encoded label value.
    pub fn class_name(&self, label: i64) -> Option<&str> {
        self.class_names.get(label as usize).map(|s| s.as_str())
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }
}

impl LabeledDataset for Ecoacoustics {
    fn len(&self) -> usize {
        self.filenames.len()
    }

    fn y(&self) -> Option<ArrayView1<'_, i64>> {
        Some(self.y.view())
    }

    fn load_input(&self, index: usize, device: &Device) -> Result<Tensor> {
        let path = self.segment_dir.join(&self.filenames[index]);
        let file = File::open(&path)?;
        let specgram = <Array2<f32> as ReadNpyExt>::read_npy(file).map_err(|e| {
            FbError::Data(format!("cannot read spectrogram {path:?}: {e}"))
        })?;
        let (freq, time) = specgram.dim();
        let data: Vec<f32> = specgram.iter().copied().collect();
        // single-channel spectrogram: (1, freq_bins, time_frames)
        Ok(Tensor::from_vec(data, (1, freq, time), device)?)
    }
}
