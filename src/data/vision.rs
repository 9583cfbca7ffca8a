//! Vision datasets. Currently CelebA, read from an already-downloaded
//! directory layout (`img_align_celeba/` plus the attribute and partition
//! annotation files).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use ndarray::{Array1, ArrayView1};

use crate::data::dataset::LabeledDataset;
use crate::{FbError, Result};

/// The 40 binary face attributes annotated in CelebA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CelebAttr {
    FiveOClockShadow,
    ArchedEyebrows,
    Attractive,
    BagsUnderEyes,
    Bald,
    Bangs,
    BigLips,
    BigNose,
    BlackHair,
    BlondHair,
    Blurry,
    BrownHair,
    BushyEyebrows,
    Chubby,
    DoubleChin,
    Eyeglasses,
    Goatee,
    GrayHair,
    HeavyMakeup,
    HighCheekbones,
    Male,
    MouthSlightlyOpen,
    Mustache,
    NarrowEyes,
    NoBeard,
    OvalFace,
    PaleSkin,
    PointyNose,
    RecedingHairline,
    RosyCheeks,
    Sideburns,
    Smiling,
    StraightHair,
    WavyHair,
    WearingEarrings,
    WearingHat,
    WearingLipstick,
    WearingNecklace,
    WearingNecktie,
    Young,
}

impl CelebAttr {
    /// Column name as it appears in `list_attr_celeba.txt`.
    pub fn header_name(&self) -> &'static str {
        match self {
            CelebAttr::FiveOClockShadow => "5_o_Clock_Shadow",
            CelebAttr::ArchedEyebrows => "Arched_Eyebrows",
            CelebAttr::Attractive => "Attractive",
            CelebAttr::BagsUnderEyes => "Bags_Under_Eyes",
            CelebAttr::Bald => "Bald",
            CelebAttr::Bangs => "Bangs",
            CelebAttr::BigLips => "Big_Lips",
            CelebAttr::BigNose => "Big_Nose",
            CelebAttr::BlackHair => "Black_Hair",
            CelebAttr::BlondHair => "Blond_Hair",
            CelebAttr::Blurry => "Blurry",
            CelebAttr::BrownHair => "Brown_Hair",
            CelebAttr::BushyEyebrows => "Bushy_Eyebrows",
            CelebAttr::Chubby => "Chubby",
            CelebAttr::DoubleChin => "Double_Chin",
            CelebAttr::Eyeglasses => "Eyeglasses",
            CelebAttr::Goatee => "Goatee",
            CelebAttr::GrayHair => "Gray_Hair",
            CelebAttr::HeavyMakeup => "Heavy_Makeup",
            CelebAttr::HighCheekbones => "High_Cheekbones",
            CelebAttr::Male => "Male",
            CelebAttr::MouthSlightlyOpen => "Mouth_Slightly_Open",
            CelebAttr::Mustache => "Mustache",
            CelebAttr::NarrowEyes => "Narrow_Eyes",
            CelebAttr::NoBeard => "No_Beard",
            CelebAttr::OvalFace => "Oval_Face",
            CelebAttr::PaleSkin => "Pale_Skin",
            CelebAttr::PointyNose => "Pointy_Nose",
            CelebAttr::RecedingHairline => "Receding_Hairline",
            CelebAttr::RosyCheeks => "Rosy_Cheeks",
            CelebAttr::Sideburns => "Sideburns",
            CelebAttr::Smiling => "Smiling",
            CelebAttr::StraightHair => "Straight_Hair",
            CelebAttr::WavyHair => "Wavy_Hair",
            CelebAttr::WearingEarrings => "Wearing_Earrings",
            CelebAttr::WearingHat => "Wearing_Hat",
            CelebAttr::WearingLipstick => "Wearing_Lipstick",
            CelebAttr::WearingNecklace => "Wearing_Necklace",
            CelebAttr::WearingNecktie => "Wearing_Necktie",
            CelebAttr::Young => "Young",
        }
    }
}

/// The canonical CelebA train/val/test partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CelebASplit {
    Train = 0,
    Val = 1,
    Test = 2,
}

const IMAGE_DIR: &str = "img_align_celeba";
const ATTR_FILE: &str = "list_attr_celeba.txt";
const PARTITION_FILE: &str = "list_eval_partition.txt";

/// CelebA face-attribute dataset.
///
/// `s` and `y` are two of the 40 binary attributes, remapped from the
/// file's -1/1 encoding to 0/1. Images are decoded lazily to CHW f32
/// tensors in `[0, 1]`.
pub struct CelebA {
    image_dir: PathBuf,
    filenames: Vec<String>,
    s: Array1<i64>,
    y: Array1<i64>,
}

impl CelebA {
    /// Read annotations under `root`, keeping only `split` if one is given.
    pub fn new<P: AsRef<Path>>(
        root: P,
        sens_attr: CelebAttr,
        target_attr: CelebAttr,
        split: Option<CelebASplit>,
    ) -> Result<Self> {
        let root = root.as_ref();
        let attr_path = root.join(ATTR_FILE);
        let partition_path = root.join(PARTITION_FILE);
        let image_dir = root.join(IMAGE_DIR);
        for path in [&attr_path, &partition_path] {
            if !path.exists() {
                return Err(FbError::Data(format!(
                    "missing CelebA annotation file {path:?}; the dataset must be \
                     downloaded beforehand"
                )));
            }
        }

        let partition = Self::parse_partition(&partition_path)?;
        let (filenames, s, y) =
            Self::parse_attrs(&attr_path, sens_attr, target_attr, split, &partition)?;

        log::info!(
            "Loaded CelebA annotations: {} images, s = {}, y = {}",
            filenames.len(),
            sens_attr.header_name(),
            target_attr.header_name()
        );

        Ok(Self {
            image_dir,
            filenames,
            s: Array1::from_vec(s),
            y: Array1::from_vec(y),
        })
    }

    fn parse_partition(path: &Path) -> Result<HashMap<String, i64>> {
        let content = std::fs::read_to_string(path)?;
        let mut partition = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let mut fields = line.split_whitespace();
            let (Some(name), Some(split)) = (fields.next(), fields.next()) else {
                continue;
            };
            let split: i64 = split.parse().map_err(|_| {
                FbError::Data(format!(
                    "line {}: malformed partition entry '{line}'",
                    lineno + 1
                ))
            })?;
            partition.insert(name.to_string(), split);
        }
        Ok(partition)
    }

    #[allow(clippy::type_complexity)]
    fn parse_attrs(
        path: &Path,
        sens_attr: CelebAttr,
        target_attr: CelebAttr,
        split: Option<CelebASplit>,
        partition: &HashMap<String, i64>,
    ) -> Result<(Vec<String>, Vec<i64>, Vec<i64>)> {
        let content = std::fs::read_to_string(path)?;
        let mut lines = content.lines();

        // line 1: image count, line 2: the 40 attribute names
        let _count = lines.next();
        let header = lines
            .next()
            .ok_or_else(|| FbError::Data(format!("{path:?} is missing its header line")))?;
        let columns: Vec<&str> = header.split_whitespace().collect();
        let col_of = |attr: CelebAttr| -> Result<usize> {
            columns
                .iter()
                .position(|&c| c == attr.header_name())
                .ok_or_else(|| {
                    FbError::Data(format!(
                        "attribute '{}' not found in {path:?}",
                        attr.header_name()
                    ))
                })
        };
        let sens_col = col_of(sens_attr)?;
        let target_col = col_of(target_attr)?;

        let mut filenames = Vec::new();
        let mut s = Vec::new();
        let mut y = Vec::new();
        for (lineno, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let name = fields
                .next()
                .ok_or_else(|| FbError::Data(format!("line {}: empty record", lineno + 3)))?;
            if let Some(wanted) = split {
                if partition.get(name).copied() != Some(wanted as i64) {
                    continue;
                }
            }
            let values: Vec<&str> = fields.collect();
            let parse = |col: usize| -> Result<i64> {
                let raw: i64 = values
                    .get(col)
                    .ok_or_else(|| {
                        FbError::Data(format!("line {}: truncated record", lineno + 3))
                    })?
                    .parse()
                    .map_err(|_| {
                        FbError::Data(format!("line {}: malformed record", lineno + 3))
                    })?;
                // the file encodes absent/present as -1/1
                Ok(((raw + 1) / 2).clamp(0, 1))
            };
            s.push(parse(sens_col)?);
            y.push(parse(target_col)?);
            filenames.push(name.to_string());
        }

        if filenames.is_empty() {
            return Err(FbError::Data(format!(
                "no CelebA records matched the requested split in {path:?}"
            )));
        }
        Ok((filenames, s, y))
    }

    pub fn filename(&self, index: usize) -> &str {
        &self.filenames[index]
    }
}

impl LabeledDataset for CelebA {
    fn len(&self) -> usize {
        self.filenames.len()
    }

    fn s(&self) -> Option<ArrayView1<'_, i64>> {
        Some(self.s.view())
    }

    fn y(&self) -> Option<ArrayView1<'_, i64>> {
        Some(self.y.view())
    }

    fn load_input(&self, index: usize, device: &Device) -> Result<Tensor> {
        let path = self.image_dir.join(&self.filenames[index]);
        let img = image::open(&path)
            .map_err(|e| FbError::Data(format!("cannot decode image {path:?}: {e}")))?
            .to_rgb8();
        let (w, h) = (img.width() as usize, img.height() as usize);
        let raw = img.into_raw();

        // HWC u8 -> CHW f32 in [0, 1]
        let mut data = vec![0f32; 3 * h * w];
        for row in 0..h {
            for col in 0..w {
                for c in 0..3 {
                    data[c * h * w + row * w + col] =
                        raw[(row * w + col) * 3 + c] as f32 / 255.0;
                }
            }
        }
        Ok(Tensor::from_vec(data, (3, h, w), device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_annotations(dir: &Path) -> Result<()> {
        std::fs::write(
            dir.join(ATTR_FILE),
            "3\n5_o_Clock_Shadow Male Smiling Young\n\
             000001.jpg -1  1 -1  1\n\
             000002.jpg  1 -1  1  1\n\
             000003.jpg -1 -1  1 -1\n",
        )?;
        std::fs::write(
            dir.join(PARTITION_FILE),
            "000001.jpg 0\n000002.jpg 0\n000003.jpg 2\n",
        )?;
        Ok(())
    }

    #[test]
    fn test_parses_attributes_to_binary() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_annotations(dir.path())?;
        let ds = CelebA::new(dir.path(), CelebAttr::Male, CelebAttr::Smiling, None)?;
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.s().unwrap().to_vec(), vec![1, 0, 0]);
        assert_eq!(ds.y().unwrap().to_vec(), vec![0, 1, 1]);
        Ok(())
    }

    #[test]
    fn test_split_filter() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_annotations(dir.path())?;
        let ds = CelebA::new(
            dir.path(),
            CelebAttr::Male,
            CelebAttr::Smiling,
            Some(CelebASplit::Test),
        )?;
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.filename(0), "000003.jpg");
        Ok(())
    }

    #[test]
    fn test_missing_files_are_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(CelebA::new(dir.path(), CelebAttr::Male, CelebAttr::Young, None).is_err());
        Ok(())
    }

    #[test]
    fn test_unknown_attribute_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(ATTR_FILE), "1\nMale\n000001.jpg 1\n")?;
        std::fs::write(dir.path().join(PARTITION_FILE), "000001.jpg 0\n")?;
        assert!(CelebA::new(dir.path(), CelebAttr::Male, CelebAttr::Smiling, None).is_err());
        Ok(())
    }
}
