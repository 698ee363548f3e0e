//! Feature extraction: the boundary to the recognition models.
//!
//! Workers call a [`FeatureExtractor`] once per photo. Extractors return
//! `Ok(vec![])` when nothing was found and `Err` only when the photo could not
//! be analysed at all; the worker turns the latter into a failed result.

pub mod detector;
pub mod ocr;

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::config::{Config, OcrConfig};

pub use detector::FaceDetector;
pub use ocr::CommandOcr;

/// Text read from a bib by OCR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BibRead {
    pub text: String,
    pub confidence: f32,
}

/// A face found in a photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRead {
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

pub trait FeatureExtractor {
    fn detect_faces(&mut self, image: &DynamicImage) -> Result<Vec<FaceRead>>;

    /// `image` is upright and downscaled, the same pixels face detection
    /// sees. `source` is the file it was loaded from, for logging.
    fn detect_bibs(&mut self, image: &DynamicImage, source: &Path) -> Result<Vec<BibRead>>;
}

impl<E: FeatureExtractor + ?Sized> FeatureExtractor for Box<E> {
    fn detect_faces(&mut self, image: &DynamicImage) -> Result<Vec<FaceRead>> {
        (**self).detect_faces(image)
    }

    fn detect_bibs(&mut self, image: &DynamicImage, source: &Path) -> Result<Vec<BibRead>> {
        (**self).detect_bibs(image, source)
    }
}

/// Keeps only plausible race numbers.
#[derive(Debug, Clone, Copy)]
pub struct BibFilter {
    pub min_size: usize,
    pub max_size: usize,
    pub min_confidence: f32,
}

impl From<&OcrConfig> for BibFilter {
    fn from(config: &OcrConfig) -> Self {
        Self {
            min_size: config.min_size,
            max_size: config.max_size,
            min_confidence: config.confidence,
        }
    }
}

impl BibFilter {
    pub fn accepts(&self, read: &BibRead) -> bool {
        let len = read.text.chars().count();
        !read.text.is_empty()
            && read.text.chars().all(|c| c.is_ascii_digit())
            && (self.min_size..=self.max_size).contains(&len)
            && read.confidence >= self.min_confidence
    }

    /// Filter OCR output, collapsing repeated reads of the same number to
    /// the most confident one. Output is ordered by text.
    pub fn apply(&self, reads: Vec<BibRead>) -> Vec<BibRead> {
        let mut best: BTreeMap<String, f32> = BTreeMap::new();
        for read in reads.into_iter().filter(|r| self.accepts(r)) {
            let entry = best.entry(read.text).or_insert(read.confidence);
            if read.confidence > *entry {
                *entry = read.confidence;
            }
        }
        best.into_iter()
            .map(|(text, confidence)| BibRead { text, confidence })
            .collect()
    }
}

pub fn filter_faces(faces: Vec<FaceRead>, min_confidence: f32) -> Vec<FaceRead> {
    faces
        .into_iter()
        .filter(|f| f.confidence >= min_confidence)
        .collect()
}

/// The production extractor: ONNX face models plus an optional OCR command.
pub struct ModelExtractor {
    faces: FaceDetector,
    ocr: Option<CommandOcr>,
}

impl ModelExtractor {
    pub fn from_config(config: &Config) -> Result<Self> {
        let faces = FaceDetector::new(&config.faces).context("Failed to load face models")?;
        let ocr = CommandOcr::from_config(&config.ocr);
        if ocr.is_none() {
            tracing::warn!("No OCR command configured, bib extraction disabled");
        }
        Ok(Self { faces, ocr })
    }
}

impl FeatureExtractor for ModelExtractor {
    fn detect_faces(&mut self, image: &DynamicImage) -> Result<Vec<FaceRead>> {
        let detected = self.faces.detect(image)?;
        Ok(detected
            .into_iter()
            .map(|face| FaceRead {
                embedding: face.embedding,
                confidence: face.confidence,
            })
            .collect())
    }

    fn detect_bibs(&mut self, image: &DynamicImage, source: &Path) -> Result<Vec<BibRead>> {
        match self.ocr {
            Some(ref ocr) => ocr
                .read_image(image)
                .with_context(|| format!("OCR failed for {}", source.display())),
            None => Ok(Vec::new()),
        }
    }
}

/// Convert EXIF orientation value (1-8) to rotation degrees (0, 90, 180, 270)
fn exif_orientation_to_degrees(orientation: u32) -> u32 {
    match orientation {
        6 => 90,  // Rotate 90 CW
        3 => 180, // Rotate 180
        8 => 270, // Rotate 90 CCW
        _ => 0,   // Normal (1) or other values
    }
}

fn read_exif_rotation(path: &Path) -> u32 {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return 0,
    };

    let mut reader = BufReader::new(file);
    let exif = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(e) => e,
        Err(_) => return 0,
    };

    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .map(exif_orientation_to_degrees)
        .unwrap_or(0)
}

/// Load a photo upright, honouring its EXIF orientation.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    let img = image::open(path).map_err(|e| anyhow!("Failed to load image {}: {}", path.display(), e))?;
    Ok(match read_exif_rotation(path) {
        90 => img.rotate90(),
        180 => img.rotate180(),
        270 => img.rotate270(),
        _ => img,
    })
}

/// Shrink images wider than `max_width`, keeping the aspect ratio.
pub fn downscale(img: DynamicImage, max_width: u32) -> DynamicImage {
    let width = img.width();
    if max_width == 0 || width <= max_width {
        return img;
    }
    let height = ((img.height() as u64 * max_width as u64) / width as u64).max(1) as u32;
    img.resize_exact(max_width, height, image::imageops::FilterType::Triangle)
}
