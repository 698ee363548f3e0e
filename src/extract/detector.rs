use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};

use crate::config::FacesConfig;

const DETECTION_MODEL_FILE: &str = "ultraface-320.onnx";
const DETECTION_MODEL_URL: &str =
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx";
const EMBEDDING_MODEL_FILE: &str = "arcface-resnet100.onnx";
const EMBEDDING_MODEL_URL: &str =
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx";

/// Anchors below this score never leave the detector; callers apply their own,
/// stricter threshold.
const CANDIDATE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// A detected face with bounding box and embedding
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

/// UltraFace detection plus ArcFace embeddings.
///
/// Each worker owns one detector; sessions are never shared between
/// processes or threads.
pub struct FaceDetector {
    detection: Session,
    embedding: Session,
}

fn get_models_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .ok_or_else(|| anyhow!("Could not find local data directory"))?;
    let models_dir = data_dir.join("bibfinder").join("models");
    std::fs::create_dir_all(&models_dir)?;
    Ok(models_dir)
}

/// Download a model file if it doesn't exist
fn ensure_model(filename: &str, url: &str) -> Result<PathBuf> {
    let models_dir = get_models_dir()?;
    let model_path = models_dir.join(filename);

    if !model_path.exists() {
        tracing::info!(model = %filename, "Downloading model...");
        let response = ureq::get(url)
            .call()
            .map_err(|e| anyhow!("Failed to download model: {}", e))?;

        // Write to a temporary name so an interrupted download is not mistaken for a model.
        let partial = model_path.with_extension("part");
        let mut file = std::fs::File::create(&partial)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        std::fs::rename(&partial, &model_path)?;
        tracing::info!(model = %filename, path = ?model_path, "Model downloaded");
    }

    Ok(model_path)
}

fn resolve_model(configured: Option<&Path>, filename: &str, url: &str) -> Result<PathBuf> {
    match configured {
        Some(path) if path.exists() => Ok(path.to_path_buf()),
        Some(path) => Err(anyhow!("Model file not found: {}", path.display())),
        None => ensure_model(filename, url),
    }
}

fn open_session(path: &Path, intra_threads: usize) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads.max(1))?
        .commit_from_file(path)
        .with_context(|| format!("Failed to load ONNX model {}", path.display()))?;
    Ok(session)
}

impl FaceDetector {
    pub fn new(config: &FacesConfig) -> Result<Self> {
        let detection_path = resolve_model(
            config.detection_model.as_deref(),
            DETECTION_MODEL_FILE,
            DETECTION_MODEL_URL,
        )?;
        let embedding_path = resolve_model(
            config.embedding_model.as_deref(),
            EMBEDDING_MODEL_FILE,
            EMBEDDING_MODEL_URL,
        )?;

        let detection = open_session(&detection_path, config.intra_threads)?;
        let embedding = open_session(&embedding_path, config.intra_threads)?;
        tracing::debug!(?detection_path, ?embedding_path, "Face models loaded");

        Ok(Self { detection, embedding })
    }

    /// Detect faces and compute an embedding for each.
    pub fn detect(&mut self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let (orig_width, orig_height) = img.dimensions();
        let face_boxes = run_ultraface_detection(&mut self.detection, img)?;

        let mut detected_faces = Vec::with_capacity(face_boxes.len());
        for (bbox, confidence) in face_boxes {
            if bbox.width <= 0 || bbox.height <= 0 {
                continue;
            }

            let face_crop = crop_face(img, &bbox, orig_width, orig_height);
            let embedding = run_arcface_embedding(&mut self.embedding, &face_crop)?;

            detected_faces.push(DetectedFace {
                bbox,
                embedding,
                confidence,
            });
        }

        Ok(detected_faces)
    }
}

/// Run UltraFace detection model
fn run_ultraface_detection(session: &mut Session, img: &DynamicImage) -> Result<Vec<(BoundingBox, f32)>> {
    const INPUT_WIDTH: u32 = 320;
    const INPUT_HEIGHT: u32 = 240;

    let (orig_width, orig_height) = img.dimensions();

    let resized = img.resize_exact(INPUT_WIDTH, INPUT_HEIGHT, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    // NCHW, normalized to roughly [-1, 1]
    let plane = (INPUT_HEIGHT * INPUT_WIDTH) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_WIDTH as usize + x as usize;
        input_data[idx] = (pixel[0] as f32 - 127.0) / 128.0;
        input_data[plane + idx] = (pixel[1] as f32 - 127.0) / 128.0;
        input_data[2 * plane + idx] = (pixel[2] as f32 - 127.0) / 128.0;
    }

    let input_tensor = Tensor::from_array(([1usize, 3, INPUT_HEIGHT as usize, INPUT_WIDTH as usize], input_data.into_boxed_slice()))?;
    let outputs = session.run(ort::inputs!["input" => input_tensor])?;

    let scores_value = outputs.get("scores")
        .ok_or_else(|| anyhow!("No scores output"))?;
    let boxes_value = outputs.get("boxes")
        .ok_or_else(|| anyhow!("No boxes output"))?;

    let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
    let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

    // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalized corners
    let num_anchors = scores_shape[1] as usize;
    let mut face_boxes = Vec::new();

    for i in 0..num_anchors {
        let confidence = scores_data[i * 2 + 1];
        if confidence < CANDIDATE_THRESHOLD {
            continue;
        }

        let x1 = (boxes_data[i * 4] * orig_width as f32) as i32;
        let y1 = (boxes_data[i * 4 + 1] * orig_height as f32) as i32;
        let x2 = (boxes_data[i * 4 + 2] * orig_width as f32) as i32;
        let y2 = (boxes_data[i * 4 + 3] * orig_height as f32) as i32;

        let bbox = BoundingBox {
            x: x1.max(0),
            y: y1.max(0),
            width: (x2 - x1).max(1),
            height: (y2 - y1).max(1),
        };
        face_boxes.push((bbox, confidence));
    }

    Ok(nms(face_boxes, NMS_THRESHOLD))
}

/// Non-maximum suppression to remove overlapping detections
fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }

        keep.push(boxes[i]);

        for j in (i + 1)..boxes.len() {
            if !suppressed[j] && compute_iou(&boxes[i].0, &boxes[j].0) > threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Intersection over Union between two bounding boxes
fn compute_iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let intersection = ((x2 - x1).max(0) * (y2 - y1).max(0)) as f32;
    let area_a = (a.width * a.height) as f32;
    let area_b = (b.width * b.height) as f32;
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Crop face region with 20% padding, clamped to the image
fn crop_face(img: &DynamicImage, bbox: &BoundingBox, img_width: u32, img_height: u32) -> DynamicImage {
    let padding_x = (bbox.width as f32 * 0.2) as i32;
    let padding_y = (bbox.height as f32 * 0.2) as i32;

    let x = ((bbox.x - padding_x).max(0) as u32).min(img_width.saturating_sub(1));
    let y = ((bbox.y - padding_y).max(0) as u32).min(img_height.saturating_sub(1));
    let w = ((bbox.width + padding_x * 2) as u32).min(img_width - x);
    let h = ((bbox.height + padding_y * 2) as u32).min(img_height - y);

    img.crop_imm(x, y, w.max(1), h.max(1))
}

/// Run ArcFace; the returned embedding is L2-normalized.
fn run_arcface_embedding(session: &mut Session, face_img: &DynamicImage) -> Result<Vec<f32>> {
    const INPUT_SIZE: u32 = 112;

    let resized = face_img.resize_exact(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_SIZE as usize + x as usize;
        input_data[idx] = (pixel[0] as f32 - 127.5) / 127.5;
        input_data[plane + idx] = (pixel[1] as f32 - 127.5) / 127.5;
        input_data[2 * plane + idx] = (pixel[2] as f32 - 127.5) / 127.5;
    }

    let input_tensor = Tensor::from_array(([1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize], input_data.into_boxed_slice()))?;

    // ArcFace ONNX export names its input "data"
    let outputs = session.run(ort::inputs!["data" => input_tensor])?;

    let embedding_output = outputs.iter().next()
        .ok_or_else(|| anyhow!("No embedding output"))?;
    let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

    let mut embedding = embedding_data.to_vec();
    crate::search::index::l2_normalize(&mut embedding);
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: i32, y: i32, width: i32, height: i32) -> BoundingBox {
        BoundingBox { x, y, width, height }
    }

    #[test]
    fn test_iou() {
        let a = bbox(0, 0, 10, 10);
        assert!((compute_iou(&a, &bbox(0, 0, 10, 10)) - 1.0).abs() < 0.001);
        assert!(compute_iou(&a, &bbox(20, 20, 10, 10)).abs() < 0.001);
    }

    #[test]
    fn test_nms_drops_overlaps() {
        let kept = nms(
            vec![
                (bbox(0, 0, 10, 10), 0.8),
                (bbox(1, 1, 10, 10), 0.95),
                (bbox(50, 50, 10, 10), 0.7),
            ],
            NMS_THRESHOLD,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].0, bbox(1, 1, 10, 10));
        assert_eq!(kept[1].0, bbox(50, 50, 10, 10));
    }

    #[test]
    fn test_crop_face_stays_inside_image() {
        let img = DynamicImage::new_rgb8(100, 80);
        let crop = crop_face(&img, &bbox(90, 70, 20, 20), 100, 80);
        // padded origin is (86, 66); the crop is clamped at the right and bottom edges
        assert_eq!((crop.width(), crop.height()), (14, 14));
    }

    #[test]
    fn test_missing_configured_model_is_an_error() {
        let missing = Path::new("/nonexistent/model.onnx");
        assert!(resolve_model(Some(missing), "x.onnx", "http://invalid").is_err());
    }
}
