use crate::{VisionError, VisionResult};
use image::RgbImage;
use ndarray::Array;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::{Tensor, Value};
use std::{path::Path, sync::Mutex};
use tracing::{debug, info};

/// One detected object, in pixel coordinates of the source frame.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Top-left corner.
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// COCO class id (2 = car, 5 = bus, 7 = truck, ...).
    pub class_id: usize,
    pub confidence: f32,
}

impl Detection {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Minimum confidence for a detection to be kept.
    pub confidence_threshold: f32,
    /// IoU above which same-class candidates are suppressed.
    pub nms_threshold: f32,
    /// Model input edge length; YOLOv8 expects a square input.
    pub input_size: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            nms_threshold: 0.45,
            input_size: 640,
        }
    }
}

const NUM_CLASSES: usize = 80;
const NUM_BOXES: usize = 8400;
const NUM_FEATURES: usize = 84; // 4 bbox values + 80 class scores

/// YOLOv8 object detector running through ONNX Runtime.
pub struct ObjectDetector {
    session: Mutex<Session>,
    config: DetectorConfig,
}

impl ObjectDetector {
    #[tracing::instrument(skip(config))]
    pub fn load(model_path: &Path, config: DetectorConfig) -> VisionResult<Self> {
        if !model_path.exists() {
            return Err(VisionError::Inference(format!(
                "detection model {} was not found",
                model_path.display()
            )));
        }

        let model_bytes = std::fs::read(model_path)?;
        let session = Session::builder()
            .map_err(|err| VisionError::Inference(err.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|err| VisionError::Inference(err.to_string()))?
            .commit_from_memory(&model_bytes)
            .map_err(|err| VisionError::Inference(err.to_string()))?;

        info!(
            "Loaded detection model {} (confidence threshold {})",
            model_path.display(),
            config.confidence_threshold
        );
        Ok(Self {
            session: Mutex::new(session),
            config,
        })
    }

    /// Detect objects in one frame.
    pub fn detect(&self, frame: &RgbImage) -> VisionResult<Vec<Detection>> {
        let input = preprocess(frame, self.config.input_size)?;
        let outputs = self.run_inference(input)?;
        let detections = postprocess(&outputs, frame.width(), frame.height(), &self.config);
        debug!("Detected {} object(s)", detections.len());
        Ok(detections)
    }

    fn run_inference(&self, input: Value) -> VisionResult<Vec<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| VisionError::Inference("session lock poisoned".into()))?;

        let outputs = session
            .run(ort::inputs![input])
            .map_err(|err| VisionError::Inference(err.to_string()))?;

        let output = outputs
            .get("output0")
            .ok_or_else(|| VisionError::Inference("model produced no output0 tensor".into()))?;

        let tensor = output
            .try_extract_tensor::<f32>()
            .map_err(|err| VisionError::Inference(err.to_string()))?;

        Ok(tensor.1.iter().copied().collect())
    }
}

/// Resize to the square model input, normalise to [0, 1] and reorder to
/// NCHW.
fn preprocess(frame: &RgbImage, input_size: u32) -> VisionResult<Value> {
    let resized = image::imageops::resize(
        frame,
        input_size,
        input_size,
        image::imageops::FilterType::Triangle,
    );

    let (w, h) = (input_size as usize, input_size as usize);
    let mut chw_data: Vec<f32> = Vec::with_capacity(3 * h * w);
    for c in 0..3 {
        for y in 0..h {
            for x in 0..w {
                let pixel = resized.get_pixel(x as u32, y as u32);
                chw_data.push(pixel[c] as f32 / 255.0);
            }
        }
    }

    let shape = vec![1usize, 3, h, w];
    Tensor::from_array((shape, chw_data.into_boxed_slice()))
        .map(Value::from)
        .map_err(|err| VisionError::Inference(format!("failed to build input tensor: {err}")))
}

/// Parse the raw [1, 84, 8400] YOLOv8 output into thresholded, suppressed
/// detections scaled back to frame pixels.
fn postprocess(
    outputs: &[f32],
    frame_width: u32,
    frame_height: u32,
    config: &DetectorConfig,
) -> Vec<Detection> {
    if outputs.len() != NUM_FEATURES * NUM_BOXES {
        return Vec::new();
    }

    let array = match Array::from_shape_vec((NUM_FEATURES, NUM_BOXES), outputs.to_vec()) {
        Ok(array) => array,
        Err(_) => return Vec::new(),
    };
    let transposed = array.t();

    let input_size = config.input_size as f32;
    let scale_w = frame_width as f32 / input_size;
    let scale_h = frame_height as f32 / input_size;

    let mut candidates = Vec::new();
    for i in 0..NUM_BOXES {
        let mut best_class = 0;
        let mut best_score = 0.0f32;
        for c in 0..NUM_CLASSES {
            let score = transposed[[i, 4 + c]];
            if score > best_score {
                best_score = score;
                best_class = c;
            }
        }
        if best_score < config.confidence_threshold {
            continue;
        }

        // Model boxes are centre-format in input coordinates.
        let cx = transposed[[i, 0]];
        let cy = transposed[[i, 1]];
        let w = transposed[[i, 2]];
        let h = transposed[[i, 3]];

        let x = ((cx - w / 2.0) * scale_w).max(0.0);
        let y = ((cy - h / 2.0) * scale_h).max(0.0);
        let width = (w * scale_w).min(frame_width as f32 - x);
        let height = (h * scale_h).min(frame_height as f32 - y);

        candidates.push(Detection {
            x,
            y,
            width,
            height,
            class_id: best_class,
            confidence: best_score,
        });
    }

    non_maximum_suppression(candidates, config.nms_threshold)
}

fn non_maximum_suppression(mut detections: Vec<Detection>, nms_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if suppressed[j] || detections[i].class_id != detections[j].class_id {
                continue;
            }
            if iou(&detections[i], &detections[j]) > nms_threshold {
                suppressed[j] = true;
            }
        }
        keep.push(detections[i].clone());
    }

    keep
}

pub(crate) fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - intersection;

    if union > 0.0 { intersection / union } else { 0.0 }
}

#[cfg(test)]
mod test {
    use super::*;

    fn detection(x: f32, y: f32, size: f32, class_id: usize, confidence: f32) -> Detection {
        Detection {
            x,
            y,
            width: size,
            height: size,
            class_id,
            confidence,
        }
    }

    #[test]
    fn test_center() {
        let det = detection(10.0, 20.0, 40.0, 2, 0.9);
        assert_eq!(det.center(), (30.0, 40.0));
    }

    #[test]
    fn test_iou_identical_boxes() {
        let a = detection(0.0, 0.0, 10.0, 2, 0.9);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint_boxes() {
        let a = detection(0.0, 0.0, 10.0, 2, 0.9);
        let b = detection(100.0, 100.0, 10.0, 2, 0.9);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_nms_suppresses_overlapping_same_class() {
        let detections = vec![
            detection(0.0, 0.0, 10.0, 2, 0.9),
            detection(1.0, 1.0, 10.0, 2, 0.8),
            detection(100.0, 100.0, 10.0, 2, 0.7),
        ];
        let kept = non_maximum_suppression(detections, 0.45);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_overlapping_different_classes() {
        let detections = vec![
            detection(0.0, 0.0, 10.0, 2, 0.9),
            detection(1.0, 1.0, 10.0, 7, 0.8),
        ];
        let kept = non_maximum_suppression(detections, 0.45);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_postprocess_rejects_wrong_output_size() {
        let config = DetectorConfig::default();
        assert!(postprocess(&[0.0; 10], 640, 640, &config).is_empty());
    }

    #[test]
    fn test_postprocess_thresholds_and_scales() {
        let config = DetectorConfig {
            confidence_threshold: 0.5,
            ..Default::default()
        };

        // One candidate box at input centre (320, 320), 64x64, class 2
        // score 0.95; everything else zero.
        let mut outputs = vec![0.0f32; NUM_FEATURES * NUM_BOXES];
        let set = |outputs: &mut Vec<f32>, feature: usize, box_idx: usize, value: f32| {
            outputs[feature * NUM_BOXES + box_idx] = value;
        };
        set(&mut outputs, 0, 0, 320.0);
        set(&mut outputs, 1, 0, 320.0);
        set(&mut outputs, 2, 0, 64.0);
        set(&mut outputs, 3, 0, 64.0);
        set(&mut outputs, 4 + 2, 0, 0.95);

        // Frame is 1280x640: x scales by 2, y by 1.
        let detections = postprocess(&outputs, 1280, 640, &config);
        assert_eq!(detections.len(), 1);

        let det = &detections[0];
        assert_eq!(det.class_id, 2);
        assert!((det.x - (320.0 - 32.0) * 2.0).abs() < 1e-3);
        assert!((det.y - (320.0 - 32.0)).abs() < 1e-3);
        assert!((det.width - 128.0).abs() < 1e-3);
        assert!((det.height - 64.0).abs() < 1e-3);
    }
}
