//! Face detection with the Ultraface network.
//!
use std::path::{Path, PathBuf};

use anyhow::Result;
use image::RgbImage;
use ndarray::s;
use tract_onnx::prelude::*;

use crate::utils::download_file;

pub(crate) type NnModel =
    SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Bounding box `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`, normalized to `0..=1`.
pub type Bbox = [f32; 4];

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Anything finding faces in an image.
pub trait FaceDetector: Send + Sync {
    /// Bounding boxes with confidences, most confident first.
    fn detect(&self, image: &RgbImage) -> Result<Vec<(Bbox, f32)>>;
}

/// Available input resolutions of the Ultraface network.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UltrafaceVariant {
    W640H480,
    W320H240,
}

impl UltrafaceVariant {
    pub fn width_height(&self) -> (u32, u32) {
        match self {
            UltrafaceVariant::W640H480 => (640, 480),
            UltrafaceVariant::W320H240 => (320, 240),
        }
    }

    pub fn filename(&self) -> &'static str {
        match self {
            UltrafaceVariant::W640H480 => "ultraface-RFB-640.onnx",
            UltrafaceVariant::W320H240 => "ultraface-RFB-320.onnx",
        }
    }

    pub fn url(&self) -> &'static str {
        match self {
            UltrafaceVariant::W640H480 => {
                "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-640.onnx"
            }
            UltrafaceVariant::W320H240 => {
                "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx"
            }
        }
    }
}

pub struct UltrafaceModel {
    model: NnModel,
    width: u32,
    height: u32,
    max_iou: f32,
    min_confidence: f32,
}

impl UltrafaceModel {
    /// Load the model from `models_dir`, downloading it first if it is not there yet.
    pub async fn new(
        models_dir: &Path,
        variant: UltrafaceVariant,
        max_iou: f32,
        min_confidence: f32,
    ) -> Result<Self> {
        let model_path = ensure_model(models_dir, variant).await?;
        Self::from_path(&model_path, variant, max_iou, min_confidence)
    }

    pub fn from_path(
        model_path: &Path,
        variant: UltrafaceVariant,
        max_iou: f32,
        min_confidence: f32,
    ) -> Result<Self> {
        let (width, height) = variant.width_height();
        let input_fact = InferenceFact::dt_shape(
            f32::datum_type(),
            tvec!(1, 3, height as usize, width as usize),
        );
        let model = load_onnx(model_path, input_fact)?;
        log::info!("Loaded face detector {}", model_path.display());

        Ok(Self {
            model,
            width,
            height,
            max_iou,
            min_confidence,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let resized: RgbImage = image::imageops::resize(
            input,
            self.width,
            self.height,
            image::imageops::FilterType::Triangle,
        );

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, c, y, x)| {
                // Note: Mean/std are from MobileNet, not from Ultraface, but work well
                let mean = [0.485, 0.456, 0.406][c];
                let std = [0.229, 0.224, 0.225][c];
                (resized[(x as _, y as _)][c] as f32 / 255.0 - mean) / std
            },
        )
        .into()
    }
}

impl FaceDetector for UltrafaceModel {
    fn detect(&self, image: &RgbImage) -> Result<Vec<(Bbox, f32)>> {
        let raw_nn_out = self.model.run(tvec!(self.preproc(image).into()))?;

        // Output 0: scores of shape [1, num_anchors, 2] with (background, face)
        // Output 1: boxes of shape [1, num_anchors, 4]
        let confidences = raw_nn_out[0]
            .to_array_view::<f32>()?
            .slice(s![0, .., 1])
            .to_vec();
        let bboxes: Vec<f32> = raw_nn_out[1].to_array_view::<f32>()?.iter().cloned().collect();

        Ok(postproc(
            &confidences,
            &bboxes,
            self.min_confidence,
            self.max_iou,
        ))
    }
}

/// Path of the model file for `variant`, downloaded if missing.
pub async fn ensure_model(models_dir: &Path, variant: UltrafaceVariant) -> Result<PathBuf> {
    let model_path = models_dir.join(variant.filename());
    if !model_path.exists() {
        log::info!(
            "Downloading {} to {}",
            variant.url(),
            model_path.display()
        );
        download_file(&reqwest::Client::new(), variant.url(), &model_path).await?;
    }

    Ok(model_path)
}

/// Load an ONNX model with a fixed input shape and optimize it for inference.
pub(crate) fn load_onnx(model_path: &Path, input_fact: InferenceFact) -> Result<NnModel> {
    let model = tract_onnx::onnx()
        .model_for_path(model_path)?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    Ok(model)
}

/// Turn raw network output into selected bounding boxes.
///
/// `bboxes` holds four values per entry of `confidences`. Candidates below `min_confidence` are
/// discarded before non-maximum suppression.
pub fn postproc(
    confidences: &[f32],
    bboxes: &[f32],
    min_confidence: f32,
    max_iou: f32,
) -> Vec<(Bbox, f32)> {
    let mut candidates: Vec<(Bbox, f32)> = confidences
        .iter()
        .zip(bboxes.chunks_exact(4))
        .filter(|(confidence, _)| **confidence > min_confidence)
        .map(|(confidence, bbox)| {
            let bbox = [
                bbox[0].clamp(0.0, 1.0),
                bbox[1].clamp(0.0, 1.0),
                bbox[2].clamp(0.0, 1.0),
                bbox[3].clamp(0.0, 1.0),
            ];
            (bbox, *confidence)
        })
        .collect();

    candidates.sort_by(|a, b| a.1.total_cmp(&b.1));

    non_maximum_suppression(candidates, max_iou)
}

/// Run non-maximum-suppression on candidate bounding boxes.
///
/// Start with the most confident bounding box and iterate over all other bounding boxes in the
/// order of sinking confidence. Grow the vector of selected bounding boxes by adding only those
/// candidates which do not have an IoU above `max_iou` with already chosen bounding boxes.
/// `sorted_bboxes_with_confidences` must be sorted by ascending confidence.
pub fn non_maximum_suppression(
    mut sorted_bboxes_with_confidences: Vec<(Bbox, f32)>,
    max_iou: f32,
) -> Vec<(Bbox, f32)> {
    let mut selected: Vec<(Bbox, f32)> = vec![];
    'candidates: loop {
        // Get next most confident bbox from the back of ascending-sorted vector.
        match sorted_bboxes_with_confidences.pop() {
            Some((bbox, confidence)) => {
                // Check for overlap with any of the selected bboxes
                for (selected_bbox, _) in selected.iter() {
                    if iou(&bbox, selected_bbox) > max_iou {
                        continue 'candidates;
                    }
                }

                // bbox has no large overlap with any of the selected ones, add it
                selected.push((bbox, confidence))
            }
            None => break 'candidates,
        }
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
pub fn iou(bbox_a: &Bbox, bbox_b: &Bbox) -> f32 {
    // Calculate corner points of overlap box
    // If the boxes do not overlap, the corner-points will be ill defined, i.e. the top left
    // corner point will be below and to the right of the bottom right corner point. In this case,
    // the area will be zero.
    let overlap_box: Bbox = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    // Avoid division-by-zero with `EPS`
    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// If the bounding box is ill-defined by having the bottom-right point above/to the left of the
/// top-left point, the area is zero.
pub fn bbox_area(bbox: &Bbox) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}
