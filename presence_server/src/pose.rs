//! Single person pose estimation with MoveNet.
//!
use std::path::Path;

use anyhow::{Context, Result};
use image::{imageops, RgbImage};
use serde::Serialize;
use smallvec::SmallVec;
use tract_onnx::prelude::*;

use crate::nn::{load_onnx, NnModel};

/// Number of keypoints of the COCO body model.
pub const NUM_KEYPOINTS: usize = 17;

/// Input side length of the MoveNet lightning network.
const MOVENET_INPUT_SIDE: u32 = 192;

/// Pairs of keypoint indices connected in the drawn skeleton.
pub const SKELETON: [(usize, usize); 16] = [
    (0, 1),   // nose - left eye
    (0, 2),   // nose - right eye
    (1, 3),   // left eye - left ear
    (2, 4),   // right eye - right ear
    (5, 6),   // shoulders
    (5, 7),   // left upper arm
    (7, 9),   // left forearm
    (6, 8),   // right upper arm
    (8, 10),  // right forearm
    (5, 11),  // left flank
    (6, 12),  // right flank
    (11, 12), // hips
    (11, 13), // left thigh
    (13, 15), // left shin
    (12, 14), // right thigh
    (14, 16), // right shin
];

/// Body keypoint in pixel coordinates of the analyzed frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

pub type Landmarks = SmallVec<[Keypoint; NUM_KEYPOINTS]>;

/// Anything locating the body keypoints of a person.
pub trait PoseEstimator: Send + Sync {
    /// Keypoints of the most prominent person, `None` if nobody is visible.
    fn estimate(&self, image: &RgbImage) -> Result<Option<Landmarks>>;
}

pub struct MoveNetModel {
    model: NnModel,
    min_confidence: f32,
}

impl MoveNetModel {
    pub fn from_path(model_path: &Path, min_confidence: f32) -> Result<Self> {
        let side = MOVENET_INPUT_SIDE as usize;
        let input_fact = InferenceFact::dt_shape(i32::datum_type(), tvec!(1, side, side, 3));
        let model = load_onnx(model_path, input_fact)
            .with_context(|| format!("failed to load pose model {}", model_path.display()))?;
        log::info!("Loaded pose estimator {}", model_path.display());

        Ok(Self {
            model,
            min_confidence,
        })
    }

    fn preproc(&self, image: &RgbImage) -> Tensor {
        let side = MOVENET_INPUT_SIDE;
        let resized = imageops::resize(image, side, side, imageops::FilterType::Triangle);

        tract_ndarray::Array4::from_shape_fn(
            (1, side as usize, side as usize, 3),
            |(_, y, x, c)| resized[(x as _, y as _)][c] as i32,
        )
        .into()
    }
}

impl PoseEstimator for MoveNetModel {
    fn estimate(&self, image: &RgbImage) -> Result<Option<Landmarks>> {
        let out = self.model.run(tvec!(self.preproc(image).into()))?;

        // Output of shape [1, 1, 17, 3] with normalized (y, x, score) per keypoint
        let raw: Vec<f32> = out[0].to_array_view::<f32>()?.iter().cloned().collect();
        let (width, height) = image.dimensions();

        Ok(postproc(&raw, width, height, self.min_confidence))
    }
}

/// Scale raw keypoints to pixels, dropping poses that are not confident enough on average.
pub fn postproc(raw: &[f32], width: u32, height: u32, min_confidence: f32) -> Option<Landmarks> {
    let landmarks: Landmarks = raw
        .chunks_exact(3)
        .take(NUM_KEYPOINTS)
        .map(|kp| Keypoint {
            x: kp[1] * width as f32,
            y: kp[0] * height as f32,
            score: kp[2],
        })
        .collect();

    if landmarks.is_empty() {
        return None;
    }

    let mean_score =
        landmarks.iter().map(|kp| kp.score).sum::<f32>() / landmarks.len() as f32;
    log::trace!("Pose with mean keypoint score {mean_score:.2}");

    (mean_score >= min_confidence).then_some(landmarks)
}
