//! Face recognition: detect faces, embed them and match them against known employees.
//!
//! Matching follows the usual embedding approach: every reference image of an employee
//! contributes one encoding to a [`FaceGallery`]. A face in a frame is labelled with the employee
//! whose encoding is closest, as long as the euclidean distance stays within the tolerance.
use std::path::Path;

use anyhow::{Context, Result};
use common::{roster::Roster, UNKNOWN};
use image::{imageops, RgbImage};
use serde::Serialize;
use tract_onnx::prelude::*;

use crate::nn::{load_onnx, Bbox, FaceDetector, NnModel};

/// Side length of the square face crop fed to the embedder.
const EMBEDDER_INPUT_SIDE: u32 = 112;

/// Relative margin added around a detected face before cropping.
const CROP_MARGIN: f32 = 0.1;

/// Anything turning a face crop into an encoding vector.
pub trait FaceEmbedder: Send + Sync {
    fn embed(&self, face: &RgbImage) -> Result<Vec<f32>>;
}

/// ArcFace-style embedding network.
pub struct OnnxEmbedder {
    model: NnModel,
}

impl OnnxEmbedder {
    pub fn from_path(model_path: &Path) -> Result<Self> {
        let side = EMBEDDER_INPUT_SIDE as usize;
        let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side));
        let model = load_onnx(model_path, input_fact)
            .with_context(|| format!("failed to load embedder {}", model_path.display()))?;
        log::info!("Loaded face embedder {}", model_path.display());

        Ok(Self { model })
    }

    fn preproc(&self, face: &RgbImage) -> Tensor {
        let side = EMBEDDER_INPUT_SIDE;
        let resized = imageops::resize(face, side, side, imageops::FilterType::Triangle);

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, side as usize, side as usize),
            |(_, c, y, x)| (resized[(x as _, y as _)][c] as f32 - 127.5) / 127.5,
        )
        .into()
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn embed(&self, face: &RgbImage) -> Result<Vec<f32>> {
        let out = self.model.run(tvec!(self.preproc(face).into()))?;
        let encoding: Vec<f32> = out[0].to_array_view::<f32>()?.iter().cloned().collect();

        Ok(l2_normalized(encoding))
    }
}

fn l2_normalized(mut encoding: Vec<f32>) -> Vec<f32> {
    let norm = encoding.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        encoding.iter_mut().for_each(|v| *v /= norm);
    }
    encoding
}

/// Euclidean distance between two face encodings.
pub fn face_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f32>()
        .sqrt()
}

/// Known encodings with the employee ID they belong to.
#[derive(Debug, Default)]
pub struct FaceGallery {
    encodings: Vec<Vec<f32>>,
    emp_ids: Vec<String>,
}

impl FaceGallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, emp_id: &str, encoding: Vec<f32>) {
        self.encodings.push(encoding);
        self.emp_ids.push(emp_id.to_owned());
    }

    pub fn len(&self) -> usize {
        self.encodings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encodings.is_empty()
    }

    /// Employee ID with the closest encoding, if that one is within `tolerance`.
    pub fn best_match(&self, encoding: &[f32], tolerance: f32) -> Option<&str> {
        let (best_idx, distance) = self
            .encodings
            .iter()
            .map(|known| face_distance(known, encoding))
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))?;

        log::trace!("Closest match {} at distance {distance:.3}", self.emp_ids[best_idx]);

        (distance <= tolerance).then(|| self.emp_ids[best_idx].as_str())
    }
}

/// Face location in pixel coordinates of the analyzed frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct FaceRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl FaceRect {
    /// Scale a normalized bounding box to an image of the given size.
    pub fn from_bbox(bbox: &Bbox, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            left: (bbox[0] * w) as u32,
            top: (bbox[1] * h) as u32,
            right: ((bbox[2] * w) as u32).min(width),
            bottom: ((bbox[3] * h) as u32).min(height),
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Grow the rectangle by `margin` of its size on every side, bounded by the image.
    fn padded(&self, margin: f32, width: u32, height: u32) -> Self {
        let dx = (self.width() as f32 * margin) as u32;
        let dy = (self.height() as f32 * margin) as u32;
        Self {
            left: self.left.saturating_sub(dx),
            top: self.top.saturating_sub(dy),
            right: (self.right + dx).min(width),
            bottom: (self.bottom + dy).min(height),
        }
    }
}

/// A face found in a frame together with the employee ID it was matched to.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecognizedFace {
    pub rect: FaceRect,
    /// Employee ID, or [`UNKNOWN`].
    pub name: String,
}

impl RecognizedFace {
    pub fn is_known(&self) -> bool {
        self.name != UNKNOWN
    }
}

pub struct FaceRecognizer {
    detector: Box<dyn FaceDetector>,
    embedder: Option<Box<dyn FaceEmbedder>>,
    gallery: FaceGallery,
    tolerance: f32,
}

impl FaceRecognizer {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        embedder: Option<Box<dyn FaceEmbedder>>,
        tolerance: f32,
    ) -> Self {
        if embedder.is_none() {
            log::warn!("No face embedder configured, every face will be labelled {UNKNOWN}");
        }
        Self {
            detector,
            embedder,
            gallery: FaceGallery::new(),
            tolerance,
        }
    }

    pub fn gallery(&self) -> &FaceGallery {
        &self.gallery
    }

    /// Encode the reference images of all employees in `roster`.
    ///
    /// Images that cannot be read or show no face are skipped. Returns the number of encodings
    /// added to the gallery.
    pub fn load_roster(&mut self, roster: &Roster) -> usize {
        let Some(embedder) = self.embedder.as_ref() else {
            return 0;
        };

        let before = self.gallery.len();
        for (emp_id, image_path) in roster.reference_images() {
            let image = match image::open(image_path) {
                Ok(image) => image.to_rgb8(),
                Err(e) => {
                    log::warn!("Could not read image {image_path}: {e}");
                    continue;
                }
            };

            let encoding = self
                .detector
                .detect(&image)
                .and_then(|faces| match faces.first() {
                    Some((bbox, _)) => embed_face(embedder.as_ref(), &image, bbox).map(Some),
                    None => Ok(None),
                });

            match encoding {
                Ok(Some(encoding)) => self.gallery.add(emp_id, encoding),
                Ok(None) => log::warn!("No face found in {image_path}"),
                Err(e) => log::warn!("Failed to encode {image_path}: {e:#}"),
            }
        }

        let added = self.gallery.len() - before;
        log::info!("Encoding images loaded, {added} known encodings");

        added
    }

    /// Find all faces in `frame` and label them with employee IDs.
    pub fn detect_known_faces(&self, frame: &RgbImage) -> Result<Vec<RecognizedFace>> {
        let (width, height) = frame.dimensions();
        let detections = self.detector.detect(frame)?;

        let mut faces = Vec::with_capacity(detections.len());
        for (bbox, _confidence) in detections.iter() {
            let rect = FaceRect::from_bbox(bbox, width, height);
            let name = match (&self.embedder, self.gallery.is_empty()) {
                (Some(embedder), false) => {
                    let encoding = embed_face(embedder.as_ref(), frame, bbox)?;
                    self.gallery
                        .best_match(&encoding, self.tolerance)
                        .unwrap_or(UNKNOWN)
                        .to_owned()
                }
                _ => UNKNOWN.to_owned(),
            };
            faces.push(RecognizedFace { rect, name });
        }

        Ok(faces)
    }
}

fn embed_face(embedder: &dyn FaceEmbedder, image: &RgbImage, bbox: &Bbox) -> Result<Vec<f32>> {
    let (width, height) = image.dimensions();
    let rect = FaceRect::from_bbox(bbox, width, height).padded(CROP_MARGIN, width, height);
    let crop = imageops::crop_imm(
        image,
        rect.left,
        rect.top,
        rect.width().max(1),
        rect.height().max(1),
    )
    .to_image();

    embedder.embed(&crop)
}

#[cfg(test)]
pub(crate) mod test {

    use common::roster::Employee;
    use image::Rgb;

    use super::*;

    /// Detector reporting one fixed face in every image.
    pub(crate) struct FixedDetector(pub Vec<(Bbox, f32)>);

    impl FaceDetector for FixedDetector {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<(Bbox, f32)>> {
            Ok(self.0.clone())
        }
    }

    /// Embedder encoding a crop as its mean color.
    pub(crate) struct MeanColorEmbedder;

    impl FaceEmbedder for MeanColorEmbedder {
        fn embed(&self, face: &RgbImage) -> Result<Vec<f32>> {
            let num_pixels = (face.width() * face.height()) as f32;
            let mut sums = [0.0f32; 3];
            for pixel in face.pixels() {
                for c in 0..3 {
                    sums[c] += pixel[c] as f32 / 255.0;
                }
            }
            Ok(sums.iter().map(|sum| sum / num_pixels).collect())
        }
    }

    #[test]
    fn test_face_distance() {
        assert_eq!(face_distance(&[0.0, 3.0], &[4.0, 0.0]), 5.0);
        assert_eq!(face_distance(&[1.0, 1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_l2_normalized() {
        assert_eq!(l2_normalized(vec![3.0, 4.0]), vec![0.6, 0.8]);
        assert_eq!(l2_normalized(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_best_match_respects_tolerance() {
        let mut gallery = FaceGallery::new();
        gallery.add("17", vec![1.0, 0.0]);
        gallery.add("23", vec![0.0, 1.0]);

        assert_eq!(gallery.best_match(&[0.9, 0.1], 0.6), Some("17"));
        assert_eq!(gallery.best_match(&[0.2, 0.8], 0.6), Some("23"));
        // Equally far from both and too far from either
        assert_eq!(gallery.best_match(&[-1.0, -1.0], 0.6), None);
    }

    #[test]
    fn test_empty_gallery_matches_nothing() {
        assert_eq!(FaceGallery::new().best_match(&[1.0], 10.0), None);
    }

    #[test]
    fn test_face_rect_from_bbox() {
        let rect = FaceRect::from_bbox(&[0.25, 0.5, 0.5, 1.0], 640, 480);
        assert_eq!(
            rect,
            FaceRect {
                left: 160,
                top: 240,
                right: 320,
                bottom: 480
            }
        );
        assert_eq!(rect.width(), 160);
        assert_eq!(rect.padded(0.5, 640, 480).bottom, 480);
    }

    #[test]
    fn test_recognizes_known_face() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let reference = dir.path().join("ada.png");
        RgbImage::from_pixel(40, 40, Rgb([200, 30, 30])).save(&reference)?;

        let mut roster = Roster::default();
        roster.insert(Employee {
            emp_id: "17".into(),
            emp_name: "Ada Lovelace".into(),
            emp_user_name: None,
            images: vec![
                reference.to_string_lossy().into_owned(),
                "/no/such/image.jpg".into(),
            ],
        });

        let mut recognizer = FaceRecognizer::new(
            Box::new(FixedDetector(vec![([0.0, 0.0, 1.0, 1.0], 0.9)])),
            Some(Box::new(MeanColorEmbedder)),
            0.1,
        );
        assert_eq!(recognizer.load_roster(&roster), 1);

        let same_person = RgbImage::from_pixel(80, 60, Rgb([205, 30, 25]));
        let faces = recognizer.detect_known_faces(&same_person)?;
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].name, "17");
        assert_eq!(faces[0].rect.right, 80);

        let stranger = RgbImage::from_pixel(80, 60, Rgb([20, 200, 20]));
        let faces = recognizer.detect_known_faces(&stranger)?;
        assert_eq!(faces[0].name, UNKNOWN);
        assert!(!faces[0].is_known());

        Ok(())
    }

    #[test]
    fn test_without_embedder_everyone_is_unknown() -> Result<()> {
        let recognizer = FaceRecognizer::new(
            Box::new(FixedDetector(vec![
                ([0.0, 0.0, 0.5, 0.5], 0.9),
                ([0.5, 0.5, 1.0, 1.0], 0.8),
            ])),
            None,
            0.6,
        );

        let faces = recognizer.detect_known_faces(&RgbImage::new(10, 10))?;
        assert_eq!(faces.len(), 2);
        assert!(faces.iter().all(|face| face.name == UNKNOWN));

        Ok(())
    }
}
