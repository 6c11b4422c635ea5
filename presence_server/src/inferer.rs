use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use bytes::Bytes;
use image::{imageops, ImageFormat, RgbImage};
use tokio::sync::broadcast;

use crate::{
    annotate::{as_jpeg_stream_item, encode_jpeg, Annotator, Overlay},
    capture::{Frame, LatestFrame},
    meter::METER,
    motion::MotionTracker,
    pose::{Keypoint, Landmarks, PoseEstimator},
    recognizer::{FaceRecognizer, RecognizedFace},
    scene::Scene,
};

/// When face recognition runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// On every frame whose index is a multiple of `n`.
    EveryNthFrame(u64),
    /// At most once per period.
    Every(Duration),
}

impl Schedule {
    fn is_due(&self, frame_idx: u64, last_run: Option<Instant>) -> bool {
        match self {
            Schedule::EveryNthFrame(n) => frame_idx % (*n).max(1) == 0,
            Schedule::Every(period) => last_run.map_or(true, |last| last.elapsed() >= *period),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InfererOptions {
    pub schedule: Schedule,
    /// Flip frames horizontally before analysis.
    pub mirror: bool,
    pub jpeg_quality: u8,
}

impl Default for InfererOptions {
    fn default() -> Self {
        Self {
            schedule: Schedule::Every(Duration::from_millis(500)),
            mirror: false,
            jpeg_quality: 80,
        }
    }
}

/// Runs the analysis on captured frames and feeds the annotated stream.
pub struct Inferer {
    recognizer: FaceRecognizer,
    pose: Option<(Box<dyn PoseEstimator>, MotionTracker)>,
    annotator: Annotator,
    options: InfererOptions,
    scene: Arc<Scene>,
    feed_tx: broadcast::Sender<Bytes>,
    faces: Vec<RecognizedFace>,
    last_recognition: Option<Instant>,
}

impl Inferer {
    pub fn new(
        recognizer: FaceRecognizer,
        annotator: Annotator,
        options: InfererOptions,
        scene: Arc<Scene>,
        feed_tx: broadcast::Sender<Bytes>,
    ) -> Self {
        Self {
            recognizer,
            pose: None,
            annotator,
            options,
            scene,
            feed_tx,
            faces: Vec::new(),
            last_recognition: None,
        }
    }

    /// Also estimate poses and classify motion on every frame.
    pub fn with_motion(mut self, pose: Box<dyn PoseEstimator>, tracker: MotionTracker) -> Self {
        self.pose = Some((pose, tracker));
        self
    }

    /// Process frames until the capture stops.
    ///
    /// Must run on a multi-threaded runtime, inference blocks the worker thread.
    pub async fn run(mut self, latest: Arc<LatestFrame>) {
        let mut last_seq = 0;
        let mut frame_idx = 0;

        while let Some(frame) = latest.next_after(last_seq).await {
            if frame.seq > last_seq + 1 {
                log::trace!("Skipped {} frames", frame.seq - last_seq - 1);
            }
            last_seq = frame.seq;
            frame_idx += 1;

            let streaming = self.feed_tx.receiver_count() > 0;
            let res =
                tokio::task::block_in_place(|| self.handle_frame(frame_idx, &frame, streaming));
            match res {
                Ok(Some(item)) => {
                    self.feed_tx.send(item).ok();
                }
                Ok(None) => (),
                Err(e) => log::warn!("Skipping frame {}: {e:#}", frame.seq),
            }
        }

        log::info!("Video stream closed, stopping inference");
    }

    fn handle_frame(
        &mut self,
        frame_idx: u64,
        frame: &Frame,
        streaming: bool,
    ) -> Result<Option<Bytes>> {
        let image = image::load_from_memory_with_format(&frame.jpeg, ImageFormat::Jpeg)?.to_rgb8();
        self.scene.set_frame_seq(frame.seq);

        let image = self.prepare(image);
        let landmarks = self.analyze(frame_idx, &image);
        METER.tick_processed();

        if !streaming {
            return Ok(None);
        }

        let annotated = self.render(image, landmarks.as_deref());
        let jpeg = encode_jpeg(&annotated, self.options.jpeg_quality)?;

        Ok(Some(as_jpeg_stream_item(&jpeg)))
    }

    /// Analyze and annotate one decoded frame.
    pub fn process(&mut self, frame_idx: u64, image: RgbImage) -> RgbImage {
        let image = self.prepare(image);
        let landmarks = self.analyze(frame_idx, &image);
        self.render(image, landmarks.as_deref())
    }

    fn prepare(&self, mut image: RgbImage) -> RgbImage {
        if self.options.mirror {
            imageops::flip_horizontal_in_place(&mut image);
        }
        image
    }

    /// Update faces and motion state, returns the pose found on this frame.
    fn analyze(&mut self, frame_idx: u64, image: &RgbImage) -> Option<Landmarks> {
        if self
            .options
            .schedule
            .is_due(frame_idx, self.last_recognition)
        {
            self.last_recognition = Some(Instant::now());
            match self.recognizer.detect_known_faces(image) {
                Ok(faces) => {
                    log::debug!("Found {} faces on frame {}", faces.len(), frame_idx);
                    self.faces = faces;
                    self.scene.update_faces(self.faces.clone());
                }
                Err(e) => log::warn!("Face recognition failed: {e:#}"),
            }
        }

        let (pose, tracker) = self.pose.as_mut()?;
        let landmarks = pose.estimate(image).unwrap_or_else(|e| {
            log::warn!("Pose estimation failed: {e:#}");
            None
        });
        let state = tracker.observe(frame_idx, landmarks.clone());
        self.scene.set_motion(state);

        landmarks
    }

    fn render(&self, mut image: RgbImage, landmarks: Option<&[Keypoint]>) -> RgbImage {
        let overlay = Overlay {
            faces: &self.faces,
            landmarks,
            motion: self.pose.as_ref().map(|(_, tracker)| tracker.state()),
        };
        self.annotator.draw(&mut image, &overlay);
        image
    }
}
