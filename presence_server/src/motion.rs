//! Motion classification from consecutive poses.
//!
use common::presence::MotionState;

use crate::pose::{Keypoint, Landmarks};

/// Mean keypoint displacement in pixels between two poses.
///
/// Zero if there is no previous pose or the poses have a different number of keypoints.
pub fn motion_between(prev: Option<&[Keypoint]>, curr: &[Keypoint]) -> f32 {
    match prev {
        Some(prev) if prev.len() == curr.len() && !curr.is_empty() => {
            let total: f32 = prev
                .iter()
                .zip(curr.iter())
                .map(|(p, c)| ((c.x - p.x).powi(2) + (c.y - p.y).powi(2)).sqrt())
                .sum();
            total / curr.len() as f32
        }
        _ => 0.0,
    }
}

/// Averages per-frame motion over a window of frames to decide between `Idle` and `Moving`.
#[derive(Debug)]
pub struct MotionTracker {
    update_interval: u64,
    threshold: f32,
    samples: Vec<f32>,
    state: MotionState,
    previous: Option<Landmarks>,
}

impl MotionTracker {
    /// `update_interval` is the window length in frames, `threshold` the average displacement in
    /// pixels above which the scene counts as moving.
    pub fn new(update_interval: u64, threshold: f32) -> Self {
        let update_interval = update_interval.max(1);
        Self {
            update_interval,
            threshold,
            samples: Vec::with_capacity(update_interval as usize),
            state: MotionState::Idle,
            previous: None,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// Record the pose of frame `frame_idx` and return the current state.
    ///
    /// Frames without a pose count as no motion and reset the previous pose.
    pub fn observe(&mut self, frame_idx: u64, landmarks: Option<Landmarks>) -> MotionState {
        let current_motion = match &landmarks {
            Some(curr) => motion_between(self.previous.as_deref(), curr),
            None => 0.0,
        };
        self.previous = landmarks;
        self.samples.push(current_motion);

        if frame_idx % self.update_interval == 0 && !self.samples.is_empty() {
            let avg_motion = self.samples.iter().sum::<f32>() / self.samples.len() as f32;
            self.state = if avg_motion > self.threshold {
                MotionState::Moving
            } else {
                MotionState::Idle
            };
            log::debug!("Average motion {avg_motion:.2}px, state {}", self.state);
            self.samples.clear();
        }

        self.state
    }
}

impl Default for MotionTracker {
    fn default() -> Self {
        Self::new(30, 5.0)
    }
}
