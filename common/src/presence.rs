//! Presence events emitted by the server as JSON lines.
//!
use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse motion classification of the scene.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum MotionState {
    #[default]
    Idle,
    Moving,
}

impl fmt::Display for MotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionState::Idle => write!(f, "Idle"),
            MotionState::Moving => write!(f, "Moving"),
        }
    }
}

/// Who is in front of a camera at a given time.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub face_detected: bool,
    /// Seconds since the unix epoch.
    pub timestamp: f64,
    pub head_count: usize,
    /// Employee IDs of all visible faces, `Unknown` for unrecognized ones.
    pub emp_ids: Vec<String>,
    pub room_id: String,
    pub camera_id: String,
}

impl PresenceEvent {
    pub fn new(emp_ids: Vec<String>, room_id: &str, camera_id: &str, timestamp: f64) -> Self {
        Self {
            face_detected: !emp_ids.is_empty(),
            timestamp,
            head_count: emp_ids.len(),
            emp_ids,
            room_id: room_id.to_owned(),
            camera_id: camera_id.to_owned(),
        }
    }

    /// Placeholder used before a camera reported anything.
    pub fn empty() -> Self {
        Self {
            face_detected: false,
            timestamp: 0.0,
            head_count: 0,
            emp_ids: Vec::new(),
            room_id: String::new(),
            camera_id: String::new(),
        }
    }
}
