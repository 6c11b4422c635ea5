//! Latest analysis results shared between the inferer, the reporter and the HTTP endpoints.
//!
use std::sync::Mutex;

use common::presence::MotionState;
use serde::Serialize;

use crate::recognizer::RecognizedFace;

/// What the camera currently sees.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneSnapshot {
    pub faces: Vec<RecognizedFace>,
    pub motion: MotionState,
    /// Sequence number of the last analyzed frame.
    pub frame_seq: u64,
}

impl SceneSnapshot {
    /// Labels of all visible faces in detection order.
    pub fn names(&self) -> Vec<String> {
        self.faces.iter().map(|face| face.name.clone()).collect()
    }

    pub fn head_count(&self) -> usize {
        self.faces.len()
    }
}

#[derive(Default)]
pub struct Scene {
    state: Mutex<SceneSnapshot>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_faces(&self, faces: Vec<RecognizedFace>) {
        self.lock().faces = faces;
    }

    pub fn set_motion(&self, motion: MotionState) {
        self.lock().motion = motion;
    }

    pub fn set_frame_seq(&self, frame_seq: u64) {
        self.lock().frame_seq = frame_seq;
    }

    pub fn snapshot(&self) -> SceneSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SceneSnapshot> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod test {

    use common::UNKNOWN;

    use super::*;
    use crate::recognizer::FaceRect;

    fn face(name: &str) -> RecognizedFace {
        RecognizedFace {
            rect: FaceRect {
                left: 1,
                top: 2,
                right: 3,
                bottom: 4,
            },
            name: name.into(),
        }
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let scene = Scene::new();
        scene.update_faces(vec![face("17"), face(UNKNOWN)]);
        scene.set_motion(MotionState::Moving);

        let snapshot = scene.snapshot();
        scene.update_faces(vec![]);

        assert_eq!(snapshot.head_count(), 2);
        assert_eq!(snapshot.names(), vec!["17".to_owned(), UNKNOWN.to_owned()]);
        assert_eq!(snapshot.motion, MotionState::Moving);
        assert_eq!(scene.snapshot().head_count(), 0);
    }

    #[test]
    fn test_snapshot_json() -> Result<(), serde_json::Error> {
        let scene = Scene::new();
        scene.update_faces(vec![face("17")]);
        scene.set_frame_seq(42);

        let value = serde_json::to_value(scene.snapshot())?;
        assert_eq!(value["frameSeq"], 42);
        assert_eq!(value["motion"], "Idle");
        assert_eq!(value["faces"][0]["name"], "17");
        assert_eq!(value["faces"][0]["rect"]["right"], 3);

        Ok(())
    }
}
