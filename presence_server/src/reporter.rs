//! Periodic presence events as JSON lines.
//!
use std::{sync::Arc, time::Duration};

use anyhow::Result;
use common::presence::{MotionState, PresenceEvent};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::{interval, MissedTickBehavior},
};

use crate::{
    scene::{Scene, SceneSnapshot},
    utils::unix_timestamp,
};

pub struct PresenceReporter {
    room_id: String,
    camera_id: String,
    interval: Duration,
    /// Stay silent while the scene is idle.
    only_while_moving: bool,
}

impl PresenceReporter {
    pub fn new(
        room_id: &str,
        camera_id: &str,
        interval: Duration,
        only_while_moving: bool,
    ) -> Self {
        Self {
            room_id: room_id.to_owned(),
            camera_id: camera_id.to_owned(),
            interval,
            only_while_moving,
        }
    }

    /// Event describing `snapshot`, `None` if nothing should be reported.
    pub fn next_event(&self, snapshot: &SceneSnapshot, timestamp: f64) -> Option<PresenceEvent> {
        if self.only_while_moving && snapshot.motion == MotionState::Idle {
            return None;
        }

        Some(PresenceEvent::new(
            snapshot.names(),
            &self.room_id,
            &self.camera_id,
            timestamp,
        ))
    }

    /// Write one event per interval to `writer`, the first one right away.
    ///
    /// Only returns on a write error.
    pub async fn run<W>(self, scene: Arc<Scene>, mut writer: W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let snapshot = scene.snapshot();
            let Some(event) = self.next_event(&snapshot, unix_timestamp()) else {
                log::trace!("Scene idle, no presence event");
                continue;
            };

            let mut line = serde_json::to_vec(&event)?;
            line.push(b'\n');
            writer.write_all(&line).await?;
            writer.flush().await?;

            log::debug!(
                "Reported {} people in room {}",
                event.head_count,
                self.room_id
            );
        }
    }
}
