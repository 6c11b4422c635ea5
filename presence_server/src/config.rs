//! Runtime settings of the presence server.
//!
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Result};
use clap::ValueEnum;

use crate::{
    inferer::{InfererOptions, Schedule},
    nn::UltrafaceVariant,
    utils::models_dir,
};

/// Which analysis pipeline runs on the frames.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum Mode {
    /// Face recognition on a timer, presence reported every interval.
    #[default]
    Faces,
    /// Face recognition every few frames plus pose based motion detection, presence reported
    /// only while people move.
    Motion,
}

/// Where the known faces come from.
#[derive(Clone, Debug, PartialEq)]
pub enum RosterSource {
    /// Employee roster JSON.
    File(PathBuf),
    /// Directory of reference images named after the person.
    ImageDir(PathBuf),
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub mode: Mode,
    pub roster: RosterSource,
    pub stream_url: String,
    pub room_id: String,
    pub camera_id: String,
    pub report_interval: Duration,
    pub server_address: SocketAddr,

    pub models_dir: PathBuf,
    pub ultraface_variant: UltrafaceVariant,
    pub embedder_model: Option<PathBuf>,
    pub pose_model: Option<PathBuf>,
    /// Maximum encoding distance of a match.
    pub tolerance: f32,

    /// Recognition every n-th frame in motion mode.
    pub face_rec_interval: u64,
    /// Recognition period in faces mode.
    pub face_rec_period: Duration,
    pub motion_update_interval: u64,
    pub motion_threshold: f32,

    pub mirror: bool,
    /// How long to wait for the first camera frame.
    pub warmup: Duration,
    pub jpeg_quality: u8,
}

impl Settings {
    pub fn new(roster: RosterSource, stream_url: &str, room_id: &str, camera_id: &str) -> Self {
        Self {
            mode: Mode::default(),
            roster,
            stream_url: stream_url.to_owned(),
            room_id: room_id.to_owned(),
            camera_id: camera_id.to_owned(),
            report_interval: Duration::from_secs(5),
            server_address: SocketAddr::from(([0, 0, 0, 0], 5222)),
            models_dir: models_dir(),
            ultraface_variant: UltrafaceVariant::W320H240,
            embedder_model: None,
            pose_model: None,
            tolerance: 1.0,
            face_rec_interval: 10,
            face_rec_period: Duration::from_millis(500),
            motion_update_interval: 30,
            motion_threshold: 5.0,
            mirror: false,
            warmup: Duration::from_secs(2),
            jpeg_quality: 80,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.report_interval.is_zero() {
            bail!("report interval must be positive");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("JPEG quality must be within 1..=100, got {}", self.jpeg_quality);
        }
        if self.mode == Mode::Motion && self.pose_model.is_none() {
            bail!("motion mode needs a pose model");
        }
        if self.face_rec_interval == 0 || self.motion_update_interval == 0 {
            bail!("frame intervals must be positive");
        }

        Ok(())
    }

    pub fn schedule(&self) -> Schedule {
        match self.mode {
            Mode::Faces => Schedule::Every(self.face_rec_period),
            Mode::Motion => Schedule::EveryNthFrame(self.face_rec_interval),
        }
    }

    pub fn inferer_options(&self) -> InfererOptions {
        InfererOptions {
            schedule: self.schedule(),
            mirror: self.mirror,
            jpeg_quality: self.jpeg_quality,
        }
    }

    /// Presence is only reported while people move in motion mode.
    pub fn only_while_moving(&self) -> bool {
        self.mode == Mode::Motion
    }
}
