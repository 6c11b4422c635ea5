//! Presence server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use common::roster::Roster;
use env_logger::TimestampPrecision;
use presence_server::{
    annotate::Annotator,
    capture::FrameGrabber,
    config::{Mode, RosterSource, Settings},
    endpoints::{build_router, AppState},
    inferer::Inferer,
    meter::spawn_meter_logger,
    motion::MotionTracker,
    nn::{UltrafaceModel, UltrafaceVariant},
    pose::MoveNetModel,
    recognizer::{FaceEmbedder, FaceRecognizer, OnnxEmbedder},
    reporter::PresenceReporter,
    scene::Scene,
    FEED_CHANNEL_CAPACITY,
};
use tokio::sync::broadcast;

const MAX_IOU: f32 = 0.5;
const MIN_FACE_CONFIDENCE: f32 = 0.5;
const MIN_POSE_CONFIDENCE: f32 = 0.5;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Employee roster JSON, ignored with `--images-dir`
    roster: PathBuf,

    /// URL of the MJPEG camera stream
    stream_url: String,

    /// Room reported in presence events
    room_id: String,

    /// Camera reported in presence events
    camera_id: String,

    /// Seconds between presence events
    interval_secs: f64,

    /// Further arguments of the job runner, ignored
    #[clap(hide = true)]
    _extra: Vec<String>,

    /// Analysis pipeline
    #[clap(long, value_enum, default_value_t = Mode::Faces)]
    mode: Mode,

    /// Address to serve the annotated stream on
    #[clap(long, default_value = "0.0.0.0:5222")]
    server_address: SocketAddr,

    /// Directory of the face detection model, downloaded there if missing
    #[clap(long)]
    models_dir: Option<PathBuf>,

    /// Input width of the face detector, 320 or 640
    #[clap(long, default_value_t = 320)]
    ultraface_variant: u32,

    /// ONNX face embedding model, without it every face is unknown
    #[clap(long)]
    embedder_model: Option<PathBuf>,

    /// ONNX MoveNet model, required in motion mode
    #[clap(long)]
    pose_model: Option<PathBuf>,

    /// Maximum encoding distance of a match
    #[clap(long, default_value_t = 1.0)]
    tolerance: f32,

    /// Run face recognition every n-th frame in motion mode
    #[clap(long, default_value_t = 10)]
    face_rec_interval: u64,

    /// Run face recognition every n milliseconds in faces mode
    #[clap(long, default_value_t = 500)]
    face_rec_period_ms: u64,

    /// Frames averaged for one motion decision
    #[clap(long, default_value_t = 30)]
    motion_update_interval: u64,

    /// Mean keypoint displacement in pixels above which people are moving
    #[clap(long, default_value_t = 5.0)]
    motion_threshold: f32,

    /// Flip frames horizontally
    #[clap(long)]
    mirror: bool,

    /// Milliseconds to wait for the first frame
    #[clap(long, default_value_t = 2000)]
    warmup_ms: u64,

    /// Quality of the served JPEG frames
    #[clap(long, default_value_t = 80)]
    jpeg_quality: u8,

    /// Use a directory of reference images instead of the roster
    #[clap(long)]
    images_dir: Option<PathBuf>,
}

impl Args {
    fn into_settings(self) -> Result<Settings> {
        let roster = match self.images_dir {
            Some(dir) => RosterSource::ImageDir(dir),
            None => RosterSource::File(self.roster),
        };
        let ultraface_variant = match self.ultraface_variant {
            320 => UltrafaceVariant::W320H240,
            640 => UltrafaceVariant::W640H480,
            other => bail!("unknown Ultraface variant {other}, use 320 or 640"),
        };
        if self.interval_secs <= 0.0 {
            bail!("interval must be a positive number of seconds");
        }
        let report_interval = Duration::try_from_secs_f64(self.interval_secs)
            .with_context(|| format!("interval of {} seconds out of range", self.interval_secs))?;

        let mut settings = Settings::new(roster, &self.stream_url, &self.room_id, &self.camera_id);
        settings.mode = self.mode;
        settings.report_interval = report_interval;
        settings.server_address = self.server_address;
        if let Some(models_dir) = self.models_dir {
            settings.models_dir = models_dir;
        }
        settings.ultraface_variant = ultraface_variant;
        settings.embedder_model = self.embedder_model;
        settings.pose_model = self.pose_model;
        settings.tolerance = self.tolerance;
        settings.face_rec_interval = self.face_rec_interval;
        settings.face_rec_period = Duration::from_millis(self.face_rec_period_ms);
        settings.motion_update_interval = self.motion_update_interval;
        settings.motion_threshold = self.motion_threshold;
        settings.mirror = self.mirror;
        settings.warmup = Duration::from_millis(self.warmup_ms);
        settings.jpeg_quality = self.jpeg_quality;

        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Args::parse().into_settings()?;

    // Setup logger, stdout is reserved for presence events
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let roster = match &settings.roster {
        RosterSource::File(path) => Roster::from_path(path)?,
        RosterSource::ImageDir(dir) => Roster::from_image_dir(dir)?,
    };
    log::info!("Roster with {} employees", roster.len());

    // Build face recognition and encode the known faces
    let detector = UltrafaceModel::new(
        &settings.models_dir,
        settings.ultraface_variant,
        MAX_IOU,
        MIN_FACE_CONFIDENCE,
    )
    .await?;
    let embedder = match &settings.embedder_model {
        Some(path) => Some(Box::new(OnnxEmbedder::from_path(path)?) as Box<dyn FaceEmbedder>),
        None => None,
    };
    let mut recognizer = FaceRecognizer::new(Box::new(detector), embedder, settings.tolerance);
    recognizer.load_roster(&roster);

    // Open the camera stream
    let client = reqwest::Client::new();
    let mut grabber = FrameGrabber::connect(&client, &settings.stream_url).await?;
    match grabber.wait_for_first_frame(settings.warmup).await {
        Some(frame) => log::info!("First frame received ({} bytes)", frame.jpeg.len()),
        None => log::warn!("No frame within {:?}, continuing", settings.warmup),
    }

    let scene = Arc::new(Scene::new());
    let (feed_tx, _) = broadcast::channel(FEED_CHANNEL_CAPACITY);

    let mut inferer = Inferer::new(
        recognizer,
        Annotator::new(roster),
        settings.inferer_options(),
        Arc::clone(&scene),
        feed_tx.clone(),
    );
    if settings.mode == Mode::Motion {
        if let Some(pose_model) = &settings.pose_model {
            let pose = MoveNetModel::from_path(pose_model, MIN_POSE_CONFIDENCE)?;
            let tracker =
                MotionTracker::new(settings.motion_update_interval, settings.motion_threshold);
            inferer = inferer.with_motion(Box::new(pose), tracker);
        }
    }

    // Spawn separate task to run the inference on
    let inferer_handle = tokio::spawn(inferer.run(grabber.latest()));

    let reporter = PresenceReporter::new(
        &settings.room_id,
        &settings.camera_id,
        settings.report_interval,
        settings.only_while_moving(),
    );
    {
        let scene = Arc::clone(&scene);
        tokio::spawn(async move {
            if let Err(e) = reporter.run(scene, tokio::io::stdout()).await {
                log::error!("Presence reporting stopped: {e:#}");
            }
        });
    }

    spawn_meter_logger();

    // Build HTTP server with endpoints
    let app = build_router(Arc::new(AppState { scene, feed_tx }));

    // Serve HTTP server until interrupted or the camera stream ends
    log::info!("Serving on http://{}", settings.server_address);
    let server = axum::Server::bind(&settings.server_address).serve(app.into_make_service());
    tokio::select! {
        res = server => res?,
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted, shutting down"),
        _ = inferer_handle => log::warn!("Video stream ended, shutting down"),
    }

    grabber.stop().await;

    Ok(())
}

#[cfg(test)]
mod test {

    use super::*;

    fn parse(args: &[&str]) -> Result<Settings> {
        let base = ["presence_server", "roster.json", "http://cam/video", "room-1", "cam-2"];
        Args::try_parse_from(base.iter().chain(args))?.into_settings()
    }

    #[test]
    fn test_positional_arguments() -> Result<()> {
        let settings = parse(&["2.5", "true", "extra"])?;

        assert_eq!(settings.roster, RosterSource::File("roster.json".into()));
        assert_eq!(settings.stream_url, "http://cam/video");
        assert_eq!(settings.room_id, "room-1");
        assert_eq!(settings.camera_id, "cam-2");
        assert_eq!(settings.report_interval, Duration::from_millis(2500));

        Ok(())
    }

    #[test]
    fn test_images_dir_replaces_roster() -> Result<()> {
        let settings = parse(&["5", "--images-dir", "faces"])?;
        assert_eq!(settings.roster, RosterSource::ImageDir("faces".into()));

        Ok(())
    }

    #[test]
    fn test_rejects_bad_intervals() {
        for interval in ["0", "-1", "NaN", "inf", "1e300"] {
            assert!(parse(&[interval]).is_err(), "accepted interval {interval}");
        }
    }
}
