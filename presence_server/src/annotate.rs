//! Drawing of analysis results onto frames and their encoding for the MJPEG feed.
//!
use std::io::Cursor;

use anyhow::Result;
use bytes::Bytes;
use common::{presence::MotionState, roster::Roster, UNKNOWN};
use image::{codecs::jpeg::JpegEncoder, ColorType, Rgb, RgbImage};
use imageproc::{
    drawing::{
        draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut,
    },
    rect::Rect,
};
use lazy_static::lazy_static;
use rusttype::Scale;

use crate::{
    pose::{Keypoint, SKELETON},
    recognizer::RecognizedFace,
};

const FACE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const HEAD_COUNT_COLOR: Rgb<u8> = Rgb([0, 255, 255]);
const STATE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BONE_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const JOINT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

const LABEL_SCALE: Scale = Scale { x: 20.0, y: 20.0 };
const STATUS_SCALE: Scale = Scale { x: 26.0, y: 26.0 };

/// Keypoints below this score are not drawn.
const MIN_KEYPOINT_SCORE: f32 = 0.3;

lazy_static! {
    static ref DEJAVU_MONO: rusttype::Font<'static> = {
        let font_data: &[u8] = include_bytes!("../../resources/DejaVuSansMono.ttf");
        let font: rusttype::Font<'static> =
            rusttype::Font::try_from_bytes(font_data).expect("failed to load font");
        font
    };
}

/// Everything drawn onto one frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct Overlay<'a> {
    pub faces: &'a [RecognizedFace],
    pub landmarks: Option<&'a [Keypoint]>,
    /// Only drawn when motion detection runs.
    pub motion: Option<MotionState>,
}

pub struct Annotator {
    roster: Roster,
}

impl Annotator {
    pub fn new(roster: Roster) -> Self {
        Self { roster }
    }

    /// Text shown next to a face: the employee name, or the raw label if the ID is not on the
    /// roster.
    pub fn label<'a>(&'a self, face: &'a RecognizedFace) -> &'a str {
        if face.name == UNKNOWN {
            return UNKNOWN;
        }
        self.roster
            .display_name(&face.name)
            .unwrap_or(face.name.as_str())
    }

    pub fn draw(&self, frame: &mut RgbImage, overlay: &Overlay) {
        if let Some(landmarks) = overlay.landmarks {
            draw_skeleton(frame, landmarks);
        }

        for face in overlay.faces.iter() {
            let rect = face.rect;
            if rect.width() == 0 || rect.height() == 0 {
                continue;
            }

            // Two nested rectangles for a 2px border
            let outer =
                Rect::at(rect.left as i32, rect.top as i32).of_size(rect.width(), rect.height());
            draw_hollow_rect_mut(frame, outer, FACE_COLOR);
            if rect.width() > 2 && rect.height() > 2 {
                let inner = Rect::at(rect.left as i32 + 1, rect.top as i32 + 1)
                    .of_size(rect.width() - 2, rect.height() - 2);
                draw_hollow_rect_mut(frame, inner, FACE_COLOR);
            }

            let label_y = rect.top as i32 - LABEL_SCALE.y as i32 - 4;
            draw_text_mut(
                frame,
                FACE_COLOR,
                rect.left as i32,
                label_y.max(0),
                LABEL_SCALE,
                &DEJAVU_MONO,
                self.label(face),
            );
        }

        let head_count_y = match overlay.motion {
            Some(motion) => {
                draw_text_mut(
                    frame,
                    STATE_COLOR,
                    10,
                    10,
                    STATUS_SCALE,
                    &DEJAVU_MONO,
                    &format!("State: {motion}"),
                );
                50
            }
            None => 10,
        };

        draw_text_mut(
            frame,
            HEAD_COUNT_COLOR,
            10,
            head_count_y,
            STATUS_SCALE,
            &DEJAVU_MONO,
            &format!("Head Count: {}", overlay.faces.len()),
        );
    }
}

fn draw_skeleton(frame: &mut RgbImage, landmarks: &[Keypoint]) {
    let visible = |idx: usize| {
        landmarks
            .get(idx)
            .filter(|kp| kp.score >= MIN_KEYPOINT_SCORE)
    };

    for (a, b) in SKELETON.iter() {
        if let (Some(a), Some(b)) = (visible(*a), visible(*b)) {
            draw_line_segment_mut(frame, (a.x, a.y), (b.x, b.y), BONE_COLOR);
        }
    }

    for kp in landmarks.iter().filter(|kp| kp.score >= MIN_KEYPOINT_SCORE) {
        draw_filled_circle_mut(frame, (kp.x as i32, kp.y as i32), 3, JOINT_COLOR);
    }
}

/// Encode a frame as JPEG.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let (width, height) = frame.dimensions();
    let mut buf = Cursor::new(Vec::new());

    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        frame,
        width,
        height,
        ColorType::Rgb8,
    )?;

    Ok(buf.into_inner())
}

/// Wrap a JPEG image into one part of a `multipart/x-mixed-replace; boundary=frame` body.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n".as_bytes(),
        ]
        .concat(),
    )
}
