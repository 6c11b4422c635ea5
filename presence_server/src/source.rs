//! Ingest of MJPEG streams served by IP cameras and phone camera apps.
//!
//! Cameras disagree on boundary names and on whether parts carry a `Content-Length`, so the
//! decoder does not rely on the multipart framing. An announced `Content-Length` is used when it
//! ends on an end-of-image marker, otherwise the JPEG segments are walked by their length fields.
//! Embedded thumbnails in EXIF segments are skipped that way instead of ending the frame early.
use std::{io, pin::Pin};

use anyhow::{bail, Context, Result};
use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::{header::CONTENT_TYPE, Client};
use tokio_util::{
    codec::{Decoder, FramedRead},
    io::StreamReader,
};

/// JPEG start-of-image marker.
const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
const EOI: [u8; 2] = [0xFF, 0xD9];
/// Start-of-scan marker code, entropy coded data follows its header.
const SOS: u8 = 0xDA;

/// Upper bound for a single buffered image.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Bytes kept while waiting for the next image, enough for the part headers.
const MAX_PART_HEADER_LEN: usize = 1024;

/// Stream of JPEG encoded frames.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Result of searching the buffered image for its end.
#[derive(Debug, PartialEq)]
enum Scan {
    /// The image ends at this offset.
    Complete(usize),
    Incomplete,
    /// No valid marker at this offset.
    Corrupt(usize),
}

/// Codec extracting JPEG images from a multipart MJPEG byte stream.
#[derive(Debug)]
pub struct MjpegDecoder {
    max_frame_len: usize,
    /// Parse position inside the buffered image, zero while looking for the next image.
    pos: usize,
    /// `pos` is inside entropy coded scan data.
    in_scan: bool,
    /// Length announced by the part headers of the buffered image.
    content_length: Option<usize>,
}

impl MjpegDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            pos: 0,
            in_scan: false,
            content_length: None,
        }
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.in_scan = false;
        self.content_length = None;
    }

    /// Drop everything before the next SOI and remember its part headers.
    ///
    /// Returns false if no image starts in `src` yet.
    fn start_image(&mut self, src: &mut BytesMut) -> bool {
        match find_marker(src, &SOI, 0) {
            None => {
                if src.len() > MAX_PART_HEADER_LEN {
                    src.advance(src.len() - MAX_PART_HEADER_LEN);
                }
                false
            }
            Some(start) => {
                let max_len = self.max_frame_len;
                self.content_length = content_length(&src[..start])
                    .filter(|len| (SOI.len() + EOI.len()..=max_len).contains(len));
                if start > 0 {
                    log::trace!("Skipping {} bytes of part headers", start);
                    src.advance(start);
                }
                self.pos = SOI.len();
                true
            }
        }
    }

    /// Continue searching the end of the image starting at the beginning of `src`.
    fn find_image_end(&mut self, src: &[u8]) -> Scan {
        if let Some(len) = self.content_length {
            if src.len() < len {
                return Scan::Incomplete;
            }
            if src[len - EOI.len()..len] == EOI {
                return Scan::Complete(len);
            }
            log::debug!("Content-Length {len} does not end an image, reading markers");
            self.content_length = None;
        }

        loop {
            if self.in_scan {
                // Scan data ends at the first marker that is neither a stuffed 0xFF nor a restart
                loop {
                    let Some(ff) = src
                        .get(self.pos..)
                        .and_then(|rest| rest.iter().position(|b| *b == 0xFF))
                    else {
                        self.pos = self.pos.max(src.len());
                        return Scan::Incomplete;
                    };
                    let at = self.pos + ff;
                    match src.get(at + 1) {
                        None => {
                            self.pos = at;
                            return Scan::Incomplete;
                        }
                        Some(0x00 | 0xD0..=0xD7) => self.pos = at + 2,
                        Some(0xFF) => self.pos = at + 1,
                        Some(_) => {
                            self.pos = at;
                            self.in_scan = false;
                            break;
                        }
                    }
                }
            }

            let marker = match src.get(self.pos..self.pos + 2) {
                Some(&[0xFF, marker]) => marker,
                Some(_) => return Scan::Corrupt(self.pos),
                None => return Scan::Incomplete,
            };
            match marker {
                // Fill byte
                0xFF => self.pos += 1,
                0xD9 => return Scan::Complete(self.pos + EOI.len()),
                0x01 | 0xD0..=0xD7 => self.pos += 2,
                0x00 | 0xD8 => return Scan::Corrupt(self.pos),
                _ => {
                    let Some(&[hi, lo]) = src.get(self.pos + 2..self.pos + 4) else {
                        return Scan::Incomplete;
                    };
                    let segment_len = u16::from_be_bytes([hi, lo]) as usize;
                    if segment_len < 2 {
                        return Scan::Corrupt(self.pos);
                    }
                    self.pos += 2 + segment_len;
                    self.in_scan = marker == SOS;
                }
            }
        }
    }
}

impl Default for MjpegDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for MjpegDecoder {
    type Item = Bytes;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            if self.pos == 0 && !self.start_image(src) {
                return Ok(None);
            }

            match self.find_image_end(src) {
                Scan::Complete(end) => {
                    self.reset();
                    return Ok(Some(src.split_to(end).freeze()));
                }
                Scan::Incomplete => {
                    if src.len() > self.max_frame_len {
                        bail!(
                            "no end of image after {} bytes, limit is {}",
                            src.len(),
                            self.max_frame_len
                        );
                    }
                    return Ok(None);
                }
                Scan::Corrupt(offset) => {
                    log::debug!("Corrupt image data at offset {offset}, looking for next image");
                    src.advance(offset.clamp(SOI.len(), src.len()));
                    self.reset();
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !buf.is_empty() {
                    log::debug!("Dropping {} bytes of incomplete frame", buf.len());
                    buf.clear();
                }
                self.reset();
                Ok(None)
            }
        }
    }
}

fn find_marker(haystack: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|pos| pos + from)
}

/// Value of the last `Content-Length` header in `headers`.
fn content_length(headers: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(headers)
        .lines()
        .rev()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
}

/// Connect to an MJPEG endpoint and return the stream of frames it delivers.
///
/// Fails if the camera cannot be reached or answers with a non-success status.
pub async fn open_mjpeg_stream(client: &Client, url: &str) -> Result<FrameStream> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("cannot open video stream {url}"))?;

    if !resp.status().is_success() {
        bail!("cannot open video stream {}: HTTP {}", url, resp.status());
    }

    match resp.headers().get(CONTENT_TYPE) {
        Some(content_type) => log::debug!("Stream {} has content type {:?}", url, content_type),
        None => log::debug!("Stream {} has no content type", url),
    }

    let body = resp
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
    let frames = FramedRead::new(StreamReader::new(body), MjpegDecoder::default());

    Ok(Box::pin(frames))
}

#[cfg(test)]
mod test {

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::annotate::encode_jpeg;

    /// Minimal image: SOI, an empty scan header, scan data and EOI.
    fn fake_jpeg(payload: &[u8]) -> Vec<u8> {
        [&SOI[..], &[0xFF, SOS, 0x00, 0x02], payload, &EOI[..]].concat()
    }

    /// Real JPEG whose APP1 segment holds a thumbnail JPEG with its own SOI and EOI.
    fn jpeg_with_exif_thumbnail() -> Vec<u8> {
        let thumbnail = encode_jpeg(&RgbImage::from_pixel(8, 8, Rgb([10, 200, 10])), 80)
            .expect("encodable thumbnail");
        let image = encode_jpeg(&RgbImage::from_pixel(64, 48, Rgb([200, 10, 10])), 80)
            .expect("encodable image");
        let app1_len = (2 + 6 + thumbnail.len()) as u16;

        let parts: [&[u8]; 6] = [
            &image[..2],
            &[0xFF, 0xE1],
            &app1_len.to_be_bytes(),
            b"Exif\0\0",
            &thumbnail,
            &image[2..],
        ];
        parts.concat()
    }

    fn part(jpeg: &[u8]) -> Vec<u8> {
        [
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_slice(),
            jpeg,
            b"\r\n".as_slice(),
        ]
        .concat()
    }

    fn part_with_length(jpeg: &[u8], content_length: usize) -> Vec<u8> {
        let headers = format!(
            "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {content_length}\r\n\r\n"
        );
        [headers.as_bytes(), jpeg, b"\r\n".as_slice()].concat()
    }

    #[test]
    fn test_decodes_consecutive_parts() -> Result<()> {
        let first = fake_jpeg(b"first");
        let second = fake_jpeg(b"second");
        let mut buf = BytesMut::from(&[part(&first), part(&second)].concat()[..]);
        let mut decoder = MjpegDecoder::default();

        assert_eq!(decoder.decode(&mut buf)?.as_deref(), Some(&first[..]));
        assert_eq!(decoder.decode(&mut buf)?.as_deref(), Some(&second[..]));
        assert_eq!(decoder.decode(&mut buf)?, None);

        Ok(())
    }

    #[test]
    fn test_exif_thumbnail_does_not_end_frame() -> Result<()> {
        let jpeg = jpeg_with_exif_thumbnail();
        let mut buf = BytesMut::from(&[part(&jpeg), part(&jpeg)].concat()[..]);
        let mut decoder = MjpegDecoder::default();

        for _ in 0..2 {
            let frame = decoder.decode(&mut buf)?.expect("complete frame");
            assert_eq!(&frame[..], &jpeg[..]);
            let image = image::load_from_memory(&frame)?;
            assert_eq!((image.width(), image.height()), (64, 48));
        }

        Ok(())
    }

    #[test]
    fn test_markers_split_across_reads() -> Result<()> {
        let jpeg = jpeg_with_exif_thumbnail();
        let stream = part(&jpeg);
        let mut decoder = MjpegDecoder::default();
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();

        // Feed one byte at a time to split every marker and length field
        for byte in stream {
            buf.extend_from_slice(&[byte]);
            if let Some(frame) = decoder.decode(&mut buf)? {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &jpeg[..]);

        Ok(())
    }

    #[test]
    fn test_content_length_cuts_frame() -> Result<()> {
        // Not walkable as JPEG segments, only the announced length finds its end
        let opaque = [&SOI[..], b"opaque body", &EOI[..]].concat();
        let mut buf = BytesMut::from(&part_with_length(&opaque, opaque.len())[..]);
        let mut decoder = MjpegDecoder::default();

        assert_eq!(decoder.decode(&mut buf)?.as_deref(), Some(&opaque[..]));

        Ok(())
    }

    #[test]
    fn test_wrong_content_length_falls_back_to_markers() -> Result<()> {
        let jpeg = fake_jpeg(b"image");
        let mut buf = BytesMut::from(&part_with_length(&jpeg, 5)[..]);
        let mut decoder = MjpegDecoder::default();

        assert_eq!(decoder.decode(&mut buf)?.as_deref(), Some(&jpeg[..]));

        Ok(())
    }

    #[test]
    fn test_content_length_header() {
        assert_eq!(
            content_length(b"\r\n--frame\r\ncontent-length:  42\r\n\r\n"),
            Some(42)
        );
        assert_eq!(content_length(b"--frame\r\nContent-Type: image/jpeg\r\n"), None);
    }

    #[test]
    fn test_garbage_without_image_is_dropped() -> Result<()> {
        let mut garbage = vec![b'x'; 3 * MAX_PART_HEADER_LEN];
        garbage.push(0xFF);
        let mut buf = BytesMut::from(&garbage[..]);
        let mut decoder = MjpegDecoder::default();

        assert_eq!(decoder.decode(&mut buf)?, None);
        assert_eq!(buf.len(), MAX_PART_HEADER_LEN);
        assert_eq!(buf.last(), Some(&0xFF));

        // The trailing 0xFF completes an SOI with the next read
        buf.extend_from_slice(&[0xD8, 0xFF, SOS, 0x00, 0x02, 1, 2, 0xFF, 0xD9]);
        assert_eq!(
            decoder.decode(&mut buf)?.as_deref(),
            Some(&[0xFF, 0xD8, 0xFF, SOS, 0x00, 0x02, 1, 2, 0xFF, 0xD9][..])
        );

        Ok(())
    }

    #[test]
    fn test_corrupt_image_is_skipped() -> Result<()> {
        let good = fake_jpeg(b"good");
        let mut buf = BytesMut::from(&[part(b"\xFF\xD8broken"), part(&good)].concat()[..]);
        let mut decoder = MjpegDecoder::default();

        assert_eq!(decoder.decode(&mut buf)?.as_deref(), Some(&good[..]));

        Ok(())
    }

    #[test]
    fn test_oversized_frame_is_an_error() {
        let mut buf = BytesMut::from(&fake_jpeg(&[0u8; 64])[..64]);
        let mut decoder = MjpegDecoder::new(32);

        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_incomplete_frame_at_eof_is_dropped() -> Result<()> {
        let mut buf = BytesMut::from(&part(&fake_jpeg(b"truncated")[..12])[..]);
        let mut decoder = MjpegDecoder::default();

        assert_eq!(decoder.decode_eof(&mut buf)?, None);
        assert!(buf.is_empty());

        Ok(())
    }
}
