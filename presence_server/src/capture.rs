//! Capture of camera frames into a single shared slot.
//!
//! One producer task keeps replacing the latest frame, any number of consumers read a copy of it.
//! Consumers never see a queue: a slow consumer skips frames instead of falling behind.
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{meter::METER, source::open_mjpeg_stream};

/// A JPEG encoded camera frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Sequence number, starting at 1.
    pub seq: u64,
    pub jpeg: Bytes,
}

/// Slot holding the most recent frame.
pub struct LatestFrame {
    frame: Mutex<Option<Frame>>,
    next_seq: AtomicU64,
    closed: AtomicBool,
    seq_tx: watch::Sender<u64>,
    seq_rx: watch::Receiver<u64>,
}

impl LatestFrame {
    pub fn new() -> Self {
        let (seq_tx, seq_rx) = watch::channel(0);
        Self {
            frame: Mutex::new(None),
            next_seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            seq_tx,
            seq_rx,
        }
    }

    /// Copy of the latest frame, `None` if nothing was captured yet.
    pub fn read(&self) -> Option<Frame> {
        self.frame
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the latest frame and wake up waiting consumers.
    pub fn publish(&self, jpeg: Bytes) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut frame = self
                .frame
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *frame = Some(Frame { seq, jpeg });
        }
        self.seq_tx.send(seq).ok();

        seq
    }

    /// Wait for a frame newer than `seq`.
    ///
    /// Returns `None` once the slot is closed and holds nothing newer.
    pub async fn next_after(&self, seq: u64) -> Option<Frame> {
        let mut seq_rx = self.seq_rx.clone();
        loop {
            if let Some(frame) = self.read() {
                if frame.seq > seq {
                    return Some(frame);
                }
            }
            if self.is_closed() {
                return None;
            }
            if seq_rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Set the stop flag, consumers drain the last frame and end.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.seq_tx.send_modify(|_| ());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for LatestFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task pulling frames from a camera into a [`LatestFrame`].
pub struct FrameGrabber {
    latest: Arc<LatestFrame>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl FrameGrabber {
    /// Open the MJPEG stream at `url` and start capturing.
    pub async fn connect(client: &Client, url: &str) -> Result<Self> {
        let frames = open_mjpeg_stream(client, url).await?;
        log::info!("Connected to video stream {}", url);

        Ok(Self::spawn(frames))
    }

    /// Start capturing from an already opened frame stream.
    pub fn spawn<S>(frames: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + Unpin + 'static,
    {
        let latest = Arc::new(LatestFrame::new());
        let cancel = CancellationToken::new();

        let handle = {
            let latest = Arc::clone(&latest);
            let cancel = cancel.clone();
            tokio::spawn(capture_loop(frames, latest, cancel))
        };

        Self {
            latest,
            cancel,
            handle: Some(handle),
        }
    }

    /// Copy of the latest frame, `None` if nothing was captured yet.
    pub fn read(&self) -> Option<Frame> {
        self.latest.read()
    }

    /// Shared slot the capture task writes to.
    pub fn latest(&self) -> Arc<LatestFrame> {
        Arc::clone(&self.latest)
    }

    pub fn is_stopped(&self) -> bool {
        self.latest.is_closed()
    }

    /// Wait until the first frame arrived, give up after `timeout`.
    pub async fn wait_for_first_frame(&self, timeout: Duration) -> Option<Frame> {
        tokio::time::timeout(timeout, self.latest.next_after(0))
            .await
            .ok()
            .flatten()
    }

    /// Stop capturing and release the camera connection.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                log::warn!("Capture task failed: {e}");
            }
        }
        self.latest.close();
    }
}

impl Drop for FrameGrabber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn capture_loop<S>(mut frames: S, latest: Arc<LatestFrame>, cancel: CancellationToken)
where
    S: Stream<Item = Result<Bytes>> + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("Capture stopped");
                break;
            }
            res = frames.next() => match res {
                Some(Ok(jpeg)) => {
                    log::trace!("Captured frame ({} bytes)", jpeg.len());
                    latest.publish(jpeg);
                    METER.tick_captured();
                }
                Some(Err(e)) => {
                    log::error!("Error reading frame: {e:#}");
                    break;
                }
                None => {
                    log::info!("Video stream ended");
                    break;
                }
            }
        }
    }

    // Dropping the stream closes the camera connection
    drop(frames);
    latest.close();
}

#[cfg(test)]
mod test {

    use anyhow::anyhow;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    use super::*;

    #[test]
    fn test_uninitialized_read_is_none() {
        let latest = LatestFrame::new();
        assert_eq!(latest.read(), None);
        assert!(!latest.is_closed());
    }

    #[test]
    fn test_publish_replaces_frame() {
        let latest = LatestFrame::new();

        assert_eq!(latest.publish(Bytes::from_static(b"one")), 1);
        assert_eq!(latest.publish(Bytes::from_static(b"two")), 2);

        let frame = latest.read().expect("frame after publish");
        assert_eq!(frame.seq, 2);
        assert_eq!(&frame.jpeg[..], b"two");
    }

    #[tokio::test]
    async fn test_next_after_waits_for_newer_frame() {
        let latest = Arc::new(LatestFrame::new());
        latest.publish(Bytes::from_static(b"old"));

        let waiter = {
            let latest = Arc::clone(&latest);
            tokio::spawn(async move { latest.next_after(1).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        latest.publish(Bytes::from_static(b"new"));
        let frame = waiter.await.unwrap().expect("newer frame");
        assert_eq!(frame.seq, 2);
    }

    #[tokio::test]
    async fn test_close_ends_waiting_consumers() {
        let latest = Arc::new(LatestFrame::new());
        let waiter = {
            let latest = Arc::clone(&latest);
            tokio::spawn(async move { latest.next_after(0).await })
        };

        latest.close();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_grabber_publishes_frames() {
        let (tx, rx) = mpsc::channel(4);
        let grabber = FrameGrabber::spawn(ReceiverStream::new(rx));

        assert_eq!(grabber.read(), None);

        tx.send(Ok(Bytes::from_static(b"jpeg"))).await.unwrap();
        let frame = grabber
            .wait_for_first_frame(Duration::from_secs(1))
            .await
            .expect("first frame");
        assert_eq!(&frame.jpeg[..], b"jpeg");
    }

    #[tokio::test]
    async fn test_wait_for_first_frame_times_out() {
        let (tx, rx) = mpsc::channel::<Result<Bytes>>(4);
        let grabber = FrameGrabber::spawn(ReceiverStream::new(rx));

        // Camera connected but silent
        let started = tokio::time::Instant::now();
        let frame = grabber.wait_for_first_frame(Duration::from_millis(50)).await;
        assert_eq!(frame, None);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(!grabber.is_stopped());

        // A late frame is still captured
        tx.send(Ok(Bytes::from_static(b"late"))).await.unwrap();
        let frame = grabber
            .wait_for_first_frame(Duration::from_secs(1))
            .await
            .expect("late frame");
        assert_eq!(frame.seq, 1);
    }

    #[tokio::test]
    async fn test_wait_for_first_frame_of_ended_stream() {
        let (tx, rx) = mpsc::channel::<Result<Bytes>>(4);
        let grabber = FrameGrabber::spawn(ReceiverStream::new(rx));
        drop(tx);

        let frame = grabber.wait_for_first_frame(Duration::from_secs(5)).await;
        assert_eq!(frame, None);
        assert!(grabber.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_releases_stream() {
        let (tx, rx) = mpsc::channel::<Result<Bytes>>(4);
        let mut grabber = FrameGrabber::spawn(ReceiverStream::new(rx));

        grabber.stop().await;

        assert!(grabber.is_stopped());
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_read_error_stops_capture() {
        let (tx, rx) = mpsc::channel(4);
        let grabber = FrameGrabber::spawn(ReceiverStream::new(rx));

        tx.send(Ok(Bytes::from_static(b"last good"))).await.unwrap();
        tx.send(Err(anyhow!("camera gone"))).await.unwrap();

        let latest = grabber.latest();
        assert_eq!(latest.next_after(0).await.map(|f| f.seq), Some(1));
        assert_eq!(latest.next_after(1).await, None);
        assert!(grabber.is_stopped());
        // The last frame stays readable after the capture stopped
        assert_eq!(grabber.read().map(|f| f.seq), Some(1));
    }
}
