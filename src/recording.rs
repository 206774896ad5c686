//! C4: RecordingTee — a second consumer of the encoder's output, writing
//! a container file via a caller-supplied, already-open file descriptor.
//!
//! Grounded on `webrtc/raii_guards.rs`'s `PipelineGuard`/`CleanupGuard`:
//! that file's `CleanupGuard<F>` correctly uses `Option<F>` + `.take()` so
//! its closure runs exactly once even under panic, while its sibling
//! `SharedCleanupGuard` has a known limitation (its own comment admits it
//! cannot actually invoke a boxed `FnOnce` from `Drop`). This module
//! follows the correct pattern: the typestate below
//! (`Opening -> TracksPending -> Started -> Stopping -> Closed`) is driven
//! by explicit calls, not by `Drop` alone, and the file descriptor is
//! declared after the muxer so Rust's field drop order closes it strictly
//! after the muxer releases.

use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::encoder::EncoderSink;
use crate::error::MuxerError;
use crate::frame_bus::EncodedFrame;

/// The container muxer collaborator. Concrete implementations wrap a
/// real muxer (e.g. an MP4 writer) bound to the file handed to
/// [`RecordingTee::new`]; tests use `crate::testutil::FakeMuxer`.
pub trait MuxerFile: Send {
    fn add_video_track(&mut self, width: u32, height: u32, sps: &[u8], pps: &[u8]) -> Result<(), MuxerError>;
    fn add_audio_track(&mut self, sample_rate: u32, channels: u16) -> Result<(), MuxerError>;
    fn start(&mut self, orientation_deg: u32) -> Result<(), MuxerError>;
    fn write_video_sample(&mut self, data: &[u8], pts_us: u64, is_key: bool) -> Result<(), MuxerError>;
    fn write_audio_sample(&mut self, data: &[u8], pts_us: u64) -> Result<(), MuxerError>;
    fn stop(&mut self) -> Result<(), MuxerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordingState {
    Opening,
    TracksPending,
    Started,
    Stopping,
    Closed,
}

struct Tracks {
    video_added: bool,
    audio_expected: bool,
    audio_added: bool,
}

struct Inner {
    state: RecordingState,
    tracks: Tracks,
    last_video_pts: Option<u64>,
    last_audio_pts: Option<u64>,
    orientation_deg: u32,
    muxer_broken: bool,
    video_width: u32,
    video_height: u32,
}

/// Owns the muxer first, the file descriptor second, so the field drop
/// order closes the fd strictly after the muxer is released.
pub struct RecordingTee {
    muxer: Mutex<Box<dyn MuxerFile>>,
    _file: Option<std::fs::File>,
    inner: Mutex<Inner>,
}

impl RecordingTee {
    /// `file` must already be open read-write; this type never creates or
    /// deletes it. `video_width`/`video_height` are the requested
    /// recording dimensions the video track is declared with; `0x0` means
    /// they were not yet known when recording started.
    pub fn new(
        muxer: Box<dyn MuxerFile>,
        file: std::fs::File,
        expect_audio: bool,
        orientation_deg: u32,
        video_width: u32,
        video_height: u32,
    ) -> Self {
        Self {
            muxer: Mutex::new(muxer),
            _file: Some(file),
            inner: Mutex::new(Inner {
                state: RecordingState::Opening,
                tracks: Tracks {
                    video_added: false,
                    audio_expected: expect_audio,
                    audio_added: false,
                },
                last_video_pts: None,
                last_audio_pts: None,
                orientation_deg,
                muxer_broken: false,
                video_width,
                video_height,
            }),
        }
    }

    fn maybe_start(&self, inner: &mut Inner) {
        if inner.state != RecordingState::TracksPending {
            return;
        }
        let ready = inner.tracks.video_added && (!inner.tracks.audio_expected || inner.tracks.audio_added);
        if !ready {
            return;
        }
        match self.muxer.lock().start(inner.orientation_deg) {
            Ok(()) => {
                inner.state = RecordingState::Started;
                info!("recording muxer started");
            }
            Err(e) => {
                error!(error = %e, "failed to start muxer");
                inner.muxer_broken = true;
            }
        }
    }

    pub fn on_audio_format(&self, sample_rate: u32, channels: u16) {
        let mut inner = self.inner.lock();
        if inner.muxer_broken || inner.state == RecordingState::Stopping || inner.state == RecordingState::Closed {
            return;
        }
        if let Err(e) = self.muxer.lock().add_audio_track(sample_rate, channels) {
            error!(error = %e, "failed to add audio track");
            inner.muxer_broken = true;
            return;
        }
        inner.tracks.audio_added = true;
        if inner.state == RecordingState::Opening {
            inner.state = RecordingState::TracksPending;
        }
        self.maybe_start(&mut inner);
    }

    pub fn on_audio_sample(&self, data: &[u8], pts_us: u64) {
        let mut inner = self.inner.lock();
        if inner.state != RecordingState::Started || inner.muxer_broken {
            return;
        }
        let pts = normalize_track_pts(&mut inner.last_audio_pts, pts_us);
        if let Err(e) = self.muxer.lock().write_audio_sample(data, pts) {
            warn!(error = %e, "muxer rejected audio sample, marking stopped");
            inner.muxer_broken = true;
        }
    }

    /// Ordered stop sequence: stop accepting frames, allow
    /// a bounded drain window, stop the muxer, release. Idempotent.
    pub async fn stop(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == RecordingState::Stopping || inner.state == RecordingState::Closed {
                return;
            }
            inner.state = RecordingState::Stopping;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut inner = self.inner.lock();
        if !inner.muxer_broken {
            if let Err(e) = self.muxer.lock().stop() {
                warn!(error = %e, "muxer stop reported an error, file may be partial");
            }
        }
        inner.state = RecordingState::Closed;
        info!("recording tee closed");
    }

    pub fn is_recording(&self) -> bool {
        matches!(
            self.inner.lock().state,
            RecordingState::Started | RecordingState::TracksPending | RecordingState::Opening
        )
    }
}

fn normalize_track_pts(last: &mut Option<u64>, candidate: u64) -> u64 {
    let normalized = match *last {
        None => 0,
        Some(prev) if candidate <= prev => prev + 1,
        Some(_) => candidate,
    };
    *last = Some(normalized);
    normalized
}

impl EncoderSink for RecordingTee {
    fn on_codec_config(&self, _epoch: u64, sps: Bytes, pps: Bytes) {
        let mut inner = self.inner.lock();
        if inner.muxer_broken || inner.tracks.video_added {
            return;
        }
        let (width, height) = (inner.video_width, inner.video_height);
        if let Err(e) = self.muxer.lock().add_video_track(width, height, &sps, &pps) {
            error!(error = %e, "failed to add video track");
            inner.muxer_broken = true;
            return;
        }
        inner.tracks.video_added = true;
        if inner.state == RecordingState::Opening {
            inner.state = RecordingState::TracksPending;
        }
        self.maybe_start(&mut inner);
    }

    fn on_frame(&self, frame: EncodedFrame) {
        let mut inner = self.inner.lock();
        if inner.state != RecordingState::Started || inner.muxer_broken {
            return;
        }
        let pts = normalize_track_pts(&mut inner.last_video_pts, frame.pts_us);
        if let Err(e) = self
            .muxer
            .lock()
            .write_video_sample(&frame.data, pts, frame.is_keyframe)
        {
            warn!(error = %e, "muxer rejected video sample, marking stopped");
            inner.muxer_broken = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeMuxer {
        video_added: bool,
        started: bool,
        samples: Arc<AtomicUsize>,
        fail_on_write: bool,
        added_dimensions: Arc<Mutex<Option<(u32, u32)>>>,
    }

    impl MuxerFile for FakeMuxer {
        fn add_video_track(&mut self, w: u32, h: u32, _sps: &[u8], _pps: &[u8]) -> Result<(), MuxerError> {
            self.video_added = true;
            *self.added_dimensions.lock() = Some((w, h));
            Ok(())
        }
        fn add_audio_track(&mut self, _rate: u32, _ch: u16) -> Result<(), MuxerError> {
            Ok(())
        }
        fn start(&mut self, _orientation_deg: u32) -> Result<(), MuxerError> {
            self.started = true;
            Ok(())
        }
        fn write_video_sample(&mut self, _data: &[u8], _pts_us: u64, _is_key: bool) -> Result<(), MuxerError> {
            if self.fail_on_write {
                return Err(MuxerError::Fatal("boom".into()));
            }
            self.samples.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn write_audio_sample(&mut self, _data: &[u8], _pts_us: u64) -> Result<(), MuxerError> {
            Ok(())
        }
        fn stop(&mut self) -> Result<(), MuxerError> {
            Ok(())
        }
    }

    fn frame(pts: u64) -> EncodedFrame {
        EncodedFrame {
            data: Bytes::from_static(b"x"),
            is_keyframe: true,
            pts_us: pts,
            capture_epoch_ms: 0,
            epoch: 1,
        }
    }

    #[tokio::test]
    async fn test_starts_after_video_track_added_no_audio() {
        let samples = Arc::new(AtomicUsize::new(0));
        let added_dimensions = Arc::new(Mutex::new(None));
        let muxer = Box::new(FakeMuxer {
            video_added: false,
            started: false,
            samples: samples.clone(),
            fail_on_write: false,
            added_dimensions: added_dimensions.clone(),
        });
        let file = tempfile::tempfile().unwrap();
        let tee = RecordingTee::new(muxer, file, false, 0, 1280, 720);
        tee.on_codec_config(1, Bytes::from_static(b"sps"), Bytes::from_static(b"pps"));
        assert_eq!(*added_dimensions.lock(), Some((1280, 720)));
        tee.on_frame(frame(100));
        tee.on_frame(frame(50)); // non-increasing pts must bump forward, not error
        assert_eq!(samples.load(Ordering::SeqCst), 2);
        tee.stop().await;
        assert!(!tee.is_recording());
    }

    #[tokio::test]
    async fn test_waits_for_audio_track_before_starting() {
        let samples = Arc::new(AtomicUsize::new(0));
        let muxer = Box::new(FakeMuxer {
            video_added: false,
            started: false,
            samples: samples.clone(),
            fail_on_write: false,
            added_dimensions: Arc::new(Mutex::new(None)),
        });
        let file = tempfile::tempfile().unwrap();
        let tee = RecordingTee::new(muxer, file, true, 0, 1280, 720);
        tee.on_codec_config(1, Bytes::from_static(b"sps"), Bytes::from_static(b"pps"));
        tee.on_frame(frame(100));
        assert_eq!(
            samples.load(Ordering::SeqCst),
            0,
            "must not write before the expected audio track is present"
        );
        tee.on_audio_format(48_000, 1);
        tee.on_frame(frame(200));
        assert_eq!(samples.load(Ordering::SeqCst), 1);
        tee.stop().await;
    }

    #[tokio::test]
    async fn test_write_failure_marks_muxer_broken_and_drops_subsequent_samples() {
        let samples = Arc::new(AtomicUsize::new(0));
        let muxer = Box::new(FakeMuxer {
            video_added: false,
            started: false,
            samples: samples.clone(),
            fail_on_write: true,
            added_dimensions: Arc::new(Mutex::new(None)),
        });
        let file = tempfile::tempfile().unwrap();
        let tee = RecordingTee::new(muxer, file, false, 0, 1280, 720);
        tee.on_codec_config(1, Bytes::from_static(b"sps"), Bytes::from_static(b"pps"));
        tee.on_frame(frame(1));
        tee.on_frame(frame(2));
        assert_eq!(samples.load(Ordering::SeqCst), 0);
        tee.stop().await;
    }

    #[tokio::test]
    async fn test_double_stop_is_idempotent() {
        let samples = Arc::new(AtomicUsize::new(0));
        let muxer = Box::new(FakeMuxer {
            video_added: false,
            started: false,
            samples,
            fail_on_write: false,
            added_dimensions: Arc::new(Mutex::new(None)),
        });
        let file = tempfile::tempfile().unwrap();
        let tee = RecordingTee::new(muxer, file, false, 0, 1280, 720);
        tee.stop().await;
        tee.stop().await;
    }
}
