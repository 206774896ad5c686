//! Deterministic test fakes, in the spirit of a `test-mode` feature and
//! a `videotestsrc`-backed pipeline: a synthetic encoder backend that
//! emits valid Annex-B access units on a fixed cadence instead of
//! talking to real hardware, and an in-memory muxer.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::command_bus::StreamConfigRequest;
use crate::encoder::{ConfigAttempt, EncoderBackend};
use crate::error::{EncoderError, MuxerError};
use crate::recording::MuxerFile;

fn annex_b_unit(nal_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0, 0, 0, 1, nal_type];
    buf.extend_from_slice(payload);
    buf
}

/// Builds one synthetic access unit: every `gop_size`-th frame is an IDR
/// preceded by SPS/PPS, the rest are non-key frames.
pub fn synthetic_access_unit(frame_index: u64, gop_size: u64) -> Bytes {
    let mut out = Vec::new();
    if frame_index % gop_size == 0 {
        out.extend(annex_b_unit(0x67, &[0xAA, 0xBB])); // SPS
        out.extend(annex_b_unit(0x68, &[0xCC])); // PPS
        out.extend(annex_b_unit(0x65, &[frame_index as u8])); // IDR
    } else {
        out.extend(annex_b_unit(0x01, &[frame_index as u8]));
    }
    Bytes::from(out)
}

/// A scripted/synthetic backend used by unit and integration tests.
/// `configure` always succeeds; `poll_output` returns queued units in
/// order, one per call, each stamped with a synthetic, steadily
/// increasing pts.
#[derive(Clone)]
pub struct FakeEncoderBackend {
    queue: Arc<Mutex<VecDeque<(Bytes, u64)>>>,
    pub last_config: Arc<Mutex<Option<StreamConfigRequest>>>,
    pub last_attempt: Arc<Mutex<Option<ConfigAttempt>>>,
    pub bitrate_calls: Arc<Mutex<Vec<u32>>>,
    pub keyframe_requests: Arc<Mutex<u32>>,
    next_pts: Arc<Mutex<u64>>,
}

impl FakeEncoderBackend {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            last_config: Arc::new(Mutex::new(None)),
            last_attempt: Arc::new(Mutex::new(None)),
            bitrate_calls: Arc::new(Mutex::new(Vec::new())),
            keyframe_requests: Arc::new(Mutex::new(0)),
            next_pts: Arc::new(Mutex::new(0)),
        }
    }

    pub fn push_output(&self, unit: Bytes) {
        let mut pts = self.next_pts.lock();
        self.queue.lock().push_back((unit, *pts));
        *pts += 33_333;
    }

    /// Feed a small GOP worth of synthetic frames for a quick end-to-end
    /// smoke test.
    pub fn push_gop(&self, count: u64, gop_size: u64) {
        for i in 0..count {
            self.push_output(synthetic_access_unit(i, gop_size));
        }
    }
}

impl Default for FakeEncoderBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderBackend for FakeEncoderBackend {
    fn configure(&mut self, attempt: ConfigAttempt) -> Result<(), EncoderError> {
        *self.last_config.lock() = Some(StreamConfigRequest {
            width: attempt.width,
            height: attempt.height,
            bitrate_bps: attempt.bitrate_bps,
            fps: attempt.fps,
        });
        *self.last_attempt.lock() = Some(attempt);
        Ok(())
    }

    fn push_raw(&mut self, _data: Bytes, _pts_us: u64) -> Result<(), EncoderError> {
        Ok(())
    }

    fn poll_output(&mut self) -> Option<(Bytes, u64)> {
        self.queue.lock().pop_front()
    }

    fn request_keyframe(&mut self) {
        *self.keyframe_requests.lock() += 1;
    }

    fn adjust_bitrate(&mut self, bps: u32) {
        self.bitrate_calls.lock().push(bps);
    }

    fn stop(&mut self) {}
}

/// In-memory muxer: records every call instead of writing a real
/// container, so tests can assert on track/sample counts.
pub struct FakeMuxer {
    pub video_track_added: bool,
    pub audio_track_added: bool,
    pub started: bool,
    pub video_samples: Vec<(Vec<u8>, u64, bool)>,
    pub audio_samples: Vec<(Vec<u8>, u64)>,
    pub stopped: bool,
}

impl FakeMuxer {
    pub fn new() -> Self {
        Self {
            video_track_added: false,
            audio_track_added: false,
            started: false,
            video_samples: Vec::new(),
            audio_samples: Vec::new(),
            stopped: false,
        }
    }
}

impl Default for FakeMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxerFile for FakeMuxer {
    fn add_video_track(&mut self, _w: u32, _h: u32, _sps: &[u8], _pps: &[u8]) -> Result<(), MuxerError> {
        self.video_track_added = true;
        Ok(())
    }

    fn add_audio_track(&mut self, _rate: u32, _ch: u16) -> Result<(), MuxerError> {
        self.audio_track_added = true;
        Ok(())
    }

    fn start(&mut self, _orientation_deg: u32) -> Result<(), MuxerError> {
        self.started = true;
        Ok(())
    }

    fn write_video_sample(&mut self, data: &[u8], pts_us: u64, is_key: bool) -> Result<(), MuxerError> {
        self.video_samples.push((data.to_vec(), pts_us, is_key));
        Ok(())
    }

    fn write_audio_sample(&mut self, data: &[u8], pts_us: u64) -> Result<(), MuxerError> {
        self.audio_samples.push((data.to_vec(), pts_us));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), MuxerError> {
        self.stopped = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol;

    #[test]
    fn test_synthetic_access_unit_gop_pattern() {
        let idr = synthetic_access_unit(0, 4);
        assert!(protocol::is_keyframe(&idr));
        let non_key = synthetic_access_unit(1, 4);
        assert!(!protocol::is_keyframe(&non_key));
        let next_idr = synthetic_access_unit(4, 4);
        assert!(protocol::is_keyframe(&next_idr));
    }
}
