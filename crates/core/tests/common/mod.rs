#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use spacesaver_core::config::Config;
use spacesaver_core::error::{Error, Result};
use spacesaver_core::models::{AudioStream, MediaInfo};
use spacesaver_core::probe::Prober;
use spacesaver_core::stop::StopToken;
use spacesaver_core::worker::{EncodeOutcome, EncodeParams, Encoder};

/// Canned probe results: exact path matches first, then the fallback
/// (used for workfiles whose path is not known up front).
pub struct FakeProber {
    by_path: Mutex<HashMap<PathBuf, MediaInfo>>,
    fallback: Mutex<Option<MediaInfo>>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self {
            by_path: Mutex::new(HashMap::new()),
            fallback: Mutex::new(None),
        }
    }

    pub fn set(&self, path: &Path, info: MediaInfo) {
        self.by_path.lock().unwrap().insert(path.to_path_buf(), info);
    }

    pub fn set_fallback(&self, info: MediaInfo) {
        *self.fallback.lock().unwrap() = Some(info);
    }
}

impl Prober for FakeProber {
    fn probe(&self, path: &Path) -> Result<MediaInfo> {
        if let Some(info) = self.by_path.lock().unwrap().get(path) {
            return Ok(info.clone());
        }
        self.fallback
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Probe(format!("no fake probe for {}", path.display())))
    }
}

/// Scripted encoder: the closure gets (input, output) and decides what
/// lands on disk and what outcome comes back.
pub struct FakeEncoder {
    behavior: Box<dyn Fn(&Path, &Path) -> Result<EncodeOutcome> + Send + Sync>,
}

impl FakeEncoder {
    pub fn new(
        behavior: impl Fn(&Path, &Path) -> Result<EncodeOutcome> + Send + Sync + 'static,
    ) -> Self {
        Self {
            behavior: Box::new(behavior),
        }
    }

    /// Writes `output_bytes` to the output path and reports success.
    pub fn producing(output_bytes: Vec<u8>) -> Self {
        Self::new(move |_input, output| {
            std::fs::write(output, &output_bytes)?;
            Ok(EncodeOutcome::Completed)
        })
    }
}

impl Encoder for FakeEncoder {
    fn encode(
        &self,
        input: &Path,
        output: &Path,
        _params: &EncodeParams,
        _info: &MediaInfo,
        on_frames: &mut dyn FnMut(u64),
        _stop: &StopToken,
    ) -> Result<EncodeOutcome> {
        on_frames(1);
        (self.behavior)(input, output)
    }
}

pub fn config(media_root: &Path, workdir: &Path) -> Config {
    Config {
        tv_crf: 18,
        movie_crf: 16,
        tv_res_cap: 1080,
        movie_res_cap: 2160,
        rescan_interval: Duration::from_secs(600),
        media_dirs: vec![media_root.to_path_buf()],
        tv_dirs: Vec::new(),
        workdir: workdir.to_path_buf(),
        bitrate_floor_tv_kbps: None,
        bitrate_floor_movie_kbps: None,
        duration_tolerance_s: 1.0,
        port: 0,
    }
}

pub fn avc_4k(duration_s: f64) -> MediaInfo {
    MediaInfo {
        container: "matroska,webm".into(),
        codec: "h264".into(),
        width: 3840,
        height: 2160,
        bitrate_bps: 30_000_000,
        duration_s,
        frame_rate: 24.0,
        audio_streams: vec![AudioStream {
            codec: "ac3".into(),
            profile: String::new(),
            channels: 6,
        }],
    }
}

pub fn hevc_1080(duration_s: f64) -> MediaInfo {
    MediaInfo {
        container: "matroska,webm".into(),
        codec: "hevc".into(),
        width: 1920,
        height: 1080,
        bitrate_bps: 4_000_000,
        duration_s,
        frame_rate: 24.0,
        audio_streams: Vec::new(),
    }
}
