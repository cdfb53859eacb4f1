use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;
use wait_timeout::ChildExt;

use crate::classify;
use crate::config::Config;
use crate::db::Catalog;
use crate::error::{Error, Result};
use crate::hash::{content_hash, read_to_end_len};
use crate::models::{EntryState, JobOutcome, MediaEntry, MediaInfo};
use crate::probe::Prober;
use crate::replace;
use crate::stop::StopToken;

/// How long the worker parks on the claim condition variable before
/// re-checking (the periodic floor under the wakeup).
const CLAIM_WAIT: Duration = Duration::from_secs(10);

/// Audio codecs considered lossless or uncompressed; these get
/// re-encoded, everything else is copied.
const LOSSLESS_AUDIO_CODECS: &[&str] = &[
    "pcm_s16le", "pcm_s24le", "pcm_s32le", "pcm_f32le", "pcm_s16be", "pcm_s24be", "pcm_s32be",
    "pcm_f64le", "pcm_f64be", "truehd", "mlp", "flac",
];

#[derive(Debug, Clone, Copy)]
pub struct EncodeParams {
    pub crf: u32,
    /// Maximum output height; 0 disables scaling.
    pub res_cap: u32,
}

#[derive(Debug)]
pub enum EncodeOutcome {
    Completed,
    Failed { reason: String },
    /// Shutdown arrived mid-encode. The entry stays `InProgress` with
    /// its workfile intact; recovery reconciles on the next start.
    Interrupted,
}

/// Runs one encode to completion. The ffmpeg-backed implementation is
/// the only one used at runtime; tests substitute their own.
pub trait Encoder: Send + Sync {
    fn encode(
        &self,
        input: &Path,
        output: &Path,
        params: &EncodeParams,
        info: &MediaInfo,
        on_frames: &mut dyn FnMut(u64),
        stop: &StopToken,
    ) -> Result<EncodeOutcome>;
}

/// In-memory view of the job currently encoding. Never persisted; the
/// durable record is the catalog row.
#[derive(Debug, Clone)]
pub struct CurrentJob {
    pub id: Uuid,
    pub path: PathBuf,
    pub started: Instant,
    pub frames_done: u64,
    pub frames_total: u64,
    pub progress_pct: f64,
}

#[derive(Default)]
pub struct WorkerStatus {
    current: Mutex<Option<CurrentJob>>,
}

impl WorkerStatus {
    pub fn current(&self) -> Option<CurrentJob> {
        self.lock().clone()
    }

    fn start(&self, id: Uuid, path: PathBuf) {
        *self.lock() = Some(CurrentJob {
            id,
            path,
            started: Instant::now(),
            frames_done: 0,
            frames_total: 0,
            progress_pct: 0.0,
        });
    }

    fn clear(&self) {
        *self.lock() = None;
    }

    fn set_total(&self, frames_total: u64) {
        if let Some(job) = self.lock().as_mut() {
            job.frames_total = frames_total;
        }
    }

    fn update_frames(&self, frames_done: u64) {
        if let Some(job) = self.lock().as_mut() {
            job.frames_done = frames_done;
            job.progress_pct = if job.frames_total > 0 {
                (frames_done as f64 * 100.0 / job.frames_total as f64).min(99.0)
            } else {
                0.0
            };
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<CurrentJob>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The single long-lived encode loop: claim, begin, encode, verify,
/// replace. The only component that runs the external encoder or
/// performs destructive filesystem operations.
pub struct Worker {
    catalog: Arc<Catalog>,
    config: Arc<Config>,
    prober: Arc<dyn Prober>,
    encoder: Arc<dyn Encoder>,
    status: Arc<WorkerStatus>,
    stop: StopToken,
}

impl Worker {
    pub fn new(
        catalog: Arc<Catalog>,
        config: Arc<Config>,
        prober: Arc<dyn Prober>,
        encoder: Arc<dyn Encoder>,
        status: Arc<WorkerStatus>,
        stop: StopToken,
    ) -> Self {
        Self {
            catalog,
            config,
            prober,
            encoder,
            status,
            stop,
        }
    }

    /// Loop until stopped. Job-level failures are recorded in the
    /// catalog and the loop continues; catalog failures and invariant
    /// violations propagate and take the process down.
    pub fn run(&self) -> Result<()> {
        tracing::info!(workdir = %self.config.workdir.display(), "worker started");
        while !self.stop.is_stopped() {
            match self.run_once() {
                Ok(true) => {}
                Ok(false) => self.catalog.wait_for_work(CLAIM_WAIT),
                Err(Error::Interrupted) => break,
                Err(err) => return Err(err),
            }
        }
        tracing::info!("worker stopped");
        Ok(())
    }

    /// Claim and drive at most one entry through encode → verify →
    /// replace. Returns whether anything was claimed.
    pub fn run_once(&self) -> Result<bool> {
        let Some(entry) = self.catalog.claim_next()? else {
            return Ok(false);
        };
        self.process(entry)?;
        Ok(true)
    }

    fn process(&self, entry: MediaEntry) -> Result<()> {
        let workfile = self.config.workfile_path(entry.id);
        self.catalog.begin(entry.id, &workfile)?;
        tracing::info!(
            id = %entry.id,
            path = %entry.path.display(),
            size = entry.size_bytes,
            attempt = entry.attempts + 1,
            "encode starting"
        );
        self.status.start(entry.id, entry.path.clone());
        let result = self.run_job(&entry, &workfile);
        self.status.clear();
        result
    }

    fn run_job(&self, entry: &MediaEntry, workfile: &Path) -> Result<()> {
        let info = match self.prober.probe(&entry.path) {
            Ok(info) => info,
            Err(err) => {
                discard_workfile(workfile);
                return self.fail(entry.id, format!("probe failed: {err}"));
            }
        };
        self.status.set_total(estimate_total_frames(&info));

        let params = EncodeParams {
            crf: self.config.crf_for(entry.category),
            res_cap: self.config.res_cap_for(entry.category),
        };
        let outcome = match self.encoder.encode(
            &entry.path,
            workfile,
            &params,
            &info,
            &mut |frames| self.status.update_frames(frames),
            &self.stop,
        ) {
            Ok(outcome) => outcome,
            Err(err) => {
                discard_workfile(workfile);
                return self.fail(entry.id, err.to_string());
            }
        };

        match outcome {
            EncodeOutcome::Interrupted => Err(Error::Interrupted),
            EncodeOutcome::Failed { reason } => {
                discard_workfile(workfile);
                self.fail(entry.id, reason)
            }
            EncodeOutcome::Completed => self.verify_and_replace(entry, workfile),
        }
    }

    fn verify_and_replace(&self, entry: &MediaEntry, workfile: &Path) -> Result<()> {
        if !entry.path.exists() {
            discard_workfile(workfile);
            if let Some(fresh) = self.catalog.get(entry.id)? {
                if fresh.state != EntryState::Gone {
                    self.catalog.mark_gone(entry.id)?;
                }
            }
            tracing::warn!(id = %entry.id, path = %entry.path.display(), "source vanished mid-flight");
            return Ok(());
        }

        let pre_hash = entry.pre_hash.as_deref().unwrap_or_default();
        let current_hash = match content_hash(&entry.path) {
            Ok(hash) => hash,
            Err(err) => {
                discard_workfile(workfile);
                return self.fail(entry.id, format!("re-hash failed: {err}"));
            }
        };
        if current_hash != pre_hash {
            // Expected race, not an error: the source changed under us.
            discard_workfile(workfile);
            self.catalog.finish(entry.id, &JobOutcome::Requeued)?;
            tracing::info!(id = %entry.id, "source changed during encode, requeued");
            return Ok(());
        }

        match check_acceptance(
            self.prober.as_ref(),
            &self.config,
            workfile,
            entry.size_bytes,
            entry.duration_s,
        ) {
            Acceptance::Rejected(reason) => {
                discard_workfile(workfile);
                self.fail(entry.id, reason)
            }
            Acceptance::Accepted => {
                let target = entry.path.with_extension("mkv");
                if let Err(err) = replace::replace_file(workfile, &target) {
                    discard_workfile(workfile);
                    return self.fail(entry.id, format!("replace failed: {err}"));
                }
                if target != entry.path {
                    if let Err(err) = replace::remove_durably(&entry.path) {
                        tracing::warn!(
                            id = %entry.id,
                            path = %entry.path.display(),
                            error = %err,
                            "could not unlink original after replacement"
                        );
                    }
                }
                self.catalog
                    .finish(entry.id, &JobOutcome::Done { new_path: target.clone() })?;
                tracing::info!(id = %entry.id, path = %target.display(), "encode done");
                Ok(())
            }
        }
    }

    fn fail(&self, id: Uuid, reason: String) -> Result<()> {
        tracing::warn!(%id, %reason, "encode failed");
        self.catalog.finish(id, &JobOutcome::Failed { reason })?;
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Acceptance {
    Accepted,
    Rejected(String),
}

/// The conjunction every completed encode (and every salvage candidate)
/// must satisfy before it may replace an original: target codec in an
/// MKV container, strictly smaller than the original, duration within
/// tolerance, readable end-to-end.
pub fn check_acceptance(
    prober: &dyn Prober,
    cfg: &Config,
    workfile: &Path,
    original_size: u64,
    original_duration_s: f64,
) -> Acceptance {
    let info = match prober.probe(workfile) {
        Ok(info) => info,
        Err(_) => return Acceptance::Rejected("unreadable-output".into()),
    };
    if !classify::is_target_codec(&info.codec) {
        return Acceptance::Rejected("wrong-codec".into());
    }
    if !info.container.to_ascii_lowercase().contains("matroska") {
        return Acceptance::Rejected("wrong-container".into());
    }

    let output_size = match std::fs::metadata(workfile) {
        Ok(md) => md.len(),
        Err(_) => return Acceptance::Rejected("unreadable-output".into()),
    };
    if output_size >= original_size {
        return Acceptance::Rejected("output-not-smaller".into());
    }

    if original_duration_s > 0.0
        && (info.duration_s - original_duration_s).abs() > cfg.duration_tolerance_s
    {
        return Acceptance::Rejected("duration-mismatch".into());
    }

    match read_to_end_len(workfile) {
        Ok(_) => Acceptance::Accepted,
        Err(_) => Acceptance::Rejected("unreadable-output".into()),
    }
}

pub(crate) fn discard_workfile(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if path.exists() {
            tracing::warn!(path = %path.display(), error = %err, "could not remove workfile");
        }
    }
}

fn estimate_total_frames(info: &MediaInfo) -> u64 {
    let fps = if info.frame_rate > 0.0 {
        info.frame_rate
    } else {
        25.0
    };
    (fps * info.duration_s).round().max(0.0) as u64
}

/// Spawns ffmpeg, tails `-progress` output for frame counts, and
/// escalates SIGTERM → SIGKILL on shutdown.
pub struct FfmpegEncoder {
    poll_interval: Duration,
    shutdown_grace: Duration,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Encoder for FfmpegEncoder {
    fn encode(
        &self,
        input: &Path,
        output: &Path,
        params: &EncodeParams,
        info: &MediaInfo,
        on_frames: &mut dyn FnMut(u64),
        stop: &StopToken,
    ) -> Result<EncodeOutcome> {
        let args = build_ffmpeg_args(input, output, params, info);
        tracing::debug!(cmd = %format!("ffmpeg {}", args.join(" ")), "spawning encoder");

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Encode("ffmpeg stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Encode("ffmpeg stderr unavailable".into()))?;

        let frames = Arc::new(AtomicU64::new(0));
        let frames_writer = Arc::clone(&frames);
        let progress_reader = std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                if let Some(value) = line.strip_prefix("frame=") {
                    if let Ok(n) = value.trim().parse::<u64>() {
                        frames_writer.store(n, Ordering::Relaxed);
                    }
                }
            }
        });
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut buf);
            buf
        });

        let status = loop {
            if let Some(status) = child.wait_timeout(self.poll_interval)? {
                break status;
            }
            on_frames(frames.load(Ordering::Relaxed));
            if stop.is_stopped() {
                terminate(&mut child, self.shutdown_grace);
                let _ = progress_reader.join();
                let _ = stderr_reader.join();
                return Ok(EncodeOutcome::Interrupted);
            }
        };

        let _ = progress_reader.join();
        on_frames(frames.load(Ordering::Relaxed));
        let stderr_out = stderr_reader.join().unwrap_or_default();

        if status.success() {
            Ok(EncodeOutcome::Completed)
        } else {
            Ok(EncodeOutcome::Failed {
                reason: format!("ffmpeg exited {status}: {}", tail(&stderr_out, 600)),
            })
        }
    }
}

fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
        if let Ok(Some(_)) = child.wait_timeout(grace) {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill();
    let _ = child.wait();
}

/// Build the ffmpeg argument list: all video re-encoded to libx265 at
/// the category CRF, downscaled only when the source exceeds the cap,
/// lossless audio re-encoded (AAC for surround, Opus for stereo/mono),
/// lossy audio and subtitles copied, progress on stdout.
pub fn build_ffmpeg_args(
    input: &Path,
    output: &Path,
    params: &EncodeParams,
    info: &MediaInfo,
) -> Vec<String> {
    let mut cmd: Vec<String> = vec![
        "-y".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-map".into(),
        "0:v".into(),
        "-map".into(),
        "0:a?".into(),
        "-map".into(),
        "0:s?".into(),
        "-c:v".into(),
        "libx265".into(),
        "-crf".into(),
        params.crf.to_string(),
        "-preset".into(),
        "slow".into(),
        "-x265-params".into(),
        "log-level=error".into(),
    ];

    if params.res_cap > 0 && info.height > params.res_cap {
        // scale=-2:H keeps the aspect ratio with an even width.
        cmd.push("-vf".into());
        cmd.push(format!("scale=-2:{}", params.res_cap));
    }

    let any_lossless = info
        .audio_streams
        .iter()
        .any(|a| is_lossless_audio(&a.codec) || is_dts_hd(&a.codec, &a.profile));
    if !any_lossless {
        // All lossy: bulk copy is safe and simpler.
        cmd.push("-c:a".into());
        cmd.push("copy".into());
    } else {
        for (i, stream) in info.audio_streams.iter().enumerate() {
            if is_lossless_audio(&stream.codec) || is_dts_hd(&stream.codec, &stream.profile) {
                if stream.channels >= 3 {
                    cmd.push(format!("-c:a:{i}"));
                    cmd.push("aac".into());
                    cmd.push(format!("-b:a:{i}"));
                    cmd.push("640k".into());
                } else {
                    cmd.push(format!("-c:a:{i}"));
                    cmd.push("libopus".into());
                    cmd.push(format!("-b:a:{i}"));
                    cmd.push("192k".into());
                }
            } else {
                cmd.push(format!("-c:a:{i}"));
                cmd.push("copy".into());
            }
        }
    }

    cmd.push("-c:s".into());
    cmd.push("copy".into());
    cmd.push("-progress".into());
    cmd.push("pipe:1".into());
    cmd.push("-nostats".into());
    cmd.push("-f".into());
    cmd.push("matroska".into());
    cmd.push(output.to_string_lossy().into_owned());

    cmd
}

fn is_lossless_audio(codec: &str) -> bool {
    let name = codec.to_ascii_lowercase();
    LOSSLESS_AUDIO_CODECS.contains(&name.as_str()) || name.starts_with("pcm_")
}

/// DTS-HD MA and DTS:X are lossless; plain DTS is lossy.
fn is_dts_hd(codec: &str, profile: &str) -> bool {
    if !codec.eq_ignore_ascii_case("dts") {
        return false;
    }
    let prof = profile.to_ascii_lowercase();
    prof.contains("ma") || prof.contains("hd") || prof.contains('x')
}

fn tail(s: &str, max_bytes: usize) -> &str {
    let s = s.trim();
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::models::AudioStream;

    fn info_with_audio(audio: Vec<AudioStream>) -> MediaInfo {
        MediaInfo {
            container: "matroska,webm".into(),
            codec: "h264".into(),
            width: 3840,
            height: 2160,
            bitrate_bps: 30_000_000,
            duration_s: 5400.0,
            frame_rate: 24.0,
            audio_streams: audio,
        }
    }

    fn args_for(params: EncodeParams, info: &MediaInfo) -> Vec<String> {
        build_ffmpeg_args(Path::new("/m/in.mkv"), Path::new("/w/out.mkv"), &params, info)
    }

    #[test]
    fn scales_only_when_source_exceeds_cap() {
        let info = info_with_audio(Vec::new());
        let args = args_for(EncodeParams { crf: 16, res_cap: 2160 }, &info);
        assert!(!args.iter().any(|a| a == "-vf"));

        let args = args_for(EncodeParams { crf: 16, res_cap: 1080 }, &info);
        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(args[vf + 1], "scale=-2:1080");

        let args = args_for(EncodeParams { crf: 16, res_cap: 0 }, &info);
        assert!(!args.iter().any(|a| a == "-vf"));
    }

    #[test]
    fn all_lossy_audio_is_bulk_copied() {
        let info = info_with_audio(vec![
            AudioStream {
                codec: "ac3".into(),
                profile: String::new(),
                channels: 6,
            },
            AudioStream {
                codec: "aac".into(),
                profile: "LC".into(),
                channels: 2,
            },
        ]);
        let args = args_for(EncodeParams { crf: 18, res_cap: 1080 }, &info);
        let pos = args.iter().position(|a| a == "-c:a").unwrap();
        assert_eq!(args[pos + 1], "copy");
        assert!(!args.iter().any(|a| a.starts_with("-c:a:")));
    }

    #[test]
    fn lossless_audio_is_reencoded_per_stream() {
        let info = info_with_audio(vec![
            AudioStream {
                codec: "truehd".into(),
                profile: String::new(),
                channels: 8,
            },
            AudioStream {
                codec: "flac".into(),
                profile: String::new(),
                channels: 2,
            },
            AudioStream {
                codec: "ac3".into(),
                profile: String::new(),
                channels: 6,
            },
        ]);
        let args = args_for(EncodeParams { crf: 18, res_cap: 1080 }, &info);

        let surround = args.iter().position(|a| a == "-c:a:0").unwrap();
        assert_eq!(args[surround + 1], "aac");
        assert_eq!(args[surround + 2], "-b:a:0");
        assert_eq!(args[surround + 3], "640k");

        let stereo = args.iter().position(|a| a == "-c:a:1").unwrap();
        assert_eq!(args[stereo + 1], "libopus");

        let lossy = args.iter().position(|a| a == "-c:a:2").unwrap();
        assert_eq!(args[lossy + 1], "copy");
    }

    #[test]
    fn dts_hd_counts_as_lossless_but_plain_dts_does_not() {
        assert!(is_dts_hd("dts", "DTS-HD MA"));
        assert!(is_dts_hd("dts", "DTS:X"));
        assert!(!is_dts_hd("dts", ""));
        assert!(!is_dts_hd("ac3", "MA"));
        assert!(is_lossless_audio("pcm_s24le"));
        assert!(!is_lossless_audio("opus"));
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail("short", 600), "short");
        let long = "a".repeat(700);
        assert_eq!(tail(&long, 600).len(), 600);
    }

    mod acceptance {
        use crate::config::test_config;
        use crate::error::Error;
        use crate::models::MediaInfo;
        use crate::probe::Prober;
        use crate::worker::{check_acceptance, Acceptance};
        use std::path::Path;

        struct OneShotProber(Option<MediaInfo>);

        impl Prober for OneShotProber {
            fn probe(&self, _path: &Path) -> crate::error::Result<MediaInfo> {
                self.0
                    .clone()
                    .ok_or_else(|| Error::Probe("unreadable".into()))
            }
        }

        fn hevc_output(duration_s: f64) -> MediaInfo {
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

        fn workfile(len: usize) -> (tempfile::TempDir, std::path::PathBuf) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("out.mkv");
            std::fs::write(&path, vec![0u8; len]).unwrap();
            (dir, path)
        }

        #[test]
        fn accepts_a_conforming_output() {
            let (dir, path) = workfile(100);
            let cfg = test_config(Path::new("/m"), dir.path());
            let prober = OneShotProber(Some(hevc_output(5400.2)));
            let result = check_acceptance(&prober, &cfg, &path, 1000, 5400.0);
            assert_eq!(result, Acceptance::Accepted);
        }

        #[test]
        fn rejects_larger_output() {
            let (dir, path) = workfile(1000);
            let cfg = test_config(Path::new("/m"), dir.path());
            let prober = OneShotProber(Some(hevc_output(5400.0)));
            let result = check_acceptance(&prober, &cfg, &path, 1000, 5400.0);
            assert_eq!(result, Acceptance::Rejected("output-not-smaller".into()));
        }

        #[test]
        fn rejects_wrong_codec() {
            let (dir, path) = workfile(100);
            let cfg = test_config(Path::new("/m"), dir.path());
            let mut info = hevc_output(5400.0);
            info.codec = "h264".into();
            let prober = OneShotProber(Some(info));
            let result = check_acceptance(&prober, &cfg, &path, 1000, 5400.0);
            assert_eq!(result, Acceptance::Rejected("wrong-codec".into()));
        }

        #[test]
        fn rejects_duration_drift_beyond_tolerance() {
            let (dir, path) = workfile(100);
            let cfg = test_config(Path::new("/m"), dir.path());
            let prober = OneShotProber(Some(hevc_output(5395.0)));
            let result = check_acceptance(&prober, &cfg, &path, 1000, 5400.0);
            assert_eq!(result, Acceptance::Rejected("duration-mismatch".into()));
        }

        #[test]
        fn rejects_unprobeable_output() {
            let (dir, path) = workfile(100);
            let cfg = test_config(Path::new("/m"), dir.path());
            let prober = OneShotProber(None);
            let result = check_acceptance(&prober, &cfg, &path, 1000, 5400.0);
            assert_eq!(result, Acceptance::Rejected("unreadable-output".into()));
        }

        #[test]
        fn unknown_original_duration_skips_the_duration_check() {
            let (dir, path) = workfile(100);
            let cfg = test_config(Path::new("/m"), dir.path());
            let prober = OneShotProber(Some(hevc_output(123.0)));
            let result = check_acceptance(&prober, &cfg, &path, 1000, 0.0);
            assert_eq!(result, Acceptance::Accepted);
        }
    }
}
