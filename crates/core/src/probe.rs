use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use serde_json::Value;
use wait_timeout::ChildExt;

use crate::error::{Error, Result};
use crate::models::{AudioStream, MediaInfo};

/// Extracts media metadata from a file on disk. The ffprobe-backed
/// implementation is the only one used at runtime; tests substitute
/// their own.
pub trait Prober: Send + Sync {
    fn probe(&self, path: &Path) -> Result<MediaInfo>;
}

pub struct FfprobeProber {
    timeout: Duration,
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl FfprobeProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Prober for FfprobeProber {
    fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let json = ffprobe_json(path, self.timeout)?;
        Ok(parse_media_info(&json))
    }
}

fn ffprobe_json(path: &Path, timeout: Duration) -> Result<Value> {
    let mut child = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg("--")
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Probe("ffprobe stdout unavailable".into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Probe("ffprobe stderr unavailable".into()))?;

    match child.wait_timeout(timeout)? {
        Some(status) => {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let _ = stdout.read_to_end(&mut out);
            let _ = stderr.read_to_end(&mut err);
            if !status.success() {
                let msg = String::from_utf8_lossy(&err);
                return Err(Error::Probe(format!(
                    "ffprobe exited {status} for {}: {}",
                    path.display(),
                    msg.trim()
                )));
            }
            serde_json::from_slice(&out)
                .map_err(|e| Error::Probe(format!("ffprobe output unparsable: {e}")))
        }
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Err(Error::Probe(format!(
                "ffprobe timed out after {}s for {}",
                timeout.as_secs(),
                path.display()
            )))
        }
    }
}

/// Pull out what the lifecycle needs. Field parse failures degrade to
/// zero values rather than failing the probe.
fn parse_media_info(probe: &Value) -> MediaInfo {
    let mut info = MediaInfo::default();

    let format = probe.get("format");
    info.container = format
        .and_then(|f| f.get("format_name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    info.duration_s = format
        .and_then(|f| f.get("duration"))
        .and_then(number_field)
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(0.0);
    info.bitrate_bps = format
        .and_then(|f| f.get("bit_rate"))
        .and_then(number_field)
        .filter(|b| *b > 0.0)
        .map(|b| b as u64)
        .unwrap_or(0);

    let streams = probe
        .get("streams")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for stream in &streams {
        match stream.get("codec_type").and_then(Value::as_str) {
            Some("video") if info.codec.is_empty() => {
                info.codec = stream
                    .get("codec_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                info.width = stream
                    .get("width")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                info.height = stream
                    .get("height")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                info.frame_rate = stream
                    .get("r_frame_rate")
                    .and_then(Value::as_str)
                    .and_then(parse_frame_rate)
                    .unwrap_or(0.0);
            }
            Some("audio") => {
                info.audio_streams.push(AudioStream {
                    codec: stream
                        .get("codec_name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    profile: stream
                        .get("profile")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    channels: stream
                        .get("channels")
                        .and_then(Value::as_u64)
                        .unwrap_or(2) as u32,
                });
            }
            _ => {}
        }
    }

    info
}

fn number_field(v: &Value) -> Option<f64> {
    if let Some(s) = v.as_str() {
        s.parse().ok()
    } else {
        v.as_f64()
    }
}

/// "24000/1001" → 23.976…; zero denominators yield nothing.
fn parse_frame_rate(raw: &str) -> Option<f64> {
    let (num, den) = raw.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_typical_probe() {
        let probe: Value = serde_json::from_str(
            r#"{
                "format": {"format_name": "matroska,webm", "duration": "5400.123", "bit_rate": "30000000"},
                "streams": [
                    {"codec_type": "video", "codec_name": "h264", "width": 3840, "height": 2160, "r_frame_rate": "24000/1001"},
                    {"codec_type": "audio", "codec_name": "truehd", "profile": "", "channels": 8},
                    {"codec_type": "audio", "codec_name": "ac3", "channels": 6},
                    {"codec_type": "subtitle", "codec_name": "subrip"}
                ]
            }"#,
        )
        .unwrap();

        let info = parse_media_info(&probe);
        assert_eq!(info.codec, "h264");
        assert_eq!(info.width, 3840);
        assert_eq!(info.height, 2160);
        assert_eq!(info.bitrate_bps, 30_000_000);
        assert!((info.duration_s - 5400.123).abs() < 1e-6);
        assert!((info.frame_rate - 23.976).abs() < 0.001);
        assert_eq!(info.audio_streams.len(), 2);
        assert_eq!(info.audio_streams[0].codec, "truehd");
        assert_eq!(info.audio_streams[0].channels, 8);
    }

    #[test]
    fn missing_fields_degrade_to_defaults() {
        let probe: Value = serde_json::from_str(r#"{"streams": []}"#).unwrap();
        let info = parse_media_info(&probe);
        assert!(info.codec.is_empty());
        assert_eq!(info.bitrate_bps, 0);
        assert_eq!(info.duration_s, 0.0);
    }

    #[test]
    fn zero_denominator_frame_rate_is_ignored() {
        assert_eq!(parse_frame_rate("25/0"), None);
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
    }
}
