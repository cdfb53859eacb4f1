use crate::config::Config;
use crate::models::{Category, MediaInfo};

/// Source video codecs already in the target family; re-encoding would
/// only lose quality.
const HEVC_CODECS: &[&str] = &["hevc", "h265"];

/// Whether a probed codec name is the target codec family.
pub fn is_target_codec(codec: &str) -> bool {
    HEVC_CODECS.contains(&codec.to_ascii_lowercase().as_str())
}

/// Conservative CRF → max expected bitrate (kbps) at 1080p for libx265.
/// A source already below this (normalised to 1080p) would come out the
/// same size or larger.
const CRF_BITRATE_TABLE: &[(u32, u64)] = &[
    (16, 8000),
    (18, 5500),
    (20, 3800),
    (22, 2500),
    (24, 1700),
    (26, 1200),
    (28, 800),
];

const PIXELS_1080P: u64 = 1920 * 1080;

/// Expected 1080p bitrate ceiling for a CRF value, with linear
/// interpolation between table entries and clamping outside the range.
pub fn crf_bitrate_ceiling_kbps(crf: u32) -> u64 {
    if let Some(&(_, kbps)) = CRF_BITRATE_TABLE.iter().find(|&&(k, _)| k == crf) {
        return kbps;
    }
    let lower = CRF_BITRATE_TABLE.iter().filter(|&&(k, _)| k <= crf).last();
    let upper = CRF_BITRATE_TABLE.iter().find(|&&(k, _)| k >= crf);
    match (lower, upper) {
        (Some(&(lo, lo_kbps)), Some(&(hi, hi_kbps))) => {
            let ratio = f64::from(crf - lo) / f64::from(hi - lo);
            (lo_kbps as f64 + ratio * (hi_kbps as f64 - lo_kbps as f64)) as u64
        }
        (Some(&(_, kbps)), None) => kbps,
        (None, Some(&(_, kbps))) => kbps,
        (None, None) => 5500,
    }
}

/// Initial disposition of a probed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Proceed,
    Skip(String),
}

/// Deterministic classification: skip sources already in the target codec
/// and sources whose bitrate (1080p-normalised) sits below the category
/// floor. Everything else proceeds to the encode queue.
pub fn disposition(cfg: &Config, category: Category, info: &MediaInfo) -> Disposition {
    if is_target_codec(&info.codec) {
        return Disposition::Skip("source is already HEVC/H.265".into());
    }

    let source_kbps = info.bitrate_bps / 1000;
    if source_kbps > 0 {
        let pixels = u64::from(info.width) * u64::from(info.height);
        let normalised_kbps = source_kbps * PIXELS_1080P / pixels.max(1);
        let floor = cfg.bitrate_floor_kbps(category);
        if normalised_kbps < floor {
            return Disposition::Skip(format!(
                "source bitrate {source_kbps} kbps (~{normalised_kbps} kbps @1080p) below floor {floor} kbps"
            ));
        }
    }

    Disposition::Proceed
}
