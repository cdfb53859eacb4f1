use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classify;
use crate::error::{Error, Result};
use crate::models::Category;
use uuid::Uuid;

/// Runtime configuration, loaded once from the environment at startup.
///
/// Media roots must exist and be disjoint, and the workdir must sit
/// outside all of them; anything else is a startup error.
#[derive(Debug, Clone)]
pub struct Config {
    pub tv_crf: u32,
    pub movie_crf: u32,
    /// Maximum output height in pixels per category; 0 disables scaling.
    pub tv_res_cap: u32,
    pub movie_res_cap: u32,
    pub rescan_interval: Duration,
    pub media_dirs: Vec<PathBuf>,
    /// Roots whose contents are classified `tv`; all other roots are
    /// `movie`.
    pub tv_dirs: Vec<PathBuf>,
    pub workdir: PathBuf,
    /// Per-category skip floor in kbps, normalised to 1080p. When unset
    /// the floor is derived from the category CRF.
    pub bitrate_floor_tv_kbps: Option<u64>,
    pub bitrate_floor_movie_kbps: Option<u64>,
    /// Salvage/acceptance duration tolerance in seconds.
    pub duration_tolerance_s: f64,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let media_dirs = split_paths(&env_str("MEDIA_DIRS").ok_or_else(|| {
            Error::InvalidArgument("MEDIA_DIRS is required (colon-separated roots)".into())
        })?);
        let tv_dirs = env_str("TV_DIRS").map(|v| split_paths(&v)).unwrap_or_default();

        Ok(Self {
            tv_crf: env_parse("TV_CRF", 18)?,
            movie_crf: env_parse("MOVIE_CRF", 16)?,
            tv_res_cap: env_parse("TV_RES_CAP", 1080)?,
            movie_res_cap: env_parse("MOVIE_RES_CAP", 2160)?,
            rescan_interval: Duration::from_secs(env_parse("RESCAN_INTERVAL", 600u64)?),
            media_dirs,
            tv_dirs,
            workdir: PathBuf::from(env_str("WORKDIR").unwrap_or_else(|| "/workdir".into())),
            bitrate_floor_tv_kbps: env_opt("BITRATE_FLOOR_TV")?,
            bitrate_floor_movie_kbps: env_opt("BITRATE_FLOOR_MOVIE")?,
            duration_tolerance_s: env_parse("DURATION_TOLERANCE", 1.0f64)?,
            port: env_parse("PORT", 8000u16)?,
        })
    }

    /// Startup validation: roots exist, roots are disjoint, workdir is
    /// outside every root.
    pub fn validate(&self) -> Result<()> {
        if self.media_dirs.is_empty() {
            return Err(Error::InvalidArgument("no media roots configured".into()));
        }
        for dir in &self.media_dirs {
            if !dir.is_dir() {
                return Err(Error::InvalidArgument(format!(
                    "media root is not a directory: {}",
                    dir.display()
                )));
            }
            if !dir.is_absolute() {
                return Err(Error::InvalidArgument(format!(
                    "media root must be absolute: {}",
                    dir.display()
                )));
            }
        }
        for (i, a) in self.media_dirs.iter().enumerate() {
            for b in self.media_dirs.iter().skip(i + 1) {
                if a.starts_with(b) || b.starts_with(a) {
                    return Err(Error::InvalidArgument(format!(
                        "media roots overlap: {} and {}",
                        a.display(),
                        b.display()
                    )));
                }
            }
        }
        for dir in &self.media_dirs {
            if self.workdir.starts_with(dir) {
                return Err(Error::InvalidArgument(format!(
                    "workdir {} lies inside media root {}",
                    self.workdir.display(),
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Category from the media root a path lives under. Roots listed in
    /// `TV_DIRS` map to `Tv`; everything else is `Movie`.
    pub fn category_for(&self, path: &Path) -> Category {
        if self.tv_dirs.iter().any(|d| path.starts_with(d)) {
            Category::Tv
        } else {
            Category::Movie
        }
    }

    pub fn crf_for(&self, category: Category) -> u32 {
        match category {
            Category::Tv => self.tv_crf,
            Category::Movie => self.movie_crf,
        }
    }

    pub fn res_cap_for(&self, category: Category) -> u32 {
        match category {
            Category::Tv => self.tv_res_cap,
            Category::Movie => self.movie_res_cap,
        }
    }

    /// Skip floor for a category in kbps (1080p-normalised). Explicit
    /// configuration wins; otherwise derived from the category CRF.
    pub fn bitrate_floor_kbps(&self, category: Category) -> u64 {
        let explicit = match category {
            Category::Tv => self.bitrate_floor_tv_kbps,
            Category::Movie => self.bitrate_floor_movie_kbps,
        };
        explicit.unwrap_or_else(|| classify::crf_bitrate_ceiling_kbps(self.crf_for(category)))
    }

    pub fn db_path(&self) -> PathBuf {
        self.workdir.join("state.db")
    }

    /// Deterministic scratch output path for an entry, so recovery can
    /// find in-flight work after a crash.
    pub fn workfile_path(&self, id: Uuid) -> PathBuf {
        self.workdir.join(format!("{id}.mkv"))
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env_str(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid {name} value: {raw}"))),
        None => Ok(default),
    }
}

fn env_opt<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_str(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidArgument(format!("invalid {name} value: {raw}"))),
        None => Ok(None),
    }
}

fn split_paths(raw: &str) -> Vec<PathBuf> {
    raw.split(':')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
pub(crate) fn test_config(media_root: &Path, workdir: &Path) -> Config {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_roots_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("media");
        let nested = root.join("tv");
        std::fs::create_dir_all(&nested).unwrap();

        let mut cfg = test_config(&root, &dir.path().join("work"));
        cfg.media_dirs.push(nested);
        assert!(matches!(cfg.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn workdir_inside_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("media");
        std::fs::create_dir_all(&root).unwrap();

        let cfg = test_config(&root, &root.join("scratch"));
        assert!(matches!(cfg.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn category_follows_tv_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let tv = dir.path().join("tv");
        let movies = dir.path().join("movies");
        std::fs::create_dir_all(&tv).unwrap();
        std::fs::create_dir_all(&movies).unwrap();

        let mut cfg = test_config(&movies, &dir.path().join("work"));
        cfg.media_dirs.push(tv.clone());
        cfg.tv_dirs.push(tv.clone());

        assert_eq!(cfg.category_for(&tv.join("show/e01.mkv")), Category::Tv);
        assert_eq!(cfg.category_for(&movies.join("a.mkv")), Category::Movie);
    }
}
