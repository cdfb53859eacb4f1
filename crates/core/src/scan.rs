use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use walkdir::WalkDir;

use crate::classify;
use crate::config::Config;
use crate::db::Catalog;
use crate::error::{Error, Result};
use crate::hash::content_hash;
use crate::models::{EntryState, ScanStats};
use crate::probe::Prober;
use crate::stop::StopToken;

/// Extensions considered media. Everything else is invisible to the
/// catalog.
pub const MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "mov", "m4v", "ts", "wmv"];

/// Levels below each media root the walk descends.
const MAX_SCAN_DEPTH: usize = 3;

/// One reconciliation pass over every media root: discover and probe
/// changed files, classify new entries, resolve duplicates, tombstone
/// vanished files. Each file is its own catalog transaction, so an
/// interrupted pass loses at most the unprobed tail.
pub fn scan_pass(
    catalog: &Catalog,
    cfg: &Config,
    prober: &dyn Prober,
    stop: &StopToken,
) -> Result<ScanStats> {
    let mut stats = ScanStats::default();

    for root in &cfg.media_dirs {
        if !root.is_dir() {
            tracing::warn!(root = %root.display(), "media root missing, skipping");
            continue;
        }
        for entry in WalkDir::new(root)
            .max_depth(MAX_SCAN_DEPTH)
            .follow_links(false)
            .into_iter()
        {
            if stop.is_stopped() {
                return Err(Error::Interrupted);
            }

            let entry = match entry {
                Ok(v) => v,
                Err(_) => {
                    stats.errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() || !has_media_extension(entry.path()) {
                continue;
            }

            stats.files_seen += 1;
            if let Err(err) = scan_file(catalog, cfg, prober, entry.path(), &mut stats) {
                stats.errors += 1;
                tracing::warn!(path = %entry.path().display(), error = %err, "scan of file failed");
            }
        }
    }

    dedup_pass(catalog, &mut stats)?;
    vanish_pass(catalog, &mut stats)?;

    Ok(stats)
}

fn scan_file(
    catalog: &Catalog,
    cfg: &Config,
    prober: &dyn Prober,
    path: &Path,
    stats: &mut ScanStats,
) -> Result<()> {
    let md = std::fs::metadata(path)?;
    let size = md.len();
    let mtime = md.modified().ok().map(system_time_to_secs);

    // Cheap check first: an unchanged (path, size, mtime) needs no
    // hash. A tombstoned entry never matches; the file in front of us
    // proves it is back.
    if let Some(existing) = catalog.get_by_path(path)? {
        if existing.state != EntryState::Gone
            && existing.size_bytes == size
            && existing.mtime_secs == mtime
        {
            stats.files_unchanged += 1;
            return Ok(());
        }
    }

    let hash = content_hash(path)?;
    let info = prober.probe(path)?;
    let category = cfg.category_for(path);
    stats.files_probed += 1;

    let (id, inserted) = catalog.upsert_by_path(path, &hash, size, mtime, &info, category)?;
    if inserted {
        stats.added += 1;
    }

    let entry = catalog
        .get(id)?
        .ok_or_else(|| Error::NotFound(format!("entry {id}")))?;
    if entry.state == EntryState::New {
        let disposition = classify::disposition(cfg, category, &info);
        let new_state = catalog.classify(id, &disposition)?;
        match &disposition {
            classify::Disposition::Skip(reason) => {
                tracing::info!(%id, path = %path.display(), reason, "classified skip");
            }
            classify::Disposition::Proceed => {
                tracing::info!(%id, path = %path.display(), state = new_state.as_str(), "classified");
            }
        }
    }
    Ok(())
}

/// Two live entries with the same content hash are the same bytes twice:
/// keep the lexicographically earliest path, delete the rest from disk
/// and tombstone them. Groups touching in-flight work are deferred until
/// that work settles.
fn dedup_pass(catalog: &Catalog, stats: &mut ScanStats) -> Result<()> {
    for group in catalog.live_duplicates()? {
        if group.iter().any(|e| e.state.is_in_flight()) {
            tracing::debug!(
                hash = %group[0].content_hash,
                "duplicate group has in-flight entry, deferring"
            );
            continue;
        }
        for dup in &group[1..] {
            if let Err(err) = std::fs::remove_file(&dup.path) {
                // An already-absent duplicate still gets its tombstone.
                if dup.path.exists() {
                    stats.errors += 1;
                    tracing::warn!(path = %dup.path.display(), error = %err, "could not remove duplicate");
                    continue;
                }
            }
            catalog.mark_gone(dup.id)?;
            stats.duplicates_removed += 1;
            tracing::info!(
                id = %dup.id,
                path = %dup.path.display(),
                kept = %group[0].path.display(),
                "removed duplicate"
            );
        }
    }
    Ok(())
}

/// Tombstone every entry whose file is no longer on disk.
fn vanish_pass(catalog: &Catalog, stats: &mut ScanStats) -> Result<()> {
    for entry in catalog.list(None)? {
        if entry.state == EntryState::Gone {
            continue;
        }
        if !entry.path.exists() {
            catalog.mark_gone(entry.id)?;
            stats.vanished += 1;
            tracing::info!(id = %entry.id, path = %entry.path.display(), "file vanished");
        }
    }
    Ok(())
}

/// Background loop: one pass at startup, then one per configured
/// interval until stopped.
pub fn run_scanner(
    catalog: Arc<Catalog>,
    cfg: Arc<Config>,
    prober: Arc<dyn Prober>,
    stop: StopToken,
) {
    loop {
        match scan_pass(&catalog, &cfg, prober.as_ref(), &stop) {
            Ok(stats) => {
                tracing::info!(
                    seen = stats.files_seen,
                    unchanged = stats.files_unchanged,
                    probed = stats.files_probed,
                    added = stats.added,
                    duplicates = stats.duplicates_removed,
                    vanished = stats.vanished,
                    errors = stats.errors,
                    "scan pass complete"
                );
            }
            Err(Error::Interrupted) => break,
            Err(err) => {
                tracing::error!(error = %err, "scan pass failed");
            }
        }
        if stop.wait(cfg.rescan_interval) {
            break;
        }
    }
    tracing::info!("scanner stopped");
}

fn has_media_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
}

fn system_time_to_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}
