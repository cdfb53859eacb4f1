use crate::config::Config;
use crate::db::Catalog;
use crate::error::Result;
use crate::hash::content_hash;
use crate::models::{JobOutcome, MediaEntry, RecoveryStats};
use crate::probe::Prober;
use crate::replace;
use crate::worker::{check_acceptance, discard_workfile, Acceptance};

/// Startup reconciliation: runs exactly once, before the scanner and
/// before the worker may claim. Leaves no entry in a transient state:
/// interrupted work is either salvaged into a completed replacement,
/// re-queued, or tombstoned. Idempotent: a second pass finds nothing.
pub fn recover(catalog: &Catalog, cfg: &Config, prober: &dyn Prober) -> Result<RecoveryStats> {
    let mut stats = RecoveryStats::default();

    for entry in catalog.entries_in_flight()? {
        stats.examined += 1;
        reconcile(catalog, cfg, prober, &entry, &mut stats)?;
    }

    sweep_orphans(cfg, &mut stats);

    tracing::info!(
        examined = stats.examined,
        salvaged = stats.salvaged,
        requeued = stats.requeued,
        gone = stats.gone,
        orphans = stats.orphans_removed,
        "recovery complete"
    );
    Ok(stats)
}

fn reconcile(
    catalog: &Catalog,
    cfg: &Config,
    prober: &dyn Prober,
    entry: &MediaEntry,
    stats: &mut RecoveryStats,
) -> Result<()> {
    if !entry.path.exists() {
        if let Some(workfile) = &entry.workdir_path {
            discard_workfile(workfile);
        }
        catalog.mark_gone(entry.id)?;
        stats.gone += 1;
        tracing::info!(id = %entry.id, path = %entry.path.display(), "original vanished, tombstoned");
        return Ok(());
    }

    let pre_hash = entry.pre_hash.as_deref().unwrap_or_default();
    let current_hash = match content_hash(&entry.path) {
        Ok(hash) => hash,
        Err(err) => {
            tracing::warn!(id = %entry.id, error = %err, "could not re-hash original, requeueing");
            String::new()
        }
    };
    if current_hash != pre_hash {
        if let Some(workfile) = &entry.workdir_path {
            discard_workfile(workfile);
        }
        catalog.reset_in_flight(entry.id)?;
        stats.requeued += 1;
        tracing::info!(id = %entry.id, "source changed mid-flight, requeued");
        return Ok(());
    }

    let workfile = entry.workdir_path.clone().filter(|w| w.exists());
    let Some(workfile) = workfile else {
        catalog.reset_in_flight(entry.id)?;
        stats.requeued += 1;
        return Ok(());
    };

    // The workfile survived the crash: promote it if and only if it
    // passes the same acceptance gate a live encode would.
    match check_acceptance(prober, cfg, &workfile, entry.size_bytes, entry.duration_s) {
        Acceptance::Accepted => {
            let target = entry.path.with_extension("mkv");
            if let Err(err) = replace::replace_file(&workfile, &target) {
                tracing::warn!(id = %entry.id, error = %err, "salvage replace failed, requeueing");
                discard_workfile(&workfile);
                catalog.reset_in_flight(entry.id)?;
                stats.requeued += 1;
                return Ok(());
            }
            if target != entry.path {
                if let Err(err) = replace::remove_durably(&entry.path) {
                    tracing::warn!(
                        id = %entry.id,
                        path = %entry.path.display(),
                        error = %err,
                        "could not unlink original after salvage"
                    );
                }
            }
            catalog.finish(entry.id, &JobOutcome::Done { new_path: target })?;
            stats.salvaged += 1;
            tracing::info!(id = %entry.id, "salvaged interrupted encode");
        }
        Acceptance::Rejected(reason) => {
            discard_workfile(&workfile);
            catalog.reset_in_flight(entry.id)?;
            stats.requeued += 1;
            tracing::info!(id = %entry.id, %reason, "salvage rejected, requeued");
        }
    }
    Ok(())
}

/// After reconciliation no entry references the workdir, so every
/// leftover encode output there is an orphan from a previous life.
fn sweep_orphans(cfg: &Config, stats: &mut RecoveryStats) {
    let entries = match std::fs::read_dir(&cfg.workdir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_mkv = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mkv"));
        if is_mkv && std::fs::remove_file(&path).is_ok() {
            stats.orphans_removed += 1;
            tracing::warn!(path = %path.display(), "removed orphaned workfile");
        }
    }
}
