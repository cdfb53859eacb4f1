use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::classify::Disposition;
use crate::error::{Error, Result};
use crate::models::{Category, EntryState, JobOutcome, MediaEntry, MediaInfo, StateCounts};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE entries (
  id TEXT PRIMARY KEY NOT NULL,
  path TEXT NOT NULL UNIQUE,
  content_hash TEXT NOT NULL,
  size_bytes INTEGER NOT NULL,
  mtime_secs INTEGER,
  codec TEXT NOT NULL DEFAULT '',
  width INTEGER NOT NULL DEFAULT 0,
  height INTEGER NOT NULL DEFAULT 0,
  bitrate_bps INTEGER NOT NULL DEFAULT 0,
  duration_s REAL NOT NULL DEFAULT 0.0,
  category TEXT NOT NULL,
  state TEXT NOT NULL DEFAULT 'new',
  attempts INTEGER NOT NULL DEFAULT 0,
  last_error TEXT NOT NULL DEFAULT '',
  workdir_path TEXT,
  pre_hash TEXT,
  updated_at INTEGER NOT NULL
);

CREATE INDEX idx_entries_hash ON entries(content_hash);
CREATE INDEX idx_entries_state ON entries(state);
CREATE INDEX idx_entries_size_desc ON entries(size_bytes DESC);
"#;

const COLUMNS: &str = "id, path, content_hash, size_bytes, mtime_secs, codec, width, height, \
                       bitrate_bps, duration_s, category, state, attempts, last_error, \
                       workdir_path, pre_hash, updated_at";

/// The single source of truth for entry lifecycle state. Single-writer:
/// every mutation runs under one connection behind a mutex, and SQLite's
/// default synchronous mode makes each statement durable before the call
/// returns. A condition variable bound to the catalog wakes the worker
/// when something becomes claimable.
pub struct Catalog {
    conn: Mutex<Connection>,
    wake: Condvar,
}

impl Catalog {
    /// Open (or create) the catalog at `path`. A store that fails the
    /// validity check (corruption, incompatible schema version) is
    /// discarded and recreated empty; the scanner rebuilds it.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        match Self::try_open(path) {
            Ok(catalog) => Ok(catalog),
            Err(err) => {
                tracing::warn!(
                    db = %path.display(),
                    error = %err,
                    "catalog failed validity check, recreating empty"
                );
                remove_store_files(path);
                Self::try_open(path)
            }
        }
    }

    fn try_open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        validate_store(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            wake: Condvar::new(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or refresh the entry at `path`. Returns the entry id and
    /// whether a new row was created.
    ///
    /// Resolution order: an existing row at the same path is refreshed
    /// in place; otherwise a row with the same content hash has moved
    /// (path updated, but only when its old path is no longer on disk; a
    /// still-present old path means a duplicate, which gets its own row
    /// for the scanner to resolve) or, if tombstoned, re-appeared
    /// (revived to `New`); only then is a fresh row inserted.
    pub fn upsert_by_path(
        &self,
        path: &Path,
        content_hash: &str,
        size_bytes: u64,
        mtime_secs: Option<i64>,
        info: &MediaInfo,
        category: Category,
    ) -> Result<(Uuid, bool)> {
        let conn = self.conn();
        let now = now_secs();
        let path_str = path_str(path);

        if let Some(entry) = query_entry(
            &conn,
            &format!("SELECT {COLUMNS} FROM entries WHERE path = ?1"),
            params![path_str],
        )? {
            // A file at a tombstoned path is a re-appearance: back to
            // `New` for reclassification.
            let state = if entry.state == EntryState::Gone {
                EntryState::New
            } else {
                entry.state
            };
            conn.execute(
                "UPDATE entries SET content_hash = ?2, size_bytes = ?3, mtime_secs = ?4, \
                 codec = ?5, width = ?6, height = ?7, bitrate_bps = ?8, duration_s = ?9, \
                 category = ?10, state = ?11, updated_at = ?12 WHERE id = ?1",
                params![
                    entry.id.to_string(),
                    content_hash,
                    size_bytes as i64,
                    mtime_secs,
                    info.codec,
                    info.width,
                    info.height,
                    info.bitrate_bps as i64,
                    info.duration_s,
                    category.as_str(),
                    state.as_str(),
                    now,
                ],
            )?;
            return Ok((entry.id, false));
        }

        let hash_match = query_entry(
            &conn,
            &format!("SELECT {COLUMNS} FROM entries WHERE content_hash = ?1 ORDER BY updated_at DESC"),
            params![content_hash],
        )?
        .filter(|entry| entry.state == EntryState::Gone || !entry.path.exists());
        if let Some(entry) = hash_match {
            if entry.state == EntryState::Gone {
                conn.execute(
                    "UPDATE entries SET path = ?2, size_bytes = ?3, mtime_secs = ?4, \
                     codec = ?5, width = ?6, height = ?7, bitrate_bps = ?8, duration_s = ?9, \
                     category = ?10, state = 'new', last_error = '', updated_at = ?11 \
                     WHERE id = ?1",
                    params![
                        entry.id.to_string(),
                        path_str,
                        size_bytes as i64,
                        mtime_secs,
                        info.codec,
                        info.width,
                        info.height,
                        info.bitrate_bps as i64,
                        info.duration_s,
                        category.as_str(),
                        now,
                    ],
                )?;
            } else {
                conn.execute(
                    "UPDATE entries SET path = ?2, size_bytes = ?3, mtime_secs = ?4, \
                     category = ?5, updated_at = ?6 WHERE id = ?1",
                    params![
                        entry.id.to_string(),
                        path_str,
                        size_bytes as i64,
                        mtime_secs,
                        category.as_str(),
                        now,
                    ],
                )?;
            }
            return Ok((entry.id, false));
        }

        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO entries (id, path, content_hash, size_bytes, mtime_secs, codec, \
             width, height, bitrate_bps, duration_s, category, state, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'new', ?12)",
            params![
                id.to_string(),
                path_str,
                content_hash,
                size_bytes as i64,
                mtime_secs,
                info.codec,
                info.width,
                info.height,
                info.bitrate_bps as i64,
                info.duration_s,
                category.as_str(),
                now,
            ],
        )?;
        Ok((id, true))
    }

    /// Apply the initial disposition to a `New` entry. A transition into
    /// `Pending` wakes the worker.
    pub fn classify(&self, id: Uuid, disposition: &Disposition) -> Result<EntryState> {
        let new_state = match disposition {
            Disposition::Proceed => EntryState::Pending,
            Disposition::Skip(_) => EntryState::Skip,
        };
        {
            let conn = self.conn();
            let changed = conn.execute(
                "UPDATE entries SET state = ?2, updated_at = ?3 WHERE id = ?1 AND state = 'new'",
                params![id.to_string(), new_state.as_str(), now_secs()],
            )?;
            if changed == 0 {
                return Err(Error::Conflict(format!(
                    "entry {id} is not in state new"
                )));
            }
        }
        if new_state == EntryState::Pending {
            self.wake.notify_all();
        }
        Ok(new_state)
    }

    /// Atomically pick the best `Pending` entry (largest first, then
    /// oldest) and move it to `Queued`, pinning `pre_hash`. Returns
    /// nothing while any entry is already in flight.
    pub fn claim_next(&self) -> Result<Option<MediaEntry>> {
        let conn = self.conn();
        let in_flight: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE state IN ('queued', 'in_progress')",
            [],
            |r| r.get(0),
        )?;
        if in_flight > 0 {
            return Ok(None);
        }
        query_entry(
            &conn,
            &format!(
                "UPDATE entries SET state = 'queued', pre_hash = content_hash, updated_at = ?1 \
                 WHERE id = (SELECT id FROM entries WHERE state = 'pending' \
                             ORDER BY size_bytes DESC, updated_at ASC LIMIT 1) \
                 RETURNING {COLUMNS}"
            ),
            params![now_secs()],
        )
    }

    /// `Queued` → `InProgress`, recording the scratch output path and
    /// bumping the attempt counter. Refuses a second in-flight encode.
    pub fn begin(&self, id: Uuid, workdir_path: &Path) -> Result<()> {
        let conn = self.conn();
        let running: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE state = 'in_progress'",
            [],
            |r| r.get(0),
        )?;
        if running > 0 {
            return Err(Error::Conflict(
                "another entry is already in progress".into(),
            ));
        }
        let changed = conn.execute(
            "UPDATE entries SET state = 'in_progress', workdir_path = ?2, \
             attempts = attempts + 1, updated_at = ?3 WHERE id = ?1 AND state = 'queued'",
            params![id.to_string(), path_str(workdir_path), now_secs()],
        )?;
        if changed == 0 {
            return Err(Error::Conflict(format!("entry {id} is not queued")));
        }
        Ok(())
    }

    /// Settle an `InProgress` entry. Called only after the outcome's side
    /// effect (replacement rename, workfile deletion) is durable. A
    /// concurrent tombstone wins: finishing a `Gone` entry is a no-op.
    pub fn finish(&self, id: Uuid, outcome: &JobOutcome) -> Result<()> {
        let requeued = {
            let conn = self.conn();
            let entry = query_entry(
                &conn,
                &format!("SELECT {COLUMNS} FROM entries WHERE id = ?1"),
                params![id.to_string()],
            )?
            .ok_or_else(|| Error::NotFound(format!("entry {id}")))?;

            if entry.state == EntryState::Gone {
                return Ok(());
            }
            if entry.state != EntryState::InProgress {
                return Err(Error::Conflict(format!(
                    "entry {id} is {}, not in_progress",
                    entry.state.as_str()
                )));
            }

            match outcome {
                JobOutcome::Done { new_path } => {
                    conn.execute(
                        "UPDATE entries SET state = 'done', path = ?2, workdir_path = NULL, \
                         pre_hash = NULL, last_error = '', updated_at = ?3 WHERE id = ?1",
                        params![id.to_string(), path_str(new_path), now_secs()],
                    )?;
                    false
                }
                JobOutcome::Failed { reason } => {
                    conn.execute(
                        "UPDATE entries SET state = 'failed', workdir_path = NULL, \
                         pre_hash = NULL, last_error = ?2, updated_at = ?3 WHERE id = ?1",
                        params![id.to_string(), reason, now_secs()],
                    )?;
                    false
                }
                JobOutcome::Requeued => {
                    conn.execute(
                        "UPDATE entries SET state = 'pending', workdir_path = NULL, \
                         pre_hash = NULL, last_error = '', updated_at = ?2 WHERE id = ?1",
                        params![id.to_string(), now_secs()],
                    )?;
                    true
                }
            }
        };
        if requeued {
            self.wake.notify_all();
        }
        Ok(())
    }

    /// Recovery reset: drop an in-flight entry back to `Pending`,
    /// clearing the pinned hash and scratch path.
    pub fn reset_in_flight(&self, id: Uuid) -> Result<()> {
        {
            let conn = self.conn();
            let changed = conn.execute(
                "UPDATE entries SET state = 'pending', workdir_path = NULL, pre_hash = NULL, \
                 updated_at = ?2 WHERE id = ?1 AND state IN ('queued', 'in_progress')",
                params![id.to_string(), now_secs()],
            )?;
            if changed == 0 {
                return Err(Error::Conflict(format!("entry {id} is not in flight")));
            }
        }
        self.wake.notify_all();
        Ok(())
    }

    /// Tombstone an entry whose file no longer exists on disk. Valid from
    /// any state; transient fields are cleared so the in-flight
    /// invariants keep holding.
    pub fn mark_gone(&self, id: Uuid) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE entries SET state = 'gone', workdir_path = NULL, pre_hash = NULL, \
             updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), now_secs()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("entry {id}")));
        }
        Ok(())
    }

    /// Explicit request to (re-)process. `Gone` entries and in-flight
    /// entries refuse; `Pending` is a no-op.
    pub fn enqueue(&self, id: Uuid) -> Result<()> {
        {
            let conn = self.conn();
            let entry = query_entry(
                &conn,
                &format!("SELECT {COLUMNS} FROM entries WHERE id = ?1"),
                params![id.to_string()],
            )?
            .ok_or_else(|| Error::NotFound(format!("entry {id}")))?;

            match entry.state {
                EntryState::Pending => return Ok(()),
                EntryState::Gone => {
                    return Err(Error::Conflict(format!("entry {id} is gone")));
                }
                EntryState::Queued | EntryState::InProgress => {
                    return Err(Error::Conflict(format!("entry {id} is in flight")));
                }
                EntryState::New
                | EntryState::Skip
                | EntryState::Failed
                | EntryState::Done => {
                    conn.execute(
                        "UPDATE entries SET state = 'pending', last_error = '', updated_at = ?2 \
                         WHERE id = ?1",
                        params![id.to_string(), now_secs()],
                    )?;
                }
            }
        }
        self.wake.notify_all();
        Ok(())
    }

    /// Promote the best `Skip`/`Failed` candidate to `Pending` with the
    /// same tie-break as `claim_next`.
    pub fn enqueue_best(&self) -> Result<Option<Uuid>> {
        let promoted = {
            let conn = self.conn();
            query_entry(
                &conn,
                &format!(
                    "UPDATE entries SET state = 'pending', last_error = '', updated_at = ?1 \
                     WHERE id = (SELECT id FROM entries WHERE state IN ('skip', 'failed') \
                                 ORDER BY size_bytes DESC, updated_at ASC LIMIT 1) \
                     RETURNING {COLUMNS}"
                ),
                params![now_secs()],
            )?
        };
        if promoted.is_some() {
            self.wake.notify_all();
        }
        Ok(promoted.map(|e| e.id))
    }

    pub fn get(&self, id: Uuid) -> Result<Option<MediaEntry>> {
        let conn = self.conn();
        query_entry(
            &conn,
            &format!("SELECT {COLUMNS} FROM entries WHERE id = ?1"),
            params![id.to_string()],
        )
    }

    pub fn get_by_path(&self, path: &Path) -> Result<Option<MediaEntry>> {
        let conn = self.conn();
        query_entry(
            &conn,
            &format!("SELECT {COLUMNS} FROM entries WHERE path = ?1"),
            params![path_str(path)],
        )
    }

    pub fn list(&self, state: Option<EntryState>) -> Result<Vec<MediaEntry>> {
        let conn = self.conn();
        match state {
            Some(state) => query_entries(
                &conn,
                &format!("SELECT {COLUMNS} FROM entries WHERE state = ?1 ORDER BY path"),
                params![state.as_str()],
            ),
            None => query_entries(
                &conn,
                &format!("SELECT {COLUMNS} FROM entries ORDER BY path"),
                params![],
            ),
        }
    }

    /// Entries the recovery pass must reconcile.
    pub fn entries_in_flight(&self) -> Result<Vec<MediaEntry>> {
        let conn = self.conn();
        query_entries(
            &conn,
            &format!(
                "SELECT {COLUMNS} FROM entries WHERE state IN ('queued', 'in_progress') \
                 ORDER BY updated_at"
            ),
            params![],
        )
    }

    /// Groups of live entries sharing a content hash, ordered by path
    /// within each group. The scanner resolves these.
    pub fn live_duplicates(&self) -> Result<Vec<Vec<MediaEntry>>> {
        let conn = self.conn();
        let rows = query_entries(
            &conn,
            &format!(
                "SELECT {COLUMNS} FROM entries e WHERE e.state != 'gone' AND EXISTS (
                   SELECT 1 FROM entries o
                   WHERE o.content_hash = e.content_hash AND o.id != e.id AND o.state != 'gone'
                 ) ORDER BY e.content_hash, e.path"
            ),
            params![],
        )?;

        let mut groups: Vec<Vec<MediaEntry>> = Vec::new();
        for entry in rows {
            match groups.last_mut() {
                Some(group) if group[0].content_hash == entry.content_hash => group.push(entry),
                _ => groups.push(vec![entry]),
            }
        }
        Ok(groups)
    }

    pub fn state_counts(&self) -> Result<StateCounts> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM entries GROUP BY state")?;
        let mut rows = stmt.query([])?;
        let mut counts = StateCounts::default();
        while let Some(row) = rows.next()? {
            let state: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let count = count.max(0) as u64;
            match EntryState::parse(&state) {
                Some(EntryState::New) => counts.new = count,
                Some(EntryState::Skip) => counts.skip = count,
                Some(EntryState::Pending) => counts.pending = count,
                Some(EntryState::Queued) => counts.queued = count,
                Some(EntryState::InProgress) => counts.in_progress = count,
                Some(EntryState::Done) => counts.done = count,
                Some(EntryState::Failed) => counts.failed = count,
                Some(EntryState::Gone) => counts.gone = count,
                None => {}
            }
        }
        Ok(counts)
    }

    /// Park the worker until something becomes claimable or the timeout
    /// elapses. The timeout is the periodic floor; a missed notification
    /// costs at most one period.
    pub fn wait_for_work(&self, timeout: Duration) {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self.wake.wait_timeout(guard, timeout);
    }

    /// Wake the worker without a state change (shutdown, external nudge).
    pub fn notify_worker(&self) {
        self.wake.notify_all();
    }
}

/// Cheap self-consistency probe: integrity check plus schema version. A
/// fresh store gets the schema; an incompatible one is rejected so the
/// caller can discard it.
fn validate_store(conn: &Connection) -> Result<()> {
    let check: String = conn.query_row("PRAGMA quick_check", [], |r| r.get(0))?;
    if check != "ok" {
        return Err(Error::InvalidArgument(format!(
            "integrity check failed: {check}"
        )));
    }

    let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    let has_entries: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'entries'",
            [],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if version == 0 && !has_entries {
        conn.execute_batch(SCHEMA_SQL)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        return Ok(());
    }
    if version != SCHEMA_VERSION || !has_entries {
        return Err(Error::InvalidArgument(format!(
            "schema version {version} does not match expected {SCHEMA_VERSION}"
        )));
    }
    Ok(())
}

fn remove_store_files(path: &Path) {
    let _ = std::fs::remove_file(path);
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(side));
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}

fn query_entry<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Option<MediaEntry>> {
    Ok(conn.query_row(sql, params, row_to_entry).optional()?)
}

fn query_entries<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<MediaEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_entry)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn row_to_entry(r: &rusqlite::Row) -> rusqlite::Result<MediaEntry> {
    let id_raw: String = r.get(0)?;
    let id = Uuid::parse_str(&id_raw)
        .map_err(|e| conversion_error(0, format!("bad uuid {id_raw}: {e}")))?;
    let category_raw: String = r.get(10)?;
    let category = Category::parse(&category_raw)
        .ok_or_else(|| conversion_error(10, format!("unknown category: {category_raw}")))?;
    let state_raw: String = r.get(11)?;
    let state = EntryState::parse(&state_raw)
        .ok_or_else(|| conversion_error(11, format!("unknown state: {state_raw}")))?;

    Ok(MediaEntry {
        id,
        path: PathBuf::from(r.get::<_, String>(1)?),
        content_hash: r.get(2)?,
        size_bytes: r.get::<_, i64>(3)?.max(0) as u64,
        mtime_secs: r.get(4)?,
        codec: r.get(5)?,
        width: r.get::<_, i64>(6)?.max(0) as u32,
        height: r.get::<_, i64>(7)?.max(0) as u32,
        bitrate_bps: r.get::<_, i64>(8)?.max(0) as u64,
        duration_s: r.get(9)?,
        category,
        state,
        attempts: r.get::<_, i64>(12)?.max(0) as u32,
        last_error: r.get(13)?,
        workdir_path: r.get::<_, Option<String>>(14)?.map(PathBuf::from),
        pre_hash: r.get(15)?,
        updated_at: r.get(16)?,
    })
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(message),
    )
}
