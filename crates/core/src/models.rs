use std::path::PathBuf;

use uuid::Uuid;

/// Lifecycle state of a catalog entry.
///
/// `Done` and `Gone` are terminal; `Skip` and `Failed` stay put until an
/// explicit enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    New,
    Skip,
    Pending,
    Queued,
    InProgress,
    Done,
    Failed,
    Gone,
}

impl EntryState {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryState::New => "new",
            EntryState::Skip => "skip",
            EntryState::Pending => "pending",
            EntryState::Queued => "queued",
            EntryState::InProgress => "in_progress",
            EntryState::Done => "done",
            EntryState::Failed => "failed",
            EntryState::Gone => "gone",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "new" => EntryState::New,
            "skip" => EntryState::Skip,
            "pending" => EntryState::Pending,
            "queued" => EntryState::Queued,
            "in_progress" => EntryState::InProgress,
            "done" => EntryState::Done,
            "failed" => EntryState::Failed,
            "gone" => EntryState::Gone,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EntryState::Done | EntryState::Gone)
    }

    /// States with encode work either claimed or running.
    pub fn is_in_flight(self) -> bool {
        matches!(self, EntryState::Queued | EntryState::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Tv,
    Movie,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Tv => "tv",
            Category::Movie => "movie",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "tv" => Category::Tv,
            "movie" => Category::Movie,
            _ => return None,
        })
    }
}

/// One catalog row. Identity is carried by `content_hash`; `path` follows
/// the file around.
#[derive(Debug, Clone)]
pub struct MediaEntry {
    pub id: Uuid,
    pub path: PathBuf,
    pub content_hash: String,
    pub size_bytes: u64,
    pub mtime_secs: Option<i64>,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u64,
    pub duration_s: f64,
    pub category: Category,
    pub state: EntryState,
    pub attempts: u32,
    pub last_error: String,
    pub workdir_path: Option<PathBuf>,
    pub pre_hash: Option<String>,
    pub updated_at: i64,
}

/// Probed facts about one audio stream, enough to pick a target codec.
#[derive(Debug, Clone, Default)]
pub struct AudioStream {
    pub codec: String,
    pub profile: String,
    pub channels: u32,
}

/// Full probe of a media file.
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub container: String,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u64,
    pub duration_s: f64,
    pub frame_rate: f64,
    pub audio_streams: Vec<AudioStream>,
}

/// What the worker (or salvage) reports back when an in-flight entry
/// settles.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Replacement is durable on disk at `new_path`.
    Done { new_path: PathBuf },
    /// Permanent failure; waits for an explicit enqueue.
    Failed { reason: String },
    /// Expected race (source changed under us); back to the queue, no
    /// error recorded.
    Requeued,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StateCounts {
    pub new: u64,
    pub skip: u64,
    pub pending: u64,
    pub queued: u64,
    pub in_progress: u64,
    pub done: u64,
    pub failed: u64,
    pub gone: u64,
}

impl StateCounts {
    pub fn total(&self) -> u64 {
        self.new
            + self.skip
            + self.pending
            + self.queued
            + self.in_progress
            + self.done
            + self.failed
            + self.gone
    }
}

#[derive(Debug, Default, Clone)]
pub struct ScanStats {
    pub files_seen: u64,
    pub files_unchanged: u64,
    pub files_probed: u64,
    pub added: u64,
    pub duplicates_removed: u64,
    pub vanished: u64,
    pub errors: u64,
}

#[derive(Debug, Default, Clone)]
pub struct RecoveryStats {
    pub examined: u64,
    pub salvaged: u64,
    pub requeued: u64,
    pub gone: u64,
    pub orphans_removed: u64,
}
