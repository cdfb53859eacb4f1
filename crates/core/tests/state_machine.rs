//! Randomized state-sequence properties over the catalog: the in-flight
//! invariants hold after every operation, and a crash + recovery leaves
//! no entry in a transient state.

mod common;

use std::path::PathBuf;

use proptest::prelude::*;
use uuid::Uuid;

use common::FakeProber;
use spacesaver_core::classify::Disposition;
use spacesaver_core::db::Catalog;
use spacesaver_core::error::Result;
use spacesaver_core::hash::content_hash;
use spacesaver_core::models::{Category, EntryState, JobOutcome, MediaInfo};
use spacesaver_core::recover::recover;

const SLOTS: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Upsert(usize),
    Classify(usize),
    Claim,
    Begin,
    FinishDone,
    FinishFailed,
    FinishRequeued,
    Enqueue(usize),
    MarkGone(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..SLOTS).prop_map(Op::Upsert),
        (0..SLOTS).prop_map(Op::Classify),
        Just(Op::Claim),
        Just(Op::Begin),
        Just(Op::FinishDone),
        Just(Op::FinishFailed),
        Just(Op::FinishRequeued),
        (0..SLOTS).prop_map(Op::Enqueue),
        (0..SLOTS).prop_map(Op::MarkGone),
    ]
}

struct Machine {
    _dir: tempfile::TempDir,
    cfg: spacesaver_core::config::Config,
    catalog: Option<Catalog>,
    files: Vec<PathBuf>,
    ids: Vec<Option<Uuid>>,
}

impl Machine {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("media");
        let work = dir.path().join("work");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&work).unwrap();
        let cfg = common::config(&root, &work);

        let files: Vec<PathBuf> = (0..SLOTS)
            .map(|i| {
                let path = root.join(format!("file-{i}.mkv"));
                std::fs::write(&path, format!("distinct content {i}")).unwrap();
                path
            })
            .collect();

        let catalog = Catalog::open(&cfg.db_path()).unwrap();
        Self {
            _dir: dir,
            cfg,
            catalog: Some(catalog),
            files,
            ids: vec![None; SLOTS],
        }
    }

    fn catalog(&self) -> &Catalog {
        self.catalog.as_ref().unwrap()
    }

    /// Apply one operation. Conflicts and not-found results are part of
    /// normal operation under a random schedule and are ignored; any
    /// other error is a real defect.
    fn apply(&mut self, op: &Op) -> Result<()> {
        let outcome = match op {
            Op::Upsert(i) => {
                let path = &self.files[*i];
                let hash = content_hash(path)?;
                let size = std::fs::metadata(path)?.len();
                let info = MediaInfo {
                    codec: "h264".into(),
                    container: "matroska,webm".into(),
                    width: 1920,
                    height: 1080,
                    bitrate_bps: 20_000_000,
                    duration_s: 100.0,
                    frame_rate: 25.0,
                    audio_streams: Vec::new(),
                };
                let result = self
                    .catalog()
                    .upsert_by_path(path, &hash, size, Some(1), &info, Category::Movie);
                match result {
                    Ok((id, _)) => {
                        self.ids[*i] = Some(id);
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            Op::Classify(i) => match self.ids[*i] {
                Some(id) => self
                    .catalog()
                    .classify(id, &Disposition::Proceed)
                    .map(|_| ()),
                None => Ok(()),
            },
            Op::Claim => self.catalog().claim_next().map(|_| ()),
            Op::Begin => {
                let queued = self
                    .catalog()
                    .list(Some(EntryState::Queued))?
                    .into_iter()
                    .next();
                match queued {
                    Some(entry) => {
                        let workfile = self.cfg.workfile_path(entry.id);
                        self.catalog().begin(entry.id, &workfile)
                    }
                    None => Ok(()),
                }
            }
            Op::FinishDone => self.finish_current(|entry| JobOutcome::Done {
                new_path: entry.path.clone(),
            }),
            Op::FinishFailed => self.finish_current(|_| JobOutcome::Failed {
                reason: "scripted failure".into(),
            }),
            Op::FinishRequeued => self.finish_current(|_| JobOutcome::Requeued),
            Op::Enqueue(i) => match self.ids[*i] {
                Some(id) => self.catalog().enqueue(id),
                None => Ok(()),
            },
            Op::MarkGone(i) => match self.ids[*i] {
                Some(id) => self.catalog().mark_gone(id),
                None => Ok(()),
            },
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(spacesaver_core::Error::Conflict(_)) | Err(spacesaver_core::Error::NotFound(_)) => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn finish_current(&self, outcome: impl Fn(&spacesaver_core::MediaEntry) -> JobOutcome) -> Result<()> {
        let current = self
            .catalog()
            .list(Some(EntryState::InProgress))?
            .into_iter()
            .next();
        match current {
            Some(entry) => self.catalog().finish(entry.id, &outcome(&entry)),
            None => Ok(()),
        }
    }

    /// Invariants that must hold after every single operation.
    fn check_invariants(&self) {
        let entries = self.catalog().list(None).unwrap();

        let in_progress = entries
            .iter()
            .filter(|e| e.state == EntryState::InProgress)
            .count();
        assert!(in_progress <= 1, "more than one entry in progress");

        for entry in &entries {
            assert_eq!(
                entry.workdir_path.is_some(),
                entry.state == EntryState::InProgress,
                "workdir_path must be set exactly while in progress (entry {} is {})",
                entry.id,
                entry.state.as_str()
            );
            assert_eq!(
                entry.pre_hash.is_some(),
                entry.state.is_in_flight(),
                "pre_hash must be pinned exactly while in flight (entry {} is {})",
                entry.id,
                entry.state.as_str()
            );
        }

        // Hash uniqueness among live entries; duplicates are only ever
        // distinct files, which this schedule never creates.
        let mut live_hashes: Vec<&str> = entries
            .iter()
            .filter(|e| e.state != EntryState::Gone)
            .map(|e| e.content_hash.as_str())
            .collect();
        live_hashes.sort_unstable();
        let before = live_hashes.len();
        live_hashes.dedup();
        assert_eq!(before, live_hashes.len(), "duplicate live content hash");
    }

    /// Simulate a crash (drop the handle) and a restart (reopen +
    /// recover).
    fn crash_and_recover(&mut self) {
        self.catalog = None;
        let catalog = Catalog::open(&self.cfg.db_path()).unwrap();
        // No workfiles were ever written, so salvage never fires and the
        // prober is never consulted.
        recover(&catalog, &self.cfg, &FakeProber::new()).unwrap();
        self.catalog = Some(catalog);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn invariants_hold_under_random_schedules(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let mut machine = Machine::new();
        for op in &ops {
            machine.apply(op).unwrap();
            machine.check_invariants();
        }

        machine.crash_and_recover();
        machine.check_invariants();

        // Recovery leaves nothing transient behind.
        let entries = machine.catalog().list(None).unwrap();
        for entry in &entries {
            prop_assert!(
                !entry.state.is_in_flight(),
                "entry {} still {} after recovery",
                entry.id,
                entry.state.as_str()
            );
        }

        // And a second recovery is a no-op.
        let stats = recover(machine.catalog(), &machine.cfg, &FakeProber::new()).unwrap();
        prop_assert_eq!(stats.examined, 0);
    }
}
