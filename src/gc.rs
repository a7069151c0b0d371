use crate::{error::StoreError, revision::Revision};
use fxhash::{FxHashMap, FxHashSet};
use log::{debug, trace};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

/// Tracks which revisions are still observed and which files their
/// supersession has made garbage, and physically reclaims files nobody can
/// see anymore.
///
/// The policy is strict: a file superseded at revision `S` is still visible
/// to every transaction whose snapshot is older than `S`, so it is deleted
/// only once no locked (observed) revision precedes `S` and no explicit pin
/// retains it. Everything else about when sweeping happens is left to the
/// caller.
#[derive(Default, Debug)]
pub struct GarbageCollector {
    state: Mutex<GcState>,
}

#[derive(Default, Debug)]
struct GcState {
    /// Observer count per revision, keyed in ascending order so the oldest
    /// observed revision is the first key.
    locked: BTreeMap<Revision, usize>,
    /// Files explicitly retained on behalf of a locked revision.
    pins: FxHashMap<Revision, FxHashSet<PathBuf>>,
    /// Files made garbage, keyed by the revision that superseded them.
    scheduled: BTreeMap<Revision, Vec<PathBuf>>,
}

impl GcState {
    fn is_pinned(&self, file: &Path) -> bool {
        self.pins.values().any(|files| files.contains(file))
    }
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer of `revision` (a transaction opening at that
    /// snapshot).
    pub fn lock_revision(&self, revision: Revision) {
        let mut state = self.state.lock();
        *state.locked.entry(revision).or_insert(0) += 1;
        trace!("gc: locked {revision}");
    }

    /// Drops one observer of `revision`; its pins go with the last one.
    pub fn unlock_revision(&self, revision: Revision) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let Some(count) = state.locked.get_mut(&revision) else {
            return Err(StoreError::IllegalState("unlocking a revision that is not locked"));
        };
        *count -= 1;
        if *count == 0 {
            state.locked.remove(&revision);
            state.pins.remove(&revision);
        }
        trace!("gc: unlocked {revision}");
        Ok(())
    }

    /// Retains `file` for as long as `revision` stays observed. Pinning a
    /// revision nobody observes is a misuse of the API.
    pub fn pin(&self, revision: Revision, file: PathBuf) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if !state.locked.contains_key(&revision) {
            return Err(StoreError::IllegalState("pinning a revision that is not locked"));
        }
        state.pins.entry(revision).or_default().insert(file);
        Ok(())
    }

    /// Marks `file` as superseded by `superseded_by`: garbage once no
    /// observer of an older revision remains.
    pub fn schedule(&self, file: PathBuf, superseded_by: Revision) {
        trace!("gc: scheduled {} (superseded by {superseded_by})", file.display());
        self.state.lock().scheduled.entry(superseded_by).or_default().push(file);
    }

    pub fn schedule_all(&self, files: Vec<PathBuf>, superseded_by: Revision) {
        if !files.is_empty() {
            self.state.lock().scheduled.entry(superseded_by).or_default().extend(files);
        }
    }

    /// Deletes every scheduled file no longer visible to any observer and
    /// not pinned; returns the number of files reclaimed. Pinned files stay
    /// scheduled for a later sweep.
    pub fn sweep(&self) -> Result<usize, StoreError> {
        let mut reclaim = Vec::new();
        {
            let mut state = self.state.lock();
            let oldest_locked = state.locked.keys().next().copied();
            let collectable: Vec<Revision> = state
                .scheduled
                .keys()
                .copied()
                .filter(|s| oldest_locked.map(|oldest| *s <= oldest).unwrap_or(true))
                .collect();
            for superseded_by in collectable {
                let files = state.scheduled.remove(&superseded_by).expect("key just listed");
                let (pinned, free): (Vec<_>, Vec<_>) =
                    files.into_iter().partition(|file| state.is_pinned(file));
                if !pinned.is_empty() {
                    state.scheduled.entry(superseded_by).or_default().extend(pinned);
                }
                reclaim.extend(free);
            }
        }

        let mut reclaimed = 0;
        for file in reclaim {
            match fs::remove_file(&file) {
                Ok(()) => reclaimed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if reclaimed > 0 {
            debug!("gc: reclaimed {reclaimed} files");
        }
        Ok(reclaimed)
    }

    /// The oldest revision still observed, if any.
    pub fn oldest_locked(&self) -> Option<Revision> {
        self.state.lock().locked.keys().next().copied()
    }
}
