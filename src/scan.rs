use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::hash_map::Entry;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::CuratorError;
use crate::platform::{PathState, PlatformClient};

/// Locates one claimant of a derived path: enough to re-fetch the file later
/// plus the two sort keys captured at discovery time. `discovered` is the
/// order the detector first saw the file and is the secondary sort key when
/// the primary key ties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub session_id: String,
    pub acquisition_id: String,
    pub file_index: usize,
    pub acquired_at: Option<DateTime<Utc>>,
    pub size: u64,
    pub discovered: usize,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Derived path -> first file that claimed it.
    pub claims: HashMap<String, FileRef>,
    /// Derived path -> every claimant, in discovery order, for paths claimed
    /// more than once. Ordered by path so resolution order is stable.
    pub groups: BTreeMap<String, Vec<FileRef>>,
    pub files_seen: usize,
    pub eligible: usize,
    pub skipped_ignored: usize,
    pub skipped_incomplete: usize,
    pub skipped_uncurated: usize,
}

/// Accumulates path claims over one traversal pass. Single pass, single
/// thread; consumed by `into_outcome` when the walk ends.
#[derive(Debug, Default)]
pub struct Detector {
    outcome: ScanOutcome,
    seen_ids: HashSet<String>,
    next_ordinal: usize,
}

impl Detector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every file id must be unique within one pass; a repeat means the
    /// listing is inconsistent and the run must not continue.
    pub fn observe_id(&mut self, file_id: &str) -> Result<(), CuratorError> {
        self.outcome.files_seen += 1;
        if !self.seen_ids.insert(file_id.to_string()) {
            return Err(CuratorError::FileSeenTwice(file_id.to_string()));
        }
        Ok(())
    }

    /// Records a path claim. The first claimant holds the path; a second
    /// claimant creates the duplicate group seeded with the holder, and
    /// later claimants append in discovery order.
    pub fn observe_path(&mut self, path: String, mut file: FileRef) {
        file.discovered = self.next_ordinal;
        self.next_ordinal += 1;
        self.outcome.eligible += 1;
        match self.outcome.claims.entry(path.clone()) {
            Entry::Vacant(slot) => {
                debug!("{path}");
                slot.insert(file);
            }
            Entry::Occupied(holder) => {
                let group = self.outcome.groups.entry(path.clone()).or_default();
                if group.is_empty() {
                    group.push(holder.get().clone());
                }
                group.push(file);
                debug!("duplicate {}: {path}", group.len() - 1);
            }
        }
    }

    pub fn skip(&mut self, state: &PathState) {
        match state {
            PathState::Ignored => self.outcome.skipped_ignored += 1,
            PathState::Incomplete(_) => self.outcome.skipped_incomplete += 1,
            _ => self.outcome.skipped_uncurated += 1,
        }
    }

    pub fn into_outcome(self) -> ScanOutcome {
        self.outcome
    }
}

/// Walks every session, acquisition, and file of a project and returns the
/// detector's claim maps.
pub fn scan_project<C: PlatformClient>(
    client: &C,
    project_id: &str,
) -> Result<ScanOutcome, CuratorError> {
    let mut detector = Detector::new();
    let sessions = client.list_project_sessions(project_id)?;
    debug!("{} sessions", sessions.len());
    for (session_index, session) in sessions.iter().enumerate() {
        debug!("{session_index} session {}", session.label);
        let acquisitions = client.list_acquisitions(&session.id)?;
        for (acquisition_index, summary) in acquisitions.iter().enumerate() {
            // The listing is sparse; file metadata needs a direct fetch.
            let acquisition = client.get_acquisition(&summary.id)?;
            debug!("  {acquisition_index} acquisition {}", acquisition.label);
            for (file_index, file) in acquisition.files.iter().enumerate() {
                debug!("    {file_index} file {}", file.name);
                detector.observe_id(&file.id)?;
                match file.info.path_state() {
                    PathState::Mapped(path) => detector.observe_path(
                        path,
                        FileRef {
                            session_id: session.id.clone(),
                            acquisition_id: acquisition.id.clone(),
                            file_index,
                            acquired_at: acquisition.timestamp,
                            size: file.size,
                            discovered: 0,
                        },
                    ),
                    state @ PathState::Ignored => {
                        debug!("ignoring {}", file.name);
                        detector.skip(&state);
                    }
                    state @ PathState::Incomplete(_) => {
                        debug!("BIDS record without Filename on {}", file.name);
                        detector.skip(&state);
                    }
                    state => {
                        if file.info.is_empty() {
                            debug!("file.info is empty on {}", file.name);
                        } else {
                            debug!("no BIDS mapping on {}", file.name);
                        }
                        detector.skip(&state);
                    }
                }
            }
        }
    }
    Ok(detector.into_outcome())
}
