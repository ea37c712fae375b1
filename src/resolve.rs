use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::domain::{KeepPolicy, merge_error_note, split_known_suffix};
use crate::error::CuratorError;
use crate::platform::{BidsInfo, FileEntry, PlatformClient};
use crate::scan::FileRef;

/// Identity of a group member's raw source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    /// The file itself was uploaded by a user and is its own source.
    Upload,
    /// The file was produced by a job from this DICOM archive. The
    /// acquisition timestamp disambiguates archives with reused names.
    Archive {
        acquired_at: Option<DateTime<Utc>>,
        name: String,
    },
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Upload => write!(f, "(uploaded by user)"),
            SourceRef::Archive { name, .. } => write!(f, "{name}"),
        }
    }
}

/// One duplicate-group member, re-fetched so decisions work on the current
/// metadata rather than what the scan saw.
#[derive(Debug, Clone)]
pub struct Member {
    pub file: FileRef,
    pub acquisition_label: String,
    /// Platform file entry name, the key for metadata writes.
    pub file_name: String,
    /// Current derived filename inside the BIDS record.
    pub bids_name: String,
    pub bids: BidsInfo,
    pub source: SourceRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Canonical member, stays as is.
    Keep,
    Rename {
        new_name: String,
        note: String,
        set_ignore: bool,
    },
}

#[derive(Debug)]
pub struct GroupResolution {
    pub path: String,
    pub all_same_source: bool,
    /// Ascending by the configured key; last member is canonical.
    pub members: Vec<Member>,
    /// Parallel to `members`.
    pub decisions: Vec<Decision>,
}

#[derive(Debug, Default)]
pub struct ResolveOutcome {
    pub groups: Vec<GroupResolution>,
    pub renamed: usize,
}

/// Decides and traces a rename for every duplicate group, applying the
/// changes when `apply` is set. Decisions and their trace lines are the
/// same either way; only the metadata writes are gated.
pub fn resolve_duplicates<C: PlatformClient>(
    client: &C,
    groups: &BTreeMap<String, Vec<FileRef>>,
    keep: KeepPolicy,
    apply: bool,
) -> Result<ResolveOutcome, CuratorError> {
    let mut outcome = ResolveOutcome::default();
    for (path, group) in groups {
        info!("{path}");
        let ordered = order_group(group, keep);
        let mut members = Vec::with_capacity(ordered.len());
        for file in &ordered {
            let member = hydrate_member(client, file)?;
            info!(
                "  {} acquired {} size {} from {}",
                member.acquisition_label,
                timestamp_text(member.file.acquired_at),
                member.file.size,
                member.source,
            );
            members.push(member);
        }
        let all_same_source = classify(&members);
        info!("  all from one archive: {all_same_source}");

        let decisions = decide(&members, all_same_source);
        for (member, decision) in members.iter().zip(&decisions) {
            match decision {
                Decision::Keep => info!("  {} stays as is", member.bids_name),
                Decision::Rename { new_name, .. } => {
                    info!("  rename {} -> {}", member.bids_name, new_name);
                    outcome.renamed += 1;
                }
            }
        }

        if apply {
            apply_group(client, &members, &decisions)?;
        }
        outcome.groups.push(GroupResolution {
            path: path.clone(),
            all_same_source,
            members,
            decisions,
        });
    }
    info!("{} names changed", outcome.renamed);
    Ok(outcome)
}

/// Ascending sort by the configured key with discovery order as the
/// explicit secondary key, so equal keys resolve the same way every run.
pub fn order_group(group: &[FileRef], keep: KeepPolicy) -> Vec<FileRef> {
    let mut ordered = group.to_vec();
    match keep {
        KeepPolicy::Latest => ordered.sort_by_key(|file| (file.acquired_at, file.discovered)),
        KeepPolicy::Largest => ordered.sort_by_key(|file| (file.size, file.discovered)),
    }
    ordered
}

fn hydrate_member<C: PlatformClient>(
    client: &C,
    file: &FileRef,
) -> Result<Member, CuratorError> {
    let acquisition = client.get_acquisition(&file.acquisition_id)?;
    let entry = acquisition
        .files
        .get(file.file_index)
        .ok_or_else(|| CuratorError::MissingFile {
            acquisition_id: file.acquisition_id.clone(),
            file_index: file.file_index,
        })?;
    let bids = entry
        .info
        .bids_record()
        .cloned()
        .ok_or_else(|| CuratorError::MissingFile {
            acquisition_id: file.acquisition_id.clone(),
            file_index: file.file_index,
        })?;
    let bids_name = match bids.filename.as_deref() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            return Err(CuratorError::MissingFile {
                acquisition_id: file.acquisition_id.clone(),
                file_index: file.file_index,
            });
        }
    };
    let source = resolve_source(client, file, &acquisition.id, entry)?;
    Ok(Member {
        file: file.clone(),
        acquisition_label: acquisition.label,
        file_name: entry.name.clone(),
        bids_name,
        bids,
        source,
    })
}

fn resolve_source<C: PlatformClient>(
    client: &C,
    file: &FileRef,
    acquisition_id: &str,
    entry: &FileEntry,
) -> Result<SourceRef, CuratorError> {
    let origin = entry
        .origin
        .as_ref()
        .ok_or_else(|| CuratorError::UnknownOrigin {
            origin_type: "(none)".to_string(),
            file_name: entry.name.clone(),
        })?;
    match origin.kind.as_str() {
        "user" => Ok(SourceRef::Upload),
        "job" => {
            let job_id =
                origin
                    .id
                    .as_deref()
                    .ok_or_else(|| CuratorError::SourceArchiveNotFound {
                        file_name: entry.name.clone(),
                        reason: "origin carries no job id".to_string(),
                    })?;
            let jobs = client.session_jobs(&file.session_id)?;
            let job = jobs.iter().find(|job| job.id == job_id).ok_or_else(|| {
                CuratorError::SourceArchiveNotFound {
                    file_name: entry.name.clone(),
                    reason: format!("job {job_id} not found in session {}", file.session_id),
                }
            })?;
            let name = job.input_archive_for(acquisition_id).ok_or_else(|| {
                CuratorError::SourceArchiveNotFound {
                    file_name: entry.name.clone(),
                    reason: format!("job {job_id} has no input from acquisition {acquisition_id}"),
                }
            })?;
            Ok(SourceRef::Archive {
                acquired_at: file.acquired_at,
                name: name.to_string(),
            })
        }
        other => Err(CuratorError::UnknownOrigin {
            origin_type: other.to_string(),
            file_name: entry.name.clone(),
        }),
    }
}

/// A group is same-source only when no member is a user upload and every
/// non-canonical member shares one (timestamp, archive name) identity.
pub fn classify(members: &[Member]) -> bool {
    if members
        .iter()
        .any(|member| member.source == SourceRef::Upload)
    {
        return false;
    }
    let Some((_canonical, rest)) = members.split_last() else {
        return true;
    };
    let mut reference: Option<(Option<DateTime<Utc>>, &str)> = None;
    for member in rest {
        if let SourceRef::Archive { acquired_at, name } = &member.source {
            match &reference {
                None => reference = Some((*acquired_at, name.as_str())),
                Some((ref_at, ref_name)) => {
                    if *ref_at != *acquired_at || *ref_name != name.as_str() {
                        return false;
                    }
                }
            }
        }
    }
    true
}

/// The rename table: every member but the last gets a position-numbered
/// name, with the double-underscore marker and the ignore flag reserved for
/// groups whose members come from different sources.
pub fn decide(members: &[Member], all_same_source: bool) -> Vec<Decision> {
    let mut decisions = Vec::with_capacity(members.len());
    for (index, member) in members.iter().enumerate() {
        if index + 1 == members.len() {
            decisions.push(Decision::Keep);
            continue;
        }
        let position = index + 1;
        let (base, ext) = split_known_suffix(&member.bids_name);
        let new_name = if all_same_source {
            format!("{base}_{position:02}{ext}")
        } else {
            format!("{base}__dup{position:02}{ext}")
        };
        decisions.push(Decision::Rename {
            new_name,
            note: merge_error_note(member.bids.error_message.as_deref(), base),
            set_ignore: !all_same_source,
        });
    }
    decisions
}

fn apply_group<C: PlatformClient>(
    client: &C,
    members: &[Member],
    decisions: &[Decision],
) -> Result<(), CuratorError> {
    for (member, decision) in members.iter().zip(decisions) {
        let Decision::Rename {
            new_name,
            note,
            set_ignore,
        } = decision
        else {
            continue;
        };
        let mut bids = member.bids.clone();
        bids.filename = Some(new_name.clone());
        bids.valid = Some(false);
        bids.error_message = Some(note.clone());
        if *set_ignore {
            bids.ignore = Some(true);
        }
        client.set_bids_info(&member.file.acquisition_id, &member.file_name, &bids)?;
    }
    Ok(())
}

fn timestamp_text(timestamp: Option<DateTime<Utc>>) -> String {
    match timestamp {
        Some(at) => at.to_rfc3339(),
        None => "(no timestamp)".to_string(),
    }
}
