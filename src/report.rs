use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CuratorError;
use crate::platform::{PathState, PlatformClient, Project};

/// One row of the per-file listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRow {
    pub subject: String,
    pub session: String,
    pub series_number: String,
    pub acquisition_label: String,
    pub file_name: String,
    pub file_type: String,
    pub bids_path: String,
    pub unique: String,
}

/// Companion declarations of one file: the folders its BIDS record points
/// at and the target paths it applies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntendedForRecord {
    pub file_name: String,
    pub acquisition_label: String,
    pub acquisition_id: String,
    pub folders: Vec<String>,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubjectSurvey {
    pub label: String,
    /// Sorted by derived path.
    pub rows: Vec<FileRow>,
    pub intended_for: Vec<IntendedForRecord>,
    /// Derived path -> repeat count; 0 means the path was seen once.
    pub seen_paths: BTreeMap<String, usize>,
    /// Acquisition label -> number of acquisitions for this subject.
    pub acquisition_counts: BTreeMap<String, usize>,
}

/// Everything one report run collects from the platform. Serializable so a
/// run can be replayed from a local snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurationSurvey {
    pub group: String,
    pub project: String,
    pub subjects: Vec<SubjectSurvey>,
    pub sessions: usize,
    /// Acquisition label -> total occurrences across the project.
    pub label_totals: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicatePath {
    pub subject: String,
    pub path: String,
    pub claims: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountDeviation {
    pub subject: String,
    pub label: String,
    pub count: usize,
    pub usual: usize,
}

/// Walks subjects, sessions, acquisitions, and files and collects the full
/// curation picture of one project.
pub fn collect_survey<C: PlatformClient>(
    client: &C,
    project: &Project,
) -> Result<CurationSurvey, CuratorError> {
    let mut survey = CurationSurvey {
        group: project.group.clone(),
        project: project.label.clone(),
        ..CurationSurvey::default()
    };
    let subjects = client.list_subjects(&project.id)?;
    info!("{} subjects", subjects.len());
    for subject in &subjects {
        info!("subject {}", subject.label);
        let mut subject_survey = SubjectSurvey {
            label: subject.label.clone(),
            ..SubjectSurvey::default()
        };
        let sessions = client.list_subject_sessions(&subject.id)?;
        for session in &sessions {
            survey.sessions += 1;
            debug!("  session {}", session.label);
            let acquisitions = client.list_acquisitions(&session.id)?;
            for summary in &acquisitions {
                let acquisition = client.get_acquisition(&summary.id)?;
                debug!("    acquisition {}", acquisition.label);
                *survey
                    .label_totals
                    .entry(acquisition.label.clone())
                    .or_default() += 1;
                *subject_survey
                    .acquisition_counts
                    .entry(acquisition.label.clone())
                    .or_default() += 1;
                for file in &acquisition.files {
                    debug!("      file {}", file.name);
                    let state = file.info.path_state();
                    let unique = match &state {
                        PathState::Mapped(path) => {
                            label_sighting(&mut subject_survey.seen_paths, path)
                        }
                        _ => String::new(),
                    };
                    if let Some(targets) = &file.info.intended_for {
                        if !targets.is_empty() {
                            subject_survey.intended_for.push(intended_for_record(
                                file, &acquisition.id, &acquisition.label, targets,
                            ));
                        }
                    }
                    subject_survey.rows.push(FileRow {
                        subject: subject.label.clone(),
                        session: session.label.clone(),
                        series_number: file
                            .info
                            .series_number
                            .map(|number| number.to_string())
                            .unwrap_or_else(|| "?".to_string()),
                        acquisition_label: acquisition.label.clone(),
                        file_name: file.name.clone(),
                        file_type: file.file_type.clone().unwrap_or_default(),
                        bids_path: state.to_string(),
                        unique,
                    });
                }
            }
        }
        subject_survey
            .rows
            .sort_by(|a, b| a.bids_path.cmp(&b.bids_path));
        survey.subjects.push(subject_survey);
    }
    Ok(survey)
}

fn intended_for_record(
    file: &crate::platform::FileEntry,
    acquisition_id: &str,
    acquisition_label: &str,
    targets: &[String],
) -> IntendedForRecord {
    let folders = match file
        .info
        .bids_record()
        .and_then(|record| record.intended_for.as_ref())
    {
        Some(list) => list
            .iter()
            .map(|entry| {
                entry
                    .folder
                    .clone()
                    .unwrap_or_else(|| "folder is missing".to_string())
            })
            .collect(),
        None => vec!["folder is missing".to_string()],
    };
    let mut targets = targets.to_vec();
    targets.sort();
    IntendedForRecord {
        file_name: file.name.clone(),
        acquisition_label: acquisition_label.to_string(),
        acquisition_id: acquisition_id.to_string(),
        folders,
        targets,
    }
}

fn label_sighting(seen: &mut BTreeMap<String, usize>, path: &str) -> String {
    match seen.entry(path.to_string()) {
        Entry::Vacant(slot) => {
            slot.insert(0);
            "unique".to_string()
        }
        Entry::Occupied(mut count) => {
            *count.get_mut() += 1;
            format!("duplicate {}", count.get())
        }
    }
}

/// A compiled file-name/target pattern pair for companion-list filtering.
#[derive(Debug, Clone)]
pub struct PatternPair {
    pub file_pattern: Regex,
    pub target_pattern: Regex,
}

/// Patterns arrive flat on the command line and pair up in order.
pub fn parse_pattern_pairs(raw: &[String]) -> Result<Vec<PatternPair>, CuratorError> {
    if raw.len() % 2 != 0 {
        return Err(CuratorError::UnpairedPattern(raw.len()));
    }
    let mut pairs = Vec::with_capacity(raw.len() / 2);
    for chunk in raw.chunks(2) {
        pairs.push(PatternPair {
            file_pattern: compile_pattern(&chunk[0])?,
            target_pattern: compile_pattern(&chunk[1])?,
        });
    }
    Ok(pairs)
}

fn compile_pattern(pattern: &str) -> Result<Regex, CuratorError> {
    Regex::new(pattern).map_err(|err| CuratorError::InvalidPattern {
        pattern: pattern.to_string(),
        message: err.to_string(),
    })
}

#[derive(Debug, Default)]
pub struct FilterOutcome {
    /// Subject label -> file name -> companion list after filtering.
    pub final_lists: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    pub rewritten: usize,
}

/// Applies the pattern pairs to every collected companion list. Each
/// matching pair refilters the originally declared targets, so when several
/// pairs match one file the last pair wins. Files matching no pair keep
/// their stored list and are not written back.
pub fn apply_intended_for_filters<C: PlatformClient>(
    client: &C,
    survey: &CurationSurvey,
    pairs: &[PatternPair],
) -> Result<FilterOutcome, CuratorError> {
    let mut outcome = FilterOutcome::default();
    for subject in &survey.subjects {
        let subject_lists = outcome.final_lists.entry(subject.label.clone()).or_default();
        for record in &subject.intended_for {
            let mut filtered: Option<Vec<String>> = None;
            for pair in pairs {
                if pair.file_pattern.is_match(&record.file_name) {
                    filtered = Some(
                        record
                            .targets
                            .iter()
                            .filter(|target| pair.target_pattern.is_match(target))
                            .cloned()
                            .collect(),
                    );
                }
            }
            let final_list = match filtered {
                Some(list) => {
                    info!(
                        "filtering IntendedFor on {}: {} -> {} targets",
                        record.file_name,
                        record.targets.len(),
                        list.len(),
                    );
                    client.set_intended_for(&record.acquisition_id, &record.file_name, &list)?;
                    outcome.rewritten += 1;
                    list
                }
                None => record.targets.clone(),
            };
            subject_lists.insert(record.file_name.clone(), final_list);
        }
    }
    Ok(outcome)
}

/// The modal per-subject count for every acquisition label. Subjects
/// missing a label count as zero; a frequency tie breaks to the smaller
/// count.
pub fn usual_counts(survey: &CurationSurvey) -> BTreeMap<String, usize> {
    let mut usual = BTreeMap::new();
    for label in survey.label_totals.keys() {
        let mut histogram: BTreeMap<usize, usize> = BTreeMap::new();
        for subject in &survey.subjects {
            let count = subject
                .acquisition_counts
                .get(label)
                .copied()
                .unwrap_or(0);
            *histogram.entry(count).or_default() += 1;
        }
        let mut best_count = 0;
        let mut best_frequency = 0;
        for (count, frequency) in &histogram {
            if *frequency > best_frequency {
                best_frequency = *frequency;
                best_count = *count;
            }
        }
        usual.insert(label.clone(), best_count);
    }
    usual
}

/// Every (subject, label) whose acquisition count differs from the usual
/// count, including subjects missing the label entirely.
pub fn count_deviations(survey: &CurationSurvey) -> Vec<CountDeviation> {
    let usual = usual_counts(survey);
    let mut deviations = Vec::new();
    for (label, usual_count) in &usual {
        for subject in &survey.subjects {
            let count = subject
                .acquisition_counts
                .get(label)
                .copied()
                .unwrap_or(0);
            if count != *usual_count {
                deviations.push(CountDeviation {
                    subject: subject.label.clone(),
                    label: label.clone(),
                    count,
                    usual: *usual_count,
                });
            }
        }
    }
    deviations
}

/// Derived paths claimed more than once, per subject.
pub fn duplicate_paths(survey: &CurationSurvey) -> Vec<DuplicatePath> {
    let mut duplicates = Vec::new();
    for subject in &survey.subjects {
        for (path, repeats) in &subject.seen_paths {
            if *repeats > 0 {
                duplicates.push(DuplicatePath {
                    subject: subject.label.clone(),
                    path: path.clone(),
                    claims: repeats + 1,
                });
            }
        }
    }
    duplicates
}
