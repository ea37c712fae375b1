use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CuratorError;

/// Suffixes split off before a duplicate marker is appended. Anything else
/// is treated as having no extension at all.
pub const NIFTI_SUFFIX: &str = ".nii.gz";
pub const DICOM_ZIP_SUFFIX: &str = ".dicom.zip";

/// Which duplicate survives resolution: the last one after an ascending sort
/// by acquisition timestamp, or by file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum KeepPolicy {
    Latest,
    Largest,
}

impl fmt::Display for KeepPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeepPolicy::Latest => write!(f, "latest"),
            KeepPolicy::Largest => write!(f, "largest"),
        }
    }
}

/// Group id plus project label, the address of one project on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectPath {
    group: String,
    label: String,
}

impl ProjectPath {
    pub fn new(group: &str, label: &str) -> Result<Self, CuratorError> {
        let group = group.trim();
        let label = label.trim();
        if group.is_empty() || label.is_empty() || group.contains('/') || label.contains('/') {
            return Err(CuratorError::InvalidProjectPath(format!("{group}/{label}")));
        }
        Ok(Self {
            group: group.to_string(),
            label: label.to_string(),
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for ProjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.label)
    }
}

impl FromStr for ProjectPath {
    type Err = CuratorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (group, label) = value
            .trim()
            .split_once('/')
            .ok_or_else(|| CuratorError::InvalidProjectPath(value.to_string()))?;
        ProjectPath::new(group, label)
    }
}

/// Splits a file name into base and known suffix. Only the two suffixes the
/// naming pipeline produces are recognized; an unrecognized tail means the
/// whole name is the base.
pub fn split_known_suffix(name: &str) -> (&str, &str) {
    for suffix in [NIFTI_SUFFIX, DICOM_ZIP_SUFFIX] {
        if let Some(base) = name.strip_suffix(suffix) {
            return (base, suffix);
        }
    }
    (name, "")
}

/// Merges a "duplicate of" note into an existing error-message field,
/// keeping whatever note was already there.
pub fn merge_error_note(existing: Option<&str>, base_name: &str) -> String {
    let note = format!("duplicate of {base_name}");
    match existing {
        Some(prior) if !prior.is_empty() => format!("{prior} ; {note}"),
        _ => note,
    }
}

/// Collapses runs of characters unsafe for a file name into `replacement`.
/// An unsafe replacement falls back to the empty string, and leading dots
/// are stripped so the result is never hidden.
pub fn make_file_name_safe(value: &str, replacement: &str) -> String {
    let unsafe_run = Regex::new(r"[^A-Za-z0-9_\-.]+").unwrap();
    let replacement = if unsafe_run.is_match(replacement) {
        tracing::warn!("{replacement:?} is not a safe replacement, using \"\"");
        ""
    } else {
        replacement
    };
    let safe = unsafe_run.replace_all(value, replacement);
    safe.trim_start_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_project_path_valid() {
        let path: ProjectPath = "neuro/Study01".parse().unwrap();
        assert_eq!(path.group(), "neuro");
        assert_eq!(path.label(), "Study01");
        assert_eq!(path.to_string(), "neuro/Study01");
    }

    #[test]
    fn parse_project_path_missing_label() {
        let err = "neuro".parse::<ProjectPath>().unwrap_err();
        assert_matches!(err, CuratorError::InvalidProjectPath(_));
    }

    #[test]
    fn parse_project_path_empty_component() {
        let err = ProjectPath::new("neuro", " ").unwrap_err();
        assert_matches!(err, CuratorError::InvalidProjectPath(_));
    }

    #[test]
    fn split_suffix_nifti() {
        assert_eq!(
            split_known_suffix("sub-01_T1w.nii.gz"),
            ("sub-01_T1w", ".nii.gz")
        );
    }

    #[test]
    fn split_suffix_dicom_zip() {
        assert_eq!(
            split_known_suffix("scan_4.dicom.zip"),
            ("scan_4", ".dicom.zip")
        );
    }

    #[test]
    fn split_suffix_unrecognized() {
        assert_eq!(split_known_suffix("notes.txt"), ("notes.txt", ""));
        assert_eq!(split_known_suffix("plain.nii"), ("plain.nii", ""));
    }

    #[test]
    fn merge_note_into_empty() {
        assert_eq!(merge_error_note(None, "sub-01_T1w"), "duplicate of sub-01_T1w");
        assert_eq!(
            merge_error_note(Some(""), "sub-01_T1w"),
            "duplicate of sub-01_T1w"
        );
    }

    #[test]
    fn merge_note_keeps_existing() {
        assert_eq!(
            merge_error_note(Some("echo mismatch"), "sub-01_T1w"),
            "echo mismatch ; duplicate of sub-01_T1w"
        );
    }

    #[test]
    fn safe_name_replaces_runs() {
        assert_eq!(make_file_name_safe("The Group/Label (1)", ""), "TheGroupLabel1");
        assert_eq!(make_file_name_safe("a b$c", "_"), "a_b_c");
    }

    #[test]
    fn safe_name_strips_leading_dots() {
        assert_eq!(make_file_name_safe("..hidden", ""), "hidden");
    }

    #[test]
    fn safe_name_rejects_unsafe_replacement() {
        assert_eq!(make_file_name_safe("a b", "!!"), "ab");
    }
}
