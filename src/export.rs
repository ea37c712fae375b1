use camino::{Utf8Path, Utf8PathBuf};
use csv::{Writer, WriterBuilder};
use tracing::info;

use crate::domain::make_file_name_safe;
use crate::error::CuratorError;
use crate::report::{CurationSurvey, FilterOutcome, count_deviations, usual_counts};

const NIFTI_COLUMNS: [&str; 8] = [
    "Subject",
    "Session",
    "SeriesNumber",
    "Acquisition label (SeriesDescription)",
    "File name",
    "File type",
    "Curated BIDS path",
    "Unique?",
];

const INTENDED_FOR_COLUMNS: [&str; 3] = [
    "acquisition label",
    "file name and folder",
    "IntendedFor List of BIDS paths",
];

#[derive(Debug, Clone)]
pub struct ReportFiles {
    pub niftis: Utf8PathBuf,
    pub intendedfors: Utf8PathBuf,
    pub acquisitions: Utf8PathBuf,
}

/// Writes the three report files into `out_dir` and returns their paths.
/// File names are built from the group and project labels with unsafe
/// characters replaced.
pub fn write_reports(
    survey: &CurationSurvey,
    filtered: &FilterOutcome,
    out_dir: &Utf8Path,
) -> Result<ReportFiles, CuratorError> {
    let stem = format!(
        "{}_{}",
        make_file_name_safe(&survey.group, "_"),
        make_file_name_safe(&survey.project, "_"),
    );
    let files = ReportFiles {
        niftis: out_dir.join(format!("{stem}_niftis.csv")),
        intendedfors: out_dir.join(format!("{stem}_intendedfors.csv")),
        acquisitions: out_dir.join(format!("{stem}_acquisitions.csv")),
    };
    write_niftis(survey, &files.niftis).map_err(|err| csv_error(&files.niftis, err))?;
    info!("wrote {}", files.niftis);
    write_intendedfors(survey, filtered, &files.intendedfors)
        .map_err(|err| csv_error(&files.intendedfors, err))?;
    info!("wrote {}", files.intendedfors);
    write_acquisitions(survey, &files.acquisitions)
        .map_err(|err| csv_error(&files.acquisitions, err))?;
    info!("wrote {}", files.acquisitions);
    Ok(files)
}

fn csv_error(path: &Utf8Path, err: csv::Error) -> CuratorError {
    CuratorError::CsvWrite {
        path: path.to_string(),
        message: err.to_string(),
    }
}

/// One row per file, per-subject blocks already sorted by derived path.
fn write_niftis(survey: &CurationSurvey, path: &Utf8Path) -> Result<(), csv::Error> {
    let mut writer = Writer::from_path(path)?;
    writer.write_record(NIFTI_COLUMNS)?;
    for subject in &survey.subjects {
        for row in &subject.rows {
            writer.write_record(&[
                row.subject.clone(),
                row.session.clone(),
                row.series_number.clone(),
                row.acquisition_label.clone(),
                row.file_name.clone(),
                row.file_type.clone(),
                row.bids_path.clone(),
                row.unique.clone(),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Companion lists before and after filtering. Rows vary in width, so the
/// writer runs in flexible mode.
fn write_intendedfors(
    survey: &CurationSurvey,
    filtered: &FilterOutcome,
    path: &Utf8Path,
) -> Result<(), csv::Error> {
    let mut writer = WriterBuilder::new().flexible(true).from_path(path)?;
    writer.write_record(["Initial values (before correction)"])?;
    writer.write_record(INTENDED_FOR_COLUMNS)?;
    for subject in &survey.subjects {
        for record in &subject.intended_for {
            write_intended_for_block(
                &mut writer,
                &record.acquisition_label,
                &record.file_name,
                &record.folders,
                &record.targets,
            )?;
        }
    }
    writer.write_record([""; 3])?;
    writer.write_record(["Final values (after correction)"])?;
    writer.write_record(INTENDED_FOR_COLUMNS)?;
    for subject in &survey.subjects {
        let finals = filtered.final_lists.get(&subject.label);
        for record in &subject.intended_for {
            let targets = finals
                .and_then(|lists| lists.get(&record.file_name))
                .unwrap_or(&record.targets);
            write_intended_for_block(
                &mut writer,
                &record.acquisition_label,
                &record.file_name,
                &record.folders,
                targets,
            )?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_intended_for_block<W: std::io::Write>(
    writer: &mut Writer<W>,
    acquisition_label: &str,
    file_name: &str,
    folders: &[String],
    targets: &[String],
) -> Result<(), csv::Error> {
    writer.write_record([acquisition_label, file_name])?;
    for folder in folders {
        writer.write_record(["", folder.as_str()])?;
        for target in targets {
            writer.write_record(["", "", target.as_str()])?;
        }
    }
    Ok(())
}

/// Project totals, the usual per-subject count for every acquisition label,
/// and the subjects deviating from it.
fn write_acquisitions(survey: &CurationSurvey, path: &Utf8Path) -> Result<(), csv::Error> {
    let usual = usual_counts(survey);
    let deviations = count_deviations(survey);
    let mut writer = WriterBuilder::new().flexible(true).from_path(path)?;
    writer.write_record(&[
        "Number of subjects".to_string(),
        survey.subjects.len().to_string(),
    ])?;
    writer.write_record(&[
        "Number of sessions".to_string(),
        survey.sessions.to_string(),
    ])?;
    writer.write_record(None::<&[u8]>)?;
    writer.write_record(["Acquisition label", "Total found", "Usual count per subject"])?;
    for (label, total) in &survey.label_totals {
        let usual_count = usual.get(label).copied().unwrap_or(0);
        writer.write_record(&[
            label.clone(),
            total.to_string(),
            usual_count.to_string(),
        ])?;
    }
    writer.write_record(None::<&[u8]>)?;
    writer.write_record(["Subject", "Acquisition label", "Count", "Usual count"])?;
    for subject in &survey.subjects {
        writer.write_record([subject.label.as_str()])?;
        let mut clean = true;
        for deviation in deviations.iter().filter(|d| d.subject == subject.label) {
            clean = false;
            writer.write_record(&[
                String::new(),
                deviation.label.clone(),
                deviation.count.to_string(),
                deviation.usual.to_string(),
            ])?;
        }
        if clean {
            writer.write_record(["", "has the usual acquisitions"])?;
        }
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use crate::report::{FileRow, IntendedForRecord, SubjectSurvey};

    use super::*;

    fn sample_survey() -> CurationSurvey {
        let mut survey = CurationSurvey {
            group: "neuro lab".to_string(),
            project: "Study/One".to_string(),
            sessions: 2,
            ..CurationSurvey::default()
        };
        let mut subject = SubjectSurvey {
            label: "sub-01".to_string(),
            ..SubjectSurvey::default()
        };
        subject.rows.push(FileRow {
            subject: "sub-01".to_string(),
            session: "ses-01".to_string(),
            series_number: "4".to_string(),
            acquisition_label: "t1_mprage".to_string(),
            file_name: "t1.nii.gz".to_string(),
            file_type: "nifti".to_string(),
            bids_path: "anat/sub-01_T1w.nii.gz".to_string(),
            unique: "unique".to_string(),
        });
        subject.intended_for.push(IntendedForRecord {
            file_name: "fmap.nii.gz".to_string(),
            acquisition_label: "fmap_se".to_string(),
            acquisition_id: "acq-1".to_string(),
            folders: vec!["func".to_string()],
            targets: vec![
                "func/sub-01_task-rest_bold.nii.gz".to_string(),
                "func/sub-01_task-work_bold.nii.gz".to_string(),
            ],
        });
        subject
            .acquisition_counts
            .insert("t1_mprage".to_string(), 1);
        survey.label_totals.insert("t1_mprage".to_string(), 2);
        survey.subjects.push(subject);
        survey.subjects.push(SubjectSurvey {
            label: "sub-02".to_string(),
            acquisition_counts: [("t1_mprage".to_string(), 1)].into_iter().collect(),
            ..SubjectSurvey::default()
        });
        survey
    }

    fn out_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn report_file_names_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let survey = sample_survey();
        let files = write_reports(&survey, &FilterOutcome::default(), &out_dir(&dir)).unwrap();
        assert!(files.niftis.as_str().ends_with("neuro_lab_Study_One_niftis.csv"));
        assert!(files.niftis.as_std_path().exists());
        assert!(files.intendedfors.as_std_path().exists());
        assert!(files.acquisitions.as_std_path().exists());
    }

    #[test]
    fn nifti_rows_follow_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let survey = sample_survey();
        let files = write_reports(&survey, &FilterOutcome::default(), &out_dir(&dir)).unwrap();
        let text = std::fs::read_to_string(files.niftis.as_std_path()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "Subject,Session,SeriesNumber,Acquisition label (SeriesDescription),\
             File name,File type,Curated BIDS path,Unique?"
        );
        assert_eq!(
            lines.next().unwrap(),
            "sub-01,ses-01,4,t1_mprage,t1.nii.gz,nifti,anat/sub-01_T1w.nii.gz,unique"
        );
    }

    #[test]
    fn intendedfors_show_before_and_after_sections() {
        let dir = tempfile::tempdir().unwrap();
        let survey = sample_survey();
        let mut filtered = FilterOutcome::default();
        filtered
            .final_lists
            .entry("sub-01".to_string())
            .or_default()
            .insert(
                "fmap.nii.gz".to_string(),
                vec!["func/sub-01_task-rest_bold.nii.gz".to_string()],
            );
        let files = write_reports(&survey, &filtered, &out_dir(&dir)).unwrap();
        let text = std::fs::read_to_string(files.intendedfors.as_std_path()).unwrap();
        let after = text
            .split("Final values (after correction)")
            .nth(1)
            .unwrap();
        assert!(text.contains(",,func/sub-01_task-work_bold.nii.gz"));
        assert!(after.contains(",,func/sub-01_task-rest_bold.nii.gz"));
        assert!(!after.contains("task-work"));
    }

    #[test]
    fn acquisition_summary_lists_totals_and_deviations() {
        let dir = tempfile::tempdir().unwrap();
        let mut survey = sample_survey();
        survey.subjects.push(SubjectSurvey {
            label: "sub-03".to_string(),
            ..SubjectSurvey::default()
        });
        let files = write_reports(&survey, &FilterOutcome::default(), &out_dir(&dir)).unwrap();
        let text = std::fs::read_to_string(files.acquisitions.as_std_path()).unwrap();
        assert!(text.contains("Number of subjects,3"));
        assert!(text.contains("t1_mprage,2,1"));
        assert!(text.contains(",t1_mprage,0,1"));
        assert!(text.contains("sub-01\n,has the usual acquisitions"));
    }
}
