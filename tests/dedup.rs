use std::collections::BTreeMap;
use std::sync::Mutex;

use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};

use bids_curator::app::{App, DedupOptions};
use bids_curator::domain::{KeepPolicy, ProjectPath};
use bids_curator::error::CuratorError;
use bids_curator::platform::{
    Acquisition, AcquisitionSummary, BidsField, BidsInfo, FileEntry, FileInfo, FileOrigin, Job,
    JobInput, PlatformClient, Project, Session, Subject,
};
use bids_curator::resolve::Decision;

#[derive(Default)]
struct MockPlatform {
    sessions: Vec<Session>,
    session_acquisitions: BTreeMap<String, Vec<String>>,
    acquisitions: BTreeMap<String, Acquisition>,
    jobs: BTreeMap<String, Vec<Job>>,
    bids_writes: Mutex<Vec<(String, String, BidsInfo)>>,
}

impl PlatformClient for &MockPlatform {
    fn lookup_project(&self, path: &ProjectPath) -> Result<Project, CuratorError> {
        Ok(Project {
            id: "proj-1".to_string(),
            group: path.group().to_string(),
            label: path.label().to_string(),
        })
    }

    fn list_subjects(&self, _project_id: &str) -> Result<Vec<Subject>, CuratorError> {
        Err(CuratorError::PlatformHttp("not implemented".to_string()))
    }

    fn list_project_sessions(&self, _project_id: &str) -> Result<Vec<Session>, CuratorError> {
        Ok(self.sessions.clone())
    }

    fn list_subject_sessions(&self, _subject_id: &str) -> Result<Vec<Session>, CuratorError> {
        Err(CuratorError::PlatformHttp("not implemented".to_string()))
    }

    fn list_acquisitions(
        &self,
        session_id: &str,
    ) -> Result<Vec<AcquisitionSummary>, CuratorError> {
        let ids = self
            .session_acquisitions
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        Ok(ids
            .iter()
            .map(|id| AcquisitionSummary {
                id: id.clone(),
                label: self.acquisitions[id].label.clone(),
            })
            .collect())
    }

    fn get_acquisition(&self, acquisition_id: &str) -> Result<Acquisition, CuratorError> {
        self.acquisitions
            .get(acquisition_id)
            .cloned()
            .ok_or_else(|| CuratorError::PlatformHttp("unknown acquisition".to_string()))
    }

    fn session_jobs(&self, session_id: &str) -> Result<Vec<Job>, CuratorError> {
        Ok(self.jobs.get(session_id).cloned().unwrap_or_default())
    }

    fn set_bids_info(
        &self,
        acquisition_id: &str,
        file_name: &str,
        bids: &BidsInfo,
    ) -> Result<(), CuratorError> {
        self.bids_writes.lock().unwrap().push((
            acquisition_id.to_string(),
            file_name.to_string(),
            bids.clone(),
        ));
        Ok(())
    }

    fn set_intended_for(
        &self,
        _acquisition_id: &str,
        _file_name: &str,
        _targets: &[String],
    ) -> Result<(), CuratorError> {
        Err(CuratorError::PlatformHttp("not implemented".to_string()))
    }
}

fn session(id: &str) -> Session {
    Session {
        id: id.to_string(),
        label: id.to_string(),
    }
}

fn mapped_bids(folder: &str, filename: &str) -> BidsInfo {
    BidsInfo {
        filename: Some(filename.to_string()),
        folder: Some(folder.to_string()),
        ignore: Some(false),
        ..BidsInfo::default()
    }
}

fn file_entry(id: &str, name: &str, size: u64, origin: FileOrigin, bids: BidsInfo) -> FileEntry {
    FileEntry {
        id: id.to_string(),
        name: name.to_string(),
        file_type: Some("nifti".to_string()),
        size,
        origin: Some(origin),
        info: FileInfo {
            bids: Some(BidsField::Record(Box::new(bids))),
            ..FileInfo::default()
        },
    }
}

fn job_file(id: &str, name: &str, size: u64, job_id: &str, bids: BidsInfo) -> FileEntry {
    file_entry(
        id,
        name,
        size,
        FileOrigin {
            kind: "job".to_string(),
            id: Some(job_id.to_string()),
        },
        bids,
    )
}

fn user_file(id: &str, name: &str, size: u64, bids: BidsInfo) -> FileEntry {
    file_entry(
        id,
        name,
        size,
        FileOrigin {
            kind: "user".to_string(),
            id: None,
        },
        bids,
    )
}

fn dicom_job(job_id: &str, acquisition_id: &str, archive: &str) -> Job {
    Job {
        id: job_id.to_string(),
        inputs: [(
            "dicom".to_string(),
            JobInput {
                id: Some(acquisition_id.to_string()),
                name: Some(archive.to_string()),
            },
        )]
        .into_iter()
        .collect(),
    }
}

/// Three conversion outputs of one DICOM archive, all claiming the same
/// derived path.
fn same_archive_project() -> MockPlatform {
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
    let acquisition = Acquisition {
        id: "acq-1".to_string(),
        label: "t1_mprage".to_string(),
        timestamp: Some(at),
        files: vec![
            job_file("f-a", "a.nii.gz", 100, "job-1", mapped_bids("anat", "sub-01_T1w.nii.gz")),
            job_file("f-b", "b.nii.gz", 200, "job-1", mapped_bids("anat", "sub-01_T1w.nii.gz")),
            job_file("f-c", "c.nii.gz", 300, "job-1", mapped_bids("anat", "sub-01_T1w.nii.gz")),
        ],
    };
    MockPlatform {
        sessions: vec![session("ses-1")],
        session_acquisitions: [("ses-1".to_string(), vec!["acq-1".to_string()])]
            .into_iter()
            .collect(),
        acquisitions: [("acq-1".to_string(), acquisition)].into_iter().collect(),
        jobs: [(
            "ses-1".to_string(),
            vec![dicom_job("job-1", "acq-1", "scan.dicom.zip")],
        )]
        .into_iter()
        .collect(),
        ..MockPlatform::default()
    }
}

/// A user upload and a job output contesting one path.
fn mixed_origin_project() -> MockPlatform {
    let at = Utc.with_ymd_and_hms(2024, 3, 2, 14, 0, 0).unwrap();
    let acquisition = Acquisition {
        id: "acq-2".to_string(),
        label: "t2_space".to_string(),
        timestamp: Some(at),
        files: vec![
            user_file("f-x", "x.nii.gz", 100, mapped_bids("anat", "sub-01_T2w.nii.gz")),
            job_file("f-y", "y.nii.gz", 200, "job-2", mapped_bids("anat", "sub-01_T2w.nii.gz")),
        ],
    };
    MockPlatform {
        sessions: vec![session("ses-1")],
        session_acquisitions: [("ses-1".to_string(), vec!["acq-2".to_string()])]
            .into_iter()
            .collect(),
        acquisitions: [("acq-2".to_string(), acquisition)].into_iter().collect(),
        jobs: [(
            "ses-1".to_string(),
            vec![dicom_job("job-2", "acq-2", "second.dicom.zip")],
        )]
        .into_iter()
        .collect(),
        ..MockPlatform::default()
    }
}

fn project_path() -> ProjectPath {
    ProjectPath::new("neuro", "study").unwrap()
}

fn options(apply: bool) -> DedupOptions {
    DedupOptions {
        keep: KeepPolicy::Latest,
        apply,
    }
}

#[test]
fn same_archive_duplicates_get_numbered_names() {
    let platform = same_archive_project();
    let app = App::new(&platform);

    let outcome = app.dedup(&project_path(), options(false)).unwrap();

    assert_eq!(outcome.files_seen, 3);
    assert_eq!(outcome.duplicate_paths, 1);
    assert_eq!(outcome.renamed, 2);
    let group = &outcome.resolution.groups[0];
    assert_eq!(group.path, "anat/sub-01_T1w.nii.gz");
    assert!(group.all_same_source);
    assert_eq!(group.members[0].file_name, "a.nii.gz");
    assert_eq!(group.members[2].file_name, "c.nii.gz");
    assert_eq!(
        group.decisions,
        vec![
            Decision::Rename {
                new_name: "sub-01_T1w_01.nii.gz".to_string(),
                note: "duplicate of sub-01_T1w".to_string(),
                set_ignore: false,
            },
            Decision::Rename {
                new_name: "sub-01_T1w_02.nii.gz".to_string(),
                note: "duplicate of sub-01_T1w".to_string(),
                set_ignore: false,
            },
            Decision::Keep,
        ]
    );
    assert!(platform.bids_writes.lock().unwrap().is_empty());
}

#[test]
fn apply_writes_renamed_records_back() {
    let platform = same_archive_project();
    let app = App::new(&platform);

    app.dedup(&project_path(), options(true)).unwrap();

    let writes = platform.bids_writes.lock().unwrap();
    assert_eq!(writes.len(), 2);
    let (acquisition_id, file_name, bids) = &writes[0];
    assert_eq!(acquisition_id, "acq-1");
    assert_eq!(file_name, "a.nii.gz");
    assert_eq!(bids.filename.as_deref(), Some("sub-01_T1w_01.nii.gz"));
    assert_eq!(bids.valid, Some(false));
    assert_eq!(
        bids.error_message.as_deref(),
        Some("duplicate of sub-01_T1w")
    );
    assert_eq!(bids.ignore, Some(false));
    assert_eq!(writes[1].2.filename.as_deref(), Some("sub-01_T1w_02.nii.gz"));
}

#[test]
fn keep_largest_orders_by_size() {
    let mut platform = same_archive_project();
    if let Some(acquisition) = platform.acquisitions.get_mut("acq-1") {
        acquisition.files[0].size = 300;
        acquisition.files[2].size = 100;
    }
    let app = App::new(&platform);

    let outcome = app
        .dedup(
            &project_path(),
            DedupOptions {
                keep: KeepPolicy::Largest,
                apply: false,
            },
        )
        .unwrap();

    let group = &outcome.resolution.groups[0];
    assert_eq!(group.members[0].file_name, "c.nii.gz");
    assert_eq!(group.members[2].file_name, "a.nii.gz");
    assert_matches!(group.decisions[2], Decision::Keep);
}

#[test]
fn mixed_origins_mark_duplicates_ignored() {
    let platform = mixed_origin_project();
    let app = App::new(&platform);

    let outcome = app.dedup(&project_path(), options(true)).unwrap();

    let group = &outcome.resolution.groups[0];
    assert!(!group.all_same_source);
    assert_eq!(
        group.decisions[0],
        Decision::Rename {
            new_name: "sub-01_T2w__dup01.nii.gz".to_string(),
            note: "duplicate of sub-01_T2w".to_string(),
            set_ignore: true,
        }
    );
    let writes = platform.bids_writes.lock().unwrap();
    assert_eq!(writes.len(), 1);
    let (_, file_name, bids) = &writes[0];
    assert_eq!(file_name, "x.nii.gz");
    assert_eq!(bids.filename.as_deref(), Some("sub-01_T2w__dup01.nii.gz"));
    assert_eq!(bids.ignore, Some(true));
    assert_eq!(bids.valid, Some(false));
}

#[test]
fn dry_run_and_commit_decide_the_same() {
    let dry_platform = same_archive_project();
    let wet_platform = same_archive_project();

    let dry = App::new(&dry_platform)
        .dedup(&project_path(), options(false))
        .unwrap();
    let wet = App::new(&wet_platform)
        .dedup(&project_path(), options(true))
        .unwrap();

    assert_eq!(
        dry.resolution.groups[0].decisions,
        wet.resolution.groups[0].decisions
    );
    assert!(dry_platform.bids_writes.lock().unwrap().is_empty());
    assert_eq!(wet_platform.bids_writes.lock().unwrap().len(), 2);
}

#[test]
fn missing_job_is_fatal() {
    let mut platform = same_archive_project();
    platform.jobs.clear();
    let app = App::new(&platform);

    let err = app.dedup(&project_path(), options(false)).unwrap_err();
    assert_matches!(err, CuratorError::SourceArchiveNotFound { .. });
}

#[test]
fn unrecognized_origin_is_fatal() {
    let mut platform = same_archive_project();
    if let Some(acquisition) = platform.acquisitions.get_mut("acq-1") {
        acquisition.files[1].origin = Some(FileOrigin {
            kind: "gear".to_string(),
            id: None,
        });
    }
    let app = App::new(&platform);

    let err = app.dedup(&project_path(), options(false)).unwrap_err();
    assert_matches!(err, CuratorError::UnknownOrigin { origin_type, .. } if origin_type == "gear");
}

#[test]
fn repeated_file_listing_is_fatal() {
    let mut platform = same_archive_project();
    let mut copy = platform.acquisitions["acq-1"].clone();
    copy.id = "acq-9".to_string();
    copy.files.truncate(1);
    platform.acquisitions.insert("acq-9".to_string(), copy);
    platform
        .session_acquisitions
        .get_mut("ses-1")
        .unwrap()
        .push("acq-9".to_string());
    let app = App::new(&platform);

    let err = app.dedup(&project_path(), options(false)).unwrap_err();
    assert_matches!(err, CuratorError::FileSeenTwice(id) if id == "f-a");
}
