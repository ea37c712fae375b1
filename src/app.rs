use camino::Utf8PathBuf;
use tracing::{error, info};

use crate::domain::{KeepPolicy, ProjectPath};
use crate::error::CuratorError;
use crate::export::{self, ReportFiles};
use crate::platform::PlatformClient;
use crate::report::{self, CurationSurvey, DuplicatePath};
use crate::resolve::{self, ResolveOutcome};
use crate::scan;
use crate::snapshot;

#[derive(Debug, Clone, Copy)]
pub struct DedupOptions {
    pub keep: KeepPolicy,
    pub apply: bool,
}

#[derive(Debug)]
pub struct DedupOutcome {
    pub files_seen: usize,
    pub eligible: usize,
    pub duplicate_paths: usize,
    pub renamed: usize,
    pub resolution: ResolveOutcome,
}

#[derive(Debug, Clone)]
pub struct ReportOptions {
    /// Flat list of file/target regex pairs for companion-list filtering.
    pub patterns: Vec<String>,
    pub use_snapshot: bool,
    pub out_dir: Utf8PathBuf,
}

#[derive(Debug)]
pub struct ReportOutcome {
    pub subjects: usize,
    pub sessions: usize,
    pub rewritten: usize,
    pub duplicates: Vec<DuplicatePath>,
    pub files: ReportFiles,
    pub snapshot: Option<Utf8PathBuf>,
}

pub struct App<C: PlatformClient> {
    client: C,
}

impl<C: PlatformClient> App<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    /// Finds every derived path claimed by more than one file and renames
    /// the non-canonical claimants. Without `apply` the decisions are only
    /// logged.
    pub fn dedup(
        &self,
        path: &ProjectPath,
        options: DedupOptions,
    ) -> Result<DedupOutcome, CuratorError> {
        let project = self.client.lookup_project(path)?;
        info!("scanning {path} for duplicated BIDS paths");
        let scan = scan::scan_project(&self.client, &project.id)?;
        info!(
            "{} files seen, {} with usable BIDS paths, {} paths claimed more than once",
            scan.files_seen,
            scan.eligible,
            scan.groups.len(),
        );
        let resolution =
            resolve::resolve_duplicates(&self.client, &scan.groups, options.keep, options.apply)?;
        Ok(DedupOutcome {
            files_seen: scan.files_seen,
            eligible: scan.eligible,
            duplicate_paths: scan.groups.len(),
            renamed: resolution.renamed,
            resolution,
        })
    }

    /// Surveys the project and writes the three report files. With
    /// `use_snapshot` an existing snapshot replaces the platform walk, and a
    /// fresh walk is saved for the next run.
    pub fn report(
        &self,
        path: &ProjectPath,
        options: &ReportOptions,
    ) -> Result<ReportOutcome, CuratorError> {
        let pairs = report::parse_pattern_pairs(&options.patterns)?;
        let mut snapshot_file = None;
        let survey: CurationSurvey =
            if options.use_snapshot && snapshot::snapshot_exists(&options.out_dir) {
                snapshot_file = Some(snapshot::snapshot_path(&options.out_dir));
                snapshot::load_snapshot(&options.out_dir)?
            } else {
                let project = self.client.lookup_project(path)?;
                let survey = report::collect_survey(&self.client, &project)?;
                if options.use_snapshot {
                    snapshot_file = Some(snapshot::save_snapshot(&options.out_dir, &survey)?);
                }
                survey
            };
        let filtered = report::apply_intended_for_filters(&self.client, &survey, &pairs)?;
        let files = export::write_reports(&survey, &filtered, &options.out_dir)?;
        let duplicates = report::duplicate_paths(&survey);
        if duplicates.is_empty() {
            info!("no BIDS path is claimed twice");
        } else {
            error!("these BIDS paths are claimed more than once:");
            for duplicate in &duplicates {
                error!(
                    "  {} {} ({} claims)",
                    duplicate.subject, duplicate.path, duplicate.claims,
                );
            }
        }
        Ok(ReportOutcome {
            subjects: survey.subjects.len(),
            sessions: survey.sessions,
            rewritten: filtered.rewritten,
            duplicates,
            files,
            snapshot: snapshot_file,
        })
    }
}
