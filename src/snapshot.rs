use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::error::CuratorError;
use crate::report::CurationSurvey;

pub const SNAPSHOT_FILE_NAME: &str = "bids_curation_snapshot.json";

pub fn snapshot_path(dir: &Utf8Path) -> Utf8PathBuf {
    dir.join(SNAPSHOT_FILE_NAME)
}

pub fn snapshot_exists(dir: &Utf8Path) -> bool {
    snapshot_path(dir).as_std_path().exists()
}

/// Writes the survey next to the reports so a later run can skip the
/// platform walk. The write goes through a temp file and a rename.
pub fn save_snapshot(dir: &Utf8Path, survey: &CurationSurvey) -> Result<Utf8PathBuf, CuratorError> {
    let path = snapshot_path(dir);
    let content = serde_json::to_vec_pretty(survey)
        .map_err(|err| CuratorError::Filesystem(err.to_string()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(tmp_path.as_std_path(), &content)
        .map_err(|err| CuratorError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| CuratorError::Filesystem(err.to_string()))?;
    info!("saved snapshot {path}");
    Ok(path)
}

pub fn load_snapshot(dir: &Utf8Path) -> Result<CurationSurvey, CuratorError> {
    let path = snapshot_path(dir);
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| CuratorError::Filesystem(err.to_string()))?;
    let survey =
        serde_json::from_str(&content).map_err(|err| CuratorError::SnapshotDecode {
            path: path.to_string(),
            message: err.to_string(),
        })?;
    info!("loaded snapshot {path}");
    Ok(survey)
}
