use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CuratorError {
    #[error("invalid project address: {0}")]
    InvalidProjectPath(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("platform request failed: {0}")]
    PlatformHttp(String),

    #[error("platform returned status {status}: {message}")]
    PlatformStatus { status: u16, message: String },

    #[error("file id {0} listed twice in one pass, listing is inconsistent")]
    FileSeenTwice(String),

    #[error("DICOM archive for {file_name} not found: {reason}")]
    SourceArchiveNotFound { file_name: String, reason: String },

    #[error("unrecognized origin type {origin_type:?} on file {file_name}")]
    UnknownOrigin {
        origin_type: String,
        file_name: String,
    },

    #[error("file {file_index} in acquisition {acquisition_id} is gone or lost its BIDS record")]
    MissingFile {
        acquisition_id: String,
        file_index: usize,
    },

    #[error("invalid intended-for pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("intended-for patterns must come in file/target pairs, got {0} patterns")]
    UnpairedPattern(usize),

    #[error("missing API key (pass --api-key or set BIDS_CURATOR_KEY)")]
    MissingApiKey,

    #[error("missing platform host (pass --host or set BIDS_CURATOR_HOST)")]
    MissingHost,

    #[error("snapshot at {path} could not be decoded: {message}")]
    SnapshotDecode { path: String, message: String },

    #[error("failed to write report {path}: {message}")]
    CsvWrite { path: String, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
