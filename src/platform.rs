use std::collections::BTreeMap;
use std::fmt;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::domain::ProjectPath;
use crate::error::CuratorError;

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub id: String,
    pub group: String,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subject {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    pub id: String,
    pub label: String,
}

/// Sparse acquisition listing; file metadata is only populated on a direct
/// acquisition fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionSummary {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Acquisition {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub origin: Option<FileOrigin>,
    #[serde(default)]
    pub info: FileInfo,
}

/// How a file arrived on the platform: uploaded by a user or produced by a
/// processing job. The kind is kept raw so unrecognized values can be
/// reported verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct FileOrigin {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
}

/// The open-ended per-file metadata dictionary. Known keys are typed,
/// everything else survives in `extra` so writes never drop fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "BIDS", default, skip_serializing_if = "Option::is_none")]
    pub bids: Option<BidsField>,
    #[serde(
        rename = "IntendedFor",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub intended_for: Option<Vec<String>>,
    #[serde(
        rename = "SeriesNumber",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub series_number: Option<i64>,
    #[serde(
        rename = "AcquisitionDateTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub acquisition_datetime: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The BIDS key is either the literal marker `"NA"` on files the naming
/// pipeline does not cover, or a structured record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BidsField {
    Record(Box<BidsInfo>),
    Marker(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BidsInfo {
    #[serde(rename = "Filename", default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(rename = "Folder", default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(
        rename = "IntendedFor",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub intended_for: Option<Vec<IntendedForFolder>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntendedForFolder {
    #[serde(rename = "Folder", default)]
    pub folder: Option<String>,
}

/// Where a file stands with respect to the standardized naming scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathState {
    NotYetCurated,
    NonStandard,
    Incomplete(Vec<&'static str>),
    Ignored,
    Mapped(String),
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathState::NotYetCurated => write!(f, "Not_yet_BIDS_curated"),
            PathState::NonStandard => write!(f, "nonBids"),
            PathState::Incomplete(missing) => {
                for (index, key) in missing.iter().enumerate() {
                    if index > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "missing_{key}")?;
                }
                Ok(())
            }
            PathState::Ignored => write!(f, "ignored"),
            PathState::Mapped(path) => write!(f, "{path}"),
        }
    }
}

impl FileInfo {
    pub fn is_empty(&self) -> bool {
        self.bids.is_none()
            && self.intended_for.is_none()
            && self.series_number.is_none()
            && self.acquisition_datetime.is_none()
            && self.extra.is_empty()
    }

    pub fn bids_record(&self) -> Option<&BidsInfo> {
        match &self.bids {
            Some(BidsField::Record(record)) => Some(record),
            _ => None,
        }
    }

    /// Classifies the file for duplicate detection and reporting. A record
    /// missing any expected key (an empty filename counts as missing) is
    /// incomplete; the ignore flag only applies to complete records.
    pub fn path_state(&self) -> PathState {
        let record = match &self.bids {
            None => return PathState::NotYetCurated,
            Some(BidsField::Marker(_)) => return PathState::NonStandard,
            Some(BidsField::Record(record)) => record,
        };
        let mut missing = Vec::new();
        if record.ignore.is_none() {
            missing.push("ignore");
        }
        if record.folder.is_none() {
            missing.push("Folder");
        }
        let filename = record.filename.as_deref().unwrap_or("");
        if filename.is_empty() {
            missing.push("Filename");
        }
        if !missing.is_empty() {
            return PathState::Incomplete(missing);
        }
        if record.ignore == Some(true) {
            return PathState::Ignored;
        }
        let folder = record.folder.as_deref().unwrap_or("");
        PathState::Mapped(format!("{folder}/{filename}"))
    }
}

/// One processing job as reported by the session job listing. Inputs are
/// keyed by the gear's input name and reference the container the input
/// file lives in.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, JobInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Job {
    /// The named input archive this job consumed from the given
    /// acquisition, if any.
    pub fn input_archive_for(&self, acquisition_id: &str) -> Option<&str> {
        self.inputs
            .values()
            .find(|input| input.id.as_deref() == Some(acquisition_id))
            .and_then(|input| input.name.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct SessionJobsPayload {
    #[serde(default)]
    jobs: Vec<Job>,
}

pub trait PlatformClient: Send + Sync {
    fn lookup_project(&self, path: &ProjectPath) -> Result<Project, CuratorError>;
    fn list_subjects(&self, project_id: &str) -> Result<Vec<Subject>, CuratorError>;
    fn list_project_sessions(&self, project_id: &str) -> Result<Vec<Session>, CuratorError>;
    fn list_subject_sessions(&self, subject_id: &str) -> Result<Vec<Session>, CuratorError>;
    fn list_acquisitions(&self, session_id: &str)
    -> Result<Vec<AcquisitionSummary>, CuratorError>;
    fn get_acquisition(&self, acquisition_id: &str) -> Result<Acquisition, CuratorError>;
    fn session_jobs(&self, session_id: &str) -> Result<Vec<Job>, CuratorError>;
    fn set_bids_info(
        &self,
        acquisition_id: &str,
        file_name: &str,
        bids: &BidsInfo,
    ) -> Result<(), CuratorError>;
    fn set_intended_for(
        &self,
        acquisition_id: &str,
        file_name: &str,
        targets: &[String],
    ) -> Result<(), CuratorError>;
}

#[derive(Clone)]
pub struct PlatformHttpClient {
    client: Client,
    base_url: String,
}

impl PlatformHttpClient {
    pub fn new(host: &str, api_key: &str) -> Result<Self, CuratorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("bids-curator/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CuratorError::PlatformHttp(err.to_string()))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
                .map_err(|err| CuratorError::PlatformHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| CuratorError::PlatformHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: host.trim_end_matches('/').to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.base_url
    }

    fn api_url(&self, tail: &str) -> String {
        format!("{}/api/{}", self.base_url, tail)
    }

    fn get_json<T>(&self, url: &str) -> Result<T, CuratorError>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self.send_with_retries(|| self.client.get(url))?;
        let response = handle_status(response)?;
        response
            .json()
            .map_err(|err| CuratorError::PlatformHttp(err.to_string()))
    }

    fn post_set(
        &self,
        acquisition_id: &str,
        file_name: &str,
        body: &Value,
    ) -> Result<(), CuratorError> {
        let url = self.api_url(&format!(
            "acquisitions/{}/files/{}/info",
            encode_url_component(acquisition_id),
            encode_url_component(file_name)
        ));
        let response = self.send_with_retries(|| self.client.post(&url).json(body))?;
        handle_status(response)?;
        Ok(())
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, CuratorError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(CuratorError::PlatformHttp(err.to_string()));
                }
            }
        }
    }
}

impl PlatformClient for PlatformHttpClient {
    fn lookup_project(&self, path: &ProjectPath) -> Result<Project, CuratorError> {
        let url = self.api_url(&format!(
            "projects/lookup/{}/{}",
            encode_url_component(path.group()),
            encode_url_component(path.label())
        ));
        let response = self.send_with_retries(|| self.client.get(&url))?;
        if response.status().as_u16() == 404 {
            return Err(CuratorError::ProjectNotFound(path.to_string()));
        }
        let response = handle_status(response)?;
        response
            .json()
            .map_err(|err| CuratorError::PlatformHttp(err.to_string()))
    }

    fn list_subjects(&self, project_id: &str) -> Result<Vec<Subject>, CuratorError> {
        let url = self.api_url(&format!(
            "projects/{}/subjects",
            encode_url_component(project_id)
        ));
        self.get_json(&url)
    }

    fn list_project_sessions(&self, project_id: &str) -> Result<Vec<Session>, CuratorError> {
        let url = self.api_url(&format!(
            "projects/{}/sessions",
            encode_url_component(project_id)
        ));
        self.get_json(&url)
    }

    fn list_subject_sessions(&self, subject_id: &str) -> Result<Vec<Session>, CuratorError> {
        let url = self.api_url(&format!(
            "subjects/{}/sessions",
            encode_url_component(subject_id)
        ));
        self.get_json(&url)
    }

    fn list_acquisitions(
        &self,
        session_id: &str,
    ) -> Result<Vec<AcquisitionSummary>, CuratorError> {
        let url = self.api_url(&format!(
            "sessions/{}/acquisitions",
            encode_url_component(session_id)
        ));
        self.get_json(&url)
    }

    fn get_acquisition(&self, acquisition_id: &str) -> Result<Acquisition, CuratorError> {
        let url = self.api_url(&format!(
            "acquisitions/{}",
            encode_url_component(acquisition_id)
        ));
        self.get_json(&url)
    }

    fn session_jobs(&self, session_id: &str) -> Result<Vec<Job>, CuratorError> {
        let url = self.api_url(&format!("sessions/{}/jobs", encode_url_component(session_id)));
        let payload: SessionJobsPayload = self.get_json(&url)?;
        Ok(payload.jobs)
    }

    fn set_bids_info(
        &self,
        acquisition_id: &str,
        file_name: &str,
        bids: &BidsInfo,
    ) -> Result<(), CuratorError> {
        self.post_set(acquisition_id, file_name, &json!({"set": {"BIDS": bids}}))
    }

    fn set_intended_for(
        &self,
        acquisition_id: &str,
        file_name: &str,
        targets: &[String],
    ) -> Result<(), CuratorError> {
        self.post_set(
            acquisition_id,
            file_name,
            &json!({"set": {"IntendedFor": targets}}),
        )
    }
}

fn handle_status(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, CuratorError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "platform request failed".to_string());
    Err(CuratorError::PlatformStatus { status, message })
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Everything outside the unreserved URL set gets escaped; file names on
/// the platform can carry spaces and slashes.
const URL_UNSAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn encode_url_component(value: &str) -> String {
    utf8_percent_encode(value, URL_UNSAFE).to_string()
}
