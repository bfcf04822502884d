use std::fmt;

use thiserror::Error;

/// Why a model download did not produce a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadFailure {
    HttpStatus(u16),
    Network(String),
    Io(String),
    ChecksumMismatch { expected: String, actual: String },
}

impl fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpStatus(status) => write!(f, "http status {status}"),
            Self::Network(msg) => write!(f, "network error: {msg}"),
            Self::Io(msg) => write!(f, "io error: {msg}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch (expected {expected}, got {actual})")
            }
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StudioError {
    #[error("interpreter unavailable: {program}: {message}")]
    InterpreterUnavailable { program: String, message: String },

    #[error("failed to spawn {program}: {message}")]
    ProcessSpawnFailed {
        program: String,
        message: String,
        not_found: bool,
    },

    #[error("{name} did not become ready within {timeout_ms} ms")]
    ProcessStartTimeout { name: String, timeout_ms: u64 },

    #[error("{name} exited unexpectedly (exit={exit_code:?}): {tail}")]
    ProcessCrashed {
        name: String,
        exit_code: Option<i32>,
        tail: String,
    },

    #[error("{service} is not running: {message}")]
    ServiceNotRunning { service: String, message: String },

    #[error("{service} rejected the request: {reason}")]
    ServiceRejected { service: String, reason: String },

    #[error("{service} {path} timed out after {timeout_ms} ms")]
    RequestTimeout {
        service: String,
        path: String,
        timeout_ms: u64,
    },

    #[error("a job is already running for {key}")]
    DuplicateJob { key: String },

    #[error("unknown model: {model_id}")]
    UnknownModel { model_id: String },

    #[error("model not downloaded: {model_id}")]
    ModelNotDownloaded { model_id: String },

    #[error("model {model_id} is not downloadable by the local engine")]
    UnsupportedSource { model_id: String },

    #[error("download failed for {url}: {failure}")]
    DownloadFailed { url: String, failure: DownloadFailure },

    #[error("audio conversion failed for {input}: {reason}")]
    ConversionFailed { input: String, reason: String },

    #[error("recognition failed (exit={exit_code:?}): {stderr_tail}")]
    RecognitionFailed {
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("failed to parse {context}: {message}")]
    ParseFailed { context: String, message: String },

    #[error("{context}: {message}")]
    Io { context: String, message: String },
}

impl StudioError {
    pub fn io(context: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn parse(context: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::ParseFailed {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Stable code recorded in trace events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InterpreterUnavailable { .. } => "E_INTERPRETER_UNAVAILABLE",
            Self::ProcessSpawnFailed { .. } => "E_PROCESS_SPAWN",
            Self::ProcessStartTimeout { .. } => "E_PROCESS_START_TIMEOUT",
            Self::ProcessCrashed { .. } => "E_PROCESS_CRASHED",
            Self::ServiceNotRunning { .. } => "E_SERVICE_NOT_RUNNING",
            Self::ServiceRejected { .. } => "E_SERVICE_REJECTED",
            Self::RequestTimeout { .. } => "E_REQUEST_TIMEOUT",
            Self::DuplicateJob { .. } => "E_DUPLICATE_JOB",
            Self::UnknownModel { .. } => "E_UNKNOWN_MODEL",
            Self::ModelNotDownloaded { .. } => "E_MODEL_NOT_DOWNLOADED",
            Self::UnsupportedSource { .. } => "E_UNSUPPORTED_SOURCE",
            Self::DownloadFailed {
                failure: DownloadFailure::HttpStatus(_),
                ..
            } => "E_DOWNLOAD_HTTP",
            Self::DownloadFailed {
                failure: DownloadFailure::ChecksumMismatch { .. },
                ..
            } => "E_DOWNLOAD_CHECKSUM",
            Self::DownloadFailed { .. } => "E_DOWNLOAD_NETWORK",
            Self::ConversionFailed { .. } => "E_CONVERSION_FAILED",
            Self::RecognitionFailed { .. } => "E_RECOGNITION_FAILED",
            Self::ParseFailed { .. } => "E_PARSE_FAILED",
            Self::Io { .. } => "E_IO",
        }
    }

    /// Trace `error.kind` bucket.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InterpreterUnavailable { .. }
            | Self::ProcessSpawnFailed { .. }
            | Self::ProcessStartTimeout { .. }
            | Self::ProcessCrashed { .. }
            | Self::ConversionFailed { .. }
            | Self::RecognitionFailed { .. } => "process",
            Self::ServiceNotRunning { .. }
            | Self::ServiceRejected { .. }
            | Self::RequestTimeout { .. }
            | Self::DownloadFailed { .. } => "http",
            Self::ParseFailed { .. } => "parse",
            Self::Io { .. } => "io",
            Self::DuplicateJob { .. }
            | Self::UnknownModel { .. }
            | Self::ModelNotDownloaded { .. }
            | Self::UnsupportedSource { .. } => "logic",
        }
    }

    /// Guidance shown to the user instead of the raw error chain.
    pub fn user_message(&self) -> String {
        match self {
            Self::InterpreterUnavailable { program, .. } => format!(
                "Python 3 was not found ({program}). Install Python 3 from https://www.python.org/downloads/ \
                 or set STUDIOKIT_PYTHON to an existing interpreter, then retry."
            ),
            Self::ProcessSpawnFailed {
                program,
                not_found: true,
                ..
            } => format!(
                "{program} is not installed or not on PATH. Install it or point the matching STUDIOKIT_* variable at it."
            ),
            Self::ProcessSpawnFailed { program, message, .. } => {
                format!("Could not launch {program}: {message}")
            }
            Self::ProcessStartTimeout { name, timeout_ms } => format!(
                "{name} did not start within {} seconds. Check that its dependencies are installed.",
                timeout_ms / 1000
            ),
            Self::ProcessCrashed { name, tail, .. } => {
                format!("{name} stopped unexpectedly. Last output:\n{tail}")
            }
            Self::ServiceNotRunning { service, .. } => {
                format!("The {service} service is not running. Start the service and try again.")
            }
            Self::ServiceRejected { reason, .. } => reason.clone(),
            Self::RequestTimeout { service, .. } => {
                format!("The {service} service took too long to answer. Try again.")
            }
            Self::DuplicateJob { key } => format!("{key} is already being processed."),
            Self::UnknownModel { model_id } => format!("Model '{model_id}' is not in the catalog."),
            Self::ModelNotDownloaded { model_id } => {
                format!("Model '{model_id}' is not downloaded yet. Download it first.")
            }
            Self::UnsupportedSource { model_id } => {
                format!("Model '{model_id}' is installed through its service, not directly.")
            }
            Self::DownloadFailed {
                failure: DownloadFailure::HttpStatus(status),
                ..
            } => format!("Download failed: the server answered HTTP {status}."),
            Self::DownloadFailed {
                failure: DownloadFailure::ChecksumMismatch { .. },
                ..
            } => "Downloaded file is corrupted. Please retry the download.".to_string(),
            Self::DownloadFailed { failure, .. } => {
                format!("Download failed: {failure}. Check your internet connection.")
            }
            Self::ConversionFailed { .. } => {
                "Audio conversion failed. Make sure ffmpeg is installed (https://ffmpeg.org/download.html)."
                    .to_string()
            }
            Self::RecognitionFailed { stderr_tail, .. } => {
                format!("Transcription failed:\n{stderr_tail}")
            }
            Self::ParseFailed { context, .. } => format!("Unexpected response while reading {context}."),
            Self::Io { context, message } => format!("{context}: {message}"),
        }
    }
}
