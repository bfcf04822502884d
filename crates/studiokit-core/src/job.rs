use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Download,
    Transcription,
    Analysis,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Transcription => "transcription",
            Self::Analysis => "analysis",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Progress or terminal notification for one job key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub key: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of an operation that may be cancelled by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(v) => Some(v),
            Self::Cancelled => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Completed(v) => Outcome::Completed(f(v)),
            Self::Cancelled => Outcome::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_key_and_progress() {
        let ev = JobEvent {
            key: "tiny".into(),
            kind: JobKind::Download,
            status: JobStatus::Running,
            progress: 50,
            error: None,
        };
        let v = serde_json::to_value(&ev).expect("json");
        assert_eq!(v["key"], "tiny");
        assert_eq!(v["progress"], 50);
        assert_eq!(v["kind"], "download");
        assert!(v.get("error").is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
