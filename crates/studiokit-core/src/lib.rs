pub mod digest;
pub mod endpoint;
pub mod error;
pub mod job;
pub mod timecode;

pub use endpoint::{ServerEndpoint, LLM_ENDPOINT, TTS_ENDPOINT, VIDEO_ENDPOINT};
pub use error::{DownloadFailure, StudioError};
pub use job::{JobEvent, JobKind, JobStatus, Outcome};
