pub mod backend;
pub mod config;
pub mod jobs;
pub mod llm;
pub mod models;
pub mod speech;
pub mod studio;
pub mod transcription;
pub mod video;

pub use backend::{BackendServer, BackendState, BackendStatus, Launcher};
pub use config::StudioConfig;
pub use jobs::{JobToken, JobTracker, Subscription};
pub use llm::{GenerateRequest, LlmModel, LlmService};
pub use models::{ModelInfo, ModelStore};
pub use speech::{CloneVoiceRequest, GenerateSpeechRequest, SpeechService, VoiceProfile};
pub use studio::{RuntimeReport, Studio};
pub use transcription::{Segment, Transcript, TranscriptionService};
pub use video::{AnalysisReport, QuickReport, VideoService};
