use std::{path::PathBuf, sync::Arc};

use serde::Serialize;
use serde_json::json;
use studiokit_core::StudioError;
use studiokit_observability::trace::{self, Span};
use studiokit_platform::{
    hardware,
    locate::{resolve_traced, Candidate, ProgramProbe, RuntimeStatus, SystemProbe},
    HardwareProfile,
};

use crate::{
    config::StudioConfig,
    jobs::{JobTracker, Subscription},
    llm::LlmService,
    models::{ModelInfo, ModelStore},
    speech::SpeechService,
    transcription::TranscriptionService,
    video::VideoService,
};

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeReport {
    pub python: RuntimeStatus,
    pub ffmpeg: RuntimeStatus,
    pub whisper: RuntimeStatus,
    pub ollama: RuntimeStatus,
}

/// Owns the job tracker and every facade. One per process.
pub struct Studio {
    config: StudioConfig,
    probe: Arc<dyn ProgramProbe>,
    tracker: JobTracker,
    models: Arc<ModelStore>,
    pub transcription: TranscriptionService,
    pub speech: SpeechService,
    pub video: VideoService,
    pub llm: LlmService,
}

impl Studio {
    pub fn new(config: StudioConfig) -> Self {
        Self::with_probe(config, Arc::new(SystemProbe))
    }

    pub fn with_probe(config: StudioConfig, probe: Arc<dyn ProgramProbe>) -> Self {
        let tracker = JobTracker::new(&config.data_dir);
        let models = Arc::new(ModelStore::new(
            &config.data_dir,
            &config.models_dir,
            tracker.clone(),
        ));
        let transcription =
            TranscriptionService::new(&config, models.clone(), tracker.clone(), probe.clone());
        let speech = SpeechService::new(&config, tracker.clone(), probe.clone());
        let video = VideoService::new(&config, tracker.clone(), probe.clone());
        let llm = LlmService::new(&config, tracker.clone(), probe.clone());
        trace::event(
            &config.data_dir,
            None,
            "Studio",
            "STUDIO.init",
            "ok",
            Some(json!({ "models_dir": config.models_dir.display().to_string() })),
        );
        Self {
            config,
            probe,
            tracker,
            models,
            transcription,
            speech,
            video,
            llm,
        }
    }

    pub fn config(&self) -> &StudioConfig {
        &self.config
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub fn models(&self) -> &ModelStore {
        &self.models
    }

    pub fn subscribe(&self, key: Option<&str>) -> Subscription {
        self.tracker.subscribe(key)
    }

    /// CPU, memory and GPU snapshot. Runs the probe off the async workers.
    pub async fn hardware(&self) -> Result<HardwareProfile, StudioError> {
        let dir = self.config.data_dir.clone();
        tokio::task::spawn_blocking(move || hardware::probe(&dir))
            .await
            .map_err(|e| StudioError::io("hardware probe", e))
    }

    /// Catalog with download state, ranked against available memory.
    pub async fn model_overview(&self) -> Result<Vec<ModelInfo>, StudioError> {
        let hw = self.hardware().await?;
        Ok(self.models.list(hw.available_memory_bytes))
    }

    pub async fn runtime_status(&self) -> Result<RuntimeReport, StudioError> {
        let dir = self.config.data_dir.clone();
        let cfg = self.config.clone();
        let probe = self.probe.clone();
        tokio::task::spawn_blocking(move || {
            let check = |c: Candidate, code: &str| resolve_traced(&dir, &c, probe.as_ref()).status(code);
            RuntimeReport {
                python: check(Candidate::python(cfg.python, &dir), "E_PYTHON_NOT_READY"),
                ffmpeg: check(Candidate::ffmpeg(cfg.ffmpeg, &dir), "E_FFMPEG_NOT_FOUND"),
                whisper: check(Candidate::whisper(cfg.whisper, &dir), "E_WHISPER_NOT_FOUND"),
                ollama: check(Candidate::ollama(cfg.ollama, &dir), "E_OLLAMA_NOT_FOUND"),
            }
        })
        .await
        .map_err(|e| StudioError::io("runtime status", e))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.config.output_dir.clone()
    }

    /// Stops every owned server and signals every in-flight job to cancel.
    /// Returns the number of jobs signalled. Each job settles as its owner unwinds.
    pub async fn shutdown(&self) -> usize {
        let span = Span::start(&self.config.data_dir, None, "Studio", "STUDIO.shutdown", None);
        let (speech, video, llm) = tokio::join!(self.speech.stop(), self.video.stop(), self.llm.stop());
        let cancelled = self.tracker.cancel_all();
        span.ok(Some(json!({
            "stopped": { "speech": speech, "video": video, "llm": llm },
            "cancelled_jobs": cancelled,
        })));
        cancelled
    }
}
