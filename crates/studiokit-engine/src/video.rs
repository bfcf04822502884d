use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use studiokit_core::{JobKind, Outcome, StudioError, VIDEO_ENDPOINT};
use studiokit_observability::trace::Span;
use studiokit_platform::locate::{Candidate, ProgramProbe};
use studiokit_providers::loopback::expect_success;

use crate::{
    backend::{BackendServer, BackendStatus, PythonScriptLauncher},
    config::StudioConfig,
    jobs::JobTracker,
    speech::FLASK_READY,
};

pub const ANALYZER_SCRIPT: &str = "tiktok_score.py";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TechnicalScore {
    pub resolution: u32,
    pub aspect_ratio: u32,
    pub lighting: u32,
    pub blur: u32,
    pub fps: u32,
    pub details: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisReport {
    pub overall_score: u32,
    pub technical: TechnicalScore,
    pub hook: Value,
    pub audio: Value,
    pub content: Value,
    pub recommendations: Vec<String>,
    pub video_info: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuickReport {
    pub technical: TechnicalScore,
    pub video_info: Value,
}

/// Facade over the Python video-analysis server.
pub struct VideoService {
    server: BackendServer,
    tracker: JobTracker,
    data_dir: PathBuf,
    request_timeout: Duration,
    long_timeout: Duration,
}

fn result_of<T: for<'de> Deserialize<'de>>(v: Value) -> Result<T, StudioError> {
    let v = expect_success(VIDEO_ENDPOINT.name, v)?;
    let result = v.get("result").cloned().unwrap_or(Value::Null);
    serde_json::from_value(result).map_err(|e| StudioError::parse("analysis result", e))
}

fn video_body(video: &Path) -> Result<Value, StudioError> {
    if !video.is_file() {
        return Err(StudioError::io(
            format!("read {}", video.display()),
            "video file not found",
        ));
    }
    Ok(json!({ "videoPath": video.display().to_string() }))
}

impl VideoService {
    pub fn new(cfg: &StudioConfig, tracker: JobTracker, probe: Arc<dyn ProgramProbe>) -> Self {
        let launcher = PythonScriptLauncher::new(
            "video-analysis",
            Candidate::python(cfg.python.clone(), &cfg.data_dir),
            cfg.scripts_dir.join(ANALYZER_SCRIPT),
            &cfg.data_dir,
            probe,
        )
        .env("ANALYZER_PORT", VIDEO_ENDPOINT.port.to_string());
        let server = BackendServer::new(
            VIDEO_ENDPOINT,
            Arc::new(launcher),
            FLASK_READY,
            cfg.startup_timeout,
            &cfg.data_dir,
        );
        Self::with_server(cfg, server, tracker)
    }

    pub fn with_server(cfg: &StudioConfig, server: BackendServer, tracker: JobTracker) -> Self {
        Self {
            server,
            tracker,
            data_dir: cfg.data_dir.clone(),
            request_timeout: cfg.request_timeout,
            long_timeout: cfg.long_request_timeout,
        }
    }

    pub async fn health(&self) -> bool {
        self.server.client().is_healthy(HEALTH_TIMEOUT).await
    }

    pub async fn start(&self) -> Result<(), StudioError> {
        self.server.ensure_ready().await
    }

    pub async fn stop(&self) -> bool {
        self.server.stop().await
    }

    pub async fn backend_status(&self) -> BackendStatus {
        self.server.status().await
    }

    /// Full analysis, tracked under the video path. Cancelling drops the connection.
    pub async fn analyze(&self, video: &Path) -> Result<Outcome<AnalysisReport>, StudioError> {
        let body = video_body(video)?;
        let key = video.display().to_string();
        self.tracker
            .run(&key, JobKind::Analysis, |tok| async move {
                let span = Span::start(&self.data_dir, Some(tok.key()), "Video", "VIDEO.analyze", None);
                let res = tokio::select! {
                    r = self.server.request(Method::POST, "/analyze", Some(&body), self.long_timeout) => {
                        r.and_then(result_of::<AnalysisReport>).map(Outcome::Completed)
                    }
                    _ = tok.cancellation().cancelled() => Ok(Outcome::Cancelled),
                };
                match &res {
                    Ok(Outcome::Completed(r)) => span.ok(Some(json!({ "overall": r.overall_score }))),
                    Ok(Outcome::Cancelled) => span.skipped("cancelled", None),
                    Err(e) => span.err(e.kind(), e.code(), &e.to_string(), None),
                }
                res
            })
            .await
    }

    pub fn cancel(&self, video: &Path) -> bool {
        self.tracker.cancel(&video.display().to_string())
    }

    /// Technical checks only; not tracked.
    pub async fn analyze_quick(&self, video: &Path) -> Result<QuickReport, StudioError> {
        let body = video_body(video)?;
        let v = self
            .server
            .request(Method::POST, "/analyze/quick", Some(&body), self.request_timeout)
            .await?;
        result_of(v)
    }
}
