use std::{path::PathBuf, sync::Arc, time::Duration};

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use studiokit_core::{JobKind, Outcome, StudioError, LLM_ENDPOINT};
use studiokit_observability::trace::Span;
use studiokit_platform::{
    locate::{resolve_traced, Candidate, ProgramProbe},
    ProcessSpec,
};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{BackendServer, BackendStatus, Launcher},
    config::StudioConfig,
    jobs::JobTracker,
};

/// `ollama serve` logs this once the listener is up.
pub const OLLAMA_READY: &str = "Listening on";

struct OllamaLauncher {
    candidate: Candidate,
    data_dir: PathBuf,
    probe: Arc<dyn ProgramProbe>,
}

impl Launcher for OllamaLauncher {
    fn command(&self) -> Result<ProcessSpec, StudioError> {
        let located = resolve_traced(&self.data_dir, &self.candidate, self.probe.as_ref());
        Ok(ProcessSpec::new("ollama", located.program).arg("serve"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmModel {
    pub name: String,
    pub size: u64,
    pub digest: String,
    pub modified_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub stream: bool,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            stream: true,
        }
    }
}

/// Pull progress line: `{status, total?, completed?}`.
fn pull_percent(chunk: &Value) -> Option<u8> {
    if chunk.get("status").and_then(Value::as_str) == Some("success") {
        return Some(100);
    }
    let total = chunk.get("total").and_then(Value::as_u64).filter(|t| *t > 0)?;
    let done = chunk.get("completed").and_then(Value::as_u64)?;
    Some(((done as f64 / total as f64) * 100.0).round().min(100.0) as u8)
}

/// Facade over the local LLM runtime.
pub struct LlmService {
    server: BackendServer,
    tracker: JobTracker,
    data_dir: PathBuf,
    request_timeout: Duration,
}

impl LlmService {
    pub fn new(cfg: &StudioConfig, tracker: JobTracker, probe: Arc<dyn ProgramProbe>) -> Self {
        let launcher = OllamaLauncher {
            candidate: Candidate::ollama(cfg.ollama.clone(), &cfg.data_dir),
            data_dir: cfg.data_dir.clone(),
            probe,
        };
        let server = BackendServer::new(
            LLM_ENDPOINT,
            Arc::new(launcher),
            OLLAMA_READY,
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
        }
    }

    /// Adopts a runtime already listening on the port, or spawns `ollama serve`.
    pub async fn ensure_ready(&self) -> Result<(), StudioError> {
        self.server.ensure_ready().await
    }

    pub async fn stop(&self) -> bool {
        self.server.stop().await
    }

    pub async fn backend_status(&self) -> BackendStatus {
        self.server.status().await
    }

    pub async fn version(&self) -> Result<String, StudioError> {
        let v = self
            .server
            .request(Method::GET, "/api/version", None, self.request_timeout)
            .await?;
        v.get("version")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StudioError::parse("llm version", "missing version"))
    }

    pub async fn list_models(&self) -> Result<Vec<LlmModel>, StudioError> {
        let v = self
            .server
            .request(Method::GET, "/api/tags", None, self.request_timeout)
            .await?;
        let models = v.get("models").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(models).map_err(|e| StudioError::parse("llm models", e))
    }

    /// The runtime answers with an empty body on success.
    pub async fn delete_model(&self, name: &str) -> Result<(), StudioError> {
        self.server.ensure_ready().await?;
        self.server
            .client()
            .request_lenient(
                Method::DELETE,
                "/api/delete",
                Some(&json!({ "model": name })),
                self.request_timeout,
            )
            .await
            .map(|_| ())
    }

    /// Streams a model pull as a job keyed by the model name.
    pub async fn pull_model(
        &self,
        name: &str,
        mut on_progress: impl FnMut(u8),
    ) -> Result<Outcome<()>, StudioError> {
        self.server.ensure_ready().await?;
        let tracker = self.tracker.clone();
        self.tracker
            .run(name, JobKind::Download, |tok| async move {
                let span = Span::start(&self.data_dir, Some(name), "Llm", "LLM.pull", None);
                let body = json!({ "model": name, "stream": true });
                let res = self
                    .server
                    .client()
                    .request_stream_cancellable(
                        Method::POST,
                        "/api/pull",
                        Some(&body),
                        tok.cancellation(),
                        |chunk| {
                            if let Some(p) = pull_percent(chunk).and_then(|p| tracker.update_progress(&tok, p)) {
                                on_progress(p);
                            }
                        },
                    )
                    .await
                    .map(|o| o.map(|_| ()));
                match &res {
                    Ok(Outcome::Completed(())) => span.ok(None),
                    Ok(Outcome::Cancelled) => span.skipped("cancelled", None),
                    Err(e) => span.err(e.kind(), e.code(), &e.to_string(), None),
                }
                res
            })
            .await
    }

    pub fn cancel_pull(&self, name: &str) -> bool {
        self.tracker.cancel(name)
    }

    /// Streams tokens to `on_token` and returns the full text.
    pub async fn generate(
        &self,
        req: &GenerateRequest,
        token: &CancellationToken,
        mut on_token: impl FnMut(&str),
    ) -> Result<Outcome<String>, StudioError> {
        self.server.ensure_ready().await?;
        let body = serde_json::to_value(req).map_err(|e| StudioError::parse("generate request", e))?;
        let span = Span::start(
            &self.data_dir,
            None,
            "Llm",
            "LLM.generate",
            Some(json!({ "model": req.model, "prompt_chars": req.prompt.chars().count() })),
        );
        let res = self
            .server
            .client()
            .request_stream_cancellable(Method::POST, "/api/generate", Some(&body), token, |chunk| {
                if let Some(piece) = chunk.get("response").and_then(Value::as_str) {
                    on_token(piece);
                }
            })
            .await;
        match &res {
            Ok(Outcome::Completed(text)) => span.ok(Some(json!({ "chars": text.chars().count() }))),
            Ok(Outcome::Cancelled) => span.skipped("cancelled", None),
            Err(e) => span.err(e.kind(), e.code(), &e.to_string(), None),
        }
        res
    }
}
