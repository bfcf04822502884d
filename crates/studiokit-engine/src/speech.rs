use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use studiokit_core::{JobKind, Outcome, StudioError, TTS_ENDPOINT};
use studiokit_observability::{safe_eprintln, trace};
use studiokit_platform::locate::{Candidate, ProgramProbe};
use studiokit_providers::{
    catalog::{self, ModelFamily},
    download::temp_path,
    loopback::expect_success,
};

use crate::{
    backend::{BackendServer, BackendStatus, PythonScriptLauncher},
    config::StudioConfig,
    jobs::JobTracker,
};

pub const TTS_SCRIPT: &str = "tts_server.py";
/// Flask prints this once the socket is bound.
pub const FLASK_READY: &str = "Running on";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpeechStatus {
    pub running: bool,
    pub device: Option<String>,
    pub model_loaded: bool,
    pub current_model: Option<String>,
    pub current_model_type: Option<String>,
    pub voice_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpeechModel {
    pub id: String,
    pub name: String,
    pub description: String,
    pub size_bytes: f64,
    pub ram_required: u32,
    pub repo: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub downloaded: bool,
    pub path: String,
}

/// Voice profile as persisted by the TTS server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub sample_path: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub embedding_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneVoiceRequest {
    pub audio_path: String,
    pub name: String,
    pub description: String,
    pub language: String,
    pub transcript: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateSpeechRequest {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    pub speaker: String,
    pub instruct: String,
    pub language: String,
    pub speed: f32,
    pub format: String,
}

impl GenerateSpeechRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice_id: None,
            speaker: String::new(),
            instruct: String::new(),
            language: "English".to_string(),
            speed: 1.0,
            format: "wav".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Speakers {
    pub speakers: Value,
    pub available: bool,
}

/// Facade over the Python TTS server.
pub struct SpeechService {
    server: BackendServer,
    tracker: JobTracker,
    data_dir: PathBuf,
    tts_models_dir: PathBuf,
    request_timeout: Duration,
    long_timeout: Duration,
}

fn decode<T: for<'de> Deserialize<'de>>(context: &str, v: Value) -> Result<T, StudioError> {
    serde_json::from_value(v).map_err(|e| StudioError::parse(context, e))
}

/// Delete endpoints answer `{success: false}` for ids that are already gone.
/// Only an explicit `error` is a failure.
fn deleted(service: &str, v: &Value) -> Result<bool, StudioError> {
    if let Some(reason) = v.get("error").and_then(Value::as_str) {
        return Err(StudioError::ServiceRejected {
            service: service.to_string(),
            reason: reason.to_string(),
        });
    }
    Ok(v.get("success").and_then(Value::as_bool).unwrap_or(false))
}

fn is_speech_model(id: &str) -> bool {
    catalog::find(id).is_some_and(|m| m.family == ModelFamily::Speech)
}

impl SpeechService {
    pub fn new(cfg: &StudioConfig, tracker: JobTracker, probe: Arc<dyn ProgramProbe>) -> Self {
        let launcher = PythonScriptLauncher::new(
            "tts",
            Candidate::python(cfg.python.clone(), &cfg.data_dir),
            cfg.scripts_dir.join(TTS_SCRIPT),
            &cfg.data_dir,
            probe,
        )
        .env("TTS_PORT", TTS_ENDPOINT.port.to_string())
        .env("TTS_MODELS_DIR", cfg.tts_models_dir().display().to_string())
        .env("TTS_VOICES_DIR", cfg.voices_dir.display().to_string())
        .env("TTS_OUTPUT_DIR", cfg.output_dir.display().to_string());
        let server = BackendServer::new(
            TTS_ENDPOINT,
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
            tts_models_dir: cfg.tts_models_dir(),
            request_timeout: cfg.request_timeout,
            long_timeout: cfg.long_request_timeout,
        }
    }

    pub fn server(&self) -> &BackendServer {
        &self.server
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, StudioError> {
        let v = self.server.request(method, path, body, timeout).await?;
        expect_success(self.server.endpoint().name, v)
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

    /// Never starts the server; a server that does not answer reports `running: false`.
    pub async fn status(&self) -> Result<SpeechStatus, StudioError> {
        match self.server.client().get("/status", self.request_timeout).await {
            Ok(v) => decode("tts status", v),
            Err(StudioError::ServiceNotRunning { .. }) => Ok(SpeechStatus::default()),
            Err(e) => Err(e),
        }
    }

    pub async fn list_models(&self) -> Result<Vec<SpeechModel>, StudioError> {
        let v = self.call(Method::GET, "/models", None, self.request_timeout).await?;
        decode("tts models", v)
    }

    /// Asks the server to fetch a model snapshot. Tracked under the model id.
    pub async fn download_model(&self, model_id: &str) -> Result<Outcome<()>, StudioError> {
        if !is_speech_model(model_id) {
            return Err(StudioError::UnknownModel {
                model_id: model_id.to_string(),
            });
        }
        let path = format!("/models/{model_id}/download");
        self.tracker
            .run(model_id, JobKind::Download, |tok| async move {
                let body = json!({});
                tokio::select! {
                    r = self.call(Method::POST, &path, Some(&body), self.long_timeout) => {
                        r.map(|_| Outcome::Completed(()))
                    }
                    _ = tok.cancellation().cancelled() => Ok(Outcome::Cancelled),
                }
            })
            .await
    }

    pub fn cancel_download(&self, model_id: &str) -> bool {
        self.tracker.cancel(model_id)
    }

    pub async fn load_model(&self, model_id: &str) -> Result<(), StudioError> {
        self.call(
            Method::POST,
            &format!("/models/{model_id}/load"),
            Some(&json!({})),
            self.long_timeout,
        )
        .await
        .map(|_| ())
    }

    pub async fn unload_model(&self) -> Result<(), StudioError> {
        self.call(Method::POST, "/models/unload", Some(&json!({})), self.request_timeout)
            .await
            .map(|_| ())
    }

    /// Deletes through the server when it runs, otherwise removes the directory locally.
    pub async fn delete_model(&self, model_id: &str) -> Result<bool, StudioError> {
        if !is_speech_model(model_id) {
            return Err(StudioError::UnknownModel {
                model_id: model_id.to_string(),
            });
        }
        let client = self.server.client();

        if let Ok(status) = self.status().await {
            if status.current_model.as_deref() == Some(model_id) {
                if let Err(e) = client
                    .post("/models/unload", &json!({}), self.request_timeout)
                    .await
                {
                    safe_eprintln!("speech: unload before delete failed: {e}");
                }
            }
        }

        let path = format!("/models/{model_id}/delete");
        match client
            .request(Method::DELETE, &path, None, self.request_timeout)
            .await
        {
            Ok(v) => deleted(client.endpoint().name, &v),
            Err(StudioError::ServiceNotRunning { .. }) => self.delete_local(model_id),
            Err(e) => Err(e),
        }
    }

    fn delete_local(&self, model_id: &str) -> Result<bool, StudioError> {
        let dir = self.tts_models_dir.join(model_id);
        let removed = if dir.is_dir() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| StudioError::io(format!("delete {}", dir.display()), e))?;
            true
        } else {
            false
        };
        trace::event(
            &self.data_dir,
            Some(model_id),
            "Speech",
            "TTS.delete_local",
            if removed { "ok" } else { "skipped" },
            Some(json!({ "path": dir.display().to_string() })),
        );
        Ok(removed)
    }

    pub async fn list_voices(&self) -> Result<Vec<VoiceProfile>, StudioError> {
        let v = self.call(Method::GET, "/voices", None, self.request_timeout).await?;
        decode("tts voices", v)
    }

    pub async fn clone_voice(&self, req: &CloneVoiceRequest) -> Result<VoiceProfile, StudioError> {
        if !Path::new(&req.audio_path).is_file() {
            return Err(StudioError::io(
                format!("read {}", req.audio_path),
                "voice sample not found",
            ));
        }
        let body = serde_json::to_value(req).map_err(|e| StudioError::parse("clone request", e))?;
        let mut v = self
            .call(Method::POST, "/voices/clone", Some(&body), self.long_timeout)
            .await?;
        let voice = v.get_mut("voice").map(Value::take).unwrap_or_default();
        decode("cloned voice", voice)
    }

    /// False when the server had no such voice.
    pub async fn delete_voice(&self, voice_id: &str) -> Result<bool, StudioError> {
        let v = self
            .server
            .request(
                Method::DELETE,
                &format!("/voices/{voice_id}"),
                None,
                self.request_timeout,
            )
            .await?;
        deleted(self.server.endpoint().name, &v)
    }

    /// Synthesizes speech and returns the path of the written audio file.
    pub async fn generate(&self, req: &GenerateSpeechRequest) -> Result<PathBuf, StudioError> {
        let body = serde_json::to_value(req).map_err(|e| StudioError::parse("generate request", e))?;
        let v = self
            .call(Method::POST, "/generate", Some(&body), self.long_timeout)
            .await?;
        v.get("outputPath")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| StudioError::parse("tts generate", "missing outputPath"))
    }

    /// Synthesizes speech and writes the returned audio to `dest`. Returns the byte count.
    /// The file appears only once the whole body has arrived.
    pub async fn generate_to(
        &self,
        req: &GenerateSpeechRequest,
        dest: &Path,
    ) -> Result<u64, StudioError> {
        let body = serde_json::to_value(req).map_err(|e| StudioError::parse("generate request", e))?;
        let audio = self
            .server
            .request_bytes(Method::POST, "/generate/stream", Some(&body), self.long_timeout)
            .await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StudioError::io(format!("create {}", parent.display()), e))?;
        }
        let tmp = temp_path(dest);
        if let Err(e) = tokio::fs::write(&tmp, &audio).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StudioError::io(format!("write {}", tmp.display()), e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, dest).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StudioError::io(format!("rename to {}", dest.display()), e));
        }
        trace::event(
            &self.data_dir,
            None,
            "Speech",
            "TTS.generate_stream",
            "ok",
            Some(json!({ "path": dest.display().to_string(), "bytes": audio.len() })),
        );
        Ok(audio.len() as u64)
    }

    pub async fn list_speakers(&self) -> Result<Speakers, StudioError> {
        let v = self.call(Method::GET, "/speakers", None, self.request_timeout).await?;
        decode("tts speakers", v)
    }

    pub async fn list_languages(&self) -> Result<Value, StudioError> {
        self.call(Method::GET, "/languages", None, self.request_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studiokit_platform::ProcessSpec;
    use studiokit_providers::test_server::{self, Step, TestServer};

    use crate::backend::CommandLauncher;

    fn service_on(td: &tempfile::TempDir, port: u16) -> SpeechService {
        let cfg = StudioConfig::with_data_dir(td.path());
        let launcher = CommandLauncher::new(ProcessSpec::new("tts", "studiokit-missing-tts"));
        let server = BackendServer::new(
            TTS_ENDPOINT.with_port(port),
            Arc::new(launcher),
            FLASK_READY,
            Duration::from_secs(1),
            td.path(),
        );
        SpeechService::with_server(&cfg, server, JobTracker::new(td.path()))
    }

    async fn adopted(scripts: Vec<Vec<Step>>) -> (tempfile::TempDir, TestServer, SpeechService) {
        let td = tempfile::tempdir().expect("tempdir");
        let mut all = vec![test_server::json("200 OK", r#"{"status":"ok","service":"tts"}"#)];
        all.extend(scripts);
        let srv = test_server::serve(all).await;
        let svc = service_on(&td, srv.port);
        (td, srv, svc)
    }

    #[tokio::test]
    async fn status_reports_not_running_without_spawning() {
        let td = tempfile::tempdir().expect("tempdir");
        let svc = service_on(&td, test_server::closed_port().await);
        let st = svc.status().await.expect("status");
        assert!(!st.running);
        assert_eq!(svc.backend_status().await.state, crate::backend::BackendState::Stopped);
    }

    #[tokio::test]
    async fn voices_are_listed_from_a_running_server() {
        let (_td, srv, svc) = adopted(vec![test_server::json(
            "200 OK",
            r#"[{"id":"ab12cd34","name":"Narrator","description":"","sample_path":"/v/ab12cd34_sample.wav","created_at":"2026-01-01T00:00:00","language":"en","transcript":"","embedding_path":null}]"#,
        )])
        .await;
        let voices = svc.list_voices().await.expect("voices");
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].name, "Narrator");
        assert_eq!(srv.request_lines()[1], "GET /voices HTTP/1.1");
    }

    #[tokio::test]
    async fn business_failure_is_a_rejection_with_the_server_reason() {
        let (td, _srv, svc) = adopted(vec![test_server::json(
            "400 BAD REQUEST",
            r#"{"success":false,"error":"Audio file not found: /x.wav"}"#,
        )])
        .await;
        let sample = td.path().join("me.wav");
        std::fs::write(&sample, b"RIFF").expect("sample");
        let err = svc
            .clone_voice(&CloneVoiceRequest {
                audio_path: sample.display().to_string(),
                name: "Me".into(),
                description: String::new(),
                language: "en".into(),
                transcript: String::new(),
            })
            .await
            .expect_err("rejected");
        match err {
            StudioError::ServiceRejected { reason, .. } => assert!(reason.contains("Audio file not found")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn generate_returns_the_output_path() {
        let (_td, srv, svc) = adopted(vec![test_server::json(
            "200 OK",
            r#"{"success":true,"outputPath":"/out/speech_1.wav"}"#,
        )])
        .await;
        let path = svc
            .generate(&GenerateSpeechRequest::new("hello there"))
            .await
            .expect("generate");
        assert_eq!(path, PathBuf::from("/out/speech_1.wav"));
        assert_eq!(srv.request_lines()[1], "POST /generate HTTP/1.1");
    }

    #[tokio::test]
    async fn deleting_a_missing_voice_reports_false() {
        let (_td, srv, svc) = adopted(vec![
            test_server::json("200 OK", r#"{"success":true}"#),
            test_server::json("200 OK", r#"{"success":false}"#),
        ])
        .await;
        assert!(svc.delete_voice("ab12cd34").await.expect("delete"));
        assert!(!svc.delete_voice("ab12cd34").await.expect("delete again"));
        assert_eq!(srv.request_lines()[2], "DELETE /voices/ab12cd34 HTTP/1.1");
    }

    #[tokio::test]
    async fn deleting_a_missing_model_on_the_server_reports_false() {
        let td = tempfile::tempdir().expect("tempdir");
        let srv = test_server::serve(vec![
            test_server::json("200 OK", r#"{"running":true,"modelLoaded":false,"voiceCount":0}"#),
            test_server::json("200 OK", r#"{"success":false}"#),
        ])
        .await;
        let svc = service_on(&td, srv.port);
        assert!(!svc.delete_model("qwen3-tts-0.6b-base").await.expect("delete"));
        assert_eq!(
            srv.request_lines(),
            vec![
                "GET /status HTTP/1.1".to_string(),
                "DELETE /models/qwen3-tts-0.6b-base/delete HTTP/1.1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn delete_error_from_the_server_is_a_rejection() {
        let (_td, _srv, svc) = adopted(vec![test_server::json(
            "200 OK",
            r#"{"success":false,"error":"voices directory is read-only"}"#,
        )])
        .await;
        assert!(matches!(
            svc.delete_voice("ab12cd34").await,
            Err(StudioError::ServiceRejected { .. })
        ));
    }

    #[tokio::test]
    async fn streamed_generation_writes_the_audio_body() {
        let audio = b"RIFF\x24\x00\x00\x00WAVEfmt ";
        let mut reply = test_server::head(
            "200 OK",
            &[
                ("Content-Type", "audio/wav".to_string()),
                ("Content-Length", audio.len().to_string()),
            ],
        );
        reply.extend_from_slice(audio);
        let (td, srv, svc) = adopted(vec![vec![Step::Write(reply)]]).await;
        let dest = td.path().join("out").join("line.wav");
        let n = svc
            .generate_to(&GenerateSpeechRequest::new("hello there"), &dest)
            .await
            .expect("generate");
        assert_eq!(n, audio.len() as u64);
        assert_eq!(std::fs::read(&dest).expect("audio"), audio);
        assert!(!temp_path(&dest).exists());
        assert_eq!(srv.request_lines()[1], "POST /generate/stream HTTP/1.1");
    }

    #[tokio::test]
    async fn streamed_generation_failure_writes_nothing() {
        let (td, _srv, svc) = adopted(vec![test_server::json(
            "400 BAD REQUEST",
            r#"{"success":false,"error":"No model loaded"}"#,
        )])
        .await;
        let dest = td.path().join("line.wav");
        let err = svc
            .generate_to(&GenerateSpeechRequest::new("hello"), &dest)
            .await
            .expect_err("rejected");
        assert!(matches!(err, StudioError::ServiceRejected { ref reason, .. } if reason == "No model loaded"));
        assert!(!dest.exists());
        assert!(!temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn delete_model_falls_back_to_local_removal() {
        let td = tempfile::tempdir().expect("tempdir");
        let svc = service_on(&td, test_server::closed_port().await);
        let dir = td.path().join("models").join("tts").join("qwen3-tts-0.6b-base");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("model.safetensors"), b"w").expect("write");
        assert!(svc.delete_model("qwen3-tts-0.6b-base").await.expect("delete"));
        assert!(!dir.exists());
        assert!(!svc.delete_model("qwen3-tts-0.6b-base").await.expect("again"));
    }

    #[tokio::test]
    async fn recognition_ids_are_not_speech_models() {
        let td = tempfile::tempdir().expect("tempdir");
        let svc = service_on(&td, test_server::closed_port().await);
        assert!(matches!(
            svc.download_model("tiny").await,
            Err(StudioError::UnknownModel { .. })
        ));
    }

    #[tokio::test]
    async fn server_download_is_tracked_and_cancellable() {
        let (_td, _srv, svc) = adopted(vec![vec![Step::Sleep(3000)]]).await;
        let (out, cancelled) = tokio::join!(svc.download_model("qwen3-tts-0.6b-base"), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            svc.cancel_download("qwen3-tts-0.6b-base")
        });
        assert!(cancelled);
        assert!(out.expect("outcome").is_cancelled());
        assert!(!svc.cancel_download("qwen3-tts-0.6b-base"));
    }
}
