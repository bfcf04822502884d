use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use serde_json::{json, Value};
use studiokit_core::{timecode, JobKind, Outcome, StudioError};
use studiokit_observability::{safe_eprintln, trace::Span};
use studiokit_platform::{
    locate::{resolve_traced, Candidate, ProgramProbe},
    recognition_threads, ManagedProcess, ProcessSpec,
};
use tokio_util::sync::CancellationToken;

use crate::{config::StudioConfig, jobs::JobTracker, models::ModelStore};

/// Extensions the recognizer reads directly; everything else is converted to WAV first.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["flac", "mp3", "ogg", "wav"];

const NO_OUTPUT_PLACEHOLDER: &str = "[no transcription output produced]";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub text: String,
    pub segments: Vec<Segment>,
    /// The recognizer exited cleanly but wrote nothing usable.
    pub degraded: bool,
}

/// Deletes the file when dropped.
struct TempArtifact(PathBuf);

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                safe_eprintln!("transcription: failed to remove {}: {e}", self.0.display());
            }
        }
    }
}

pub fn needs_conversion(audio: &Path) -> bool {
    let ext = audio
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    !matches!(ext.as_deref(), Some(e) if SUPPORTED_EXTENSIONS.contains(&e))
}

fn scratch_name(prefix: &str) -> String {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{ms}-{}", &id[..8])
}

/// One recognizer process per request, with optional ffmpeg conversion in front.
pub struct TranscriptionService {
    data_dir: PathBuf,
    temp_dir: PathBuf,
    ffmpeg: Candidate,
    whisper: Candidate,
    probe: Arc<dyn ProgramProbe>,
    models: Arc<ModelStore>,
    tracker: JobTracker,
    threads: usize,
}

impl TranscriptionService {
    pub fn new(
        cfg: &StudioConfig,
        models: Arc<ModelStore>,
        tracker: JobTracker,
        probe: Arc<dyn ProgramProbe>,
    ) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            data_dir: cfg.data_dir.clone(),
            temp_dir: cfg.temp_dir.clone(),
            ffmpeg: Candidate::ffmpeg(cfg.ffmpeg.clone(), &cfg.data_dir),
            whisper: Candidate::whisper(cfg.whisper.clone(), &cfg.data_dir),
            probe,
            models,
            tracker,
            threads: recognition_threads(cores),
        }
    }

    pub fn with_programs(mut self, ffmpeg: Candidate, whisper: Candidate) -> Self {
        self.ffmpeg = ffmpeg;
        self.whisper = whisper;
        self
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Transcribes `audio` as a job keyed by its path.
    pub async fn transcribe(
        &self,
        audio: &Path,
        model_id: &str,
        language: Option<&str>,
        mut on_progress: impl FnMut(u8),
    ) -> Result<Outcome<Transcript>, StudioError> {
        if !audio.is_file() {
            return Err(StudioError::io(
                format!("read {}", audio.display()),
                "audio file not found",
            ));
        }
        let model = self.models.installed_path(model_id)?;
        let key = audio.display().to_string();
        let tracker = self.tracker.clone();

        self.tracker
            .run(&key, JobKind::Transcription, |tok| async move {
                let span = Span::start(
                    &self.data_dir,
                    Some(tok.key()),
                    "Transcription",
                    "ASR.transcribe",
                    Some(json!({ "model": model_id, "language": language })),
                );
                let res = self
                    .transcribe_inner(audio, &model, language, tok.cancellation(), |p| {
                        if let Some(p) = tracker.update_progress(&tok, p) {
                            on_progress(p);
                        }
                    })
                    .await;
                match &res {
                    Ok(Outcome::Completed(t)) => span.ok(Some(json!({
                        "chars": t.text.chars().count(),
                        "segments": t.segments.len(),
                        "degraded": t.degraded,
                    }))),
                    Ok(Outcome::Cancelled) => span.skipped("cancelled", None),
                    Err(e) => span.err(e.kind(), e.code(), &e.to_string(), None),
                }
                res
            })
            .await
    }

    pub fn cancel(&self, audio: &Path) -> bool {
        self.tracker.cancel(&audio.display().to_string())
    }

    async fn transcribe_inner(
        &self,
        audio: &Path,
        model: &Path,
        language: Option<&str>,
        token: &CancellationToken,
        mut on_progress: impl FnMut(u8),
    ) -> Result<Outcome<Transcript>, StudioError> {
        std::fs::create_dir_all(&self.temp_dir)
            .map_err(|e| StudioError::io(format!("create {}", self.temp_dir.display()), e))?;

        // Guards drop on every exit path, including spawn failures below.
        let converted = if needs_conversion(audio) {
            let wav = TempArtifact(self.temp_dir.join(format!("{}.wav", scratch_name("convert"))));
            if self.convert(audio, &wav.0, token).await?.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            Some(wav)
        } else {
            None
        };
        let input = converted.as_ref().map_or(audio, |w| w.0.as_path());

        let base = self.temp_dir.join(scratch_name("transcript"));
        let json_out = TempArtifact(base.with_extension("json"));
        let txt_out = TempArtifact(base.with_extension("txt"));

        let whisper = resolve_traced(&self.data_dir, &self.whisper, self.probe.as_ref());
        let mut spec = ProcessSpec::new("whisper", whisper.program)
            .arg("-m")
            .arg(model.display().to_string())
            .arg("-f")
            .arg(input.display().to_string())
            .arg("-oj")
            .arg("-of")
            .arg(base.display().to_string());
        if let Some(lang) = language.filter(|l| !l.trim().is_empty()) {
            spec = spec.arg("-l").arg(lang);
        }
        spec = spec.arg("-t").arg(self.threads.to_string());

        let run = ManagedProcess::run_once(&self.data_dir, &spec, token, |line| {
            if let Some(p) = timecode::parse_percent(line) {
                on_progress(p);
            }
        })
        .await?;
        if run.cancelled {
            return Ok(Outcome::Cancelled);
        }
        if !run.exit.success {
            return Err(StudioError::RecognitionFailed {
                exit_code: run.exit.code,
                stderr_tail: run.stderr_tail,
            });
        }
        read_output(&json_out.0, &txt_out.0).map(Outcome::Completed)
    }

    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<Outcome<()>, StudioError> {
        let ffmpeg = resolve_traced(&self.data_dir, &self.ffmpeg, self.probe.as_ref());
        let spec = ProcessSpec::new("ffmpeg", ffmpeg.program).args([
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-ar".to_string(),
            "16000".to_string(),
            "-ac".to_string(),
            "1".to_string(),
            "-c:a".to_string(),
            "pcm_s16le".to_string(),
            output.display().to_string(),
        ]);
        let span = Span::start(
            &self.data_dir,
            None,
            "Transcription",
            "ASR.convert",
            Some(json!({ "input": input.display().to_string() })),
        );
        let run = match ManagedProcess::run_once(&self.data_dir, &spec, token, |_| {}).await {
            Ok(r) => r,
            Err(e) => {
                let err = StudioError::ConversionFailed {
                    input: input.display().to_string(),
                    reason: e.to_string(),
                };
                span.err(err.kind(), err.code(), &err.to_string(), None);
                return Err(err);
            }
        };
        if run.cancelled {
            span.skipped("cancelled", None);
            return Ok(Outcome::Cancelled);
        }
        if !run.exit.success || !output.is_file() {
            let err = StudioError::ConversionFailed {
                input: input.display().to_string(),
                reason: if run.stderr_tail.is_empty() {
                    format!("ffmpeg exit={:?}", run.exit.code)
                } else {
                    run.stderr_tail
                },
            };
            span.err(err.kind(), err.code(), &err.to_string(), None);
            return Err(err);
        }
        span.ok(None);
        Ok(Outcome::Completed(()))
    }
}

fn read_output(json_path: &Path, txt_path: &Path) -> Result<Transcript, StudioError> {
    let json_err = match std::fs::read_to_string(json_path) {
        Ok(raw) => match parse_recognizer_json(&raw) {
            Ok(t) => return Ok(t),
            Err(e) => Some(e),
        },
        Err(_) => None,
    };
    if let Ok(raw) = std::fs::read_to_string(txt_path) {
        return Ok(Transcript {
            text: raw.trim().to_string(),
            segments: Vec::new(),
            degraded: false,
        });
    }
    if let Some(e) = json_err {
        return Err(e);
    }
    Ok(Transcript {
        text: NO_OUTPUT_PLACEHOLDER.to_string(),
        segments: Vec::new(),
        degraded: true,
    })
}

fn bound(seg: &Value, which: &str) -> Option<f64> {
    if let Some(ms) = seg.get("offsets").and_then(|o| o.get(which)).and_then(Value::as_f64) {
        return Some(ms / 1000.0);
    }
    seg.get("timestamps")
        .and_then(|t| t.get(which))
        .and_then(Value::as_str)
        .and_then(timecode::parse_timestamp)
}

/// Accepts `{text}` or a `transcription`/`segments` array.
pub fn parse_recognizer_json(raw: &str) -> Result<Transcript, StudioError> {
    let v: Value = serde_json::from_str(raw).map_err(|e| StudioError::parse("recognizer json", e))?;
    let items = v
        .get("transcription")
        .or_else(|| v.get("segments"))
        .and_then(Value::as_array);

    let segments: Vec<Segment> = items
        .map(|arr| {
            arr.iter()
                .map(|seg| Segment {
                    start: bound(seg, "from").unwrap_or(0.0),
                    end: bound(seg, "to").unwrap_or(0.0),
                    text: seg
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    let text = match v.get("text").and_then(Value::as_str) {
        Some(t) => t.trim().to_string(),
        None if items.is_some() => segments
            .iter()
            .map(|s| s.text.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        None => {
            return Err(StudioError::parse(
                "recognizer json",
                "neither `text` nor a segment array present",
            ))
        }
    };
    Ok(Transcript {
        text,
        segments,
        degraded: false,
    })
}
