use std::{future::Future, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use studiokit_core::{digest, Outcome, StudioError};
use studiokit_engine::{GenerateRequest, GenerateSpeechRequest, Studio, StudioConfig};
use studiokit_observability::{safe_eprintln, trace::Span};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "studiokit")]
#[command(about = "Drive the local speech, video and LLM services", long_about = None)]
struct Cli {
    /// Overrides STUDIOKIT_DATA_DIR
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// CPU, memory and GPU snapshot
    Probe,
    /// Where python, ffmpeg, whisper and ollama were found
    Runtime,
    /// Model catalog with download state and recommendations
    Models,
    /// Download a recognition model from the catalog
    Download { id: String },
    /// Remove a downloaded model
    Delete { id: String },
    /// Transcribe an audio file
    Transcribe {
        file: PathBuf,
        #[arg(long, default_value = "base")]
        model: String,
        /// Language code passed to the recognizer (e.g. en, de)
        #[arg(long)]
        language: Option<String>,
    },
    /// TTS server status
    SpeechStatus,
    /// Voice profiles known to the TTS server
    Voices,
    /// Synthesize speech to a file in the output directory
    Say {
        text: String,
        #[arg(long)]
        voice: Option<String>,
        #[arg(long, default_value = "English")]
        language: String,
        /// Stream the audio into this file instead of the server's output directory
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Score a video
    Analyze {
        video: PathBuf,
        /// Technical checks only
        #[arg(long, default_value_t = false)]
        quick: bool,
    },
    /// Pull a model into the LLM runtime
    Pull { model: String },
    /// Generate text with the LLM runtime
    Generate {
        #[arg(long)]
        model: String,
        #[arg(long)]
        prompt: String,
    },
    /// sha256 of a file, for filling in catalog checksums
    Checksum { file: PathBuf },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Runtime => "runtime",
            Self::Models => "models",
            Self::Download { .. } => "download",
            Self::Delete { .. } => "delete",
            Self::Transcribe { .. } => "transcribe",
            Self::SpeechStatus => "speech_status",
            Self::Voices => "voices",
            Self::Say { .. } => "say",
            Self::Analyze { .. } => "analyze",
            Self::Pull { .. } => "pull",
            Self::Generate { .. } => "generate",
            Self::Checksum { .. } => "checksum",
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_outcome<T: Serialize>(outcome: Outcome<T>) -> Result<()> {
    match outcome {
        Outcome::Completed(v) => print_json(&v),
        Outcome::Cancelled => print_json(&json!({ "cancelled": true })),
    }
}

fn studio_err(e: StudioError) -> anyhow::Error {
    let hint = e.user_message();
    anyhow::Error::new(e).context(hint)
}

fn progress(label: &str) -> impl FnMut(u8) + '_ {
    move |p| safe_eprintln!("{label}: {p}%")
}

async fn run(studio: &Studio, command: Commands) -> Result<()> {
    match command {
        Commands::Probe => print_json(&studio.hardware().await.map_err(studio_err)?),
        Commands::Runtime => print_json(&studio.runtime_status().await.map_err(studio_err)?),
        Commands::Models => print_json(&studio.model_overview().await.map_err(studio_err)?),
        Commands::Download { id } => {
            let out = studio
                .models()
                .download(&id, progress(&id))
                .await
                .map_err(studio_err)?;
            print_outcome(out.map(|p| json!({ "id": id, "path": p.display().to_string() })))
        }
        Commands::Delete { id } => {
            let removed = studio.models().delete(&id).map_err(studio_err)?;
            print_json(&json!({ "id": id, "removed": removed }))
        }
        Commands::Transcribe {
            file,
            model,
            language,
        } => {
            let label = file.display().to_string();
            let out = studio
                .transcription
                .transcribe(&file, &model, language.as_deref(), progress(&label))
                .await
                .map_err(studio_err)?;
            print_outcome(out)
        }
        Commands::SpeechStatus => print_json(&studio.speech.status().await.map_err(studio_err)?),
        Commands::Voices => print_json(&studio.speech.list_voices().await.map_err(studio_err)?),
        Commands::Say {
            text,
            voice,
            language,
            out,
        } => {
            let mut req = GenerateSpeechRequest::new(text);
            req.voice_id = voice;
            req.language = language;
            match out {
                Some(dest) => {
                    let bytes = studio.speech.generate_to(&req, &dest).await.map_err(studio_err)?;
                    print_json(&json!({ "output": dest.display().to_string(), "bytes": bytes }))
                }
                None => {
                    let path = studio.speech.generate(&req).await.map_err(studio_err)?;
                    print_json(&json!({ "output": path.display().to_string() }))
                }
            }
        }
        Commands::Analyze { video, quick } => {
            if quick {
                print_json(&studio.video.analyze_quick(&video).await.map_err(studio_err)?)
            } else {
                print_outcome(studio.video.analyze(&video).await.map_err(studio_err)?)
            }
        }
        Commands::Pull { model } => {
            let out = studio
                .llm
                .pull_model(&model, progress(&model))
                .await
                .map_err(studio_err)?;
            print_outcome(out.map(|()| json!({ "model": model, "pulled": true })))
        }
        Commands::Generate { model, prompt } => {
            let token = CancellationToken::new();
            let out = studio
                .llm
                .generate(&GenerateRequest::new(model, prompt), &token, |t| {
                    safe_eprintln!("{t}")
                })
                .await
                .map_err(studio_err)?;
            print_outcome(out.map(|text| json!({ "text": text })))
        }
        Commands::Checksum { file } => {
            let sha256 = digest::sha256_file_hex(&file)
                .with_context(|| format!("hash {}", file.display()))?;
            print_json(&json!({ "file": file.display().to_string(), "sha256": sha256 }))
        }
    }
}

/// Ctrl-C drops the running command, then shuts the studio down.
async fn interruptible(fut: impl Future<Output = Result<()>>) -> Result<()> {
    tokio::select! {
        r = fut => r,
        _ = tokio::signal::ctrl_c() => {
            safe_eprintln!("interrupted");
            print_json(&json!({ "cancelled": true }))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = StudioConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config = StudioConfig {
            python: config.python,
            ffmpeg: config.ffmpeg,
            whisper: config.whisper,
            ollama: config.ollama,
            startup_timeout: config.startup_timeout,
            request_timeout: config.request_timeout,
            long_request_timeout: config.long_request_timeout,
            ..StudioConfig::with_data_dir(dir)
        };
    }
    let studio = Studio::new(config);
    let span = Span::start(
        &studio.config().data_dir,
        None,
        "Cli",
        &format!("CLI.{}", cli.command.name()),
        None,
    );
    let res = interruptible(run(&studio, cli.command)).await;
    match &res {
        Ok(()) => span.ok(None),
        Err(e) => span.err_anyhow("cli", "E_CLI", e, None),
    }
    studio.shutdown().await;
    res
}
