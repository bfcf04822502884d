use std::{path::PathBuf, time::Duration};

const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_LONG_REQUEST_TIMEOUT_MS: u64 = 600_000;

/// Runtime settings, resolved from `STUDIOKIT_*` environment variables.
#[derive(Debug, Clone)]
pub struct StudioConfig {
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
    pub voices_dir: PathBuf,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub python: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
    pub whisper: Option<PathBuf>,
    pub ollama: Option<PathBuf>,
    pub startup_timeout: Duration,
    pub request_timeout: Duration,
    pub long_request_timeout: Duration,
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_ms(key: &str, default: u64) -> Duration {
    let ms = std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default);
    Duration::from_millis(ms)
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"));
    match home {
        Some(h) => PathBuf::from(h).join(".studiokit"),
        None => PathBuf::from("studiokit-data"),
    }
}

impl StudioConfig {
    /// Layout rooted at `data_dir`, default timeouts, no program overrides.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            models_dir: data_dir.join("models"),
            voices_dir: data_dir.join("voices"),
            output_dir: data_dir.join("output"),
            temp_dir: data_dir.join("tmp"),
            scripts_dir: data_dir.join("scripts"),
            data_dir,
            python: None,
            ffmpeg: None,
            whisper: None,
            ollama: None,
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            long_request_timeout: Duration::from_millis(DEFAULT_LONG_REQUEST_TIMEOUT_MS),
        }
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::with_data_dir(env_path("STUDIOKIT_DATA_DIR").unwrap_or_else(default_data_dir));
        if let Some(p) = env_path("STUDIOKIT_SCRIPTS_DIR") {
            cfg.scripts_dir = p;
        }
        cfg.python = env_path("STUDIOKIT_PYTHON");
        cfg.ffmpeg = env_path("STUDIOKIT_FFMPEG");
        cfg.whisper = env_path("STUDIOKIT_WHISPER");
        cfg.ollama = env_path("STUDIOKIT_OLLAMA");
        cfg.startup_timeout = env_ms("STUDIOKIT_STARTUP_TIMEOUT_MS", DEFAULT_STARTUP_TIMEOUT_MS);
        cfg.request_timeout = env_ms("STUDIOKIT_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS);
        cfg.long_request_timeout = env_ms(
            "STUDIOKIT_LONG_REQUEST_TIMEOUT_MS",
            DEFAULT_LONG_REQUEST_TIMEOUT_MS,
        );
        cfg
    }

    pub fn tts_models_dir(&self) -> PathBuf {
        self.models_dir.join("tts")
    }
}

#[cfg(test)]
pub(crate) fn env_lock() -> &'static std::sync::Mutex<()> {
    static LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| std::sync::Mutex::new(()))
}
