use std::path::{Path, PathBuf};

use serde::Serialize;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Recognition,
    Speech,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    /// Single file fetched by the local download engine.
    File {
        file_name: &'static str,
        url: &'static str,
        sha256: Option<&'static str>,
    },
    /// Directory snapshot fetched by the owning service (the TTS server).
    Repository {
        dir_name: &'static str,
        repo: &'static str,
    },
}

/// Static catalog entry. Installed state is derived from the filesystem on demand.
#[derive(Debug, Clone, Copy)]
pub struct ModelDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub family: ModelFamily,
    pub size_bytes: u64,
    pub ram_required_bytes: u64,
    pub source: ModelSource,
    pub recommended_if: fn(available_ram: u64) -> bool,
}

impl ModelDescriptor {
    /// Final artifact location under the models root.
    pub fn install_path(&self, models_dir: &Path) -> PathBuf {
        match self.source {
            ModelSource::File { file_name, .. } => models_dir.join(file_name),
            ModelSource::Repository { dir_name, .. } => models_dir.join("tts").join(dir_name),
        }
    }

    pub fn is_installed(&self, models_dir: &Path) -> bool {
        let p = self.install_path(models_dir);
        match self.source {
            ModelSource::File { .. } => p.is_file(),
            ModelSource::Repository { .. } => p.is_dir(),
        }
    }

    pub fn is_recommended(&self, available_ram: u64) -> bool {
        (self.recommended_if)(available_ram)
    }

    pub fn download_url(&self) -> Option<&'static str> {
        match self.source {
            ModelSource::File { url, .. } => Some(url),
            ModelSource::Repository { .. } => None,
        }
    }

    pub fn sha256(&self) -> Option<&'static str> {
        match self.source {
            ModelSource::File { sha256, .. } => sha256,
            ModelSource::Repository { .. } => None,
        }
    }
}

fn always(_: u64) -> bool {
    true
}

fn at_least_4gb(ram: u64) -> bool {
    ram >= 4 * GIB
}

fn at_least_8gb(ram: u64) -> bool {
    ram >= 8 * GIB
}

fn at_least_16gb(ram: u64) -> bool {
    ram >= 16 * GIB
}

fn under_4gb(ram: u64) -> bool {
    ram < 4 * GIB
}

// Whisper SHA-256 hashes from https://huggingface.co/ggerganov/whisper.cpp
pub static CATALOG: &[ModelDescriptor] = &[
    ModelDescriptor {
        id: "tiny",
        name: "Whisper Tiny",
        family: ModelFamily::Recognition,
        size_bytes: 77_691_713,
        ram_required_bytes: 390 * MIB,
        source: ModelSource::File {
            file_name: "ggml-tiny.bin",
            url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-tiny.bin",
            sha256: None,
        },
        recommended_if: under_4gb,
    },
    ModelDescriptor {
        id: "base",
        name: "Whisper Base",
        family: ModelFamily::Recognition,
        size_bytes: 147_951_465,
        ram_required_bytes: 500 * MIB,
        source: ModelSource::File {
            file_name: "ggml-base.bin",
            url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.bin",
            sha256: None,
        },
        recommended_if: always,
    },
    ModelDescriptor {
        id: "small",
        name: "Whisper Small",
        family: ModelFamily::Recognition,
        size_bytes: 487_601_967,
        ram_required_bytes: 800 * MIB,
        source: ModelSource::File {
            file_name: "ggml-small.bin",
            url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-small.bin",
            sha256: Some("1be3a9b2063867b937e64e2ec7483364a79917e157fa98c5d94b5c1fffea987b"),
        },
        recommended_if: at_least_4gb,
    },
    ModelDescriptor {
        id: "medium",
        name: "Whisper Medium",
        family: ModelFamily::Recognition,
        size_bytes: 1_533_763_059,
        ram_required_bytes: 2200 * MIB,
        source: ModelSource::File {
            file_name: "ggml-medium.bin",
            url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-medium.bin",
            sha256: Some("6c14d5adee5f86394037b4e4e8b59f1673b6cee10e3cf0b11bbdbee79c156208"),
        },
        recommended_if: at_least_8gb,
    },
    ModelDescriptor {
        id: "large-v3-turbo",
        name: "Whisper Large v3 Turbo",
        family: ModelFamily::Recognition,
        size_bytes: 1_624_555_275,
        ram_required_bytes: 2500 * MIB,
        source: ModelSource::File {
            file_name: "ggml-large-v3-turbo.bin",
            url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-large-v3-turbo.bin",
            sha256: Some("1fc70f774d38eb169993ac391eea357ef47c88757ef72ee5943879b7e8e2bc69"),
        },
        recommended_if: at_least_8gb,
    },
    ModelDescriptor {
        id: "large-v3",
        name: "Whisper Large v3",
        family: ModelFamily::Recognition,
        size_bytes: 3_095_033_483,
        ram_required_bytes: 4000 * MIB,
        source: ModelSource::File {
            file_name: "ggml-large-v3.bin",
            url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-large-v3.bin",
            sha256: Some("64d182b440b98d5203c4f9bd541544d84c605196c4f7b845dfa11fb23594d1e2"),
        },
        recommended_if: at_least_16gb,
    },
    ModelDescriptor {
        id: "qwen3-tts-0.6b-base",
        name: "Qwen3-TTS 0.6B (Clone)",
        family: ModelFamily::Speech,
        size_bytes: 1_288_490_189,
        ram_required_bytes: 4 * GIB,
        source: ModelSource::Repository {
            dir_name: "qwen3-tts-0.6b-base",
            repo: "Qwen/Qwen3-TTS-12Hz-0.6B-Base",
        },
        recommended_if: at_least_8gb,
    },
    ModelDescriptor {
        id: "qwen3-tts-0.6b-custom",
        name: "Qwen3-TTS 0.6B (Presets)",
        family: ModelFamily::Speech,
        size_bytes: 1_288_490_189,
        ram_required_bytes: 4 * GIB,
        source: ModelSource::Repository {
            dir_name: "qwen3-tts-0.6b-custom",
            repo: "Qwen/Qwen3-TTS-12Hz-0.6B-CustomVoice",
        },
        recommended_if: at_least_8gb,
    },
    ModelDescriptor {
        id: "qwen3-tts-1.7b-base",
        name: "Qwen3-TTS 1.7B (Clone)",
        family: ModelFamily::Speech,
        size_bytes: 3_650_722_201,
        ram_required_bytes: 8 * GIB,
        source: ModelSource::Repository {
            dir_name: "qwen3-tts-1.7b-base",
            repo: "Qwen/Qwen3-TTS-12Hz-1.7B-Base",
        },
        recommended_if: at_least_16gb,
    },
    ModelDescriptor {
        id: "qwen3-tts-1.7b-custom",
        name: "Qwen3-TTS 1.7B (Presets)",
        family: ModelFamily::Speech,
        size_bytes: 3_650_722_201,
        ram_required_bytes: 8 * GIB,
        source: ModelSource::Repository {
            dir_name: "qwen3-tts-1.7b-custom",
            repo: "Qwen/Qwen3-TTS-12Hz-1.7B-CustomVoice",
        },
        recommended_if: at_least_16gb,
    },
    ModelDescriptor {
        id: "qwen3-tts-1.7b-design",
        name: "Qwen3-TTS 1.7B (Design)",
        family: ModelFamily::Speech,
        size_bytes: 3_650_722_201,
        ram_required_bytes: 8 * GIB,
        source: ModelSource::Repository {
            dir_name: "qwen3-tts-1.7b-design",
            repo: "Qwen/Qwen3-TTS-12Hz-1.7B-VoiceDesign",
        },
        recommended_if: at_least_16gb,
    },
];

pub fn find(id: &str) -> Option<&'static ModelDescriptor> {
    CATALOG.iter().find(|m| m.id == id)
}

pub fn recommended(available_ram: u64) -> Vec<&'static ModelDescriptor> {
    CATALOG
        .iter()
        .filter(|m| m.is_recommended(available_ram))
        .collect()
}
