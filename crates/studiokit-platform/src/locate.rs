use std::{
    path::{Path, PathBuf},
    process::Command,
};

use serde::Serialize;
use serde_json::json;
use studiokit_observability::trace;

/// Filesystem and process access used while probing candidates.
pub trait ProgramProbe: Send + Sync {
    fn is_file(&self, path: &Path) -> bool;
    /// First non-empty line of `<program> <arg>`, stdout preferred over stderr.
    fn version_output(&self, program: &Path, arg: &str) -> Option<String>;
}

pub struct SystemProbe;

impl ProgramProbe for SystemProbe {
    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn version_output(&self, program: &Path, arg: &str) -> Option<String> {
        let out = Command::new(program).arg(arg).output().ok()?;
        if !out.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        let stderr = String::from_utf8_lossy(&out.stderr);
        let merged = if stdout.trim().is_empty() {
            stderr
        } else {
            stdout
        };
        merged
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    }
}

/// Ordered list of places a program may live, checked front to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub label: &'static str,
    pub paths: Vec<PathBuf>,
    /// Bare command name left to the OS search path when nothing matches.
    pub fallback: String,
    /// When set, a candidate only counts if `<candidate> --version` contains it.
    pub expect_version: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Located {
    pub label: String,
    pub program: PathBuf,
    pub version: Option<String>,
    /// False when the fallback name was returned without a successful check.
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub ready: bool,
    pub code: Option<String>,
    pub message: Option<String>,
    pub path: Option<String>,
    pub version: Option<String>,
}

fn is_bare_name(p: &Path) -> bool {
    p.components().count() == 1 && !p.is_absolute()
}

impl Candidate {
    pub fn resolve(&self, probe: &dyn ProgramProbe) -> Located {
        for path in &self.paths {
            if !is_bare_name(path) && !probe.is_file(path) {
                continue;
            }
            match self.expect_version {
                Some(expected) => {
                    if let Some(v) = probe.version_output(path, "--version") {
                        if v.contains(expected) {
                            return self.found(path.clone(), Some(v));
                        }
                    }
                }
                None if is_bare_name(path) => {
                    if let Some(v) = probe.version_output(path, "-version") {
                        return self.found(path.clone(), Some(v));
                    }
                }
                None => return self.found(path.clone(), None),
            }
        }
        Located {
            label: self.label.to_string(),
            program: PathBuf::from(&self.fallback),
            version: None,
            verified: false,
        }
    }

    fn found(&self, program: PathBuf, version: Option<String>) -> Located {
        Located {
            label: self.label.to_string(),
            program,
            version,
            verified: true,
        }
    }

    pub fn python(override_path: Option<PathBuf>, data_dir: &Path) -> Self {
        let mut paths: Vec<PathBuf> = override_path.into_iter().collect();
        if cfg!(windows) {
            paths.push(data_dir.join("venv").join("Scripts").join("python.exe"));
            paths.push(PathBuf::from("py"));
            paths.push(PathBuf::from("python"));
        } else {
            paths.push(data_dir.join("venv").join("bin").join("python3"));
            paths.push(PathBuf::from("/opt/homebrew/bin/python3"));
            paths.push(PathBuf::from("/usr/local/bin/python3"));
            paths.push(PathBuf::from("/usr/bin/python3"));
            paths.push(PathBuf::from("python3"));
        }
        Self {
            label: "python",
            paths,
            fallback: if cfg!(windows) { "python" } else { "python3" }.to_string(),
            expect_version: Some("Python 3"),
        }
    }

    pub fn ffmpeg(override_path: Option<PathBuf>, data_dir: &Path) -> Self {
        Self::binary("ffmpeg", "ffmpeg", override_path, data_dir)
    }

    pub fn whisper(override_path: Option<PathBuf>, data_dir: &Path) -> Self {
        Self::binary("whisper", "whisper-cli", override_path, data_dir)
    }

    pub fn ollama(override_path: Option<PathBuf>, data_dir: &Path) -> Self {
        Self::binary("ollama", "ollama", override_path, data_dir)
    }

    fn binary(
        label: &'static str,
        name: &str,
        override_path: Option<PathBuf>,
        data_dir: &Path,
    ) -> Self {
        let exe = if cfg!(windows) {
            format!("{name}.exe")
        } else {
            name.to_string()
        };
        let mut paths: Vec<PathBuf> = override_path.into_iter().collect();
        paths.push(data_dir.join("bin").join(&exe));
        if !cfg!(windows) {
            paths.push(PathBuf::from("/opt/homebrew/bin").join(&exe));
            paths.push(PathBuf::from("/usr/local/bin").join(&exe));
            paths.push(PathBuf::from("/usr/bin").join(&exe));
        }
        Self {
            label,
            paths,
            fallback: exe,
            expect_version: None,
        }
    }
}

impl Located {
    pub fn status(&self, not_ready_code: &str) -> RuntimeStatus {
        if self.verified {
            RuntimeStatus {
                ready: true,
                code: None,
                message: None,
                path: Some(self.program.display().to_string()),
                version: self.version.clone(),
            }
        } else {
            RuntimeStatus {
                ready: false,
                code: Some(not_ready_code.to_string()),
                message: Some(format!(
                    "{} not found; relying on `{}` from PATH",
                    self.label,
                    self.program.display()
                )),
                path: None,
                version: None,
            }
        }
    }
}

/// Resolves and records the lookup in the trace.
pub fn resolve_traced(data_dir: &Path, candidate: &Candidate, probe: &dyn ProgramProbe) -> Located {
    let located = candidate.resolve(probe);
    trace::event(
        data_dir,
        None,
        "Locate",
        &format!("LOCATE.{}", candidate.label),
        if located.verified { "ok" } else { "skipped" },
        Some(json!({
            "program": located.program.display().to_string(),
            "version": located.version,
            "candidates": candidate.paths.len(),
        })),
    );
    located
}
