use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Serialize;

pub fn metrics_path(data_dir: &Path) -> PathBuf {
    data_dir.join("metrics.jsonl")
}

pub fn append_jsonl<T: Serialize>(data_dir: &Path, obj: &T) -> Result<()> {
    std::fs::create_dir_all(data_dir).context("create data dir failed")?;
    let p = metrics_path(data_dir);
    let mut line = serde_json::to_string(obj).context("serialize metrics json failed")?;
    line.push('\n');
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&p)
        .with_context(|| format!("open metrics jsonl failed: {}", p.display()))?;
    f.write_all(line.as_bytes())
        .context("write metrics line failed")?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct JobDone<'a> {
    r#type: &'static str,
    key: &'a str,
    kind: &'a str,
    status: &'a str,
    elapsed_ms: u128,
}

/// Records a finished job; failures only reach stderr.
pub fn job_done_best_effort(data_dir: &Path, key: &str, kind: &str, status: &str, elapsed_ms: u128) {
    let rec = JobDone {
        r#type: "job_done",
        key,
        kind,
        status,
        elapsed_ms,
    };
    if let Err(e) = append_jsonl(data_dir, &rec) {
        crate::safe_eprintln!("metrics: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_done_appends_one_line_per_call() {
        let td = tempfile::tempdir().expect("tempdir");
        job_done_best_effort(td.path(), "tiny", "download", "succeeded", 12);
        job_done_best_effort(td.path(), "a.wav", "transcription", "cancelled", 3);
        let raw = std::fs::read_to_string(metrics_path(td.path())).expect("read");
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "job_done");
        assert_eq!(lines[1]["status"], "cancelled");
    }
}
