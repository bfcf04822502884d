use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Error as AnyhowError;
use serde::Serialize;
use serde_json::{json, Map, Value};

const DEFAULT_MAX_BYTES: u64 = 10_000_000;
const DEFAULT_MAX_FILES: usize = 5;
const BACKTRACE_MAX_CHARS: usize = 12_000;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => {
            let t = v.trim().to_ascii_lowercase();
            if t.is_empty() {
                return default;
            }
            !matches!(t.as_str(), "0" | "false" | "no" | "off")
        }
        Err(_) => default,
    }
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub fn enabled() -> bool {
    env_flag("STUDIOKIT_TRACE_ENABLED", true)
}

fn backtrace_enabled() -> bool {
    env_flag("STUDIOKIT_TRACE_BACKTRACE", true)
}

pub fn trace_path(data_dir: &Path) -> PathBuf {
    data_dir.join("trace.jsonl")
}

fn rotated_path(data_dir: &Path, n: usize) -> PathBuf {
    data_dir.join(format!("trace.jsonl.{n}"))
}

fn rotate_if_needed(data_dir: &Path) {
    let max_files: usize = env_num("STUDIOKIT_TRACE_MAX_FILES", DEFAULT_MAX_FILES);
    if max_files == 0 {
        return;
    }
    let p = trace_path(data_dir);
    let len = match std::fs::metadata(&p) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if len <= env_num("STUDIOKIT_TRACE_MAX_BYTES", DEFAULT_MAX_BYTES) {
        return;
    }

    // Oldest goes first so renames never land on an existing file (Windows).
    let _ = std::fs::remove_file(rotated_path(data_dir, max_files));
    for i in (1..max_files).rev() {
        let src = rotated_path(data_dir, i);
        if src.exists() {
            let _ = std::fs::rename(&src, rotated_path(data_dir, i + 1));
        }
    }
    let _ = std::fs::rename(&p, rotated_path(data_dir, 1));
}

fn write_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceError {
    pub kind: String, // process|http|io|parse|logic
    pub code: String, // E_*
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub ts_ms: i64,
    pub job_key: Option<String>,
    pub stage: String,
    pub step_id: String,
    pub op: String,     // start|end|event
    pub status: String, // ok|err|skipped|aborted
    pub duration_ms: Option<u128>,
    pub error: Option<TraceError>,
    pub ctx: Option<Value>,
}

pub fn emit_best_effort(data_dir: &Path, ev: &TraceEvent) {
    if !enabled() {
        return;
    }
    let mut line = match serde_json::to_string(ev) {
        Ok(s) => s,
        Err(e) => {
            crate::safe_eprintln!("trace: serialize failed: {e}");
            return;
        }
    };
    line.push('\n');

    let _guard = write_lock().lock().unwrap();
    let _ = std::fs::create_dir_all(data_dir);
    rotate_if_needed(data_dir);
    let p = trace_path(data_dir);
    let res = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&p)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(e) = res {
        crate::safe_eprintln!("trace: write failed: {}: {e}", p.display());
    }
}

fn clamp_chars(s: &str, max_chars: usize) -> String {
    s.chars().filter(|c| *c != '\0').take(max_chars).collect()
}

fn redact_user_paths(s: &str) -> String {
    // Scrubs the account name segment after common home dir prefixes.
    fn scrub_after(hay: &str, marker: &str, sep: char) -> String {
        let mut out = String::with_capacity(hay.len());
        let mut rest = hay;
        while let Some(pos) = rest.find(marker) {
            out.push_str(&rest[..pos + marker.len()]);
            out.push_str("<redacted>");
            let tail = &rest[pos + marker.len()..];
            let end = tail.find(sep).unwrap_or(tail.len());
            rest = &tail[end..];
        }
        out.push_str(rest);
        out
    }

    let t = scrub_after(s, "\\Users\\", '\\');
    let t = scrub_after(&t, "/Users/", '/');
    scrub_after(&t, "/home/", '/')
}

fn backtrace_string() -> Option<String> {
    if !backtrace_enabled() {
        return None;
    }
    let bt = std::backtrace::Backtrace::force_capture();
    Some(clamp_chars(
        &redact_user_paths(&format!("{bt:?}")),
        BACKTRACE_MAX_CHARS,
    ))
}

fn merge_ctx(mut base: Map<String, Value>, extra: Option<Value>) -> Option<Value> {
    match extra {
        None if base.is_empty() => None,
        None => Some(Value::Object(base)),
        Some(Value::Object(m)) => {
            base.extend(m);
            Some(Value::Object(base))
        }
        Some(v) => {
            base.insert("extra".to_string(), v);
            Some(Value::Object(base))
        }
    }
}

fn with_backtrace(extra: Option<Value>) -> Option<Value> {
    let mut m = Map::new();
    if let Some(bt) = backtrace_string() {
        m.insert("backtrace".to_string(), json!(bt));
    }
    merge_ctx(m, extra)
}

pub fn event(
    data_dir: &Path,
    job_key: Option<&str>,
    stage: &str,
    step_id: &str,
    status: &str,
    ctx: Option<Value>,
) {
    emit_best_effort(
        data_dir,
        &TraceEvent {
            ts_ms: now_ms(),
            job_key: job_key.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            op: "event".to_string(),
            status: status.to_string(),
            duration_ms: None,
            error: None,
            ctx,
        },
    );
}

/// Timed operation; emits `start` now and exactly one `end` later.
pub struct Span {
    data_dir: PathBuf,
    job_key: Option<String>,
    stage: String,
    step_id: String,
    t0: Instant,
    finished: bool,
}

impl Span {
    pub fn start(
        data_dir: &Path,
        job_key: Option<&str>,
        stage: &str,
        step_id: &str,
        ctx: Option<Value>,
    ) -> Self {
        let span = Self {
            data_dir: data_dir.to_path_buf(),
            job_key: job_key.map(str::to_string),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            t0: Instant::now(),
            finished: false,
        };
        span.emit("start", "ok", None, None, ctx);
        span
    }

    fn emit(
        &self,
        op: &str,
        status: &str,
        duration_ms: Option<u128>,
        error: Option<TraceError>,
        ctx: Option<Value>,
    ) {
        emit_best_effort(
            &self.data_dir,
            &TraceEvent {
                ts_ms: now_ms(),
                job_key: self.job_key.clone(),
                stage: self.stage.clone(),
                step_id: self.step_id.clone(),
                op: op.to_string(),
                status: status.to_string(),
                duration_ms,
                error,
                ctx,
            },
        );
    }

    fn finish(&mut self, status: &str, error: Option<TraceError>, ctx: Option<Value>) {
        self.finished = true;
        let elapsed = self.t0.elapsed().as_millis();
        self.emit("end", status, Some(elapsed), error, ctx);
    }

    pub fn ok(mut self, ctx: Option<Value>) {
        self.finish("ok", None, ctx);
    }

    pub fn skipped(mut self, reason: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: "logic".to_string(),
            code: "SKIPPED".to_string(),
            message: reason.to_string(),
        };
        self.finish("skipped", Some(error), ctx);
    }

    pub fn err(mut self, kind: &str, code: &str, message: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        };
        self.finish("err", Some(error), with_backtrace(ctx));
    }

    pub fn err_anyhow(mut self, kind: &str, code: &str, err: &AnyhowError, ctx: Option<Value>) {
        let mut m = Map::new();
        let chain: Vec<String> = err.chain().map(|e| e.to_string()).collect();
        m.insert("err_chain".to_string(), json!(chain));
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: err.to_string(),
        };
        self.finish("err", Some(error), with_backtrace(merge_ctx(m, ctx)));
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let error = TraceError {
            kind: "logic".to_string(),
            code: "ABORTED".to_string(),
            message: "span dropped without explicit ok/err".to_string(),
        };
        self.finish("aborted", Some(error), with_backtrace(None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, thread};

    fn read_lines(dir: &Path) -> Vec<Value> {
        let raw = fs::read_to_string(trace_path(dir)).expect("read trace");
        raw.lines()
            .map(|l| serde_json::from_str(l).expect("valid json line"))
            .collect()
    }

    #[test]
    fn concurrent_emit_keeps_jsonl_lines_parseable() {
        let td = tempfile::tempdir().expect("tempdir");
        let dir = td.path().to_path_buf();
        let threads = 8;
        let per_thread = 100;

        let joins: Vec<_> = (0..threads)
            .map(|i| {
                let dir2 = dir.clone();
                thread::spawn(move || {
                    for j in 0..per_thread {
                        event(
                            &dir2,
                            Some("ggml-tiny"),
                            "TraceTest",
                            "TRACE.concurrent",
                            "ok",
                            Some(json!({"i": i, "j": j})),
                        );
                    }
                })
            })
            .collect();
        for j in joins {
            j.join().expect("join");
        }

        let lines = read_lines(&dir);
        assert_eq!(lines.len(), threads * per_thread);
        assert!(lines.iter().all(|v| v["job_key"] == "ggml-tiny"));
    }

    #[test]
    fn dropped_span_is_recorded_as_aborted() {
        let td = tempfile::tempdir().expect("tempdir");
        {
            let _span = Span::start(td.path(), None, "Test", "TEST.drop", None);
        }
        Span::start(td.path(), Some("k"), "Test", "TEST.ok", None).ok(Some(json!({"n": 1})));

        let lines = read_lines(td.path());
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1]["status"], "aborted");
        assert_eq!(lines[1]["error"]["code"], "ABORTED");
        assert_eq!(lines[3]["op"], "end");
        assert_eq!(lines[3]["status"], "ok");
        assert_eq!(lines[3]["ctx"]["n"], 1);
    }

    #[test]
    fn redaction_hides_account_names() {
        let s = redact_user_paths("at /home/alice/src/lib.rs and C:\\Users\\bob\\x.rs");
        assert!(!s.contains("alice"));
        assert!(!s.contains("bob"));
        assert!(s.contains("/home/<redacted>/src/lib.rs"));
    }
}
