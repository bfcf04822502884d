use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use serde_json::json;
use studiokit_core::StudioError;
use studiokit_observability::trace::{self, Span};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::signal::signal_pid;

const TAIL_LINES: usize = 40;
const READER_DRAIN: Duration = Duration::from_millis(500);
const KILL_WAIT: Duration = Duration::from_secs(5);
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
    Crashed,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.env.push((k.into(), v.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ReadySignal {
    pub substring: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit: ExitInfo,
    pub cancelled: bool,
    pub stderr_tail: String,
    pub tail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

// Poisoned locks are recovered; every write leaves the guarded data consistent.
fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    state: Mutex<ProcessState>,
    tail: Mutex<VecDeque<(Stream, String)>>,
    ready_tx: watch::Sender<bool>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    oneshot: bool,
}

impl Shared {
    fn set_state(&self, next: ProcessState) {
        *locked(&self.state) = next;
    }

    fn push_line(&self, stream: Stream, line: &str) {
        let mut tail = locked(&self.tail);
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back((stream, line.to_string()));
    }

    fn mark_ready(&self) {
        let mut st = locked(&self.state);
        if *st == ProcessState::Starting {
            *st = ProcessState::Ready;
        }
        drop(st);
        self.ready_tx.send_replace(true);
    }

    fn mark_exited(&self) -> ProcessState {
        let mut st = locked(&self.state);
        *st = match *st {
            ProcessState::Starting => ProcessState::Failed,
            ProcessState::Ready if self.oneshot => ProcessState::Stopped,
            ProcessState::Ready => ProcessState::Crashed,
            ProcessState::Stopping => ProcessState::Stopped,
            other => other,
        };
        *st
    }

    fn tail_text(&self, only: Option<Stream>) -> String {
        let tail = locked(&self.tail);
        tail.iter()
            .filter(|(s, _)| only.map_or(true, |o| o == *s))
            .map(|(_, l)| l.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One spawned external program. Dropping a live handle kills the process.
pub struct ManagedProcess {
    name: String,
    pid: Option<u32>,
    data_dir: PathBuf,
    shared: Arc<Shared>,
    kill: CancellationToken,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl ManagedProcess {
    /// Spawns a long-running server and resolves once `ready.substring` shows up in its output.
    pub async fn start(
        data_dir: &Path,
        spec: &ProcessSpec,
        ready: &ReadySignal,
    ) -> Result<Self, StudioError> {
        let span = Span::start(
            data_dir,
            None,
            "Process",
            "PROC.start",
            Some(json!({
                "name": spec.name,
                "program": spec.program.display().to_string(),
                "timeout_ms": ready.timeout.as_millis() as u64,
            })),
        );
        let proc = match spawn(data_dir, spec, Some(ready.substring.clone()), None) {
            Ok(p) => p,
            Err(e) => {
                span.err(e.kind(), e.code(), &e.to_string(), None);
                return Err(e);
            }
        };

        let mut ready_rx = proc.shared.ready_tx.subscribe();
        let mut exit_rx = proc.exit_rx.clone();
        let waited = tokio::time::timeout(ready.timeout, async {
            loop {
                if *ready_rx.borrow_and_update() {
                    return Ok(());
                }
                if let Some(info) = *exit_rx.borrow_and_update() {
                    return Err(info);
                }
                tokio::select! {
                    _ = ready_rx.changed() => {}
                    res = exit_rx.changed() => {
                        if res.is_err() {
                            return Err(ExitInfo { code: None, success: false });
                        }
                    }
                }
            }
        })
        .await;

        match waited {
            Ok(Ok(())) => {
                span.ok(Some(json!({ "pid": proc.pid })));
                Ok(proc)
            }
            Ok(Err(info)) => {
                let err = StudioError::ProcessCrashed {
                    name: spec.name.clone(),
                    exit_code: info.code,
                    tail: proc.tail(),
                };
                span.err(err.kind(), err.code(), &err.to_string(), None);
                Err(err)
            }
            Err(_) => {
                proc.shared.set_state(ProcessState::Failed);
                proc.kill.cancel();
                let _ = tokio::time::timeout(KILL_WAIT, proc.wait_exit()).await;
                let err = StudioError::ProcessStartTimeout {
                    name: spec.name.clone(),
                    timeout_ms: ready.timeout.as_millis() as u64,
                };
                span.err(
                    err.kind(),
                    err.code(),
                    &err.to_string(),
                    Some(json!({ "tail": proc.tail() })),
                );
                Err(err)
            }
        }
    }

    /// Runs a program to completion, forwarding each output line. Cancelling `token` kills it.
    pub async fn run_once(
        data_dir: &Path,
        spec: &ProcessSpec,
        token: &CancellationToken,
        mut on_line: impl FnMut(&str),
    ) -> Result<RunOutput, StudioError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let proc = spawn(data_dir, spec, None, Some(tx))?;

        let mut cancelled = false;
        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(l) => on_line(&l),
                    None => break,
                },
                _ = token.cancelled(), if !cancelled => {
                    cancelled = true;
                    proc.kill();
                }
            }
        }
        let exit = proc.wait_exit().await;
        Ok(RunOutput {
            exit,
            cancelled: cancelled || token.is_cancelled(),
            stderr_tail: proc.shared.tail_text(Some(Stream::Stderr)),
            tail: proc.tail(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *locked(&self.shared.state)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ProcessState::Ready
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Last captured lines of stdout and stderr, oldest first.
    pub fn tail(&self) -> String {
        self.shared.tail_text(None)
    }

    /// Graceful termination; a forced kill follows if the process is still alive after a grace period.
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        self.shared.set_state(ProcessState::Stopping);
        if let Some(pid) = self.pid {
            if let Err(e) = signal_pid(pid, true) {
                trace::event(
                    &self.data_dir,
                    None,
                    "Process",
                    "PROC.stop",
                    "err",
                    Some(json!({ "name": self.name, "pid": pid, "error": e.to_string() })),
                );
            }
        }
        let kill = self.kill.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(h) => {
                h.spawn(async move {
                    tokio::time::sleep(STOP_GRACE).await;
                    kill.cancel();
                });
            }
            Err(_) => kill.cancel(),
        }
    }

    /// Forced termination.
    pub fn kill(&self) {
        if self.is_running() {
            self.shared.set_state(ProcessState::Stopping);
        }
        self.kill.cancel();
    }

    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(info) = *rx.borrow_and_update() {
                return info;
            }
            if rx.changed().await.is_err() {
                return ExitInfo {
                    code: None,
                    success: false,
                };
            }
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if matches!(self.state(), ProcessState::Starting | ProcessState::Ready) {
            self.kill.cancel();
        }
    }
}

fn spawn(
    data_dir: &Path,
    spec: &ProcessSpec,
    ready: Option<String>,
    lines: Option<mpsc::UnboundedSender<String>>,
) -> Result<ManagedProcess, StudioError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .env("PYTHONUNBUFFERED", "1")
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.current_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| StudioError::ProcessSpawnFailed {
        program: spec.program.display().to_string(),
        message: e.to_string(),
        not_found: e.kind() == std::io::ErrorKind::NotFound,
    })?;
    let pid = child.id();

    let oneshot = ready.is_none();
    let (exit_tx, exit_rx) = watch::channel(None);
    let (ready_tx, _) = watch::channel(oneshot);
    let shared = Arc::new(Shared {
        state: Mutex::new(if oneshot {
            ProcessState::Ready
        } else {
            ProcessState::Starting
        }),
        tail: Mutex::new(VecDeque::with_capacity(TAIL_LINES)),
        ready_tx,
        exit_tx,
        oneshot,
    });

    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(tokio::spawn(pump(
            out,
            Stream::Stdout,
            shared.clone(),
            ready.clone(),
            lines.clone(),
        )));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(tokio::spawn(pump(
            err,
            Stream::Stderr,
            shared.clone(),
            ready,
            lines,
        )));
    }

    trace::event(
        data_dir,
        None,
        "Process",
        "PROC.spawn",
        "ok",
        Some(json!({ "name": spec.name, "pid": pid, "args": spec.args })),
    );

    let kill = CancellationToken::new();
    tokio::spawn(reap(
        child,
        readers,
        shared.clone(),
        kill.clone(),
        data_dir.to_path_buf(),
        spec.name.clone(),
    ));

    Ok(ManagedProcess {
        name: spec.name.clone(),
        pid,
        data_dir: data_dir.to_path_buf(),
        shared,
        kill,
        exit_rx,
    })
}

async fn pump<R: AsyncRead + Unpin>(
    stream: R,
    which: Stream,
    shared: Arc<Shared>,
    ready: Option<String>,
    lines: Option<mpsc::UnboundedSender<String>>,
) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let text = String::from_utf8_lossy(&buf);
        // Progress meters redraw with '\r'; each redraw counts as a line.
        for line in text.split(['\r', '\n']).filter(|l| !l.trim().is_empty()) {
            shared.push_line(which, line);
            if let Some(needle) = ready.as_deref() {
                if line.contains(needle) {
                    shared.mark_ready();
                }
            }
            if let Some(tx) = &lines {
                let _ = tx.send(line.to_string());
            }
        }
    }
}

async fn reap(
    mut child: tokio::process::Child,
    readers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    kill: CancellationToken,
    data_dir: PathBuf,
    name: String,
) {
    let waited = tokio::select! {
        s = child.wait() => Some(s),
        _ = kill.cancelled() => None,
    };
    let status = match waited {
        Some(s) => s,
        None => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    // A grandchild can inherit the pipes and keep them open past the exit.
    for mut r in readers {
        if tokio::time::timeout(READER_DRAIN, &mut r).await.is_err() {
            r.abort();
        }
    }

    let info = match status {
        Ok(s) => ExitInfo {
            code: s.code(),
            success: s.success(),
        },
        Err(_) => ExitInfo {
            code: None,
            success: false,
        },
    };
    let state = shared.mark_exited();
    let ok = matches!(state, ProcessState::Stopped) || info.success;
    let tail = if ok {
        String::new()
    } else {
        shared.tail_text(None)
    };
    trace::event(
        &data_dir,
        None,
        "Process",
        "PROC.exit",
        if ok { "ok" } else { "err" },
        Some(json!({
            "name": name,
            "code": info.code,
            "state": state,
            "tail": tail,
        })),
    );
    shared.exit_tx.send_replace(Some(info));
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> ProcessSpec {
        ProcessSpec::new(name, "sh").args(["-c", script])
    }

    fn ready(timeout_ms: u64) -> ReadySignal {
        ReadySignal {
            substring: "Running on".to_string(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn pid_alive(pid: &str) -> bool {
        std::process::Command::new("kill")
            .args(["-0", pid])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn start_resolves_on_ready_line_while_process_keeps_running() {
        let td = tempfile::tempdir().expect("tempdir");
        let spec = sh(
            "tts",
            "echo booting; echo ' * Running on http://127.0.0.1:8765' >&2; exec sleep 30",
        );
        let p = ManagedProcess::start(td.path(), &spec, &ready(10_000))
            .await
            .expect("start");
        assert!(p.is_ready());
        assert!(p.is_running());
        assert!(p.tail().contains("booting"));

        p.stop();
        let info = tokio::time::timeout(Duration::from_secs(10), p.wait_exit())
            .await
            .expect("exit after stop");
        assert!(!info.success);
        assert_eq!(p.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn start_times_out_and_kills_silent_process() {
        let td = tempfile::tempdir().expect("tempdir");
        let pid_file = td.path().join("pid");
        let spec = sh(
            "tts",
            &format!("echo $$ > '{}'; echo loading; exec sleep 30", pid_file.display()),
        );
        let err = ManagedProcess::start(td.path(), &spec, &ready(400))
            .await
            .err()
            .expect("timeout error");
        assert!(matches!(err, StudioError::ProcessStartTimeout { timeout_ms: 400, .. }));

        let pid = std::fs::read_to_string(&pid_file).expect("pid file");
        assert!(!pid_alive(pid.trim()));
    }

    #[tokio::test]
    async fn exit_before_ready_reports_output_tail() {
        let td = tempfile::tempdir().expect("tempdir");
        let spec = sh(
            "video-analysis",
            "echo 'ModuleNotFoundError: No module named flask' >&2; exit 1",
        );
        let err = ManagedProcess::start(td.path(), &spec, &ready(10_000))
            .await
            .err()
            .expect("crash error");
        match err {
            StudioError::ProcessCrashed { exit_code, tail, .. } => {
                assert_eq!(exit_code, Some(1));
                assert!(tail.contains("flask"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn exit_after_ready_is_a_crash() {
        let td = tempfile::tempdir().expect("tempdir");
        let spec = sh("tts", "echo 'Running on'; sleep 0.2; exit 3");
        let p = ManagedProcess::start(td.path(), &spec, &ready(10_000))
            .await
            .expect("start");
        let info = p.wait_exit().await;
        assert_eq!(info.code, Some(3));
        assert_eq!(p.state(), ProcessState::Crashed);
        assert!(!p.is_ready());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_failure() {
        let td = tempfile::tempdir().expect("tempdir");
        let spec = ProcessSpec::new("x", td.path().join("does-not-exist"));
        let err = ManagedProcess::start(td.path(), &spec, &ready(1_000))
            .await
            .err()
            .expect("spawn error");
        assert!(matches!(
            err,
            StudioError::ProcessSpawnFailed { not_found: true, .. }
        ));
    }

    #[tokio::test]
    async fn run_once_forwards_lines_and_exit_code() {
        let td = tempfile::tempdir().expect("tempdir");
        let spec = sh("whisper", "echo 'progress = 10%'; echo 'progress = 55%'; echo boom >&2; exit 2");
        let mut seen = Vec::new();
        let out = ManagedProcess::run_once(td.path(), &spec, &CancellationToken::new(), |l| {
            seen.push(l.to_string())
        })
        .await
        .expect("run");
        assert_eq!(out.exit.code, Some(2));
        assert!(!out.cancelled);
        assert_eq!(out.stderr_tail, "boom");
        assert!(seen.contains(&"progress = 55%".to_string()));
    }

    #[tokio::test]
    async fn run_once_returns_when_a_grandchild_keeps_the_pipes_open() {
        let td = tempfile::tempdir().expect("tempdir");
        let spec = sh("ffmpeg", "sleep 20 & echo started");
        let mut seen = Vec::new();
        let out = tokio::time::timeout(
            Duration::from_secs(5),
            ManagedProcess::run_once(td.path(), &spec, &CancellationToken::new(), |l| {
                seen.push(l.to_string())
            }),
        )
        .await
        .expect("not held by the grandchild")
        .expect("run");
        assert!(out.exit.success);
        assert_eq!(seen, vec!["started".to_string()]);
    }

    #[tokio::test]
    async fn run_once_cancel_kills_process() {
        let td = tempfile::tempdir().expect("tempdir");
        let token = CancellationToken::new();
        let t2 = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            t2.cancel();
        });
        let out = tokio::time::timeout(
            Duration::from_secs(10),
            ManagedProcess::run_once(td.path(), &sh("whisper", "exec sleep 30"), &token, |_| {}),
        )
        .await
        .expect("finished")
        .expect("run");
        assert!(out.cancelled);
        assert!(!out.exit.success);
    }
}
