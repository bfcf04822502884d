use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use studiokit_core::{ServerEndpoint, StudioError};
use studiokit_observability::trace::{self, Span};
use studiokit_platform::{
    locate::{resolve_traced, Candidate, ProgramProbe},
    ManagedProcess, ProcessSpec, ProcessState, ReadySignal,
};
use studiokit_providers::LoopbackClient;
use tokio::sync::Mutex;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Builds the command line for one backing server.
pub trait Launcher: Send + Sync {
    fn command(&self) -> Result<ProcessSpec, StudioError>;

    /// Lets a launcher turn spawn failures into something more specific.
    fn map_spawn_error(&self, err: StudioError) -> StudioError {
        err
    }
}

/// `python3 <script>` with an env overlay; the interpreter comes from the candidate list.
pub struct PythonScriptLauncher {
    name: String,
    python: Candidate,
    script: PathBuf,
    env: Vec<(String, String)>,
    data_dir: PathBuf,
    probe: Arc<dyn ProgramProbe>,
}

impl PythonScriptLauncher {
    pub fn new(
        name: &str,
        python: Candidate,
        script: PathBuf,
        data_dir: &Path,
        probe: Arc<dyn ProgramProbe>,
    ) -> Self {
        Self {
            name: name.to_string(),
            python,
            script,
            env: Vec::new(),
            data_dir: data_dir.to_path_buf(),
            probe,
        }
    }

    pub fn env(mut self, k: &str, v: impl Into<String>) -> Self {
        self.env.push((k.to_string(), v.into()));
        self
    }
}

impl Launcher for PythonScriptLauncher {
    fn command(&self) -> Result<ProcessSpec, StudioError> {
        if !self.script.is_file() {
            return Err(StudioError::ProcessSpawnFailed {
                program: self.script.display().to_string(),
                message: "server script not found".to_string(),
                not_found: true,
            });
        }
        let py = resolve_traced(&self.data_dir, &self.python, self.probe.as_ref());
        let mut spec = ProcessSpec::new(&self.name, py.program)
            .arg(self.script.display().to_string());
        if let Some(dir) = self.script.parent() {
            spec = spec.current_dir(dir);
        }
        for (k, v) in &self.env {
            spec = spec.env(k.clone(), v.clone());
        }
        Ok(spec)
    }

    fn map_spawn_error(&self, err: StudioError) -> StudioError {
        match err {
            StudioError::ProcessSpawnFailed {
                program,
                message,
                not_found: true,
            } if program != self.script.display().to_string() => {
                StudioError::InterpreterUnavailable { program, message }
            }
            other => other,
        }
    }
}

/// Fixed program plus arguments.
pub struct CommandLauncher {
    spec: ProcessSpec,
}

impl CommandLauncher {
    pub fn new(spec: ProcessSpec) -> Self {
        Self { spec }
    }
}

impl Launcher for CommandLauncher {
    fn command(&self) -> Result<ProcessSpec, StudioError> {
        Ok(self.spec.clone())
    }
}

enum Slot {
    Idle,
    Owned(ManagedProcess),
    /// Someone else's server already answering on our port.
    Adopted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Stopped,
    Ready,
    Adopted,
    Crashed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub url: String,
    pub state: BackendState,
    pub pid: Option<u32>,
}

/// One long-running backing server: lazy start, adoption, and teardown.
pub struct BackendServer {
    endpoint: ServerEndpoint,
    client: LoopbackClient,
    launcher: Arc<dyn Launcher>,
    ready_substring: String,
    startup_timeout: Duration,
    data_dir: PathBuf,
    // Held across the whole start so concurrent callers share one spawn.
    slot: Mutex<Slot>,
}

impl BackendServer {
    pub fn new(
        endpoint: ServerEndpoint,
        launcher: Arc<dyn Launcher>,
        ready_substring: &str,
        startup_timeout: Duration,
        data_dir: &Path,
    ) -> Self {
        Self {
            endpoint,
            client: LoopbackClient::new(endpoint),
            launcher,
            ready_substring: ready_substring.to_string(),
            startup_timeout,
            data_dir: data_dir.to_path_buf(),
            slot: Mutex::new(Slot::Idle),
        }
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub fn client(&self) -> &LoopbackClient {
        &self.client
    }

    /// Starts the server unless it is already up. Safe to call concurrently.
    pub async fn ensure_ready(&self) -> Result<(), StudioError> {
        let mut slot = self.slot.lock().await;
        match &*slot {
            Slot::Owned(p) if p.is_ready() => return Ok(()),
            Slot::Adopted => return Ok(()),
            _ => {}
        }

        if self.client.is_healthy(HEALTH_PROBE_TIMEOUT).await {
            trace::event(
                &self.data_dir,
                None,
                "Backend",
                "BACKEND.adopt",
                "ok",
                Some(json!({ "name": self.endpoint.name, "url": self.endpoint.base_url() })),
            );
            *slot = Slot::Adopted;
            return Ok(());
        }

        let span = Span::start(
            &self.data_dir,
            None,
            "Backend",
            "BACKEND.ensure_ready",
            Some(json!({ "name": self.endpoint.name, "port": self.endpoint.port })),
        );
        let spec = match self.launcher.command() {
            Ok(s) => s,
            Err(e) => {
                span.err(e.kind(), e.code(), &e.to_string(), None);
                return Err(e);
            }
        };
        let ready = ReadySignal {
            substring: self.ready_substring.clone(),
            timeout: self.startup_timeout,
        };
        match ManagedProcess::start(&self.data_dir, &spec, &ready).await {
            Ok(p) => {
                span.ok(Some(json!({ "pid": p.pid() })));
                *slot = Slot::Owned(p);
                Ok(())
            }
            Err(e) => {
                let e = self.launcher.map_spawn_error(e);
                span.err(e.kind(), e.code(), &e.to_string(), None);
                *slot = Slot::Idle;
                Err(e)
            }
        }
    }

    /// `ensure_ready` followed by one JSON request. A refused connection to an adopted
    /// server makes the next call probe and spawn again.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, StudioError> {
        self.ensure_ready().await?;
        let res = self.client.request(method, path, body, timeout).await;
        self.forget_if_refused(res).await
    }

    /// `request` for endpoints that answer with a file body.
    pub async fn request_bytes(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Vec<u8>, StudioError> {
        self.ensure_ready().await?;
        let res = self.client.request_bytes(method, path, body, timeout).await;
        self.forget_if_refused(res).await
    }

    async fn forget_if_refused<T>(&self, res: Result<T, StudioError>) -> Result<T, StudioError> {
        if let Err(StudioError::ServiceNotRunning { .. }) = &res {
            let mut slot = self.slot.lock().await;
            if matches!(*slot, Slot::Adopted) {
                *slot = Slot::Idle;
            }
        }
        res
    }

    /// Graceful stop of a server this instance spawned. Adopted servers are only forgotten.
    pub async fn stop(&self) -> bool {
        let mut slot = self.slot.lock().await;
        let prev = std::mem::replace(&mut *slot, Slot::Idle);
        let stopped = match prev {
            Slot::Owned(p) => {
                // A stopping handle can be dropped; the grace-period kill runs on its own.
                let running = p.is_running();
                p.stop();
                running
            }
            Slot::Adopted | Slot::Idle => false,
        };
        trace::event(
            &self.data_dir,
            None,
            "Backend",
            "BACKEND.stop",
            if stopped { "ok" } else { "skipped" },
            Some(json!({ "name": self.endpoint.name })),
        );
        stopped
    }

    pub async fn status(&self) -> BackendStatus {
        let slot = self.slot.lock().await;
        let (state, pid) = match &*slot {
            Slot::Idle => (BackendState::Stopped, None),
            Slot::Adopted => (BackendState::Adopted, None),
            Slot::Owned(p) => match p.state() {
                ProcessState::Ready => (BackendState::Ready, p.pid()),
                ProcessState::Crashed => (BackendState::Crashed, p.pid()),
                _ => (BackendState::Stopped, p.pid()),
            },
        };
        BackendStatus {
            name: self.endpoint.name.to_string(),
            url: self.endpoint.base_url(),
            state,
            pid,
        }
    }
}
