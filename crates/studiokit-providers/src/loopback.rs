use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use studiokit_core::{Outcome, ServerEndpoint, StudioError};
use tokio_util::sync::CancellationToken;

use crate::ndjson::NdjsonDecoder;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STREAM_IDLE: Duration = Duration::from_secs(120);
/// Field concatenated into the streamed result (token-by-token generation).
pub const STREAM_TEXT_FIELD: &str = "response";

/// JSON and NDJSON client bound to one loopback endpoint.
#[derive(Clone)]
pub struct LoopbackClient {
    endpoint: ServerEndpoint,
    http: reqwest::Client,
    stream_idle: Duration,
}

fn snippet(s: &str) -> String {
    let t = s.trim();
    if t.chars().count() <= 200 {
        return t.to_string();
    }
    let cut: String = t.chars().take(200).collect();
    format!("{cut}...")
}

impl LoopbackClient {
    pub fn new(endpoint: ServerEndpoint) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            endpoint,
            http,
            stream_idle: DEFAULT_STREAM_IDLE,
        }
    }

    pub fn with_stream_idle_timeout(mut self, idle: Duration) -> Self {
        self.stream_idle = idle;
        self
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    /// Sends one request and parses the body as JSON. Non-2xx answers become `ServiceRejected`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, StudioError> {
        let (status, raw) = self.fetch(method, path, body, timeout).await?;
        let text = String::from_utf8_lossy(&raw);
        if !status.is_success() {
            return Err(self.rejection(status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| StudioError::parse(format!("{} {path}", self.endpoint.name), e))
    }

    /// Sends one request and returns the raw body, for endpoints that answer with a file.
    /// Error answers still carry JSON and become `ServiceRejected`.
    pub async fn request_bytes(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Vec<u8>, StudioError> {
        let (status, raw) = self.fetch(method, path, body, timeout).await?;
        if !status.is_success() {
            return Err(self.rejection(status, &String::from_utf8_lossy(&raw)));
        }
        Ok(raw)
    }

    /// Like `request`, but a plain-text body comes back as `Value::String`.
    pub async fn request_lenient(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, StudioError> {
        let (status, raw) = self.fetch(method, path, body, timeout).await?;
        let text = String::from_utf8_lossy(&raw);
        if !status.is_success() {
            return Err(self.rejection(status, &text));
        }
        Ok(serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.trim().to_string())))
    }

    pub async fn get(&self, path: &str, timeout: Duration) -> Result<Value, StudioError> {
        self.request(Method::GET, path, None, timeout).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, StudioError> {
        self.request(Method::POST, path, Some(body), timeout).await
    }

    /// True when the health path answers with a 2xx.
    pub async fn is_healthy(&self, timeout: Duration) -> bool {
        self.request_lenient(Method::GET, self.endpoint.health_path, None, timeout)
            .await
            .is_ok()
    }

    /// Consumes an NDJSON response, handing each well-formed line to `on_chunk`.
    /// Returns the concatenated `response` fields.
    pub async fn request_stream(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        on_chunk: impl FnMut(&Value),
    ) -> Result<String, StudioError> {
        let token = CancellationToken::new();
        let out = self
            .request_stream_cancellable(method, path, body, &token, on_chunk)
            .await?;
        Ok(out.completed().unwrap_or_default())
    }

    pub async fn request_stream_cancellable(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: &CancellationToken,
        mut on_chunk: impl FnMut(&Value),
    ) -> Result<Outcome<String>, StudioError> {
        let mut req = self.http.request(method, self.endpoint.url(path));
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = tokio::select! {
            r = req.send() => r.map_err(|e| self.transport_error(path, e, CONNECT_TIMEOUT))?,
            _ = token.cancelled() => return Ok(Outcome::Cancelled),
        };
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(self.rejection(status, &text));
        }

        let mut stream = resp.bytes_stream();
        let mut decoder = NdjsonDecoder::new();
        let mut text = String::new();
        loop {
            let next = tokio::select! {
                n = tokio::time::timeout(self.stream_idle, stream.next()) => n,
                _ = token.cancelled() => return Ok(Outcome::Cancelled),
            };
            let item = match next {
                Ok(item) => item,
                Err(_) => {
                    return Err(StudioError::RequestTimeout {
                        service: self.endpoint.name.to_string(),
                        path: path.to_string(),
                        timeout_ms: self.stream_idle.as_millis() as u64,
                    })
                }
            };
            match item {
                Some(Ok(bytes)) => {
                    for v in decoder.push(&bytes) {
                        self.dispatch(&v, &mut text, &mut on_chunk)?;
                    }
                }
                Some(Err(e)) => return Err(self.transport_error(path, e, self.stream_idle)),
                None => break,
            }
        }
        if let Some(v) = decoder.finish() {
            self.dispatch(&v, &mut text, &mut on_chunk)?;
        }
        Ok(Outcome::Completed(text))
    }

    fn dispatch(
        &self,
        chunk: &Value,
        text: &mut String,
        on_chunk: &mut impl FnMut(&Value),
    ) -> Result<(), StudioError> {
        // Servers report mid-stream failures as a line carrying `error`.
        if let Some(reason) = chunk.get("error").and_then(Value::as_str) {
            return Err(StudioError::ServiceRejected {
                service: self.endpoint.name.to_string(),
                reason: reason.to_string(),
            });
        }
        if let Some(piece) = chunk.get(STREAM_TEXT_FIELD).and_then(Value::as_str) {
            text.push_str(piece);
        }
        on_chunk(chunk);
        Ok(())
    }

    async fn fetch(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<(StatusCode, Vec<u8>), StudioError> {
        let mut req = self.http.request(method, self.endpoint.url(path));
        if let Some(b) = body {
            req = req.json(b);
        }
        let call = async {
            let resp = req.send().await?;
            let status = resp.status();
            let raw = resp.bytes().await?;
            Ok::<_, reqwest::Error>((status, raw.to_vec()))
        };
        // Dropping the future on expiry aborts the connection.
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(self.transport_error(path, e, timeout)),
            Err(_) => Err(StudioError::RequestTimeout {
                service: self.endpoint.name.to_string(),
                path: path.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn transport_error(&self, path: &str, e: reqwest::Error, timeout: Duration) -> StudioError {
        let service = self.endpoint.name.to_string();
        if e.is_timeout() {
            StudioError::RequestTimeout {
                service,
                path: path.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else if e.is_connect() {
            StudioError::ServiceNotRunning {
                service,
                message: e.to_string(),
            }
        } else {
            StudioError::io(format!("{service} {path}"), e)
        }
    }

    fn rejection(&self, status: StatusCode, body: &str) -> StudioError {
        let reason = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), snippet(body)));
        StudioError::ServiceRejected {
            service: self.endpoint.name.to_string(),
            reason,
        }
    }
}

/// Maps a `{success:false, error}` body to `ServiceRejected`.
pub fn expect_success(service: &str, v: Value) -> Result<Value, StudioError> {
    if v.get("success").and_then(Value::as_bool) == Some(false) {
        let reason = v
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string();
        return Err(StudioError::ServiceRejected {
            service: service.to_string(),
            reason,
        });
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::{self, Step};
    use serde_json::json;
    use studiokit_core::TTS_ENDPOINT;

    fn client(port: u16) -> LoopbackClient {
        LoopbackClient::new(TTS_ENDPOINT.with_port(port))
    }

    const T: Duration = Duration::from_secs(5);

    fn ndjson_head() -> Vec<u8> {
        test_server::head("200 OK", &[("Content-Type", "application/x-ndjson".to_string())])
    }

    #[tokio::test]
    async fn request_parses_json_body() {
        let srv = test_server::serve(vec![test_server::json(
            "200 OK",
            r#"{"success":true,"outputPath":"/tmp/a.wav"}"#,
        )])
        .await;
        let v = client(srv.port)
            .post("/generate", &json!({"text": "hi"}), T)
            .await
            .expect("request");
        assert_eq!(v["outputPath"], "/tmp/a.wav");
        assert_eq!(srv.request_lines(), vec!["POST /generate HTTP/1.1".to_string()]);
    }

    #[tokio::test]
    async fn refused_connection_is_service_not_running() {
        let port = test_server::closed_port().await;
        let err = client(port).get("/health", T).await.err().expect("error");
        assert!(matches!(err, StudioError::ServiceNotRunning { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn slow_server_is_a_timeout_not_a_refusal() {
        let srv = test_server::serve(vec![vec![Step::Sleep(3_000)]]).await;
        let err = client(srv.port)
            .get("/status", Duration::from_millis(200))
            .await
            .err()
            .expect("error");
        assert!(
            matches!(err, StudioError::RequestTimeout { timeout_ms: 200, .. }),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn plain_text_is_parse_failure_unless_lenient() {
        let srv = test_server::serve(vec![
            test_server::full("200 OK", "text/plain", "Ollama is running"),
            test_server::full("200 OK", "text/plain", "Ollama is running"),
        ])
        .await;
        let c = client(srv.port);
        let err = c.get("/", T).await.err().expect("error");
        assert!(matches!(err, StudioError::ParseFailed { .. }));
        let v = c
            .request_lenient(Method::GET, "/", None, T)
            .await
            .expect("lenient");
        assert_eq!(v, Value::String("Ollama is running".into()));
    }

    #[tokio::test]
    async fn error_status_carries_server_reason() {
        let srv = test_server::serve(vec![test_server::json(
            "400 Bad Request",
            r#"{"success":false,"error":"No model loaded"}"#,
        )])
        .await;
        let err = client(srv.port)
            .post("/generate", &json!({}), T)
            .await
            .err()
            .expect("error");
        match err {
            StudioError::ServiceRejected { reason, .. } => assert_eq!(reason, "No model loaded"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn binary_body_is_returned_untouched() {
        let audio = [b'R', b'I', b'F', b'F', 0xff, 0x00, 0xfe, 0x10];
        let mut head = test_server::head(
            "200 OK",
            &[
                ("Content-Type", "audio/wav".to_string()),
                ("Content-Length", audio.len().to_string()),
            ],
        );
        head.extend_from_slice(&audio);
        let srv = test_server::serve(vec![vec![Step::Write(head)]]).await;
        let raw = client(srv.port)
            .request_bytes(Method::POST, "/generate/stream", Some(&json!({"text": "hi"})), T)
            .await
            .expect("bytes");
        assert_eq!(raw, audio);
    }

    #[test]
    fn success_false_body_is_rejected() {
        let err = expect_success("tts", json!({"success": false, "error": "Voice not found"}))
            .err()
            .expect("rejected");
        assert!(matches!(err, StudioError::ServiceRejected { ref reason, .. } if reason == "Voice not found"));
        assert!(expect_success("tts", json!({"success": true})).is_ok());
        assert!(expect_success("tts", json!({"models": []})).is_ok());
    }

    #[tokio::test]
    async fn stream_skips_malformed_lines_and_parses_trailing_partial() {
        let srv = test_server::serve(vec![vec![
            Step::Write(ndjson_head()),
            Step::Write(b"{\"response\":\"Hel\"}\n".to_vec()),
            Step::Sleep(30),
            Step::Write(b"{garbage\n{\"response\":\"lo\"}\n".to_vec()),
            Step::Sleep(30),
            Step::Write(b"{\"response\":\"!\",\"done\":true}".to_vec()),
        ]])
        .await;
        let mut chunks = Vec::new();
        let text = client(srv.port)
            .request_stream(Method::POST, "/api/generate", Some(&json!({"prompt": "x"})), |c| {
                chunks.push(c.clone())
            })
            .await
            .expect("stream");
        assert_eq!(text, "Hello!");
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2]["done"], true);
    }

    #[tokio::test]
    async fn stream_error_line_is_rejection() {
        let srv = test_server::serve(vec![vec![
            Step::Write(ndjson_head()),
            Step::Write(b"{\"status\":\"pulling manifest\"}\n{\"error\":\"file does not exist\"}\n".to_vec()),
        ]])
        .await;
        let err = client(srv.port)
            .request_stream(Method::POST, "/api/pull", None, |_| {})
            .await
            .err()
            .expect("error");
        assert!(matches!(err, StudioError::ServiceRejected { ref reason, .. } if reason == "file does not exist"));
    }

    #[tokio::test]
    async fn stream_cancellation_returns_cancelled() {
        let srv = test_server::serve(vec![vec![
            Step::Write(ndjson_head()),
            Step::Write(b"{\"status\":\"downloading\"}\n".to_vec()),
            Step::Sleep(5_000),
        ]])
        .await;
        let token = CancellationToken::new();
        let t2 = token.clone();
        let mut seen = 0;
        let out = client(srv.port)
            .request_stream_cancellable(Method::POST, "/api/pull", None, &token, |_| {
                seen += 1;
                t2.cancel();
            })
            .await
            .expect("stream");
        assert!(out.is_cancelled());
        assert_eq!(seen, 1);
    }
}
