use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use futures_util::StreamExt;
use reqwest::{header::LOCATION, redirect::Policy, Response, StatusCode};
use serde_json::json;
use studiokit_core::{digest, DownloadFailure, Outcome, StudioError};
use studiokit_observability::{safe_eprintln, trace::Span};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// A body that delivers nothing for this long is treated as a dropped connection.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// `<final>.tmp`, next to the destination so the final rename stays on one volume.
pub fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dest.with_file_name(name)
}

fn percent(done: u64, total: u64) -> u8 {
    ((done as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

fn failed(url: &str, failure: DownloadFailure) -> StudioError {
    StudioError::DownloadFailed {
        url: url.to_string(),
        failure,
    }
}

/// Streams remote artifacts to disk with progress and atomic completion.
pub struct Downloader {
    http: reqwest::Client,
    data_dir: PathBuf,
    idle_timeout: Duration,
}

impl Downloader {
    pub fn new(data_dir: &Path) -> Self {
        // Redirects are followed by hand, exactly one hop.
        let http = reqwest::Client::builder()
            .redirect(Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            data_dir: data_dir.to_path_buf(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }

    /// Downloads `url` to `dest`. Progress is reported only when the server sends a length.
    pub async fn fetch(
        &self,
        key: &str,
        url: &str,
        dest: &Path,
        sha256: Option<&str>,
        token: &CancellationToken,
        on_progress: impl FnMut(u8),
    ) -> Result<Outcome<u64>, StudioError> {
        let span = Span::start(
            &self.data_dir,
            Some(key),
            "Download",
            "DL.fetch",
            Some(json!({ "url": url, "dest": dest.display().to_string() })),
        );
        let tmp = temp_path(dest);
        let result = self
            .fetch_inner(url, dest, &tmp, sha256, token, on_progress)
            .await;

        if !matches!(result, Ok(Outcome::Completed(_))) {
            if let Err(e) = tokio::fs::remove_file(&tmp).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    safe_eprintln!("download: failed to remove {}: {e}", tmp.display());
                }
            }
        }
        match &result {
            Ok(Outcome::Completed(bytes)) => span.ok(Some(json!({ "bytes": bytes }))),
            Ok(Outcome::Cancelled) => span.skipped("cancelled", None),
            Err(e) => span.err(e.kind(), e.code(), &e.to_string(), None),
        }
        result
    }

    async fn fetch_inner(
        &self,
        url: &str,
        dest: &Path,
        tmp: &Path,
        sha256: Option<&str>,
        token: &CancellationToken,
        mut on_progress: impl FnMut(u8),
    ) -> Result<Outcome<u64>, StudioError> {
        let io_err = |e: std::io::Error| failed(url, DownloadFailure::Io(e.to_string()));
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let Some(resp) = self.open(url, token).await? else {
            return Ok(Outcome::Cancelled);
        };
        if resp.status() != StatusCode::OK {
            return Err(failed(url, DownloadFailure::HttpStatus(resp.status().as_u16())));
        }
        let total = resp.content_length().filter(|t| *t > 0);

        let file = tokio::fs::File::create(tmp).await.map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        let mut downloaded = 0u64;
        let mut stream = resp.bytes_stream();
        loop {
            let next = tokio::select! {
                n = tokio::time::timeout(self.idle_timeout, stream.next()) => n,
                _ = token.cancelled() => return Ok(Outcome::Cancelled),
            };
            let Ok(next) = next else {
                return Err(failed(
                    url,
                    DownloadFailure::Network(format!(
                        "no data for {}s",
                        self.idle_timeout.as_secs_f32()
                    )),
                ));
            };
            match next {
                Some(Ok(chunk)) => {
                    writer.write_all(&chunk).await.map_err(io_err)?;
                    downloaded += chunk.len() as u64;
                    if let Some(t) = total {
                        on_progress(percent(downloaded, t));
                    }
                }
                Some(Err(e)) => return Err(failed(url, DownloadFailure::Network(e.to_string()))),
                None => break,
            }
        }
        writer.flush().await.map_err(io_err)?;
        writer.into_inner().sync_all().await.map_err(io_err)?;

        if let Some(expected) = sha256 {
            let path = tmp.to_path_buf();
            let hashed = tokio::task::spawn_blocking(move || digest::sha256_file_hex(&path));
            let actual = tokio::select! {
                r = hashed => r
                    .map_err(|e| failed(url, DownloadFailure::Io(e.to_string())))?
                    .map_err(io_err)?,
                _ = token.cancelled() => return Ok(Outcome::Cancelled),
            };
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(failed(
                    url,
                    DownloadFailure::ChecksumMismatch {
                        expected: expected.to_string(),
                        actual,
                    },
                ));
            }
        }

        // A cancel that lands after the last chunk must not install the file.
        if token.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        if dest.exists() {
            tokio::fs::remove_file(dest).await.map_err(io_err)?;
        }
        tokio::fs::rename(tmp, dest).await.map_err(io_err)?;
        Ok(Outcome::Completed(downloaded))
    }

    async fn open(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> Result<Option<Response>, StudioError> {
        let Some(resp) = self.get(url, token).await? else {
            return Ok(None);
        };
        if !matches!(
            resp.status(),
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
        ) {
            return Ok(Some(resp));
        }
        let status = resp.status().as_u16();
        let next = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|loc| resp.url().join(loc).ok())
            .ok_or_else(|| failed(url, DownloadFailure::HttpStatus(status)))?;
        self.get(next.as_str(), token).await
    }

    async fn get(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> Result<Option<Response>, StudioError> {
        tokio::select! {
            r = self.http.get(url).send() => r
                .map(Some)
                .map_err(|e| failed(url, DownloadFailure::Network(e.to_string()))),
            _ = token.cancelled() => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::{self, Step};

    fn body_with_length(len: usize) -> Vec<u8> {
        test_server::head(
            "200 OK",
            &[
                ("Content-Type", "application/octet-stream".to_string()),
                ("Content-Length", len.to_string()),
            ],
        )
    }

    async fn run(
        dl: &Downloader,
        url: &str,
        dest: &Path,
        sha: Option<&str>,
    ) -> (Result<Outcome<u64>, StudioError>, Vec<u8>) {
        let mut seen = Vec::new();
        let r = dl
            .fetch("tiny", url, dest, sha, &CancellationToken::new(), |p| seen.push(p))
            .await;
        (r, seen)
    }

    #[tokio::test]
    async fn two_chunks_report_half_then_full() {
        let srv = test_server::serve(vec![vec![
            Step::Write(body_with_length(1000)),
            Step::Write(vec![b'a'; 500]),
            Step::Sleep(100),
            Step::Write(vec![b'b'; 500]),
        ]])
        .await;
        let td = tempfile::tempdir().expect("tempdir");
        let dest = td.path().join("models").join("ggml-tiny.bin");
        let dl = Downloader::new(td.path());

        let (r, seen) = run(&dl, &srv.url("/ggml-tiny.bin"), &dest, None).await;
        assert_eq!(r.expect("download"), Outcome::Completed(1000));
        assert!(seen.contains(&50), "{seen:?}");
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(std::fs::metadata(&dest).expect("final").len(), 1000);
        assert!(!temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn non_200_leaves_nothing_behind() {
        let srv = test_server::serve(vec![test_server::full("404 Not Found", "text/plain", "nope")]).await;
        let td = tempfile::tempdir().expect("tempdir");
        let dest = td.path().join("ggml-tiny.bin");
        let (r, seen) = run(&Downloader::new(td.path()), &srv.url("/x"), &dest, None).await;
        match r {
            Err(StudioError::DownloadFailed {
                failure: DownloadFailure::HttpStatus(404),
                ..
            }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(seen.is_empty());
        assert!(!dest.exists());
        assert!(!temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn one_redirect_is_followed() {
        let srv = test_server::serve(vec![
            vec![Step::Write(test_server::head(
                "302 Found",
                &[("Location", "/cdn/ggml-tiny.bin".to_string()), ("Content-Length", "0".to_string())],
            ))],
            test_server::full("200 OK", "application/octet-stream", "weights"),
        ])
        .await;
        let td = tempfile::tempdir().expect("tempdir");
        let dest = td.path().join("ggml-tiny.bin");
        let (r, _) = run(&Downloader::new(td.path()), &srv.url("/resolve"), &dest, None).await;
        assert_eq!(r.expect("download"), Outcome::Completed(7));
        assert_eq!(std::fs::read_to_string(&dest).expect("read"), "weights");
        assert_eq!(
            srv.request_lines(),
            vec![
                "GET /resolve HTTP/1.1".to_string(),
                "GET /cdn/ggml-tiny.bin HTTP/1.1".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn second_redirect_is_not_chased() {
        let redirect = |to: &str| {
            vec![Step::Write(test_server::head(
                "301 Moved Permanently",
                &[("Location", to.to_string()), ("Content-Length", "0".to_string())],
            ))]
        };
        let srv = test_server::serve(vec![redirect("/hop1"), redirect("/hop2")]).await;
        let td = tempfile::tempdir().expect("tempdir");
        let dest = td.path().join("ggml-tiny.bin");
        let (r, _) = run(&Downloader::new(td.path()), &srv.url("/start"), &dest, None).await;
        assert!(matches!(
            r,
            Err(StudioError::DownloadFailed {
                failure: DownloadFailure::HttpStatus(301),
                ..
            })
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn missing_length_reports_no_progress() {
        let srv = test_server::serve(vec![vec![
            Step::Write(test_server::head("200 OK", &[])),
            Step::Write(vec![0u8; 300]),
        ]])
        .await;
        let td = tempfile::tempdir().expect("tempdir");
        let dest = td.path().join("ggml-tiny.bin");
        // A stale partial file from an earlier attempt gets overwritten.
        std::fs::write(temp_path(&dest), vec![9u8; 5000]).expect("stale tmp");
        let (r, seen) = run(&Downloader::new(td.path()), &srv.url("/x"), &dest, None).await;
        assert_eq!(r.expect("download"), Outcome::Completed(300));
        assert!(seen.is_empty());
        assert_eq!(std::fs::metadata(&dest).expect("final").len(), 300);
    }

    #[tokio::test]
    async fn checksum_mismatch_discards_file() {
        let srv = test_server::serve(vec![test_server::full("200 OK", "application/octet-stream", "abc")]).await;
        let td = tempfile::tempdir().expect("tempdir");
        let dest = td.path().join("ggml-small.bin");
        let (r, _) = run(&Downloader::new(td.path()), &srv.url("/x"), &dest, Some("00ff")).await;
        assert!(matches!(
            r,
            Err(StudioError::DownloadFailed {
                failure: DownloadFailure::ChecksumMismatch { .. },
                ..
            })
        ));
        assert!(!dest.exists());
        assert!(!temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn checksum_match_keeps_file() {
        let srv = test_server::serve(vec![test_server::full("200 OK", "application/octet-stream", "abc")]).await;
        let td = tempfile::tempdir().expect("tempdir");
        let dest = td.path().join("ggml-small.bin");
        let sha = digest::sha256_hex(b"abc").to_uppercase();
        let (r, _) = run(&Downloader::new(td.path()), &srv.url("/x"), &dest, Some(&sha)).await;
        assert!(r.is_ok());
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn truncated_body_is_network_failure() {
        let srv = test_server::serve(vec![vec![
            Step::Write(body_with_length(1000)),
            Step::Write(vec![1u8; 400]),
        ]])
        .await;
        let td = tempfile::tempdir().expect("tempdir");
        let dest = td.path().join("ggml-tiny.bin");
        let (r, _) = run(&Downloader::new(td.path()), &srv.url("/x"), &dest, None).await;
        assert!(matches!(
            r,
            Err(StudioError::DownloadFailed {
                failure: DownloadFailure::Network(_),
                ..
            })
        ));
        assert!(!dest.exists());
        assert!(!temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn stalled_body_fails_after_the_idle_timeout() {
        let srv = test_server::serve(vec![vec![
            Step::Write(body_with_length(1000)),
            Step::Write(vec![1u8; 100]),
            Step::Sleep(3_000),
        ]])
        .await;
        let td = tempfile::tempdir().expect("tempdir");
        let dest = td.path().join("ggml-tiny.bin");
        let dl = Downloader::new(td.path()).with_idle_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let (r, _) = run(&dl, &srv.url("/x"), &dest, None).await;
        assert!(started.elapsed() < Duration::from_millis(2_500));
        assert!(matches!(
            r,
            Err(StudioError::DownloadFailed {
                failure: DownloadFailure::Network(_),
                ..
            })
        ));
        assert!(!dest.exists());
        assert!(!temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn cancel_after_the_last_chunk_does_not_install() {
        let srv = test_server::serve(vec![test_server::full(
            "200 OK",
            "application/octet-stream",
            "weights",
        )])
        .await;
        let td = tempfile::tempdir().expect("tempdir");
        let dest = td.path().join("ggml-tiny.bin");
        let token = CancellationToken::new();
        let t2 = token.clone();
        let r = Downloader::new(td.path())
            .fetch("tiny", &srv.url("/x"), &dest, None, &token, |p| {
                if p == 100 {
                    t2.cancel();
                }
            })
            .await;
        assert_eq!(r.expect("cancel is not an error"), Outcome::Cancelled);
        assert!(!dest.exists());
        assert!(!temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn cancel_mid_stream_deletes_partial() {
        let srv = test_server::serve(vec![vec![
            Step::Write(body_with_length(1000)),
            Step::Write(vec![1u8; 100]),
            Step::Sleep(5_000),
        ]])
        .await;
        let td = tempfile::tempdir().expect("tempdir");
        let dest = td.path().join("ggml-tiny.bin");
        let token = CancellationToken::new();
        let t2 = token.clone();
        let r = Downloader::new(td.path())
            .fetch("tiny", &srv.url("/x"), &dest, None, &token, |_| t2.cancel())
            .await;
        assert_eq!(r.expect("cancel is not an error"), Outcome::Cancelled);
        assert!(!dest.exists());
        assert!(!temp_path(&dest).exists());
    }
}
