use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::json;
use studiokit_core::{JobKind, Outcome, StudioError};
use studiokit_observability::{safe_eprintln, trace};
use studiokit_providers::{
    catalog::{self, ModelDescriptor, ModelFamily, ModelSource},
    download::temp_path,
    Downloader,
};

use crate::jobs::JobTracker;

/// Catalog entry joined with what is on disk and in flight right now.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub family: ModelFamily,
    pub size_bytes: u64,
    pub ram_required_bytes: u64,
    pub recommended: bool,
    pub downloaded: bool,
    pub downloading: bool,
    pub progress: Option<u8>,
    pub path: String,
}

/// Recognition and speech model artifacts under the models directory.
pub struct ModelStore {
    catalog: Vec<ModelDescriptor>,
    models_dir: PathBuf,
    data_dir: PathBuf,
    downloader: Downloader,
    tracker: JobTracker,
}

impl ModelStore {
    pub fn new(data_dir: &Path, models_dir: &Path, tracker: JobTracker) -> Self {
        Self::with_catalog(data_dir, models_dir, tracker, catalog::CATALOG.to_vec())
    }

    pub fn with_catalog(
        data_dir: &Path,
        models_dir: &Path,
        tracker: JobTracker,
        catalog: Vec<ModelDescriptor>,
    ) -> Self {
        Self {
            catalog,
            models_dir: models_dir.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
            downloader: Downloader::new(data_dir),
            tracker,
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn descriptor(&self, id: &str) -> Result<&ModelDescriptor, StudioError> {
        self.catalog
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| StudioError::UnknownModel {
                model_id: id.to_string(),
            })
    }

    /// Installed artifact path, or `ModelNotDownloaded`.
    pub fn installed_path(&self, id: &str) -> Result<PathBuf, StudioError> {
        let m = self.descriptor(id)?;
        if m.is_installed(&self.models_dir) {
            Ok(m.install_path(&self.models_dir))
        } else {
            Err(StudioError::ModelNotDownloaded {
                model_id: id.to_string(),
            })
        }
    }

    pub fn list(&self, available_ram: u64) -> Vec<ModelInfo> {
        self.catalog
            .iter()
            .map(|m| ModelInfo {
                id: m.id.to_string(),
                name: m.name.to_string(),
                family: m.family,
                size_bytes: m.size_bytes,
                ram_required_bytes: m.ram_required_bytes,
                recommended: m.is_recommended(available_ram),
                downloaded: m.is_installed(&self.models_dir),
                downloading: self.tracker.is_active(m.id),
                progress: self.tracker.progress(m.id),
                path: m.install_path(&self.models_dir).display().to_string(),
            })
            .collect()
    }

    pub fn recommended(&self, available_ram: u64) -> Vec<&ModelDescriptor> {
        self.catalog
            .iter()
            .filter(|m| m.is_recommended(available_ram))
            .collect()
    }

    /// Fetches a file model as a tracked job keyed by the model id.
    /// Unknown ids fail before any network traffic.
    pub async fn download(
        &self,
        id: &str,
        mut on_progress: impl FnMut(u8),
    ) -> Result<Outcome<PathBuf>, StudioError> {
        let m = self.descriptor(id)?;
        let ModelSource::File { url, sha256, .. } = m.source else {
            return Err(StudioError::UnsupportedSource {
                model_id: id.to_string(),
            });
        };
        let dest = m.install_path(&self.models_dir);
        if dest.is_file() {
            trace::event(
                &self.data_dir,
                Some(id),
                "Models",
                "MODEL.download",
                "skipped",
                Some(json!({ "reason": "already_installed" })),
            );
            on_progress(100);
            return Ok(Outcome::Completed(dest));
        }

        let tracker = self.tracker.clone();
        self.tracker
            .run(id, JobKind::Download, |tok| async move {
                let out = self
                    .downloader
                    .fetch(id, url, &dest, sha256, tok.cancellation(), |p| {
                        if let Some(p) = tracker.update_progress(&tok, p) {
                            on_progress(p);
                        }
                    })
                    .await?;
                Ok(out.map(|_| dest))
            })
            .await
    }

    pub fn cancel_download(&self, id: &str) -> bool {
        self.tracker.cancel(id)
    }

    /// Removes an installed model. Returns false when there was nothing to remove.
    /// A model with a download in flight is refused; cancel it first.
    pub fn delete(&self, id: &str) -> Result<bool, StudioError> {
        let m = self.descriptor(id)?;
        if self.tracker.is_active(id) {
            trace::event(
                &self.data_dir,
                Some(id),
                "Models",
                "MODEL.delete",
                "err",
                Some(json!({ "reason": "download_in_progress" })),
            );
            return Err(StudioError::DuplicateJob { key: id.to_string() });
        }
        let path = m.install_path(&self.models_dir);
        if m.family == ModelFamily::Recognition {
            let tmp = temp_path(&path);
            if let Err(e) = std::fs::remove_file(&tmp) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    safe_eprintln!("models: failed to remove {}: {e}", tmp.display());
                }
            }
        }
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path).map(|_| true)
        } else if path.is_file() {
            std::fs::remove_file(&path).map(|_| true)
        } else {
            Ok(false)
        };
        let removed = removed.map_err(|e| StudioError::io(format!("delete {}", path.display()), e))?;
        trace::event(
            &self.data_dir,
            Some(id),
            "Models",
            "MODEL.delete",
            if removed { "ok" } else { "skipped" },
            Some(json!({ "path": path.display().to_string() })),
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studiokit_core::DownloadFailure;
    use studiokit_providers::test_server::{self, Step};

    fn leak(s: String) -> &'static str {
        Box::leak(s.into_boxed_str())
    }

    fn file_model(id: &'static str, url: String) -> ModelDescriptor {
        ModelDescriptor {
            id,
            name: "Test",
            family: ModelFamily::Recognition,
            size_bytes: 1000,
            ram_required_bytes: 0,
            source: ModelSource::File {
                file_name: leak(format!("ggml-{id}.bin")),
                url: leak(url),
                sha256: None,
            },
            recommended_if: |_| true,
        }
    }

    fn store(td: &tempfile::TempDir, catalog: Vec<ModelDescriptor>) -> ModelStore {
        let tracker = JobTracker::new(td.path());
        ModelStore::with_catalog(td.path(), &td.path().join("models"), tracker, catalog)
    }

    #[tokio::test]
    async fn unknown_model_fails_without_network() {
        let td = tempfile::tempdir().expect("tempdir");
        let srv = test_server::serve(vec![]).await;
        let s = store(&td, vec![file_model("tiny", srv.url("/tiny"))]);
        let err = s.download("huge", |_| {}).await.expect_err("unknown");
        assert!(matches!(err, StudioError::UnknownModel { .. }));
        assert!(srv.request_lines().is_empty());
    }

    #[tokio::test]
    async fn tiny_download_reports_50_then_100() {
        let td = tempfile::tempdir().expect("tempdir");
        let srv = test_server::serve(vec![vec![
            Step::Write(test_server::head(
                "200 OK",
                &[("Content-Length", "1000".to_string())],
            )),
            Step::Write(vec![b'a'; 500]),
            Step::Sleep(30),
            Step::Write(vec![b'b'; 500]),
        ]])
        .await;
        let s = store(&td, vec![file_model("tiny", srv.url("/tiny"))]);

        let mut seen = Vec::new();
        let out = s.download("tiny", |p| seen.push(p)).await.expect("download");
        let path = out.completed().expect("completed");
        assert_eq!(seen, vec![50, 100]);
        assert_eq!(std::fs::metadata(&path).expect("file").len(), 1000);
        assert!(!temp_path(&path).exists());

        let info = s.list(0).into_iter().find(|m| m.id == "tiny").expect("tiny");
        assert!(info.downloaded);
        assert!(!info.downloading);
    }

    #[tokio::test]
    async fn http_error_leaves_no_file_and_frees_the_key() {
        let td = tempfile::tempdir().expect("tempdir");
        let srv = test_server::serve(vec![test_server::full("503 Service Unavailable", "text/plain", "busy")]).await;
        let s = store(&td, vec![file_model("tiny", srv.url("/tiny"))]);
        let err = s.download("tiny", |_| {}).await.expect_err("503");
        assert!(matches!(
            err,
            StudioError::DownloadFailed {
                failure: DownloadFailure::HttpStatus(503),
                ..
            }
        ));
        let dest = td.path().join("models").join("ggml-tiny.bin");
        assert!(!dest.exists());
        assert!(!temp_path(&dest).exists());
        assert!(!s.cancel_download("tiny"));
        assert!(!s.cancel_download("tiny"));
    }

    #[tokio::test]
    async fn concurrent_download_of_same_model_is_rejected() {
        let td = tempfile::tempdir().expect("tempdir");
        let srv = test_server::serve(vec![vec![
            Step::Write(test_server::head(
                "200 OK",
                &[("Content-Length", "10".to_string())],
            )),
            Step::Sleep(200),
            Step::Write(vec![b'x'; 10]),
        ]])
        .await;
        let s = store(&td, vec![file_model("tiny", srv.url("/tiny"))]);
        let (a, b) = tokio::join!(s.download("tiny", |_| {}), async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            s.download("tiny", |_| {}).await
        });
        assert!(a.expect("first").completed().is_some());
        assert!(matches!(b, Err(StudioError::DuplicateJob { .. })));
    }

    #[tokio::test]
    async fn cancel_download_removes_partial_file() {
        let td = tempfile::tempdir().expect("tempdir");
        let srv = test_server::serve(vec![vec![
            Step::Write(test_server::head(
                "200 OK",
                &[("Content-Length", "1000".to_string())],
            )),
            Step::Write(vec![b'a'; 100]),
            Step::Sleep(2000),
        ]])
        .await;
        let s = store(&td, vec![file_model("tiny", srv.url("/tiny"))]);
        let (out, cancelled) = tokio::join!(s.download("tiny", |_| {}), async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            s.cancel_download("tiny")
        });
        assert!(cancelled);
        assert!(out.expect("outcome").is_cancelled());
        let dest = td.path().join("models").join("ggml-tiny.bin");
        assert!(!dest.exists());
        assert!(!temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn directory_models_are_not_fetched_locally() {
        let td = tempfile::tempdir().expect("tempdir");
        let s = ModelStore::new(td.path(), &td.path().join("models"), JobTracker::new(td.path()));
        let err = s
            .download("qwen3-tts-0.6b-base", |_| {})
            .await
            .expect_err("unsupported");
        assert!(matches!(err, StudioError::UnsupportedSource { .. }));
    }

    #[test]
    fn delete_is_idempotent_for_files_and_directories() {
        let td = tempfile::tempdir().expect("tempdir");
        let models = td.path().join("models");
        let s = ModelStore::new(td.path(), &models, JobTracker::new(td.path()));

        std::fs::create_dir_all(&models).expect("mkdir");
        std::fs::write(models.join("ggml-base.bin"), b"w").expect("write");
        assert!(s.delete("base").expect("delete"));
        assert!(!s.delete("base").expect("delete again"));

        let tts = models.join("tts").join("qwen3-tts-0.6b-base");
        std::fs::create_dir_all(&tts).expect("mkdir");
        std::fs::write(tts.join("config.json"), b"{}").expect("write");
        assert!(s.delete("qwen3-tts-0.6b-base").expect("delete dir"));
        assert!(!tts.exists());

        assert!(matches!(s.delete("nope"), Err(StudioError::UnknownModel { .. })));
    }

    #[test]
    fn delete_is_refused_while_a_download_holds_the_model() {
        let td = tempfile::tempdir().expect("tempdir");
        let models = td.path().join("models");
        let tracker = JobTracker::new(td.path());
        let s = ModelStore::new(td.path(), &models, tracker.clone());

        std::fs::create_dir_all(&models).expect("mkdir");
        let dest = models.join("ggml-base.bin");
        std::fs::write(temp_path(&dest), b"partial").expect("write");
        let tok = tracker.begin("base", JobKind::Download).expect("begin");

        assert!(matches!(s.delete("base"), Err(StudioError::DuplicateJob { .. })));
        assert!(temp_path(&dest).exists());

        // Still refused while the cancelled download unwinds.
        assert!(s.cancel_download("base"));
        assert!(matches!(s.delete("base"), Err(StudioError::DuplicateJob { .. })));

        tracker.complete(&tok, Err("cancelled".into()));
        assert!(!s.delete("base").expect("delete"));
        assert!(!temp_path(&dest).exists());
    }

    #[test]
    fn installed_path_requires_the_artifact() {
        let td = tempfile::tempdir().expect("tempdir");
        let models = td.path().join("models");
        let s = ModelStore::new(td.path(), &models, JobTracker::new(td.path()));
        assert!(matches!(
            s.installed_path("tiny"),
            Err(StudioError::ModelNotDownloaded { .. })
        ));
        std::fs::create_dir_all(&models).expect("mkdir");
        std::fs::write(models.join("ggml-tiny.bin"), b"w").expect("write");
        assert_eq!(s.installed_path("tiny").expect("path"), models.join("ggml-tiny.bin"));
    }
}
