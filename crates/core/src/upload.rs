use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::control_plane::{ControlPlane, UploadKind};
use crate::ignore_filter::compute_included_files;
use crate::pool::{DEFAULT_MAX_WORKERS, UploadTask, run_pool};
use crate::progress::{PausedDisplay, ProgressAggregator, ProgressSink, StatusDisplay, UploadProgress};
use crate::storage::{ObjectStore, ProgressEventKind, ProgressListener, StoreConnector};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct UploadDirConfig {
    pub dir_path: PathBuf,
    pub project_name: String,
    pub bundle_id: String,
    pub max_workers: usize,
}

impl UploadDirConfig {
    pub fn new(
        dir_path: impl Into<PathBuf>,
        project_name: impl Into<String>,
        bundle_id: impl Into<String>,
    ) -> Self {
        Self {
            dir_path: dir_path.into(),
            project_name: project_name.into(),
            bundle_id: bundle_id.into(),
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadFileConfig {
    pub file_path: PathBuf,
    pub object_key: String,
    pub project_name: String,
}

#[derive(Default, Clone)]
pub struct UploadOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub display: Option<&'a dyn StatusDisplay>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub files_uploaded: u64,
    pub bytes_uploaded: i64,
}

/// Object key of `rel` inside a bundle: `<bundle_id>/<rel>` with `/` separators on
/// every platform.
pub fn object_key(bundle_id: &str, rel: &Path) -> Result<String> {
    let mut key = bundle_id.trim_end_matches('/').to_string();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| Error::NonUtf8Path {
                    path: rel.to_path_buf(),
                })?;
                if !key.is_empty() {
                    key.push('/');
                }
                key.push_str(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidConfig {
                    message: format!("path is not relative to the upload root: {}", rel.display()),
                });
            }
        }
    }
    Ok(key)
}

/// Uploads every included file of `config.dir_path` under `<bundle_id>/`.
///
/// Storage credentials are fetched before anything is read from disk; a failure there
/// aborts the call before any upload starts. The surrounding display is paused for the
/// whole call and resumed on every exit path.
pub async fn upload_directory<C, K>(
    control: &C,
    connector: &K,
    aggregator: &Arc<ProgressAggregator>,
    config: UploadDirConfig,
    options: UploadOptions<'_>,
) -> Result<UploadSummary>
where
    C: ControlPlane + ?Sized,
    K: StoreConnector + ?Sized,
{
    if config.max_workers == 0 {
        return Err(Error::InvalidConfig {
            message: "max_workers must be >= 1".to_string(),
        });
    }
    debug!(
        event = "upload.prepare",
        dir = %config.dir_path.display(),
        project = %config.project_name,
        bundle_id = %config.bundle_id,
        max_workers = config.max_workers,
        "upload.prepare"
    );

    let _paused = PausedDisplay::new(options.display);
    aggregator.reset();

    let credentials = control
        .get_storage_credentials(UploadKind::Static, &config.project_name)
        .await?;
    let store = connector.connect(&credentials)?;

    let scan_started = Instant::now();
    let root = config.dir_path.clone();
    let scanned = tokio::task::spawn_blocking(move || scan_directory(&root))
        .await
        .map_err(|e| Error::Worker {
            message: format!("directory scan failed: {e}"),
        })??;

    let mut tasks = Vec::with_capacity(scanned.len());
    for (rel, size) in &scanned {
        let task = UploadTask {
            object_key: object_key(&config.bundle_id, rel)?,
            source_path: config.dir_path.join(rel),
        };
        aggregator.register(&task.identity(), *size);
        tasks.push(task);
    }
    debug!(
        event = "phase.finish",
        phase = "scan",
        duration_ms = scan_started.elapsed().as_millis() as u64,
        files = tasks.len(),
        "phase.finish"
    );

    upload_tasks(store, aggregator, tasks, config.max_workers, &options).await
}

/// Uploads a single file (the build bundle of a dynamic project) with the
/// `buildBundle` credentials.
pub async fn upload_file<C, K>(
    control: &C,
    connector: &K,
    aggregator: &Arc<ProgressAggregator>,
    config: UploadFileConfig,
    options: UploadOptions<'_>,
) -> Result<UploadSummary>
where
    C: ControlPlane + ?Sized,
    K: StoreConnector + ?Sized,
{
    let _paused = PausedDisplay::new(options.display);
    aggregator.reset();

    let credentials = control
        .get_storage_credentials(UploadKind::BuildBundle, &config.project_name)
        .await?;
    let store = connector.connect(&credentials)?;

    let size = tokio::fs::metadata(&config.file_path)
        .await
        .map_err(|e| Error::filesystem(&config.file_path, e))?
        .len() as i64;
    let task = UploadTask {
        source_path: config.file_path,
        object_key: config.object_key,
    };
    aggregator.register(&task.identity(), size);

    upload_tasks(store, aggregator, vec![task], 1, &options).await
}

/// Included files under `root` with their sizes, in path order.
fn scan_directory(root: &Path) -> Result<Vec<(PathBuf, i64)>> {
    compute_included_files(root)?
        .into_iter()
        .map(|rel| {
            let source_path = root.join(&rel);
            let size = std::fs::metadata(&source_path)
                .map_err(|e| Error::filesystem(&source_path, e))?
                .len() as i64;
            Ok((rel, size))
        })
        .collect()
}

async fn upload_tasks(
    store: Arc<dyn ObjectStore>,
    aggregator: &Arc<ProgressAggregator>,
    tasks: Vec<UploadTask>,
    max_workers: usize,
    options: &UploadOptions<'_>,
) -> Result<UploadSummary> {
    let upload_started = Instant::now();
    let files_total = tasks.len() as u64;
    let files_done = Arc::new(AtomicU64::new(0));
    let provider = store.provider();

    let put_one = {
        let aggregator = aggregator.clone();
        let sink = options.progress.clone();
        let files_done = files_done.clone();
        move |task: UploadTask| {
            let store = store.clone();
            let listener = progress_listener(
                aggregator.clone(),
                task.identity(),
                sink.clone(),
                files_total,
                files_done.clone(),
            );
            async move {
                debug!(
                    event = "upload.put",
                    provider,
                    key = %task.object_key,
                    path = %task.source_path.display(),
                    "upload.put"
                );
                store
                    .put_object_from_file(&task.object_key, &task.source_path, listener)
                    .await
            }
        }
    };

    let result = run_pool(tasks, max_workers, options.cancel, put_one).await;
    let completed = result.completed as u64;
    result.into_result()?;

    let snapshot = aggregator.snapshot();
    debug!(
        event = "phase.finish",
        phase = "upload",
        duration_ms = upload_started.elapsed().as_millis() as u64,
        files_uploaded = completed,
        bytes_uploaded = snapshot.total_consumed,
        "phase.finish"
    );
    Ok(UploadSummary {
        files_uploaded: completed,
        bytes_uploaded: snapshot.total_consumed,
    })
}

fn progress_listener(
    aggregator: Arc<ProgressAggregator>,
    identity: String,
    sink: Option<Arc<dyn ProgressSink>>,
    files_total: u64,
    files_done: Arc<AtomicU64>,
) -> ProgressListener {
    Arc::new(move |event| {
        let done = match event.kind {
            ProgressEventKind::Data => {
                aggregator.update(&identity, event.consumed_bytes, event.total_bytes);
                files_done.load(Ordering::Relaxed)
            }
            ProgressEventKind::Completed => {
                aggregator.update(&identity, event.consumed_bytes, event.total_bytes);
                files_done.fetch_add(1, Ordering::Relaxed) + 1
            }
            ProgressEventKind::Started | ProgressEventKind::Failed => return,
        };
        if let Some(sink) = &sink {
            let snapshot = aggregator.snapshot();
            sink.on_progress(UploadProgress {
                phase: "upload".to_string(),
                files_total,
                files_done: done,
                bytes_consumed: snapshot.total_consumed,
                bytes_total: snapshot.total_size,
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_joins_bundle_and_relative_path() {
        assert_eq!(
            object_key("demo-abc", Path::new("index.html")).unwrap(),
            "demo-abc/index.html"
        );
        assert_eq!(
            object_key("demo-abc/", Path::new("assets/css/site.css")).unwrap(),
            "demo-abc/assets/css/site.css"
        );
        assert_eq!(
            object_key("demo-abc", Path::new("./a/b.txt")).unwrap(),
            "demo-abc/a/b.txt"
        );
    }

    #[test]
    fn object_key_rejects_paths_outside_root() {
        assert!(matches!(
            object_key("b", Path::new("../secret")),
            Err(Error::InvalidConfig { .. })
        ));
        assert!(object_key("b", Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn scan_reports_sizes_in_path_order() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("assets")).unwrap();
        std::fs::write(temp.path().join("index.html"), [0u8; 13]).unwrap();
        std::fs::write(temp.path().join("assets/app.js"), [0u8; 300]).unwrap();

        let scanned = scan_directory(temp.path()).unwrap();
        assert_eq!(
            scanned,
            vec![
                (PathBuf::from("assets/app.js"), 300),
                (PathBuf::from("index.html"), 13),
            ]
        );
        assert!(scan_directory(&temp.path().join("missing")).unwrap_err().is_filesystem());
    }
}
