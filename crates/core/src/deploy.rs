use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{archive_file_name, build_archive};
use crate::config::{DEFAULT_STATIC_DIR, LetConfig};
use crate::control_plane::{ControlPlane, DeploymentStatus, StartDeploymentRequest};
use crate::detect::is_static_type;
use crate::poll::{PollOptions, PollPolicy, await_completion};
use crate::pool::DEFAULT_MAX_WORKERS;
use crate::progress::{ProgressAggregator, ProgressSink, StatusDisplay};
use crate::storage::StoreConnector;
use crate::upload::{
    UploadDirConfig, UploadFileConfig, UploadOptions, UploadSummary, upload_directory, upload_file,
};
use crate::{Error, Result};

/// Refuse to deploy a directory with more top-level entries than this.
pub const MAX_TOP_LEVEL_ENTRIES: usize = 10_000;

pub const CONSOLE_URL: &str = "https://alpha.let.sh.cn/console/project";

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub project_dir: PathBuf,
    /// Merged project settings; sent to the control plane as JSON.
    pub config: LetConfig,
    pub cn: bool,
    pub max_workers: usize,
    pub poll: PollPolicy,
    /// Deploying from this directory is refused.
    pub home_dir: Option<PathBuf>,
}

impl DeployRequest {
    pub fn new(project_dir: impl Into<PathBuf>, config: LetConfig) -> Self {
        Self {
            project_dir: project_dir.into(),
            config,
            cn: true,
            max_workers: DEFAULT_MAX_WORKERS,
            poll: PollPolicy::default(),
            home_dir: std::env::var_os("HOME").map(PathBuf::from),
        }
    }
}

#[derive(Default, Clone)]
pub struct DeployOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub display: Option<&'a dyn StatusDisplay>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Succeeded {
        deployment_id: String,
        status: DeploymentStatus,
        upload: UploadSummary,
        preview_url: String,
        details_url: String,
    },
    Cancelled {
        /// Set when the deployment had already been started remotely.
        deployment_id: Option<String>,
        remote_cancelled: bool,
    },
}

/// Deploy runs sharing one handle. The id of the deployment started by the latest
/// `run` is recorded as soon as the control plane returns it; each `run` clears it first.
#[derive(Debug, Default)]
pub struct DeploySession {
    deployment_id: Mutex<Option<String>>,
}

impl DeploySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deployment_id(&self) -> Option<String> {
        self.slot().clone()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.deployment_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn run<C, K>(
        &self,
        control: &C,
        connector: &K,
        request: DeployRequest,
        options: DeployOptions<'_>,
    ) -> Result<DeployOutcome>
    where
        C: ControlPlane + ?Sized,
        K: StoreConnector + ?Sized,
    {
        *self.slot() = None;
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let config = &request.config;
        if config.name.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "project name must not be empty".to_string(),
            });
        }
        if request.max_workers == 0 {
            return Err(Error::InvalidConfig {
                message: "max_workers must be >= 1".to_string(),
            });
        }
        info!(
            event = "deploy.start",
            run_id = %run_id,
            project = %config.name,
            project_type = %config.project_type,
            "deploy.start"
        );

        let capability = match until_cancelled(
            options.cancel,
            control.check_deploy_capability(&config.name),
        )
        .await
        {
            Err(Error::Cancelled) => return Ok(cancelled_before_start()),
            other => other?,
        };
        {
            let project_dir = request.project_dir.clone();
            let home_dir = request.home_dir.clone();
            tokio::task::spawn_blocking(move || preflight(&project_dir, home_dir.as_deref()))
                .await
                .map_err(|e| Error::Worker {
                    message: format!("preflight task failed: {e}"),
                })??;
        }

        let bundle_id = format!("{}-{}", config.name, capability.hash_id);
        let aggregator = Arc::new(ProgressAggregator::new());
        let upload_options = UploadOptions {
            cancel: options.cancel,
            progress: options.progress.clone(),
            display: options.display,
        };

        let uploaded = if is_static_type(&config.project_type) {
            let static_dir = match config.static_dir.trim() {
                "" => DEFAULT_STATIC_DIR,
                dir => dir,
            };
            let mut upload = UploadDirConfig::new(
                request.project_dir.join(static_dir),
                config.name.clone(),
                bundle_id.clone(),
            );
            upload.max_workers = request.max_workers;
            upload_directory(control, connector, &aggregator, upload, upload_options).await
        } else {
            upload_bundle(
                control,
                connector,
                &aggregator,
                &request.project_dir,
                &config.name,
                &bundle_id,
                upload_options,
            )
            .await
        };
        let upload = match uploaded {
            Err(Error::Cancelled) => return Ok(cancelled_before_start()),
            other => other?,
        };

        if options.cancel.is_some_and(|c| c.is_cancelled()) {
            return Ok(cancelled_before_start());
        }

        let encoded = serde_json::to_string(config).map_err(|e| Error::InvalidConfig {
            message: format!("project config encode failed: {e}"),
        })?;
        let deployment = control
            .start_deployment(&StartDeploymentRequest {
                project_type: config.project_type.clone(),
                name: config.name.clone(),
                config: encoded,
                cn: request.cn,
            })
            .await?;
        let deployment_id = deployment.id.as_str();
        *self.slot() = Some(deployment.id.clone());
        info!(
            event = "deploy.started",
            run_id = %run_id,
            deployment_id = %deployment_id,
            "deploy.started"
        );

        let polled = await_completion(
            control,
            deployment_id,
            &request.poll,
            PollOptions {
                cancel: options.cancel,
                display: options.display,
            },
        )
        .await;

        match polled {
            Ok(status) => {
                info!(
                    event = "deploy.finish",
                    run_id = %run_id,
                    deployment_id = %deployment_id,
                    status = %status.status,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "deploy.finish"
                );
                Ok(DeployOutcome::Succeeded {
                    deployment_id: deployment_id.to_string(),
                    preview_url: format!("https://{}", status.target_fqdn),
                    details_url: format!("{CONSOLE_URL}/{}/details", config.name),
                    status,
                    upload,
                })
            }
            Err(Error::Cancelled) => {
                let remote_cancelled = cancel_remote(control, deployment_id).await;
                Ok(DeployOutcome::Cancelled {
                    deployment_id: Some(deployment_id.to_string()),
                    remote_cancelled,
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Runs a full deploy in a fresh session.
pub async fn run_deploy<C, K>(
    control: &C,
    connector: &K,
    request: DeployRequest,
    options: DeployOptions<'_>,
) -> Result<DeployOutcome>
where
    C: ControlPlane + ?Sized,
    K: StoreConnector + ?Sized,
{
    DeploySession::new()
        .run(control, connector, request, options)
        .await
}

/// Refuses the home directory and directories too large to be a project.
pub fn preflight(project_dir: &Path, home_dir: Option<&Path>) -> Result<()> {
    let project = std::fs::canonicalize(project_dir).map_err(|e| Error::filesystem(project_dir, e))?;
    if let Some(home) = home_dir.and_then(|h| std::fs::canonicalize(h).ok()) {
        if project == home {
            return Err(Error::InvalidConfig {
                message: "currently under home dir, please switch to your project dir".to_string(),
            });
        }
    }

    let entries = std::fs::read_dir(&project)
        .map_err(|e| Error::filesystem(&project, e))?
        .count();
    if entries > MAX_TOP_LEVEL_ENTRIES {
        return Err(Error::InvalidConfig {
            message: format!(
                "too many files in {} ({entries}), please check whether in the correct directory",
                project.display()
            ),
        });
    }
    Ok(())
}

async fn upload_bundle<C, K>(
    control: &C,
    connector: &K,
    aggregator: &Arc<ProgressAggregator>,
    project_dir: &Path,
    project_name: &str,
    bundle_id: &str,
    options: UploadOptions<'_>,
) -> Result<UploadSummary>
where
    C: ControlPlane + ?Sized,
    K: StoreConnector + ?Sized,
{
    let temp = tempfile::tempdir().map_err(|e| Error::filesystem(std::env::temp_dir(), e))?;
    let archive = {
        let project_dir = project_dir.to_path_buf();
        let out_dir = temp.path().to_path_buf();
        let bundle_id = bundle_id.to_string();
        tokio::task::spawn_blocking(move || build_archive(&project_dir, &out_dir, &bundle_id))
            .await
            .map_err(|e| Error::Worker {
                message: format!("archive task failed: {e}"),
            })??
    };

    let summary = upload_file(
        control,
        connector,
        aggregator,
        UploadFileConfig {
            file_path: archive,
            object_key: archive_file_name(bundle_id),
            project_name: project_name.to_string(),
        },
        options,
    )
    .await;
    if let Err(e) = temp.close() {
        debug!(event = "archive.cleanup_failed", error = %e, "archive.cleanup_failed");
    }
    summary
}

async fn cancel_remote<C>(control: &C, deployment_id: &str) -> bool
where
    C: ControlPlane + ?Sized,
{
    match control.cancel_deployment(deployment_id).await {
        Ok(cancelled) => {
            info!(event = "deploy.cancel", deployment_id, cancelled, "deploy.cancel");
            cancelled
        }
        Err(e) => {
            warn!(
                event = "deploy.cancel_failed",
                deployment_id,
                error = %e,
                "deploy.cancel_failed"
            );
            false
        }
    }
}

fn cancelled_before_start() -> DeployOutcome {
    DeployOutcome::Cancelled {
        deployment_id: None,
        remote_cancelled: false,
    }
}

async fn until_cancelled<T>(
    cancel: Option<&CancellationToken>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            res = fut => res,
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preflight_refuses_home_dir() {
        let temp = tempfile::tempdir().unwrap();
        let err = preflight(temp.path(), Some(temp.path())).unwrap_err();
        assert!(err.to_string().contains("home dir"), "{err}");

        let project = temp.path().join("site");
        std::fs::create_dir_all(&project).unwrap();
        preflight(&project, Some(temp.path())).unwrap();
    }

    #[test]
    fn preflight_refuses_missing_dir() {
        let temp = tempfile::tempdir().unwrap();
        let err = preflight(&temp.path().join("nope"), None).unwrap_err();
        assert!(err.is_filesystem());
    }
}
