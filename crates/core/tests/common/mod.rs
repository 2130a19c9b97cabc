#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lets_core::{
    ControlPlane, DeployCapability, Deployment, DeploymentStatus, Error, ObjectStore,
    ProgressEvent, ProgressEventKind, ProgressListener, Result, StartDeploymentRequest,
    StatusDisplay, StorageCredentials, StoreConnector, UploadKind,
};

pub fn write_file(path: PathBuf, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

pub fn status(done: bool, status: &str) -> DeploymentStatus {
    DeploymentStatus {
        target_fqdn: "demo.let-app.com".to_string(),
        network_stage: if done { "Ready" } else { "Pending" }.to_string(),
        packer_stage: if done { "Built" } else { "Building" }.to_string(),
        status: status.to_string(),
        done,
        error_message: None,
    }
}

pub fn failed(message: &str) -> DeploymentStatus {
    DeploymentStatus {
        error_message: Some(message.to_string()),
        ..status(true, "Failed")
    }
}

pub enum StatusReply {
    Status(DeploymentStatus),
    Transport(String),
    /// Never answers.
    Hang,
}

/// Control plane answering from a script and recording every call.
pub struct ScriptedControlPlane {
    pub hash_id: String,
    pub capability_error: Option<Error>,
    pub credentials_error: Mutex<Option<Error>>,
    pub credentials: StorageCredentials,
    pub cancel_succeeds: bool,
    statuses: Mutex<VecDeque<StatusReply>>,
    calls: Mutex<Vec<String>>,
    status_calls: AtomicUsize,
    deployments: AtomicUsize,
}

impl ScriptedControlPlane {
    pub fn new(statuses: Vec<StatusReply>) -> Self {
        Self {
            hash_id: "abc123".to_string(),
            capability_error: None,
            credentials_error: Mutex::new(None),
            credentials: StorageCredentials {
                host: "https://let-static.oss-cn-hangzhou.aliyuncs.com".to_string(),
                access_key_id: "ak".to_string(),
                access_key_secret: "sk".to_string(),
                security_token: "sts".to_string(),
            },
            cancel_succeeds: true,
            statuses: Mutex::new(statuses.into()),
            calls: Mutex::new(Vec::new()),
            status_calls: AtomicUsize::new(0),
            deployments: AtomicUsize::new(0),
        }
    }

    pub fn failing_credentials(self, message: &str) -> Self {
        *self.credentials_error.lock().unwrap() = Some(Error::Transport {
            message: message.to_string(),
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

impl ControlPlane for ScriptedControlPlane {
    fn check_deploy_capability<'a>(&'a self, project_name: &'a str) -> BoxFut<'a, DeployCapability> {
        Box::pin(async move {
            self.record(format!("capability:{project_name}"));
            if let Some(Error::Capability { project, message }) = &self.capability_error {
                return Err(Error::Capability {
                    project: project.clone(),
                    message: message.clone(),
                });
            }
            Ok(DeployCapability {
                hash_id: self.hash_id.clone(),
                exists: true,
            })
        })
    }

    fn get_storage_credentials<'a>(
        &'a self,
        kind: UploadKind,
        project_name: &'a str,
    ) -> BoxFut<'a, StorageCredentials> {
        Box::pin(async move {
            self.record(format!("sts:{}:{project_name}", kind.as_str()));
            if let Some(e) = self.credentials_error.lock().unwrap().take() {
                return Err(e);
            }
            Ok(self.credentials.clone())
        })
    }

    fn start_deployment<'a>(&'a self, request: &'a StartDeploymentRequest) -> BoxFut<'a, Deployment> {
        Box::pin(async move {
            self.record(format!(
                "deploy:{}:{}:{}:{}",
                request.project_type, request.name, request.config, request.cn
            ));
            let n = self.deployments.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Deployment {
                id: format!("dep-{n}"),
                status: "Pending".to_string(),
                ..Deployment::default()
            })
        })
    }

    fn get_deployment_status<'a>(&'a self, deployment_id: &'a str) -> BoxFut<'a, DeploymentStatus> {
        Box::pin(async move {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            self.record(format!("status:{deployment_id}"));
            let next = self.statuses.lock().unwrap().pop_front();
            match next {
                Some(StatusReply::Status(s)) => Ok(s),
                Some(StatusReply::Transport(message)) => Err(Error::Transport { message }),
                Some(StatusReply::Hang) => std::future::pending().await,
                None => Ok(status(false, "Pending")),
            }
        })
    }

    fn cancel_deployment<'a>(&'a self, deployment_id: &'a str) -> BoxFut<'a, bool> {
        Box::pin(async move {
            self.record(format!("cancel:{deployment_id}"));
            Ok(self.cancel_succeeds)
        })
    }

    fn get_preference<'a>(&'a self, key: &'a str) -> BoxFut<'a, String> {
        Box::pin(async move {
            self.record(format!("preference:{key}"));
            Ok(format!("value-of-{key}"))
        })
    }
}

#[derive(Default)]
struct TimedInner {
    delay: Duration,
    fail_on: Option<String>,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    puts: Mutex<Vec<String>>,
    stored: Mutex<Vec<(String, Vec<u8>)>>,
}

/// Object store that sleeps on every put, tracks peak concurrency and can fail
/// the put of one key.
#[derive(Clone, Default)]
pub struct TimedStore {
    inner: Arc<TimedInner>,
}

impl TimedStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: Arc::new(TimedInner {
                delay,
                ..TimedInner::default()
            }),
        }
    }

    pub fn failing_on(delay: Duration, key_suffix: &str) -> Self {
        Self {
            inner: Arc::new(TimedInner {
                delay,
                fail_on: Some(key_suffix.to_string()),
                ..TimedInner::default()
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> Vec<String> {
        self.inner.puts.lock().unwrap().clone()
    }

    pub fn stored_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .stored
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    async fn put(&self, key: &str, path: &Path, progress: &ProgressListener) -> Result<()> {
        let inner = &self.inner;
        inner.puts.lock().unwrap().push(key.to_string());
        let current = inner.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_concurrent.fetch_max(current, Ordering::SeqCst);

        let bytes = std::fs::read(path).map_err(|e| Error::Filesystem {
            path: path.to_path_buf(),
            source: e,
        });
        let result = match bytes {
            Ok(bytes) => {
                let total = bytes.len() as i64;
                progress(ProgressEvent::new(ProgressEventKind::Started, 0, total));
                progress(ProgressEvent::new(ProgressEventKind::Data, total / 2, total));
                if !inner.delay.is_zero() {
                    tokio::time::sleep(inner.delay).await;
                }
                if inner.fail_on.as_deref().is_some_and(|s| key.ends_with(s)) {
                    Err(Error::Storage {
                        key: key.to_string(),
                        message: "http 403 Forbidden".to_string(),
                    })
                } else {
                    progress(ProgressEvent::new(ProgressEventKind::Data, total, total));
                    inner.stored.lock().unwrap().push((key.to_string(), bytes));
                    progress(ProgressEvent::new(ProgressEventKind::Completed, total, total));
                    Ok(())
                }
            }
            Err(e) => Err(e),
        };
        inner.concurrent.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl ObjectStore for TimedStore {
    fn provider(&self) -> &'static str {
        "test.timed"
    }

    fn put_object_from_file<'a>(
        &'a self,
        key: &'a str,
        path: &'a Path,
        progress: ProgressListener,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let res = self.put(key, path, &progress).await;
            if res.is_err() {
                progress(ProgressEvent::new(ProgressEventKind::Failed, 0, 0));
            }
            res
        })
    }
}

impl StoreConnector for TimedStore {
    fn connect(&self, _credentials: &StorageCredentials) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(self.clone()))
    }
}

/// Display that records every call in order.
#[derive(Default)]
pub struct RecordingDisplay {
    events: Mutex<Vec<String>>,
}

impl RecordingDisplay {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl StatusDisplay for RecordingDisplay {
    fn pause(&self) {
        self.events.lock().unwrap().push("pause".to_string());
    }

    fn resume(&self) {
        self.events.lock().unwrap().push("resume".to_string());
    }

    fn update(&self, message: &str) {
        self.events.lock().unwrap().push(format!("update:{message}"));
    }
}
