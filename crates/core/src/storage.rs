use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub mod oss;

pub use oss::{OssConnector, OssStore};

/// Short-lived credentials handed out by the control plane for one upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageCredentials {
    pub host: String,
    #[serde(rename = "accessKeyID")]
    pub access_key_id: String,
    pub access_key_secret: String,
    pub security_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEventKind {
    Started,
    Data,
    Completed,
    Failed,
}

/// Byte counters are cumulative for the object being transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub kind: ProgressEventKind,
    pub consumed_bytes: i64,
    pub total_bytes: i64,
}

impl ProgressEvent {
    pub fn new(kind: ProgressEventKind, consumed_bytes: i64, total_bytes: i64) -> Self {
        Self {
            kind,
            consumed_bytes,
            total_bytes,
        }
    }
}

pub type ProgressListener = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

pub trait ObjectStore: Send + Sync {
    fn provider(&self) -> &'static str;

    fn put_object_from_file<'a>(
        &'a self,
        key: &'a str,
        path: &'a Path,
        progress: ProgressListener,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Builds an object store client from freshly issued credentials.
pub trait StoreConnector: Send + Sync {
    fn connect(&self, credentials: &StorageCredentials) -> Result<Arc<dyn ObjectStore>>;
}

#[derive(Debug, Default)]
struct InMemoryInner {
    uploaded: AtomicUsize,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    credentials: Mutex<Vec<StorageCredentials>>,
}

/// Object store kept in process memory. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<InMemoryInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploaded(&self) -> usize {
        self.inner.uploaded.load(Ordering::Relaxed)
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn object_count(&self) -> usize {
        self.objects().len()
    }

    /// Credentials seen by `connect`, oldest first.
    pub fn connected_with(&self) -> Vec<StorageCredentials> {
        self.inner
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.inner
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ObjectStore for InMemoryStore {
    fn provider(&self) -> &'static str {
        "test.mem"
    }

    fn put_object_from_file<'a>(
        &'a self,
        key: &'a str,
        path: &'a Path,
        progress: ProgressListener,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| Error::filesystem(path, e))?;
            let total = bytes.len() as i64;
            progress(ProgressEvent::new(ProgressEventKind::Started, 0, total));
            progress(ProgressEvent::new(ProgressEventKind::Data, total, total));
            self.objects().insert(key.to_string(), bytes);
            self.inner.uploaded.fetch_add(1, Ordering::Relaxed);
            progress(ProgressEvent::new(ProgressEventKind::Completed, total, total));
            Ok(())
        })
    }
}

impl StoreConnector for InMemoryStore {
    fn connect(&self, credentials: &StorageCredentials) -> Result<Arc<dyn ObjectStore>> {
        self.inner
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(credentials.clone());
        Ok(Arc::new(self.clone()))
    }
}
