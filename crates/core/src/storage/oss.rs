use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{
    ObjectStore, ProgressEvent, ProgressEventKind, ProgressListener, StorageCredentials,
    StoreConnector,
};
use crate::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

const SECURITY_TOKEN_HEADER: &str = "x-oss-security-token";
const PUT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Bucket and endpoint encoded in a credential host such as
/// `https://my-bucket.oss-cn-hangzhou.aliyuncs.com`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OssLocation {
    pub scheme: String,
    pub bucket: String,
    pub endpoint: String,
}

impl OssLocation {
    pub fn parse(host: &str) -> Result<Self> {
        let host = host.trim().trim_end_matches('/');
        let (scheme, rest) = match host.split_once("://") {
            Some((scheme, rest)) => (scheme.to_string(), rest),
            None => ("https".to_string(), host),
        };
        let (bucket, endpoint) = rest.split_once('.').ok_or_else(|| Error::InvalidConfig {
            message: format!("storage host has no bucket label: {host}"),
        })?;
        if bucket.is_empty() || endpoint.is_empty() {
            return Err(Error::InvalidConfig {
                message: format!("storage host is malformed: {host}"),
            });
        }
        Ok(Self {
            scheme,
            bucket: bucket.to_string(),
            endpoint: endpoint.to_string(),
        })
    }

    pub fn object_url(&self, key: &str) -> Result<reqwest::Url> {
        let base = format!("{}://{}.{}/", self.scheme, self.bucket, self.endpoint);
        let mut url = reqwest::Url::parse(&base).map_err(|e| Error::InvalidConfig {
            message: format!("invalid storage url {base}: {e}"),
        })?;
        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig {
                message: format!("storage url cannot carry a path: {base}"),
            })?
            .pop_if_empty()
            .extend(key.split('/'));
        Ok(url)
    }
}

/// Header-signature string for a PUT carrying only the STS token as OSS header.
pub fn string_to_sign(
    content_type: &str,
    date: &str,
    security_token: &str,
    bucket: &str,
    key: &str,
) -> String {
    format!("PUT\n\n{content_type}\n{date}\n{SECURITY_TOKEN_HEADER}:{security_token}\n/{bucket}/{key}")
}

pub fn sign(access_key_secret: &str, string_to_sign: &str) -> Result<String> {
    let mut mac =
        HmacSha1::new_from_slice(access_key_secret.as_bytes()).map_err(|e| {
            Error::InvalidConfig {
                message: format!("invalid access key secret: {e}"),
            }
        })?;
    mac.update(string_to_sign.as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js" | "mjs") => "application/javascript",
        Some("json" | "map") => "application/json",
        Some("txt") => "text/plain",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("wasm") => "application/wasm",
        Some("pdf") => "application/pdf",
        Some("gz") => "application/gzip",
        _ => "application/octet-stream",
    }
}

fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

pub struct OssStore {
    location: OssLocation,
    credentials: StorageCredentials,
    client: reqwest::Client,
}

impl OssStore {
    pub fn new(credentials: StorageCredentials, client: reqwest::Client) -> Result<Self> {
        let location = OssLocation::parse(&credentials.host)?;
        Ok(Self {
            location,
            credentials,
            client,
        })
    }

    pub fn location(&self) -> &OssLocation {
        &self.location
    }

    async fn put(&self, key: &str, path: &Path, progress: &ProgressListener) -> Result<()> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::filesystem(path, e))?;
        let total = file
            .metadata()
            .await
            .map_err(|e| Error::filesystem(path, e))?
            .len() as i64;

        let content_type = content_type_for(path);
        let date = http_date();
        let signature = sign(
            &self.credentials.access_key_secret,
            &string_to_sign(
                content_type,
                &date,
                &self.credentials.security_token,
                &self.location.bucket,
                key,
            ),
        )?;
        let url = self.location.object_url(key)?;

        progress(ProgressEvent::new(ProgressEventKind::Started, 0, total));

        let listener = progress.clone();
        let mut consumed: i64 = 0;
        let body = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                consumed += bytes.len() as i64;
                listener(ProgressEvent::new(ProgressEventKind::Data, consumed, total));
            }
            chunk
        });

        debug!(
            event = "io.oss.put",
            bucket = %self.location.bucket,
            key,
            bytes = total,
            "io.oss.put"
        );
        let res = self
            .client
            .put(url)
            .header(reqwest::header::DATE, &date)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, total)
            .header(SECURITY_TOKEN_HEADER, &self.credentials.security_token)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("OSS {}:{signature}", self.credentials.access_key_id),
            )
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| Error::Storage {
                key: key.to_string(),
                message: format!("request failed: {e}"),
            })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(Error::Storage {
                key: key.to_string(),
                message: format!("http {status}: {body}"),
            });
        }

        progress(ProgressEvent::new(ProgressEventKind::Completed, total, total));
        Ok(())
    }
}

impl ObjectStore for OssStore {
    fn provider(&self) -> &'static str {
        "aliyun.oss"
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

/// Connects to OSS with a shared HTTP client.
#[derive(Debug, Clone)]
pub struct OssConnector {
    client: reqwest::Client,
}

impl OssConnector {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PUT_TIMEOUT)
            .build()
            .map_err(|e| Error::transport(format!("build http client failed: {e}")))?;
        Ok(Self { client })
    }
}

impl StoreConnector for OssConnector {
    fn connect(&self, credentials: &StorageCredentials) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(OssStore::new(
            credentials.clone(),
            self.client.clone(),
        )?))
    }
}
