use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const UPLOAD_TIMEOUT_SECS: u64 = 30;

#[async_trait]
pub trait AssetStorage: Send + Sync {
    /// Stores `bytes` at `path` and returns the public URL.
    async fn upload(&self, bytes: Vec<u8>, path: &str, content_type: &str) -> AppResult<String>;
}

/// Deterministic object path for a place photo.
pub fn photo_object_path(region: &str, external_id: &str) -> String {
    let digest = Sha256::digest(external_id.as_bytes());
    let id = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
    format!("places/{region}/{id}.jpg")
}

/// Storage backend chosen by configuration, `None` when photos are disabled.
pub fn from_config(config: &AppConfig) -> AppResult<Option<Arc<dyn AssetStorage>>> {
    if let Some(upload_url) = &config.storage_upload_url {
        let storage = HttpAssetStorage::new(
            upload_url,
            config.storage_public_url.as_deref(),
            config.storage_token.clone(),
        )?;
        return Ok(Some(Arc::new(storage)));
    }
    if let Some(dir) = &config.asset_dir {
        let storage = LocalAssetStorage::new(dir.clone(), config.storage_public_url.as_deref());
        return Ok(Some(Arc::new(storage)));
    }
    Ok(None)
}

pub struct HttpAssetStorage {
    http: reqwest::Client,
    upload_base: String,
    public_base: String,
    token: Option<SecretString>,
}

impl HttpAssetStorage {
    pub fn new(
        upload_base: &str,
        public_base: Option<&str>,
        token: Option<SecretString>,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .build()?;
        let upload_base = upload_base.trim_end_matches('/').to_string();
        Ok(Self {
            http,
            public_base: public_base
                .map(|base| base.trim_end_matches('/').to_string())
                .unwrap_or_else(|| upload_base.clone()),
            upload_base,
            token,
        })
    }
}

#[async_trait]
impl AssetStorage for HttpAssetStorage {
    async fn upload(&self, bytes: Vec<u8>, path: &str, content_type: &str) -> AppResult<String> {
        let size = bytes.len();
        let mut request = self
            .http
            .put(format!("{}/{path}", self.upload_base))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        request.send().await?.error_for_status()?;
        let url = format!("{}/{path}", self.public_base);
        info!(path, size, "asset uploaded");
        Ok(url)
    }
}

/// Writes assets below a directory, for running without object storage.
pub struct LocalAssetStorage {
    root: PathBuf,
    public_base: Option<String>,
}

impl LocalAssetStorage {
    pub fn new(root: PathBuf, public_base: Option<&str>) -> Self {
        Self {
            root,
            public_base: public_base.map(|base| base.trim_end_matches('/').to_string()),
        }
    }
}

#[async_trait]
impl AssetStorage for LocalAssetStorage {
    async fn upload(&self, bytes: Vec<u8>, path: &str, _content_type: &str) -> AppResult<String> {
        if path.split('/').any(|segment| segment == ".." || segment.is_empty()) {
            return Err(AppError::Path(format!("invalid asset path: {path}")));
        }
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &bytes).await?;
        debug!(path = %target.display(), size = bytes.len(), "asset written");

        match &self.public_base {
            Some(base) => Ok(format!("{base}/{path}")),
            None => {
                let absolute = std::fs::canonicalize(&target)?;
                Ok(format!("file://{}", absolute.display()))
            }
        }
    }
}
