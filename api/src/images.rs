//! Cover-image hosting behind the [`ImageStore`] seam.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::config::{AppConfig, ImageBackend};
use crate::error::AppError;

pub const MAX_IMAGE_BYTES: usize = 2 * 1024 * 1024;
const ALLOWED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone, PartialEq)]
pub struct UploadedImage {
    pub url: String,
    pub public_id: String,
    pub format: String,
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, file_name: &str) -> anyhow::Result<UploadedImage>;

    async fn delete(&self, public_id: &str) -> anyhow::Result<()>;
}

/// Checks size and extension of an uploaded cover image and returns the
/// lowercased extension.
pub fn validate_image(file_name: &str, len: usize) -> Result<String, AppError> {
    if len == 0 {
        return Err(AppError::invalid("coverImage", "No image was supplied"));
    }
    if len > MAX_IMAGE_BYTES {
        return Err(AppError::invalid("coverImage", "Image must not exceed 2 MB"));
    }
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|e| ALLOWED_EXTENSIONS.contains(&e.as_str()))
        .ok_or_else(|| AppError::invalid("coverImage", "Only .jpg, .jpeg and .png images are allowed"))?;
    Ok(ext)
}

pub async fn from_config(config: &AppConfig) -> anyhow::Result<Arc<dyn ImageStore>> {
    match config.image_store {
        ImageBackend::Local => {
            let url_prefix = format!("{}/uploads", config.public_url.trim_end_matches('/'));
            let store = LocalImageStore::create(PathBuf::from(&config.upload_dir), url_prefix).await?;
            Ok(Arc::new(store))
        }
        ImageBackend::Cloudinary => Ok(Arc::new(CloudinaryStore::from_config(config)?)),
    }
}

// ── Local disk ──

/// Files in one directory, named `{sha256 prefix}-{upload id}.{ext}`. The public
/// id is the file name, so each upload owns its file even when bytes repeat.
pub struct LocalImageStore {
    root: PathBuf,
    url_prefix: String,
}

impl LocalImageStore {
    pub async fn create(root: PathBuf, url_prefix: String) -> anyhow::Result<Self> {
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating upload dir {}", root.display()))?;
        Ok(Self { root, url_prefix })
    }

    fn path_for(&self, public_id: &str) -> anyhow::Result<PathBuf> {
        let valid = !public_id.is_empty()
            && public_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
            && !public_id.starts_with(['.', '-']);
        anyhow::ensure!(valid, "malformed image id {public_id:?}");
        Ok(self.root.join(public_id))
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn upload(&self, bytes: Vec<u8>, file_name: &str) -> anyhow::Result<UploadedImage> {
        let format = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_ascii_lowercase();
        let hash = hex::encode(Sha256::digest(&bytes));
        let public_id = format!("{}-{}.{format}", &hash[..16], Uuid::new_v4().simple());

        let path = self.path_for(&public_id)?;
        fs::write(&path, &bytes).await?;

        Ok(UploadedImage {
            url: format!("{}/{public_id}", self.url_prefix),
            public_id,
            format,
        })
    }

    async fn delete(&self, public_id: &str) -> anyhow::Result<()> {
        let path = self.path_for(public_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(public_id, "image already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ── Cloudinary ──

pub struct CloudinaryStore {
    client: reqwest::Client,
    cloud_name: String,
    api_key: String,
    api_secret: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: String,
    public_id: String,
    format: String,
}

#[derive(Deserialize)]
struct DestroyResponse {
    result: String,
}

impl CloudinaryStore {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let setting = |value: &Option<String>, name: &str| {
            value
                .clone()
                .with_context(|| format!("{name} is required for the cloudinary image store"))
        };
        Ok(Self {
            client: reqwest::Client::new(),
            cloud_name: setting(&config.cloudinary_cloud_name, "cloudinary_cloud_name")?,
            api_key: setting(&config.cloudinary_api_key, "cloudinary_api_key")?,
            api_secret: setting(&config.cloudinary_api_secret, "cloudinary_api_secret")?,
        })
    }

    fn endpoint(&self, action: &str) -> String {
        format!(
            "https://api.cloudinary.com/v1_1/{}/image/{action}",
            self.cloud_name
        )
    }
}

/// Signs `params` the way Cloudinary expects: sorted `k=v` pairs joined by
/// `&`, followed by the secret.
fn sign(params: &[(&str, &str)], secret: &str) -> String {
    let mut sorted = params.to_vec();
    sorted.sort_by_key(|(k, _)| *k);
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    hex::encode(Sha256::digest(format!("{joined}{secret}").as_bytes()))
}

#[async_trait]
impl ImageStore for CloudinaryStore {
    async fn upload(&self, bytes: Vec<u8>, file_name: &str) -> anyhow::Result<UploadedImage> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign(&[("timestamp", timestamp.as_str())], &self.api_secret);

        let file = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("api_key", self.api_key.clone())
            .text("timestamp", timestamp)
            .text("signature", signature)
            .text("signature_algorithm", "sha256");

        let resp: UploadResponse = self
            .client
            .post(self.endpoint("upload"))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        tracing::info!(public_id = %resp.public_id, "image uploaded");
        Ok(UploadedImage {
            url: resp.secure_url,
            public_id: resp.public_id,
            format: resp.format,
        })
    }

    async fn delete(&self, public_id: &str) -> anyhow::Result<()> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign(
            &[("public_id", public_id), ("timestamp", timestamp.as_str())],
            &self.api_secret,
        );

        let resp: DestroyResponse = self
            .client
            .post(self.endpoint("destroy"))
            .form(&[
                ("public_id", public_id),
                ("timestamp", timestamp.as_str()),
                ("api_key", self.api_key.as_str()),
                ("signature", signature.as_str()),
                ("signature_algorithm", "sha256"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        anyhow::ensure!(
            resp.result == "ok" || resp.result == "not found",
            "cloudinary refused to delete {public_id}: {}",
            resp.result
        );
        Ok(())
    }
}
