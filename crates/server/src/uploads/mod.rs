//! Image uploads
//!
//! Files are stored content-addressed under the upload directory as
//! `<sha256>.<ext>`, so uploading the same image twice yields the same URL.
//! Only a handful of image formats are accepted, identified by their magic
//! bytes rather than the client-declared type.

pub mod handlers;

use crate::error::{Error, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
}

const FORMATS: [ImageFormat; 4] = [
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Gif,
    ImageFormat::Webp,
];

impl ImageFormat {
    /// Identify the format from the leading bytes
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(ImageFormat::Png)
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            Some(ImageFormat::Webp)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Gif => "gif",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Webp => "image/webp",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        FORMATS.into_iter().find(|f| f.extension() == ext)
    }
}

/// Reference returned to the uploader
#[derive(Debug, Clone, Serialize)]
pub struct StoredUpload {
    pub url: String,
    pub hash: String,
    pub content_type: String,
    pub size: u64,
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

pub struct UploadStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub async fn put(&self, data: &[u8]) -> Result<StoredUpload> {
        if data.is_empty() {
            return Err(Error::BadRequest("Empty upload".to_string()));
        }
        if data.len() > self.max_bytes {
            return Err(Error::BadRequest(format!(
                "File is larger than {} MB",
                self.max_bytes / (1024 * 1024)
            )));
        }
        let format = ImageFormat::sniff(data).ok_or_else(|| {
            Error::BadRequest("Only PNG, JPEG, GIF and WebP images are accepted".to_string())
        })?;

        let hash = format!("{:x}", Sha256::digest(data));
        let file_name = format!("{}.{}", hash, format.extension());
        let path = self.dir.join(&file_name);

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("[Uploads] {} already stored", file_name);
        } else {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| Error::Internal(format!("Upload dir: {}", e)))?;
            let tmp = self.dir.join(format!(".{}.{}", file_name, Uuid::new_v4()));
            tokio::fs::write(&tmp, data)
                .await
                .map_err(|e| Error::Internal(format!("Write upload: {}", e)))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| Error::Internal(format!("Store upload: {}", e)))?;
            info!("[Uploads] Stored {} ({} bytes)", file_name, data.len());
        }

        Ok(StoredUpload {
            url: format!("/uploads/{}", file_name),
            hash,
            content_type: format.content_type().to_string(),
            size: data.len() as u64,
        })
    }

    /// Look up by `<hash>` or `<hash>.<ext>`
    pub async fn get(&self, name: &str) -> Result<(Vec<u8>, ImageFormat)> {
        let (hash, ext) = match name.split_once('.') {
            Some((hash, ext)) => (hash, Some(ext)),
            None => (name, None),
        };
        if !is_sha256_hex(hash) {
            return Err(Error::NotFound("Upload"));
        }

        let candidates: Vec<ImageFormat> = match ext {
            Some(ext) => ImageFormat::from_extension(ext).into_iter().collect(),
            None => FORMATS.to_vec(),
        };
        for format in candidates {
            let path = self.dir.join(format!("{}.{}", hash, format.extension()));
            match tokio::fs::read(&path).await {
                Ok(data) => return Ok((data, format)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Internal(format!("Read upload: {}", e))),
            }
        }
        Err(Error::NotFound("Upload"))
    }
}
