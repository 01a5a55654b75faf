//! Local content store behind the `/uploads/<category>/<filename>` URL
//! convention. The rest of the system only sees the `MediaStore` trait.

use std::io::Cursor;
use std::path::PathBuf;

use async_trait::async_trait;
use image::imageops::FilterType;
use rand::Rng;
use thiserror::Error;

use crate::models::MediaType;

#[derive(Debug, Error)]
pub enum MediaStoreError {
    #[error("not_found")]
    NotFound,
    #[error("invalid path")]
    InvalidPath,
    #[error("other: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaCategory {
    Images,
    Videos,
    Audios,
    Avatars,
    Thumbnails,
}

impl MediaCategory {
    pub const ALL: [MediaCategory; 5] = [
        MediaCategory::Images,
        MediaCategory::Videos,
        MediaCategory::Audios,
        MediaCategory::Avatars,
        MediaCategory::Thumbnails,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaCategory::Images => "images",
            MediaCategory::Videos => "videos",
            MediaCategory::Audios => "audios",
            MediaCategory::Avatars => "avatars",
            MediaCategory::Thumbnails => "thumbnails",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }

    /// Upload destination: the avatar form field wins, otherwise the
    /// sniffed media type decides, with images as the catch-all.
    pub fn for_upload(field_name: &str, media_type: MediaType) -> Self {
        if field_name == "avatar" {
            return MediaCategory::Avatars;
        }
        match media_type {
            MediaType::Video => MediaCategory::Videos,
            MediaType::Audio => MediaCategory::Audios,
            _ => MediaCategory::Images,
        }
    }
}

/// Descriptor of a freshly stored file.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub filename: String,
    pub file_url: String,
    pub size: i64,
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Persist bytes under a fresh filename with the given extension.
    async fn store(&self, category: MediaCategory, ext: &str, bytes: &[u8]) -> Result<StoredFile, MediaStoreError>;
    /// Best-effort downscaled thumbnail for a stored image; returns the
    /// public thumbnail URL or None when one cannot be produced.
    async fn generate_thumbnail(&self, category: MediaCategory, filename: &str) -> Option<String>;
    async fn load(&self, category: MediaCategory, filename: &str) -> Result<(Vec<u8>, String), MediaStoreError>;
    /// Delete by public URL; a missing file is not an error.
    async fn delete(&self, file_url: &str) -> Result<(), MediaStoreError>;
}

pub struct FsMediaStore {
    root: PathBuf,
}

const THUMBNAIL_MAX_WIDTH: u32 = 400;

/// Decode, cap the width at [`THUMBNAIL_MAX_WIDTH`] preserving aspect
/// ratio (small images pass through unscaled), and re-encode in the
/// source format.
fn downscale(bytes: &[u8]) -> image::ImageResult<Vec<u8>> {
    let format = image::guess_format(bytes)?;
    let mut img = image::load_from_memory_with_format(bytes, format)?;
    if img.width() > THUMBNAIL_MAX_WIDTH {
        img = img.resize(THUMBNAIL_MAX_WIDTH, u32::MAX, FilterType::Lanczos3);
    }
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), format)?;
    Ok(out)
}

impl FsMediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        for cat in MediaCategory::ALL {
            let _ = std::fs::create_dir_all(root.join(cat.as_str()));
        }
        Self { root }
    }

    pub fn from_env() -> Self {
        let dir = std::env::var("UPLOAD_DIR").unwrap_or_else(|_| "uploads".to_string());
        Self::new(dir)
    }

    fn fresh_filename(ext: &str) -> String {
        let suffix: u64 = rand::thread_rng().gen_range(0..1_000_000_000);
        let stamp = chrono::Utc::now().timestamp_millis();
        if ext.is_empty() {
            format!("{stamp}-{suffix}")
        } else {
            format!("{stamp}-{suffix}.{ext}")
        }
    }

    fn checked_path(&self, category: MediaCategory, filename: &str) -> Result<PathBuf, MediaStoreError> {
        if filename.is_empty() || filename.contains('/') || filename.contains("..") {
            return Err(MediaStoreError::InvalidPath);
        }
        Ok(self.root.join(category.as_str()).join(filename))
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn store(&self, category: MediaCategory, ext: &str, bytes: &[u8]) -> Result<StoredFile, MediaStoreError> {
        let filename = Self::fresh_filename(ext);
        let path = self.checked_path(category, &filename)?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| MediaStoreError::Other(e.to_string()))?;
        Ok(StoredFile {
            file_url: format!("/uploads/{}/{}", category.as_str(), filename),
            filename,
            size: bytes.len() as i64,
        })
    }

    async fn generate_thumbnail(&self, category: MediaCategory, filename: &str) -> Option<String> {
        let src = self.checked_path(category, filename).ok()?;
        let thumb_name = format!("thumb_{filename}");
        let dst = self.checked_path(MediaCategory::Thumbnails, &thumb_name).ok()?;
        let bytes = match tokio::fs::read(&src).await {
            Ok(b) => b,
            Err(e) => {
                log::warn!("thumbnail source read failed for {filename}: {e}");
                return None;
            }
        };
        let thumb = match downscale(&bytes) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("thumbnail generation failed for {filename}: {e}");
                return None;
            }
        };
        match tokio::fs::write(&dst, thumb).await {
            Ok(()) => Some(format!("/uploads/thumbnails/{thumb_name}")),
            Err(e) => {
                log::warn!("thumbnail write failed for {filename}: {e}");
                None
            }
        }
    }

    async fn load(&self, category: MediaCategory, filename: &str) -> Result<(Vec<u8>, String), MediaStoreError> {
        let path = self.checked_path(category, filename)?;
        let bytes = tokio::fs::read(&path).await.map_err(|_| MediaStoreError::NotFound)?;
        let mime = infer::get(&bytes)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".into());
        Ok((bytes, mime))
    }

    async fn delete(&self, file_url: &str) -> Result<(), MediaStoreError> {
        let rel = file_url.strip_prefix("/uploads/").ok_or(MediaStoreError::InvalidPath)?;
        let (cat, name) = rel.split_once('/').ok_or(MediaStoreError::InvalidPath)?;
        let category = MediaCategory::parse(cat).ok_or(MediaStoreError::InvalidPath)?;
        let path = self.checked_path(category, name)?;
        // best-effort: a file already gone is fine
        let _ = tokio::fs::remove_file(&path).await;
        Ok(())
    }
}
