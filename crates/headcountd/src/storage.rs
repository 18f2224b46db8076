//! On-disk upload store: originals, annotated copies, and the listing /
//! retrieval endpoints that read them back.

use chrono::{DateTime, Local, Utc};
use headcount_core::source::allowed_file;
use headcount_core::{StoredImage, UploadSink};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const URL_PREFIX: &str = "/uploads";
const ANNOTATED_PREFIX: &str = "annotated_";
const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid filename")]
    InvalidName,
    #[error("file not found")]
    NotFound,
    #[error("upload directory error: {0}")]
    Io(#[from] io::Error),
}

/// One entry of `GET /list-uploads`.
#[derive(Debug, Clone, Serialize)]
pub struct UploadEntry {
    pub filename: String,
    pub url: String,
    pub size: u64,
    pub uploaded_at: String,
}

pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    /// Open (creating if needed) the upload directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All stored images, newest name last.
    pub fn list(&self) -> Result<Vec<UploadEntry>, StorageError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let Some(filename) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if !allowed_file(&filename) {
                continue;
            }
            let uploaded_at = metadata
                .created()
                .or_else(|_| metadata.modified())
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
                .unwrap_or_default();
            entries.push(UploadEntry {
                url: url_for(&filename),
                size: metadata.len(),
                filename,
                uploaded_at,
            });
        }
        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(entries)
    }

    /// Read a stored file by bare name. Names carrying path separators or
    /// `..` are rejected before touching the filesystem.
    pub fn read(&self, filename: &str) -> Result<(Vec<u8>, &'static str), StorageError> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.contains("..")
        {
            return Err(StorageError::InvalidName);
        }
        let path = self.dir.join(filename);
        match fs::read(&path) {
            Ok(bytes) => Ok((bytes, content_type(filename))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    /// Write `bytes` under `name`, suffixing a counter if the name is taken.
    fn write_new(&self, name: &str, bytes: &[u8]) -> io::Result<String> {
        let (stem, ext) = split_ext(name);
        let mut candidate = name.to_string();
        for n in 1..=MAX_NAME_ATTEMPTS {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.dir.join(&candidate))
            {
                Ok(mut file) => {
                    file.write_all(bytes)?;
                    return Ok(candidate);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    candidate = format!("{stem}_{n}{ext}");
                }
                Err(err) => return Err(err),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free filename for {name}"),
        ))
    }
}

impl UploadSink for UploadStore {
    fn store_upload(&self, original_name: &str, bytes: &[u8]) -> io::Result<StoredImage> {
        let filename = self.write_new(&generate_filename(original_name, Local::now()), bytes)?;
        tracing::debug!(%filename, bytes = bytes.len(), "upload written");
        Ok(StoredImage {
            url: url_for(&filename),
            filename,
        })
    }

    fn store_annotated(&self, upload: &StoredImage, jpeg: &[u8]) -> io::Result<StoredImage> {
        let (stem, _) = split_ext(&upload.filename);
        let filename = self.write_new(&format!("{ANNOTATED_PREFIX}{stem}.jpg"), jpeg)?;
        Ok(StoredImage {
            url: url_for(&filename),
            filename,
        })
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `YYYYmmdd_HHMMSS_mmm_<sanitized name>`
pub fn generate_filename(original: &str, now: DateTime<Local>) -> String {
    let sanitized = sanitize_filename(original).replace("..", "_");
    format!("{}_{}", now.format("%Y%m%d_%H%M%S_%3f"), sanitized)
}

pub fn content_type(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn url_for(filename: &str) -> String {
    format!("{URL_PREFIX}/{filename}")
}

fn split_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}
