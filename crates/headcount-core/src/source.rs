//! Image intake from multipart uploads and remote URLs.
//!
//! Validates the request, obtains raw bytes, and decodes them into an RGB
//! pixel buffer. Uploads may additionally be handed to an [`UploadSink`] for
//! audit storage; sink failures never affect the outcome of a request.

use image::RgbImage;
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;

pub const ALLOWED_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "bmp", "webp"];
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REDIRECTS: usize = 10;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("{0}")]
    MissingInput(&'static str),
    /// `reason` is the short client-facing message; `details` carries the
    /// specifics.
    #[error("{reason}")]
    InvalidInput {
        reason: &'static str,
        details: Option<String>,
    },
    #[error("failed to download image: {0}")]
    Fetch(String),
    #[error("invalid image format: {0}")]
    Decode(String),
}

/// A file part taken from a multipart request.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Where the image for a request comes from. `None` means the caller did not
/// supply the field at all.
#[derive(Debug, Clone)]
pub enum ImageRequest {
    Upload(Option<UploadedFile>),
    Url(Option<String>),
}

/// Reference to an image persisted by an [`UploadSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredImage {
    pub filename: String,
    pub url: String,
}

/// Durable storage for uploaded originals and their annotated copies.
pub trait UploadSink: Send + Sync {
    fn store_upload(&self, original_name: &str, bytes: &[u8]) -> std::io::Result<StoredImage>;
    fn store_annotated(&self, upload: &StoredImage, jpeg: &[u8]) -> std::io::Result<StoredImage>;
}

/// Raw bytes that passed validation, plus the stored copy if one was made.
pub struct AcquiredImage {
    pub bytes: Vec<u8>,
    pub stored: Option<StoredImage>,
}

/// Returns true if `filename` carries one of the [`ALLOWED_EXTENSIONS`].
pub fn allowed_file(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| ALLOWED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Decode encoded image bytes into an RGB8 buffer.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, SourceError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| SourceError::Decode(e.to_string()))?
        .to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(SourceError::Decode("image dimensions are zero".into()));
    }
    Ok(image)
}

pub struct ImageSource {
    max_bytes: usize,
    fetch_timeout: Duration,
    sink: Option<Arc<dyn UploadSink>>,
    // Built on first use so it is never constructed on an async executor thread.
    client: OnceLock<reqwest::blocking::Client>,
}

impl ImageSource {
    pub fn new(max_bytes: usize, fetch_timeout: Duration) -> Self {
        Self {
            max_bytes,
            fetch_timeout,
            sink: None,
            client: OnceLock::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn UploadSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn sink(&self) -> Option<&Arc<dyn UploadSink>> {
        self.sink.as_ref()
    }

    /// Validate the request and decode its image.
    pub fn fetch(&self, request: ImageRequest) -> Result<RgbImage, SourceError> {
        let acquired = self.acquire(request)?;
        decode_image(&acquired.bytes)
    }

    /// Validate the request and obtain raw bytes without decoding them.
    pub fn acquire(&self, request: ImageRequest) -> Result<AcquiredImage, SourceError> {
        match request {
            ImageRequest::Upload(file) => self.accept_upload(file),
            ImageRequest::Url(url) => {
                let bytes = self.download(url.as_deref())?;
                Ok(AcquiredImage { bytes, stored: None })
            }
        }
    }

    fn accept_upload(&self, file: Option<UploadedFile>) -> Result<AcquiredImage, SourceError> {
        let file = file.ok_or(SourceError::MissingInput("No image file provided"))?;

        if file.filename.trim().is_empty() {
            return Err(SourceError::InvalidInput {
                reason: "No file selected",
                details: None,
            });
        }
        if !allowed_file(&file.filename) {
            return Err(SourceError::InvalidInput {
                reason: "Invalid file type",
                details: Some(format!(
                    "allowed extensions are {}",
                    ALLOWED_EXTENSIONS.join(", ")
                )),
            });
        }
        if file.bytes.len() > self.max_bytes {
            return Err(SourceError::InvalidInput {
                reason: "File too large",
                details: Some(format!(
                    "{} bytes exceeds the {} byte limit",
                    file.bytes.len(),
                    self.max_bytes
                )),
            });
        }

        let stored = self.sink.as_ref().and_then(|sink| {
            match sink.store_upload(&file.filename, &file.bytes) {
                Ok(stored) => {
                    tracing::debug!(filename = %stored.filename, "upload stored");
                    Some(stored)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to store upload; continuing");
                    None
                }
            }
        });

        Ok(AcquiredImage {
            bytes: file.bytes,
            stored,
        })
    }

    fn download(&self, url: Option<&str>) -> Result<Vec<u8>, SourceError> {
        let url = url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(SourceError::MissingInput("No image URL provided"))?;

        tracing::info!(url, "downloading image");
        let mut response = self.client()?.get(url).send().map_err(|e| {
            if e.is_timeout() {
                SourceError::Fetch(format!(
                    "timed out after {}s",
                    self.fetch_timeout.as_secs_f32()
                ))
            } else {
                SourceError::Fetch(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Fetch(format!("HTTP status {status}")));
        }
        if let Some(len) = response.content_length() {
            if len > self.max_bytes as u64 {
                return Err(SourceError::Fetch(format!(
                    "remote image is {len} bytes, limit is {}",
                    self.max_bytes
                )));
            }
        }

        // Content-Length may be absent (chunked) or wrong; stop reading one
        // byte past the limit either way.
        let mut bytes = Vec::new();
        (&mut response)
            .take(self.max_bytes as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| SourceError::Fetch(e.to_string()))?;
        if bytes.len() > self.max_bytes {
            return Err(SourceError::Fetch(format!(
                "remote image exceeds the {} byte limit",
                self.max_bytes
            )));
        }

        tracing::debug!(bytes = bytes.len(), "image downloaded");
        Ok(bytes)
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, SourceError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.fetch_timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| SourceError::Fetch(format!("HTTP client setup failed: {e}")))?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl Default for ImageSource {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_FETCH_TIMEOUT)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::{Cursor, Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([40, 90, 160]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn upload(name: &str, bytes: Vec<u8>) -> ImageRequest {
        ImageRequest::Upload(Some(UploadedFile {
            filename: name.into(),
            bytes,
        }))
    }

    /// Serve exactly one HTTP response on a loopback port and return its URL.
    fn serve_once(status_line: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut req = [0u8; 1024];
                let _ = stream.read(&mut req);
                let header = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes());
                let _ = stream.write_all(&body);
            }
        });
        format!("http://{addr}/photo.png")
    }

    /// Like `serve_once`, but with chunked transfer encoding and no
    /// Content-Length.
    fn serve_chunked(body: Vec<u8>, chunk: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut req = [0u8; 1024];
                let _ = stream.read(&mut req);
                let header = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
                let _ = stream.write_all(header.as_bytes());
                for part in body.chunks(chunk) {
                    let _ = stream.write_all(format!("{:x}\r\n", part.len()).as_bytes());
                    let _ = stream.write_all(part);
                    let _ = stream.write_all(b"\r\n");
                }
                let _ = stream.write_all(b"0\r\n\r\n");
            }
        });
        format!("http://{addr}/photo.png")
    }

    #[test]
    fn test_allowed_file() {
        assert!(allowed_file("class.png"));
        assert!(allowed_file("CLASS.JPEG"));
        assert!(allowed_file("a.b.webp"));
        assert!(!allowed_file("notes.txt"));
        assert!(!allowed_file("noextension"));
        assert!(!allowed_file(""));
    }

    #[test]
    fn test_upload_missing_file() {
        let err = ImageSource::default()
            .fetch(ImageRequest::Upload(None))
            .unwrap_err();
        assert!(matches!(err, SourceError::MissingInput(_)));
    }

    #[test]
    fn test_upload_empty_filename() {
        let err = ImageSource::default()
            .fetch(upload("  ", png_bytes(4, 4)))
            .unwrap_err();
        assert!(matches!(err, SourceError::InvalidInput { reason: "No file selected", .. }));
    }

    #[test]
    fn test_upload_bad_extension() {
        let err = ImageSource::default()
            .fetch(upload("photo.exe", png_bytes(4, 4)))
            .unwrap_err();
        match err {
            SourceError::InvalidInput { reason, details } => {
                assert_eq!(reason, "Invalid file type");
                assert!(details.unwrap().contains("png"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_upload_too_large() {
        let source = ImageSource::new(16, DEFAULT_FETCH_TIMEOUT);
        let err = source.fetch(upload("photo.png", vec![0u8; 17])).unwrap_err();
        match err {
            SourceError::InvalidInput { reason, details } => {
                assert_eq!(reason, "File too large");
                assert_eq!(details.unwrap(), "17 bytes exceeds the 16 byte limit");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_upload_undecodable() {
        let err = ImageSource::default()
            .fetch(upload("photo.jpg", b"definitely not a jpeg".to_vec()))
            .unwrap_err();
        assert!(matches!(err, SourceError::Decode(_)));
    }

    #[test]
    fn test_upload_decodes() {
        let img = ImageSource::default()
            .fetch(upload("photo.png", png_bytes(32, 24)))
            .unwrap();
        assert_eq!(img.dimensions(), (32, 24));
    }

    #[test]
    fn test_url_missing_or_blank() {
        let source = ImageSource::default();
        assert!(matches!(
            source.fetch(ImageRequest::Url(None)).unwrap_err(),
            SourceError::MissingInput(_)
        ));
        assert!(matches!(
            source.fetch(ImageRequest::Url(Some("   ".into()))).unwrap_err(),
            SourceError::MissingInput(_)
        ));
    }

    #[test]
    fn test_url_unreachable() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let source = ImageSource::new(DEFAULT_MAX_UPLOAD_BYTES, Duration::from_secs(2));
        let err = source
            .fetch(ImageRequest::Url(Some(format!("http://127.0.0.1:{port}/x.png"))))
            .unwrap_err();
        assert!(matches!(err, SourceError::Fetch(_)));
    }

    #[test]
    fn test_url_non_success_status() {
        let url = serve_once("404 Not Found", b"gone".to_vec());
        let err = ImageSource::default()
            .fetch(ImageRequest::Url(Some(url)))
            .unwrap_err();
        assert!(matches!(err, SourceError::Fetch(ref m) if m.contains("404")));
    }

    #[test]
    fn test_url_body_not_an_image() {
        let url = serve_once("200 OK", b"<html>hello</html>".to_vec());
        let err = ImageSource::default()
            .fetch(ImageRequest::Url(Some(url)))
            .unwrap_err();
        assert!(matches!(err, SourceError::Decode(_)));
    }

    #[test]
    fn test_url_chunked_body_over_limit() {
        let url = serve_chunked(vec![0u8; 4096], 64);
        let source = ImageSource::new(1000, Duration::from_secs(5));
        let err = source.fetch(ImageRequest::Url(Some(url))).unwrap_err();
        assert!(matches!(err, SourceError::Fetch(ref m) if m.contains("1000 byte limit")));
    }

    #[test]
    fn test_url_chunked_body_within_limit() {
        let url = serve_chunked(png_bytes(12, 8), 50);
        let img = ImageSource::default()
            .fetch(ImageRequest::Url(Some(url)))
            .unwrap();
        assert_eq!(img.dimensions(), (12, 8));
    }

    #[test]
    fn test_url_downloads_and_decodes() {
        let url = serve_once("200 OK", png_bytes(20, 10));
        let img = ImageSource::default()
            .fetch(ImageRequest::Url(Some(url)))
            .unwrap();
        assert_eq!(img.dimensions(), (20, 10));
    }

    struct RecordingSink(Mutex<Vec<String>>);

    impl UploadSink for RecordingSink {
        fn store_upload(&self, original_name: &str, _bytes: &[u8]) -> std::io::Result<StoredImage> {
            self.0.lock().unwrap().push(original_name.to_string());
            Ok(StoredImage {
                filename: format!("stored_{original_name}"),
                url: format!("/uploads/stored_{original_name}"),
            })
        }

        fn store_annotated(&self, upload: &StoredImage, _jpeg: &[u8]) -> std::io::Result<StoredImage> {
            Ok(upload.clone())
        }
    }

    struct BrokenSink;

    impl UploadSink for BrokenSink {
        fn store_upload(&self, _: &str, _: &[u8]) -> std::io::Result<StoredImage> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        }

        fn store_annotated(&self, _: &StoredImage, _: &[u8]) -> std::io::Result<StoredImage> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        }
    }

    #[test]
    fn test_sink_receives_valid_uploads_only() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let source = ImageSource::default().with_sink(sink.clone());

        let acquired = source.acquire(upload("room.png", png_bytes(4, 4))).unwrap();
        assert_eq!(acquired.stored.unwrap().filename, "stored_room.png");

        let _ = source.acquire(upload("room.txt", png_bytes(4, 4)));
        assert_eq!(*sink.0.lock().unwrap(), vec!["room.png".to_string()]);
    }

    #[test]
    fn test_sink_failure_does_not_fail_upload() {
        let source = ImageSource::default().with_sink(Arc::new(BrokenSink));
        let acquired = source.acquire(upload("room.png", png_bytes(4, 4))).unwrap();
        assert!(acquired.stored.is_none());
        assert!(decode_image(&acquired.bytes).is_ok());
    }
}
