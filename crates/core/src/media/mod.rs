pub mod frames;
pub(crate) mod mjpeg;

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use ffmpeg_sidecar::{download, paths::ffmpeg_path};
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::process::Output;

pub use frames::{frame_timestamps, FfmpegFrameExtractor};

pub const JPEG_MIME: &str = "image/jpeg";

/// An encoded still image ready to be sent inline to the analyzer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedImage {
    pub data: Bytes,
    pub mime_type: String,
}

impl EncodedImage {
    pub fn new(data: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn jpeg(data: impl Into<Bytes>) -> Self {
        Self::new(data, JPEG_MIME)
    }

    /// Standard base64 without a `data:` URL prefix.
    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Clone, Debug)]
pub enum VideoSource {
    Path(PathBuf),
    /// In-memory video; `extension` hints the container to ffmpeg.
    Bytes { data: Bytes, extension: Option<String> },
}

#[derive(thiserror::Error, Debug)]
pub enum MediaError {
    #[error("ffmpeg unavailable: {0}")]
    FfmpegUnavailable(String),

    #[error("failed to load video file: {0}")]
    MediaLoad(String),

    #[error("media io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MediaError>;

pub trait FrameExtractor: Send + Sync {
    /// Samples `frame_count` evenly spaced frames, ordered by timestamp.
    fn extract_frames(
        &self,
        video: VideoSource,
        frame_count: usize,
    ) -> BoxFuture<'_, Result<Vec<EncodedImage>>>;
}

pub(crate) fn ensure_ffmpeg_available() -> Result<()> {
    download::auto_download().map_err(|e| MediaError::FfmpegUnavailable(e.to_string()))
}

/// Runs ffmpeg to completion and returns its raw output; the exit status is
/// left for the caller to interpret.
pub(crate) async fn run_ffmpeg(args: &[String]) -> Result<Output> {
    let output = tokio::process::Command::new(ffmpeg_path())
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| MediaError::FfmpegUnavailable(e.to_string()))?;
    Ok(output)
}
