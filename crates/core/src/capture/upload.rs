use crate::capture::{Capture, CaptureError};
use crate::media::{EncodedImage, FrameExtractor, MediaError, VideoSource};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

const LOG_TARGET: &str = "capture::upload";
/// Enough leading bytes for every container signature `infer` knows.
const SNIFF_LEN: u64 = 8 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadKind {
    Image,
    Video,
}

impl UploadKind {
    pub fn from_mime(mime: &str) -> Result<Self, CaptureError> {
        let lower = mime.trim().to_ascii_lowercase();
        if lower.starts_with("image/") {
            Ok(UploadKind::Image)
        } else if lower.starts_with("video/") {
            Ok(UploadKind::Video)
        } else {
            Err(CaptureError::InvalidFileType(mime.to_owned()))
        }
    }
}

/// Detects the type from the content header.
pub fn sniff_mime_type(head: &[u8]) -> Option<infer::Type> {
    infer::get(head)
}

/// Fallback by file name when the content is not recognized.
pub fn guess_mime_type(file_name: &str) -> Option<&'static str> {
    let ext = Path::new(file_name)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    let mime = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "avif" => "image/avif",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "ogv" => "video/ogg",
        "mpeg" | "mpg" => "video/mpeg",
        "3gp" => "video/3gpp",
        _ => return None,
    };
    Some(mime)
}

struct ResolvedType {
    mime: String,
    extension: Option<String>,
}

#[derive(Clone, Debug)]
enum UploadContent {
    Path(PathBuf),
    Bytes(Bytes),
}

/// A single user-selected file. The MIME type is the explicit one when given,
/// otherwise sniffed from the content, otherwise guessed from the file name.
#[derive(Clone, Debug)]
pub struct UploadedFile {
    name: String,
    mime_type: Option<String>,
    content: UploadContent,
}

impl UploadedFile {
    pub fn from_path(path: impl Into<PathBuf>, mime_type: Option<String>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            mime_type,
            content: UploadContent::Path(path),
        }
    }

    pub fn from_bytes(
        name: impl Into<String>,
        data: impl Into<Bytes>,
        mime_type: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type,
            content: UploadContent::Bytes(data.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn head(&self) -> Result<Bytes, MediaError> {
        match &self.content {
            UploadContent::Bytes(b) => Ok(b.slice(..b.len().min(SNIFF_LEN as usize))),
            UploadContent::Path(p) => {
                let file = tokio::fs::File::open(p).await?;
                let mut head = Vec::new();
                file.take(SNIFF_LEN).read_to_end(&mut head).await?;
                Ok(Bytes::from(head))
            }
        }
    }

    async fn resolve(&self) -> Result<ResolvedType, CaptureError> {
        if let Some(mime) = &self.mime_type {
            return Ok(ResolvedType {
                mime: mime.clone(),
                extension: None,
            });
        }
        if let Some(kind) = sniff_mime_type(&self.head().await?) {
            tracing::debug!(target: LOG_TARGET, file = %self.name, mime = kind.mime_type(), "type sniffed from content");
            return Ok(ResolvedType {
                mime: kind.mime_type().to_owned(),
                extension: Some(kind.extension().to_owned()),
            });
        }
        guess_mime_type(&self.name)
            .map(|mime| ResolvedType {
                mime: mime.to_owned(),
                extension: None,
            })
            .ok_or_else(|| CaptureError::InvalidFileType(format!("unknown type of {}", self.name)))
    }

    /// Explicit type, then content sniffing, then the file name.
    pub async fn mime_type(&self) -> Result<String, CaptureError> {
        Ok(self.resolve().await?.mime)
    }

    pub async fn kind(&self) -> Result<UploadKind, CaptureError> {
        UploadKind::from_mime(&self.mime_type().await?)
    }

    fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
    }

    async fn read_bytes(&self) -> Result<Bytes, MediaError> {
        match &self.content {
            UploadContent::Bytes(b) => Ok(b.clone()),
            UploadContent::Path(p) => Ok(Bytes::from(tokio::fs::read(p).await?)),
        }
    }

    fn into_video_source(self, sniffed_extension: Option<String>) -> VideoSource {
        let extension = self.extension().or(sniffed_extension);
        match self.content {
            UploadContent::Path(p) => VideoSource::Path(p),
            UploadContent::Bytes(data) => VideoSource::Bytes { data, extension },
        }
    }
}

/// Turns an uploaded file into something the orchestrator can analyze:
/// an image as-is, a video as a fixed number of sampled frames.
#[derive(Clone)]
pub struct UploadCapturer {
    extractor: Arc<dyn FrameExtractor>,
    frame_count: usize,
}

impl UploadCapturer {
    pub fn new(extractor: Arc<dyn FrameExtractor>, frame_count: usize) -> Self {
        Self {
            extractor,
            frame_count,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub async fn capture(&self, file: UploadedFile) -> Result<Capture, CaptureError> {
        let resolved = file.resolve().await?;
        match UploadKind::from_mime(&resolved.mime)? {
            UploadKind::Image => {
                let mime = resolved.mime;
                let data = file.read_bytes().await?;
                if data.is_empty() {
                    return Err(CaptureError::EmptyInput);
                }
                tracing::info!(target: LOG_TARGET, file = file.name(), mime = %mime, bytes = data.len(), "image uploaded");
                Ok(Capture::Image(EncodedImage::new(data, mime)))
            }
            UploadKind::Video => {
                tracing::info!(target: LOG_TARGET, file = file.name(), frames = self.frame_count, "extracting frames from video");
                let frames = self
                    .extractor
                    .extract_frames(file.into_video_source(resolved.extension), self.frame_count)
                    .await?;
                Ok(Capture::Frames(frames))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingExtractor {
        seen: Mutex<Vec<(String, usize)>>,
    }

    impl FrameExtractor for RecordingExtractor {
        fn extract_frames(
            &self,
            video: VideoSource,
            frame_count: usize,
        ) -> BoxFuture<'_, crate::media::Result<Vec<EncodedImage>>> {
            async move {
                let label = match video {
                    VideoSource::Path(p) => p.display().to_string(),
                    VideoSource::Bytes { extension, .. } => {
                        format!("bytes.{}", extension.unwrap_or_default())
                    }
                };
                self.seen.lock().unwrap().push((label, frame_count));
                Ok((0..frame_count)
                    .map(|i| EncodedImage::jpeg(vec![i as u8]))
                    .collect())
            }
            .boxed()
        }
    }

    fn capturer(extractor: Arc<RecordingExtractor>) -> UploadCapturer {
        UploadCapturer::new(extractor, crate::config::DEFAULT_VIDEO_FRAMES)
    }

    const PNG_HEADER: [u8; 16] = [
        0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D, b'I', b'H', b'D', b'R',
    ];
    const MP4_HEADER: [u8; 16] = [
        0, 0, 0, 0x18, b'f', b't', b'y', b'p', b'i', b's', b'o', b'm', 0, 0, 0x02, 0,
    ];

    #[tokio::test]
    async fn content_is_sniffed_when_name_has_no_extension() {
        let file = UploadedFile::from_bytes("IMG_20240101", PNG_HEADER.to_vec(), None);
        assert_eq!(file.kind().await.unwrap(), UploadKind::Image);
        assert_eq!(file.mime_type().await.unwrap(), "image/png");
    }

    #[tokio::test]
    async fn content_wins_over_a_misleading_extension() {
        let file = UploadedFile::from_bytes("holiday.dat", MP4_HEADER.to_vec(), None);
        assert_eq!(file.kind().await.unwrap(), UploadKind::Video);

        let file = UploadedFile::from_bytes("photo.mp4", PNG_HEADER.to_vec(), None);
        assert_eq!(file.mime_type().await.unwrap(), "image/png");
    }

    #[tokio::test]
    async fn sniffed_video_without_extension_is_staged_with_one() {
        let extractor = Arc::new(RecordingExtractor::default());
        let file = UploadedFile::from_bytes("VID_0042", MP4_HEADER.to_vec(), None);
        capturer(extractor.clone()).capture(file).await.unwrap();
        assert_eq!(
            *extractor.seen.lock().unwrap(),
            vec![("bytes.mp4".to_owned(), 4)]
        );
    }

    #[tokio::test]
    async fn unrecognized_content_without_extension_is_rejected() {
        let file = UploadedFile::from_bytes("notes", b"just some words".to_vec(), None);
        assert!(matches!(file.kind().await, Err(CaptureError::InvalidFileType(_))));
    }

    #[tokio::test]
    async fn image_on_disk_is_sniffed_from_its_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan");
        std::fs::write(&path, PNG_HEADER).unwrap();
        let file = UploadedFile::from_path(&path, None);
        assert_eq!(file.mime_type().await.unwrap(), "image/png");
    }

    #[test]
    fn mime_guess_by_extension() {
        assert_eq!(guess_mime_type("face.JPG"), Some("image/jpeg"));
        assert_eq!(guess_mime_type("clip.mov"), Some("video/quicktime"));
        assert_eq!(guess_mime_type("notes.txt"), None);
        assert_eq!(guess_mime_type("no_extension"), None);
    }

    #[test]
    fn kind_requires_image_or_video() {
        assert_eq!(UploadKind::from_mime("image/png").unwrap(), UploadKind::Image);
        assert_eq!(UploadKind::from_mime("Video/MP4").unwrap(), UploadKind::Video);
        assert!(matches!(
            UploadKind::from_mime("application/pdf"),
            Err(CaptureError::InvalidFileType(_))
        ));
    }

    #[tokio::test]
    async fn invalid_type_is_rejected_before_extraction() {
        let extractor = Arc::new(RecordingExtractor::default());
        let file = UploadedFile::from_bytes("doc.pdf", b"%PDF-1.7\n".to_vec(), None);
        let err = capturer(extractor.clone()).capture(file).await.unwrap_err();
        assert!(matches!(err, CaptureError::InvalidFileType(_)));
        assert!(extractor.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn explicit_mime_wins_over_extension() {
        let extractor = Arc::new(RecordingExtractor::default());
        let file = UploadedFile::from_bytes("blob.bin", vec![9, 9], Some("image/png".into()));
        let capture = capturer(extractor).capture(file).await.unwrap();
        assert_eq!(
            capture,
            Capture::Image(EncodedImage::new(vec![9u8, 9], "image/png"))
        );
    }

    #[tokio::test]
    async fn video_goes_through_extractor_with_four_frames() {
        let extractor = Arc::new(RecordingExtractor::default());
        let file = UploadedFile::from_bytes("clip.mp4", b"opaque video bytes".to_vec(), None);
        let capture = capturer(extractor.clone()).capture(file).await.unwrap();

        let Capture::Frames(frames) = capture else {
            panic!("expected frames");
        };
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|f| f.mime_type == "image/jpeg"));
        assert_eq!(
            *extractor.seen.lock().unwrap(),
            vec![("bytes.mp4".to_owned(), 4)]
        );
    }

    #[tokio::test]
    async fn video_on_disk_is_passed_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("party.webm");
        std::fs::write(&path, b"opaque video bytes").unwrap();

        let extractor = Arc::new(RecordingExtractor::default());
        let file = UploadedFile::from_path(&path, None);
        capturer(extractor.clone()).capture(file).await.unwrap();
        assert_eq!(
            extractor.seen.lock().unwrap()[0],
            (path.display().to_string(), 4)
        );
    }

    #[tokio::test]
    async fn image_on_disk_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let extractor = Arc::new(RecordingExtractor::default());
        let capture = capturer(extractor)
            .capture(UploadedFile::from_path(&path, None))
            .await
            .unwrap();
        assert_eq!(
            capture,
            Capture::Image(EncodedImage::new(vec![1u8, 2, 3], "image/png"))
        );
    }
}
