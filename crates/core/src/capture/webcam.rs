use crate::capture::{Capture, CaptureError};
use crate::media::mjpeg::MjpegSplitter;
use crate::media::{ensure_ffmpeg_available, EncodedImage};
use bytes::Bytes;
use ffmpeg_sidecar::paths::ffmpeg_path;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const LOG_TARGET: &str = "capture::webcam";
const READ_CHUNK: usize = 64 * 1024;
const STDERR_TAIL: usize = 8 * 1024;
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

pub trait Camera: Send + Sync {
    /// Acquires the device and starts a live stream.
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn CameraStream>, CaptureError>>;
}

/// A live camera stream. Dropping it releases the device.
pub trait CameraStream: Send {
    /// The most recent frame, JPEG-encoded at the stream's native resolution.
    fn capture(&mut self) -> BoxFuture<'_, Result<EncodedImage, CaptureError>>;
}

#[cfg(target_os = "linux")]
fn input_args(device: Option<&str>) -> Result<Vec<String>, CaptureError> {
    let device = device.unwrap_or("/dev/video0");
    if let Err(e) = std::fs::File::open(device) {
        return Err(match e.kind() {
            std::io::ErrorKind::PermissionDenied => CaptureError::PermissionDenied {
                device: "camera",
                details: format!("{device}: {e}"),
            },
            _ => CaptureError::Camera(format!("cannot open {device}: {e}")),
        });
    }
    Ok(vec!["-f".into(), "v4l2".into(), "-i".into(), device.to_owned()])
}

#[cfg(target_os = "macos")]
fn input_args(device: Option<&str>) -> Result<Vec<String>, CaptureError> {
    Ok(vec![
        "-f".into(),
        "avfoundation".into(),
        "-framerate".into(),
        "30".into(),
        "-i".into(),
        device.unwrap_or("0").to_owned(),
    ])
}

#[cfg(target_os = "windows")]
fn input_args(device: Option<&str>) -> Result<Vec<String>, CaptureError> {
    let device = device.ok_or_else(|| {
        CaptureError::Camera("no DirectShow device configured; pass --camera".to_owned())
    })?;
    Ok(vec!["-f".into(), "dshow".into(), "-i".into(), format!("video={device}")])
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn input_args(_device: Option<&str>) -> Result<Vec<String>, CaptureError> {
    Err(CaptureError::Camera("live capture is not supported on this platform".to_owned()))
}

fn stream_args(input: Vec<String>) -> Vec<String> {
    let mut args = vec!["-hide_banner".into(), "-nostdin".into(), "-loglevel".into(), "error".into()];
    args.extend(input);
    args.extend(
        ["-an", "-f", "mjpeg", "-q:v", "3", "pipe:1"]
            .iter()
            .map(|s| s.to_string()),
    );
    args
}

fn classify_camera_failure(stderr: &str) -> CaptureError {
    let detail = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_owned())
        .unwrap_or_else(|| "camera stream ended without output".to_owned());
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("permission denied") || lower.contains("not authorized") {
        return CaptureError::PermissionDenied {
            device: "camera",
            details: detail,
        };
    }
    CaptureError::Camera(detail)
}

/// Live capture through a long-running ffmpeg process emitting MJPEG.
#[derive(Clone, Debug)]
pub struct FfmpegCamera {
    device: Option<String>,
}

impl FfmpegCamera {
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }

    async fn open_stream(&self) -> Result<FfmpegCameraStream, CaptureError> {
        ensure_ffmpeg_available()?;
        let args = stream_args(input_args(self.device.as_deref())?);
        tracing::debug!(target: LOG_TARGET, ?args, "starting camera stream");

        let mut child = tokio::process::Command::new(ffmpeg_path())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError::Camera(format!("failed to start ffmpeg: {e}")))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Camera("ffmpeg stdout unavailable".to_owned()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CaptureError::Camera("ffmpeg stderr unavailable".to_owned()))?;

        let stderr_tail = Arc::new(Mutex::new(String::new()));
        let tail = stderr_tail.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::trace!(target: LOG_TARGET, %line, "ffmpeg");
                let Ok(mut buf) = tail.lock() else { break };
                buf.push_str(&line);
                buf.push('\n');
                if buf.len() > STDERR_TAIL {
                    let mut cut = buf.len() - STDERR_TAIL;
                    while !buf.is_char_boundary(cut) {
                        cut += 1;
                    }
                    buf.drain(..cut);
                }
            }
        });

        let (frame_tx, mut frame_rx) = watch::channel::<Option<Bytes>>(None);
        let reader_task = tokio::spawn(async move {
            let mut splitter = MjpegSplitter::new();
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for frame in splitter.push(&chunk[..n]) {
                            if frame_tx.send(Some(Bytes::from(frame))).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(target: LOG_TARGET, error = %e, "camera read failed");
                        break;
                    }
                }
            }
            tracing::debug!(target: LOG_TARGET, "camera stream closed");
        });

        let mut stream = FfmpegCameraStream {
            child,
            frames: frame_rx.clone(),
            reader_task,
            stderr_task,
            stderr_tail,
        };

        let first = tokio::time::timeout(
            FIRST_FRAME_TIMEOUT,
            frame_rx.wait_for(|f| f.is_some()).map(|r| r.map(|_| ())),
        )
        .await;
        match first {
            Ok(Ok(_)) => {
                tracing::info!(target: LOG_TARGET, device = ?self.device, "camera opened");
                Ok(stream)
            }
            Ok(Err(_)) => {
                // Give ffmpeg a moment to flush its error before reading it.
                let _ = tokio::time::timeout(Duration::from_millis(500), stream.child.wait()).await;
                Err(classify_camera_failure(&stream.stderr()))
            }
            Err(_) => Err(CaptureError::Camera(format!(
                "no frame received within {:?}",
                FIRST_FRAME_TIMEOUT
            ))),
        }
    }
}

impl Default for FfmpegCamera {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Camera for FfmpegCamera {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn CameraStream>, CaptureError>> {
        async move {
            let stream = self.open_stream().await?;
            Ok(Box::new(stream) as Box<dyn CameraStream>)
        }
        .boxed()
    }
}

struct FfmpegCameraStream {
    child: tokio::process::Child,
    frames: watch::Receiver<Option<Bytes>>,
    reader_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
    stderr_tail: Arc<Mutex<String>>,
}

impl FfmpegCameraStream {
    fn stderr(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl CameraStream for FfmpegCameraStream {
    fn capture(&mut self) -> BoxFuture<'_, Result<EncodedImage, CaptureError>> {
        async move {
            if self.frames.has_changed().is_err() {
                return Err(classify_camera_failure(&self.stderr()));
            }
            let frame = self
                .frames
                .borrow_and_update()
                .clone()
                .ok_or_else(|| CaptureError::Camera("no frame available yet".to_owned()))?;
            Ok(EncodedImage::jpeg(frame))
        }
        .boxed()
    }
}

impl Drop for FfmpegCameraStream {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
        self.reader_task.abort();
        self.stderr_task.abort();
        tracing::debug!(target: LOG_TARGET, "camera released");
    }
}

/// Webcam input: open a live stream, grab the current frame on demand,
/// release the device on close or drop.
pub struct WebcamCapturer {
    camera: Arc<dyn Camera>,
    stream: Option<Box<dyn CameraStream>>,
}

impl WebcamCapturer {
    pub fn new(camera: Arc<dyn Camera>) -> Self {
        Self {
            camera,
            stream: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn open(&mut self) -> Result<(), CaptureError> {
        if self.stream.is_none() {
            self.stream = Some(self.camera.open().await?);
        }
        Ok(())
    }

    pub async fn capture(&mut self) -> Result<Capture, CaptureError> {
        let stream = self.stream.as_mut().ok_or(CaptureError::NotActive)?;
        match stream.capture().await {
            Ok(image) => {
                tracing::info!(target: LOG_TARGET, bytes = image.len(), "frame captured");
                Ok(Capture::Image(image))
            }
            Err(e) => {
                tracing::warn!(target: LOG_TARGET, error = %e, "capture failed; releasing camera");
                self.close();
                Err(e)
            }
        }
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!(target: LOG_TARGET, "camera closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::FakeCamera;

    #[tokio::test]
    async fn capture_requires_open_stream() {
        let mut cam = WebcamCapturer::new(Arc::new(FakeCamera::default()));
        assert!(matches!(cam.capture().await, Err(CaptureError::NotActive)));
    }

    #[tokio::test]
    async fn capture_returns_current_frame_as_image() {
        let camera = Arc::new(FakeCamera::default());
        let mut cam = WebcamCapturer::new(camera.clone());
        cam.open().await.unwrap();
        cam.open().await.unwrap();
        assert_eq!(camera.opened(), 1);

        let first = cam.capture().await.unwrap();
        let second = cam.capture().await.unwrap();
        assert_eq!(first, Capture::Image(EncodedImage::jpeg(vec![0xFF, 0xD8, 1, 0xFF, 0xD9])));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn close_and_drop_release_the_device() {
        let camera = Arc::new(FakeCamera::default());
        let mut cam = WebcamCapturer::new(camera.clone());
        cam.open().await.unwrap();
        assert_eq!(camera.live(), 1);
        cam.close();
        assert_eq!(camera.live(), 0);
        assert!(!cam.is_open());

        cam.open().await.unwrap();
        drop(cam);
        assert_eq!(camera.live(), 0);
    }

    #[tokio::test]
    async fn failed_capture_releases_the_device() {
        let camera = Arc::new(FakeCamera {
            broken: true,
            ..Default::default()
        });
        let mut cam = WebcamCapturer::new(camera.clone());
        cam.open().await.unwrap();
        assert!(matches!(cam.capture().await, Err(CaptureError::Camera(_))));
        assert!(!cam.is_open());
        assert_eq!(camera.live(), 0);
    }

    #[tokio::test]
    async fn denied_camera_is_reported() {
        let camera = Arc::new(FakeCamera {
            deny: true,
            ..Default::default()
        });
        let mut cam = WebcamCapturer::new(camera);
        let err = cam.open().await.unwrap_err();
        assert_eq!(err.to_string(), "camera access was denied: blocked");
        assert!(!cam.is_open());
    }

    #[test]
    fn ffmpeg_stderr_classification() {
        let err = classify_camera_failure(
            "[video4linux2] Cannot open video device /dev/video0: Permission denied\n",
        );
        assert!(matches!(err, CaptureError::PermissionDenied { device: "camera", .. }));
        let err = classify_camera_failure("Input/output error\n\n");
        assert_eq!(err.to_string(), "camera error: Input/output error");
    }

    #[test]
    fn stream_args_emit_mjpeg_to_stdout() {
        let args = stream_args(vec!["-i".into(), "dev".into()]);
        assert_eq!(&args[4..6], ["-i", "dev"]);
        assert!(args.ends_with(&["-f".into(), "mjpeg".into(), "-q:v".into(), "3".into(), "pipe:1".into()]));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn missing_linux_device_is_a_camera_error() {
        let err = input_args(Some("/definitely/not/a/video/device")).unwrap_err();
        assert!(matches!(err, CaptureError::Camera(_)));
    }
}
