use crate::media::{
    ensure_ffmpeg_available, run_ffmpeg, EncodedImage, FrameExtractor, MediaError, Result,
    VideoSource,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

const LOG_TARGET: &str = "media::frames";

/// Evenly spaced sample points strictly inside the clip:
/// `duration / (n + 1) * i` for `i` in `1..=n`.
pub fn frame_timestamps(duration: Duration, frame_count: usize) -> Vec<Duration> {
    if frame_count == 0 {
        return Vec::new();
    }
    let interval = duration.as_secs_f64() / (frame_count as f64 + 1.0);
    (1..=frame_count)
        .map(|i| Duration::from_secs_f64(interval * i as f64))
        .collect()
}

/// Reads the `Duration: HH:MM:SS.ss` line ffmpeg prints for its input.
pub(crate) fn parse_ffmpeg_duration(stderr: &str) -> Option<Duration> {
    let line = stderr.lines().find_map(|l| l.trim().strip_prefix("Duration:"))?;
    let stamp = line.split(',').next()?.trim();
    let mut parts = stamp.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    if !total.is_finite() || total < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(total))
}

fn last_stderr_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no diagnostic output")
        .trim()
        .to_owned()
}

/// A video on disk for the duration of one extraction. In-memory input is
/// spilled to a temp file that is removed when this value drops.
enum StagedVideo {
    OnDisk(PathBuf),
    Spilled(NamedTempFile),
}

impl StagedVideo {
    async fn stage(video: VideoSource) -> Result<Self> {
        match video {
            VideoSource::Path(path) => Ok(Self::OnDisk(path)),
            VideoSource::Bytes { data, extension } => {
                let suffix = extension
                    .map(|e| format!(".{}", e.trim_start_matches('.')))
                    .unwrap_or_default();
                let file = tempfile::Builder::new()
                    .prefix("emotion-lens-")
                    .suffix(&suffix)
                    .tempfile()?;
                tokio::fs::write(file.path(), &data).await?;
                tracing::debug!(target: LOG_TARGET, path = %file.path().display(), bytes = data.len(), "video staged");
                Ok(Self::Spilled(file))
            }
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::OnDisk(p) => p,
            Self::Spilled(f) => f.path(),
        }
    }
}

impl Drop for StagedVideo {
    fn drop(&mut self) {
        if let Self::Spilled(f) = self {
            tracing::debug!(target: LOG_TARGET, path = %f.path().display(), "staged video released");
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FfmpegFrameExtractor;

impl FfmpegFrameExtractor {
    pub fn new() -> Self {
        Self
    }

    async fn probe_duration(&self, path: &Path) -> Result<Duration> {
        let args = vec![
            "-hide_banner".to_owned(),
            "-nostdin".to_owned(),
            "-i".to_owned(),
            path.display().to_string(),
        ];
        // Without an output ffmpeg exits non-zero; only the banner matters.
        let output = run_ffmpeg(&args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        match parse_ffmpeg_duration(&stderr) {
            Some(d) if !d.is_zero() => Ok(d),
            Some(_) => Err(MediaError::MediaLoad("video has zero duration".to_owned())),
            None => Err(MediaError::MediaLoad(last_stderr_line(&output.stderr))),
        }
    }

    async fn grab_frame(&self, path: &Path, at: Duration) -> Result<EncodedImage> {
        let args = vec![
            "-hide_banner".to_owned(),
            "-nostdin".to_owned(),
            "-loglevel".to_owned(),
            "error".to_owned(),
            "-ss".to_owned(),
            format!("{:.3}", at.as_secs_f64()),
            "-i".to_owned(),
            path.display().to_string(),
            "-frames:v".to_owned(),
            "1".to_owned(),
            "-an".to_owned(),
            "-f".to_owned(),
            "image2pipe".to_owned(),
            "-c:v".to_owned(),
            "mjpeg".to_owned(),
            "-q:v".to_owned(),
            "2".to_owned(),
            "pipe:1".to_owned(),
        ];
        let output = run_ffmpeg(&args).await?;
        if !output.status.success() {
            return Err(MediaError::MediaLoad(format!(
                "seek to {:.3}s failed: exit_code={:?} stderr={}",
                at.as_secs_f64(),
                output.status.code(),
                last_stderr_line(&output.stderr)
            )));
        }
        if !output.stdout.starts_with(&[0xFF, 0xD8]) {
            return Err(MediaError::MediaLoad(format!(
                "no frame decoded at {:.3}s",
                at.as_secs_f64()
            )));
        }
        Ok(EncodedImage::jpeg(output.stdout))
    }
}

impl FrameExtractor for FfmpegFrameExtractor {
    fn extract_frames(
        &self,
        video: VideoSource,
        frame_count: usize,
    ) -> BoxFuture<'_, Result<Vec<EncodedImage>>> {
        async move {
            if frame_count == 0 {
                return Ok(Vec::new());
            }
            ensure_ffmpeg_available()?;
            let staged = StagedVideo::stage(video).await?;
            let duration = self.probe_duration(staged.path()).await?;
            let timestamps = frame_timestamps(duration, frame_count);
            tracing::info!(
                target: LOG_TARGET,
                duration_s = duration.as_secs_f64(),
                frames = frame_count,
                "extracting frames"
            );

            let mut frames = Vec::with_capacity(frame_count);
            for (i, at) in timestamps.into_iter().enumerate() {
                let frame = self.grab_frame(staged.path(), at).await?;
                tracing::debug!(
                    target: LOG_TARGET,
                    frame = i + 1,
                    at_s = at.as_secs_f64(),
                    bytes = frame.len(),
                    "frame extracted"
                );
                frames.push(frame);
            }
            Ok(frames)
        }
        .boxed()
    }
}
