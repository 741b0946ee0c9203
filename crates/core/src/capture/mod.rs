#[cfg(test)]
pub(crate) mod testing;
mod upload;
mod voice;
mod webcam;

use crate::media::{EncodedImage, MediaError};

pub use upload::{guess_mime_type, sniff_mime_type, UploadCapturer, UploadKind, UploadedFile};
pub use voice::{
    probe_speech_recognizer, ActiveRecognition, CommandSpeechRecognizer, RecognitionEvent,
    SpeechRecognizer, TranscriptAccumulator, TranscriptFragment, VoiceCapturer,
};
pub use webcam::{Camera, CameraStream, FfmpegCamera, WebcamCapturer};

/// What a capturer hands to the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Capture {
    Text(String),
    Image(EncodedImage),
    Frames(Vec<EncodedImage>),
}

#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("nothing to analyze: input is empty")]
    EmptyInput,

    #[error("{device} access was denied: {details}")]
    PermissionDenied { device: &'static str, details: String },

    #[error("speech recognition is not supported in this environment")]
    SpeechUnsupported,

    #[error("invalid file type {0:?}; please provide an image or video")]
    InvalidFileType(String),

    #[error("speech recognition error: {0}")]
    Recognition(String),

    #[error("camera error: {0}")]
    Camera(String),

    #[error("capturer is not active")]
    NotActive,

    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Pass-through capture of typed text. Only rejects blank input; the text is
/// forwarded untrimmed.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextCapturer;

impl TextCapturer {
    pub fn new() -> Self {
        Self
    }

    pub fn capture(&self, text: impl Into<String>) -> Result<Capture, CaptureError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(CaptureError::EmptyInput);
        }
        Ok(Capture::Text(text))
    }
}
