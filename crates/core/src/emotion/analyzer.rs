use crate::emotion::EmotionResult;
use crate::media::EncodedImage;
use futures::future::BoxFuture;
use std::sync::Arc;

/// How a failure affects the rest of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Skip the affected item and continue.
    PerItem,
    /// Will recur for every remaining item; stop the batch.
    BatchFatal,
}

#[derive(thiserror::Error, Debug)]
pub enum AnalysisError {
    #[error("API key not configured: {0}")]
    Configuration(String),

    #[error("the provided API key is not valid: {0}")]
    Auth(String),

    #[error("emotion analysis failed: {0}")]
    Service(String),
}

impl AnalysisError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AnalysisError::Configuration(_) | AnalysisError::Auth(_) => ErrorClass::BatchFatal,
            AnalysisError::Service(_) => ErrorClass::PerItem,
        }
    }
}

/// Input for one analysis call. At least one of text or image is present;
/// when both are, the prompt is built from the text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalysisRequest {
    text: Option<String>,
    image: Option<EncodedImage>,
}

impl AnalysisRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            image: None,
        }
    }

    pub fn image(image: EncodedImage) -> Self {
        Self {
            text: None,
            image: Some(image),
        }
    }

    pub fn with_image(mut self, image: EncodedImage) -> Self {
        self.image = Some(image);
        self
    }

    pub fn text_content(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn image_content(&self) -> Option<&EncodedImage> {
        self.image.as_ref()
    }
}

pub trait EmotionAnalyzer: Send + Sync {
    fn analyze(&self, request: AnalysisRequest)
        -> BoxFuture<'_, Result<EmotionResult, AnalysisError>>;
}

impl<T: EmotionAnalyzer + ?Sized> EmotionAnalyzer for Arc<T> {
    fn analyze(
        &self,
        request: AnalysisRequest,
    ) -> BoxFuture<'_, Result<EmotionResult, AnalysisError>> {
        (**self).analyze(request)
    }
}
