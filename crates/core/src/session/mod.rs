use crate::capture::{Capture, CaptureError, VoiceCapturer, WebcamCapturer};
use crate::emotion::{
    analyze_frames_report, AnalysisError, AnalysisRequest, EmotionAnalyzer, EmotionResult,
};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const LOG_TARGET: &str = "session";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    #[default]
    Text,
    Voice,
    Webcam,
    Upload,
}

impl AnalysisMode {
    pub const ALL: [AnalysisMode; 4] = [
        AnalysisMode::Text,
        AnalysisMode::Voice,
        AnalysisMode::Webcam,
        AnalysisMode::Upload,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisMode::Text => "text",
            AnalysisMode::Voice => "voice",
            AnalysisMode::Webcam => "webcam",
            AnalysisMode::Upload => "upload",
        }
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown mode {0:?}; expected one of text, voice, webcam, upload")]
pub struct UnknownMode(pub String);

impl FromStr for AnalysisMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        AnalysisMode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownMode(s.to_owned()))
    }
}

/// A finished analysis. Single-input analyses carry exactly one result;
/// video batches carry the frames that succeeded plus the 1-based positions
/// of the ones that were skipped.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutput {
    pub results: Vec<EmotionResult>,
    pub skipped_frames: Vec<usize>,
}

impl AnalysisOutput {
    pub fn single(result: EmotionResult) -> Self {
        Self {
            results: vec![result],
            skipped_frames: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum AnalysisState {
    #[default]
    Idle,
    Loading,
    Success(AnalysisOutput),
    Failure(String),
}

impl AnalysisState {
    pub fn is_loading(&self) -> bool {
        matches!(self, AnalysisState::Loading)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("an analysis is already in progress")]
    Busy,
}

/// Proof that an analysis was started under a particular mode selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket {
    generation: u64,
}

/// Everything needed to run one analysis, detached from the orchestrator so
/// the caller can keep handling input while it runs.
pub struct AnalysisJob {
    analyzer: Arc<dyn EmotionAnalyzer>,
    capture: Capture,
}

impl AnalysisJob {
    pub async fn run(self) -> Result<AnalysisOutput, AnalysisError> {
        match self.capture {
            Capture::Text(text) => {
                let result = self.analyzer.analyze(AnalysisRequest::text(text)).await?;
                Ok(AnalysisOutput::single(result))
            }
            Capture::Image(image) => {
                let result = self.analyzer.analyze(AnalysisRequest::image(image)).await?;
                Ok(AnalysisOutput::single(result))
            }
            Capture::Frames(frames) => {
                let report = analyze_frames_report(self.analyzer.as_ref(), frames).await?;
                Ok(AnalysisOutput {
                    results: report.results,
                    skipped_frames: report.skipped,
                })
            }
        }
    }
}

/// Owns the active mode, the displayed state and the capturers whose
/// devices must be released when the mode changes.
pub struct Orchestrator {
    analyzer: Arc<dyn EmotionAnalyzer>,
    mode: AnalysisMode,
    state: AnalysisState,
    generation: u64,
    webcam: Option<WebcamCapturer>,
    voice: Option<VoiceCapturer>,
}

impl Orchestrator {
    pub fn new(analyzer: Arc<dyn EmotionAnalyzer>) -> Self {
        Self {
            analyzer,
            mode: AnalysisMode::default(),
            state: AnalysisState::Idle,
            generation: 0,
            webcam: None,
            voice: None,
        }
    }

    pub fn with_webcam(mut self, webcam: WebcamCapturer) -> Self {
        self.webcam = Some(webcam);
        self
    }

    pub fn with_voice(mut self, voice: VoiceCapturer) -> Self {
        self.voice = Some(voice);
        self
    }

    pub fn mode(&self) -> AnalysisMode {
        self.mode
    }

    pub fn state(&self) -> &AnalysisState {
        &self.state
    }

    pub fn webcam_mut(&mut self) -> Option<&mut WebcamCapturer> {
        self.webcam.as_mut()
    }

    pub fn voice_mut(&mut self) -> Option<&mut VoiceCapturer> {
        self.voice.as_mut()
    }

    /// Switches mode, clears the displayed state and releases any camera or
    /// microphone held for the previous mode. In-flight analyses are not
    /// aborted; their results are ignored when they arrive.
    pub fn select_mode(&mut self, mode: AnalysisMode) {
        if self.state.is_loading() {
            tracing::info!(target: LOG_TARGET, from = %self.mode, to = %mode, "mode changed during analysis; result will be discarded");
        }
        self.generation += 1;
        self.mode = mode;
        self.state = AnalysisState::Idle;
        if let Some(webcam) = self.webcam.as_mut() {
            webcam.close();
        }
        if let Some(voice) = self.voice.as_mut() {
            voice.reset();
        }
        tracing::debug!(target: LOG_TARGET, %mode, generation = self.generation, "mode selected");
    }

    /// `select_mode`, then starts the live camera stream when entering
    /// webcam mode so `capture` grabs a settled frame. The stream stays open
    /// until the next mode change.
    pub async fn enter_mode(&mut self, mode: AnalysisMode) -> Result<(), CaptureError> {
        self.select_mode(mode);
        if mode != AnalysisMode::Webcam {
            return Ok(());
        }
        let webcam = self.webcam.as_mut().ok_or(CaptureError::NotActive)?;
        if let Err(e) = webcam.open().await {
            tracing::warn!(target: LOG_TARGET, error = %e, "camera unavailable");
            self.state = AnalysisState::Failure(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    pub fn begin(&mut self) -> Result<Ticket, SessionError> {
        if self.state.is_loading() {
            return Err(SessionError::Busy);
        }
        self.state = AnalysisState::Loading;
        Ok(Ticket {
            generation: self.generation,
        })
    }

    pub fn job(&self, capture: Capture) -> AnalysisJob {
        AnalysisJob {
            analyzer: self.analyzer.clone(),
            capture,
        }
    }

    /// Applies an analysis outcome. Returns `false` when the ticket is stale
    /// and the outcome was dropped.
    pub fn complete(
        &mut self,
        ticket: Ticket,
        outcome: Result<AnalysisOutput, AnalysisError>,
    ) -> bool {
        if ticket.generation != self.generation {
            tracing::debug!(
                target: LOG_TARGET,
                ticket = ticket.generation,
                current = self.generation,
                "dropping stale analysis outcome"
            );
            return false;
        }
        self.state = match outcome {
            Ok(output) => {
                tracing::info!(target: LOG_TARGET, results = output.results.len(), skipped = output.skipped_frames.len(), "analysis succeeded");
                AnalysisState::Success(output)
            }
            Err(e) => {
                tracing::warn!(target: LOG_TARGET, error = %e, "analysis failed");
                AnalysisState::Failure(e.to_string())
            }
        };
        true
    }

    /// Shows an input-side failure (permission, bad file) without running
    /// an analysis.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), SessionError> {
        if self.state.is_loading() {
            return Err(SessionError::Busy);
        }
        self.state = AnalysisState::Failure(message.into());
        Ok(())
    }

    pub async fn submit(&mut self, capture: Capture) -> Result<&AnalysisState, SessionError> {
        let ticket = self.begin()?;
        let outcome = self.job(capture).run().await;
        self.complete(ticket, outcome);
        Ok(&self.state)
    }
}
