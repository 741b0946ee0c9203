use crate::emotion::{AnalysisError, AnalysisRequest, EmotionAnalyzer, EmotionResult, ErrorClass};
use crate::media::EncodedImage;

const LOG_TARGET: &str = "emotion::batch";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchReport {
    /// Successful frames in input order, relabeled `frame-<n>`.
    pub results: Vec<EmotionResult>,
    /// 1-based positions of frames dropped after a per-item failure.
    pub skipped: Vec<usize>,
}

impl BatchReport {
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// Analyzes frames one at a time, in order. Per-item failures skip the frame;
/// a batch-fatal failure stops the run and is returned.
pub async fn analyze_frames_report<A>(
    analyzer: &A,
    frames: Vec<EncodedImage>,
) -> Result<BatchReport, AnalysisError>
where
    A: EmotionAnalyzer + ?Sized,
{
    let total = frames.len();
    let mut report = BatchReport {
        results: Vec::with_capacity(total),
        skipped: Vec::new(),
    };

    for (idx, frame) in frames.into_iter().enumerate() {
        let position = idx + 1;
        match analyzer.analyze(AnalysisRequest::image(frame)).await {
            Ok(result) => report.results.push(result.into_frame(position)),
            Err(e) => match e.class() {
                ErrorClass::PerItem => {
                    tracing::warn!(target: LOG_TARGET, frame = position, total, error = %e, "frame analysis failed; skipping");
                    report.skipped.push(position);
                }
                ErrorClass::BatchFatal => {
                    tracing::error!(target: LOG_TARGET, frame = position, total, error = %e, "aborting batch");
                    return Err(e);
                }
            },
        }
    }

    tracing::info!(
        target: LOG_TARGET,
        analyzed = report.results.len(),
        skipped = report.skipped.len(),
        "batch complete"
    );
    Ok(report)
}

pub async fn analyze_frames<A>(
    analyzer: &A,
    frames: Vec<EncodedImage>,
) -> Result<Vec<EmotionResult>, AnalysisError>
where
    A: EmotionAnalyzer + ?Sized,
{
    Ok(analyze_frames_report(analyzer, frames).await?.results)
}
