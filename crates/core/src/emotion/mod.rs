mod analyzer;
pub mod batch;
mod gemini;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use analyzer::{AnalysisError, AnalysisRequest, EmotionAnalyzer, ErrorClass};
pub use batch::{analyze_frames, analyze_frames_report, BatchReport};
pub use gemini::GeminiEmotionAnalyzer;

/// The fixed label set every analysis is scored against.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub enum Emotion {
    Happy,
    Sad,
    Angry,
    Surprised,
    Neutral,
    Fear,
}

impl Emotion {
    pub const ALL: [Emotion; 6] = [
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Surprised,
        Emotion::Neutral,
        Emotion::Fear,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Angry => "angry",
            Emotion::Surprised => "surprised",
            Emotion::Neutral => "neutral",
            Emotion::Fear => "fear",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown emotion label: {0:?}")]
pub struct UnknownEmotion(pub String);

impl FromStr for Emotion {
    type Err = UnknownEmotion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Emotion::ALL
            .into_iter()
            .find(|e| e.as_str() == normalized)
            .ok_or_else(|| UnknownEmotion(s.to_owned()))
    }
}

impl TryFrom<String> for Emotion {
    type Error = UnknownEmotion;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Emotion> for String {
    fn from(value: Emotion) -> Self {
        value.as_str().to_owned()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ScoresError {
    #[error("emotion scores missing required label {0}")]
    MissingLabel(Emotion),
    #[error("emotion score for {label} must be within [0, 1], got {value}")]
    OutOfRange { label: String, value: f64 },
    #[error("emotion score label {0} appears more than once")]
    DuplicateLabel(String),
}

/// Confidence per label. The six fixed labels are always present; extra
/// labels returned by the service are kept. Scores need not sum to 1.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct EmotionScores {
    values: BTreeMap<String, f64>,
}

impl EmotionScores {
    pub fn get(&self, emotion: Emotion) -> f64 {
        self.values.get(emotion.as_str()).copied().unwrap_or(0.0)
    }

    pub fn get_label(&self, label: &str) -> Option<f64> {
        self.values.get(&label.trim().to_ascii_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fixed labels first in canonical order, then any extra labels by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        let fixed = Emotion::ALL
            .into_iter()
            .map(move |e| (e.as_str(), self.get(e)));
        let extra = self
            .values
            .iter()
            .filter(|(k, _)| k.parse::<Emotion>().is_err())
            .map(|(k, v)| (k.as_str(), *v));
        fixed.chain(extra)
    }

    /// Label with the highest confidence; ties resolve to the earlier label
    /// in canonical order.
    pub fn strongest(&self) -> Emotion {
        Emotion::ALL
            .into_iter()
            .fold(Emotion::Happy, |best, e| {
                if self.get(e) > self.get(best) {
                    e
                } else {
                    best
                }
            })
    }
}

impl TryFrom<BTreeMap<String, f64>> for EmotionScores {
    type Error = ScoresError;

    fn try_from(raw: BTreeMap<String, f64>) -> Result<Self, Self::Error> {
        let mut values = BTreeMap::new();
        for (label, value) in raw {
            let label = label.trim().to_ascii_lowercase();
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ScoresError::OutOfRange { label, value });
            }
            if values.insert(label.clone(), value).is_some() {
                return Err(ScoresError::DuplicateLabel(label));
            }
        }
        if let Some(missing) = Emotion::ALL
            .into_iter()
            .find(|e| !values.contains_key(e.as_str()))
        {
            return Err(ScoresError::MissingLabel(missing));
        }
        Ok(Self { values })
    }
}

impl From<EmotionScores> for BTreeMap<String, f64> {
    fn from(value: EmotionScores) -> Self {
        value.values
    }
}

/// Local identifier for list identity. Never comes from the service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResultId(String);

impl ResultId {
    pub fn fresh() -> Self {
        Self(format!("analysis-{}", uuid::Uuid::new_v4()))
    }

    pub fn frame(position: usize) -> Self {
        Self(format!("frame-{position}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmotionResult {
    primary_emotion: Emotion,
    emotion_scores: EmotionScores,
    justification: String,
    id: ResultId,
}

impl EmotionResult {
    pub(crate) fn new(
        primary_emotion: Emotion,
        emotion_scores: EmotionScores,
        justification: impl Into<String>,
    ) -> Self {
        Self {
            primary_emotion,
            emotion_scores,
            justification: justification.into().trim().to_owned(),
            id: ResultId::fresh(),
        }
    }

    pub fn primary_emotion(&self) -> Emotion {
        self.primary_emotion
    }

    pub fn emotion_scores(&self) -> &EmotionScores {
        &self.emotion_scores
    }

    pub fn justification(&self) -> &str {
        &self.justification
    }

    pub fn id(&self) -> &ResultId {
        &self.id
    }

    /// Relabels a result with its 1-based frame position in a batch.
    pub fn into_frame(self, position: usize) -> Self {
        Self {
            id: ResultId::frame(position),
            ..self
        }
    }
}

/// The structured payload the service is instructed to return.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EmotionVerdict {
    pub primary_emotion: Emotion,
    pub emotion_scores: EmotionScores,
    pub justification: String,
}

impl From<EmotionVerdict> for EmotionResult {
    fn from(v: EmotionVerdict) -> Self {
        EmotionResult::new(v.primary_emotion, v.emotion_scores, v.justification)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn scores(pairs: &[(Emotion, f64)]) -> EmotionScores {
        let mut raw: BTreeMap<String, f64> =
            Emotion::ALL.iter().map(|e| (e.as_str().to_owned(), 0.0)).collect();
        for (e, v) in pairs {
            raw.insert(e.as_str().to_owned(), *v);
        }
        EmotionScores::try_from(raw).expect("valid scores")
    }

    pub fn result(primary: Emotion) -> EmotionResult {
        EmotionResult::new(primary, scores(&[(primary, 0.9)]), "test verdict")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_differing_only_in_case_are_rejected() {
        let raw: BTreeMap<String, f64> = Emotion::ALL
            .into_iter()
            .map(|e| (e.as_str().to_owned(), 0.1))
            .chain([("Happy".to_owned(), 0.9)])
            .collect();
        assert!(matches!(
            EmotionScores::try_from(raw),
            Err(ScoresError::DuplicateLabel(label)) if label == "happy"
        ));
    }

    #[test]
    fn emotion_parses_case_insensitively() {
        assert_eq!(" Happy ".parse::<Emotion>().unwrap(), Emotion::Happy);
        assert_eq!("FEAR".parse::<Emotion>().unwrap(), Emotion::Fear);
        assert!("disgusted".parse::<Emotion>().is_err());
    }

    #[test]
    fn emotion_serializes_lowercase() {
        let json = serde_json::to_string(&Emotion::Surprised).unwrap();
        assert_eq!(json, "\"surprised\"");
    }

    #[test]
    fn scores_require_all_six_labels() {
        let err = serde_json::from_str::<EmotionScores>(
            r#"{"happy":0.5,"sad":0.1,"angry":0,"surprised":0,"neutral":0.4}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("fear"));
    }

    #[test]
    fn scores_reject_out_of_range_values() {
        let err = serde_json::from_str::<EmotionScores>(
            r#"{"happy":1.5,"sad":0,"angry":0,"surprised":0,"neutral":0,"fear":0}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("[0, 1]"));
    }

    #[test]
    fn scores_equal_regardless_of_key_order() {
        let a: EmotionScores = serde_json::from_str(
            r#"{"happy":0.9,"sad":0,"angry":0,"surprised":0.05,"neutral":0.05,"fear":0}"#,
        )
        .unwrap();
        let b: EmotionScores = serde_json::from_str(
            r#"{"fear":0,"neutral":0.05,"surprised":0.05,"angry":0,"sad":0,"Happy":0.9}"#,
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.get(Emotion::Happy), 0.9);
    }

    #[test]
    fn scores_keep_extra_labels_after_fixed_ones() {
        let s: EmotionScores = serde_json::from_str(
            r#"{"happy":0.1,"sad":0,"angry":0,"surprised":0,"neutral":0.2,"fear":0,"contempt":0.3}"#,
        )
        .unwrap();
        let labels: Vec<&str> = s.iter().map(|(k, _)| k).collect();
        assert_eq!(
            labels,
            ["happy", "sad", "angry", "surprised", "neutral", "fear", "contempt"]
        );
        assert_eq!(s.get_label("contempt"), Some(0.3));
        assert_eq!(s.strongest(), Emotion::Neutral);
    }

    #[test]
    fn verdict_round_trips_into_result() {
        let verdict: EmotionVerdict = serde_json::from_str(
            r#"{"primaryEmotion":"Happy","emotionScores":{"happy":0.9,"sad":0.0,"angry":0.0,"surprised":0.05,"neutral":0.05,"fear":0.0},"justification":" Celebratory words. "}"#,
        )
        .unwrap();
        let result = EmotionResult::from(verdict);
        assert_eq!(result.primary_emotion(), Emotion::Happy);
        assert_eq!(result.justification(), "Celebratory words.");
        assert!(result.id().as_str().starts_with("analysis-"));

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["primaryEmotion"], "happy");
        assert_eq!(value["emotionScores"]["surprised"], 0.05);
    }

    #[test]
    fn verdict_rejects_label_outside_fixed_set() {
        let err = serde_json::from_str::<EmotionVerdict>(
            r#"{"primaryEmotion":"bored","emotionScores":{"happy":0,"sad":0,"angry":0,"surprised":0,"neutral":1,"fear":0},"justification":"x"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("bored"));
    }

    #[test]
    fn into_frame_relabels_id_only() {
        let result = testing::result(Emotion::Sad);
        let framed = result.clone().into_frame(3);
        assert_eq!(framed.id().as_str(), "frame-3");
        assert_eq!(framed.primary_emotion(), result.primary_emotion());
        assert_eq!(framed.emotion_scores(), result.emotion_scores());
    }
}
