use crate::config::{AnalyzerConfig, CredentialSlot, API_KEY_SOURCE_HINT};
use crate::emotion::{
    AnalysisError, AnalysisRequest, Emotion, EmotionAnalyzer, EmotionResult, EmotionVerdict,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

const LOG_TARGET: &str = "emotion::gemini";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ERROR_BODY_CHARS: usize = 500;

const SYSTEM_INSTRUCTION: &str = "You are an expert emotion analyzer. Your response must strictly \
follow the provided JSON schema. The primary emotion must be one of the keys in emotionScores. \
The justification should be concise.";

/// Emotion analysis through the Gemini `generateContent` REST endpoint with a
/// fixed structured-output schema.
#[derive(Clone)]
pub struct GeminiEmotionAnalyzer {
    client: Client,
    config: AnalyzerConfig,
    credential: CredentialSlot,
}

impl GeminiEmotionAnalyzer {
    pub fn new(config: AnalyzerConfig, credential: CredentialSlot) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AnalysisError::Service(format!("failed to build http client: {e}")))?;
        Ok(Self::with_client(client, config, credential))
    }

    pub fn with_client(client: Client, config: AnalyzerConfig, credential: CredentialSlot) -> Self {
        Self {
            client,
            config,
            credential,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.as_str().trim_end_matches('/'),
            self.config.model.as_str()
        )
    }
}

fn build_prompt(text: Option<&str>) -> String {
    match text {
        Some(text) => format!(
            "Analyze the emotion of the following text: \"{text}\". Consider word choice, \
             sentiment, and context. Respond with the specified JSON schema."
        ),
        None => "Analyze the facial expression and body language in this image to determine \
                 the emotion being displayed. Respond with the specified JSON schema."
            .to_owned(),
    }
}

fn response_schema() -> Value {
    let labels: Vec<&str> = Emotion::ALL.iter().map(|e| e.as_str()).collect();
    let score_properties: serde_json::Map<String, Value> = labels
        .iter()
        .map(|l| ((*l).to_owned(), json!({ "type": "NUMBER" })))
        .collect();
    json!({
        "type": "OBJECT",
        "properties": {
            "primaryEmotion": {
                "type": "STRING",
                "description": format!(
                    "The single most prominent emotion detected. Must be one of: {}.",
                    labels.join(", ")
                ),
                "enum": labels,
            },
            "emotionScores": {
                "type": "OBJECT",
                "description": "An object mapping various emotions to their confidence scores between 0 and 1.",
                "properties": score_properties,
                "required": labels,
            },
            "justification": {
                "type": "STRING",
                "description": "A brief, one-sentence explanation for the emotional analysis.",
            },
        },
        "required": ["primaryEmotion", "emotionScores", "justification"],
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    system_instruction: RequestContent<'a>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct RequestContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Inline {
        inline_data: InlineData<'a>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    response_schema: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<ResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

fn build_request_body(request: &AnalysisRequest) -> GenerateContentRequest<'_> {
    let mut parts = vec![RequestPart::Text {
        text: build_prompt(request.text_content()),
    }];
    if let Some(image) = request.image_content() {
        parts.push(RequestPart::Inline {
            inline_data: InlineData {
                mime_type: &image.mime_type,
                data: image.to_base64(),
            },
        });
    }
    GenerateContentRequest {
        contents: vec![RequestContent {
            role: Some("user"),
            parts,
        }],
        system_instruction: RequestContent {
            role: None,
            parts: vec![RequestPart::Text {
                text: SYSTEM_INSTRUCTION.to_owned(),
            }],
        },
        generation_config: GenerationConfig {
            response_mime_type: "application/json",
            response_schema: response_schema(),
        },
    }
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        return trimmed.to_owned();
    }
    let mut out: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
    out.push('…');
    out
}

fn classify_http_failure(status: StatusCode, body: &str) -> AnalysisError {
    let rejected_key = body.contains("API key not valid") || body.contains("API_KEY_INVALID");
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || (status == StatusCode::BAD_REQUEST && rejected_key)
    {
        return AnalysisError::Auth(format!(
            "HTTP {}; check the key ({API_KEY_SOURCE_HINT})",
            status.as_u16()
        ));
    }
    AnalysisError::Service(format!("HTTP {}: {}", status.as_u16(), truncate_body(body)))
}

/// Pulls the structured verdict out of a `generateContent` response body.
fn parse_response(body: GenerateContentResponse) -> Result<EmotionResult, AnalysisError> {
    let Some(candidate) = body.candidates.into_iter().next() else {
        let reason = body
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .unwrap_or_else(|| "no candidates returned".to_owned());
        return Err(AnalysisError::Service(format!("empty response: {reason}")));
    };
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    let text = text.trim();
    if text.is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "unknown".to_owned());
        return Err(AnalysisError::Service(format!(
            "response contained no text (finish reason: {reason})"
        )));
    }
    let verdict: EmotionVerdict = serde_json::from_str(text)
        .map_err(|e| AnalysisError::Service(format!("malformed analysis response: {e}")))?;
    Ok(verdict.into())
}

impl EmotionAnalyzer for GeminiEmotionAnalyzer {
    fn analyze(
        &self,
        request: AnalysisRequest,
    ) -> BoxFuture<'_, Result<EmotionResult, AnalysisError>> {
        async move {
            let Some(api_key) = self.credential.current() else {
                return Err(AnalysisError::Configuration(API_KEY_SOURCE_HINT.to_owned()));
            };

            let started = Instant::now();
            let body = build_request_body(&request);
            tracing::debug!(
                target: LOG_TARGET,
                model = self.config.model.as_str(),
                has_text = request.text_content().is_some(),
                has_image = request.image_content().is_some(),
                "sending analysis request"
            );

            let response = self
                .client
                .post(self.endpoint())
                .header("x-goog-api-key", api_key.expose())
                .json(&body)
                .send()
                .await
                .map_err(|e| AnalysisError::Service(format!("request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                let err = classify_http_failure(status, &error_text);
                tracing::warn!(target: LOG_TARGET, status = status.as_u16(), error = %err, "analysis request rejected");
                return Err(err);
            }

            let parsed: GenerateContentResponse = response.json().await.map_err(|e| {
                AnalysisError::Service(format!("failed to parse service response: {e}"))
            })?;
            let result = parse_response(parsed)?;

            let strongest = result.emotion_scores().strongest();
            if strongest != result.primary_emotion() {
                tracing::debug!(
                    target: LOG_TARGET,
                    primary = %result.primary_emotion(),
                    strongest = %strongest,
                    "primary emotion differs from highest score"
                );
            }
            tracing::info!(
                target: LOG_TARGET,
                primary = %result.primary_emotion(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "analysis complete"
            );
            Ok(result)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKey, ModelName};
    use crate::media::EncodedImage;
    use mockito::Matcher;

    const PATH: &str = "/v1beta/models/gemini-2.5-flash:generateContent";

    fn verdict_body(verdict: &str) -> String {
        json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": verdict }] },
                "finishReason": "STOP"
            }]
        })
        .to_string()
    }

    const HAPPY_VERDICT: &str = r#"{"primaryEmotion":"happy","emotionScores":{"happy":0.9,"sad":0.0,"angry":0.0,"surprised":0.05,"neutral":0.05,"fear":0.0},"justification":"Winning is cause for joy."}"#;

    fn analyzer(base_url: &str, key: Option<&str>) -> GeminiEmotionAnalyzer {
        let config = AnalyzerConfig::new(ModelName::default(), base_url).unwrap();
        let slot = CredentialSlot::new(key.map(|k| ApiKey::new(k).unwrap()));
        GeminiEmotionAnalyzer::new(config, slot).unwrap()
    }

    #[test]
    fn prompt_depends_on_text_presence() {
        let p = build_prompt(Some("I'm thrilled, we won!"));
        assert!(p.starts_with("Analyze the emotion of the following text: \"I'm thrilled, we won!\""));
        assert!(build_prompt(None).contains("facial expression and body language"));
    }

    #[test]
    fn schema_requires_all_labels() {
        let schema = response_schema();
        let required = schema["properties"]["emotionScores"]["required"]
            .as_array()
            .unwrap();
        assert_eq!(required.len(), 6);
        assert_eq!(schema["properties"]["primaryEmotion"]["enum"][5], "fear");
        assert_eq!(schema["required"][0], "primaryEmotion");
    }

    #[test]
    fn request_body_inlines_image() {
        let req = AnalysisRequest::image(EncodedImage::jpeg(vec![0xFF, 0xD8, 0xFF, 0xD9]));
        let body = serde_json::to_value(build_request_body(&req)).unwrap();
        let parts = &body["contents"][0]["parts"];
        assert!(parts[0]["text"].as_str().unwrap().contains("image"));
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(parts[1]["inlineData"]["data"], "/9j/2Q==");
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert!(body["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("expert emotion analyzer"));
    }

    #[test]
    fn text_request_has_single_part() {
        let body = serde_json::to_value(build_request_body(&AnalysisRequest::text("hi"))).unwrap();
        assert_eq!(body["contents"][0]["parts"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn rejected_key_is_auth_error() {
        let body = r#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key.","status":"INVALID_ARGUMENT"}}"#;
        assert!(matches!(
            classify_http_failure(StatusCode::BAD_REQUEST, body),
            AnalysisError::Auth(_)
        ));
        assert!(matches!(
            classify_http_failure(StatusCode::FORBIDDEN, ""),
            AnalysisError::Auth(_)
        ));
        assert!(matches!(
            classify_http_failure(StatusCode::BAD_REQUEST, "bad image"),
            AnalysisError::Service(_)
        ));
        assert!(matches!(
            classify_http_failure(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            AnalysisError::Service(_)
        ));
    }

    #[test]
    fn blocked_prompt_is_service_error() {
        let body: GenerateContentResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        let err = parse_response(body).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[tokio::test]
    async fn text_scenario_returns_happy_result() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .match_header("x-goog-api-key", "test-key")
            .match_body(Matcher::PartialJson(json!({
                "generationConfig": { "responseMimeType": "application/json" }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(verdict_body(HAPPY_VERDICT))
            .create_async()
            .await;

        let result = analyzer(&server.url(), Some("test-key"))
            .analyze(AnalysisRequest::text("I'm thrilled, we won!"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.primary_emotion(), Emotion::Happy);
        assert_eq!(result.emotion_scores().get(Emotion::Happy), 0.9);
        assert!(result.id().as_str().starts_with("analysis-"));
    }

    #[tokio::test]
    async fn missing_credential_fails_without_network_call() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", PATH).expect(0).create_async().await;

        let err = analyzer(&server.url(), None)
            .analyze(AnalysisRequest::text("hello"))
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, AnalysisError::Configuration(_)));
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[tokio::test]
    async fn updated_credential_applies_to_next_call() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", PATH)
            .match_header("x-goog-api-key", "rotated")
            .with_status(200)
            .with_body(verdict_body(HAPPY_VERDICT))
            .create_async()
            .await;

        let config = AnalyzerConfig::new(ModelName::default(), &server.url()).unwrap();
        let slot = CredentialSlot::default();
        let settings = crate::config::Settings::new(slot.clone());
        let analyzer = GeminiEmotionAnalyzer::new(config, slot).unwrap();

        assert!(analyzer.analyze(AnalysisRequest::text("x")).await.is_err());
        settings.update_api_key("rotated").unwrap();
        assert!(analyzer.analyze(AnalysisRequest::text("x")).await.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn invalid_key_response_maps_to_auth() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", PATH)
            .with_status(400)
            .with_body(r#"{"error":{"message":"API key not valid. Please pass a valid API key."}}"#)
            .create_async()
            .await;

        let err = analyzer(&server.url(), Some("bad"))
            .analyze(AnalysisRequest::text("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Auth(_)));
    }

    #[tokio::test]
    async fn malformed_verdict_is_service_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", PATH)
            .with_status(200)
            .with_body(verdict_body(r#"{"primaryEmotion":"happy"}"#))
            .create_async()
            .await;

        let err = analyzer(&server.url(), Some("k"))
            .analyze(AnalysisRequest::text("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Service(_)));
        assert!(err.to_string().contains("malformed"));
    }

    #[tokio::test]
    async fn server_error_is_service_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", PATH)
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let err = analyzer(&server.url(), Some("k"))
            .analyze(AnalysisRequest::text("hello"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
        assert!(matches!(err, AnalysisError::Service(_)));
    }
}
