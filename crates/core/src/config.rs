use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Arc, RwLock},
};
use url::Url;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_VIDEO_FRAMES: usize = 4;
pub const PLACEHOLDER_API_KEY: &str = "PASTE_YOUR_GEMINI_API_KEY_HERE";
pub const ENV_GEMINI_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_LEGACY_API_KEY: &str = "API_KEY";
pub const ENV_GEMINI_MODEL: &str = "EMOTION_LENS_MODEL";
pub const ENV_GEMINI_BASE_URL: &str = "EMOTION_LENS_BASE_URL";
pub const ENV_STT_COMMAND: &str = "EMOTION_LENS_STT_COMMAND";
pub const ENV_CAMERA_DEVICE: &str = "EMOTION_LENS_CAMERA";

/// Where a missing credential should be supplied; used in user-facing errors.
pub const API_KEY_SOURCE_HINT: &str = "pass --api-key or set GEMINI_API_KEY";

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new<S: Into<String>>(value: S) -> Result<Self, ConfigError> {
        let v = value.into();
        if v.trim().is_empty() {
            return Err(ConfigError::EmptyApiKey);
        }
        if is_placeholder_key(&v) {
            return Err(ConfigError::PlaceholderApiKey);
        }
        Ok(Self(v))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(**redacted**)")
    }
}

pub fn is_placeholder_key(value: &str) -> bool {
    value.trim() == PLACEHOLDER_API_KEY
}

/// Shared, replaceable credential. The analyzer reads it on every call, so an
/// update through [`Settings`] applies to the next request.
#[derive(Clone, Default)]
pub struct CredentialSlot {
    inner: Arc<RwLock<Option<ApiKey>>>,
}

impl CredentialSlot {
    pub fn new(initial: Option<ApiKey>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn current(&self) -> Option<ApiKey> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => {
                tracing::warn!("credential slot lock was poisoned; recovering");
                poisoned.into_inner().clone()
            }
        }
    }

    fn replace(&self, value: Option<ApiKey>) {
        let mut guard = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = value;
    }
}

impl fmt::Debug for CredentialSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSlot")
            .field("configured", &self.current().is_some())
            .finish()
    }
}

/// Settings surface for the credential. Holds the same slot the analyzer was
/// built with.
#[derive(Clone, Debug)]
pub struct Settings {
    slot: CredentialSlot,
}

impl Settings {
    pub fn new(slot: CredentialSlot) -> Self {
        Self { slot }
    }

    pub fn update_api_key<S: Into<String>>(&self, value: S) -> Result<(), ConfigError> {
        let key = ApiKey::new(value)?;
        self.slot.replace(Some(key));
        tracing::info!("api key updated");
        Ok(())
    }

    pub fn clear_api_key(&self) {
        self.slot.replace(None);
    }

    pub fn has_api_key(&self) -> bool {
        self.slot.current().is_some()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelName(String);

impl ModelName {
    pub fn new<S: Into<String>>(value: S) -> Result<Self, ConfigError> {
        let v = value.into();
        if v.trim().is_empty() {
            return Err(ConfigError::EmptyModel);
        }
        Ok(Self(v.trim().to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ModelName {
    fn default() -> Self {
        Self(DEFAULT_MODEL.to_owned())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalyzerConfig {
    pub model: ModelName,
    pub base_url: Url,
}

impl AnalyzerConfig {
    pub fn new(model: ModelName, base_url: &str) -> Result<Self, ConfigError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ConfigError::InvalidBaseUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self { model, base_url })
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            model: ModelName::default(),
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base url is valid"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaConfig {
    pub video_frames: usize,
    pub camera_device: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_frames: DEFAULT_VIDEO_FRAMES,
            camera_device: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpeechConfig {
    /// External speech-to-text command line; `None` disables voice input.
    pub command: Option<String>,
    pub language: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_key: Option<ApiKey>,
    pub analyzer: AnalyzerConfig,
    pub media: MediaConfig,
    pub speech: SpeechConfig,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("api key must not be empty")]
    EmptyApiKey,
    #[error("api key is still the placeholder value; {API_KEY_SOURCE_HINT}")]
    PlaceholderApiKey,
    #[error("model name must not be empty")]
    EmptyModel,
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
}

pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct StdEnv;

impl Env for StdEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapEnv {
    vars: std::collections::BTreeMap<String, String>,
}

impl MapEnv {
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl Env for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

/// Resolves a key from the CLI value, then each env var in order. The
/// placeholder value counts as unset so the analyzer can report it as a
/// configuration problem at call time.
pub fn resolve_api_key(
    cli_value: Option<String>,
    env_keys: &[&str],
    env: &impl Env,
) -> Result<Option<ApiKey>, ConfigError> {
    let candidate = cli_value.or_else(|| env_keys.iter().find_map(|k| env.var(k)));
    match candidate {
        Some(v) if is_placeholder_key(&v) => {
            tracing::warn!("api key is the placeholder value; treating it as unset");
            Ok(None)
        }
        Some(v) => Ok(Some(ApiKey::new(v)?)),
        None => Ok(None),
    }
}

pub fn resolve_string_with_default(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
    default: &str,
) -> String {
    match cli_value {
        Some(v) => v,
        None => env.var(env_key).unwrap_or_else(|| default.to_owned()),
    }
}

pub fn resolve_optional_string(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
) -> Option<String> {
    match cli_value {
        Some(v) => Some(v),
        None => env.var(env_key),
    }
}
