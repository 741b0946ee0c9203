use crate::capture::{Capture, CaptureError};
use crate::config::SpeechConfig;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};

const LOG_TARGET: &str = "capture::voice";
const EVENT_CAPACITY: usize = 64;
const DEFAULT_LANGUAGE: &str = "en-US";
pub const ENV_RECOGNIZER_LANGUAGE: &str = "EMOTION_LENS_LANG";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TranscriptFragment {
    Final(String),
    Interim(String),
}

#[derive(Debug)]
pub enum RecognitionEvent {
    Fragment(TranscriptFragment),
    Failed(CaptureError),
    Ended,
}

/// Finalized text in arrival order followed by the most recent interim guess.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TranscriptAccumulator {
    finalized: String,
    interim: String,
}

fn join_fragment(buf: &mut String, fragment: &str) {
    let needs_space = !buf.is_empty()
        && !buf.ends_with(char::is_whitespace)
        && !fragment.starts_with(char::is_whitespace);
    if needs_space {
        buf.push(' ');
    }
    buf.push_str(fragment);
}

impl TranscriptAccumulator {
    pub fn push(&mut self, fragment: TranscriptFragment) {
        match fragment {
            TranscriptFragment::Final(text) => {
                join_fragment(&mut self.finalized, &text);
                self.interim.clear();
            }
            TranscriptFragment::Interim(text) => self.interim = text,
        }
    }

    pub fn text(&self) -> String {
        let mut out = self.finalized.clone();
        if !self.interim.is_empty() {
            join_fragment(&mut out, &self.interim);
        }
        out
    }

    pub fn is_blank(&self) -> bool {
        self.finalized.trim().is_empty() && self.interim.trim().is_empty()
    }

    pub fn clear(&mut self) {
        self.finalized.clear();
        self.interim.clear();
    }
}

pub trait SpeechRecognizer: Send + Sync {
    /// Acquires the microphone and starts continuous recognition. Events are
    /// delivered on `events` until the returned handle is stopped or dropped.
    fn start(
        &self,
        events: mpsc::Sender<RecognitionEvent>,
    ) -> BoxFuture<'_, Result<Box<dyn ActiveRecognition>, CaptureError>>;
}

/// A running recognition. Dropping it must release the microphone.
pub trait ActiveRecognition: Send {
    fn stop(&mut self);
}

/// Returns a recognizer when this environment can do speech-to-text.
pub fn probe_speech_recognizer(config: &SpeechConfig) -> Option<Box<dyn SpeechRecognizer>> {
    let command = config.command.as_deref()?;
    let language = config
        .language
        .clone()
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_owned());
    let recognizer = CommandSpeechRecognizer::new(command, language)?;
    Some(Box::new(recognizer))
}

struct ActiveSession {
    handle: Box<dyn ActiveRecognition>,
    events: mpsc::Receiver<RecognitionEvent>,
}

/// Voice input: record, accumulate a transcript, and emit it as text on stop.
pub struct VoiceCapturer {
    recognizer: Option<Box<dyn SpeechRecognizer>>,
    active: Option<ActiveSession>,
    transcript: TranscriptAccumulator,
}

impl VoiceCapturer {
    pub fn new(recognizer: Option<Box<dyn SpeechRecognizer>>) -> Self {
        if recognizer.is_none() {
            tracing::info!(target: LOG_TARGET, "no speech recognizer available; voice input disabled");
        }
        Self {
            recognizer,
            active: None,
            transcript: TranscriptAccumulator::default(),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.recognizer.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn transcript(&self) -> String {
        self.transcript.text()
    }

    pub async fn start(&mut self) -> Result<(), CaptureError> {
        let recognizer = self
            .recognizer
            .as_ref()
            .ok_or(CaptureError::SpeechUnsupported)?;
        if self.active.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let handle = recognizer.start(tx).await?;
        self.transcript.clear();
        self.active = Some(ActiveSession { handle, events: rx });
        tracing::info!(target: LOG_TARGET, "recording started");
        Ok(())
    }

    fn apply(&mut self, event: RecognitionEvent) -> Result<bool, CaptureError> {
        match event {
            RecognitionEvent::Fragment(f) => {
                self.transcript.push(f);
                Ok(true)
            }
            RecognitionEvent::Failed(e) => {
                tracing::warn!(target: LOG_TARGET, error = %e, "recognition failed; recording aborted");
                self.release();
                Err(e)
            }
            RecognitionEvent::Ended => {
                tracing::debug!(target: LOG_TARGET, "recognizer ended");
                self.release();
                Ok(false)
            }
        }
    }

    /// Waits for the next recognizer event and applies it. Returns whether
    /// the recording is still running.
    pub async fn wait_update(&mut self) -> Result<bool, CaptureError> {
        let session = self.active.as_mut().ok_or(CaptureError::NotActive)?;
        match session.events.recv().await {
            Some(event) => self.apply(event),
            None => self.apply(RecognitionEvent::Ended),
        }
    }

    /// Applies every event already delivered without waiting.
    pub fn pump(&mut self) -> Result<bool, CaptureError> {
        loop {
            let Some(session) = self.active.as_mut() else {
                return Ok(false);
            };
            match session.events.try_recv() {
                Ok(event) => {
                    if !self.apply(event)? {
                        return Ok(false);
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return Ok(true),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return self.apply(RecognitionEvent::Ended)
                }
            }
        }
    }

    /// Stops recording and emits the transcript, if any.
    pub fn stop(&mut self) -> Result<Option<Capture>, CaptureError> {
        if let Some(session) = self.active.as_mut() {
            session.handle.stop();
        }
        self.pump()?;
        self.release();

        if self.transcript.is_blank() {
            tracing::info!(target: LOG_TARGET, "recording stopped with an empty transcript");
            return Ok(None);
        }
        Ok(Some(Capture::Text(self.transcript.text())))
    }

    /// Drops any recording and transcript without emitting anything.
    pub fn reset(&mut self) {
        self.release();
        self.transcript.clear();
    }

    fn release(&mut self) {
        if let Some(mut session) = self.active.take() {
            session.handle.stop();
            tracing::debug!(target: LOG_TARGET, "microphone released");
        }
    }
}

impl Drop for VoiceCapturer {
    fn drop(&mut self) {
        self.release();
    }
}

fn parse_transcript_line(line: &str) -> Option<TranscriptFragment> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(rest) = line.strip_prefix("interim:") {
        return Some(TranscriptFragment::Interim(rest.trim().to_owned()));
    }
    let text = line.strip_prefix("final:").unwrap_or(line).trim();
    Some(TranscriptFragment::Final(text.to_owned()))
}

fn classify_recognizer_failure(stderr: &str, code: Option<i32>) -> CaptureError {
    let lower = stderr.to_ascii_lowercase();
    let detail = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_owned())
        .unwrap_or_else(|| format!("recognizer exited with code {code:?}"));
    if lower.contains("permission denied") || lower.contains("not authorized") {
        return CaptureError::PermissionDenied {
            device: "microphone",
            details: detail,
        };
    }
    CaptureError::Recognition(detail)
}

/// Speech-to-text through an external streaming command. The command owns
/// the microphone and prints one transcript fragment per line, optionally
/// prefixed `final:` or `interim:`.
#[derive(Clone, Debug)]
pub struct CommandSpeechRecognizer {
    program: String,
    args: Vec<String>,
    language: String,
}

impl CommandSpeechRecognizer {
    /// Splits `command_line` with shell quoting rules. `None` when it is
    /// blank or its quotes are unbalanced.
    pub fn new(command_line: &str, language: impl Into<String>) -> Option<Self> {
        let mut parts = shlex::split(command_line)?.into_iter();
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            language: language.into(),
        })
    }
}

struct CommandRecognition {
    stop_tx: Option<oneshot::Sender<()>>,
}

impl ActiveRecognition for CommandRecognition {
    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for CommandRecognition {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SpeechRecognizer for CommandSpeechRecognizer {
    fn start(
        &self,
        events: mpsc::Sender<RecognitionEvent>,
    ) -> BoxFuture<'_, Result<Box<dyn ActiveRecognition>, CaptureError>> {
        async move {
            let mut child = tokio::process::Command::new(&self.program)
                .args(&self.args)
                .env(ENV_RECOGNIZER_LANGUAGE, &self.language)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::PermissionDenied => CaptureError::PermissionDenied {
                        device: "microphone",
                        details: e.to_string(),
                    },
                    std::io::ErrorKind::NotFound => CaptureError::SpeechUnsupported,
                    _ => CaptureError::Recognition(format!("failed to start {}: {e}", self.program)),
                })?;

            let stdout = child.stdout.take().ok_or_else(|| {
                CaptureError::Recognition("recognizer stdout unavailable (pipe not created)".to_owned())
            })?;
            let mut stderr = child.stderr.take().ok_or_else(|| {
                CaptureError::Recognition("recognizer stderr unavailable (pipe not created)".to_owned())
            })?;

            let stderr_task = tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            });

            let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        _ = &mut stop_rx => {
                            let _ = child.kill().await;
                            let _ = events.send(RecognitionEvent::Ended).await;
                            break;
                        }
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                if let Some(fragment) = parse_transcript_line(&line) {
                                    if events.send(RecognitionEvent::Fragment(fragment)).await.is_err() {
                                        let _ = child.kill().await;
                                        break;
                                    }
                                }
                            }
                            Ok(None) => {
                                let status = child.wait().await;
                                let stderr = stderr_task.await.unwrap_or_default();
                                let event = match status {
                                    Ok(s) if s.success() => RecognitionEvent::Ended,
                                    Ok(s) => RecognitionEvent::Failed(classify_recognizer_failure(&stderr, s.code())),
                                    Err(e) => RecognitionEvent::Failed(CaptureError::Recognition(e.to_string())),
                                };
                                let _ = events.send(event).await;
                                break;
                            }
                            Err(e) => {
                                let _ = child.kill().await;
                                let _ = events
                                    .send(RecognitionEvent::Failed(CaptureError::Recognition(e.to_string())))
                                    .await;
                                break;
                            }
                        }
                    }
                }
                tracing::debug!(target: LOG_TARGET, "recognizer process finished");
            });

            Ok(Box::new(CommandRecognition {
                stop_tx: Some(stop_tx),
            }) as Box<dyn ActiveRecognition>)
        }
        .boxed()
    }
}
