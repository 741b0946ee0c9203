use anyhow::Context;
use clap::{Parser, Subcommand};
use emotion_lens_core::capture::{
    probe_speech_recognizer, Capture, CaptureError, FfmpegCamera, TextCapturer, UploadCapturer,
    UploadedFile, VoiceCapturer, WebcamCapturer,
};
use emotion_lens_core::config::{
    resolve_api_key, resolve_optional_string, resolve_string_with_default, AnalyzerConfig,
    AppConfig, CredentialSlot, Env, MediaConfig, ModelName, Settings, SpeechConfig, StdEnv,
    DEFAULT_BASE_URL, DEFAULT_MODEL, DEFAULT_VIDEO_FRAMES, ENV_CAMERA_DEVICE, ENV_GEMINI_API_KEY,
    ENV_GEMINI_BASE_URL, ENV_GEMINI_MODEL, ENV_LEGACY_API_KEY, ENV_STT_COMMAND,
};
use emotion_lens_core::emotion::{AnalysisError, GeminiEmotionAnalyzer};
use emotion_lens_core::media::FfmpegFrameExtractor;
use emotion_lens_core::present::{render_state, RenderOptions};
use emotion_lens_core::session::{
    AnalysisMode, AnalysisOutput, AnalysisState, Orchestrator, Ticket,
};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines, Stdin};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// Lets auto-exposure settle before a one-shot grab.
const WEBCAM_WARMUP: Duration = Duration::from_millis(800);

type InputLines = Lines<BufReader<Stdin>>;
type PendingAnalysis = (Ticket, JoinHandle<Result<AnalysisOutput, AnalysisError>>);

#[derive(Parser, Debug)]
#[command(name = "emotion-lens")]
#[command(about = "Emotion analysis of text, speech, webcam frames and uploaded media")]
struct Args {
    /// Gemini API key (otherwise GEMINI_API_KEY, then API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,

    #[arg(long, global = true)]
    model: Option<String>,

    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Frames sampled from an uploaded video
    #[arg(long, global = true, default_value_t = DEFAULT_VIDEO_FRAMES)]
    frames: usize,

    /// Camera device (v4l2 path, avfoundation index or DirectShow name)
    #[arg(long, global = true)]
    camera: Option<String>,

    /// Streaming speech-to-text command; enables voice input
    #[arg(long, global = true)]
    stt_command: Option<String>,

    /// Recognition language passed to the speech-to-text command
    #[arg(long, global = true)]
    language: Option<String>,

    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Print results as JSON instead of cards
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze text given as arguments, or read from stdin
    Text { text: Vec<String> },
    /// Record speech until Enter is pressed, then analyze the transcript
    Voice,
    /// Analyze the current webcam frame
    Webcam,
    /// Analyze an image, or sampled frames of a video
    Upload {
        path: PathBuf,
        /// Override the MIME type detected from the content or file name
        #[arg(long)]
        mime: Option<String>,
    },
    /// Interactive session with mode switching
    Interactive,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let env = StdEnv;
    let cfg = build_config(&args, &env)?;

    tracing::info!(
        model = %cfg.analyzer.model.as_str(),
        frames = cfg.media.video_frames,
        has_api_key = cfg.api_key.is_some(),
        "config loaded"
    );

    let render = if args.no_color || !std::io::stdout().is_terminal() {
        RenderOptions::plain()
    } else {
        RenderOptions::default()
    };
    let mut app = App::new(cfg, args.json, render)?;

    match args.command {
        Command::Interactive => app.interactive().await,
        command => {
            app.one_shot(command).await?;
            match app.orchestrator.state() {
                AnalysisState::Failure(message) => anyhow::bail!("{message}"),
                _ => Ok(()),
            }
        }
    }
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid --log-level: {level}"))?,
        )
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn build_config(args: &Args, env: &impl Env) -> anyhow::Result<AppConfig> {
    let api_key = resolve_api_key(
        args.api_key.clone(),
        &[ENV_GEMINI_API_KEY, ENV_LEGACY_API_KEY],
        env,
    )?;

    let model = ModelName::new(resolve_string_with_default(
        args.model.clone(),
        ENV_GEMINI_MODEL,
        env,
        DEFAULT_MODEL,
    ))?;
    let base_url =
        resolve_string_with_default(args.base_url.clone(), ENV_GEMINI_BASE_URL, env, DEFAULT_BASE_URL);
    let analyzer = AnalyzerConfig::new(model, &base_url)?;

    if args.frames == 0 {
        anyhow::bail!("--frames must be at least 1");
    }

    Ok(AppConfig {
        api_key,
        analyzer,
        media: MediaConfig {
            video_frames: args.frames,
            camera_device: resolve_optional_string(args.camera.clone(), ENV_CAMERA_DEVICE, env),
        },
        speech: SpeechConfig {
            command: resolve_optional_string(args.stt_command.clone(), ENV_STT_COMMAND, env),
            language: args.language.clone(),
        },
    })
}

#[derive(Debug, PartialEq, Eq)]
enum ReplCommand {
    Empty,
    Help,
    Quit,
    Mode(AnalysisMode),
    Record,
    Capture,
    Upload(PathBuf),
    SetKey(String),
    ClearKey,
    Text(String),
    Invalid(String),
}

/// In text mode every line is text unless it starts with `:`. Other modes
/// also accept the bare command words.
fn parse_command(line: &str, mode: AnalysisMode) -> ReplCommand {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ReplCommand::Empty;
    }
    let command = match trimmed.strip_prefix(':') {
        Some(command) => command,
        None if mode == AnalysisMode::Text => return ReplCommand::Text(line.to_owned()),
        None => trimmed,
    };
    let (head, rest) = match command.split_once(char::is_whitespace) {
        Some((h, r)) => (h, r.trim()),
        None => (command, ""),
    };
    match head {
        "help" => ReplCommand::Help,
        "quit" | "q" | "exit" => ReplCommand::Quit,
        "mode" => match rest.parse() {
            Ok(m) => ReplCommand::Mode(m),
            Err(e) => ReplCommand::Invalid(format!("{e}")),
        },
        "record" => ReplCommand::Record,
        "capture" => ReplCommand::Capture,
        "upload" => match single_argument(rest) {
            Some(path) => ReplCommand::Upload(PathBuf::from(path)),
            None => ReplCommand::Invalid("usage: :upload <path> (quote paths with spaces)".to_owned()),
        },
        "key" => match single_argument(rest).as_deref() {
            Some("clear") => ReplCommand::ClearKey,
            Some(key) => ReplCommand::SetKey(key.to_owned()),
            None => ReplCommand::Invalid("usage: :key <api key> | :key clear".to_owned()),
        },
        _ if mode == AnalysisMode::Text => ReplCommand::Invalid(format!("unknown command :{head}")),
        _ => ReplCommand::Text(line.to_owned()),
    }
}

fn single_argument(rest: &str) -> Option<String> {
    let mut args = shlex::split(rest)?;
    if args.len() == 1 {
        args.pop()
    } else {
        None
    }
}

const HELP: &str = "\
Commands (the leading `:` is optional outside text mode):
  :mode <text|voice|webcam|upload>  switch input mode
  <any text>                        analyze text (text mode)
  :record                           record speech, Enter to stop (voice mode)
  :capture                          analyze the current webcam frame (webcam mode)
  :upload <path>                    analyze an image or video (upload mode)
  :key <api key> | :key clear       update the Gemini API key
  :help, :quit";

struct App {
    orchestrator: Orchestrator,
    settings: Settings,
    uploads: UploadCapturer,
    json: bool,
    render: RenderOptions,
    pending: Option<PendingAnalysis>,
}

impl App {
    fn new(cfg: AppConfig, json: bool, render: RenderOptions) -> anyhow::Result<Self> {
        let slot = CredentialSlot::new(cfg.api_key.clone());
        let settings = Settings::new(slot.clone());
        let analyzer = GeminiEmotionAnalyzer::new(cfg.analyzer.clone(), slot)
            .context("failed to create analyzer")?;

        let voice = VoiceCapturer::new(probe_speech_recognizer(&cfg.speech));
        let webcam = WebcamCapturer::new(Arc::new(FfmpegCamera::new(
            cfg.media.camera_device.clone(),
        )));
        let uploads =
            UploadCapturer::new(Arc::new(FfmpegFrameExtractor::new()), cfg.media.video_frames);

        let orchestrator = Orchestrator::new(Arc::new(analyzer))
            .with_webcam(webcam)
            .with_voice(voice);

        Ok(Self {
            orchestrator,
            settings,
            uploads,
            json,
            render,
            pending: None,
        })
    }

    fn show(&self) {
        let state = self.orchestrator.state();
        if self.json {
            let value = match state {
                AnalysisState::Success(output) => serde_json::to_value(output),
                AnalysisState::Failure(message) => Ok(serde_json::json!({ "error": message })),
                AnalysisState::Idle | AnalysisState::Loading => return,
            };
            match value.and_then(|v| serde_json::to_string_pretty(&v)) {
                Ok(s) => println!("{s}"),
                Err(e) => tracing::error!(error = %e, "failed to serialize output"),
            }
            return;
        }
        print!("{}", render_state(state, self.orchestrator.mode(), &self.render));
    }

    fn show_progress(&self) {
        if !self.json {
            eprint!(
                "{}",
                render_state(&AnalysisState::Loading, self.orchestrator.mode(), &self.render)
            );
        }
    }

    async fn one_shot(&mut self, command: Command) -> anyhow::Result<()> {
        let capture = match command {
            Command::Text { text } => {
                self.orchestrator.select_mode(AnalysisMode::Text);
                let text = if text.is_empty() {
                    let mut buf = String::new();
                    tokio::io::stdin()
                        .read_to_string(&mut buf)
                        .await
                        .context("failed to read text from stdin")?;
                    buf
                } else {
                    text.join(" ")
                };
                TextCapturer::new().capture(text)
            }
            Command::Voice => {
                self.orchestrator.select_mode(AnalysisMode::Voice);
                let mut lines = BufReader::new(tokio::io::stdin()).lines();
                self.record_voice(&mut lines).await
            }
            Command::Webcam => match self.orchestrator.enter_mode(AnalysisMode::Webcam).await {
                Ok(()) => {
                    tokio::time::sleep(WEBCAM_WARMUP).await;
                    self.capture_webcam().await
                }
                Err(e) => Err(e),
            },
            Command::Upload { path, mime } => {
                self.orchestrator.select_mode(AnalysisMode::Upload);
                self.uploads
                    .capture(UploadedFile::from_path(path, mime))
                    .await
            }
            Command::Interactive => anyhow::bail!("interactive is not a one-shot command"),
        };

        match capture {
            Ok(capture) => {
                self.show_progress();
                self.orchestrator.submit(capture).await?;
            }
            Err(e) => self.orchestrator.fail(e.to_string())?,
        }
        if let Some(webcam) = self.orchestrator.webcam_mut() {
            webcam.close();
        }
        // Failures reach the user through the process error in card mode.
        if self.json || matches!(self.orchestrator.state(), AnalysisState::Success(_)) {
            self.show();
        }
        Ok(())
    }

    async fn record_voice(&mut self, lines: &mut InputLines) -> Result<Capture, CaptureError> {
        let voice = self
            .orchestrator
            .voice_mut()
            .ok_or(CaptureError::SpeechUnsupported)?;
        voice.start().await?;
        eprintln!("Recording... press Enter to stop.");

        loop {
            tokio::select! {
                _ = lines.next_line() => break,
                update = voice.wait_update() => match update {
                    Ok(true) => eprint!("\r{}", voice.transcript()),
                    Ok(false) => break,
                    Err(e) => {
                        eprintln!();
                        return Err(e);
                    }
                },
            }
        }
        eprintln!();
        voice.stop()?.ok_or(CaptureError::EmptyInput)
    }

    async fn capture_webcam(&mut self) -> Result<Capture, CaptureError> {
        let webcam = self
            .orchestrator
            .webcam_mut()
            .ok_or(CaptureError::NotActive)?;
        if !webcam.is_open() {
            webcam.open().await?;
            tokio::time::sleep(WEBCAM_WARMUP).await;
        }
        webcam.capture().await
    }

    fn start_analysis(&mut self, capture: Capture) {
        match self.orchestrator.begin() {
            Ok(ticket) => {
                let job = self.orchestrator.job(capture);
                self.pending = Some((ticket, tokio::spawn(job.run())));
                self.show_progress();
            }
            Err(e) => eprintln!("{e}"),
        }
    }

    fn finish_analysis(
        &mut self,
        ticket: Ticket,
        outcome: Result<Result<AnalysisOutput, AnalysisError>, tokio::task::JoinError>,
    ) {
        let outcome = outcome.unwrap_or_else(|e| {
            Err(AnalysisError::Service(format!("analysis task failed: {e}")))
        });
        if self.orchestrator.complete(ticket, outcome) {
            self.show();
        }
    }

    fn report_capture_error(&mut self, e: CaptureError) {
        match self.orchestrator.fail(e.to_string()) {
            Ok(()) => self.show(),
            Err(busy) => eprintln!("{busy}"),
        }
    }

    fn require_mode(&self, wanted: AnalysisMode) -> bool {
        if self.orchestrator.mode() == wanted {
            return true;
        }
        eprintln!(
            "not in {wanted} mode (current: {}); switch with `mode {wanted}`",
            self.orchestrator.mode()
        );
        false
    }

    fn require_idle(&self) -> bool {
        if self.orchestrator.state().is_loading() {
            eprintln!("an analysis is already in progress");
            return false;
        }
        true
    }

    async fn interactive(&mut self) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        eprintln!("{HELP}");
        eprintln!("Mode: {}", self.orchestrator.mode());
        self.show();

        loop {
            tokio::select! {
                (ticket, outcome) = wait_pending(&mut self.pending) => {
                    self.pending = None;
                    self.finish_analysis(ticket, outcome);
                }
                line = lines.next_line() => {
                    let Some(line) = line.context("failed to read stdin")? else {
                        break;
                    };
                    if !self.handle_line(&line, &mut lines).await {
                        break;
                    }
                }
            }
        }

        if let Some((ticket, handle)) = self.pending.take() {
            let outcome = handle.await;
            self.finish_analysis(ticket, outcome);
        }
        Ok(())
    }

    /// Returns `false` when the session should end.
    async fn handle_line(&mut self, line: &str, lines: &mut InputLines) -> bool {
        match parse_command(line, self.orchestrator.mode()) {
            ReplCommand::Empty => {}
            ReplCommand::Help => eprintln!("{HELP}"),
            ReplCommand::Quit => return false,
            ReplCommand::Invalid(msg) => eprintln!("{msg}"),
            ReplCommand::Mode(mode) => {
                let entered = self.orchestrator.enter_mode(mode).await;
                eprintln!("Mode: {mode}");
                if entered.is_ok() && mode == AnalysisMode::Webcam {
                    eprintln!("Camera is live; type :capture to analyze the current frame.");
                }
                if mode == AnalysisMode::Voice
                    && !self
                        .orchestrator
                        .voice_mut()
                        .is_some_and(|v| v.is_supported())
                {
                    eprintln!("{}", CaptureError::SpeechUnsupported);
                }
                self.show();
            }
            ReplCommand::SetKey(key) => match self.settings.update_api_key(key) {
                Ok(()) => eprintln!("API key updated."),
                Err(e) => eprintln!("{e}"),
            },
            ReplCommand::ClearKey => {
                self.settings.clear_api_key();
                eprintln!("API key cleared.");
            }
            ReplCommand::Text(text) => {
                if self.require_mode(AnalysisMode::Text) && self.require_idle() {
                    match TextCapturer::new().capture(text) {
                        Ok(capture) => self.start_analysis(capture),
                        Err(e) => self.report_capture_error(e),
                    }
                }
            }
            ReplCommand::Record => {
                if self.require_mode(AnalysisMode::Voice) && self.require_idle() {
                    match self.record_voice(lines).await {
                        Ok(capture) => self.start_analysis(capture),
                        Err(CaptureError::EmptyInput) => eprintln!("Nothing was transcribed."),
                        Err(e) => self.report_capture_error(e),
                    }
                }
            }
            ReplCommand::Capture => {
                if self.require_mode(AnalysisMode::Webcam) && self.require_idle() {
                    match self.capture_webcam().await {
                        Ok(capture) => self.start_analysis(capture),
                        Err(e) => self.report_capture_error(e),
                    }
                }
            }
            ReplCommand::Upload(path) => {
                if self.require_mode(AnalysisMode::Upload) && self.require_idle() {
                    match self.uploads.capture(UploadedFile::from_path(path, None)).await {
                        Ok(capture) => self.start_analysis(capture),
                        Err(e) => self.report_capture_error(e),
                    }
                }
            }
        }
        true
    }
}

async fn wait_pending(
    pending: &mut Option<PendingAnalysis>,
) -> (
    Ticket,
    Result<Result<AnalysisOutput, AnalysisError>, tokio::task::JoinError>,
) {
    match pending {
        Some((ticket, handle)) => (*ticket, handle.await),
        None => std::future::pending().await,
    }
}
