//! Turns analysis state into terminal output: one card per result with an
//! emoji, the justification and a bar per score.

use crate::emotion::EmotionResult;
use crate::session::{AnalysisMode, AnalysisOutput, AnalysisState};
use crossterm::style::{Color, Stylize};
use std::fmt::Write as _;

pub const IDLE_MESSAGE: &str = "Analysis results will appear here.";
pub const LOADING_MESSAGE: &str = "AI is analyzing... please wait.";
pub const RESULTS_HEADER: &str = "Analysis Results";

pub mod palette {
    use crossterm::style::Color;

    pub const GREEN: Color = Color::Rgb {
        r: 0x34,
        g: 0xD3,
        b: 0x99,
    };
    pub const BLUE: Color = Color::Rgb {
        r: 0x60,
        g: 0xA5,
        b: 0xFA,
    };
    pub const RED: Color = Color::Rgb {
        r: 0xF8,
        g: 0x71,
        b: 0x71,
    };
    pub const AMBER: Color = Color::Rgb {
        r: 0xFB,
        g: 0xBF,
        b: 0x24,
    };
    pub const GRAY: Color = Color::Rgb {
        r: 0x9C,
        g: 0xA3,
        b: 0xAF,
    };
    pub const VIOLET: Color = Color::Rgb {
        r: 0xA7,
        g: 0x8B,
        b: 0xFA,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmotionStyle {
    pub emoji: &'static str,
    pub color: Color,
}

const FALLBACK_STYLE: EmotionStyle = EmotionStyle {
    emoji: "🤔",
    color: palette::VIOLET,
};

/// Styling by label; labels outside the fixed set get the fallback.
pub fn style_for(label: &str) -> EmotionStyle {
    let (emoji, color) = match label.to_ascii_lowercase().as_str() {
        "happy" => ("😊", palette::GREEN),
        "sad" => ("😢", palette::BLUE),
        "angry" => ("😠", palette::RED),
        "surprised" => ("😮", palette::AMBER),
        "neutral" => ("😐", palette::GRAY),
        "fear" => ("😨", palette::VIOLET),
        _ => return FALLBACK_STYLE,
    };
    EmotionStyle { emoji, color }
}

/// `index` is 0-based.
pub fn card_title(mode: AnalysisMode, total: usize, index: usize) -> String {
    if mode == AnalysisMode::Upload && total > 1 {
        format!("Video Frame {}", index + 1)
    } else {
        "Overall Emotion".to_owned()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn percent(score: f64) -> u8 {
    (score * 100.0).round().clamp(0.0, 100.0) as u8
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScoreBar {
    pub label: String,
    pub percent: u8,
    pub color: Color,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultCard {
    pub title: String,
    pub emoji: &'static str,
    pub label: String,
    pub color: Color,
    pub justification: String,
    pub bars: Vec<ScoreBar>,
}

pub fn build_cards(mode: AnalysisMode, results: &[EmotionResult]) -> Vec<ResultCard> {
    let total = results.len();
    results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let primary = r.primary_emotion().as_str();
            let style = style_for(primary);
            ResultCard {
                title: card_title(mode, total, i),
                emoji: style.emoji,
                label: capitalize(primary),
                color: style.color,
                justification: r.justification().to_owned(),
                bars: r
                    .emotion_scores()
                    .iter()
                    .map(|(label, score)| ScoreBar {
                        label: capitalize(label),
                        percent: percent(score),
                        color: style_for(label).color,
                    })
                    .collect(),
            }
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderOptions {
    /// 24-bit color and bold through crossterm.
    pub color: bool,
    pub bar_width: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            color: true,
            bar_width: 24,
        }
    }
}

impl RenderOptions {
    pub fn plain() -> Self {
        Self {
            color: false,
            ..Self::default()
        }
    }

    fn paint(&self, color: Color, text: &str) -> String {
        if self.color {
            text.with(color).to_string()
        } else {
            text.to_owned()
        }
    }

    fn bold(&self, text: &str) -> String {
        if self.color {
            text.bold().to_string()
        } else {
            text.to_owned()
        }
    }

    fn paint_bold(&self, color: Color, text: &str) -> String {
        if self.color {
            text.with(color).bold().to_string()
        } else {
            text.to_owned()
        }
    }
}

pub fn render_card(card: &ResultCard, opts: &RenderOptions) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", opts.bold(&format!("── {} ──", card.title)));
    let _ = writeln!(
        out,
        "{} {}",
        card.emoji,
        opts.paint_bold(card.color, &card.label)
    );
    if !card.justification.is_empty() {
        let _ = writeln!(out, "\"{}\"", card.justification);
    }

    let label_width = card.bars.iter().map(|b| b.label.chars().count()).max().unwrap_or(0);
    for bar in &card.bars {
        let filled = (usize::from(bar.percent) * opts.bar_width + 50) / 100;
        let track = format!(
            "{}{}",
            "█".repeat(filled),
            "░".repeat(opts.bar_width.saturating_sub(filled))
        );
        let _ = writeln!(
            out,
            "  {:<label_width$}  {} {:>3}%",
            bar.label,
            opts.paint(bar.color, &track),
            bar.percent
        );
    }
    out
}

fn render_output(mode: AnalysisMode, output: &AnalysisOutput, opts: &RenderOptions) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", opts.bold(RESULTS_HEADER));
    let _ = writeln!(out);
    if output.results.is_empty() {
        let _ = writeln!(out, "No results could be produced.");
    }
    for card in build_cards(mode, &output.results) {
        out.push_str(&render_card(&card, opts));
        out.push('\n');
    }
    if !output.skipped_frames.is_empty() {
        let skipped: Vec<String> = output.skipped_frames.iter().map(usize::to_string).collect();
        let _ = writeln!(
            out,
            "Note: frame(s) {} could not be analyzed and were skipped.",
            skipped.join(", ")
        );
    }
    out
}

pub fn render_state(state: &AnalysisState, mode: AnalysisMode, opts: &RenderOptions) -> String {
    match state {
        AnalysisState::Idle => format!("{IDLE_MESSAGE}\n"),
        AnalysisState::Loading => format!("{LOADING_MESSAGE}\n"),
        AnalysisState::Failure(message) => {
            format!("{}\n", opts.paint(palette::RED, &format!("Error: {message}")))
        }
        AnalysisState::Success(output) => render_output(mode, output, opts),
    }
}
