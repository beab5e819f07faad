use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{HumanCount, ProgressBar, ProgressStyle};
use updraft_core::UpdateError;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

/// Long-running stages of `updraft run` that get a progress bar.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Stage {
    Download,
    Extract,
    Replace,
}

impl Stage {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Extract => "extract",
            Self::Replace => "replace",
        }
    }

    /// Downloads count chunks; batch stages report a percentage.
    fn counts_chunks(self) -> bool {
        self == Self::Download
    }

    fn spinner(self) -> &'static str {
        match self {
            Self::Download => ".oO@* ",
            Self::Extract => "-=~* ",
            Self::Replace => "<^>v ",
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

pub(crate) struct StageProgress {
    style: OutputStyle,
    stage: Stage,
    total: u64,
    done: u64,
    bar: Option<ProgressBar>,
    started: Instant,
}

/// Rich output only when stdout is a terminal.
pub(crate) fn resolve_output_style(stdout_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

fn current_output_style() -> OutputStyle {
    resolve_output_style(std::io::stdout().is_terminal())
}

impl TerminalRenderer {
    pub(crate) fn current() -> Self {
        Self::with_style(current_output_style())
    }

    pub(crate) fn with_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    /// Phase banner; plain output stays line-oriented and skips it.
    pub(crate) fn print_phase(self, stage: Stage) {
        if self.style == OutputStyle::Plain {
            return;
        }
        println!();
        println!("{}", paint(phase_style(), &format!(">> {}", stage.as_str())));
    }

    pub(crate) fn start_progress(self, stage: Stage, total: u64) -> StageProgress {
        let bar = (self.style == OutputStyle::Rich).then(|| build_bar(stage, total));
        StageProgress {
            style: self.style,
            stage,
            total,
            done: 0,
            bar,
            started: Instant::now(),
        }
    }
}

fn build_bar(stage: Stage, total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total.max(1));
    let template = if stage.counts_chunks() {
        "{spinner:.cyan.bold} {msg:<9} [{bar:24.cyan/blue}] {pos}/{len} chunks {elapsed}"
    } else {
        "{spinner:.cyan.bold} {msg:<9} [{bar:24.cyan/blue}] {pos:>3}% {elapsed}"
    };
    if let Ok(style) = ProgressStyle::with_template(template) {
        bar.set_style(style.tick_chars(stage.spinner()).progress_chars("#>."));
    }
    bar.set_message(stage.as_str());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

impl StageProgress {
    pub(crate) fn done(&self) -> u64 {
        self.done
    }

    pub(crate) fn advance_to(&mut self, done: u64) {
        self.done = done.min(self.total);
        if let Some(bar) = &self.bar {
            bar.set_position(self.done);
        }
    }

    pub(crate) fn finish(mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        let summary = render_stage_summary(
            self.style,
            self.stage,
            self.done,
            self.total,
            self.started.elapsed(),
        );
        if let Some(line) = summary {
            println!("{line}");
        }
    }

    /// Leaves the bar on screen where it stopped.
    pub(crate) fn abandon(mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon();
        }
    }
}

pub(crate) fn print_error(err: &anyhow::Error) {
    eprintln!("{}", render_error_line(current_output_style(), err));
}

/// `<kind>: <chain>` where the kind comes from a typed update error.
pub(crate) fn render_error_line(style: OutputStyle, err: &anyhow::Error) -> String {
    let kind = err
        .downcast_ref::<UpdateError>()
        .map(UpdateError::label)
        .unwrap_or("error");
    render_status_line(style, "error", &format!("{kind}: {err:#}"))
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("[{}] {message}", status.to_ascii_uppercase()),
    }
}

/// One line printed when a stage finishes; `None` for plain output.
pub(crate) fn render_stage_summary(
    style: OutputStyle,
    stage: Stage,
    done: u64,
    total: u64,
    elapsed: Duration,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let label = paint(stage_style(), stage.as_str());
    let took = format!("{:.1}s", elapsed.as_secs_f64());
    let line = if stage.counts_chunks() {
        let percent = updraft_core::percent_of(done, total);
        format!(
            "{label} {}/{} chunks ({percent}%) in {took}",
            HumanCount(done),
            HumanCount(total)
        )
    } else {
        format!("{label} {}% in {took}", done.min(100))
    };
    Some(line)
}

fn phase_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightMagenta.into()))
        .effects(Effects::BOLD)
}

fn stage_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::Green.into()))
}

fn paint(style: Style, text: &str) -> String {
    format!("{}{text}{}", style.render(), style.render_reset())
}
