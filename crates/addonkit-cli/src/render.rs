use std::io::IsTerminal;
use std::time::{Duration, Instant};

use addonkit_core::{Addon, AddonLog, AddonVersion, LogStatus, OperationOutcome};
use addonkit_lifecycle::ConsistencyReport;
use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(plain: bool, stdout_is_terminal: bool) -> OutputStyle {
    if plain || !stdout_is_terminal {
        OutputStyle::Plain
    } else {
        OutputStyle::Rich
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

pub(crate) struct TerminalSpinner {
    style: OutputStyle,
    label: String,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn from_flag(plain: bool) -> Self {
        Self {
            style: resolve_output_style(plain, std::io::stdout().is_terminal()),
        }
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_outcome(self, outcome: &OperationOutcome) {
        let line = render_outcome_line(self.style, outcome);
        if outcome.ok {
            println!("{line}");
        } else {
            eprintln!("{line}");
        }
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.style, title) {
            println!();
            println!("{}", colorize(section_style(), &line));
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn start_spinner(self, label: &str) -> TerminalSpinner {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new_spinner();
            let template = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}");
            if let Ok(style) = template {
                progress_bar.set_style(style.tick_chars(spinner_tick_chars(label)));
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        TerminalSpinner {
            style: self.style,
            label: label.to_string(),
            progress_bar,
            started_at: Instant::now(),
        }
    }
}

impl TerminalSpinner {
    pub(crate) fn finish(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };
        progress_bar.finish_and_clear();
        if let Some(line) = render_elapsed_line(self.style, &self.label, self.started_at.elapsed())
        {
            eprintln!("{line}");
        }
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

pub(crate) fn render_outcome_line(style: OutputStyle, outcome: &OperationOutcome) -> String {
    match (outcome.ok, outcome.error_kind) {
        (true, _) => render_status_line(style, "ok", &outcome.message),
        (false, Some(kind)) => render_status_line(
            style,
            "err",
            &format!("{} (error={kind})", outcome.message),
        ),
        (false, None) => render_status_line(style, "err", &outcome.message),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

pub(crate) fn format_addon_lines(entries: &[(Addon, Option<AddonVersion>)]) -> Vec<String> {
    if entries.is_empty() {
        return vec!["no addons installed".to_string()];
    }
    entries
        .iter()
        .map(|(addon, current)| match current {
            Some(version) => format!(
                "{} {} (version_id={}) author={} alias={}",
                addon.name,
                version.version,
                version.id,
                addon.author,
                addon.path.display()
            ),
            None => format!("{} <no active version> alias={}", addon.name, addon.path.display()),
        })
        .collect()
}

/// One line per version, newest first; `*` marks the active version and
/// `-` the previous one.
pub(crate) fn format_version_lines(addon: &Addon, versions: &[AddonVersion]) -> Vec<String> {
    versions
        .iter()
        .map(|version| {
            let marker = if addon.current_version_id == Some(version.id) {
                '*'
            } else if addon.prev_version_id == Some(version.id) {
                '-'
            } else {
                ' '
            };
            format!(
                "{marker} {} {} created_at={} path={}",
                version.id,
                version.version,
                version.created_at_unix,
                version.path.display()
            )
        })
        .collect()
}

pub(crate) fn format_log_lines(style: OutputStyle, logs: &[AddonLog]) -> Vec<String> {
    logs.iter()
        .map(|log| {
            let status = match log.status {
                LogStatus::Success => "ok",
                LogStatus::Failure => "err",
            };
            render_status_line(
                style,
                status,
                &format!(
                    "{} {} {}: {}",
                    log.created_at_unix,
                    log.log_type.as_str(),
                    log.status.as_str(),
                    log.message
                ),
            )
        })
        .collect()
}

pub(crate) fn format_consistency_lines(
    style: OutputStyle,
    report: &ConsistencyReport,
) -> Vec<String> {
    let mut lines = Vec::new();
    for issue in &report.issues {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("{}: {}", issue.addon, issue.problem),
        ));
    }
    for record in &report.unfinished_operations {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "unfinished {} of {} (txid={} state={})",
                record.operation, record.addon, record.txid, record.state
            ),
        ));
    }
    if report.is_clean() {
        lines.push(render_status_line(
            style,
            "ok",
            &format!("{} addon(s) consistent", report.checked_addons),
        ));
    }
    lines
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn spinner_tick_chars(label: &str) -> &'static str {
    match label {
        "install" => ".oO@* ",
        "dependencies" => "-=~* ",
        _ => "|/-\\ ",
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(format!("== {title} ==")),
    }
}

fn render_elapsed_line(style: OutputStyle, label: &str, elapsed: Duration) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }
    Some(format!(
        "{} complete in {}",
        colorize(label_style(), label),
        format_elapsed(elapsed)
    ))
}
