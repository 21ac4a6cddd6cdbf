//! Command output handle.
//!
//! Results go to stdout, warnings and errors to stderr. `quiet` suppresses
//! everything except warnings and errors.

use std::io::{IsTerminal, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossterm::style::Stylize;
use qupd_core::Reporter;
use qupd_core::update::UpdateState;

use super::theme::{Theme, format_size};

/// A cloneable handle for printing command output.
#[derive(Debug, Clone)]
pub struct Output {
    theme: Theme,
    quiet: bool,
    /// A `\r` progress line is on screen and needs a newline.
    progress_open: Arc<AtomicBool>,
}

impl Default for Output {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Output {
    pub fn new(quiet: bool) -> Self {
        Self {
            theme: Theme::default(),
            quiet,
            progress_open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn theme(&self) -> &Theme {
        &self.theme
    }

    fn close_progress(&self) {
        if self.progress_open.swap(false, Ordering::AcqRel) {
            println!();
        }
    }

    /// Prints a section title.
    pub fn section(&self, title: &str) {
        if self.quiet {
            return;
        }
        self.close_progress();
        println!();
        println!("{}", title.dark_grey());
        println!();
    }

    /// Prints an aligned `label value` line.
    pub fn field(&self, label: &str, value: impl std::fmt::Display) {
        if self.quiet {
            return;
        }
        println!(
            "{:<width$}{value}",
            format!("{label}:"),
            width = self.theme.label_width
        );
    }

    pub fn info(&self, msg: &str) {
        if self.quiet {
            return;
        }
        self.close_progress();
        println!(
            "{} {msg}",
            self.theme.icons.info.with(self.theme.colors.secondary)
        );
    }

    pub fn success(&self, msg: &str) {
        if self.quiet {
            return;
        }
        self.close_progress();
        println!(
            "{} {msg}",
            self.theme.icons.success.with(self.theme.colors.success)
        );
    }

    pub fn warning(&self, msg: &str) {
        self.close_progress();
        eprintln!(
            "{} {}",
            self.theme.icons.warning.with(self.theme.colors.warning),
            msg.with(self.theme.colors.warning)
        );
    }

    pub fn error(&self, msg: &str) {
        self.close_progress();
        eprintln!(
            "{} {}",
            self.theme.icons.error.with(self.theme.colors.error),
            msg.with(self.theme.colors.error)
        );
    }
}

impl Reporter for Output {
    fn state_changed(&self, state: &UpdateState) {
        if self.quiet || matches!(state, UpdateState::Idle | UpdateState::Failed(_)) {
            return;
        }
        self.close_progress();
        println!(
            "  {} {}",
            self.theme.icons.active.with(self.theme.colors.secondary),
            state.name().dark_grey()
        );
    }

    fn downloading(&self, current: u64, total: Option<u64>) {
        if self.quiet || !std::io::stdout().is_terminal() {
            return;
        }
        let progress = match total {
            Some(total) if total > 0 => {
                format!("{} / {}", format_size(current), format_size(total))
            }
            _ => format_size(current),
        };
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "\r    {}", format!("{progress:<30}").dark_grey());
        let _ = stdout.flush();
        self.progress_open.store(true, Ordering::Release);
    }

    fn info(&self, msg: &str) {
        Output::info(self, msg);
    }

    fn warning(&self, msg: &str) {
        Output::warning(self, msg);
    }

    fn error(&self, msg: &str) {
        Output::error(self, msg);
    }
}
