//! Semantic color palette for terminal output.

use linkfail_sim::Outcome;
use owo_colors::{OwoColorize, Style};

fn success_style() -> Style {
    Style::new().green().bold()
}

fn error_style() -> Style {
    Style::new().red().bold()
}

fn warning_style() -> Style {
    Style::new().yellow()
}

fn muted_style() -> Style {
    Style::new().dimmed()
}

fn header_style() -> Style {
    Style::new().bold()
}

fn code_style() -> Style {
    Style::new().blue()
}

/// Applies a semantic style unless colors are off.
pub trait SemanticStyle: Sized {
    fn paint(&self, style: Style) -> String;

    fn success(&self) -> String {
        self.paint(success_style())
    }

    fn error(&self) -> String {
        self.paint(error_style())
    }

    fn warning(&self) -> String {
        self.paint(warning_style())
    }

    fn muted(&self) -> String {
        self.paint(muted_style())
    }

    fn header(&self) -> String {
        self.paint(header_style())
    }

    fn code(&self) -> String {
        self.paint(code_style())
    }
}

impl<T: std::fmt::Display> SemanticStyle for T {
    fn paint(&self, style: Style) -> String {
        if super::no_color() {
            self.to_string()
        } else {
            self.style(style).to_string()
        }
    }
}

/// Outcome label colored by severity.
pub fn outcome(outcome: &Outcome) -> String {
    let label = outcome.label();
    match outcome {
        Outcome::Converged => label.success(),
        Outcome::NonConverged { .. } | Outcome::Cancelled => label.warning(),
        Outcome::SafetyViolation { .. } => label.error(),
    }
}
