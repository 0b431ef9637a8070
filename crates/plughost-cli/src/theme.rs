//! Terminal styling for command output.

use colored::{ColoredString, Colorize};

/// Width of the rule printed under section headers.
const RULE_WIDTH: usize = 48;

/// Styling helpers shared by every command.
pub(crate) struct Theme;

impl Theme {
    pub(crate) fn header(text: &str) -> String {
        text.bold().cyan().to_string()
    }

    pub(crate) fn separator() -> String {
        "─".repeat(RULE_WIDTH).dimmed().to_string()
    }

    pub(crate) fn success(text: &str) -> String {
        mark("✓".green().bold(), text.normal())
    }

    pub(crate) fn error(text: &str) -> String {
        mark("✗".red().bold(), text.red())
    }

    pub(crate) fn warning(text: &str) -> String {
        mark("!".yellow().bold(), text.yellow())
    }

    pub(crate) fn dimmed(text: &str) -> String {
        text.dimmed().to_string()
    }

    /// `label` padded to a column, then `value`.
    pub(crate) fn field(label: &str, value: &str) -> String {
        format!("  {:<13}{value}", format!("{label}:"))
    }

    /// A lifecycle status word, colored by how healthy it is.
    pub(crate) fn status(status: &str) -> String {
        match status {
            "active" | "loaded" => status.green().to_string(),
            "failed" => status.red().bold().to_string(),
            "unloaded" => status.dimmed().to_string(),
            _ => status.yellow().to_string(),
        }
    }
}

fn mark(glyph: ColoredString, text: ColoredString) -> String {
    format!("{glyph} {text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_pads_labels() {
        colored::control::set_override(false);
        assert_eq!(Theme::field("Signer", "acme"), "  Signer:      acme");
        assert_eq!(Theme::status("active"), "active");
    }
}
