//! Terminal output for claudectx commands
//!
//! Commands write through an [`OutputFormatter`] so the same code path
//! serves both human-readable and `--json` output. In JSON mode only
//! [`OutputFormatter::print_json`] reaches stdout; errors and warnings go to
//! stderr as single-line JSON objects.

use std::io::Write;

/// Output format selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        self == OutputFormat::Json
    }
}

/// Trait for formatting CLI output
pub trait OutputFormatter {
    fn success(&self, message: &str);
    fn error(&self, message: &str);
    fn warn(&self, message: &str);
    fn info(&self, message: &str);
    /// Heading for a block of `field` lines
    fn section(&self, title: &str);
    /// A `label: value` line, aligned under the current section
    fn field(&self, label: &str, value: &str);
    fn print_json(&self, value: &serde_json::Value);
}

/// Human-readable output with status symbols.
///
/// In quiet mode only errors and warnings are printed.
pub struct HumanFormatter {
    quiet: bool,
}

impl HumanFormatter {
    fn out(&self, line: std::fmt::Arguments<'_>) {
        if !self.quiet {
            let _ = writeln!(std::io::stdout().lock(), "{line}");
        }
    }
}

impl OutputFormatter for HumanFormatter {
    fn success(&self, message: &str) {
        self.out(format_args!("\u{2713} {message}"));
    }

    fn error(&self, message: &str) {
        eprintln!("\u{2717} Error: {message}");
    }

    fn warn(&self, message: &str) {
        eprintln!("\u{26a0} Warning: {message}");
    }

    fn info(&self, message: &str) {
        self.out(format_args!("  {message}"));
    }

    fn section(&self, title: &str) {
        self.out(format_args!("\u{25b8} {title}"));
    }

    fn field(&self, label: &str, value: &str) {
        let label = format!("{label}:");
        self.out(format_args!("    {label:<22} {value}"));
    }

    fn print_json(&self, _value: &serde_json::Value) {}
}

/// Machine-readable output for `--json`
pub struct JsonFormatter;

impl JsonFormatter {
    fn diagnostic(level: &str, message: &str) {
        eprintln!("{}", serde_json::json!({ "level": level, "message": message }));
    }
}

impl OutputFormatter for JsonFormatter {
    fn success(&self, _message: &str) {}

    fn error(&self, message: &str) {
        Self::diagnostic("error", message);
    }

    fn warn(&self, message: &str) {
        Self::diagnostic("warning", message);
    }

    fn info(&self, _message: &str) {}

    fn section(&self, _title: &str) {}

    fn field(&self, _label: &str, _value: &str) {}

    fn print_json(&self, value: &serde_json::Value) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{text}"),
            Err(e) => Self::diagnostic("error", &format!("Failed to render JSON: {e}")),
        }
    }
}

pub fn get_formatter(format: OutputFormat, quiet: bool) -> Box<dyn OutputFormatter> {
    match format {
        OutputFormat::Json => Box::new(JsonFormatter),
        OutputFormat::Human => Box::new(HumanFormatter { quiet }),
    }
}
