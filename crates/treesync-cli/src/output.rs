//! Command results for the terminal
//!
//! Log lines go through `tracing`. A formatter prints what a command reports
//! back to the user: symbol-prefixed lines for people, one JSON document per
//! line for scripts. Results go to stdout, problems to stderr.

use std::cell::RefCell;
use std::io::{self, Write};

/// Output format selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Human
        }
    }
}

/// What a command can report
pub trait OutputFormatter {
    /// The command finished what it set out to do.
    fn done(&self, message: &str);

    /// Something the user has to fix, such as an invalid config value.
    fn problem(&self, message: &str);

    /// An entry the command could not handle but stepped over.
    fn skipped(&self, message: &str);

    /// One file of a manifest listing. JSON output reports the manifest as a
    /// single document instead.
    fn manifest_entry(&self, path: &str, hash: &str);

    /// The machine-readable result of a command. Human output lists entries
    /// instead.
    fn document(&self, value: &serde_json::Value);
}

type Stream = RefCell<Box<dyn Write>>;

fn stream(writer: impl Write + 'static) -> Stream {
    RefCell::new(Box::new(writer))
}

// A closed stdout is not worth failing a command over
fn emit(stream: &Stream, line: std::fmt::Arguments<'_>) {
    let _ = writeln!(stream.borrow_mut(), "{line}");
}

/// Human-readable output with status symbols
pub struct HumanFormatter {
    out: Stream,
    err: Stream,
}

impl HumanFormatter {
    pub fn stdio() -> Self {
        Self::with_writers(io::stdout(), io::stderr())
    }

    pub fn with_writers(out: impl Write + 'static, err: impl Write + 'static) -> Self {
        Self {
            out: stream(out),
            err: stream(err),
        }
    }
}

impl OutputFormatter for HumanFormatter {
    fn done(&self, message: &str) {
        emit(&self.out, format_args!("\u{2713} {message}"));
    }
    fn problem(&self, message: &str) {
        emit(&self.err, format_args!("\u{2717} {message}"));
    }
    fn skipped(&self, message: &str) {
        emit(&self.err, format_args!("\u{26a0} skipped: {message}"));
    }
    fn manifest_entry(&self, path: &str, hash: &str) {
        emit(&self.out, format_args!("{hash}  {path}"));
    }
    fn document(&self, _value: &serde_json::Value) {}
}

/// One JSON object per line
pub struct JsonFormatter {
    out: Stream,
    err: Stream,
}

impl JsonFormatter {
    pub fn stdio() -> Self {
        Self::with_writers(io::stdout(), io::stderr())
    }

    pub fn with_writers(out: impl Write + 'static, err: impl Write + 'static) -> Self {
        Self {
            out: stream(out),
            err: stream(err),
        }
    }
}

impl OutputFormatter for JsonFormatter {
    fn done(&self, message: &str) {
        let line = serde_json::json!({"status": "done", "message": message});
        emit(&self.out, format_args!("{line}"));
    }
    fn problem(&self, message: &str) {
        let line = serde_json::json!({"status": "problem", "message": message});
        emit(&self.err, format_args!("{line}"));
    }
    fn skipped(&self, message: &str) {
        let line = serde_json::json!({"status": "skipped", "message": message});
        emit(&self.err, format_args!("{line}"));
    }
    fn manifest_entry(&self, _path: &str, _hash: &str) {}
    fn document(&self, value: &serde_json::Value) {
        emit(&self.out, format_args!("{value}"));
    }
}

pub fn get_formatter(format: OutputFormat) -> Box<dyn OutputFormatter> {
    match format {
        OutputFormat::Json => Box::new(JsonFormatter::stdio()),
        OutputFormat::Human => Box::new(HumanFormatter::stdio()),
    }
}
