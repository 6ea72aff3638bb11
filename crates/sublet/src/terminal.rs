//! Terminal sinks.
//!
//! The rendering backend is not this crate's business; [`TerminalSink`] is the
//! narrow interface the bridge consumes. Two small implementations ship for
//! convenience: [`ConsoleTerminal`] writes to stdout/stderr and
//! [`BufferedTerminal`] keeps everything in memory.

use std::io::{IsTerminal, Write};
use std::sync::Mutex;

pub use crate::bridge::protocol::Severity;

pub trait TerminalSink: Send + Sync {
    fn write(&self, text: &str, severity: Severity);

    fn supports_color(&self) -> bool {
        false
    }

    fn eol(&self) -> &str {
        "\n"
    }

    fn width(&self) -> Option<usize> {
        None
    }

    fn write_line(&self, text: &str, severity: Severity) {
        let mut line = String::with_capacity(text.len() + 2);
        line.push_str(text);
        line.push_str(self.eol());
        self.write(&line, severity);
    }
}

/// Writes log/verbose/debug to stdout and warnings/errors to stderr.
pub struct ConsoleTerminal {
    verbose: bool,
    debug: bool,
    color: bool,
}

impl ConsoleTerminal {
    pub fn new() -> Self {
        Self {
            verbose: false,
            debug: false,
            color: std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none(),
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn colorize<'a>(&self, text: &'a str, severity: Severity) -> std::borrow::Cow<'a, str> {
        let code = match severity {
            Severity::Warning => "33",
            Severity::Error => "31",
            Severity::Verbose | Severity::Debug => "90",
            Severity::Log => return text.into(),
        };
        if !self.color {
            return text.into();
        }
        format!("\x1b[{code}m{text}\x1b[0m").into()
    }
}

impl Default for ConsoleTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalSink for ConsoleTerminal {
    fn write(&self, text: &str, severity: Severity) {
        let shown = match severity {
            Severity::Verbose => self.verbose,
            Severity::Debug => self.debug,
            _ => true,
        };
        if !shown {
            return;
        }
        let text = self.colorize(text, severity);
        // A closed stdout/stderr is not worth failing the worker over.
        let _ = match severity {
            Severity::Warning | Severity::Error => std::io::stderr().write_all(text.as_bytes()),
            _ => std::io::stdout().write_all(text.as_bytes()),
        };
    }

    fn supports_color(&self) -> bool {
        self.color
    }
}

/// Keeps every write in memory, in order.
#[derive(Default)]
pub struct BufferedTerminal {
    writes: Mutex<Vec<(Severity, String)>>,
    color: bool,
}

impl BufferedTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    pub fn writes(&self) -> Vec<(Severity, String)> {
        self.writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Everything written with the given severity, concatenated.
    pub fn output(&self, severity: Severity) -> String {
        self.writes()
            .into_iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, text)| text)
            .collect()
    }

    /// Everything written, regardless of severity.
    pub fn all_output(&self) -> String {
        self.writes().into_iter().map(|(_, text)| text).collect()
    }
}

impl TerminalSink for BufferedTerminal {
    fn write(&self, text: &str, severity: Severity) {
        self.writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((severity, text.to_string()));
    }

    fn supports_color(&self) -> bool {
        self.color
    }
}

/// Prefixes every line written through it, e.g. `[typescript] `.
pub struct PrefixedTerminal<T> {
    prefix: String,
    inner: T,
}

impl<T: TerminalSink> PrefixedTerminal<T> {
    pub fn new(prefix: impl Into<String>, inner: T) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl<T: TerminalSink> TerminalSink for PrefixedTerminal<T> {
    fn write(&self, text: &str, severity: Severity) {
        let eol = self.inner.eol();
        let mut out = String::with_capacity(text.len() + self.prefix.len());
        for line in text.split_inclusive(eol) {
            out.push_str(&self.prefix);
            out.push_str(line);
        }
        self.inner.write(&out, severity);
    }

    fn supports_color(&self) -> bool {
        self.inner.supports_color()
    }

    fn eol(&self) -> &str {
        self.inner.eol()
    }

    fn width(&self) -> Option<usize> {
        self.inner.width()
    }
}

impl<T: TerminalSink + ?Sized> TerminalSink for std::sync::Arc<T> {
    fn write(&self, text: &str, severity: Severity) {
        (**self).write(text, severity)
    }

    fn supports_color(&self) -> bool {
        (**self).supports_color()
    }

    fn eol(&self) -> &str {
        (**self).eol()
    }

    fn width(&self) -> Option<usize> {
        (**self).width()
    }
}
