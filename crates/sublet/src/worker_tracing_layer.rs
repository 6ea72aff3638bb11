//! Tracing layer for the worker process.
//!
//! Ships tracing events to the parent's global terminal as `terminal-write`
//! messages. Events from the bridge itself are skipped, since writing them
//! would produce more of them. Set `SUBLET_WORKER_DIRECT_LOG=1` to also mirror
//! events to the worker's stderr.

use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::Mutex;

use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::terminal::{Severity, TerminalSink};
use crate::terminal_provider::SubprocessTerminal;

pub const DIRECT_LOG_ENV: &str = "SUBLET_WORKER_DIRECT_LOG";

const SKIPPED_TARGET: &str = "sublet::bridge";

static TERMINAL: Mutex<Option<SubprocessTerminal>> = Mutex::new(None);

/// Route events to `terminal` until [`detach`] is called.
pub(crate) fn attach(terminal: SubprocessTerminal) {
    if let Ok(mut slot) = TERMINAL.lock() {
        *slot = Some(terminal);
    }
}

/// Stop routing events. Called right before the exit message goes out.
pub(crate) fn detach() {
    if let Ok(mut slot) = TERMINAL.lock() {
        slot.take();
    }
}

fn attached() -> Option<SubprocessTerminal> {
    TERMINAL.lock().ok().and_then(|slot| slot.clone())
}

pub struct WorkerTracingLayer {
    terminal: Option<SubprocessTerminal>,
    direct_log: bool,
}

impl Default for WorkerTracingLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerTracingLayer {
    pub fn new() -> Self {
        Self {
            terminal: None,
            direct_log: std::env::var(DIRECT_LOG_ENV).as_deref() == Ok("1"),
        }
    }

    /// Always write to `terminal` instead of the one the bootstrap attached.
    pub fn with_terminal(mut self, terminal: SubprocessTerminal) -> Self {
        self.terminal = Some(terminal);
        self
    }

    fn severity(level: &Level) -> Severity {
        match *level {
            Level::ERROR => Severity::Error,
            Level::WARN => Severity::Warning,
            Level::INFO => Severity::Verbose,
            Level::DEBUG | Level::TRACE => Severity::Debug,
        }
    }
}

impl<S> Layer<S> for WorkerTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target.starts_with(SKIPPED_TARGET) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let line = format!("{target}: {}{}", visitor.message, visitor.fields);

        if let Some(terminal) = self.terminal.clone().or_else(attached) {
            terminal.write_line(&line, Self::severity(metadata.level()));
        }

        if self.direct_log {
            let _ = writeln!(
                std::io::stderr(),
                "worker_direct_log [{}] {line}",
                metadata.level()
            );
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }
}
