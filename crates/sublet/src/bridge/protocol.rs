//! Wire protocol types for parent-worker communication.
//!
//! One channel per worker: parent writes to the child's stdin, the worker
//! writes to its stdout. Every frame is a [`Message`] tagged by `type`.
//! `exit` belongs to the lifecycle manager; every other tag is owned by exactly
//! one communication manager.

use serde::{Deserialize, Serialize};

use crate::argument::SerializedArgument;

/// Configuration the worker needs to wire its terminal before any work runs.
///
/// Built by the parent before spawning and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InnerConfiguration {
    pub global_terminal_provider_identifier: u32,
    pub terminal_supports_color: bool,
    pub terminal_end_of_line_character: String,
}

/// Severity of a line written to a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Log,
    Warning,
    Error,
    Verbose,
    Debug,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Verbose => "verbose",
            Self::Debug => "debug",
        }
    }
}

/// Whether a scoped logger diagnostic is an error or a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Last message a worker sends. `error` is `undefined` on success.
    Exit { error: SerializedArgument },

    /// Worker → parent: text for the terminal registered under the given id.
    #[serde(rename_all = "camelCase")]
    TerminalWrite {
        terminal_provider_id: u32,
        data: String,
        severity: Severity,
    },

    /// Worker → parent: ask for a named logger.
    #[serde(rename_all = "camelCase")]
    RequestScopedLogger { logger_name: String },

    /// Parent → worker: the logger exists; its output goes to this terminal id.
    #[serde(rename_all = "camelCase")]
    ScopedLoggerGranted {
        logger_name: String,
        terminal_provider_id: u32,
    },

    /// Worker → parent: report an error or warning through a granted logger.
    #[serde(rename_all = "camelCase")]
    EmitErrorWarning {
        logger_name: String,
        kind: DiagnosticKind,
        error: SerializedArgument,
    },

    /// Owned by consumer-defined managers, each claiming its own `name`s.
    Extension {
        name: String,
        payload: serde_json::Value,
    },

    /// A frame whose `type` no variant above accepts. Never claimed by a
    /// manager, so routing it reports the tag as unroutable.
    #[serde(untagged)]
    Unrecognized {
        #[serde(rename = "type")]
        message_type: String,
    },
}

impl Message {
    pub fn extension(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::Extension {
            name: name.into(),
            payload,
        }
    }

    /// The wire tag.
    pub fn type_tag(&self) -> &str {
        match self {
            Self::Exit { .. } => "exit",
            Self::TerminalWrite { .. } => "terminal-write",
            Self::RequestScopedLogger { .. } => "request-scoped-logger",
            Self::ScopedLoggerGranted { .. } => "scoped-logger-granted",
            Self::EmitErrorWarning { .. } => "emit-error-warning",
            Self::Extension { .. } => "extension",
            Self::Unrecognized { message_type } => message_type,
        }
    }

    /// Type tag plus extension name, used when reporting routing failures.
    pub fn route_key(&self) -> String {
        match self {
            Self::Extension { name, .. } => format!("extension/{name}"),
            other => other.type_tag().to_string(),
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit { .. })
    }
}
