//! Error types shared by both sides of the bridge.

use std::fmt;

/// Failures of the argument codec.
///
/// Both variants are programmer errors in whatever produced the value: a
/// communication manager handing over a payload shape the codec does not carry,
/// or a peer speaking a newer dialect of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgumentError {
    #[error("unsupported argument type {kind}: {value}")]
    UnsupportedArgumentType { kind: &'static str, value: String },

    #[error("unknown argument tag \"{tag}\"")]
    UnknownArgumentTag { tag: String },
}

impl ArgumentError {
    pub fn unsupported(kind: &'static str, value: impl fmt::Display) -> Self {
        let mut value = value.to_string();
        if value.len() > 120 {
            let mut cut = 117;
            while !value.is_char_boundary(cut) {
                cut -= 1;
            }
            value.truncate(cut);
            value.push_str("...");
        }
        Self::UnsupportedArgumentType { kind, value }
    }
}

/// Protocol violations and wiring bugs detected on either side of the channel.
///
/// None of these are transient. They are raised on the side that detects them
/// and are never retried.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("received a duplicate \"exit\" message from the worker")]
    DuplicateExitMessage,

    #[error("received a \"{message_type}\" message after the worker signalled exit")]
    MessageAfterExit { message_type: String },

    #[error("no communication manager claimed \"{message_type}\" message")]
    UnroutableMessage { message_type: String },

    #[error("a worker cannot send to a nested subprocess")]
    NoNestedSubprocess,

    #[error("the parent process has no parent channel to send to")]
    NoParentProcess,

    #[error("message channel is closed")]
    ChannelClosed,

    #[error("communication manager {manager} used before being attached to a channel")]
    NotAttached { manager: &'static str },

    #[error("no terminal provider registered with id {0}")]
    UnknownTerminalProvider(u32),

    #[error("no scoped logger named \"{0}\" has been granted")]
    UnknownScopedLogger(String),

    #[error("received a grant for scoped logger \"{0}\" that was never requested")]
    UnexpectedScopedLoggerGrant(String),

    #[error("scoped logger requests can only be served by the parent")]
    NoScopedLoggerProvider,

    #[error(transparent)]
    Argument(#[from] ArgumentError),
}

/// An error reported by the worker, carried across the process boundary.
///
/// Only the message and the rendered stack survive the trip; the original type
/// does not.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    pub stack: Option<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Message is the outermost context; stack is anyhow's debug rendering,
    /// which includes the cause chain and a backtrace when one was captured.
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        Self {
            message: error.to_string(),
            stack: Some(format!("{error:?}")),
        }
    }
}

/// Failures of [`SubprocessRunner::launch`](crate::SubprocessRunner::launch).
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to serialize worker configuration: {0}")]
    Configuration(#[from] serde_json::Error),

    #[error("worker channel error: {0}")]
    Channel(#[source] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// The work function itself failed; this is the normal failure path.
    #[error("worker failed: {0}")]
    Worker(RemoteError),

    /// The process went away (crash, kill, OOM) without sending an exit message.
    #[error("worker exited before sending an \"exit\" message (exit code {})", fmt_code(.code))]
    WorkerExitedWithoutSignal { code: Option<i32> },

    #[error("no inspector ports left to allocate")]
    InspectorPortsExhausted,
}

impl LaunchError {
    /// The worker-reported error, if this failure came from the work itself.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Worker(error) => Some(error),
            _ => None,
        }
    }
}

fn fmt_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none, terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_truncates_long_values() {
        let err = ArgumentError::unsupported("array", "x".repeat(500));
        match err {
            ArgumentError::UnsupportedArgumentType { kind, value } => {
                assert_eq!(kind, "array");
                assert_eq!(value.len(), 120);
                assert!(value.ends_with("..."));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn remote_error_from_anyhow_keeps_cause_chain() {
        let err = anyhow::anyhow!("disk full").context("failed to write cache");
        let remote = RemoteError::from_anyhow(&err);
        assert_eq!(remote.message, "failed to write cache");
        assert!(remote.stack.unwrap().contains("disk full"));
    }

    #[test]
    fn launch_error_display() {
        let err = LaunchError::WorkerExitedWithoutSignal { code: Some(3) };
        assert_eq!(
            err.to_string(),
            "worker exited before sending an \"exit\" message (exit code 3)"
        );

        let err = LaunchError::WorkerExitedWithoutSignal { code: None };
        assert!(err.to_string().contains("terminated by signal"));

        let err = ArgumentError::UnknownArgumentTag {
            tag: "symbol".to_string(),
        };
        assert_eq!(err.to_string(), "unknown argument tag \"symbol\"");

        let err = LaunchError::Worker(RemoteError::new("boom"));
        assert_eq!(err.to_string(), "worker failed: boom");
        assert_eq!(err.remote().map(|e| e.message.as_str()), Some("boom"));
    }
}
