//! Scoped loggers: named loggers the worker borrows from the parent.
//!
//! The worker asks for a logger by name, the parent's [`ScopedLoggerProvider`]
//! creates (or reuses) it and registers its terminal with the terminal relay,
//! and the grant tells the worker which terminal id to write to. Errors and
//! warnings are shipped separately so the provider can count them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::argument::{self, Argument};
use crate::bridge::protocol::{DiagnosticKind, InnerConfiguration, Message};
use crate::bridge::transport::ChannelLink;
use crate::error::{ProtocolError, RemoteError};
use crate::manager::{CommunicationManager, LinkSlot};
use crate::terminal::{PrefixedTerminal, Severity, TerminalSink};
use crate::terminal_provider::{SubprocessTerminal, TerminalProviderManager};

const NAME: &str = "scoped-logger";

/// A named logger living in the parent.
pub trait ScopedLogger: Send + Sync {
    fn name(&self) -> &str;
    fn terminal(&self) -> Arc<dyn TerminalSink>;
    fn emit_error(&self, error: RemoteError);
    fn emit_warning(&self, warning: RemoteError);
}

/// Creates scoped loggers on request. Called on the parent only.
pub trait ScopedLoggerProvider: Send + Sync {
    fn request_scoped_logger(&self, name: &str) -> Arc<dyn ScopedLogger>;
}

/// Default provider: each logger writes to a shared terminal with a
/// `[name] ` prefix and remembers what it was asked to report.
pub struct TerminalLoggerProvider {
    terminal: Arc<dyn TerminalSink>,
    loggers: Mutex<HashMap<String, Arc<TerminalScopedLogger>>>,
}

impl TerminalLoggerProvider {
    pub fn new(terminal: Arc<dyn TerminalSink>) -> Self {
        Self {
            terminal,
            loggers: Mutex::new(HashMap::new()),
        }
    }

    pub fn logger(&self, name: &str) -> Option<Arc<TerminalScopedLogger>> {
        lock(&self.loggers).get(name).cloned()
    }
}

impl ScopedLoggerProvider for TerminalLoggerProvider {
    fn request_scoped_logger(&self, name: &str) -> Arc<dyn ScopedLogger> {
        lock(&self.loggers)
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(TerminalScopedLogger {
                    name: name.to_string(),
                    terminal: Arc::new(PrefixedTerminal::new(
                        format!("[{name}] "),
                        Arc::clone(&self.terminal),
                    )),
                    errors: Mutex::new(Vec::new()),
                    warnings: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }
}

pub struct TerminalScopedLogger {
    name: String,
    terminal: Arc<dyn TerminalSink>,
    errors: Mutex<Vec<RemoteError>>,
    warnings: Mutex<Vec<RemoteError>>,
}

impl TerminalScopedLogger {
    pub fn errors(&self) -> Vec<RemoteError> {
        lock(&self.errors).clone()
    }

    pub fn warnings(&self) -> Vec<RemoteError> {
        lock(&self.warnings).clone()
    }
}

impl ScopedLogger for TerminalScopedLogger {
    fn name(&self) -> &str {
        &self.name
    }

    fn terminal(&self) -> Arc<dyn TerminalSink> {
        Arc::clone(&self.terminal)
    }

    fn emit_error(&self, error: RemoteError) {
        self.terminal
            .write_line(&format!("Error: {}", error.message), Severity::Error);
        lock(&self.errors).push(error);
    }

    fn emit_warning(&self, warning: RemoteError) {
        self.terminal
            .write_line(&format!("Warning: {}", warning.message), Severity::Warning);
        lock(&self.warnings).push(warning);
    }
}

struct Granted {
    logger: Arc<dyn ScopedLogger>,
    terminal_provider_id: u32,
}

#[derive(Default)]
struct WorkerState {
    granted: HashMap<String, u32>,
    pending: HashMap<String, Vec<oneshot::Sender<u32>>>,
}

enum Role {
    Parent {
        provider: Arc<dyn ScopedLoggerProvider>,
        granted: Mutex<HashMap<String, Granted>>,
    },
    Worker {
        inner: InnerConfiguration,
        state: Mutex<WorkerState>,
    },
}

/// Relays scoped logger requests, grants and diagnostics.
pub struct ScopedLoggerManager {
    terminals: Arc<TerminalProviderManager>,
    role: Role,
    link: LinkSlot,
}

impl ScopedLoggerManager {
    pub fn for_parent(
        provider: Arc<dyn ScopedLoggerProvider>,
        terminals: Arc<TerminalProviderManager>,
    ) -> Self {
        Self {
            terminals,
            role: Role::Parent {
                provider,
                granted: Mutex::new(HashMap::new()),
            },
            link: LinkSlot::new(),
        }
    }

    pub fn for_worker(terminals: Arc<TerminalProviderManager>, inner: InnerConfiguration) -> Self {
        Self {
            terminals,
            role: Role::Worker {
                inner,
                state: Mutex::new(WorkerState::default()),
            },
            link: LinkSlot::new(),
        }
    }

    /// Worker side: ask the parent for a logger and wait for the grant.
    ///
    /// Concurrent requests for the same name share one round trip; later
    /// requests reuse the grant.
    pub async fn request_scoped_logger(
        &self,
        name: &str,
    ) -> Result<WorkerScopedLogger, ProtocolError> {
        let Role::Worker { inner, state } = &self.role else {
            return Err(ProtocolError::NoParentProcess);
        };
        let link = self.link.get(NAME)?;

        let rx = {
            let mut state = lock(state);
            if let Some(&id) = state.granted.get(name) {
                return self.worker_logger(name, id, link, inner);
            }
            let (tx, rx) = oneshot::channel();
            let waiters = state.pending.entry(name.to_string()).or_default();
            waiters.push(tx);
            if waiters.len() == 1 {
                tracing::debug!(logger_name = name, "Requesting scoped logger");
                let sent = link.send_to_parent(Message::RequestScopedLogger {
                    logger_name: name.to_string(),
                });
                if let Err(e) = sent {
                    state.pending.remove(name);
                    return Err(e);
                }
            }
            rx
        };

        let id = rx.await.map_err(|_| ProtocolError::ChannelClosed)?;
        self.worker_logger(name, id, link, inner)
    }

    fn worker_logger(
        &self,
        name: &str,
        id: u32,
        link: &ChannelLink,
        inner: &InnerConfiguration,
    ) -> Result<WorkerScopedLogger, ProtocolError> {
        Ok(WorkerScopedLogger {
            name: name.to_string(),
            terminal: self.terminals.subprocess_terminal(id, inner)?,
            link: link.clone(),
        })
    }

    fn grant(&self, logger_name: String) -> Result<(), ProtocolError> {
        let Role::Parent { provider, granted } = &self.role else {
            return Err(ProtocolError::NoScopedLoggerProvider);
        };
        let link = self.link.get(NAME)?;
        let terminal_provider_id = {
            let mut granted = lock(granted);
            match granted.get(&logger_name) {
                Some(existing) => existing.terminal_provider_id,
                None => {
                    let logger = provider.request_scoped_logger(&logger_name);
                    let terminal_provider_id =
                        self.terminals.register_terminal_provider(logger.terminal());
                    granted.insert(
                        logger_name.clone(),
                        Granted {
                            logger,
                            terminal_provider_id,
                        },
                    );
                    terminal_provider_id
                }
            }
        };
        tracing::debug!(
            logger_name = %logger_name,
            terminal_provider_id,
            "Granted scoped logger"
        );
        link.send_to_worker(Message::ScopedLoggerGranted {
            logger_name,
            terminal_provider_id,
        })
    }

    fn emit(
        &self,
        logger_name: String,
        kind: DiagnosticKind,
        error: argument::SerializedArgument,
    ) -> Result<(), ProtocolError> {
        let Role::Parent { granted, .. } = &self.role else {
            return Err(ProtocolError::NoScopedLoggerProvider);
        };
        let logger = lock(granted)
            .get(&logger_name)
            .map(|g| Arc::clone(&g.logger))
            .ok_or(ProtocolError::UnknownScopedLogger(logger_name))?;
        let error = match argument::deserialize(error)? {
            Argument::Error(error) => error,
            other => RemoteError::new(other.to_string()),
        };
        match kind {
            DiagnosticKind::Error => logger.emit_error(error),
            DiagnosticKind::Warning => logger.emit_warning(error),
        }
        Ok(())
    }

    fn resolve(&self, logger_name: String, id: u32) -> Result<(), ProtocolError> {
        let Role::Worker { state, .. } = &self.role else {
            return Err(ProtocolError::NoNestedSubprocess);
        };
        let mut state = lock(state);
        let waiters = state
            .pending
            .remove(&logger_name)
            .ok_or_else(|| ProtocolError::UnexpectedScopedLoggerGrant(logger_name.clone()))?;
        state.granted.insert(logger_name, id);
        for waiter in waiters {
            // The requesting task may have been cancelled.
            let _ = waiter.send(id);
        }
        Ok(())
    }
}

impl CommunicationManager for ScopedLoggerManager {
    fn name(&self) -> &'static str {
        NAME
    }

    fn attach(&self, link: ChannelLink) {
        self.link.set(NAME, link);
    }

    fn can_handle_from_parent(&self, message: &Message) -> bool {
        matches!(message, Message::ScopedLoggerGranted { .. })
    }

    fn can_handle_from_worker(&self, message: &Message) -> bool {
        matches!(
            message,
            Message::RequestScopedLogger { .. } | Message::EmitErrorWarning { .. }
        )
    }

    fn handle_from_parent(&self, message: Message) -> Result<(), ProtocolError> {
        match message {
            Message::ScopedLoggerGranted {
                logger_name,
                terminal_provider_id,
            } => self.resolve(logger_name, terminal_provider_id),
            other => Err(ProtocolError::UnroutableMessage {
                message_type: other.route_key(),
            }),
        }
    }

    fn handle_from_worker(&self, message: Message) -> Result<(), ProtocolError> {
        match message {
            Message::RequestScopedLogger { logger_name } => self.grant(logger_name),
            Message::EmitErrorWarning {
                logger_name,
                kind,
                error,
            } => self.emit(logger_name, kind, error),
            other => Err(ProtocolError::UnroutableMessage {
                message_type: other.route_key(),
            }),
        }
    }
}

/// Worker-side handle to a granted logger.
#[derive(Debug, Clone)]
pub struct WorkerScopedLogger {
    name: String,
    terminal: SubprocessTerminal,
    link: ChannelLink,
}

impl WorkerScopedLogger {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn terminal(&self) -> &SubprocessTerminal {
        &self.terminal
    }

    pub fn emit_error(&self, error: &anyhow::Error) -> Result<(), ProtocolError> {
        self.emit(DiagnosticKind::Error, error)
    }

    pub fn emit_warning(&self, warning: &anyhow::Error) -> Result<(), ProtocolError> {
        self.emit(DiagnosticKind::Warning, warning)
    }

    fn emit(&self, kind: DiagnosticKind, error: &anyhow::Error) -> Result<(), ProtocolError> {
        self.link.send_to_parent(Message::EmitErrorWarning {
            logger_name: self.name.clone(),
            kind,
            error: argument::serialize_error(error),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
