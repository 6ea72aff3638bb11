//! sublet: run expensive work in an isolated worker subprocess.
//!
//! The parent builds a [`SubprocessRunner`] for a [`SubprocessWork`] type and
//! awaits [`SubprocessRunner::launch`]. The same binary, started with the
//! worker argv tail, hands control to [`WorkerRegistry::run`]. Terminal
//! output, scoped loggers and consumer-defined messages travel over one framed
//! stdin/stdout channel shared by the registered communication managers.

pub mod argument;
pub mod bridge;
pub mod error;
pub mod inspector;
pub mod logging;
pub mod manager;
pub mod runner;
pub mod scoped_logger;
pub mod terminal;
pub mod terminal_provider;
pub mod worker;
mod worker_tracing_layer;

pub use argument::{Argument, Primitive, SerializedArgument};
pub use bridge::protocol::{DiagnosticKind, InnerConfiguration, Message, Severity};
pub use bridge::transport::{ChannelLink, Side};
pub use error::{ArgumentError, LaunchError, ProtocolError, RemoteError};
pub use inspector::{DEFAULT_INSPECTOR_PORT, InspectorPortAllocator};
pub use manager::{CommunicationManager, Direction, LinkSlot, MessageRouter};
pub use runner::{ExitTracker, LifecycleState, RunnerOptions, SubprocessRunner};
pub use scoped_logger::{
    ScopedLogger, ScopedLoggerManager, ScopedLoggerProvider, TerminalLoggerProvider,
    WorkerScopedLogger,
};
pub use terminal::{BufferedTerminal, ConsoleTerminal, PrefixedTerminal, TerminalSink};
pub use terminal_provider::{SubprocessTerminal, TerminalProviderManager};
pub use worker::{
    SubprocessWork, WORKER_ENTRY, WorkerArgs, WorkerContext, WorkerRegistry, run_worker,
    run_worker_on,
};
pub use worker_tracing_layer::WorkerTracingLayer;
