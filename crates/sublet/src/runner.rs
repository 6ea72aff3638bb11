//! Parent side: launch one worker and follow it to completion.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::argument::{self, Argument, SerializedArgument};
use crate::bridge::protocol::{InnerConfiguration, Message};
use crate::bridge::transport::{self, ChannelLink, MessageReader};
use crate::error::{ArgumentError, LaunchError, ProtocolError, RemoteError};
use crate::inspector::{self, InspectorPortAllocator};
use crate::manager::{Direction, MessageRouter};
use crate::scoped_logger::{ScopedLoggerManager, ScopedLoggerProvider, TerminalLoggerProvider};
use crate::terminal::{Severity, TerminalSink};
use crate::terminal_provider::TerminalProviderManager;
use crate::worker::{SubprocessWork, WORKER_ENTRY};

/// Environment variable holding extra runtime arguments, whitespace separated.
pub const RUNTIME_ARGS_ENV: &str = "SUBLET_RUNTIME_ARGS";

/// Where a worker is in its life, as seen from the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Running,
    /// The exit message arrived; `error` is `None` on success.
    Exited { error: Option<RemoteError> },
    Closed,
}

/// Enforces the exit message rules on the frames a worker sends.
#[derive(Debug)]
pub struct ExitTracker {
    state: LifecycleState,
}

impl Default for ExitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitTracker {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::NotStarted,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = LifecycleState::Running;
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    /// Record an exit message or route anything else to its manager.
    pub fn on_message(
        &mut self,
        message: Message,
        router: &MessageRouter,
    ) -> Result<(), ProtocolError> {
        let exited = matches!(
            self.state,
            LifecycleState::Exited { .. } | LifecycleState::Closed
        );
        match message {
            Message::Exit { .. } if exited => Err(ProtocolError::DuplicateExitMessage),
            Message::Exit { error } => {
                let error = exit_error(error)?;
                match &error {
                    Some(error) => tracing::debug!(error = %error, "Worker signalled failure"),
                    None => tracing::debug!("Worker signalled success"),
                }
                self.state = LifecycleState::Exited { error };
                Ok(())
            }
            other if exited => Err(ProtocolError::MessageAfterExit {
                message_type: other.route_key(),
            }),
            other => router.dispatch(other, Direction::FromWorker),
        }
    }

    /// The worker's stdout is gone and the process has exited: settle the outcome.
    pub fn on_close(&mut self, code: Option<i32>) -> Result<(), LaunchError> {
        match std::mem::replace(&mut self.state, LifecycleState::Closed) {
            LifecycleState::Exited { error: Some(error) } => Err(LaunchError::Worker(error)),
            LifecycleState::Exited { error: None } => {
                if code.is_some_and(|code| code != 0) {
                    tracing::warn!(?code, "Worker reported success but exited non-zero");
                }
                Ok(())
            }
            _ => Err(LaunchError::WorkerExitedWithoutSignal { code }),
        }
    }
}

fn exit_error(error: SerializedArgument) -> Result<Option<RemoteError>, ArgumentError> {
    Ok(match argument::deserialize(error)? {
        Argument::Undefined | Argument::Null => None,
        Argument::Error(error) => Some(error),
        Argument::Primitive(value) => Some(RemoteError::new(value.to_string())),
    })
}

/// How to start a worker process.
pub struct RunnerOptions {
    pub program: PathBuf,
    pub runtime_args: Vec<String>,
    pub bootstrap_entry: String,
    pub inspector_ports: Arc<InspectorPortAllocator>,
    pub scoped_logger_provider: Option<Arc<dyn ScopedLoggerProvider>>,
}

impl RunnerOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            runtime_args: Vec::new(),
            bootstrap_entry: WORKER_ENTRY.to_string(),
            inspector_ports: Arc::new(InspectorPortAllocator::new()),
            scoped_logger_provider: None,
        }
    }

    /// Re-launch the current executable, with runtime args from
    /// `SUBLET_RUNTIME_ARGS`.
    pub fn from_env() -> std::io::Result<Self> {
        let runtime_args = std::env::var(RUNTIME_ARGS_ENV)
            .map(|args| args.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        Ok(Self::new(std::env::current_exe()?).with_runtime_args(runtime_args))
    }

    pub fn with_runtime_args(mut self, args: Vec<String>) -> Self {
        self.runtime_args = args;
        self
    }

    pub fn with_bootstrap_entry(mut self, entry: impl Into<String>) -> Self {
        self.bootstrap_entry = entry.into();
        self
    }

    pub fn with_inspector_ports(mut self, ports: Arc<InspectorPortAllocator>) -> Self {
        self.inspector_ports = ports;
        self
    }

    pub fn with_scoped_logger_provider(mut self, provider: Arc<dyn ScopedLoggerProvider>) -> Self {
        self.scoped_logger_provider = Some(provider);
        self
    }
}

/// Runs one unit of work `W` in a worker process.
///
/// The runner registers the terminal relay and scoped logger managers followed
/// by the work's own managers; the worker bootstrap registers the same kinds in
/// the same order. [`launch`](Self::launch) consumes the runner, so each
/// instance drives exactly one worker. Take handles to parent-side managers
/// through [`work`](Self::work) before launching.
pub struct SubprocessRunner<W: SubprocessWork> {
    configuration: W::Configuration,
    inner: InnerConfiguration,
    terminal: Arc<dyn TerminalSink>,
    options: RunnerOptions,
    router: MessageRouter,
    work: W,
}

impl<W: SubprocessWork> SubprocessRunner<W> {
    pub fn new(
        configuration: W::Configuration,
        terminal: Arc<dyn TerminalSink>,
        options: RunnerOptions,
    ) -> Self {
        let terminals = Arc::new(TerminalProviderManager::new());
        let global = terminals.register_terminal_provider(Arc::clone(&terminal));
        let inner = InnerConfiguration {
            global_terminal_provider_identifier: global,
            terminal_supports_color: terminal.supports_color(),
            terminal_end_of_line_character: terminal.eol().to_string(),
        };

        let provider = options
            .scoped_logger_provider
            .clone()
            .unwrap_or_else(|| Arc::new(TerminalLoggerProvider::new(Arc::clone(&terminal))));
        let loggers = Arc::new(ScopedLoggerManager::for_parent(provider, terminals.clone()));

        let mut router = MessageRouter::new();
        router.register(terminals);
        router.register(loggers);
        let work = W::new(configuration.clone());
        for manager in work.communication_managers() {
            router.register(manager);
        }

        Self {
            configuration,
            inner,
            terminal,
            options,
            router,
            work,
        }
    }

    pub fn configuration(&self) -> &W::Configuration {
        &self.configuration
    }

    pub fn inner_configuration(&self) -> &InnerConfiguration {
        &self.inner
    }

    /// The parent-side instance whose managers receive the worker's messages.
    pub fn work(&self) -> &W {
        &self.work
    }

    /// Spawn the worker and resolve once it has exited and its output is drained.
    ///
    /// Inspector ports are taken from the shared allocator before the first
    /// await, so runners launched together get ports in launch order.
    pub async fn launch(self) -> Result<(), LaunchError> {
        let (runtime_args, ports) = inspector::rewrite_inspector_args(
            &self.options.runtime_args,
            &self.options.inspector_ports,
        )?;
        for port in &ports {
            self.terminal.write_line(
                &format!("Subprocess with inspector bound to port {port}"),
                Severity::Log,
            );
        }

        let inner_json = serde_json::to_string(&self.inner)?;
        let user_json = serde_json::to_string(&self.configuration)?;

        let mut child = Command::new(&self.options.program)
            .args(&runtime_args)
            .arg(&self.options.bootstrap_entry)
            .arg(W::IDENTITY)
            .arg(inner_json)
            .arg(user_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(LaunchError::Spawn)?;

        tracing::info!(
            pid = child.id(),
            work = W::IDENTITY,
            program = %self.options.program.display(),
            "Spawned worker subprocess"
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LaunchError::Spawn(std::io::Error::other("stdin not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::Spawn(std::io::Error::other("stdout not captured")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let link = ChannelLink::parent(tx);
        self.router.attach(&link);
        let pump = tokio::spawn(transport::pump_outbound(stdin, rx));

        let mut tracker = ExitTracker::new();
        tracker.mark_running();
        let mut reader = transport::message_reader(stdout);

        if let Err(e) = read_frames(&mut reader, &mut tracker, &self.router, &link).await {
            tracing::error!(
                error = %e,
                work = W::IDENTITY,
                "Worker channel failed, killing worker"
            );
            if let Err(kill_err) = child.kill().await {
                tracing::warn!(error = %kill_err, "Failed to kill worker");
            }
            link.close();
            pump.abort();
            return Err(e);
        }

        let status = child.wait().await.map_err(LaunchError::Channel)?;
        tracing::debug!(?status, work = W::IDENTITY, "Worker process exited");

        link.close();
        match pump.await {
            Ok(Ok(())) => {}
            // The worker may have stopped reading before the parent stopped writing.
            Ok(Err(e)) => tracing::debug!(error = %e, "Outbound channel closed early"),
            Err(e) => tracing::warn!(error = %e, "Outbound writer task failed"),
        }

        tracker.on_close(status.code())
    }
}

/// Read worker frames until its stdout closes.
///
/// The worker's stdin is closed as soon as its exit message is recorded; a
/// worker still waiting on parent input only sees end-of-stream after that.
async fn read_frames<R>(
    reader: &mut MessageReader<R>,
    tracker: &mut ExitTracker,
    router: &MessageRouter,
    link: &ChannelLink,
) -> Result<(), LaunchError>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = transport::next_message(reader).await {
        let message = frame.map_err(LaunchError::Channel)?;
        tracker.on_message(message, router)?;
        if matches!(tracker.state(), LifecycleState::Exited { .. }) && !link.is_closed() {
            tracing::trace!("Exit recorded, closing worker stdin");
            link.close();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::JsonCodec;
    use crate::manager::tests::RecordingManager;
    use futures::SinkExt;
    use serde_json::json;
    use tokio_util::codec::FramedWrite;

    /// Feed `frames` to `read_frames` as a worker's stdout would.
    async fn read_from_worker(
        frames: Vec<serde_json::Value>,
        router: &MessageRouter,
    ) -> (Result<(), LaunchError>, ChannelLink, mpsc::UnboundedReceiver<Message>) {
        let (worker_stdout, parent_end) = tokio::io::duplex(64 * 1024);
        let mut writer = FramedWrite::new(worker_stdout, JsonCodec::<serde_json::Value>::new());
        for frame in frames {
            writer.send(frame).await.unwrap();
        }
        drop(writer);

        let (tx, rx) = mpsc::unbounded_channel();
        let link = ChannelLink::parent(tx);
        let mut tracker = running();
        let mut reader = transport::message_reader(parent_end);
        let result = read_frames(&mut reader, &mut tracker, router, &link).await;
        (result, link, rx)
    }

    fn exit(error: SerializedArgument) -> Message {
        Message::Exit { error }
    }

    fn running() -> ExitTracker {
        let mut tracker = ExitTracker::new();
        tracker.mark_running();
        tracker
    }

    #[test]
    fn starts_not_started() {
        assert_eq!(ExitTracker::new().state(), &LifecycleState::NotStarted);
        assert_eq!(running().state(), &LifecycleState::Running);
    }

    #[test]
    fn success_resolves_on_close() {
        let router = MessageRouter::new();
        let mut tracker = running();
        tracker
            .on_message(exit(SerializedArgument::Undefined), &router)
            .unwrap();
        assert_eq!(tracker.state(), &LifecycleState::Exited { error: None });
        tracker.on_close(Some(0)).unwrap();
        assert_eq!(tracker.state(), &LifecycleState::Closed);
    }

    #[test]
    fn null_exit_counts_as_success() {
        let router = MessageRouter::new();
        let mut tracker = running();
        tracker
            .on_message(exit(SerializedArgument::Null), &router)
            .unwrap();
        assert!(tracker.on_close(Some(0)).is_ok());
    }

    #[test]
    fn error_exit_rejects_with_remote_error() {
        let router = MessageRouter::new();
        let mut tracker = running();
        tracker
            .on_message(
                exit(SerializedArgument::Error {
                    message: "compile failed".to_string(),
                    stack: Some("at build".to_string()),
                }),
                &router,
            )
            .unwrap();
        let err = tracker.on_close(Some(0)).unwrap_err();
        let remote = err.remote().unwrap();
        assert_eq!(remote.message, "compile failed");
        assert_eq!(remote.stack.as_deref(), Some("at build"));
    }

    #[test]
    fn primitive_exit_is_a_failure_with_its_text() {
        let router = MessageRouter::new();
        let mut tracker = running();
        let value = serde_json::from_value(json!({"type": "primitive", "value": "oops"})).unwrap();
        tracker.on_message(exit(value), &router).unwrap();
        let err = tracker.on_close(Some(1)).unwrap_err();
        assert_eq!(err.remote().unwrap().message, "oops");
    }

    #[test]
    fn duplicate_exit_is_a_protocol_error() {
        let router = MessageRouter::new();
        let mut tracker = running();
        tracker
            .on_message(exit(SerializedArgument::Undefined), &router)
            .unwrap();
        let err = tracker
            .on_message(exit(SerializedArgument::Undefined), &router)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateExitMessage));
    }

    #[test]
    fn message_after_exit_is_a_protocol_error() {
        let progress = RecordingManager::new("progress", Direction::FromWorker);
        let mut router = MessageRouter::new();
        router.register(progress.clone());
        let mut tracker = running();
        tracker
            .on_message(exit(SerializedArgument::Undefined), &router)
            .unwrap();

        let err = tracker
            .on_message(Message::extension("progress", json!(1)), &router)
            .unwrap_err();
        match err {
            ProtocolError::MessageAfterExit { message_type } => {
                assert_eq!(message_type, "extension/progress");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(progress.received().is_empty());
    }

    #[test]
    fn messages_before_exit_are_routed() {
        let progress = RecordingManager::new("progress", Direction::FromWorker);
        let mut router = MessageRouter::new();
        router.register(progress.clone());
        let mut tracker = running();

        tracker
            .on_message(Message::extension("progress", json!({"done": 1})), &router)
            .unwrap();
        assert_eq!(progress.received().len(), 1);
    }

    #[test]
    fn close_without_exit_reports_code() {
        let mut tracker = running();
        let err = tracker.on_close(Some(137)).unwrap_err();
        assert!(matches!(
            err,
            LaunchError::WorkerExitedWithoutSignal { code: Some(137) }
        ));

        let mut tracker = running();
        assert!(matches!(
            tracker.on_close(None).unwrap_err(),
            LaunchError::WorkerExitedWithoutSignal { code: None }
        ));
    }

    #[test]
    fn unknown_exit_tag_is_a_protocol_error() {
        let router = MessageRouter::new();
        let mut tracker = running();
        let err = tracker
            .on_message(
                exit(SerializedArgument::Unrecognized {
                    tag: "bigint".to_string(),
                }),
                &router,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Argument(ArgumentError::UnknownArgumentTag { tag }) if tag == "bigint"
        ));
    }

    #[tokio::test]
    async fn worker_stdin_closes_once_exit_is_recorded() {
        let router = MessageRouter::new();
        let (result, link, mut rx) =
            read_from_worker(vec![json!({"type": "exit", "error": {"type": "undefined"}})], &router)
                .await;
        result.unwrap();
        assert!(link.is_closed());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stdin_stays_open_until_exit() {
        let progress = RecordingManager::new("progress", Direction::FromWorker);
        let mut router = MessageRouter::new();
        router.register(progress.clone());
        let (result, link, _rx) = read_from_worker(
            vec![json!({"type": "extension", "name": "progress", "payload": 1})],
            &router,
        )
        .await;
        result.unwrap();
        assert!(!link.is_closed());
        assert_eq!(progress.received().len(), 1);
    }

    #[tokio::test]
    async fn unknown_frame_type_is_unroutable() {
        let router = MessageRouter::new();
        let (result, _link, _rx) =
            read_from_worker(vec![json!({"type": "telemetry", "cpu": 0.5})], &router).await;
        match result.unwrap_err() {
            LaunchError::Protocol(ProtocolError::UnroutableMessage { message_type }) => {
                assert_eq!(message_type, "telemetry");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn options_builder() {
        let ports = Arc::new(InspectorPortAllocator::starting_at(41000));
        let options = RunnerOptions::new("/usr/bin/worker")
            .with_runtime_args(vec!["--inspect".to_string()])
            .with_bootstrap_entry("__custom")
            .with_inspector_ports(ports.clone());
        assert_eq!(options.program, PathBuf::from("/usr/bin/worker"));
        assert_eq!(options.runtime_args, vec!["--inspect".to_string()]);
        assert_eq!(options.bootstrap_entry, "__custom");
        assert!(Arc::ptr_eq(&options.inspector_ports, &ports));
        assert!(options.scoped_logger_provider.is_none());
    }
}
