//! Worker bootstrap.
//!
//! The worker process is started with four trailing arguments: the bootstrap
//! entry marker, the work identity, the inner configuration and the work's own
//! configuration. [`WorkerRegistry`] picks the work type by identity and
//! [`run_worker`] wires the channel, runs the work and sends the one exit
//! message.

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context as _;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::argument::{self, SerializedArgument};
use crate::bridge::protocol::InnerConfiguration;
use crate::bridge::transport::{self, ChannelLink};
use crate::error::ProtocolError;
use crate::manager::{CommunicationManager, Direction, MessageRouter};
use crate::scoped_logger::{ScopedLoggerManager, WorkerScopedLogger};
use crate::terminal_provider::{SubprocessTerminal, TerminalProviderManager};
use crate::worker_tracing_layer;

/// Default first argument of the worker argv tail.
pub const WORKER_ENTRY: &str = "__sublet_worker";

/// A unit of work that runs in a worker process.
///
/// `new` is called on both sides: the parent needs an instance to learn which
/// communication managers to register, so it must stay cheap. Expensive setup
/// belongs in `initialize`, which only runs in the worker.
#[async_trait::async_trait]
pub trait SubprocessWork: Send + Sync + Sized + 'static {
    type Configuration: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Key in the [`WorkerRegistry`]; must be unique within a binary.
    const IDENTITY: &'static str;

    fn new(configuration: Self::Configuration) -> Self;

    /// Managers registered after the standard ones, in this order.
    fn communication_managers(&self) -> Vec<Arc<dyn CommunicationManager>> {
        Vec::new()
    }

    async fn initialize(&mut self, _context: &WorkerContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn invoke(&mut self, context: &WorkerContext) -> anyhow::Result<()>;
}

/// The worker argv tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub bootstrap_entry: String,
    pub work_identity: String,
    pub inner_configuration: String,
    pub user_configuration: String,
}

impl WorkerArgs {
    /// Read the last four arguments, if the first of them is `entry`.
    pub fn from_args<I>(args: I, entry: &str) -> Option<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let args: Vec<String> = args.into_iter().collect();
        let start = args.len().checked_sub(4)?;
        let [bootstrap_entry, work_identity, inner_configuration, user_configuration] =
            &args[start..]
        else {
            return None;
        };
        if bootstrap_entry != entry {
            return None;
        }
        Some(Self {
            bootstrap_entry: bootstrap_entry.clone(),
            work_identity: work_identity.clone(),
            inner_configuration: inner_configuration.clone(),
            user_configuration: user_configuration.clone(),
        })
    }

    /// Worker args of the current process under the default entry marker.
    pub fn from_env() -> Option<Self> {
        Self::from_args(std::env::args().skip(1), WORKER_ENTRY)
    }

    pub fn to_args(&self) -> Vec<String> {
        vec![
            self.bootstrap_entry.clone(),
            self.work_identity.clone(),
            self.inner_configuration.clone(),
            self.user_configuration.clone(),
        ]
    }
}

/// What a running work function gets to talk to the parent.
pub struct WorkerContext {
    inner: InnerConfiguration,
    terminal: SubprocessTerminal,
    loggers: Arc<ScopedLoggerManager>,
    link: ChannelLink,
}

impl WorkerContext {
    pub fn inner_configuration(&self) -> &InnerConfiguration {
        &self.inner
    }

    /// The parent's global terminal.
    pub fn terminal(&self) -> &SubprocessTerminal {
        &self.terminal
    }

    pub async fn request_scoped_logger(
        &self,
        name: &str,
    ) -> Result<WorkerScopedLogger, ProtocolError> {
        self.loggers.request_scoped_logger(name).await
    }

    pub fn link(&self) -> &ChannelLink {
        &self.link
    }
}

/// Reads frames from the parent and routes them while the work runs.
///
/// Aborted on drop; [`remove`](Self::remove) also waits for the task to end.
struct InboundListener {
    task: Option<JoinHandle<()>>,
    fatal: oneshot::Receiver<anyhow::Error>,
}

impl InboundListener {
    fn spawn<R>(input: R, router: MessageRouter) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (fatal_tx, fatal) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut reader = transport::message_reader(input);
            while let Some(frame) = transport::next_message(&mut reader).await {
                let routed = frame
                    .context("failed to read message from parent")
                    .and_then(|message| Ok(router.dispatch(message, Direction::FromParent)?));
                if let Err(e) = routed {
                    let _ = fatal_tx.send(e);
                    return;
                }
            }
            tracing::trace!("Parent closed the inbound channel");
        });
        Self {
            task: Some(task),
            fatal,
        }
    }

    /// Resolves with the first routing failure; pends forever otherwise.
    async fn fatal(&mut self) -> anyhow::Error {
        match (&mut self.fatal).await {
            Ok(error) => error,
            Err(_) => std::future::pending().await,
        }
    }

    async fn remove(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for InboundListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Prepared<W> {
    work: W,
    context: WorkerContext,
    router: MessageRouter,
}

/// Run `W` over the process's stdin and stdout.
///
/// The stdin reader holds a blocking thread until the parent closes the pipe,
/// so shut the runtime down with
/// [`shutdown_background`](tokio::runtime::Runtime::shutdown_background) once
/// this returns.
pub async fn run_worker<W: SubprocessWork>(args: WorkerArgs) -> io::Result<()> {
    run_worker_on::<W, _, _>(args, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Run `W` over arbitrary streams: `input` carries parent frames, `output`
/// carries ours.
///
/// Exactly one exit message is written on every path, and it is the last
/// frame. The returned error only covers failures to write that frame.
pub async fn run_worker_on<W, R, O>(args: WorkerArgs, input: R, output: O) -> io::Result<()>
where
    W: SubprocessWork,
    R: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let link = ChannelLink::worker(tx);
    let pump = tokio::spawn(transport::pump_outbound(output, rx));

    tracing::debug!(work = W::IDENTITY, "Worker starting");
    let outcome = match prepare::<W>(&args, &link) {
        Ok(prepared) => run_work(prepared, input).await,
        Err(e) => Err(e),
    };
    finish(&link, pump, outcome).await
}

fn prepare<W: SubprocessWork>(
    args: &WorkerArgs,
    link: &ChannelLink,
) -> anyhow::Result<Prepared<W>> {
    anyhow::ensure!(
        args.work_identity == W::IDENTITY,
        "worker for {} was started as {}",
        W::IDENTITY,
        args.work_identity
    );
    let inner: InnerConfiguration = serde_json::from_str(&args.inner_configuration)
        .context("invalid inner configuration")?;
    let configuration: W::Configuration = serde_json::from_str(&args.user_configuration)
        .with_context(|| format!("invalid configuration for {}", W::IDENTITY))?;

    let terminals = Arc::new(TerminalProviderManager::new());
    let loggers = Arc::new(ScopedLoggerManager::for_worker(
        terminals.clone(),
        inner.clone(),
    ));
    let work = W::new(configuration);

    let mut router = MessageRouter::new();
    router.register(terminals.clone());
    router.register(loggers.clone());
    for manager in work.communication_managers() {
        router.register(manager);
    }
    router.attach(link);

    let terminal =
        terminals.subprocess_terminal(inner.global_terminal_provider_identifier, &inner)?;
    worker_tracing_layer::attach(terminal.clone());

    Ok(Prepared {
        work,
        context: WorkerContext {
            inner,
            terminal,
            loggers,
            link: link.clone(),
        },
        router,
    })
}

async fn run_work<W, R>(prepared: Prepared<W>, input: R) -> anyhow::Result<()>
where
    W: SubprocessWork,
    R: AsyncRead + Unpin + Send + 'static,
{
    let Prepared {
        mut work,
        context,
        router,
    } = prepared;
    let mut listener = InboundListener::spawn(input, router);

    let body = async {
        work.initialize(&context).await.context("initialization failed")?;
        work.invoke(&context).await
    };
    let outcome = tokio::select! {
        biased;
        error = listener.fatal() => Err(error),
        result = AssertUnwindSafe(body).catch_unwind() => result.unwrap_or_else(|panic| {
            Err(anyhow::anyhow!("work function panicked: {}", panic_message(&*panic)))
        }),
    };

    listener.remove().await;
    outcome
}

async fn finish(
    link: &ChannelLink,
    pump: JoinHandle<io::Result<()>>,
    outcome: anyhow::Result<()>,
) -> io::Result<()> {
    let exit = match &outcome {
        Ok(()) => SerializedArgument::undefined(),
        Err(e) => {
            tracing::debug!(error = %e, "Work failed");
            argument::serialize_error(e)
        }
    };
    worker_tracing_layer::detach();
    if let Err(e) = link.send_exit(exit) {
        tracing::warn!(error = %e, "Failed to queue exit message");
    }
    link.close();

    match pump.await {
        Ok(result) => result,
        Err(e) => Err(io::Error::other(e)),
    }
}

/// Report a failure that happened before any work could be selected.
async fn fail_on<O>(output: O, error: anyhow::Error) -> io::Result<()>
where
    O: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let link = ChannelLink::worker(tx);
    let pump = tokio::spawn(transport::pump_outbound(output, rx));
    finish(&link, pump, Err(error)).await
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

type Bootstrap = fn(WorkerArgs) -> BoxFuture<'static, io::Result<()>>;

fn bootstrap<W: SubprocessWork>(args: WorkerArgs) -> BoxFuture<'static, io::Result<()>> {
    run_worker::<W>(args).boxed()
}

/// Maps work identities to their bootstrap.
#[derive(Default)]
pub struct WorkerRegistry {
    entries: Vec<(&'static str, Bootstrap)>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: SubprocessWork>(mut self) -> Self {
        if self.entries.iter().any(|(id, _)| *id == W::IDENTITY) {
            tracing::warn!(work = W::IDENTITY, "Work registered twice, keeping first");
            return self;
        }
        self.entries.push((W::IDENTITY, bootstrap::<W>));
        self
    }

    pub fn identities(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.iter().any(|(id, _)| *id == identity)
    }

    /// Bootstrap the work named in `args` over stdin and stdout.
    pub async fn run(&self, args: WorkerArgs) -> io::Result<()> {
        match self.entries.iter().find(|(id, _)| *id == args.work_identity) {
            Some((_, bootstrap)) => bootstrap(args).await,
            None => {
                let error = anyhow::anyhow!("no work registered as {}", args.work_identity);
                fail_on(tokio::io::stdout(), error).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::JsonCodec;
    use crate::bridge::protocol::{Message, Severity};
    use crate::terminal::TerminalSink;
    use futures::SinkExt;
    use serde::Deserialize;
    use tokio::io::DuplexStream;
    use tokio_util::codec::FramedWrite;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Script {
        mode: String,
    }

    struct ScriptedWork {
        script: Script,
    }

    #[async_trait::async_trait]
    impl SubprocessWork for ScriptedWork {
        type Configuration = Script;
        const IDENTITY: &'static str = "scripted";

        fn new(script: Script) -> Self {
            Self { script }
        }

        async fn initialize(&mut self, _context: &WorkerContext) -> anyhow::Result<()> {
            if self.script.mode == "init-fail" {
                anyhow::bail!("cache directory missing");
            }
            Ok(())
        }

        async fn invoke(&mut self, context: &WorkerContext) -> anyhow::Result<()> {
            match self.script.mode.as_str() {
                "greet" => {
                    context.terminal().write_line("hello", Severity::Log);
                    Ok(())
                }
                "fail" => anyhow::bail!("boom"),
                "panic" => panic!("exploded"),
                "hang" => std::future::pending().await,
                "logger" => {
                    let logger = context.request_scoped_logger("lint").await?;
                    logger.terminal().write("scoped", Severity::Log);
                    Ok(())
                }
                other => anyhow::bail!("unknown mode {other}"),
            }
        }
    }

    fn args(mode: &str) -> WorkerArgs {
        WorkerArgs {
            bootstrap_entry: WORKER_ENTRY.to_string(),
            work_identity: ScriptedWork::IDENTITY.to_string(),
            inner_configuration: serde_json::to_string(&InnerConfiguration {
                global_terminal_provider_identifier: 1,
                terminal_supports_color: false,
                terminal_end_of_line_character: "\n".to_string(),
            })
            .unwrap(),
            user_configuration: serde_json::to_string(&Script {
                mode: mode.to_string(),
            })
            .unwrap(),
        }
    }

    struct Harness {
        to_worker: FramedWrite<DuplexStream, JsonCodec<Message>>,
        from_worker: transport::MessageReader<DuplexStream>,
        worker: JoinHandle<io::Result<()>>,
    }

    fn start(args: WorkerArgs) -> Harness {
        let (to_worker, worker_input) = tokio::io::duplex(64 * 1024);
        let (worker_output, from_worker) = tokio::io::duplex(64 * 1024);
        let worker = tokio::spawn(run_worker_on::<ScriptedWork, _, _>(
            args,
            worker_input,
            worker_output,
        ));
        Harness {
            to_worker: FramedWrite::new(to_worker, JsonCodec::new()),
            from_worker: transport::message_reader(from_worker),
            worker,
        }
    }

    impl Harness {
        async fn next(&mut self) -> Option<Message> {
            transport::next_message(&mut self.from_worker)
                .await
                .map(|frame| frame.unwrap())
        }

        async fn drain(mut self) -> Vec<Message> {
            let mut messages = Vec::new();
            while let Some(message) = self.next().await {
                messages.push(message);
            }
            self.worker.await.unwrap().unwrap();
            messages
        }
    }

    fn exit_error(messages: &[Message]) -> Option<String> {
        match messages.last() {
            Some(Message::Exit {
                error: SerializedArgument::Error { message, .. },
            }) => Some(message.clone()),
            Some(Message::Exit { .. }) => None,
            other => panic!("last frame is not exit: {other:?}"),
        }
    }

    fn exit_count(messages: &[Message]) -> usize {
        messages.iter().filter(|m| m.is_exit()).count()
    }

    #[tokio::test]
    async fn success_sends_output_then_one_exit() {
        let messages = start(args("greet")).drain().await;
        assert_eq!(
            messages[0],
            Message::TerminalWrite {
                terminal_provider_id: 1,
                data: "hello\n".to_string(),
                severity: Severity::Log,
            }
        );
        assert_eq!(exit_count(&messages), 1);
        assert_eq!(exit_error(&messages), None);
    }

    #[tokio::test]
    async fn failure_is_carried_in_the_exit_message() {
        let messages = start(args("fail")).drain().await;
        assert_eq!(exit_count(&messages), 1);
        assert_eq!(exit_error(&messages).as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn initialize_failure_skips_invoke() {
        let messages = start(args("init-fail")).drain().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(
            exit_error(&messages).as_deref(),
            Some("initialization failed")
        );
    }

    #[tokio::test]
    async fn panic_becomes_an_exit_error() {
        let messages = start(args("panic")).drain().await;
        assert_eq!(exit_count(&messages), 1);
        let error = exit_error(&messages).unwrap();
        assert!(error.contains("panicked"), "{error}");
        assert!(error.contains("exploded"), "{error}");
    }

    #[tokio::test]
    async fn bad_configuration_still_sends_one_exit() {
        let mut bad = args("greet");
        bad.user_configuration = "{not json".to_string();
        let messages = start(bad).drain().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(
            exit_error(&messages).as_deref(),
            Some("invalid configuration for scripted")
        );
    }

    #[tokio::test]
    async fn unroutable_parent_message_aborts_the_work() {
        let mut harness = start(args("hang"));
        harness
            .to_worker
            .send(Message::extension("nobody", serde_json::json!(null)))
            .await
            .unwrap();
        let messages = harness.drain().await;
        assert_eq!(messages.len(), 1);
        let error = exit_error(&messages).unwrap();
        assert!(error.contains("extension/nobody"), "{error}");
    }

    #[tokio::test]
    async fn scoped_logger_round_trip_over_the_channel() {
        let mut harness = start(args("logger"));
        assert_eq!(
            harness.next().await,
            Some(Message::RequestScopedLogger {
                logger_name: "lint".to_string()
            })
        );
        harness
            .to_worker
            .send(Message::ScopedLoggerGranted {
                logger_name: "lint".to_string(),
                terminal_provider_id: 9,
            })
            .await
            .unwrap();

        let messages = harness.drain().await;
        assert_eq!(
            messages[0],
            Message::TerminalWrite {
                terminal_provider_id: 9,
                data: "scoped".to_string(),
                severity: Severity::Log,
            }
        );
        assert_eq!(exit_error(&messages), None);
    }

    async fn read_startup_failure(error: anyhow::Error) -> Vec<Message> {
        let (output, from_worker) = tokio::io::duplex(4096);
        let worker = tokio::spawn(fail_on(output, error));
        let mut reader = transport::message_reader(from_worker);
        let mut messages = Vec::new();
        while let Some(frame) = transport::next_message(&mut reader).await {
            messages.push(frame.unwrap());
        }
        worker.await.unwrap().unwrap();
        messages
    }

    #[tokio::test]
    async fn startup_failure_sends_one_exit() {
        let messages = read_startup_failure(anyhow::anyhow!("no work registered as ghost")).await;
        assert_eq!(
            exit_error(&messages).as_deref(),
            Some("no work registered as ghost")
        );
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn exit_frame_larger_than_the_pipe_buffer_is_delivered() {
        let cause = anyhow::anyhow!("{}", "x".repeat(16 * 1024));
        let messages = read_startup_failure(cause.context("no work registered as ghost")).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(
            exit_error(&messages).as_deref(),
            Some("no work registered as ghost")
        );
    }

    #[test]
    fn worker_args_take_the_last_four() {
        let argv = ["--inspect=9230", WORKER_ENTRY, "scripted", "{}", "{\"mode\":\"greet\"}"]
            .map(String::from);
        let parsed = WorkerArgs::from_args(argv, WORKER_ENTRY).unwrap();
        assert_eq!(parsed.work_identity, "scripted");
        assert_eq!(parsed.user_configuration, "{\"mode\":\"greet\"}");
        assert_eq!(
            parsed.to_args(),
            [WORKER_ENTRY, "scripted", "{}", "{\"mode\":\"greet\"}"].map(String::from)
        );
    }

    #[test]
    fn worker_args_require_the_entry_marker() {
        let argv = ["run", "greet", "--config", "{}"].map(String::from);
        assert!(WorkerArgs::from_args(argv, WORKER_ENTRY).is_none());
        assert!(WorkerArgs::from_args(vec!["a".to_string()], WORKER_ENTRY).is_none());
    }

    #[test]
    fn registry_lists_identities_once() {
        let registry = WorkerRegistry::new()
            .register::<ScriptedWork>()
            .register::<ScriptedWork>();
        assert_eq!(registry.identities().collect::<Vec<_>>(), vec!["scripted"]);
        assert!(registry.contains("scripted"));
        assert!(!registry.contains("ghost"));
    }

    #[test]
    fn panic_message_handles_both_payload_kinds() {
        let s: Box<dyn Any + Send> = Box::new("static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(&*s), "static");
        assert_eq!(panic_message(&*owned), "owned");
        assert_eq!(panic_message(&*other), "non-string panic payload");
    }
}
