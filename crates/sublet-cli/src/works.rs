//! Demo units of work.

use std::sync::Arc;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sublet::{
    CommunicationManager, RunnerOptions, Severity, SubprocessRunner, SubprocessWork,
    TerminalSink, WorkerContext, WorkerRegistry,
};

use crate::progress::ProgressManager;

/// Every work this binary can bootstrap.
pub fn registry() -> WorkerRegistry {
    WorkerRegistry::new()
        .register::<Greet>()
        .register::<Fail>()
        .register::<Panic>()
        .register::<Vanish>()
}

/// Launch the work registered as `identity` with a JSON configuration.
pub async fn launch(
    identity: &str,
    configuration: &str,
    terminal: Arc<dyn TerminalSink>,
    options: RunnerOptions,
) -> anyhow::Result<()> {
    match identity {
        Greet::IDENTITY => launch_as::<Greet>(configuration, terminal, options).await,
        Fail::IDENTITY => launch_as::<Fail>(configuration, terminal, options).await,
        Panic::IDENTITY => launch_as::<Panic>(configuration, terminal, options).await,
        Vanish::IDENTITY => launch_as::<Vanish>(configuration, terminal, options).await,
        other => anyhow::bail!("unknown work {other:?}, see `sublet list`"),
    }
}

async fn launch_as<W: SubprocessWork>(
    configuration: &str,
    terminal: Arc<dyn TerminalSink>,
    options: RunnerOptions,
) -> anyhow::Result<()> {
    let configuration: W::Configuration = serde_json::from_str(configuration)
        .with_context(|| format!("invalid configuration for {}", W::IDENTITY))?;
    SubprocessRunner::<W>::new(configuration, terminal, options)
        .launch()
        .await
        .with_context(|| format!("{} failed", W::IDENTITY))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GreetConfig {
    pub name: String,
    pub steps: u32,
}

impl Default for GreetConfig {
    fn default() -> Self {
        Self {
            name: "world".to_string(),
            steps: 3,
        }
    }
}

/// Writes a greeting, borrows a scoped logger and reports progress.
pub struct Greet {
    config: GreetConfig,
    progress: Arc<ProgressManager>,
}

impl Greet {
    pub fn progress(&self) -> Arc<ProgressManager> {
        self.progress.clone()
    }
}

#[async_trait::async_trait]
impl SubprocessWork for Greet {
    type Configuration = GreetConfig;
    const IDENTITY: &'static str = "greet";

    fn new(config: GreetConfig) -> Self {
        Self {
            config,
            progress: Arc::new(ProgressManager::new()),
        }
    }

    fn communication_managers(&self) -> Vec<Arc<dyn CommunicationManager>> {
        vec![self.progress.clone()]
    }

    async fn invoke(&mut self, context: &WorkerContext) -> anyhow::Result<()> {
        context
            .terminal()
            .write_line(&format!("Hello, {}!", self.config.name), Severity::Log);

        let logger = context.request_scoped_logger(Self::IDENTITY).await?;
        logger
            .terminal()
            .write_line("preparing greeting", Severity::Log);

        for step in 1..=self.config.steps {
            self.progress.report(step, self.config.steps)?;
        }
        tracing::info!(steps = self.config.steps, "Greeting done");

        if self.config.name.chars().next().is_some_and(char::is_lowercase) {
            let warning = anyhow::anyhow!("name {:?} is not capitalized", self.config.name);
            logger.emit_warning(&warning)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailConfig {
    pub message: String,
}

impl Default for FailConfig {
    fn default() -> Self {
        Self {
            message: "work failed on purpose".to_string(),
        }
    }
}

/// Returns an error.
pub struct Fail {
    config: FailConfig,
}

#[async_trait::async_trait]
impl SubprocessWork for Fail {
    type Configuration = FailConfig;
    const IDENTITY: &'static str = "fail";

    fn new(config: FailConfig) -> Self {
        Self { config }
    }

    async fn invoke(&mut self, _context: &WorkerContext) -> anyhow::Result<()> {
        anyhow::bail!("{}", self.config.message)
    }
}

/// Panics inside the work function.
pub struct Panic;

#[async_trait::async_trait]
impl SubprocessWork for Panic {
    type Configuration = serde_json::Value;
    const IDENTITY: &'static str = "panic";

    fn new(_config: serde_json::Value) -> Self {
        Self
    }

    async fn invoke(&mut self, _context: &WorkerContext) -> anyhow::Result<()> {
        panic!("deliberate panic in worker");
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VanishConfig {
    pub code: i32,
}

impl Default for VanishConfig {
    fn default() -> Self {
        Self { code: 3 }
    }
}

/// Exits the process without sending an exit message.
pub struct Vanish {
    config: VanishConfig,
}

#[async_trait::async_trait]
impl SubprocessWork for Vanish {
    type Configuration = VanishConfig;
    const IDENTITY: &'static str = "vanish";

    fn new(config: VanishConfig) -> Self {
        Self { config }
    }

    async fn invoke(&mut self, context: &WorkerContext) -> anyhow::Result<()> {
        context
            .terminal()
            .write_line("leaving without a word", Severity::Log);
        std::process::exit(self.config.code);
    }
}
