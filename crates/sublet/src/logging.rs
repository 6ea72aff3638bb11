//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set. Otherwise `SUBLET_LOG` picks the base level
//! (`debug`, `warn`, `error`, default `info`). `LOG_FORMAT=json` switches the
//! parent's stderr output to JSON lines.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::worker_tracing_layer::WorkerTracingLayer;

pub const LOG_LEVEL_ENV: &str = "SUBLET_LOG";

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = base_level(std::env::var(LOG_LEVEL_ENV).ok().as_deref());
    EnvFilter::new(format!(
        "{level},sublet={level},sublet_cli={level},sublet::bridge=warn"
    ))
}

/// Parent process: human-readable (or JSON) events on stderr.
pub fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Worker process: events go to the parent's terminal.
///
/// Nothing is written to stderr directly (the parent shares it) unless
/// `SUBLET_WORKER_DIRECT_LOG=1`.
pub fn init_worker_tracing() {
    let subscriber = tracing_subscriber::registry()
        .with(filter())
        .with(WorkerTracingLayer::new());
    let _ = subscriber.try_init();
}
