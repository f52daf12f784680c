use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::parse_bool;

static INIT: OnceCell<()> = OnceCell::new();

#[derive(Debug, PartialEq, Eq)]
enum LogSink {
    Disabled,
    Console,
    JsonFile(PathBuf),
}

fn resolve_sink(lookup: impl Fn(&str) -> Option<String>) -> LogSink {
    if let Some(value) = lookup("RELAY_OBSERVABILITY_ENABLED")
        && parse_bool(&value) == Some(false)
    {
        return LogSink::Disabled;
    }
    match lookup("RELAY_JSON_LOG_PATH").filter(|p| !p.trim().is_empty()) {
        Some(path) => LogSink::JsonFile(PathBuf::from(path)),
        None => LogSink::Console,
    }
}

fn resolve_env_filter(lookup: impl Fn(&str) -> Option<String>) -> EnvFilter {
    if let Some(level) = lookup("RELAY_LOG_LEVEL")
        && let Ok(filter) = EnvFilter::try_new(level)
    {
        return filter;
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging once per process.
///
/// Environment variables:
/// - `RELAY_OBSERVABILITY_ENABLED`: set to a false value to install nothing.
/// - `RELAY_LOG_LEVEL`: level/filter override (`info`, `relay_core=debug`, ...).
/// - `RELAY_JSON_LOG_PATH`: if set, logs are JSONL in that file; otherwise a
///   compact console format on stdout.
/// - `RUST_LOG`: fallback filter.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let lookup = |key: &str| std::env::var(key).ok();
        let sink = resolve_sink(lookup);
        let env_filter = resolve_env_filter(lookup);
        match sink {
            LogSink::Disabled => {}
            LogSink::JsonFile(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    let _ = std::fs::create_dir_all(parent);
                }
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("relay.logs.jsonl");
                let writer = tracing_appender::rolling::never(dir, file_name);
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(false)
                    .with_writer(writer);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(json_layer)
                    .try_init();
            }
            LogSink::Console => {
                let console_layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stdout);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(console_layer)
                    .try_init();
            }
        }
    });
}
