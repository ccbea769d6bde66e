use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const ENABLED_ENV: &str = "RELAY_OBSERVABILITY_ENABLED";
const LEVEL_ENV: &str = "RELAY_LOG_LEVEL";
const JSON_PATH_ENV: &str = "RELAY_JSON_LOG_PATH";
const DEFAULT_LOG_FILE: &str = "relay.logs.jsonl";

static INIT: OnceCell<()> = OnceCell::new();

/// Logging settings resolved from the environment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct LogSettings {
    enabled: bool,
    level: Option<String>,
    json_path: Option<PathBuf>,
}

impl LogSettings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup(ENABLED_ENV)
            .map(|value| parse_bool(&value).unwrap_or(true))
            .unwrap_or(true);
        Self {
            enabled,
            level: lookup(LEVEL_ENV).filter(|v| !v.trim().is_empty()),
            json_path: lookup(JSON_PATH_ENV)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        if let Some(level) = &self.level
            && let Ok(filter) = EnvFilter::try_new(level)
        {
            return filter;
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Splits a log path into the directory and file name handed to the appender.
fn log_file_location(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    (dir, file_name)
}

/// Installs the process-wide `tracing` subscriber once.
///
/// Environment variables:
/// - `RELAY_OBSERVABILITY_ENABLED`: set to `false`/`0`/`off` to skip installation.
/// - `RELAY_LOG_LEVEL`: filter directive (`info`, `relay_core=debug`, ...).
/// - `RUST_LOG`: fallback filter when `RELAY_LOG_LEVEL` is unset or invalid.
/// - `RELAY_JSON_LOG_PATH`: write JSONL to this file instead of compact
///   console output on stdout.
///
/// Calling this more than once, or after another subscriber was installed,
/// is a no-op.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let settings = LogSettings::from_lookup(|key| std::env::var(key).ok());
        if !settings.enabled {
            return;
        }
        let env_filter = settings.env_filter();

        match &settings.json_path {
            Some(path) => {
                let (dir, file_name) = log_file_location(path);
                let _ = std::fs::create_dir_all(&dir);
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
            None => {
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
