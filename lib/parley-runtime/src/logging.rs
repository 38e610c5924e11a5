// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! - Configuration loaded from:
//!   1. `PARLEY_LOG` filter directives (highest priority).
//!   2. Optional TOML file named by `PARLEY_LOGGING_CONFIG_PATH`.
//!   3. `/etc/parley/logging.toml`.
//!
//! Output is readable compact text by default; JSON lines are written when
//! `PARLEY_LOGGING_JSONL` is truthy. Timestamps are UTC unless
//! `PARLEY_LOG_USE_LOCAL_TZ` is truthy.
//!
//! Example:
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "parley::invoker" = "debug"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Once;

use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::{self, format::Writer, time::FormatTime, FmtContext, FormatFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// ENV used to set filter directives
const FILTER_ENV: &str = "PARLEY_LOG";

const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "PARLEY_LOGGING_CONFIG_PATH";

const JSONL_ENV: &str = "PARLEY_LOGGING_JSONL";

const LOCAL_TZ_ENV: &str = "PARLEY_LOG_USE_LOCAL_TZ";

static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([
                ("tokio".to_string(), "error".to_string()),
                ("figment".to_string(), "error".to_string()),
            ]),
        }
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter_layer = filters(load_config());
    if env_is_truthy(JSONL_ENV) {
        let l = fmt::layer()
            .with_ansi(false)
            .event_format(JsonFormatter::new())
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        let _ = tracing_subscriber::registry().with(l).try_init();
    } else {
        let l = fmt::layer()
            .with_ansi(true)
            .event_format(fmt::format().compact().with_timer(TimeFormatter::new()))
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        let _ = tracing_subscriber::registry().with(l).try_init();
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive: Directive = config
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO)
        .into();

    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

/// Load the logging config from defaults and TOML files.
pub fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    let figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file("/etc/parley/logging.toml"))
        .merge(Toml::file(config_path));

    figment.extract().unwrap_or_else(|e| {
        eprintln!("Failed loading logging config, using defaults: {e}");
        LoggingConfig::default()
    })
}

fn env_is_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "on" | "yes"))
        .unwrap_or(false)
}

struct TimeFormatter {
    use_local_tz: bool,
}

impl TimeFormatter {
    fn new() -> Self {
        Self {
            use_local_tz: env_is_truthy(LOCAL_TZ_ENV),
        }
    }

    fn format_now(&self) -> String {
        if self.use_local_tz {
            chrono::Local::now()
                .format("%Y-%m-%dT%H:%M:%S%.3f%:z")
                .to_string()
        } else {
            chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string()
        }
    }
}

impl FormatTime for TimeFormatter {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", self.format_now())
    }
}

#[derive(Serialize)]
struct JsonLog<'a> {
    time: String,
    level: String,
    target: &'a str,
    message: serde_json::Value,
    #[serde(flatten)]
    fields: BTreeMap<String, serde_json::Value>,
}

struct JsonFormatter {
    time_formatter: TimeFormatter,
}

impl JsonFormatter {
    fn new() -> Self {
        Self {
            time_formatter: TimeFormatter::new(),
        }
    }
}

impl<S, N> fmt::FormatEvent<S, N> for JsonFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let message = visitor
            .fields
            .remove("message")
            .unwrap_or(serde_json::Value::String(String::new()));

        if let Some(span) = event
            .parent()
            .and_then(|id| ctx.span(id))
            .or_else(|| ctx.lookup_current())
        {
            visitor.fields.insert(
                "span_name".to_string(),
                serde_json::Value::String(span.name().to_string()),
            );
        }

        let metadata = event.metadata();
        let log = JsonLog {
            time: self.time_formatter.format_now(),
            level: metadata.level().to_string(),
            target: metadata.target(),
            message,
            fields: visitor.fields,
        };
        let json = serde_json::to_string(&log).map_err(|_| std::fmt::Error)?;
        writeln!(writer, "{json}")
    }
}

#[derive(Default)]
struct JsonVisitor {
    // sorted so that fields always print in the same order
    fields: BTreeMap<String, serde_json::Value>,
}

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::String(format!("{value:?}")),
        );
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::String(value.to_string()),
        );
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::Number(value.into()),
        );
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::Number(value.into()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        temp_env::with_vars_unset([CONFIG_PATH_ENV], || {
            let config = load_config();
            assert_eq!(config.log_level, "info");
            assert_eq!(config.log_filters.get("tokio").map(String::as_str), Some("error"));
        });
    }

    #[test]
    fn test_truthy_env() {
        temp_env::with_var(JSONL_ENV, Some("TRUE"), || assert!(env_is_truthy(JSONL_ENV)));
        temp_env::with_var(JSONL_ENV, Some("0"), || assert!(!env_is_truthy(JSONL_ENV)));
        temp_env::with_var_unset(JSONL_ENV, || assert!(!env_is_truthy(JSONL_ENV)));
    }

    #[test]
    fn test_bad_level_falls_back() {
        let config = LoggingConfig {
            log_level: "loud".to_string(),
            log_filters: HashMap::new(),
        };
        temp_env::with_var_unset(FILTER_ENV, || {
            let filter = filters(config);
            assert!(filter.to_string().contains("info"));
            assert!(!filter.to_string().contains("loud"));
            assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
        });
    }

    #[test]
    fn test_level_sets_default_directive() {
        let config = LoggingConfig {
            log_level: "debug".to_string(),
            log_filters: HashMap::from([("tokio".to_string(), "error".to_string())]),
        };
        temp_env::with_var_unset(FILTER_ENV, || {
            let filter = filters(config);
            assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
            assert!(filter.to_string().contains("tokio=error"));
        });
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        tracing::info!(target: "parley::test", "logging initialized");
    }
}
