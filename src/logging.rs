//! Logging setup
//!
//! Everything goes to stderr: stdout belongs to the cache protocol.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Output format for log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
    /// GitHub Actions workflow commands, so warnings surface as annotations
    Github,
}

/// Filter for a verbosity count: 0 = warn, 1 = info, 2+ = debug.
/// `RUST_LOG` wins when set.
pub fn filter(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbosity {
            0 => "tiercache=warn",
            1 => "tiercache=info",
            _ => "tiercache=debug",
        })
    })
}

/// Install the global subscriber. Colors only when stderr is a terminal.
pub fn init(verbosity: u8, format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(verbosity))
        .with_writer(std::io::stderr)
        .with_ansi(console::colors_enabled_stderr())
        .with_target(false);

    match format {
        LogFormat::Text => builder.without_time().init(),
        LogFormat::Json => builder.json().init(),
        LogFormat::Github => builder.event_format(GithubActionsFormat).init(),
    }
}

/// Formats events as GitHub Actions workflow commands.
///
/// Errors and warnings become `::error::` / `::warning::` annotations;
/// other levels are printed as `LEVEL: message (fields)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GithubActionsFormat;

impl<S, N> FormatEvent<S, N> for GithubActionsFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = FieldCollector::default();
        event.record(&mut fields);
        writeln!(
            writer,
            "{}",
            annotation(*event.metadata().level(), &fields.message, &fields.pairs)
        )
    }
}

fn annotation(level: Level, message: &str, pairs: &[String]) -> String {
    let mut line = match level {
        Level::ERROR => format!("::error::{}", message),
        Level::WARN => format!("::warning::{}", message),
        other => format!("{}: {}", other.as_str(), message),
    };
    if !pairs.is_empty() {
        line.push_str(&format!(" ({})", pairs.join(", ")));
    }
    line
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    pairs: Vec<String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.pairs.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.pairs.push(format!("{}={:?}", field.name(), value));
        }
    }
}
