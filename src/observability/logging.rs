//! Tracing setup and log hygiene for the idempotency layer.
//!
//! Log lines are keyed by idempotency key and trace id. Keys are
//! client-chosen and routinely embed order numbers, customer
//! references, or payment ids, so they go through [`mask_key`] before
//! they reach a log sink.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Output format for the tracing subscriber, selected by the
/// `log_format` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

impl LogFormat {
    /// Parses a setting value; anything unrecognized falls back to the
    /// human-readable default rather than failing startup.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Installs the global tracing subscriber. `RUST_LOG` wins over the
/// configured level when set.
pub fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Json => builder
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }

    tracing::debug!(level, ?format, "tracing initialized");
}

/// Number of key characters left visible at each edge of a masked key.
const MASK_VISIBLE_CHARS: usize = 4;

/// Redacts the middle of an idempotency key, keeping just enough of
/// the edges to correlate log lines with a client's retry series.
/// Short keys are fully redacted. Valid keys are printable ASCII, but
/// this is also called on debug paths before validation, so non-ASCII
/// input is redacted wholesale instead of sliced.
pub fn mask_key(key: &str) -> String {
    if !key.is_ascii() || key.len() <= MASK_VISIBLE_CHARS * 2 {
        return "*".repeat(key.chars().count());
    }
    format!(
        "{}***{}",
        &key[..MASK_VISIBLE_CHARS],
        &key[key.len() - MASK_VISIBLE_CHARS..]
    )
}
