use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Sensitive field names redacted from every log line, ported from
/// `SecurityFilter.SENSITIVE_KEYS` in the original logging config.
const SENSITIVE_KEYS: &[&str] = &[
    "authorization",
    "x-cashu",
    "bearer",
    "token",
    "key",
    "secret",
    "password",
    "refund_address",
    "upstream_api_key",
];

/// Returns `true` if a tracing field name looks sensitive and should have
/// its value masked rather than written verbatim.
pub fn is_sensitive_field(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|key| lower.contains(key))
}

pub fn redact(name: &str, value: &str) -> String {
    if is_sensitive_field(name) {
        "[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Text,
}

/// Visits an event's fields, applying [`redact`] to each value before it is
/// ever handed to a formatter. Unlike `tracing_subscriber::fmt`'s own
/// visitor, this one never sees the unredacted value reach a `Writer`.
#[derive(Default)]
struct RedactingVisitor {
    fields: Vec<(String, String)>,
}

impl RedactingVisitor {
    fn push(&mut self, field: &Field, raw: String) {
        let name = field.name();
        self.fields.push((name.to_string(), redact(name, &raw)));
    }
}

impl Visit for RedactingVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format!("{value:?}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, value.to_string());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.push(field, value.to_string());
    }
}

/// A `tracing_subscriber::Layer` that redacts sensitive field values before
/// they are written anywhere, replacing `fmt::layer()` so the masking
/// cannot be bypassed by composing in the "wrong" layer.
///
/// Writes to `sink` when present (for tests); otherwise to stdout.
pub struct RedactingLayer {
    format: OutputFormat,
    sink: Option<Arc<Mutex<Vec<String>>>>,
}

impl RedactingLayer {
    fn new(format: OutputFormat) -> Self {
        Self { format, sink: None }
    }

    #[cfg(test)]
    fn with_sink(format: OutputFormat, sink: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            format,
            sink: Some(sink),
        }
    }

    fn emit(&self, line: String) {
        match &self.sink {
            Some(sink) => sink.lock().expect("redacting layer sink poisoned").push(line),
            None => println!("{line}"),
        }
    }
}

impl<S> Layer<S> for RedactingLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = RedactingVisitor::default();
        attrs.record(&mut visitor);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor);
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            let mut extensions = span.extensions_mut();
            if let Some(visitor) = extensions.get_mut::<RedactingVisitor>() {
                values.record(visitor);
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = RedactingVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let line = match self.format {
            OutputFormat::Json => {
                let mut obj = serde_json::Map::new();
                obj.insert("level".to_string(), json!(meta.level().to_string()));
                obj.insert("target".to_string(), json!(meta.target()));
                obj.insert("timestamp".to_string(), json!(unix_timestamp_secs()));
                for (name, value) in &visitor.fields {
                    obj.insert(name.clone(), json!(value));
                }
                serde_json::Value::Object(obj).to_string()
            }
            OutputFormat::Text => {
                let fields = visitor
                    .fields
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!(
                    "{} {:>5} {}: {}",
                    unix_timestamp_secs(),
                    meta.level(),
                    meta.target(),
                    fields
                )
            }
        };
        self.emit(line);
    }
}

fn unix_timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn init(log_level: &str, log_format: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let format = if log_format.eq_ignore_ascii_case("json") {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(RedactingLayer::new(format))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_known_sensitive_keys() {
        assert_eq!(redact("authorization", "Bearer sk-abc"), "[REDACTED]");
        assert_eq!(redact("x-cashu", "cashuAeyJ0..."), "[REDACTED]");
        assert_eq!(redact("model", "gpt-4"), "gpt-4");
    }

    #[test]
    fn case_insensitive_matching() {
        assert!(is_sensitive_field("Authorization"));
        assert!(is_sensitive_field("X-Cashu"));
        assert!(!is_sensitive_field("model"));
    }

    #[test]
    fn emitted_events_have_sensitive_fields_masked() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let layer = RedactingLayer::with_sink(OutputFormat::Json, sink.clone());
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(hashed_key = "abc123", authorization = "Bearer sk-live-xyz", "account rail settled");
        });

        let lines = sink.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"hashed_key\":\"abc123\""));
        assert!(lines[0].contains("[REDACTED]"));
        assert!(!lines[0].contains("sk-live-xyz"));
    }

    #[test]
    fn text_format_also_redacts() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let layer = RedactingLayer::with_sink(OutputFormat::Text, sink.clone());
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(token = "cashuAeyJ0...", "cashu token redeemed");
        });

        let lines = sink.lock().unwrap();
        assert!(lines[0].contains("token=[REDACTED]"));
        assert!(!lines[0].contains("cashuAeyJ0"));
    }
}
