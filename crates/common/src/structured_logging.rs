//! Structured logging for the dispatch workspace.
//!
//! Two output modes share one `EnvFilter`:
//! - JSON lines (one [`StructuredLogEntry`] per event) for production scrapers
//! - human-readable `fmt` output for development

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Write};
use std::time::{Duration, Instant};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

/// One JSON log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredLogEntry {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub level: String,
    /// Module path that emitted the event
    pub target: String,
    pub message: String,
    /// Remaining structured fields (`collaborator`, `latency_ms`, ...)
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceContext>,
}

/// Process-level context attached to JSON entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceContext {
    pub service: String,
    pub version: String,
    pub pid: u32,
}

impl ServiceContext {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
        }
    }
}

/// Layer that renders every event as a [`StructuredLogEntry`] on stdout.
pub struct JsonFormatter {
    context: ServiceContext,
}

impl JsonFormatter {
    pub fn new(context: ServiceContext) -> Self {
        Self { context }
    }

    fn render(&self, event: &Event<'_>) -> StructuredLogEntry {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        StructuredLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level_name(*event.metadata().level()).to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
            service: Some(self.context.clone()),
        }
    }
}

impl<S> Layer<S> for JsonFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let entry = self.render(event);
        if let Ok(json) = serde_json::to_string(&entry) {
            let _ = writeln!(io::stdout(), "{}", json);
        }
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
}

/// Collects event fields into JSON values.
#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: HashMap<String, Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.insert(field, Value::String(format!("{:?}", value)));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Fallback level when `RUST_LOG` is not set
    pub level: Level,
    /// Emit JSON lines instead of human-readable output
    pub json_output: bool,
    /// ANSI colours (non-JSON only)
    pub color_output: bool,
    pub include_line_numbers: bool,
    /// Service name stamped on JSON entries
    pub service_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_output: false,
            color_output: true,
            include_line_numbers: cfg!(debug_assertions),
            service_name: "dispatch".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            include_line_numbers: true,
            ..Default::default()
        }
    }

    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            json_output: true,
            color_output: false,
            include_line_numbers: false,
            ..Default::default()
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_structured_logging(config: LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    if config.json_output {
        let json_layer = JsonFormatter::new(ServiceContext::new(config.service_name.clone()));
        let subscriber = Registry::default().with(env_filter).with(json_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(config.include_line_numbers)
            .with_ansi(config.color_output)
            .with_span_events(FmtSpan::CLOSE);
        let subscriber = Registry::default().with(env_filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

/// Measures one operation and logs its completion with `duration_ms`.
#[derive(Debug)]
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
    fields: HashMap<String, Value>,
}

impl OperationTimer {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation_name: operation_name.into(),
            fields: HashMap::new(),
        }
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(v) = serde_json::to_value(value) {
            self.fields.insert(key.into(), v);
        }
    }

    pub fn fields(&self) -> &HashMap<String, Value> {
        &self.fields
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::info!(
            operation = %self.operation_name,
            duration_ms = elapsed.as_millis() as u64,
            success = true,
            fields = ?self.fields,
            "Operation completed"
        );
        elapsed
    }

    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: &Result<T, E>) -> Duration {
        let elapsed = self.start.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        match result {
            Ok(_) => tracing::info!(
                operation = %self.operation_name,
                duration_ms,
                success = true,
                fields = ?self.fields,
                "Operation completed"
            ),
            Err(e) => tracing::warn!(
                operation = %self.operation_name,
                duration_ms,
                success = false,
                error = %e,
                fields = ?self.fields,
                "Operation failed"
            ),
        }
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_log_entry_serialization() {
        let mut fields = HashMap::new();
        fields.insert("collaborator".to_string(), Value::String("claude".into()));
        fields.insert("latency_ms".to_string(), Value::Number(42.into()));

        let entry = StructuredLogEntry {
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            level: "INFO".to_string(),
            target: "dispatch::orchestrator".to_string(),
            message: "Attempt succeeded".to_string(),
            fields,
            service: Some(ServiceContext::new("dispatch")),
        };

        let json = serde_json::to_value(&entry).expect("entry serializes");
        // Fields are flattened next to the fixed keys
        assert_eq!(json["collaborator"], "claude");
        assert_eq!(json["latency_ms"], 42);
        assert_eq!(json["service"]["service"], "dispatch");
        assert_eq!(json["level"], "INFO");
    }

    #[test]
    fn test_operation_timer_fields_and_elapsed() {
        let mut timer = OperationTimer::new("execute");
        timer.add_field("capability", "coding");
        timer.add_field("attempts", 2);
        assert_eq!(timer.fields().len(), 2);
        assert_eq!(timer.fields()["attempts"], 2);

        std::thread::sleep(Duration::from_millis(5));
        let elapsed = timer.finish_with_result::<(), String>(&Err("boom".into()));
        assert!(elapsed >= Duration::from_millis(5));
    }

    #[test]
    fn test_logging_presets() {
        let prod = LoggingConfig::production();
        assert!(prod.json_output);
        assert!(!prod.color_output);

        let dev = LoggingConfig::development();
        assert_eq!(dev.level, Level::DEBUG);
        assert!(!dev.json_output);
    }
}
