//! A second `tracing_subscriber::fmt` event formatter, selected at runtime
//! by the runtime config's log field (§4.4): some cloud log collectors
//! expect `severity`/`time` instead of this crate's default `level`/
//! `timestamp` JSON keys. Implemented as an alternate `FormatEvent`, not a
//! different logging crate, per SPEC_FULL §3.1.
use std::fmt;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Renders events as JSON with `severity`/`time` keys instead of the
/// default formatter's `level`/`timestamp`, matching what GCP's Cloud
/// Logging collector expects from structured container logs.
pub struct CloudFieldNames;

impl<S, N> FormatEvent<S, N> for CloudFieldNames
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut fields = Map::new();
        let mut visitor = JsonVisitor(&mut fields);
        event.record(&mut visitor);

        let mut object = Map::new();
        object.insert("severity".to_string(), Value::String(metadata.level().to_string()));
        object.insert("time".to_string(), Value::String(Utc::now().to_rfc3339()));
        object.insert("target".to_string(), Value::String(metadata.target().to_string()));
        for (key, value) in fields {
            object.insert(key, value);
        }

        let line = serde_json::to_string(&Value::Object(object)).map_err(|_| fmt::Error)?;
        writeln!(writer, "{line}")
    }
}

struct JsonVisitor<'a>(&'a mut Map<String, Value>);

impl Visit for JsonVisitor<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(
            field.name().to_string(),
            serde_json::Number::from_f64(value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::from(format!("{value:?}")));
    }
}
