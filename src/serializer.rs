//! Convert transactions, spans, errors, and metricsets into the NDJSON wire
//! format the intake endpoint expects: one JSON object per line, each
//! wrapped in a single-key envelope (`{"metadata": ...}`, `{"span": ...}`,
//! etc.), always in the order metadata, errors, spans (post-order), then
//! the transaction.

use crate::metadata::Metadata;
use crate::model::{Context, ContextValue, Error, Outcome, Span, Transaction};
use serde::Serialize;
use serde_json::{Map, Value};

fn context_to_value(context: &Context) -> Option<Value> {
    if context.is_empty() {
        return None;
    }
    let mut root = Map::new();
    for (path, value) in context.entries() {
        insert_path(&mut root, &path.0, value);
    }
    Some(Value::Object(root))
}

fn insert_path(root: &mut Map<String, Value>, path: &[&'static str], value: &ContextValue) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        root.insert(head.to_string(), context_value_to_json(value));
        return;
    }
    let entry = root
        .entry(head.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(nested) = entry {
        insert_path(nested, rest, value);
    }
}

fn context_value_to_json(value: &ContextValue) -> Value {
    match value {
        ContextValue::Str(s) => Value::String(s.clone()),
        ContextValue::Num(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
    }
}

#[derive(Serialize)]
struct SpanCount {
    started: u32,
    dropped: u32,
}

#[derive(Serialize)]
struct SpanWire<'a> {
    id: &'a str,
    transaction_id: &'a str,
    trace_id: &'a str,
    parent_id: &'a str,
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subtype: Option<&'a str>,
    timestamp: u64,
    duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<Value>,
}

#[derive(Serialize)]
struct StacktraceWire<'a> {
    function: &'a str,
    filename: &'a str,
}

#[derive(Serialize)]
struct ExceptionWire<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    message: &'a str,
    handled: bool,
    stacktrace: Vec<StacktraceWire<'a>>,
}

#[derive(Serialize)]
struct ErrorWire<'a> {
    id: &'a str,
    transaction_id: &'a str,
    trace_id: &'a str,
    parent_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    culprit: Option<&'a str>,
    timestamp: u64,
    exception: ExceptionWire<'a>,
}

#[derive(Serialize)]
struct TransactionWire<'a> {
    id: &'a str,
    trace_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    timestamp: u64,
    duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a str>,
    span_count: SpanCount,
}

fn push_line<T: Serialize>(out: &mut String, key: &'static str, value: &T) {
    let mut envelope = Map::new();
    envelope.insert(
        key.to_string(),
        serde_json::to_value(value).unwrap_or(Value::Null),
    );
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&Value::Object(envelope).to_string());
}

/// Post-order depth-first walk: children before parent, left to right.
fn push_spans_post_order(out: &mut String, span: &Span) {
    for child in &span.children {
        push_spans_post_order(out, child);
    }
    let wire = SpanWire {
        id: &span.id,
        transaction_id: &span.transaction_id,
        trace_id: &span.trace_id,
        parent_id: &span.parent_id,
        name: &span.name,
        kind: &span.r#type,
        subtype: span.subtype.as_deref(),
        timestamp: span.timestamp,
        duration: span.duration.unwrap_or(0.0),
        outcome: span.outcome.map(Outcome::as_str),
        context: context_to_value(&span.context),
    };
    push_line(out, "span", &wire);
}

fn push_error(out: &mut String, error: &Error) {
    let wire = ErrorWire {
        id: &error.id,
        transaction_id: &error.transaction_id,
        trace_id: &error.trace_id,
        parent_id: &error.parent_id,
        culprit: error.culprit.as_deref(),
        timestamp: error.timestamp,
        exception: ExceptionWire {
            kind: &error.exception.r#type,
            message: &error.exception.message,
            handled: error.exception.handled,
            stacktrace: error
                .exception
                .stacktrace
                .iter()
                .map(|f| StacktraceWire {
                    function: &f.function,
                    filename: &f.filename,
                })
                .collect(),
        },
    };
    push_line(out, "error", &wire);
}

/// Serialize one finished transaction and its metadata preamble into an
/// NDJSON batch body: metadata line, then one line per error, then one
/// line per span in post-order, then the transaction line.
pub fn serialize_transaction(metadata: &Metadata, txn: &Transaction) -> String {
    let mut out = String::new();
    push_line(&mut out, "metadata", metadata);

    for error in &txn.errors {
        push_error(&mut out, error);
    }
    for span in &txn.spans {
        push_spans_post_order(&mut out, span);
    }

    let wire = TransactionWire {
        id: &txn.id,
        trace_id: &txn.trace_id,
        parent_id: txn.parent_id.as_deref(),
        name: &txn.name,
        kind: &txn.r#type,
        timestamp: txn.timestamp,
        duration: txn.duration.unwrap_or(0.0),
        outcome: txn.outcome.map(Outcome::as_str),
        result: txn.result.as_deref(),
        span_count: SpanCount {
            started: txn.span_count,
            dropped: txn.span_dropped,
        },
    };
    push_line(&mut out, "transaction", &wire);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{ContextPath, ContextValue};

    fn sample_metadata() -> Metadata {
        Metadata::build(&Config::default())
    }

    #[test]
    fn single_transaction_emits_metadata_then_transaction() {
        let mut txn = Transaction::begin("GET /x", "request", None, None);
        txn.end(Outcome::Success, Some("200".into()));
        let body = serialize_transaction(&sample_metadata(), &txn);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(r#"{"metadata""#));
        assert!(lines[1].starts_with(r#"{"transaction""#));
        assert!(lines[1].contains(r#""name":"GET /x""#));
        assert!(lines[1].contains(r#""outcome":"success""#));
    }

    #[test]
    fn nested_spans_emit_in_post_order() {
        let mut txn = Transaction::begin("t", "request", None, None);
        txn.begin_span("a", "code", None);
        txn.begin_span("b", "code", None);
        txn.end_span(Outcome::Success); // ends b
        txn.end_span(Outcome::Success); // ends a
        txn.end(Outcome::Success, None);

        let body = serialize_transaction(&sample_metadata(), &txn);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4); // metadata, span(b), span(a), transaction
        assert!(lines[1].contains(r#""name":"b""#));
        assert!(lines[2].contains(r#""name":"a""#));
        assert!(lines[3].starts_with(r#"{"transaction""#));
    }

    #[test]
    fn error_line_precedes_spans_and_transaction() {
        let mut txn = Transaction::begin("t", "request", None, None);
        txn.catch_error(Error {
            id: "e".repeat(32),
            transaction_id: String::new(),
            trace_id: String::new(),
            parent_id: String::new(),
            culprit: None,
            timestamp: 0,
            exception: crate::model::Exception {
                r#type: "E".into(),
                message: "boom".into(),
                handled: true,
                stacktrace: vec![],
            },
        });
        txn.begin_span("a", "code", None);
        txn.end_span(Outcome::Success);
        txn.end(Outcome::Failure, None);

        let body = serialize_transaction(&sample_metadata(), &txn);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4); // metadata, error, span, transaction
        assert!(lines[1].starts_with(r#"{"error""#));
        assert!(lines[2].starts_with(r#"{"span""#));
        assert!(lines[3].starts_with(r#"{"transaction""#));
    }

    #[test]
    fn parent_id_omitted_from_transaction_when_empty() {
        let mut txn = Transaction::begin("t", "request", None, None);
        txn.end(Outcome::Success, None);
        let body = serialize_transaction(&sample_metadata(), &txn);
        let last = body.lines().last().unwrap();
        assert!(!last.contains("parent_id"));
    }

    #[test]
    fn context_omitted_from_span_with_no_entries() {
        let mut txn = Transaction::begin("t", "request", None, None);
        txn.begin_span("a", "code", None);
        txn.end_span(Outcome::Success);
        txn.end(Outcome::Success, None);
        let body = serialize_transaction(&sample_metadata(), &txn);
        let span_line = body.lines().nth(1).unwrap();
        assert!(!span_line.contains("context"));
    }

    #[test]
    fn span_context_nests_dotted_path() {
        let mut txn = Transaction::begin("t", "request", None, None);
        let span = txn.begin_span("GET /x", "external", Some("http".into()));
        span.context
            .set(ContextPath::new(&["http", "status_code"]), ContextValue::Num(200.0));
        txn.end_span(Outcome::Success);
        txn.end(Outcome::Success, None);

        let body = serialize_transaction(&sample_metadata(), &txn);
        let span_line = body.lines().nth(1).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(span_line).unwrap();
        assert_eq!(parsed["span"]["context"]["http"]["status_code"], 200.0);
    }
}
