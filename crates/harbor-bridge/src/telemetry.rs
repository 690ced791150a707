//! Session tracing: one span per session, propagated to the worker.
//!
//! The sink is opaque to the bridge. It opens a span before `init` is sent,
//! hands back W3C trace context for the worker to nest under, and closes the
//! span once the session ends.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

pub const TRACEPARENT: &str = "traceparent";
pub const TRACESTATE: &str = "tracestate";

/// W3C Trace Context for distributed tracing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    pub traceparent: Option<String>,
    pub tracestate: Option<String>,
}

impl TraceContext {
    /// Headers for the `init` frame; `None` when there is nothing to propagate.
    pub fn to_headers(&self) -> Option<BTreeMap<String, String>> {
        let mut headers = BTreeMap::new();
        if let Some(tp) = &self.traceparent {
            headers.insert(TRACEPARENT.to_string(), tp.clone());
        }
        if let Some(ts) = &self.tracestate {
            headers.insert(TRACESTATE.to_string(), ts.clone());
        }
        (!headers.is_empty()).then_some(headers)
    }
}

/// Everything recorded when a session span opens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanMetadata {
    /// Span name; the session id.
    pub name: String,
    /// Experiment the span is filed under.
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_example_id: Option<String>,
    pub inputs: IndexMap<String, Value>,
    pub metadata: IndexMap<String, Value>,
}

impl SpanMetadata {
    /// Metadata for one session. Trial configuration keys are merged last.
    pub fn for_session(
        session_id: &str,
        instruction: &str,
        model: &str,
        project: &str,
        reference_example_id: Option<String>,
        trial_config: &Map<String, Value>,
    ) -> Self {
        let inputs = IndexMap::from([("instruction".to_string(), Value::from(instruction))]);

        let mut metadata = IndexMap::from([
            ("task_instruction".to_string(), Value::from(instruction)),
            ("model".to_string(), Value::from(model)),
            ("harbor_session_id".to_string(), Value::from(session_id)),
            ("agent_mode".to_string(), Value::from("js")),
        ]);
        for (key, value) in trial_config {
            metadata.insert(key.clone(), value.clone());
        }

        Self {
            name: session_id.to_string(),
            project: project.to_string(),
            reference_example_id,
            inputs,
            metadata,
        }
    }
}

/// Destination for session spans.
pub trait TraceSink: Send + Sync {
    /// Open a span and return the context to propagate.
    fn start(&self, span: &SpanMetadata) -> TraceContext;

    /// Close the span opened by `start`.
    fn end(&self, context: &TraceContext, outputs: &Value);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {
    fn start(&self, _span: &SpanMetadata) -> TraceContext {
        TraceContext::default()
    }

    fn end(&self, _context: &TraceContext, _outputs: &Value) {}
}

/// Emits span boundaries as `tracing` events under the `harbor_bridge::trace` target.
#[derive(Debug, Default)]
pub struct LogTraceSink {
    open: Mutex<BTreeMap<String, Instant>>,
}

impl LogTraceSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TraceSink for LogTraceSink {
    fn start(&self, span: &SpanMetadata) -> TraceContext {
        let traceparent = new_traceparent();
        if let Ok(mut open) = self.open.lock() {
            open.insert(traceparent.clone(), Instant::now());
        }

        let metadata = serde_json::to_string(&span.metadata).unwrap_or_default();
        tracing::info!(
            target: "harbor_bridge::trace",
            name = %span.name,
            project = %span.project,
            reference_example_id = span.reference_example_id.as_deref(),
            traceparent = %traceparent,
            %metadata,
            "Span started"
        );

        TraceContext {
            traceparent: Some(traceparent),
            tracestate: None,
        }
    }

    fn end(&self, context: &TraceContext, outputs: &Value) {
        let traceparent = context.traceparent.as_deref().unwrap_or_default();
        let started = self
            .open
            .lock()
            .ok()
            .and_then(|mut open| open.remove(traceparent));
        let duration_ms = started.map(|s| s.elapsed().as_millis() as u64);

        tracing::info!(
            target: "harbor_bridge::trace",
            traceparent,
            duration_ms,
            outputs = %outputs,
            "Span ended"
        );
    }
}

/// `00-{trace id}-{parent id}-01`, sampled.
fn new_traceparent() -> String {
    let trace_id = Uuid::new_v4().simple().to_string();
    let span_id = Uuid::new_v4().simple().to_string();
    format!("00-{}-{}-01", trace_id, &span_id[..16])
}
