use std::collections::HashMap;

use axum::http::HeaderMap;

/// Header carrying the load balancer's trace context, shaped
/// `TRACE_ID/SPAN_ID;o=1`. Only the trace id segment is used.
pub const TRACE_HEADER: &str = "x-cloud-trace-context";

/// Correlation id for the current delivery, or None when the header is
/// absent or empty. Header lookup is case-insensitive.
pub fn extract_trace_id(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(TRACE_HEADER)?.to_str().ok()?;
    let trace_id = header.split('/').next().unwrap_or("").trim();
    if trace_id.is_empty() {
        None
    } else {
        Some(trace_id.to_string())
    }
}

/// Fields to merge into log records and queue message attributes for the
/// lifetime of the request. Empty when no correlation id was extracted.
pub fn build_trace_fields(trace_id: Option<&str>, project_id: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    if let Some(id) = trace_id {
        fields.insert("trace_id".to_string(), id.to_string());
        fields.insert(
            "trace".to_string(),
            format!("projects/{project_id}/traces/{id}"),
        );
    }
    fields
}
