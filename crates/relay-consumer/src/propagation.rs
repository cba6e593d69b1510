//! Trace-context propagation through message headers
//!
//! Producers inject the active span context into message headers; handler
//! invocations extract it so the processing span becomes a child of the
//! producer span.

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;

/// Shared propagator handle
pub type SharedPropagator = Arc<dyn TextMapPropagator + Send + Sync>;

/// Default propagator: W3C `traceparent` / `tracestate`
pub fn default_propagator() -> SharedPropagator {
    Arc::new(TraceContextPropagator::new())
}

/// Read-only carrier over message headers
pub struct HeaderExtractor<'a>(pub &'a HashMap<String, String>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .or_else(|| {
                self.0
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Write carrier over message headers
pub struct HeaderInjector<'a>(pub &'a mut HashMap<String, String>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// Rebuild the producer's context from message headers
pub fn extract_context(
    propagator: &dyn TextMapPropagator,
    headers: &HashMap<String, String>,
) -> Context {
    propagator.extract(&HeaderExtractor(headers))
}

/// Write `cx` into message headers
pub fn inject_context(
    propagator: &dyn TextMapPropagator,
    cx: &Context,
    headers: &mut HashMap<String, String>,
) {
    propagator.inject_context(cx, &mut HeaderInjector(headers));
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };

    fn remote_context() -> Context {
        let span_context = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        Context::new().with_remote_span_context(span_context)
    }

    #[test]
    fn test_inject_then_extract_keeps_trace_id() {
        let propagator = default_propagator();
        let mut headers = HashMap::new();

        inject_context(propagator.as_ref(), &remote_context(), &mut headers);
        assert_eq!(
            headers.get("traceparent").map(String::as_str),
            Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        );

        let cx = extract_context(propagator.as_ref(), &headers);
        let span = cx.span();
        let extracted = span.span_context();
        assert!(extracted.is_valid());
        assert!(extracted.is_remote());
        assert_eq!(
            extracted.trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
        );
    }

    #[test]
    fn test_extract_ignores_header_case() {
        let mut headers = HashMap::new();
        headers.insert(
            "TraceParent".to_string(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
        );

        let cx = extract_context(default_propagator().as_ref(), &headers);
        assert!(cx.span().span_context().is_valid());
    }

    #[test]
    fn test_extract_without_headers_has_no_parent() {
        let cx = extract_context(default_propagator().as_ref(), &HashMap::new());
        assert!(!cx.span().span_context().is_valid());
    }

    #[test]
    fn test_extractor_walks_all_keys() {
        let mut headers = HashMap::new();
        headers.insert("a".to_string(), "1".to_string());
        headers.insert("b".to_string(), "2".to_string());

        let extractor = HeaderExtractor(&headers);
        let mut keys = extractor.keys();
        keys.sort_unstable();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
