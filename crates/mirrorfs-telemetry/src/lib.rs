//! OpenTelemetry integration for mirrorfs.
//!
//! Provides OTel tracing layer setup and W3C Trace Context propagation
//! across the Cap'n Proto boundary between `mirrorfs-mount` and
//! `mirrorfs-server`. The trace context rides inside the `RpcContext`
//! envelope that every request carries.
//!
//! # Activation
//!
//! Build with the `telemetry` feature, then set the standard OTel
//! environment variables:
//!
//! ```bash
//! # Minimal: enables OTLP export to localhost:4317
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 mirrorfs-server /srv/export
//!
//! # Full control
//! OTEL_SERVICE_NAME=mirrorfs-server \
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://jaeger:4317 \
//! OTEL_TRACES_EXPORTER=otlp \
//! mirrorfs-server /srv/export
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to explicitly disable even when the endpoint is set.
//!
//! Without the feature, propagation degrades to empty strings and plain
//! tracing spans, so callers never need to `cfg` around it.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{OtelGuard, otel_layer};

/// Check whether OTel export should be enabled.
///
/// Returns `true` when standard OTel env vars indicate export is desired:
/// - `OTEL_SDK_DISABLED` is NOT set to `"true"`
/// - AND at least one of:
///   - `OTEL_EXPORTER_OTLP_ENDPOINT` is set
///   - `OTEL_TRACES_EXPORTER` is set (and not `"none"`)
pub fn otel_enabled() -> bool {
    env_says_enabled(|key| std::env::var(key).ok())
}

fn env_says_enabled(var: impl Fn(&str) -> Option<String>) -> bool {
    // Explicit disable takes priority
    if var("OTEL_SDK_DISABLED")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        return false;
    }

    if var("OTEL_EXPORTER_OTLP_ENDPOINT").is_some() {
        return true;
    }

    // Anything other than "none"
    if let Some(exporter) = var("OTEL_TRACES_EXPORTER") {
        return !exporter.eq_ignore_ascii_case("none");
    }

    false
}

/// Inject W3C Trace Context from the current tracing span.
///
/// Returns `(traceparent, tracestate)` for the request's `RpcContext`. Both
/// are empty when there is no sampled trace to continue.
pub fn inject_trace_context() -> (String, String) {
    #[cfg(feature = "telemetry")]
    {
        otel::inject_trace_context_impl()
    }
    #[cfg(not(feature = "telemetry"))]
    {
        (String::new(), String::new())
    }
}

/// Extract W3C Trace Context and create a span for one incoming call.
///
/// The span is named `rpc.request` and records the method; with the
/// `telemetry` feature it is linked to the remote parent when one is present.
pub fn extract_trace_context(
    traceparent: &str,
    tracestate: &str,
    method: &'static str,
) -> tracing::Span {
    #[cfg(feature = "telemetry")]
    {
        otel::extract_trace_context_impl(traceparent, tracestate, method)
    }
    #[cfg(not(feature = "telemetry"))]
    {
        let _ = (traceparent, tracestate);
        tracing::info_span!("rpc.request", method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_disabled_by_default() {
        assert!(!env_says_enabled(env(&[])));
    }

    #[test]
    fn test_endpoint_enables() {
        assert!(env_says_enabled(env(&[(
            "OTEL_EXPORTER_OTLP_ENDPOINT",
            "http://localhost:4317"
        )])));
    }

    #[test]
    fn test_sdk_disabled_wins() {
        assert!(!env_says_enabled(env(&[
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://localhost:4317"),
            ("OTEL_SDK_DISABLED", "TRUE"),
        ])));
    }

    #[test]
    fn test_traces_exporter_none() {
        assert!(!env_says_enabled(env(&[("OTEL_TRACES_EXPORTER", "none")])));
        assert!(env_says_enabled(env(&[("OTEL_TRACES_EXPORTER", "otlp")])));
    }

    #[test]
    fn test_inject_without_span_is_empty() {
        let (traceparent, tracestate) = inject_trace_context();
        assert!(traceparent.is_empty());
        assert!(tracestate.is_empty());
    }
}
