//! OTel internals: tracing layer, W3C propagation, and sampling.

use std::collections::HashMap;

use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
    TracerProvider as _,
};
use opentelemetry::{Context, KeyValue, global};
use opentelemetry_otlp::{ExporterBuildError, SpanExporter};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider, ShouldSample, SpanLimits};
use tracing_opentelemetry::OpenTelemetryLayer;

/// Guard that shuts down the OTel tracer provider on drop, flushing pending spans.
pub struct OtelGuard {
    provider: SdkTracerProvider,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("OTel shutdown error: {e}");
        }
    }
}

/// Build an OpenTelemetry tracing layer and guard.
///
/// The layer plugs into `tracing_subscriber::registry()`. The guard must be
/// held alive for the lifetime of the process to ensure spans are flushed.
///
/// Must be called from inside a Tokio runtime: the tonic exporter and the
/// batch span processor spawn onto it.
pub fn otel_layer<S>(
    service_name: &str,
) -> Result<
    (
        OpenTelemetryLayer<S, opentelemetry_sdk::trace::SdkTracer>,
        OtelGuard,
    ),
    ExporterBuildError,
>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let exporter = SpanExporter::builder().with_tonic().build()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(MirrorfsSampler)
        .with_resource(resource)
        .with_span_limits(SpanLimits::default())
        .build();

    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer("mirrorfs");
    let layer = tracing_opentelemetry::layer().with_tracer(tracer);

    Ok((layer, OtelGuard { provider }))
}

// ============================================================================
// W3C Trace Context propagation
// ============================================================================

/// Inject the current span's trace context as W3C `traceparent` + `tracestate`.
pub(crate) fn inject_trace_context_impl() -> (String, String) {
    use opentelemetry::propagation::TextMapPropagator;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let cx = tracing::Span::current().context();
    let propagator = TraceContextPropagator::new();

    let mut carrier = HashMap::new();
    propagator.inject_context(&cx, &mut carrier);

    let traceparent = carrier.remove("traceparent").unwrap_or_default();
    let tracestate = carrier.remove("tracestate").unwrap_or_default();
    (traceparent, tracestate)
}

/// Extract a remote trace context and return a tracing span linked to it.
pub(crate) fn extract_trace_context_impl(
    traceparent: &str,
    tracestate: &str,
    method: &'static str,
) -> tracing::Span {
    use opentelemetry::propagation::TextMapPropagator;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let span = tracing::info_span!("rpc.request", method);
    if traceparent.is_empty() {
        return span;
    }

    let mut carrier = HashMap::new();
    carrier.insert("traceparent".to_string(), traceparent.to_string());
    if !tracestate.is_empty() {
        carrier.insert("tracestate".to_string(), tracestate.to_string());
    }

    let propagator = TraceContextPropagator::new();
    let cx = propagator.extract(&carrier);
    span.set_parent(cx);
    span
}

// ============================================================================
// MirrorfsSampler: differentiated sampling by span category
// ============================================================================

/// Custom sampler with differentiated rates by span name prefix.
///
/// | Prefix        | Rate | Rationale                                 |
/// |---------------|------|-------------------------------------------|
/// | `mount.*`     | 100% | Session lifecycle, rare                   |
/// | `serve.*`     | 100% | Connection lifecycle, rare                |
/// | `rpc.*`       | 10%  | One per remote call                       |
/// | `fs.*`        |  1%  | One per kernel operation, very high volume |
/// | errors        | 100% | Always capture failures                   |
/// | other         | 10%  | Default for unclassified spans            |
#[derive(Debug, Clone)]
struct MirrorfsSampler;

impl ShouldSample for MirrorfsSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        // If parent is sampled, always sample (maintain trace continuity)
        if let Some(cx) = parent_context {
            let parent_span = cx.span();
            let parent_ctx = parent_span.span_context();
            if parent_ctx.is_sampled() {
                return SamplingResult {
                    decision: SamplingDecision::RecordAndSample,
                    attributes: vec![],
                    trace_state: parent_ctx.trace_state().clone(),
                };
            }
        }

        let is_error = attributes.iter().any(|kv| {
            (kv.key.as_str() == "otel.status_code" && kv.value.as_str() == "ERROR")
                || (kv.key.as_str() == "error" && kv.value.as_str() == "true")
        });

        if is_error {
            return SamplingResult {
                decision: SamplingDecision::RecordAndSample,
                attributes: vec![],
                trace_state: TraceState::default(),
            };
        }

        Sampler::TraceIdRatioBased(sample_rate(name)).should_sample(
            parent_context,
            trace_id,
            name,
            span_kind,
            attributes,
            links,
        )
    }
}

fn sample_rate(name: &str) -> f64 {
    if name.starts_with("mount") || name.starts_with("serve") {
        1.0
    } else if name.starts_with("fs") {
        0.01
    } else {
        0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rates() {
        assert_eq!(sample_rate("mount.session"), 1.0);
        assert_eq!(sample_rate("serve.connection"), 1.0);
        assert_eq!(sample_rate("rpc.request"), 0.1);
        assert_eq!(sample_rate("fs.lookup"), 0.01);
        assert_eq!(sample_rate("misc"), 0.1);
    }

    #[test]
    fn test_extract_without_parent() {
        let span = extract_trace_context_impl("", "", "fileInfo");
        // No subscriber installed, so the span is disabled but still valid to enter.
        let _entered = span.enter();
    }
}
