use std::collections::HashMap;

use opentelemetry::Context;
use opentelemetry::global;

use crate::envelope::Envelope;

/// Writes the current trace context into `metadata` using the global propagator.
pub fn inject(metadata: &mut HashMap<String, String>) {
    inject_context(&Context::current(), metadata);
}

/// Writes `cx` into `metadata` using the global propagator.
pub fn inject_context(cx: &Context, metadata: &mut HashMap<String, String>) {
    global::get_text_map_propagator(|propagator| propagator.inject_context(cx, metadata));
}

/// Reads a trace context out of `metadata`.
#[must_use]
pub fn extract(metadata: &HashMap<String, String>) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(metadata))
}

impl Envelope {
    /// The upstream trace context carried by this envelope.
    #[must_use]
    pub fn trace_context(&self) -> Context {
        extract(self.metadata())
    }
}
