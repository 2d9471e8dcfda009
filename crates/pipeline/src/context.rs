//! Per-event mutable state threaded through every hook.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use conduit_core::{Event, EventId};

/// Output of the model call (or of a short-circuiting stage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub text: String,
}

impl ModelOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseSource {
    Model,
    ShortCircuit { stage: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineResponse {
    pub output: ModelOutput,
    pub source: ResponseSource,
}

impl PipelineResponse {
    pub fn is_short_circuit(&self) -> bool {
        matches!(self.source, ResponseSource::ShortCircuit { .. })
    }
}

/// A message a stage wants published once the run succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination: String,
    pub payload: Vec<u8>,
}

/// Mutable state for one pipeline run.
///
/// Holds the original event (read-only), typed fields derived by stages, the
/// response, queued outbound messages, source metadata tags used to annotate
/// failures, and a side-effect log. Created per run, dropped after.
pub struct PipelineContext {
    event: Event,
    delivery_count: u32,
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    response: Option<PipelineResponse>,
    outbound: Vec<OutboundMessage>,
    source_metadata: BTreeMap<String, String>,
    side_effects: Vec<String>,
}

impl PipelineContext {
    pub fn new(event: Event, delivery_count: u32) -> Self {
        Self {
            event,
            delivery_count,
            extensions: HashMap::new(),
            response: None,
            outbound: Vec::new(),
            source_metadata: BTreeMap::new(),
            side_effects: Vec::new(),
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn event_id(&self) -> &EventId {
        self.event.id()
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Store a derived value, keyed by its type. Returns the previous value.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.extensions
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.extensions
            .get_mut(&TypeId::of::<T>())
            .and_then(|b| b.downcast_mut::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.extensions
            .remove(&TypeId::of::<T>())
            .and_then(|b| b.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn response(&self) -> Option<&PipelineResponse> {
        self.response.as_ref()
    }

    /// Replace the response. After-hooks may rewrite the model output.
    pub fn set_response(&mut self, response: PipelineResponse) {
        self.response = Some(response);
    }

    /// Queue a message for publication after a successful run.
    pub fn send(&mut self, destination: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.outbound.push(OutboundMessage {
            destination: destination.into(),
            payload: payload.into(),
        });
    }

    pub fn outbound(&self) -> &[OutboundMessage] {
        &self.outbound
    }

    pub fn take_outbound(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.outbound)
    }

    /// Attach a tag that travels with any failure raised during this run.
    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.source_metadata.insert(key.into(), value.into());
    }

    pub fn source_metadata(&self) -> &BTreeMap<String, String> {
        &self.source_metadata
    }

    /// Note an external effect for diagnostics.
    pub fn record_side_effect(&mut self, description: impl Into<String>) {
        self.side_effects.push(description.into());
    }

    pub fn side_effects(&self) -> &[String] {
        &self.side_effects
    }
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("event_id", self.event.id())
            .field("delivery_count", &self.delivery_count)
            .field("extensions", &self.extensions.len())
            .field("response", &self.response)
            .field("outbound", &self.outbound.len())
            .field("source_metadata", &self.source_metadata)
            .field("side_effects", &self.side_effects)
            .finish()
    }
}
