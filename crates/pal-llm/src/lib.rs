//! Streaming client for the Anthropic Messages API.
//!
//! [`StreamPipeline`] issues a request, decodes the SSE body and publishes
//! [`StreamIncrement`](pal_core::stream::StreamIncrement)s through the
//! [`IncrementBroadcaster`]. [`Verifier`] checks a key and lists models.

pub mod api;
pub mod broadcast;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod relay;
pub mod service;
pub mod sse;
pub mod verify;

pub use broadcast::{IncrementBroadcaster, StreamView};
pub use models::ModelDescriptor;
pub use pipeline::{Completion, PipelineConfig, StartSignal, StreamHandle, StreamPipeline};
pub use registry::StreamRegistry;
pub use service::HostService;
pub use verify::Verifier;
