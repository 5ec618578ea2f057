/// Market event normalization and subscriber fan-out
pub mod normalizer;
pub mod pipeline;

pub use normalizer::Normalizer;
pub use pipeline::{
    ingress_channel, EventSubscription, Ingress, PipelineError, PipelineHandle, SignalPipeline,
};
