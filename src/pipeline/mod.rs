//! Processing collaborator seam.
//!
//! Workers hand each decoded attachment to a [`ProcessingPipeline`] and the
//! terminal outcome to a [`ResultSink`]. Both are injected at construction.
//! The default pipeline consults an ordered [`ProcessorRegistry`].

pub mod registry;
pub mod sink;
pub mod types;

pub use registry::{ExtractedContent, ExtractionPipeline, Processor, ProcessorRegistry};
pub use sink::{CompositeSink, MemoryResultSink};
pub use types::{ItemContext, Outcome, PipelineOutput, ProcessingPipeline, ProcessingResult, ResultSink};
