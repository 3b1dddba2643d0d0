//! onnxport core - locate, resolve and export pretrained checkpoints to ONNX.
//!
//! A single table-driven pipeline replaces per-model conversion scripts: a
//! [`ModelSpec`] says where the weights live and how the graph should look, and
//! [`ConversionPipeline`] walks it through locating, loading, resolving,
//! exporting and verifying.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use onnxport_core::{ConversionPipeline, HttpFetcher, ModelRegistry, PipelineOptions, PythonRuntime};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> onnxport_core::Result<()> {
//!     let registry = ModelRegistry::builtin();
//!     let spec = registry.lookup("realesrgan", Some("x4plus"))?;
//!
//!     let pipeline = ConversionPipeline::new(
//!         Arc::new(PythonRuntime::with_defaults(".")),
//!         Arc::new(HttpFetcher::new()?),
//!     );
//!     let result = pipeline.run(spec, &PipelineOptions::new()).await;
//!     println!("{}", result.message);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod export;
pub mod locate;
pub mod network;
pub mod pipeline;
pub mod registry;
pub mod runtime;
pub mod verify;

// Re-export commonly used types
pub use checkpoint::{
    ArchitectureFactory, Checkpoint, CheckpointResolver, CheckpointValue, Container, LoadReport,
    Module, ResolvedModule, TensorInfo, WeightState,
};
pub use error::{ExportError, FetchError, OnnxportError, ResolutionError, Result};
pub use export::{
    AxisConfig, ExportArtifact, ExportRequest, Exporter, InputSpec, SyntheticInput, TensorDtype,
    TraceRequest,
};
pub use locate::{ArtifactLocator, ArtifactNotFound, LocateRequest, LocatedArtifact, SourceCandidate, SourceKind};
pub use network::{DownloadProgress, Fetch, HttpClient, HttpFetcher, RetryConfig};
pub use pipeline::{
    ConversionPipeline, PipelineOptions, PipelineResult, PipelineStage, PipelineState,
    PipelineWarning, WarningKind,
};
pub use registry::{ArchitectureSpec, ModelRegistry, ModelSpec, PackageRequirement};
pub use runtime::{ModelRuntime, PythonRuntime};
pub use verify::{Dim, GraphSummary, OnnxVerifier, Verification};
