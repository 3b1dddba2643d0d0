//! Neural-network runtime collaborator.
//!
//! Deserializing checkpoints, building architectures, tracing and quantizing
//! all happen in an external runtime reached through [`ModelRuntime`]. The
//! shipped implementation drives a Python interpreter ([`PythonRuntime`]).

mod bridge;
mod python;
mod scripts;

pub use bridge::{BridgeModule, ModuleSource, StateRef};
pub use python::{PythonRuntime, ScriptLine};
pub use scripts::{content_hash, ensure_bridge_deployed, BRIDGE_SCRIPT, BRIDGE_SCRIPT_NAME};

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::checkpoint::{ArchitectureFactory, Checkpoint};
use crate::error::{ExportError, Result};
use crate::export::TraceRequest;
use crate::registry::{ArchitectureSpec, PackageRequirement};

#[async_trait]
pub trait ModelRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Deserialize a checkpoint file.
    async fn load_checkpoint(&self, path: &Path) -> Result<Checkpoint>;

    /// A factory building empty modules from `spec`.
    fn architecture_factory(&self, spec: &ArchitectureSpec) -> Box<dyn ArchitectureFactory>;

    /// Trace `request.module` and write the serialized graph to `output`.
    async fn trace(&self, request: &TraceRequest<'_>, output: &Path) -> std::result::Result<(), ExportError>;

    /// Save the tokenizer/config of hub model `identifier` into `dest_dir`.
    /// Returns the files written.
    async fn save_auxiliary(&self, identifier: &str, dest_dir: &Path) -> Result<Vec<PathBuf>>;

    /// Write a dynamically quantized copy of `input` to `output`.
    async fn quantize(&self, input: &Path, output: &Path) -> Result<()>;

    /// The subset of `requirements` that cannot be imported.
    async fn check_environment(
        &self,
        requirements: &[PackageRequirement],
    ) -> Result<Vec<PackageRequirement>>;
}

/// `pip install ...` line for missing packages. Names with extras are quoted.
pub fn install_hint(missing: &[PackageRequirement]) -> String {
    let names: Vec<String> = missing
        .iter()
        .map(|p| {
            if p.install.contains('[') {
                format!("\"{}\"", p.install)
            } else {
                p.install.clone()
            }
        })
        .collect();
    format!("pip install {}", names.join(" "))
}
