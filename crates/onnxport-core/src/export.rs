//! Export stage: inference-mode module to a serialized ONNX graph.
//!
//! The stage validates the axis configuration, describes synthetic inputs,
//! hands tracing to the [`ModelRuntime`], and moves the graph into place
//! atomically. Sidecar files, quantization and the provenance manifest follow;
//! none of those can fail the export.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::Module;
use crate::config::{AppConfig, ExportConfig};
use crate::error::ExportError;
use crate::runtime::ModelRuntime;

/// Tensor name to {dimension index to symbolic name}.
pub type AxisConfig = BTreeMap<String, BTreeMap<usize, String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorDtype {
    #[default]
    Float32,
    Int64,
}

impl TensorDtype {
    /// ONNX `TensorProto.DataType` code.
    pub fn onnx_code(&self) -> i32 {
        match self {
            TensorDtype::Float32 => 1,
            TensorDtype::Int64 => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TensorDtype::Float32 => "float32",
            TensorDtype::Int64 => "int64",
        }
    }
}

/// A named graph input with the concrete shape used for tracing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub shape: Vec<usize>,
    #[serde(default)]
    pub dtype: TensorDtype,
}

impl InputSpec {
    pub fn new(name: impl Into<String>, shape: &[usize], dtype: TensorDtype) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            dtype,
        }
    }
}

/// How a synthetic input tensor is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputFill {
    /// Standard-normal values from the given seed.
    Random { seed: u64 },
    Constant { value: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticInput {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: TensorDtype,
    pub fill: InputFill,
}

impl SyntheticInput {
    /// Float inputs are random, integer inputs are filled with ones (a valid
    /// token id and a full attention mask).
    pub fn describe(spec: &InputSpec) -> Self {
        let fill = match spec.dtype {
            TensorDtype::Float32 => InputFill::Random {
                seed: rand::rng().random(),
            },
            TensorDtype::Int64 => InputFill::Constant { value: 1 },
        };
        Self {
            name: spec.name.clone(),
            shape: spec.shape.clone(),
            dtype: spec.dtype,
            fill,
        }
    }
}

/// Everything the runtime needs to trace a module.
pub struct TraceRequest<'a> {
    pub module: &'a dyn Module,
    pub inputs: Vec<SyntheticInput>,
    pub output_names: Vec<String>,
    pub dynamic_axes: AxisConfig,
    pub opset: u32,
}

/// Caller-side description of one export.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub identifier: String,
    pub variant: Option<String>,
    pub inputs: Vec<InputSpec>,
    pub output_names: Vec<String>,
    pub dynamic_axes: AxisConfig,
    pub opset: u32,
    /// `<outputRoot>/<modelSlug>`; the graph goes to `onnx/model.onnx` below it.
    pub model_dir: PathBuf,
    pub quantize: bool,
    /// Hub identifier whose tokenizer/config are saved next to the graph.
    pub sidecar_source: Option<String>,
    pub source_weights: Option<PathBuf>,
}

impl ExportRequest {
    pub fn onnx_dir(&self) -> PathBuf {
        self.model_dir.join(ExportConfig::ONNX_DIR_NAME)
    }

    pub fn model_path(&self) -> PathBuf {
        self.onnx_dir().join(ExportConfig::MODEL_FILE_NAME)
    }

    pub fn quantized_path(&self) -> PathBuf {
        self.onnx_dir().join(ExportConfig::QUANTIZED_FILE_NAME)
    }

    /// Check the axis configuration against the declared tensors.
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.inputs.is_empty() {
            return Err(invalid("at least one input is required"));
        }
        if self.output_names.is_empty() {
            return Err(invalid("at least one output name is required"));
        }

        let mut names = BTreeSet::new();
        for input in &self.inputs {
            if input.shape.is_empty() || input.shape.contains(&0) {
                return Err(invalid(format!(
                    "input '{}' has invalid shape {:?}",
                    input.name, input.shape
                )));
            }
            if !names.insert(input.name.as_str()) {
                return Err(invalid(format!("duplicate tensor name '{}'", input.name)));
            }
        }
        for output in &self.output_names {
            if !names.insert(output.as_str()) {
                return Err(invalid(format!("duplicate tensor name '{}'", output)));
            }
        }

        for (tensor, axes) in &self.dynamic_axes {
            if let Some(input) = self.inputs.iter().find(|i| &i.name == tensor) {
                if let Some(axis) = axes.keys().find(|axis| **axis >= input.shape.len()) {
                    return Err(invalid(format!(
                        "axis {} out of range for input '{}' of rank {}",
                        axis,
                        tensor,
                        input.shape.len()
                    )));
                }
            } else if !self.output_names.contains(tensor) {
                return Err(invalid(format!(
                    "dynamic axes name unknown tensor '{}'",
                    tensor
                )));
            }
            if let Some((axis, _)) = axes.iter().find(|(_, name)| name.trim().is_empty()) {
                return Err(invalid(format!(
                    "axis {} of '{}' has an empty symbolic name",
                    axis, tensor
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ExportError {
    ExportError::InvalidRequest {
        message: message.into(),
    }
}

/// Files produced by a successful export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportArtifact {
    pub model_path: PathBuf,
    pub quantized_path: Option<PathBuf>,
    pub sidecar_dir: PathBuf,
    pub sidecar_files: Vec<PathBuf>,
    pub manifest_path: Option<PathBuf>,
}

/// Non-fatal problems after the graph was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ExportWarning {
    Quantization(String),
    Sidecar(String),
    Manifest(String),
}

#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub artifact: ExportArtifact,
    pub warnings: Vec<ExportWarning>,
}

/// Provenance record written next to the sidecars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub identifier: String,
    pub variant: Option<String>,
    pub source_weights: Option<PathBuf>,
    pub opset: u32,
    pub inputs: Vec<InputSpec>,
    pub output_names: Vec<String>,
    pub dynamic_axes: AxisConfig,
    pub quantized: bool,
    pub sidecar_files: Vec<PathBuf>,
    pub created_at: String,
    pub tool: String,
}

pub struct Exporter {
    runtime: Arc<dyn ModelRuntime>,
}

impl Exporter {
    pub fn new(runtime: Arc<dyn ModelRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn export(
        &self,
        module: &dyn Module,
        request: &ExportRequest,
    ) -> Result<ExportOutcome, ExportError> {
        request.validate()?;

        let onnx_dir = request.onnx_dir();
        tokio::fs::create_dir_all(&onnx_dir)
            .await
            .map_err(|e| ExportError::io(&onnx_dir, e))?;

        // A quantized copy from an earlier run must not outlive a new graph.
        let stale = request.quantized_path();
        match tokio::fs::remove_file(&stale).await {
            Ok(()) => debug!("Removed stale {}", stale.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ExportError::io(&stale, e)),
        }

        let model_path = request.model_path();
        self.trace_to(module, request, &model_path).await?;
        info!("Exported graph to {}", model_path.display());

        let mut warnings = Vec::new();

        let sidecar_files = match &request.sidecar_source {
            Some(source) => match self.runtime.save_auxiliary(source, &request.model_dir).await {
                Ok(files) => {
                    debug!("Saved {} sidecar files", files.len());
                    files
                }
                Err(e) => {
                    warn!("Could not save sidecar files: {}", e);
                    warnings.push(ExportWarning::Sidecar(e.to_string()));
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let quantized_path = if request.quantize {
            let target = request.quantized_path();
            match self.runtime.quantize(&model_path, &target).await {
                Ok(()) if target.is_file() => {
                    info!("Quantized graph written to {}", target.display());
                    Some(target)
                }
                Ok(()) => {
                    let message = format!("quantizer produced no file at {}", target.display());
                    warn!("{}", message);
                    warnings.push(ExportWarning::Quantization(message));
                    None
                }
                Err(e) => {
                    warn!("Quantization failed, keeping the full-precision graph: {}", e);
                    let _ = tokio::fs::remove_file(&target).await;
                    warnings.push(ExportWarning::Quantization(e.to_string()));
                    None
                }
            }
        } else {
            None
        };

        let manifest = ExportManifest {
            identifier: request.identifier.clone(),
            variant: request.variant.clone(),
            source_weights: request.source_weights.clone(),
            opset: request.opset,
            inputs: request.inputs.clone(),
            output_names: request.output_names.clone(),
            dynamic_axes: request.dynamic_axes.clone(),
            quantized: quantized_path.is_some(),
            sidecar_files: sidecar_files.clone(),
            created_at: Utc::now().to_rfc3339(),
            tool: format!("{} {}", AppConfig::APP_NAME, AppConfig::VERSION),
        };
        let manifest_path = request.model_dir.join(ExportConfig::MANIFEST_FILE_NAME);
        let manifest_path = match write_manifest(&manifest, &manifest_path).await {
            Ok(()) => Some(manifest_path),
            Err(e) => {
                warn!("Could not write export manifest: {}", e);
                warnings.push(ExportWarning::Manifest(e.to_string()));
                None
            }
        };

        Ok(ExportOutcome {
            artifact: ExportArtifact {
                model_path,
                quantized_path,
                sidecar_dir: request.model_dir.clone(),
                sidecar_files,
                manifest_path,
            },
            warnings,
        })
    }

    /// Trace into a temp file beside `model_path`, then rename over it.
    async fn trace_to(
        &self,
        module: &dyn Module,
        request: &ExportRequest,
        model_path: &Path,
    ) -> Result<(), ExportError> {
        let trace = TraceRequest {
            module,
            inputs: request.inputs.iter().map(SyntheticInput::describe).collect(),
            output_names: request.output_names.clone(),
            dynamic_axes: request.dynamic_axes.clone(),
            opset: request.opset,
        };

        let temp_path = temp_sibling(model_path);
        if let Err(e) = self.runtime.trace(&trace, &temp_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }

        let size = tokio::fs::metadata(&temp_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if size == 0 {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(ExportError::Trace {
                message: "tracer produced an empty graph".to_string(),
            });
        }

        tokio::fs::rename(&temp_path, model_path).await.map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            ExportError::io(model_path, e)
        })
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
}

async fn write_manifest(manifest: &ExportManifest, path: &Path) -> Result<(), ExportError> {
    let json = serde_json::to_string_pretty(manifest).map_err(|e| ExportError::InvalidRequest {
        message: format!("manifest serialization failed: {}", e),
    })?;
    let temp = temp_sibling(path);
    tokio::fs::write(&temp, json)
        .await
        .map_err(|e| ExportError::io(&temp, e))?;
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|e| ExportError::io(path, e))
}
