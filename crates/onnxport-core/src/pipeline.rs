//! Pipeline orchestrator.
//!
//! Sequences the stages `Locating -> Loading -> Resolving -> Exporting ->
//! Verifying -> Done` for one model. Fatal stage failures end the run in
//! `Failed { stage }` with a remediation hint; quantization, sidecar, manifest
//! and verification problems are collected as warnings and never fail a run.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointResolver, LoadReport};
use crate::config::PathsConfig;
use crate::error::{ExportError, ResolutionError};
use crate::export::{ExportArtifact, ExportRequest, ExportWarning, Exporter};
use crate::locate::{ArtifactLocator, LocateRequest};
use crate::network::Fetch;
use crate::registry::{ArchitectureSpec, ModelSpec};
use crate::runtime::{install_hint, ModelRuntime};
use crate::verify::{GraphSummary, OnnxVerifier, Verification};

/// A working stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Locating,
    Loading,
    Resolving,
    Exporting,
    Verifying,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Locating => "locating",
            PipelineStage::Loading => "loading",
            PipelineStage::Resolving => "resolving",
            PipelineStage::Exporting => "exporting",
            PipelineStage::Verifying => "verifying",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state the pipeline passed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Locating,
    Loading,
    Resolving,
    Exporting,
    Verifying,
    Done,
    Failed { stage: PipelineStage },
}

impl From<PipelineStage> for PipelineState {
    fn from(stage: PipelineStage) -> Self {
        match stage {
            PipelineStage::Locating => PipelineState::Locating,
            PipelineStage::Loading => PipelineState::Loading,
            PipelineStage::Resolving => PipelineState::Resolving,
            PipelineStage::Exporting => PipelineState::Exporting,
            PipelineStage::Verifying => PipelineState::Verifying,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Locating => f.write_str("Locating"),
            PipelineState::Loading => f.write_str("Loading"),
            PipelineState::Resolving => f.write_str("Resolving"),
            PipelineState::Exporting => f.write_str("Exporting"),
            PipelineState::Verifying => f.write_str("Verifying"),
            PipelineState::Done => f.write_str("Done"),
            PipelineState::Failed { stage } => write!(f, "Failed({})", stage),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    Quantization,
    Verification,
    DynamicAxes,
    WeightMismatch,
    Sidecar,
    Manifest,
}

/// A non-fatal problem recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineWarning {
    pub kind: WarningKind,
    pub message: String,
}

impl PipelineWarning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<ExportWarning> for PipelineWarning {
    fn from(warning: ExportWarning) -> Self {
        match warning {
            ExportWarning::Quantization(m) => PipelineWarning::new(WarningKind::Quantization, m),
            ExportWarning::Sidecar(m) => PipelineWarning::new(WarningKind::Sidecar, m),
            ExportWarning::Manifest(m) => PipelineWarning::new(WarningKind::Manifest, m),
        }
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub model: String,
    pub success: bool,
    /// Serialized graph path. Only set when the run reached `Done`.
    pub artifact_path: Option<PathBuf>,
    pub artifact: Option<ExportArtifact>,
    pub failure_stage: Option<PipelineStage>,
    pub message: String,
    pub warnings: Vec<PipelineWarning>,
    /// Every state visited, in order, ending with `Done` or `Failed`.
    pub transitions: Vec<PipelineState>,
    pub load_report: Option<LoadReport>,
    pub remediation: Option<String>,
    pub graph: Option<GraphSummary>,
}

impl PipelineResult {
    pub fn final_state(&self) -> Option<PipelineState> {
        self.transitions.last().copied()
    }

    pub fn has_warning(&self, kind: WarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }
}

/// Per-run options. Unset fields fall back to the model spec.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub output_root: PathBuf,
    pub work_dir: PathBuf,
    pub allow_download: bool,
    pub opset: Option<u32>,
    pub quantize: Option<bool>,
    /// Explicit weights file. Bypasses candidate probing.
    pub model_path: Option<PathBuf>,
    /// Overrides the model's architecture definition.
    pub architecture: Option<ArchitectureSpec>,
    pub check_environment: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from(PathsConfig::DEFAULT_OUTPUT_ROOT),
            work_dir: PathBuf::from("."),
            allow_download: true,
            opset: None,
            quantize: None,
            model_path: None,
            architecture: None,
            check_environment: true,
        }
    }
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_downloads(mut self, allow: bool) -> Self {
        self.allow_download = allow;
        self
    }

    pub fn with_opset(mut self, opset: u32) -> Self {
        self.opset = Some(opset);
        self
    }

    pub fn with_quantize(mut self, quantize: bool) -> Self {
        self.quantize = Some(quantize);
        self
    }

    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    pub fn with_architecture(mut self, architecture: ArchitectureSpec) -> Self {
        self.architecture = Some(architecture);
        self
    }

    pub fn with_environment_check(mut self, check: bool) -> Self {
        self.check_environment = check;
        self
    }
}

struct StageFailure {
    stage: PipelineStage,
    message: String,
    remediation: Option<String>,
}

impl StageFailure {
    fn new(stage: PipelineStage, message: impl Into<String>, remediation: Option<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            remediation,
        }
    }
}

struct Completed {
    artifact: ExportArtifact,
    graph: Option<GraphSummary>,
}

/// Mutable record of a run in progress.
struct RunLog {
    model: String,
    transitions: Vec<PipelineState>,
    warnings: Vec<PipelineWarning>,
    load_report: Option<LoadReport>,
}

impl RunLog {
    fn new(model: String) -> Self {
        Self {
            model,
            transitions: Vec::new(),
            warnings: Vec::new(),
            load_report: None,
        }
    }

    fn enter(&mut self, state: impl Into<PipelineState>) {
        let state = state.into();
        info!("[{}] {}", self.model, state);
        self.transitions.push(state);
    }

    fn warn(&mut self, warning: PipelineWarning) {
        warn!("[{}] {:?} warning: {}", self.model, warning.kind, warning.message);
        self.warnings.push(warning);
    }

    fn finish(mut self, outcome: std::result::Result<Completed, StageFailure>) -> PipelineResult {
        match outcome {
            Ok(completed) => {
                self.enter(PipelineState::Done);
                let path = completed.artifact.model_path.clone();
                PipelineResult {
                    message: format!("exported {} to {}", self.model, path.display()),
                    model: self.model,
                    success: true,
                    artifact_path: Some(path),
                    artifact: Some(completed.artifact),
                    failure_stage: None,
                    warnings: self.warnings,
                    transitions: self.transitions,
                    load_report: self.load_report,
                    remediation: None,
                    graph: completed.graph,
                }
            }
            Err(failure) => {
                self.enter(PipelineState::Failed {
                    stage: failure.stage,
                });
                PipelineResult {
                    model: self.model,
                    success: false,
                    artifact_path: None,
                    artifact: None,
                    failure_stage: Some(failure.stage),
                    message: failure.message,
                    warnings: self.warnings,
                    transitions: self.transitions,
                    load_report: self.load_report,
                    remediation: failure.remediation,
                    graph: None,
                }
            }
        }
    }
}

/// Runs the full locate-to-verify pipeline for one model at a time.
pub struct ConversionPipeline {
    runtime: Arc<dyn ModelRuntime>,
    fetcher: Arc<dyn Fetch>,
}

impl ConversionPipeline {
    pub fn new(runtime: Arc<dyn ModelRuntime>, fetcher: Arc<dyn Fetch>) -> Self {
        Self { runtime, fetcher }
    }

    pub async fn run(&self, spec: &ModelSpec, options: &PipelineOptions) -> PipelineResult {
        let mut log = RunLog::new(spec.display_name());
        let outcome = self.execute(spec, options, &mut log).await;
        log.finish(outcome)
    }

    async fn execute(
        &self,
        spec: &ModelSpec,
        options: &PipelineOptions,
        log: &mut RunLog,
    ) -> std::result::Result<Completed, StageFailure> {
        let locator = ArtifactLocator::new(self.fetcher.clone(), &options.work_dir)
            .with_downloads(options.allow_download);

        log.enter(PipelineStage::Locating);
        let weights_path = match &options.model_path {
            Some(explicit) => {
                let resolved = locator.resolve_path(explicit);
                if !resolved.is_file() {
                    return Err(StageFailure::new(
                        PipelineStage::Locating,
                        format!("model path does not exist: {}", resolved.display()),
                        Some("Check the --model-path argument.".to_string()),
                    ));
                }
                resolved
            }
            None => {
                let request = LocateRequest {
                    identifier: spec.display_name(),
                    download_dir: spec.download_dir(),
                    instructions: spec.instructions.clone(),
                };
                locator
                    .locate(&request, &spec.candidates())
                    .await
                    .map_err(|e| {
                        StageFailure::new(PipelineStage::Locating, e.to_string(), Some(e.remediation()))
                    })?
                    .path
            }
        };

        log.enter(PipelineStage::Loading);
        if options.check_environment {
            match self.runtime.check_environment(&spec.requirements).await {
                Ok(missing) if !missing.is_empty() => {
                    let names: Vec<&str> = missing.iter().map(|p| p.module.as_str()).collect();
                    return Err(StageFailure::new(
                        PipelineStage::Loading,
                        format!("missing Python packages: {}", names.join(", ")),
                        Some(install_hint(&missing)),
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(StageFailure::new(
                        PipelineStage::Loading,
                        e.to_string(),
                        Some(format!(
                            "Check that the {} runtime is installed and on PATH.",
                            self.runtime.name()
                        )),
                    ));
                }
            }
        }
        let checkpoint = self
            .runtime
            .load_checkpoint(&weights_path)
            .await
            .map_err(|e| {
                StageFailure::new(
                    PipelineStage::Loading,
                    e.to_string(),
                    Some(format!(
                        "{} may be corrupt or incomplete. Delete it and run again.",
                        weights_path.display()
                    )),
                )
            })?;

        log.enter(PipelineStage::Resolving);
        let architecture = options.architecture.as_ref().or(spec.architecture.as_ref());
        let factory = architecture.map(|a| self.runtime.architecture_factory(a));
        let resolver = CheckpointResolver::new(spec.module_keys.as_slice());
        let resolved = resolver
            .resolve(checkpoint, spec.variant.as_deref(), factory.as_deref())
            .await
            .map_err(|e| {
                let hint = resolution_hint(&e, spec);
                StageFailure::new(PipelineStage::Resolving, e.to_string(), Some(hint))
            })?;
        info!("[{}] resolved module from {}", log.model, resolved.origin);
        for message in &resolved.warnings {
            log.warn(PipelineWarning::new(WarningKind::WeightMismatch, message.clone()));
        }
        if let Some(report) = &resolved.load_report {
            info!(
                "[{}] loaded {} tensors ({} missing, {} unexpected)",
                log.model,
                report.loaded,
                report.missing_keys.len(),
                report.unexpected_keys.len()
            );
        }
        log.load_report = resolved.load_report.clone();

        log.enter(PipelineStage::Exporting);
        let output_root = locator.resolve_path(&options.output_root);
        let request = ExportRequest {
            identifier: spec.display_name(),
            variant: spec.variant.clone(),
            inputs: spec.inputs.clone(),
            output_names: spec.output_names.clone(),
            dynamic_axes: spec.dynamic_axes.clone(),
            opset: options.opset.unwrap_or(spec.opset),
            model_dir: output_root.join(&spec.slug),
            quantize: options.quantize.unwrap_or(spec.quantize),
            sidecar_source: spec.sidecar_source.clone(),
            source_weights: Some(weights_path),
        };
        let exporter = Exporter::new(self.runtime.clone());
        let outcome = exporter
            .export(resolved.module.as_ref(), &request)
            .await
            .map_err(|e| {
                let hint = export_hint(&e);
                StageFailure::new(PipelineStage::Exporting, e.to_string(), Some(hint))
            })?;
        for warning in outcome.warnings {
            log.warn(warning.into());
        }

        log.enter(PipelineStage::Verifying);
        let graph = match OnnxVerifier::verify(&outcome.artifact.model_path).await {
            Verification::Valid(summary) => {
                info!(
                    "[{}] graph is valid: {} nodes, opset {:?}",
                    log.model,
                    summary.node_count,
                    summary.opset()
                );
                for problem in summary.check_dynamic_axes(&request.dynamic_axes) {
                    log.warn(PipelineWarning::new(WarningKind::DynamicAxes, problem));
                }
                Some(summary)
            }
            Verification::Invalid { detail } => {
                log.warn(PipelineWarning::new(WarningKind::Verification, detail));
                None
            }
        };

        Ok(Completed {
            artifact: outcome.artifact,
            graph,
        })
    }
}

fn resolution_hint(error: &ResolutionError, spec: &ModelSpec) -> String {
    match error {
        ResolutionError::MissingArchitecture { .. } => {
            "The checkpoint only holds weights. Pass --architecture module:callable \
             (and --architecture-kwargs) to rebuild the network."
                .to_string()
        }
        ResolutionError::VariantMismatch { found, .. } => format!(
            "Request variant {:?} or supply weights for the requested variant.",
            found
        ),
        ResolutionError::ArchitectureBuild { .. } if !spec.requirements.is_empty() => format!(
            "Make sure the architecture's dependencies are installed: {}",
            install_hint(&spec.requirements)
        ),
        ResolutionError::ArchitectureBuild { builder, .. } => {
            format!("Check that {} is importable by the runtime.", builder)
        }
        ResolutionError::UnresolvableShape { .. } => match (&spec.instructions, &spec.homepage) {
            (Some(instructions), _) => instructions.clone(),
            (None, Some(homepage)) => format!("Download the original weights from {}.", homepage),
            (None, None) => "Use a checkpoint that contains a module or weight state.".to_string(),
        },
    }
}

fn export_hint(error: &ExportError) -> String {
    match error {
        ExportError::InvalidRequest { .. } => {
            "Fix the model's input shapes, output names or dynamic axes.".to_string()
        }
        ExportError::Trace { .. } => {
            "Tracing failed inside the runtime. Run with --debug for its output, or try \
             another --opset."
                .to_string()
        }
        ExportError::Io { path, .. } => format!("Check that {} is writable.", path.display()),
    }
}
