//! Subcommand handlers.

use anyhow::{Context, Result};
use onnxport_core::registry::ArchitectureSpec;
use onnxport_core::runtime::install_hint;
use onnxport_core::{
    ConversionPipeline, DownloadProgress, HttpFetcher, ModelRegistry, ModelRuntime, OnnxVerifier,
    PackageRequirement, PipelineOptions, PipelineResult, PythonRuntime, Verification,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::ConvertArgs;

fn load_registry(extra: Option<&Path>) -> Result<ModelRegistry> {
    let mut registry = ModelRegistry::builtin();
    if let Some(path) = extra {
        let count = registry
            .extend_from_json_file(path)
            .with_context(|| format!("failed to load model definitions from {}", path.display()))?;
        info!("Loaded {} model definitions from {}", count, path.display());
    }
    Ok(registry)
}

fn python_runtime(work_dir: &Path, python: Option<PathBuf>) -> PythonRuntime {
    let runtime = PythonRuntime::with_defaults(work_dir);
    match python {
        Some(python) => runtime.with_python(python),
        None => runtime,
    }
}

pub async fn convert(args: ConvertArgs) -> Result<ExitCode> {
    let registry = load_registry(args.registry.as_deref())?;
    let spec = registry.lookup(&args.model, args.variant.as_deref())?;
    let work_dir = std::env::current_dir().context("cannot determine the working directory")?;

    let mut options = PipelineOptions::new()
        .with_work_dir(&work_dir)
        .with_output_root(&args.output_root)
        .with_downloads(!args.no_download)
        .with_environment_check(!args.skip_checks);
    if let Some(opset) = args.opset {
        options = options.with_opset(opset);
    }
    if args.quantize {
        options = options.with_quantize(true);
    } else if args.no_quantize {
        options = options.with_quantize(false);
    }
    if let Some(path) = &args.model_path {
        options = options.with_model_path(path);
    }
    if let Some(builder) = args.architecture {
        let kwargs = match &args.architecture_kwargs {
            Some(text) => serde_json::from_str(text)
                .context("--architecture-kwargs must be a JSON object")?,
            None => serde_json::Map::new(),
        };
        options = options.with_architecture(ArchitectureSpec {
            builder,
            kwargs,
            variant: None,
            python_path: Vec::new(),
        });
    }

    let (progress_tx, progress_rx) = mpsc::channel(16);
    let progress_task = tokio::spawn(log_download_progress(progress_rx));
    let fetcher = HttpFetcher::new()?.with_progress(progress_tx);

    let pipeline = ConversionPipeline::new(
        Arc::new(python_runtime(&work_dir, args.python)),
        Arc::new(fetcher),
    );
    let result = pipeline.run(spec, &options).await;
    // Dropping the pipeline closes the progress channel.
    drop(pipeline);
    let _ = progress_task.await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn log_download_progress(mut rx: mpsc::Receiver<DownloadProgress>) {
    while let Some(progress) = rx.recv().await {
        let speed_mb = progress.speed_bytes_per_sec / (1024.0 * 1024.0);
        match progress.percent {
            Some(percent) => info!(
                "Downloading: {:.1}% ({} bytes, {:.1} MB/s)",
                percent, progress.bytes_downloaded, speed_mb
            ),
            None => info!(
                "Downloading: {} bytes ({:.1} MB/s)",
                progress.bytes_downloaded, speed_mb
            ),
        }
    }
}

fn print_result(result: &PipelineResult) {
    let states: Vec<String> = result.transitions.iter().map(|s| s.to_string()).collect();
    println!("{}: {}", result.model, states.join(" -> "));

    if let Some(report) = &result.load_report {
        println!(
            "  weights: {} loaded, {} missing, {} unexpected",
            report.loaded,
            report.missing_keys.len(),
            report.unexpected_keys.len()
        );
    }
    if let Some(artifact) = &result.artifact {
        println!("  model:     {}", artifact.model_path.display());
        if let Some(quantized) = &artifact.quantized_path {
            println!("  quantized: {}", quantized.display());
        }
        for file in &artifact.sidecar_files {
            println!("  sidecar:   {}", file.display());
        }
    }
    for warning in &result.warnings {
        println!("  warning ({:?}): {}", warning.kind, warning.message);
    }

    if result.success {
        println!("{}", result.message);
    } else {
        println!("error: {}", result.message);
        if let Some(remediation) = &result.remediation {
            println!();
            println!("{}", remediation);
        }
    }
}

pub fn list(registry: Option<&Path>, json: bool) -> Result<ExitCode> {
    let registry = load_registry(registry)?;
    if json {
        println!("{}", serde_json::to_string_pretty(registry.specs())?);
        return Ok(ExitCode::SUCCESS);
    }

    for spec in registry.specs() {
        let shapes: Vec<String> = spec
            .inputs
            .iter()
            .map(|input| format!("{}{:?}", input.name, input.shape))
            .collect();
        println!(
            "{:<14} {:<48} {}",
            spec.identifier,
            spec.variant.as_deref().unwrap_or("-"),
            shapes.join(" ")
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn verify(path: &Path, json: bool) -> Result<ExitCode> {
    match OnnxVerifier::verify(path).await {
        Verification::Valid(summary) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "valid: ir_version {}, opset {}, {} nodes, {} initializers",
                    summary.ir_version,
                    summary
                        .opset()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "-".into()),
                    summary.node_count,
                    summary.initializer_count
                );
                for (label, signatures) in [("input", &summary.inputs), ("output", &summary.outputs)] {
                    for signature in signatures {
                        let dims: Vec<String> = signature.dims.iter().map(|d| d.to_string()).collect();
                        println!(
                            "  {} {}: {} [{}]",
                            label,
                            signature.name,
                            signature.elem_type,
                            dims.join(", ")
                        );
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Verification::Invalid { detail } => {
            println!("invalid: {}", detail);
            Ok(ExitCode::FAILURE)
        }
    }
}

pub async fn doctor(
    model: Option<&str>,
    python: Option<PathBuf>,
    registry: Option<&Path>,
) -> Result<ExitCode> {
    let registry = load_registry(registry)?;
    let work_dir = std::env::current_dir().context("cannot determine the working directory")?;
    let runtime = python_runtime(&work_dir, python);

    let version = runtime
        .interpreter_version()
        .await
        .with_context(|| format!("cannot run {}", runtime.python().display()))?;
    println!("interpreter: {} ({})", runtime.python().display(), version);

    let mut requirements: Vec<PackageRequirement> = Vec::new();
    for spec in registry.specs() {
        if model.is_some_and(|m| m != spec.identifier) {
            continue;
        }
        for requirement in &spec.requirements {
            if !requirements.iter().any(|r| r.module == requirement.module) {
                requirements.push(requirement.clone());
            }
        }
    }
    if requirements.is_empty() {
        if let Some(model) = model {
            registry.lookup(model, None)?;
        }
        println!("no Python packages required");
        return Ok(ExitCode::SUCCESS);
    }

    let missing = runtime.check_environment(&requirements).await?;
    for requirement in &requirements {
        let status = if missing.contains(requirement) {
            "missing"
        } else {
            "ok"
        };
        println!("  {:<24} {}", requirement.module, status);
    }

    if missing.is_empty() {
        println!("all packages available");
        Ok(ExitCode::SUCCESS)
    } else {
        println!();
        println!("{}", install_hint(&missing));
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_registry_with_extra_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("models.json");
        std::fs::write(
            &path,
            r#"{"identifier":"custom","slug":"custom","inputs":[{"name":"input","shape":[1,3,64,64]}]}"#,
        )
        .unwrap();

        let registry = load_registry(Some(&path)).unwrap();
        assert!(registry.lookup("custom", None).is_ok());
        assert!(registry.lookup("realesrgan", None).is_ok());
    }

    #[test]
    fn test_load_registry_reports_bad_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.json");
        std::fs::write(&path, "not json").unwrap();

        let err = load_registry(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
