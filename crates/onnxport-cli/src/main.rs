//! onnxport - export pretrained model checkpoints to ONNX.
//!
//! Thin command-line front end over `onnxport-core`. Results go to stdout,
//! logs to stderr.

mod commands;

use anyhow::Result;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "onnxport")]
#[command(about = "Locate, resolve and export pretrained checkpoints to ONNX", version)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a model to ONNX
    Convert(ConvertArgs),

    /// List known model families and variants
    List {
        /// Additional model definitions (JSON object or array)
        #[arg(long)]
        registry: Option<PathBuf>,

        /// Print definitions as JSON
        #[arg(long)]
        json: bool,
    },

    /// Structurally verify an exported ONNX file
    Verify {
        path: PathBuf,

        /// Print the graph summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check the Python runtime and its packages
    Doctor {
        /// Only check packages needed by this model family
        model: Option<String>,

        #[arg(long, env = "ONNXPORT_PYTHON")]
        python: Option<PathBuf>,

        #[arg(long)]
        registry: Option<PathBuf>,
    },
}

#[derive(ClapArgs, Debug)]
struct ConvertArgs {
    /// Model family identifier (see `onnxport list`)
    model: String,

    #[arg(long)]
    variant: Option<String>,

    /// Use this weights file instead of probing known locations
    #[arg(long)]
    model_path: Option<PathBuf>,

    #[arg(long)]
    opset: Option<u32>,

    /// Also write a dynamically quantized copy
    #[arg(long, conflicts_with = "no_quantize")]
    quantize: bool,

    #[arg(long)]
    no_quantize: bool,

    #[arg(long, default_value = "./models")]
    output_root: PathBuf,

    /// Never download; only use local files
    #[arg(long)]
    no_download: bool,

    /// Architecture builder, `module.path:callable`
    #[arg(long)]
    architecture: Option<String>,

    /// JSON object of keyword arguments for the architecture builder
    #[arg(long, requires = "architecture")]
    architecture_kwargs: Option<String>,

    /// Additional model definitions (JSON object or array)
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Python interpreter with torch installed
    #[arg(long, env = "ONNXPORT_PYTHON")]
    python: Option<PathBuf>,

    /// Skip the Python package check
    #[arg(long)]
    skip_checks: bool,

    /// Print the pipeline result as JSON
    #[arg(long)]
    json: bool,
}

fn init_logging(debug: bool, json: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .json()
            .init();
    } else {
        FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.debug, args.json_logs);

    match args.command {
        Command::Convert(convert) => commands::convert(convert).await,
        Command::List { registry, json } => commands::list(registry.as_deref(), json),
        Command::Verify { path, json } => commands::verify(&path, json).await,
        Command::Doctor {
            model,
            python,
            registry,
        } => commands::doctor(model.as_deref(), python, registry.as_deref()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_convert() {
        let args = Args::try_parse_from([
            "onnxport",
            "convert",
            "realesrgan",
            "--variant",
            "x4plus",
            "--opset",
            "17",
            "--no-download",
            "--debug",
        ])
        .unwrap();
        assert!(args.debug);
        let Command::Convert(convert) = args.command else {
            panic!("expected convert");
        };
        assert_eq!(convert.model, "realesrgan");
        assert_eq!(convert.variant.as_deref(), Some("x4plus"));
        assert_eq!(convert.opset, Some(17));
        assert!(convert.no_download);
        assert_eq!(convert.output_root, PathBuf::from("./models"));
    }

    #[test]
    fn test_quantize_flags_conflict() {
        let result = Args::try_parse_from([
            "onnxport",
            "convert",
            "ai-detector",
            "--quantize",
            "--no-quantize",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_architecture_kwargs_require_builder() {
        let result = Args::try_parse_from([
            "onnxport",
            "convert",
            "fbcnn",
            "--architecture-kwargs",
            "{}",
        ]);
        assert!(result.is_err());
    }
}
