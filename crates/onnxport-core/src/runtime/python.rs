//! [`ModelRuntime`] backed by a Python interpreter running the bridge script.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::bridge::{checkpoint_from_node, BridgeModule, ModuleNode, ModuleSource, Node};
use super::scripts::ensure_bridge_deployed;
use super::ModelRuntime;
use crate::checkpoint::{ArchitectureFactory, Checkpoint, Module};
use crate::config::PathsConfig;
use crate::error::{ExportError, OnnxportError, Result};
use crate::export::TraceRequest;
use crate::registry::{ArchitectureSpec, PackageRequirement};

/// Stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// One JSON line printed by the bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptLine {
    pub stage: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug)]
enum ScriptOutcome {
    Complete(Value),
    Failed(String),
    NoResult,
}

#[derive(Debug, Clone)]
pub struct PythonRuntime {
    python: PathBuf,
    script_dir: PathBuf,
    work_dir: PathBuf,
}

impl PythonRuntime {
    /// `script_dir` receives the deployed bridge; the interpreter runs in `work_dir`.
    pub fn new(
        python: impl Into<PathBuf>,
        script_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            python: python.into(),
            script_dir: script_dir.into(),
            work_dir: work_dir.into(),
        }
    }

    /// `python3` from `PATH`, with the bridge deployed under the user cache dir.
    pub fn with_defaults(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let script_dir = dirs::cache_dir()
            .map(|dir| dir.join(PathsConfig::BRIDGE_DIR_NAME))
            .unwrap_or_else(|| {
                work_dir
                    .join(PathsConfig::CACHE_DIR_NAME)
                    .join(PathsConfig::BRIDGE_DIR_NAME)
            });
        Self::new(PathsConfig::DEFAULT_PYTHON, script_dir, work_dir)
    }

    pub fn with_python(mut self, python: impl Into<PathBuf>) -> Self {
        self.python = python.into();
        self
    }

    pub fn python(&self) -> &Path {
        &self.python
    }

    /// Output of `python --version`.
    pub async fn interpreter_version(&self) -> Result<String> {
        let output = Command::new(&self.python)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        let text = if output.stdout.is_empty() {
            output.stderr
        } else {
            output.stdout
        };
        Ok(String::from_utf8_lossy(&text).trim().to_string())
    }

    /// Run one bridge command and return its `result` payload.
    pub async fn invoke(&self, command: &str, request: &Value) -> Result<Value> {
        let script = ensure_bridge_deployed(&self.script_dir)?;
        let payload = serde_json::to_string(request)?;
        debug!("bridge {} request: {} bytes", command, payload.len());

        let mut child = Command::new(&self.python)
            .arg(&script)
            .arg(command)
            .arg("--request")
            .arg(&payload)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child.stdout.take().ok_or_else(|| OnnxportError::Runtime {
            message: "bridge stdout was not captured".to_string(),
        })?;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(command.to_string(), stderr)));

        let outcome = read_script_lines(command, stdout).await;

        let status = child.wait().await.map_err(|e| OnnxportError::Runtime {
            message: format!("bridge {} process error: {}", command, e),
        })?;
        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        match outcome {
            ScriptOutcome::Complete(result) if status.success() => Ok(result),
            ScriptOutcome::Failed(message) => Err(OnnxportError::Runtime { message }),
            ScriptOutcome::Complete(_) | ScriptOutcome::NoResult => {
                let mut message = format!(
                    "bridge {} exited with status {} without a result",
                    command,
                    status.code().unwrap_or(-1)
                );
                if !stderr_tail.is_empty() {
                    message.push_str(":\n");
                    message.push_str(&stderr_tail.join("\n"));
                }
                Err(OnnxportError::Runtime { message })
            }
        }
    }

    fn spawn_error(&self, e: std::io::Error) -> OnnxportError {
        OnnxportError::Runtime {
            message: format!(
                "failed to start Python interpreter {}: {}",
                self.python.display(),
                e
            ),
        }
    }
}

/// Parse bridge stdout until it closes. Non-JSON lines are logged and skipped.
async fn read_script_lines<R: AsyncRead + Unpin>(command: &str, stdout: R) -> ScriptOutcome {
    let mut reader = BufReader::new(stdout).lines();
    let mut outcome = ScriptOutcome::NoResult;

    loop {
        match reader.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<ScriptLine>(&line) {
                Ok(script_line) => match script_line.stage.as_str() {
                    "complete" => {
                        outcome = ScriptOutcome::Complete(script_line.result.unwrap_or(Value::Null));
                    }
                    "error" => {
                        outcome = ScriptOutcome::Failed(
                            script_line
                                .message
                                .unwrap_or_else(|| format!("bridge {} failed", command)),
                        );
                    }
                    "loaded" => {
                        info!(
                            "[bridge {}] weights loaded: {}",
                            command,
                            script_line.message.unwrap_or_default()
                        );
                    }
                    stage => {
                        debug!(
                            "[bridge {}] {}: {}",
                            command,
                            stage,
                            script_line.message.unwrap_or_default()
                        );
                    }
                },
                Err(_) => debug!("Non-JSON bridge output: {}", line),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading bridge stdout: {}", e);
                break;
            }
        }
    }
    outcome
}

/// Log stderr at debug level, keeping the last few lines.
async fn drain_stderr<R: AsyncRead + Unpin>(command: String, stderr: R) -> Vec<String> {
    let mut reader = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                debug!("[bridge {}] stderr: {}", command, line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading bridge stderr: {}", e);
                break;
            }
        }
    }
    tail.into_iter().collect()
}

fn take_field<T: DeserializeOwned>(result: &mut Value, field: &str) -> Result<T> {
    let value = result
        .get_mut(field)
        .map(Value::take)
        .ok_or_else(|| OnnxportError::Runtime {
            message: format!("bridge result is missing {:?}", field),
        })?;
    Ok(serde_json::from_value(value)?)
}

/// Builds modules through the bridge `describe-architecture` command.
struct BridgeFactory {
    runtime: PythonRuntime,
    spec: ArchitectureSpec,
}

#[async_trait]
impl ArchitectureFactory for BridgeFactory {
    fn builder(&self) -> &str {
        &self.spec.builder
    }

    fn variant(&self) -> Option<&str> {
        self.spec.variant.as_deref()
    }

    async fn build(&self) -> std::result::Result<Box<dyn Module>, String> {
        let mut result = self
            .runtime
            .invoke("describe-architecture", &json!({ "architecture": self.spec }))
            .await
            .map_err(|e| e.to_string())?;
        let node: ModuleNode = take_field(&mut result, "module").map_err(|e| e.to_string())?;
        Ok(Box::new(BridgeModule::from_node(
            node,
            ModuleSource::Architecture {
                architecture: self.spec.clone(),
            },
            Vec::new(),
        )))
    }
}

#[async_trait]
impl ModelRuntime for PythonRuntime {
    fn name(&self) -> &str {
        "python"
    }

    async fn load_checkpoint(&self, path: &Path) -> Result<Checkpoint> {
        if !path.exists() {
            return Err(OnnxportError::FileNotFound(path.to_path_buf()));
        }
        let mut result = self.invoke("inspect", &json!({ "path": path })).await?;
        let node: Node = take_field(&mut result, "checkpoint")?;
        Ok(checkpoint_from_node(path, node))
    }

    fn architecture_factory(&self, spec: &ArchitectureSpec) -> Box<dyn ArchitectureFactory> {
        Box::new(BridgeFactory {
            runtime: self.clone(),
            spec: spec.clone(),
        })
    }

    async fn trace(
        &self,
        request: &TraceRequest<'_>,
        output: &Path,
    ) -> std::result::Result<(), ExportError> {
        let module = request
            .module
            .as_any()
            .downcast_ref::<BridgeModule>()
            .ok_or_else(|| ExportError::Trace {
                message: format!(
                    "module {} does not belong to the python runtime",
                    request.module.kind()
                ),
            })?;
        if module.has_unreplayable_state() {
            return Err(ExportError::Trace {
                message: "weight state was not read from a file and cannot be replayed".to_string(),
            });
        }

        let payload = json!({
            "plan": module.plan(),
            "inputs": request.inputs,
            "output_names": request.output_names,
            "dynamic_axes": request.dynamic_axes,
            "opset": request.opset,
            "output": output,
        });
        self.invoke("export", &payload)
            .await
            .map(|_| ())
            .map_err(|e| ExportError::Trace {
                message: e.to_string(),
            })
    }

    async fn save_auxiliary(&self, identifier: &str, dest_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut result = self
            .invoke("save-aux", &json!({ "identifier": identifier, "dest": dest_dir }))
            .await?;
        take_field(&mut result, "files")
    }

    async fn quantize(&self, input: &Path, output: &Path) -> Result<()> {
        self.invoke("quantize", &json!({ "input": input, "output": output }))
            .await?;
        Ok(())
    }

    async fn check_environment(
        &self,
        requirements: &[PackageRequirement],
    ) -> Result<Vec<PackageRequirement>> {
        if requirements.is_empty() {
            return Ok(Vec::new());
        }
        let mut result = self
            .invoke("check", &json!({ "requirements": requirements }))
            .await?;
        take_field(&mut result, "missing")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_script_lines_complete() {
        let output = b"{\"stage\":\"loading\",\"message\":\"a.pth\"}\nnot json\n{\"stage\":\"complete\",\"result\":{\"size\":3}}\n";
        match read_script_lines("export", &output[..]).await {
            ScriptOutcome::Complete(result) => assert_eq!(result["size"], 3),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_script_lines_error() {
        let output = b"{\"stage\":\"error\",\"message\":\"ModuleNotFoundError: basicsr\"}\n";
        match read_script_lines("inspect", &output[..]).await {
            ScriptOutcome::Failed(message) => assert!(message.contains("basicsr")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_script_lines_without_result() {
        let output = b"{\"stage\":\"tracing\"}\n";
        assert!(matches!(
            read_script_lines("export", &output[..]).await,
            ScriptOutcome::NoResult
        ));
    }

    #[tokio::test]
    async fn test_drain_stderr_keeps_tail() {
        let text: String = (0..30).map(|i| format!("line {}\n", i)).collect();
        let tail = drain_stderr("x".into(), text.as_bytes()).await;
        assert_eq!(tail.len(), STDERR_TAIL_LINES);
        assert_eq!(tail.last().map(String::as_str), Some("line 29"));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_runtime_error() {
        let temp = TempDir::new().unwrap();
        let runtime = PythonRuntime::new(
            temp.path().join("no-such-python"),
            temp.path().join("bridge"),
            temp.path(),
        );
        let err = runtime
            .check_environment(&[PackageRequirement::new("torch", "torch")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start Python interpreter"));
    }

    #[tokio::test]
    async fn test_check_environment_skips_empty_requirements() {
        let temp = TempDir::new().unwrap();
        let runtime = PythonRuntime::new(temp.path().join("no-such-python"), temp.path(), temp.path());
        assert!(runtime.check_environment(&[]).await.unwrap().is_empty());
    }

    #[cfg(unix)]
    fn fake_interpreter(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-python");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_parses_missing_packages() {
        let temp = TempDir::new().unwrap();
        let python = fake_interpreter(
            temp.path(),
            r#"echo '{"stage":"complete","result":{"missing":[{"module":"basicsr","install":"basicsr"}]}}'"#,
        );
        let runtime = PythonRuntime::new(python, temp.path().join("bridge"), temp.path());
        let missing = runtime
            .check_environment(&[
                PackageRequirement::new("torch", "torch"),
                PackageRequirement::new("basicsr", "basicsr"),
            ])
            .await
            .unwrap();
        assert_eq!(missing, vec![PackageRequirement::new("basicsr", "basicsr")]);
        assert!(temp.path().join("bridge").join(super::super::BRIDGE_SCRIPT_NAME).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_reports_bridge_error() {
        let temp = TempDir::new().unwrap();
        let python = fake_interpreter(
            temp.path(),
            "echo '{\"stage\":\"error\",\"message\":\"RuntimeError: boom\"}'\nexit 1",
        );
        let runtime = PythonRuntime::new(python, temp.path().join("bridge"), temp.path());
        let err = runtime
            .quantize(Path::new("a.onnx"), Path::new("b.onnx"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("RuntimeError: boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_reports_crash_with_stderr() {
        let temp = TempDir::new().unwrap();
        let python = fake_interpreter(temp.path(), "echo 'Segmentation fault' >&2\nexit 139");
        let runtime = PythonRuntime::new(python, temp.path().join("bridge"), temp.path());
        let err = runtime
            .invoke("inspect", &json!({ "path": "x.pth" }))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("without a result"));
        assert!(message.contains("Segmentation fault"));
    }
}
