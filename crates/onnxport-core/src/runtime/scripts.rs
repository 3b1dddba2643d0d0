//! Embedded Python bridge script and deployment.
//!
//! The bridge is stored as a string constant and written to disk on first use
//! or when the embedded version changes (detected via hash comparison).
//!
//! Protocol: `python onnxport_bridge.py <command> --request '<json>'`. Every
//! stdout line is a JSON object with a `stage` field. The last one is either
//! `{"stage": "complete", "result": ...}` or `{"stage": "error", "message": ...}`.

use crate::error::IoResultExt;
use crate::Result;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::info;

pub const BRIDGE_SCRIPT_NAME: &str = "onnxport_bridge.py";

/// Python side of the runtime bridge.
pub const BRIDGE_SCRIPT: &str = r#"#!/usr/bin/env python3
"""onnxport runtime bridge.

Runs one command per invocation and reports JSON lines on stdout.
"""
import argparse
import importlib
import importlib.util
import json
import os
import pathlib
import sys
import traceback

MAX_DEPTH = 6
WRAPPER_ATTRS = ("model", "generator")


def emit(stage, **kwargs):
    print(json.dumps({"stage": stage, **kwargs}), flush=True)


def torch_module():
    import torch
    return torch


def is_module(obj):
    return isinstance(obj, torch_module().nn.Module)


def load_file(path):
    if str(path).endswith(".safetensors"):
        from safetensors.torch import load_file as load_safetensors
        return load_safetensors(str(path), device="cpu")
    torch = torch_module()
    try:
        return torch.load(str(path), map_location="cpu", weights_only=False)
    except TypeError:
        return torch.load(str(path), map_location="cpu")


def dtype_name(tensor):
    return str(tensor.dtype).replace("torch.", "")


def tensor_node(tensor):
    return {"type": "tensor", "dtype": dtype_name(tensor), "shape": list(tensor.shape)}


def find_inner(obj):
    # Only plain wrappers (e.g. a training harness) are unwrapped. A module that
    # happens to own a `.model` child is exported whole.
    if is_module(obj):
        return None
    for attr in WRAPPER_ATTRS:
        inner = getattr(obj, attr, None)
        if inner is not None and inner is not obj and (is_module(inner) or find_inner(inner)):
            return attr, inner
    return None


def module_node(obj, depth=0):
    torch = torch_module()
    parameters = {}
    if is_module(obj):
        for name, value in obj.state_dict().items():
            if torch.is_tensor(value):
                parameters[name] = {"dtype": dtype_name(value), "shape": list(value.shape)}
    variant = getattr(obj, "variant", None)
    node = {
        "type": "module",
        "class": type(obj).__name__,
        "variant": variant if isinstance(variant, str) else None,
        "parameters": parameters,
        "inner": None,
    }
    found = find_inner(obj) if depth < MAX_DEPTH else None
    if found is not None:
        attr, inner = found
        node["inner"] = {"attr": attr, "module": module_node(inner, depth + 1)}
    return node


def describe(obj, depth=0):
    torch = torch_module()
    if is_module(obj) or find_inner(obj) is not None:
        return module_node(obj)
    if torch.is_tensor(obj):
        return tensor_node(obj)
    if isinstance(obj, dict) and depth < MAX_DEPTH:
        return {
            "type": "map",
            "entries": [[str(k), describe(v, depth + 1)] for k, v in obj.items()],
        }
    return {"type": "other", "description": type(obj).__name__}


def lookup(obj, key):
    for candidate in obj:
        if str(candidate) == key:
            return obj[candidate]
    raise KeyError(key)


def flatten(state, prefix=""):
    torch = torch_module()
    flat = {}
    for key, value in state.items():
        name = f"{prefix}.{key}" if prefix else str(key)
        if torch.is_tensor(value):
            flat[name] = value
        elif isinstance(value, dict):
            flat.update(flatten(value, name))
    return flat


def convert_kwargs(kwargs):
    converted = {}
    for key, value in kwargs.items():
        if isinstance(value, dict) and set(value) == {"$path"}:
            converted[key] = pathlib.Path(value["$path"])
        else:
            converted[key] = value
    return converted


def build_architecture(spec):
    for entry in spec.get("python_path") or []:
        path = os.path.abspath(entry)
        if path not in sys.path:
            sys.path.insert(0, path)
    builder = spec["builder"]
    kwargs = convert_kwargs(spec.get("kwargs") or {})
    if builder.startswith("hf-auto:"):
        transformers = importlib.import_module("transformers")
        auto_class = getattr(transformers, builder.split(":", 1)[1])
        config = transformers.AutoConfig.from_pretrained(kwargs.pop("pretrained"))
        return auto_class.from_config(config, **kwargs)
    module_name, _, attr = builder.partition(":")
    return getattr(importlib.import_module(module_name), attr)(**kwargs)


def resolve_plan(plan):
    source = plan["source"]
    if source["kind"] == "checkpoint":
        obj = load_file(source["path"])
        for key in source["key_path"]:
            obj = lookup(obj, key)
    else:
        obj = build_architecture(source["architecture"])
    for attr in plan["attr_path"]:
        obj = getattr(obj, attr)
    state = plan.get("state")
    if state is not None:
        weights = load_file(state["path"])
        for key in state["key_path"]:
            weights = lookup(weights, key)
        result = obj.load_state_dict(flatten(weights), strict=False)
        emit(
            "loaded",
            message=f"{len(result.missing_keys)} missing, {len(result.unexpected_keys)} unexpected",
        )
    if plan.get("inference", True):
        obj.eval()
    return obj


def make_input(spec):
    torch = torch_module()
    fill = spec["fill"]
    if fill["kind"] == "random":
        generator = torch.Generator().manual_seed(int(fill["seed"]) % (2 ** 63))
        return torch.randn(*spec["shape"], generator=generator)
    return torch.full(tuple(spec["shape"]), int(fill["value"]), dtype=torch.long)


def cmd_check(request):
    missing = []
    for requirement in request["requirements"]:
        try:
            found = importlib.util.find_spec(requirement["module"]) is not None
        except (ImportError, ValueError):
            found = False
        if not found:
            missing.append(requirement)
    return {"missing": missing}


def cmd_inspect(request):
    emit("loading", message=request["path"])
    return {"checkpoint": describe(load_file(request["path"]))}


def cmd_describe_architecture(request):
    spec = request["architecture"]
    emit("building", message=spec["builder"])
    return {"module": module_node(build_architecture(spec))}


def cmd_export(request):
    torch = torch_module()
    model = resolve_plan(request["plan"])
    inputs = tuple(make_input(spec) for spec in request["inputs"])
    dynamic_axes = {
        name: {int(axis): label for axis, label in axes.items()}
        for name, axes in request["dynamic_axes"].items()
    }
    emit("tracing", message=f"opset {request['opset']}")
    with torch.no_grad():
        torch.onnx.export(
            model,
            inputs,
            request["output"],
            export_params=True,
            opset_version=request["opset"],
            do_constant_folding=True,
            input_names=[spec["name"] for spec in request["inputs"]],
            output_names=request["output_names"],
            dynamic_axes=dynamic_axes or None,
        )
    return {"output": request["output"], "size": os.path.getsize(request["output"])}


def cmd_save_aux(request):
    from transformers import AutoConfig, AutoTokenizer
    dest = request["dest"]
    os.makedirs(dest, exist_ok=True)
    before = set(os.listdir(dest))
    AutoTokenizer.from_pretrained(request["identifier"]).save_pretrained(dest)
    AutoConfig.from_pretrained(request["identifier"]).save_pretrained(dest)
    written = sorted(set(os.listdir(dest)) - before) or sorted(os.listdir(dest))
    return {"files": [os.path.join(dest, name) for name in written]}


def cmd_quantize(request):
    from onnxruntime.quantization import QuantType, quantize_dynamic
    quantize_dynamic(request["input"], request["output"], weight_type=QuantType.QInt8)
    return {"output": request["output"]}


COMMANDS = {
    "check": cmd_check,
    "inspect": cmd_inspect,
    "describe-architecture": cmd_describe_architecture,
    "export": cmd_export,
    "save-aux": cmd_save_aux,
    "quantize": cmd_quantize,
}


def main():
    parser = argparse.ArgumentParser(description="onnxport runtime bridge")
    parser.add_argument("command", choices=sorted(COMMANDS))
    parser.add_argument("--request", required=True, help="JSON request object")
    args = parser.parse_args()

    try:
        result = COMMANDS[args.command](json.loads(args.request))
    except Exception as e:
        traceback.print_exc(file=sys.stderr)
        emit("error", message=f"{type(e).__name__}: {e}")
        sys.exit(1)
    emit("complete", result=result)


if __name__ == "__main__":
    main()
"#;

/// Compute a short hash of script content for change detection.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hash = hasher.finalize();
    hex::encode(&hash[..8])
}

/// Deploy the bridge script into `dir` if missing or outdated.
///
/// Uses a `.hash` sidecar file to detect when the embedded script has changed
/// and needs to be rewritten. Returns the script path.
pub fn ensure_bridge_deployed(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_path(dir)?;
    if deploy_script(dir, BRIDGE_SCRIPT_NAME, BRIDGE_SCRIPT)? {
        info!("Deployed runtime bridge to {}", dir.display());
    }
    Ok(dir.join(BRIDGE_SCRIPT_NAME))
}

/// Write `content` unless the stored hash matches. Returns whether it wrote.
fn deploy_script(dir: &Path, filename: &str, content: &str) -> Result<bool> {
    let script_path = dir.join(filename);
    let hash_path = dir.join(format!("{}.hash", filename));
    let current_hash = content_hash(content);

    if script_path.exists() {
        if let Ok(stored_hash) = std::fs::read_to_string(&hash_path) {
            if stored_hash.trim() == current_hash {
                return Ok(false);
            }
        }
    }

    std::fs::write(&script_path, content).with_path(&script_path)?;
    std::fs::write(&hash_path, &current_hash).with_path(&hash_path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("abc").len(), 16);
    }

    #[test]
    fn test_deploy_writes_once() {
        let temp = TempDir::new().unwrap();
        let path = ensure_bridge_deployed(temp.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), BRIDGE_SCRIPT);

        assert!(!deploy_script(temp.path(), BRIDGE_SCRIPT_NAME, BRIDGE_SCRIPT).unwrap());
    }

    #[test]
    fn test_deploy_rewrites_stale_script() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(BRIDGE_SCRIPT_NAME);
        std::fs::write(&path, "print('old')").unwrap();
        std::fs::write(temp.path().join(format!("{}.hash", BRIDGE_SCRIPT_NAME)), "0000").unwrap();

        ensure_bridge_deployed(temp.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), BRIDGE_SCRIPT);
    }

    #[test]
    fn test_script_declares_all_commands() {
        for command in ["check", "inspect", "describe-architecture", "export", "save-aux", "quantize"] {
            assert!(BRIDGE_SCRIPT.contains(&format!("\"{}\"", command)), "{}", command);
        }
    }
}
