//! Checkpoint shapes and the module abstraction.
//!
//! A deserialized checkpoint is one of a handful of shapes: a runnable module, a
//! key-value container (which may hold a module, a weight state, or be a raw
//! weight state itself), or an opaque value. [`CheckpointResolver`] turns any of
//! these into a single inference-ready module.

mod resolver;

pub use resolver::{CheckpointResolver, ResolvedModule, STATE_KEYS, STANDARD_MODULE_KEYS};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Shape and element type of a stored tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub dtype: String,
    pub shape: Vec<usize>,
}

impl TensorInfo {
    pub fn new(dtype: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            dtype: dtype.into(),
            shape,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// A value stored inside a checkpoint container.
pub enum CheckpointValue {
    Module(Box<dyn Module>),
    Tensor(TensorInfo),
    Map(Container),
    /// Anything else: numbers, strings, optimizer state, pickled objects.
    Other(String),
}

impl CheckpointValue {
    fn is_state_like(&self) -> bool {
        matches!(self, CheckpointValue::Tensor(_) | CheckpointValue::Map(_))
    }

    fn type_name(&self) -> &'static str {
        match self {
            CheckpointValue::Module(_) => "module",
            CheckpointValue::Tensor(_) => "tensor",
            CheckpointValue::Map(_) => "map",
            CheckpointValue::Other(_) => "other",
        }
    }
}

impl fmt::Debug for CheckpointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointValue::Module(m) => write!(f, "Module({})", m.kind()),
            CheckpointValue::Tensor(t) => write!(f, "Tensor({} {:?})", t.dtype, t.shape),
            CheckpointValue::Map(c) => write!(f, "Map({} entries)", c.len()),
            CheckpointValue::Other(desc) => write!(f, "Other({})", desc),
        }
    }
}

/// Ordered key-value container. Insertion order is preserved because the
/// raw-state heuristic samples the first few values.
#[derive(Debug, Default)]
pub struct Container {
    entries: Vec<(String, CheckpointValue)>,
    source: Option<PathBuf>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the file this container was deserialized from.
    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(path.into());
        self
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn with(mut self, key: impl Into<String>, value: CheckpointValue) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: CheckpointValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&CheckpointValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<CheckpointValue> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &CheckpointValue> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the container looks like a raw weight state: a strict majority of
    /// the first `sample` values are tensors or nested maps.
    pub fn looks_like_weight_state(&self, sample: usize) -> bool {
        let sampled: Vec<_> = self.values().take(sample).collect();
        if sampled.is_empty() {
            return false;
        }
        let state_like = sampled.iter().filter(|v| v.is_state_like()).count();
        state_like * 2 > sampled.len()
    }

    /// Short description of the top-level entries, for error messages.
    pub fn describe(&self) -> String {
        if self.entries.is_empty() {
            return "empty container".to_string();
        }
        let parts: Vec<String> = self
            .entries
            .iter()
            .take(10)
            .map(|(k, v)| format!("{}: {}", k, v.type_name()))
            .collect();
        let more = self.entries.len().saturating_sub(10);
        if more > 0 {
            format!("{{{}, ... {} more}}", parts.join(", "), more)
        } else {
            format!("{{{}}}", parts.join(", "))
        }
    }
}

/// A deserialized checkpoint, consumed once by the resolver.
#[derive(Debug)]
pub enum Checkpoint {
    /// A directly usable module object.
    Module(Box<dyn Module>),
    /// A key-value container: wraps a module or weight state under conventional
    /// keys, or is itself a raw weight state.
    Container(Container),
    /// A value that can never be resolved (e.g. a bare tensor or list).
    Opaque(String),
}

/// Flat parameter-name to tensor mapping, plus where in the checkpoint it came
/// from (`origin` is empty when the whole container is the state).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeightState {
    pub source: Option<PathBuf>,
    pub origin: Vec<String>,
    pub tensors: BTreeMap<String, TensorInfo>,
}

impl WeightState {
    /// Flatten a container into dotted parameter names. Non-tensor leaves are
    /// skipped. The container's source file, if recorded, is carried over.
    pub fn from_container(origin: Vec<String>, container: &Container) -> Self {
        let mut tensors = BTreeMap::new();
        flatten_into(&mut tensors, "", container);
        Self {
            source: container.source.clone(),
            origin,
            tensors,
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn origin_label(&self) -> String {
        if self.origin.is_empty() {
            "<root>".to_string()
        } else {
            self.origin.join(".")
        }
    }
}

fn flatten_into(out: &mut BTreeMap<String, TensorInfo>, prefix: &str, container: &Container) {
    for (key, value) in &container.entries {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            CheckpointValue::Tensor(info) => {
                out.insert(name, info.clone());
            }
            CheckpointValue::Map(inner) => flatten_into(out, &name, inner),
            CheckpointValue::Module(_) | CheckpointValue::Other(_) => {}
        }
    }
}

/// Outcome of a non-strict weight load. Key mismatches are reported here and
/// never turn into errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub loaded: usize,
    pub missing_keys: Vec<String>,
    pub unexpected_keys: Vec<String>,
}

impl LoadReport {
    /// Compare the keys a module expects with the keys a state provides.
    pub fn compare(expected: &BTreeSet<String>, provided: &WeightState) -> Self {
        let provided_keys: BTreeSet<&String> = provided.tensors.keys().collect();
        let loaded = expected.iter().filter(|k| provided_keys.contains(k)).count();
        let missing_keys = expected
            .iter()
            .filter(|k| !provided_keys.contains(k))
            .cloned()
            .collect();
        let unexpected_keys = provided
            .tensors
            .keys()
            .filter(|k| !expected.contains(*k))
            .cloned()
            .collect();
        Self {
            loaded,
            missing_keys,
            unexpected_keys,
        }
    }

    pub fn is_exact(&self) -> bool {
        self.missing_keys.is_empty() && self.unexpected_keys.is_empty()
    }
}

/// A trainable module as seen by the pipeline.
///
/// Implementations are either real modules living in an external runtime (see
/// `runtime::BridgeModule`) or in-process fakes used by tests.
pub trait Module: Send + Sync + fmt::Debug {
    /// Class name, for logs and messages.
    fn kind(&self) -> &str;

    /// Variant the module declares, if it knows it.
    fn variant(&self) -> Option<&str> {
        None
    }

    /// Parameter names and shapes the module currently holds.
    fn state(&self) -> WeightState;

    /// Load `state` non-strictly.
    fn load_state(&mut self, state: &WeightState) -> LoadReport;

    fn set_inference_mode(&mut self);

    fn is_inference_mode(&self) -> bool;

    /// Detach the trainable inner module when this one is only a wrapper (for
    /// example a training harness holding the network under `.model`).
    fn take_inner(&mut self) -> Option<Box<dyn Module>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Builds empty modules for a model family.
#[async_trait]
pub trait ArchitectureFactory: Send + Sync {
    /// Human-readable builder name, e.g. `deoldify.generators:gen_inference_deep`.
    fn builder(&self) -> &str;

    /// Variant this factory is bound to, if any.
    fn variant(&self) -> Option<&str> {
        None
    }

    async fn build(&self) -> std::result::Result<Box<dyn Module>, String>;
}
