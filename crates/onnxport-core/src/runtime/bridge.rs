//! Modules that live inside the Python bridge.
//!
//! The bridge never hands objects back to Rust. Instead it describes them as a
//! JSON node tree, and [`BridgeModule`] keeps a recipe (a "plan") the bridge can
//! replay to rebuild the same object at export time.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::checkpoint::{
    Checkpoint, CheckpointValue, Container, LoadReport, Module, TensorInfo, WeightState,
};
use crate::registry::ArchitectureSpec;

/// Where the bridge gets the object a [`BridgeModule`] stands for.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleSource {
    /// Load `path` and follow `key_path` through nested containers.
    Checkpoint { path: PathBuf, key_path: Vec<String> },
    /// Build a fresh module.
    Architecture { architecture: ArchitectureSpec },
}

/// A weight state to apply after the module is rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateRef {
    pub path: PathBuf,
    pub key_path: Vec<String>,
}

/// Value description emitted by the bridge `inspect` command.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum Node {
    Module(ModuleNode),
    Tensor {
        dtype: String,
        shape: Vec<usize>,
    },
    Map {
        entries: Vec<(String, Node)>,
    },
    Other {
        description: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ModuleNode {
    pub class: String,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, TensorInfo>,
    #[serde(default)]
    pub inner: Option<InnerNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct InnerNode {
    pub attr: String,
    pub module: Box<ModuleNode>,
}

/// Proxy for a module held by the Python runtime.
#[derive(Debug, Clone)]
pub struct BridgeModule {
    class: String,
    variant: Option<String>,
    source: ModuleSource,
    attr_path: Vec<String>,
    parameters: BTreeMap<String, TensorInfo>,
    inner: Option<InnerNode>,
    state: Option<StateRef>,
    loaded: Option<WeightState>,
    inference: bool,
}

impl BridgeModule {
    pub(crate) fn from_node(node: ModuleNode, source: ModuleSource, attr_path: Vec<String>) -> Self {
        Self {
            class: node.class,
            variant: node.variant,
            source,
            attr_path,
            parameters: node.parameters,
            inner: node.inner,
            state: None,
            loaded: None,
            inference: false,
        }
    }

    pub fn source(&self) -> &ModuleSource {
        &self.source
    }

    /// Attribute chain from the source object down to this module.
    pub fn attr_path(&self) -> &[String] {
        &self.attr_path
    }

    pub fn state_ref(&self) -> Option<&StateRef> {
        self.state.as_ref()
    }

    /// Whether a weight state was loaded that the bridge cannot replay.
    pub fn has_unreplayable_state(&self) -> bool {
        self.loaded.is_some() && self.state.is_none()
    }

    /// JSON recipe the bridge uses to rebuild this module.
    pub fn plan(&self) -> serde_json::Value {
        serde_json::json!({
            "source": self.source,
            "attr_path": self.attr_path,
            "state": self.state,
            "inference": self.inference,
        })
    }
}

impl Module for BridgeModule {
    fn kind(&self) -> &str {
        &self.class
    }

    fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    fn state(&self) -> WeightState {
        match &self.loaded {
            Some(state) => state.clone(),
            None => WeightState {
                source: None,
                origin: Vec::new(),
                tensors: self.parameters.clone(),
            },
        }
    }

    fn load_state(&mut self, state: &WeightState) -> LoadReport {
        let expected: BTreeSet<String> = self.parameters.keys().cloned().collect();
        let report = LoadReport::compare(&expected, state);
        self.state = state.source.as_ref().map(|path| StateRef {
            path: path.clone(),
            key_path: state.origin.clone(),
        });
        self.loaded = Some(state.clone());
        report
    }

    fn set_inference_mode(&mut self) {
        self.inference = true;
    }

    fn is_inference_mode(&self) -> bool {
        self.inference
    }

    fn take_inner(&mut self) -> Option<Box<dyn Module>> {
        let inner = self.inner.take()?;
        let mut attr_path = self.attr_path.clone();
        attr_path.push(inner.attr);
        Some(Box::new(BridgeModule::from_node(
            *inner.module,
            self.source.clone(),
            attr_path,
        )))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Turn an `inspect` node tree into a checkpoint read from `path`.
pub(crate) fn checkpoint_from_node(path: &Path, node: Node) -> Checkpoint {
    match node {
        Node::Module(module) => Checkpoint::Module(Box::new(BridgeModule::from_node(
            module,
            ModuleSource::Checkpoint {
                path: path.to_path_buf(),
                key_path: Vec::new(),
            },
            Vec::new(),
        ))),
        Node::Map { entries } => {
            Checkpoint::Container(container_from_entries(path, &[], entries).with_source(path))
        }
        Node::Tensor { dtype, shape } => {
            Checkpoint::Opaque(format!("a bare {} tensor of shape {:?}", dtype, shape))
        }
        Node::Other { description } => Checkpoint::Opaque(description),
    }
}

fn container_from_entries(path: &Path, prefix: &[String], entries: Vec<(String, Node)>) -> Container {
    let mut container = Container::new();
    for (key, node) in entries {
        let mut key_path = prefix.to_vec();
        key_path.push(key.clone());
        let value = match node {
            Node::Module(module) => CheckpointValue::Module(Box::new(BridgeModule::from_node(
                module,
                ModuleSource::Checkpoint {
                    path: path.to_path_buf(),
                    key_path,
                },
                Vec::new(),
            ))),
            Node::Tensor { dtype, shape } => CheckpointValue::Tensor(TensorInfo::new(dtype, shape)),
            Node::Map { entries } => {
                CheckpointValue::Map(container_from_entries(path, &key_path, entries))
            }
            Node::Other { description } => CheckpointValue::Other(description),
        };
        container.insert(key, value);
    }
    container
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Node {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_wrapped_module_unwraps_into_attr_path() {
        let node = parse(
            r#"{"type":"module","class":"Learner","variant":null,"parameters":{},
                "inner":{"attr":"model","module":{"type":"module","class":"DynamicUnet",
                "parameters":{"layers.0.weight":{"dtype":"float32","shape":[64,3,7,7]}},"inner":null}}}"#,
        );
        let checkpoint = checkpoint_from_node(Path::new("/w/gen.pth"), node);
        let Checkpoint::Module(mut wrapper) = checkpoint else {
            panic!("expected a module");
        };
        assert_eq!(wrapper.kind(), "Learner");

        let inner = wrapper.take_inner().unwrap();
        let inner = inner.as_any().downcast_ref::<BridgeModule>().unwrap();
        assert_eq!(inner.kind(), "DynamicUnet");
        assert_eq!(inner.attr_path(), ["model".to_string()]);
        assert_eq!(inner.state().len(), 1);
        assert!(wrapper.take_inner().is_none());
    }

    #[test]
    fn test_map_becomes_container_with_key_paths() {
        let node = parse(
            r#"{"type":"map","entries":[
                ["params_ema",{"type":"map","entries":[["conv_first.weight",{"type":"tensor","dtype":"float32","shape":[64,3,3,3]}]]}],
                ["net",{"type":"module","class":"FBCNN","parameters":{}}],
                ["epoch",{"type":"other","description":"int"}]]}"#,
        );
        let Checkpoint::Container(container) = checkpoint_from_node(Path::new("/w/a.pth"), node) else {
            panic!("expected a container");
        };
        assert_eq!(container.source(), Some(Path::new("/w/a.pth")));
        assert_eq!(container.keys().collect::<Vec<_>>(), vec!["params_ema", "net", "epoch"]);

        let Some(CheckpointValue::Module(net)) = container.get("net") else {
            panic!("expected a module under net");
        };
        let net = net.as_any().downcast_ref::<BridgeModule>().unwrap();
        assert_eq!(
            net.source(),
            &ModuleSource::Checkpoint {
                path: PathBuf::from("/w/a.pth"),
                key_path: vec!["net".into()],
            }
        );
    }

    #[test]
    fn test_bare_tensor_is_opaque() {
        let node = parse(r#"{"type":"tensor","dtype":"float32","shape":[3]}"#);
        assert!(matches!(
            checkpoint_from_node(Path::new("x.pth"), node),
            Checkpoint::Opaque(_)
        ));
    }

    #[test]
    fn test_load_state_records_replayable_ref() {
        let node = ModuleNode {
            class: "RRDBNet".into(),
            variant: None,
            parameters: [("conv_first.weight".to_string(), TensorInfo::new("float32", vec![64, 3, 3, 3]))]
                .into_iter()
                .collect(),
            inner: None,
        };
        let mut module = BridgeModule::from_node(
            node,
            ModuleSource::Architecture {
                architecture: ArchitectureSpec {
                    builder: "basicsr.archs.rrdbnet_arch:RRDBNet".into(),
                    kwargs: serde_json::Map::new(),
                    variant: None,
                    python_path: Vec::new(),
                },
            },
            Vec::new(),
        );

        let mut state = WeightState {
            source: Some(PathBuf::from("/w/x4.pth")),
            origin: vec!["params_ema".into()],
            tensors: BTreeMap::new(),
        };
        state
            .tensors
            .insert("conv_first.weight".into(), TensorInfo::new("float32", vec![64, 3, 3, 3]));
        state
            .tensors
            .insert("extra".into(), TensorInfo::new("float32", vec![1]));

        let report = module.load_state(&state);
        assert_eq!(report.loaded, 1);
        assert_eq!(report.unexpected_keys, vec!["extra"]);
        assert!(!module.has_unreplayable_state());

        module.set_inference_mode();
        let plan = module.plan();
        assert_eq!(plan["source"]["kind"], "architecture");
        assert_eq!(plan["state"]["key_path"][0], "params_ema");
        assert_eq!(plan["inference"], true);
    }

    #[test]
    fn test_state_without_source_is_unreplayable() {
        let node = ModuleNode {
            class: "Net".into(),
            variant: None,
            parameters: BTreeMap::new(),
            inner: None,
        };
        let mut module = BridgeModule::from_node(
            node,
            ModuleSource::Checkpoint {
                path: PathBuf::from("a.pth"),
                key_path: Vec::new(),
            },
            Vec::new(),
        );
        module.load_state(&WeightState::default());
        assert!(module.has_unreplayable_state());
    }
}
