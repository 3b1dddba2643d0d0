//! Centralized checkpoint resolution.
//!
//! Resolution order:
//! 1. a module checkpoint is used as-is;
//! 2. a container is searched for a module under the module keys;
//! 3. then for a weight state under the module keys followed by the state keys;
//! 4. then the container itself is tried as a raw weight state;
//! 5. weight state is loaded non-strictly into a module built by the
//!    architecture factory.
//!
//! Whatever comes out is unwrapped to its trainable inner module and switched
//! to inference mode.

use std::path::Path;
use tracing::{debug, info, warn};

use crate::checkpoint::{
    ArchitectureFactory, Checkpoint, CheckpointValue, Container, LoadReport, Module, WeightState,
};
use crate::config::ExportConfig;
use crate::error::ResolutionError;

/// Keys probed for a module (or state) before any family alias.
pub const STANDARD_MODULE_KEYS: &[&str] = &["model", "net"];

/// Conventional keys under which trainers store weight state.
pub const STATE_KEYS: &[&str] = &[
    "state_dict",
    "model_state_dict",
    "params_ema",
    "params",
    "weights",
];

/// An inference-ready module.
#[derive(Debug)]
pub struct ResolvedModule {
    pub module: Box<dyn Module>,
    /// Where the module came from, e.g. `checkpoint`, `checkpoint[net]`,
    /// `state_dict -> gen_inference_deep`.
    pub origin: String,
    /// Present when weights were loaded into a freshly built module.
    pub load_report: Option<LoadReport>,
    pub warnings: Vec<String>,
}

enum Found {
    Module {
        module: Box<dyn Module>,
        origin: String,
    },
    State(WeightState),
}

pub struct CheckpointResolver {
    module_keys: Vec<String>,
    sample_size: usize,
}

impl Default for CheckpointResolver {
    fn default() -> Self {
        Self::new::<&str>(&[])
    }
}

impl CheckpointResolver {
    /// `aliases` are family-specific module keys (e.g. `generator`, `FBCNN`),
    /// probed after the standard keys.
    pub fn new<S: AsRef<str>>(aliases: &[S]) -> Self {
        let mut module_keys: Vec<String> =
            STANDARD_MODULE_KEYS.iter().map(|k| k.to_string()).collect();
        for alias in aliases {
            let alias = alias.as_ref();
            if !module_keys.iter().any(|k| k == alias) {
                module_keys.push(alias.to_string());
            }
        }
        Self {
            module_keys,
            sample_size: ExportConfig::STATE_SAMPLE_SIZE,
        }
    }

    pub fn module_keys(&self) -> &[String] {
        &self.module_keys
    }

    pub async fn resolve(
        &self,
        checkpoint: Checkpoint,
        requested_variant: Option<&str>,
        factory: Option<&dyn ArchitectureFactory>,
    ) -> Result<ResolvedModule, ResolutionError> {
        let found = match checkpoint {
            Checkpoint::Module(module) => Found::Module {
                module,
                origin: "checkpoint".to_string(),
            },
            Checkpoint::Container(container) => self.search_container(container)?,
            Checkpoint::Opaque(description) => {
                return Err(ResolutionError::UnresolvableShape {
                    detail: format!("checkpoint is {}", description),
                })
            }
        };

        match found {
            Found::Module { module, origin } => {
                info!("Using module from {}", origin);
                let module = finalize(module, requested_variant)?;
                Ok(ResolvedModule {
                    module,
                    origin,
                    load_report: None,
                    warnings: Vec::new(),
                })
            }
            Found::State(state) => self.load_into_factory(state, requested_variant, factory).await,
        }
    }

    fn search_container(&self, mut container: Container) -> Result<Found, ResolutionError> {
        for key in &self.module_keys {
            if matches!(container.get(key), Some(CheckpointValue::Module(_))) {
                if let Some(CheckpointValue::Module(module)) = container.remove(key) {
                    return Ok(Found::Module {
                        module,
                        origin: format!("checkpoint[{}]", key),
                    });
                }
            }
        }

        let state_keys = self
            .module_keys
            .iter()
            .map(String::as_str)
            .chain(STATE_KEYS.iter().copied());
        for key in state_keys {
            if let Some(CheckpointValue::Map(inner)) = container.get(key) {
                let mut state = WeightState::from_container(vec![key.to_string()], inner);
                state.source = container.source().map(Path::to_path_buf);
                if !state.is_empty() {
                    debug!("Found weight state under '{}' ({} tensors)", key, state.len());
                    return Ok(Found::State(state));
                }
            }
        }

        if container.looks_like_weight_state(self.sample_size) {
            let state = WeightState::from_container(Vec::new(), &container);
            if !state.is_empty() {
                debug!("Container looks like a raw weight state ({} tensors)", state.len());
                return Ok(Found::State(state));
            }
        }

        Err(ResolutionError::UnresolvableShape {
            detail: format!(
                "no module or weight state under keys [{}] in {}",
                self.module_keys.join(", "),
                container.describe()
            ),
        })
    }

    async fn load_into_factory(
        &self,
        state: WeightState,
        requested_variant: Option<&str>,
        factory: Option<&dyn ArchitectureFactory>,
    ) -> Result<ResolvedModule, ResolutionError> {
        let Some(factory) = factory else {
            return Err(ResolutionError::MissingArchitecture {
                origin: state.origin_label(),
            });
        };

        if let (Some(requested), Some(bound)) = (requested_variant, factory.variant()) {
            if requested != bound {
                return Err(ResolutionError::VariantMismatch {
                    requested: requested.to_string(),
                    found: bound.to_string(),
                });
            }
        }

        info!(
            "Building {} for weight state from {}",
            factory.builder(),
            state.origin_label()
        );
        let built = factory
            .build()
            .await
            .map_err(|message| ResolutionError::ArchitectureBuild {
                builder: factory.builder().to_string(),
                message,
            })?;

        let mut module = unwrap_inner(built);
        check_variant(module.as_ref(), requested_variant)?;

        let report = module.load_state(&state);
        let mut warnings = Vec::new();
        if report.loaded == 0 && !state.is_empty() {
            let message = format!(
                "no parameter names overlap between checkpoint ({} tensors) and {} ({} parameters)",
                state.len(),
                factory.builder(),
                report.missing_keys.len()
            );
            warn!("{}", message);
            warnings.push(message);
        } else if !report.is_exact() {
            warn!(
                "Loaded {} tensors non-strictly ({} missing, {} unexpected)",
                report.loaded,
                report.missing_keys.len(),
                report.unexpected_keys.len()
            );
        }

        module.set_inference_mode();
        Ok(ResolvedModule {
            module,
            origin: format!("{} -> {}", state.origin_label(), factory.builder()),
            load_report: Some(report),
            warnings,
        })
    }
}

fn unwrap_inner(mut module: Box<dyn Module>) -> Box<dyn Module> {
    while let Some(inner) = module.take_inner() {
        debug!("Unwrapped {} to inner {}", module.kind(), inner.kind());
        module = inner;
    }
    module
}

fn check_variant(module: &dyn Module, requested: Option<&str>) -> Result<(), ResolutionError> {
    match (requested, module.variant()) {
        (Some(requested), Some(found)) if requested != found => {
            Err(ResolutionError::VariantMismatch {
                requested: requested.to_string(),
                found: found.to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn finalize(
    module: Box<dyn Module>,
    requested_variant: Option<&str>,
) -> Result<Box<dyn Module>, ResolutionError> {
    // Wrappers may carry the variant while the inner network does not.
    check_variant(module.as_ref(), requested_variant)?;
    let mut module = unwrap_inner(module);
    check_variant(module.as_ref(), requested_variant)?;
    module.set_inference_mode();
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::TensorInfo;
    use async_trait::async_trait;
    use std::any::Any;
    use std::collections::BTreeSet;

    #[derive(Debug)]
    struct Net {
        kind: String,
        variant: Option<String>,
        params: BTreeSet<String>,
        loaded: WeightState,
        eval: bool,
        inner: Option<Box<dyn Module>>,
    }

    impl Net {
        fn new(kind: &str, params: &[&str]) -> Self {
            Self {
                kind: kind.to_string(),
                variant: None,
                params: params.iter().map(|p| p.to_string()).collect(),
                loaded: WeightState::default(),
                eval: false,
                inner: None,
            }
        }
    }

    impl Module for Net {
        fn kind(&self) -> &str {
            &self.kind
        }
        fn variant(&self) -> Option<&str> {
            self.variant.as_deref()
        }
        fn state(&self) -> WeightState {
            self.loaded.clone()
        }
        fn load_state(&mut self, state: &WeightState) -> LoadReport {
            self.loaded = state.clone();
            LoadReport::compare(&self.params, state)
        }
        fn set_inference_mode(&mut self) {
            self.eval = true;
        }
        fn is_inference_mode(&self) -> bool {
            self.eval
        }
        fn take_inner(&mut self) -> Option<Box<dyn Module>> {
            self.inner.take()
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Factory {
        params: Vec<&'static str>,
        variant: Option<&'static str>,
        fail: bool,
    }

    #[async_trait]
    impl ArchitectureFactory for Factory {
        fn builder(&self) -> &str {
            "test:Net"
        }
        fn variant(&self) -> Option<&str> {
            self.variant
        }
        async fn build(&self) -> Result<Box<dyn Module>, String> {
            if self.fail {
                return Err("missing dependency".into());
            }
            Ok(Box::new(Net::new("Net", &self.params)))
        }
    }

    fn tensor() -> CheckpointValue {
        CheckpointValue::Tensor(TensorInfo::new("float32", vec![8]))
    }

    fn state_map(keys: &[&str]) -> Container {
        keys.iter()
            .fold(Container::new(), |c, k| c.with(*k, tensor()))
    }

    #[test]
    fn test_default_probes_only_standard_keys() {
        let resolver = CheckpointResolver::default();
        assert_eq!(resolver.module_keys, STANDARD_MODULE_KEYS);
    }

    #[tokio::test]
    async fn test_module_under_alias_key() {
        let container = Container::new()
            .with("epoch", CheckpointValue::Other("int".into()))
            .with("FBCNN", CheckpointValue::Module(Box::new(Net::new("FBCNN", &[]))));

        let resolved = CheckpointResolver::new(&["FBCNN"])
            .resolve(Checkpoint::Container(container), None, None)
            .await
            .unwrap();

        assert_eq!(resolved.module.kind(), "FBCNN");
        assert_eq!(resolved.origin, "checkpoint[FBCNN]");
        assert!(resolved.module.is_inference_mode());
    }

    #[tokio::test]
    async fn test_standard_key_wins_over_alias() {
        let container = Container::new()
            .with("generator", CheckpointValue::Module(Box::new(Net::new("Gen", &[]))))
            .with("net", CheckpointValue::Module(Box::new(Net::new("Net", &[]))));

        let resolved = CheckpointResolver::new(&["generator"])
            .resolve(Checkpoint::Container(container), None, None)
            .await
            .unwrap();
        assert_eq!(resolved.module.kind(), "Net");
    }

    #[tokio::test]
    async fn test_state_under_params_ema() {
        let container = Container::new()
            .with("params_ema", CheckpointValue::Map(state_map(&["conv_first.weight"])));
        let factory = Factory {
            params: vec!["conv_first.weight", "conv_last.weight"],
            variant: None,
            fail: false,
        };

        let resolved = CheckpointResolver::default()
            .resolve(Checkpoint::Container(container), None, Some(&factory))
            .await
            .unwrap();

        let report = resolved.load_report.unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.missing_keys, vec!["conv_last.weight"]);
        assert!(resolved.origin.starts_with("params_ema"));
    }

    #[tokio::test]
    async fn test_raw_state_without_factory_is_fatal() {
        let err = CheckpointResolver::default()
            .resolve(
                Checkpoint::Container(state_map(&["a.weight", "a.bias"])),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::MissingArchitecture { .. }));
    }

    #[tokio::test]
    async fn test_zero_overlap_is_a_warning() {
        let factory = Factory {
            params: vec!["x.weight"],
            variant: None,
            fail: false,
        };
        let resolved = CheckpointResolver::default()
            .resolve(
                Checkpoint::Container(state_map(&["y.weight"])),
                None,
                Some(&factory),
            )
            .await
            .unwrap();
        assert_eq!(resolved.warnings.len(), 1);
        assert!(resolved.module.is_inference_mode());
    }

    #[tokio::test]
    async fn test_factory_failure_is_resolution_error() {
        let factory = Factory {
            params: vec![],
            variant: None,
            fail: true,
        };
        let err = CheckpointResolver::default()
            .resolve(
                Checkpoint::Container(state_map(&["w"])),
                None,
                Some(&factory),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing dependency"));
    }

    #[tokio::test]
    async fn test_factory_variant_mismatch_rejected() {
        let factory = Factory {
            params: vec!["w"],
            variant: Some("artistic"),
            fail: false,
        };
        let err = CheckpointResolver::default()
            .resolve(
                Checkpoint::Container(state_map(&["w"])),
                Some("stable"),
                Some(&factory),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::VariantMismatch { .. }));
    }

    #[tokio::test]
    async fn test_wrapper_is_unwrapped_and_variant_checked() {
        let mut learner = Net::new("Learner", &[]);
        learner.variant = Some("artistic".into());
        learner.inner = Some(Box::new(Net::new("DynamicUnet", &[])));

        let resolved = CheckpointResolver::default()
            .resolve(Checkpoint::Module(Box::new(learner)), Some("artistic"), None)
            .await
            .unwrap();
        assert_eq!(resolved.module.kind(), "DynamicUnet");

        let mut learner = Net::new("Learner", &[]);
        learner.variant = Some("artistic".into());
        let err = CheckpointResolver::default()
            .resolve(Checkpoint::Module(Box::new(learner)), Some("stable"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::VariantMismatch { .. }));
    }

    #[tokio::test]
    async fn test_opaque_and_metadata_only_fail() {
        let err = CheckpointResolver::default()
            .resolve(Checkpoint::Opaque("a bare tensor".into()), None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unresolvable checkpoint shape"));

        let container = Container::new()
            .with("epoch", CheckpointValue::Other("int".into()))
            .with("lr", CheckpointValue::Other("float".into()));
        let err = CheckpointResolver::default()
            .resolve(Checkpoint::Container(container), None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("epoch: other"));
    }
}
