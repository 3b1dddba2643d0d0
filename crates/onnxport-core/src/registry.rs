//! Model family registry.
//!
//! Every supported model is a [`ModelSpec`]: plain configuration data covering
//! where the weights live, how to rebuild the architecture, and how to export
//! it. Built-in families are listed here; more can be loaded from JSON.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::config::{ExportConfig, PathsConfig};
use crate::error::{IoResultExt, OnnxportError, Result};
use crate::export::{AxisConfig, InputSpec, TensorDtype};
use crate::locate::SourceCandidate;

/// How to build an empty module for a family.
///
/// `builder` is either `module.path:callable` (called with `kwargs`) or
/// `hf-auto:<AutoClass>`, which instantiates a transformers auto class from the
/// hub config named by the `pretrained` kwarg. A kwarg of the form
/// `{"$path": "..."}` is passed as a filesystem path object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureSpec {
    pub builder: String,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    /// Variant the builder produces. Checked against the requested variant.
    #[serde(default)]
    pub variant: Option<String>,
    /// Extra import roots for the builder's module (e.g. a cloned repository).
    #[serde(default)]
    pub python_path: Vec<String>,
}

/// A Python package the runtime must be able to import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRequirement {
    /// Import name, e.g. `realesrgan`.
    pub module: String,
    /// pip install name, e.g. `optimum[onnxruntime]`.
    pub install: String,
}

impl PackageRequirement {
    pub fn new(module: &str, install: &str) -> Self {
        Self {
            module: module.to_string(),
            install: install.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Family identifier, e.g. `fbcnn`.
    pub identifier: String,
    #[serde(default)]
    pub variant: Option<String>,
    /// Output directory name under the output root.
    pub slug: String,
    pub inputs: Vec<InputSpec>,
    #[serde(default = "default_output_names")]
    pub output_names: Vec<String>,
    #[serde(default)]
    pub dynamic_axes: AxisConfig,
    /// Local paths probed in order. `~`, relative paths and a `{slug}`
    /// placeholder are allowed.
    #[serde(default)]
    pub local_paths: Vec<String>,
    /// Remote URLs tried in order.
    #[serde(default)]
    pub remote_urls: Vec<String>,
    /// Directory downloads are written to. Defaults to the parent of the first
    /// local path.
    #[serde(default)]
    pub download_dir: Option<String>,
    /// Family-specific container keys holding the module or its state.
    #[serde(default)]
    pub module_keys: Vec<String>,
    #[serde(default)]
    pub architecture: Option<ArchitectureSpec>,
    #[serde(default = "default_opset")]
    pub opset: u32,
    #[serde(default)]
    pub quantize: bool,
    /// Hub identifier whose tokenizer and config ship alongside the graph.
    #[serde(default)]
    pub sidecar_source: Option<String>,
    #[serde(default)]
    pub requirements: Vec<PackageRequirement>,
    #[serde(default)]
    pub homepage: Option<String>,
    /// Manual acquisition steps, shown when no source works.
    #[serde(default)]
    pub instructions: Option<String>,
}

fn default_output_names() -> Vec<String> {
    vec!["output".to_string()]
}

fn default_opset() -> u32 {
    ExportConfig::DEFAULT_OPSET
}

impl ModelSpec {
    /// Local candidates first, then remote, each in declared order.
    pub fn candidates(&self) -> Vec<SourceCandidate> {
        let locals = self
            .local_paths
            .iter()
            .enumerate()
            .map(|(i, p)| SourceCandidate::local(expand_slug(p, self), i as u32));
        let remotes = self
            .remote_urls
            .iter()
            .enumerate()
            .map(|(i, u)| SourceCandidate::remote(u.clone(), i as u32));
        locals.chain(remotes).collect()
    }

    pub fn download_dir(&self) -> PathBuf {
        if let Some(dir) = &self.download_dir {
            return PathBuf::from(dir);
        }
        self.local_paths
            .first()
            .and_then(|p| Path::new(p).parent().map(Path::to_path_buf))
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| {
                Path::new(PathsConfig::DEFAULT_OUTPUT_ROOT)
                    .join(PathsConfig::CACHE_DIR_NAME)
                    .join(&self.slug)
            })
    }

    /// `identifier` or `identifier/variant`.
    pub fn display_name(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}/{}", self.identifier, variant),
            None => self.identifier.clone(),
        }
    }
}

fn expand_slug(path: &str, spec: &ModelSpec) -> String {
    path.replace("{slug}", &spec.slug)
}

/// Lowercase, with runs of anything outside `[a-z0-9._-]` collapsed to `_`.
pub fn slugify(name: &str) -> String {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let lower = name.to_lowercase();
    match PATTERN.get_or_init(|| Regex::new(r"[^a-z0-9._-]+").ok()) {
        Some(re) => re.replace_all(&lower, "_").trim_matches('_').to_string(),
        None => lower,
    }
}

/// The set of known model specs.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    specs: Vec<ModelSpec>,
}

impl ModelRegistry {
    pub fn builtin() -> Self {
        Self {
            specs: builtin_specs(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Add specs from a JSON file holding a single spec or an array of specs.
    /// Entries replace built-ins with the same identifier and variant.
    pub fn extend_from_json_file(&mut self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        let specs: Vec<ModelSpec> = if value.is_array() {
            serde_json::from_value(value)?
        } else {
            vec![serde_json::from_value(value)?]
        };
        let count = specs.len();
        for spec in specs {
            self.insert(spec);
        }
        Ok(count)
    }

    pub fn insert(&mut self, spec: ModelSpec) {
        self.specs
            .retain(|s| !(s.identifier == spec.identifier && s.variant == spec.variant));
        self.specs.push(spec);
    }

    pub fn specs(&self) -> &[ModelSpec] {
        &self.specs
    }

    /// Variants known for `identifier`, in registry order.
    pub fn variants(&self, identifier: &str) -> Vec<Option<String>> {
        self.specs
            .iter()
            .filter(|s| s.identifier == identifier)
            .map(|s| s.variant.clone())
            .collect()
    }

    /// Find a spec. Without a variant, the first registered variant is used.
    pub fn lookup(&self, identifier: &str, variant: Option<&str>) -> Result<&ModelSpec> {
        let family: Vec<&ModelSpec> = self
            .specs
            .iter()
            .filter(|s| s.identifier == identifier)
            .collect();
        let Some(first) = family.first().copied() else {
            return Err(OnnxportError::UnknownModel {
                identifier: identifier.to_string(),
            });
        };

        match variant {
            None => Ok(first),
            Some(wanted) => family
                .iter()
                .find(|s| s.variant.as_deref() == Some(wanted))
                .copied()
                .ok_or_else(|| OnnxportError::UnknownVariant {
                    identifier: identifier.to_string(),
                    variant: wanted.to_string(),
                    available: family
                        .iter()
                        .map(|s| s.variant.clone().unwrap_or_else(|| "-".into()))
                        .collect::<Vec<_>>()
                        .join(", "),
                }),
        }
    }
}

fn spatial_axes() -> AxisConfig {
    let spatial: BTreeMap<usize, String> =
        BTreeMap::from([(2, "height".to_string()), (3, "width".to_string())]);
    BTreeMap::from([
        ("input".to_string(), spatial.clone()),
        ("output".to_string(), spatial),
    ])
}

fn text_axes() -> AxisConfig {
    let sequence: BTreeMap<usize, String> = BTreeMap::from([
        (0, "batch_size".to_string()),
        (1, "sequence_length".to_string()),
    ]);
    BTreeMap::from([
        ("input_ids".to_string(), sequence.clone()),
        ("attention_mask".to_string(), sequence),
        (
            "logits".to_string(),
            BTreeMap::from([(0, "batch_size".to_string())]),
        ),
    ])
}

fn torch_requirements(extra: &[(&str, &str)]) -> Vec<PackageRequirement> {
    let mut reqs = vec![
        PackageRequirement::new("torch", "torch"),
        PackageRequirement::new("onnx", "onnx"),
    ];
    reqs.extend(extra.iter().map(|(m, i)| PackageRequirement::new(m, i)));
    reqs
}

fn image_spec(identifier: &str, variant: Option<&str>, slug: String, side: usize) -> ModelSpec {
    ModelSpec {
        identifier: identifier.to_string(),
        variant: variant.map(str::to_string),
        slug,
        inputs: vec![InputSpec::new("input", &[1, 3, side, side], TensorDtype::Float32)],
        output_names: default_output_names(),
        dynamic_axes: spatial_axes(),
        local_paths: Vec::new(),
        remote_urls: Vec::new(),
        download_dir: None,
        module_keys: Vec::new(),
        architecture: None,
        opset: ExportConfig::DEFAULT_OPSET,
        quantize: false,
        sidecar_source: None,
        requirements: torch_requirements(&[]),
        homepage: None,
        instructions: None,
    }
}

fn github_triplet(repo: &str, file: &str) -> Vec<String> {
    vec![
        format!("https://github.com/{}/releases/download/v1.0/{}", repo, file),
        format!("https://raw.githubusercontent.com/{}/main/{}", repo, file),
        format!("https://github.com/{}/releases/latest/download/{}", repo, file),
    ]
}

fn manual_steps(homepage: &str, file: &str, place: &str) -> String {
    format!(
        "1. Visit: {}\n2. Download {}\n3. Place it at: {}\nPre-converted ONNX models may also be available from https://github.com/PINTO0309/PINTO_model_zoo",
        homepage, file, place
    )
}

fn realesrgan(variant: &str, file: &str, release: &str, num_block: u32) -> ModelSpec {
    let slug = format!("realesrgan-{}", variant.to_lowercase());
    let mut spec = image_spec("realesrgan", Some(variant), slug, 128);
    spec.local_paths = vec![
        format!("./models/realesrgan/{}", file),
        format!("./{}", file),
        format!("~/.cache/realesrgan/{}", file),
    ];
    spec.remote_urls = vec![format!(
        "https://github.com/xinntao/Real-ESRGAN/releases/download/{}/{}",
        release, file
    )];
    spec.architecture = Some(ArchitectureSpec {
        builder: "basicsr.archs.rrdbnet_arch:RRDBNet".into(),
        kwargs: serde_json::json!({
            "num_in_ch": 3, "num_out_ch": 3, "num_feat": 64,
            "num_block": num_block, "num_grow_ch": 32, "scale": 4
        })
        .as_object()
        .cloned()
        .unwrap_or_default(),
        variant: Some(variant.to_string()),
        python_path: Vec::new(),
    });
    spec.requirements = torch_requirements(&[("basicsr", "basicsr"), ("realesrgan", "realesrgan")]);
    spec.homepage = Some("https://github.com/xinntao/Real-ESRGAN".into());
    spec.instructions = Some(manual_steps(
        "https://github.com/xinntao/Real-ESRGAN",
        file,
        &format!("./models/realesrgan/{}", file),
    ));
    spec
}

fn fbcnn(quality: u32) -> ModelSpec {
    let file = format!("FBCNN_q{}.pth", quality);
    let variant = format!("q{}", quality);
    let mut spec = image_spec("fbcnn", Some(&variant), format!("fbcnn_q{}", quality), 256);
    spec.local_paths = vec![
        format!("./models/fbcnn/{}", file),
        format!("./{}", file),
        format!("~/.cache/fbcnn/{}", file),
    ];
    spec.remote_urls = github_triplet("jiaxi-jiang/FBCNN", &file);
    spec.module_keys = vec!["FBCNN".into()];
    spec.homepage = Some("https://github.com/jiaxi-jiang/FBCNN".into());
    spec.instructions = Some(manual_steps(
        "https://github.com/jiaxi-jiang/FBCNN",
        &file,
        &format!("./models/fbcnn/{}", file),
    ));
    spec
}

fn zero_dce(variant: &str) -> ModelSpec {
    let file = format!("{}.pth", variant);
    let mut spec = image_spec("zero-dce", Some(variant), variant.replace('-', "_"), 256);
    spec.local_paths = vec![
        format!("./models/{}/{}", variant, file),
        format!("./{}", file),
        format!("~/.cache/{}/{}", variant, file),
    ];
    spec.remote_urls = github_triplet("Li-Chongyi/Zero-DCE", &file);
    spec.module_keys = vec!["DCE_net".into()];
    spec.homepage = Some("https://github.com/Li-Chongyi/Zero-DCE".into());
    spec.instructions = Some(manual_steps(
        "https://github.com/Li-Chongyi/Zero-DCE",
        &format!("the {} checkpoint", variant.to_uppercase()),
        &format!("./models/{}/{}", variant, file),
    ));
    spec
}

fn scunet() -> ModelSpec {
    let mut spec = image_spec("scunet", None, "scunet".into(), 256);
    spec.local_paths = vec![
        "./models/scunet/scunet.pth".into(),
        "./scunet.pth".into(),
        "~/.cache/scunet/scunet.pth".into(),
    ];
    spec.remote_urls = github_triplet("cszn/SCUNet", "scunet.pth");
    spec.homepage = Some("https://github.com/cszn/SCUNet".into());
    spec.instructions = Some(manual_steps(
        "https://github.com/cszn/SCUNet",
        "scunet.pth",
        "./models/scunet/scunet.pth",
    ));
    spec
}

fn deoldify(variant: &str, file: &str, builder: &str) -> ModelSpec {
    let mut spec = image_spec(
        "deoldify",
        Some(variant),
        format!("deoldify_{}", variant),
        512,
    );
    spec.local_paths = vec![
        format!("./models/deoldify/{}.pth", variant),
        format!("./deoldify_{}.pth", variant),
        format!("~/.cache/deoldify/{}.pth", variant),
        format!("./DeOldify/models/{}", file),
    ];
    spec.remote_urls = vec![
        format!("https://data.deepai.org/deoldify/{}", file),
        format!(
            "https://github.com/jantic/DeOldify/releases/download/v1.0/{}",
            file
        ),
    ];
    spec.download_dir = Some("./models/deoldify".into());
    spec.module_keys = vec!["generator".into()];
    spec.architecture = Some(ArchitectureSpec {
        builder: format!("deoldify.generators:{}", builder),
        kwargs: serde_json::json!({
            "root_folder": { "$path": "./DeOldify" },
            "weights_name": file.trim_end_matches(".pth")
        })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        variant: Some(variant.to_string()),
        python_path: vec!["./DeOldify".into()],
    });
    spec.requirements = torch_requirements(&[
        ("deoldify", "git+https://github.com/jantic/DeOldify"),
        ("fastai", "fastai"),
        ("torchvision", "torchvision"),
    ]);
    spec.homepage = Some("https://github.com/jantic/DeOldify".into());
    spec.instructions = Some(format!(
        "{}\nThe architecture needs the DeOldify sources: git clone https://github.com/jantic/DeOldify",
        manual_steps(
            "https://github.com/jantic/DeOldify",
            file,
            &format!("./models/deoldify/{}.pth", variant)
        )
    ));
    spec
}

fn ai_detector(model_id: &str, weights_file: &str, opset: u32) -> ModelSpec {
    let slug = slugify(&model_id.replace('/', "_"));
    ModelSpec {
        identifier: "ai-detector".into(),
        variant: Some(model_id.to_string()),
        slug: slug.clone(),
        inputs: vec![
            InputSpec::new("input_ids", &[1, 16], TensorDtype::Int64),
            InputSpec::new("attention_mask", &[1, 16], TensorDtype::Int64),
        ],
        output_names: vec!["logits".into()],
        dynamic_axes: text_axes(),
        local_paths: vec![
            format!("./models/{}/{}", slug, weights_file),
            format!("~/.cache/onnxport/{}/{}", slug, weights_file),
        ],
        remote_urls: vec![format!(
            "https://huggingface.co/{}/resolve/main/{}",
            model_id, weights_file
        )],
        download_dir: Some(format!("./models/.cache/{}", slug)),
        module_keys: Vec::new(),
        architecture: Some(ArchitectureSpec {
            builder: "hf-auto:AutoModelForSequenceClassification".into(),
            kwargs: serde_json::json!({ "pretrained": model_id })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            variant: Some(model_id.to_string()),
            python_path: Vec::new(),
        }),
        opset,
        quantize: true,
        sidecar_source: Some(model_id.to_string()),
        requirements: torch_requirements(&[
            ("transformers", "transformers"),
            ("onnxruntime", "onnxruntime"),
        ]),
        homepage: Some(format!("https://huggingface.co/{}", model_id)),
        instructions: Some(format!(
            "1. Visit: https://huggingface.co/{id}\n2. Accept the model terms if the repository is gated\n3. Set HF_TOKEN or run `huggingface-cli login`, or download {file} to ./models/{slug}/",
            id = model_id,
            file = weights_file,
            slug = slug
        )),
    }
}

fn builtin_specs() -> Vec<ModelSpec> {
    vec![
        realesrgan("x4plus", "RealESRGAN_x4plus.pth", "v0.1.0", 23),
        realesrgan("anime_6B", "RealESRGAN_x4plus_anime_6B.pth", "v0.2.2.4", 6),
        fbcnn(10),
        fbcnn(20),
        fbcnn(30),
        fbcnn(40),
        zero_dce("zero-dce"),
        zero_dce("zero-dce++"),
        scunet(),
        deoldify("artistic", "ColorizeArtistic_gen.pth", "gen_inference_deep"),
        deoldify("stable", "ColorizeStable_gen.pth", "gen_inference_wide"),
        ai_detector("openai-community/roberta-base-openai-detector", "pytorch_model.bin", 11),
        ai_detector("openai-community/roberta-large-openai-detector", "pytorch_model.bin", 11),
        ai_detector("desklib/ai-text-detector-v1.01", "model.safetensors", 11),
        ai_detector("fakespot-ai/roberta-base-ai-text-detection-v1", "model.safetensors", 17),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locate::SourceKind;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_specs_are_valid_exports() {
        for spec in ModelRegistry::builtin().specs() {
            for tensor in spec.dynamic_axes.keys() {
                assert!(
                    spec.inputs.iter().any(|i| &i.name == tensor)
                        || spec.output_names.contains(tensor),
                    "{} declares axes for unknown tensor {}",
                    spec.display_name(),
                    tensor
                );
            }
            assert!(!spec.candidates().is_empty(), "{}", spec.display_name());
        }
    }

    #[test]
    fn test_lookup_default_and_named_variant() {
        let registry = ModelRegistry::builtin();
        let first = registry.lookup("fbcnn", None).unwrap();
        assert_eq!(first.variant.as_deref(), Some("q10"));

        let q30 = registry.lookup("fbcnn", Some("q30")).unwrap();
        assert_eq!(q30.slug, "fbcnn_q30");
        assert_eq!(q30.inputs[0].shape, vec![1, 3, 256, 256]);
    }

    #[test]
    fn test_lookup_errors() {
        let registry = ModelRegistry::builtin();
        assert!(matches!(
            registry.lookup("nope", None),
            Err(OnnxportError::UnknownModel { .. })
        ));
        let err = registry.lookup("deoldify", Some("backbone-lite")).unwrap_err();
        assert!(err.to_string().contains("artistic, stable"));
    }

    #[test]
    fn test_deoldify_variants_bind_distinct_builders() {
        let registry = ModelRegistry::builtin();
        let artistic = registry.lookup("deoldify", Some("artistic")).unwrap();
        let stable = registry.lookup("deoldify", Some("stable")).unwrap();
        let a = artistic.architecture.as_ref().unwrap();
        let s = stable.architecture.as_ref().unwrap();
        assert_ne!(a.builder, s.builder);
        assert_eq!(s.variant.as_deref(), Some("stable"));
        assert!(stable.remote_urls[0].ends_with("ColorizeStable_gen.pth"));
    }

    #[test]
    fn test_candidates_locals_first() {
        let registry = ModelRegistry::builtin();
        let spec = registry.lookup("scunet", None).unwrap();
        let candidates = spec.candidates();
        assert!(candidates[..3].iter().all(|c| c.is_local()));
        assert_eq!(
            candidates[3].kind,
            SourceKind::RemoteUrl("https://github.com/cszn/SCUNet/releases/download/v1.0/scunet.pth".into())
        );
        assert_eq!(spec.download_dir(), PathBuf::from("./models/scunet"));
    }

    #[test]
    fn test_ai_detector_spec() {
        let registry = ModelRegistry::builtin();
        let spec = registry
            .lookup("ai-detector", Some("fakespot-ai/roberta-base-ai-text-detection-v1"))
            .unwrap();
        assert_eq!(spec.opset, 17);
        assert_eq!(spec.slug, "fakespot-ai_roberta-base-ai-text-detection-v1");
        assert!(spec.quantize);
        assert_eq!(spec.inputs[0].dtype, TensorDtype::Int64);
        assert_eq!(spec.dynamic_axes["logits"][&0], "batch_size");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Desklib/AI Text Detector"), "desklib_ai_text_detector");
        assert_eq!(slugify("zero-dce++"), "zero-dce");
    }

    #[test]
    fn test_extend_from_json_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("models.json");
        std::fs::write(
            &path,
            r#"[{
                "identifier": "mynet",
                "slug": "mynet",
                "inputs": [{"name": "input", "shape": [1, 3, 64, 64]}],
                "dynamic_axes": {"input": {"2": "height"}},
                "remote_urls": ["https://example.com/mynet.pth"]
            }]"#,
        )
        .unwrap();

        let mut registry = ModelRegistry::builtin();
        assert_eq!(registry.extend_from_json_file(&path).unwrap(), 1);
        let spec = registry.lookup("mynet", None).unwrap();
        assert_eq!(spec.opset, 11);
        assert_eq!(spec.output_names, vec!["output"]);
        assert_eq!(spec.dynamic_axes["input"][&2], "height");
    }

    #[test]
    fn test_invalid_registry_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(ModelRegistry::empty().extend_from_json_file(&path).is_err());
        assert!(ModelRegistry::empty()
            .extend_from_json_file(&temp.path().join("absent.json"))
            .is_err());
    }
}
