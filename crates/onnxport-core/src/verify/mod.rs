//! Structural verification of exported ONNX graphs.
//!
//! The artifact is decoded natively and checked for a coherent model header,
//! typed graph inputs and outputs, a well-formed node graph and consistent
//! initializers. Verification failures are reported, never raised: the caller
//! decides whether an invalid graph is worth a warning or an error.

pub mod proto;

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use crate::export::AxisConfig;
use proto::{
    element_size, element_type_name, is_known_element_type, tensor_shape_proto::dimension,
    type_proto, GraphProto, ModelProto, ValueInfoProto,
};

/// A single dimension of a graph input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Dim {
    Fixed(i64),
    Symbolic(String),
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(v) => write!(f, "{}", v),
            Dim::Symbolic(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorSignature {
    pub name: String,
    pub elem_type: String,
    pub dims: Vec<Dim>,
}

/// What a valid graph looks like from the outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphSummary {
    pub ir_version: i64,
    pub producer: String,
    pub opsets: Vec<(String, i64)>,
    pub inputs: Vec<TensorSignature>,
    pub outputs: Vec<TensorSignature>,
    pub node_count: usize,
    pub initializer_count: usize,
}

impl GraphSummary {
    /// Default-domain opset version.
    pub fn opset(&self) -> Option<i64> {
        self.opsets
            .iter()
            .find(|(domain, _)| domain.is_empty() || domain == "ai.onnx")
            .map(|(_, version)| *version)
    }

    /// Declared dynamic axes that are not symbolic in the graph.
    pub fn check_dynamic_axes(&self, axes: &AxisConfig) -> Vec<String> {
        let mut problems = Vec::new();
        for (tensor, dims) in axes {
            let Some(signature) = self
                .inputs
                .iter()
                .chain(self.outputs.iter())
                .find(|s| &s.name == tensor)
            else {
                problems.push(format!("tensor '{}' is not a graph input or output", tensor));
                continue;
            };
            for (index, expected) in dims {
                match signature.dims.get(*index) {
                    Some(Dim::Symbolic(_)) => {}
                    Some(Dim::Fixed(value)) => problems.push(format!(
                        "'{}' axis {} ({}) is fixed at {}",
                        tensor, index, expected, value
                    )),
                    None => problems.push(format!(
                        "'{}' has no axis {} ({})",
                        tensor, index, expected
                    )),
                }
            }
        }
        problems
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid(GraphSummary),
    Invalid { detail: String },
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid(_))
    }
}

pub struct OnnxVerifier;

impl OnnxVerifier {
    pub async fn verify(path: &Path) -> Verification {
        match tokio::fs::read(path).await {
            Ok(bytes) => Self::verify_bytes(&bytes),
            Err(e) => Verification::Invalid {
                detail: format!("cannot read {}: {}", path.display(), e),
            },
        }
    }

    pub fn verify_bytes(bytes: &[u8]) -> Verification {
        let model = match ModelProto::decode_bytes(bytes) {
            Ok(model) => model,
            Err(e) => {
                return Verification::Invalid {
                    detail: format!("not an ONNX model: {}", e),
                }
            }
        };
        match check_model(&model) {
            Ok(summary) => Verification::Valid(summary),
            Err(detail) => Verification::Invalid { detail },
        }
    }
}

fn check_model(model: &ModelProto) -> Result<GraphSummary, String> {
    if model.ir_version <= 0 {
        return Err("ir_version is not set".to_string());
    }
    if model.opset_import.is_empty() {
        return Err("model declares no opset imports".to_string());
    }
    if !model
        .opset_import
        .iter()
        .any(|o| (o.domain.is_empty() || o.domain == "ai.onnx") && o.version > 0)
    {
        return Err("no opset import for the default domain".to_string());
    }

    let graph = model.graph.as_ref().ok_or("model has no graph")?;
    if graph.input.is_empty() {
        return Err("graph has no inputs".to_string());
    }
    if graph.output.is_empty() {
        return Err("graph has no outputs".to_string());
    }

    let inputs = graph
        .input
        .iter()
        .map(|v| signature(v, "input"))
        .collect::<Result<Vec<_>, _>>()?;
    let outputs = graph
        .output
        .iter()
        .map(|v| signature(v, "output"))
        .collect::<Result<Vec<_>, _>>()?;

    check_initializers(graph)?;
    check_topology(graph)?;

    Ok(GraphSummary {
        ir_version: model.ir_version,
        producer: model.producer_name.clone(),
        opsets: model
            .opset_import
            .iter()
            .map(|o| (o.domain.clone(), o.version))
            .collect(),
        inputs,
        outputs,
        node_count: graph.node.len(),
        initializer_count: graph.initializer.len(),
    })
}

fn signature(value: &ValueInfoProto, role: &str) -> Result<TensorSignature, String> {
    if value.name.is_empty() {
        return Err(format!("graph {} without a name", role));
    }
    let tensor = match value.r#type.as_ref().and_then(|t| t.value.as_ref()) {
        Some(type_proto::Value::TensorType(tensor)) => tensor,
        None => return Err(format!("{} '{}' is not a tensor", role, value.name)),
    };
    if !is_known_element_type(tensor.elem_type) {
        return Err(format!(
            "{} '{}' has unknown element type {}",
            role, value.name, tensor.elem_type
        ));
    }
    // Unknown rank is legal; leave dims empty.
    let shape_dims = tensor.shape.as_ref().map(|s| s.dim.as_slice()).unwrap_or(&[]);

    let mut dims = Vec::with_capacity(shape_dims.len());
    for (index, dim) in shape_dims.iter().enumerate() {
        match &dim.value {
            Some(dimension::Value::DimValue(v)) if *v > 0 => dims.push(Dim::Fixed(*v)),
            Some(dimension::Value::DimParam(p)) if !p.trim().is_empty() => {
                dims.push(Dim::Symbolic(p.clone()))
            }
            _ => {
                return Err(format!(
                    "{} '{}' axis {} is neither a positive size nor a symbolic name",
                    role, value.name, index
                ))
            }
        }
    }

    Ok(TensorSignature {
        name: value.name.clone(),
        elem_type: element_type_name(tensor.elem_type).to_string(),
        dims,
    })
}

fn check_initializers(graph: &GraphProto) -> Result<(), String> {
    for init in &graph.initializer {
        if init.name.is_empty() {
            return Err("initializer without a name".to_string());
        }
        if init.dims.iter().any(|d| *d < 0) {
            return Err(format!("initializer '{}' has a negative dimension", init.name));
        }
        if init.raw_data.is_empty() || init.data_location == 1 {
            continue;
        }
        if let Some(width) = element_size(init.data_type) {
            let expected = init
                .dims
                .iter()
                .try_fold(1usize, |acc, d| acc.checked_mul(usize::try_from(*d).ok()?))
                .and_then(|count| count.checked_mul(width))
                .ok_or_else(|| {
                    format!(
                        "initializer '{}' shape {:?} overflows the addressable size",
                        init.name, init.dims
                    )
                })?;
            if init.raw_data.len() != expected {
                return Err(format!(
                    "initializer '{}' holds {} bytes, shape {:?} of {} needs {}",
                    init.name,
                    init.raw_data.len(),
                    init.dims,
                    element_type_name(init.data_type),
                    expected
                ));
            }
        }
    }
    Ok(())
}

fn check_topology(graph: &GraphProto) -> Result<(), String> {
    let mut available: HashSet<&str> = graph.input.iter().map(|v| v.name.as_str()).collect();
    available.extend(graph.initializer.iter().map(|t| t.name.as_str()));

    for (index, node) in graph.node.iter().enumerate() {
        let label = if node.name.is_empty() {
            format!("#{} ({})", index, node.op_type)
        } else {
            format!("'{}' ({})", node.name, node.op_type)
        };
        if node.op_type.is_empty() {
            return Err(format!("node {} has no op_type", label));
        }
        for input in node.input.iter().filter(|i| !i.is_empty()) {
            if !available.contains(input.as_str()) {
                return Err(format!(
                    "node {} reads '{}' before it is produced",
                    label, input
                ));
            }
        }
        for output in node.output.iter().filter(|o| !o.is_empty()) {
            if !available.insert(output.as_str()) {
                return Err(format!("node {} redefines '{}'", label, output));
            }
        }
    }

    for output in &graph.output {
        if !available.contains(output.name.as_str()) {
            return Err(format!("graph output '{}' is never produced", output.name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::proto::*;
    use super::*;
    use prost::Message;
    use std::collections::BTreeMap;

    fn dim_value(v: i64) -> tensor_shape_proto::Dimension {
        tensor_shape_proto::Dimension {
            value: Some(dimension::Value::DimValue(v)),
            denotation: String::new(),
        }
    }

    fn dim_param(p: &str) -> tensor_shape_proto::Dimension {
        tensor_shape_proto::Dimension {
            value: Some(dimension::Value::DimParam(p.to_string())),
            denotation: String::new(),
        }
    }

    fn value_info(name: &str, dims: Vec<tensor_shape_proto::Dimension>) -> ValueInfoProto {
        ValueInfoProto {
            name: name.to_string(),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: 1,
                    shape: Some(TensorShapeProto { dim: dims }),
                })),
            }),
        }
    }

    fn relu_model() -> ModelProto {
        ModelProto {
            ir_version: 7,
            producer_name: "pytorch".into(),
            producer_version: String::new(),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: 11,
            }],
            graph: Some(GraphProto {
                name: "g".into(),
                node: vec![NodeProto {
                    input: vec!["input".into(), "scale".into()],
                    output: vec!["output".into()],
                    name: "mul".into(),
                    op_type: "Mul".into(),
                    domain: String::new(),
                }],
                initializer: vec![TensorProto {
                    dims: vec![1],
                    data_type: 1,
                    name: "scale".into(),
                    raw_data: 2.0f32.to_le_bytes().to_vec(),
                    data_location: 0,
                }],
                input: vec![value_info(
                    "input",
                    vec![dim_value(1), dim_value(3), dim_param("height"), dim_param("width")],
                )],
                output: vec![value_info(
                    "output",
                    vec![dim_value(1), dim_value(3), dim_param("height"), dim_param("width")],
                )],
                value_info: vec![],
            }),
        }
    }

    fn verify(model: &ModelProto) -> Verification {
        OnnxVerifier::verify_bytes(&model.encode_to_vec())
    }

    #[test]
    fn test_valid_model_summary() {
        let Verification::Valid(summary) = verify(&relu_model()) else {
            panic!("expected valid model");
        };
        assert_eq!(summary.opset(), Some(11));
        assert_eq!(summary.inputs[0].dims[2], Dim::Symbolic("height".into()));
        assert_eq!(summary.inputs[0].elem_type, "float32");
        assert_eq!(summary.node_count, 1);
    }

    #[test]
    fn test_garbage_is_invalid() {
        let result = OnnxVerifier::verify_bytes(b"\xff\xff\xff not protobuf");
        assert!(!result.is_valid());
    }

    #[test]
    fn test_missing_opset_is_invalid() {
        let mut model = relu_model();
        model.opset_import.clear();
        assert!(!verify(&model).is_valid());
    }

    #[test]
    fn test_dangling_node_input_is_invalid() {
        let mut model = relu_model();
        model.graph.as_mut().unwrap().node[0].input[1] = "missing".into();
        let Verification::Invalid { detail } = verify(&model) else {
            panic!("expected invalid model");
        };
        assert!(detail.contains("missing"));
    }

    #[test]
    fn test_unproduced_output_is_invalid() {
        let mut model = relu_model();
        model.graph.as_mut().unwrap().node.clear();
        assert!(!verify(&model).is_valid());
    }

    #[test]
    fn test_raw_data_length_mismatch_is_invalid() {
        let mut model = relu_model();
        model.graph.as_mut().unwrap().initializer[0].dims = vec![2];
        let Verification::Invalid { detail } = verify(&model) else {
            panic!("expected invalid model");
        };
        assert!(detail.contains("scale"));
    }

    #[test]
    fn test_oversized_initializer_shape_is_invalid() {
        let mut model = relu_model();
        model.graph.as_mut().unwrap().initializer[0].dims = vec![1 << 40, 1 << 40];
        let Verification::Invalid { detail } = verify(&model) else {
            panic!("expected invalid model");
        };
        assert!(detail.contains("overflows"));
    }

    #[test]
    fn test_unknown_rank_output_is_valid() {
        let mut model = relu_model();
        let output = &mut model.graph.as_mut().unwrap().output[0];
        if let Some(TypeProto {
            value: Some(type_proto::Value::TensorType(tensor)),
        }) = output.r#type.as_mut()
        {
            tensor.shape = None;
        }
        let Verification::Valid(summary) = verify(&model) else {
            panic!("expected valid model");
        };
        assert!(summary.outputs[0].dims.is_empty());

        let mut axes = AxisConfig::new();
        axes.insert("output".into(), BTreeMap::from([(2, "height".to_string())]));
        let problems = summary.check_dynamic_axes(&axes);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("no axis 2"));
    }

    #[test]
    fn test_zero_dim_is_invalid() {
        let mut model = relu_model();
        model.graph.as_mut().unwrap().input[0] = value_info("input", vec![dim_value(0)]);
        assert!(!verify(&model).is_valid());
    }

    #[test]
    fn test_check_dynamic_axes() {
        let Verification::Valid(summary) = verify(&relu_model()) else {
            panic!("expected valid model");
        };
        let mut axes = AxisConfig::new();
        axes.insert(
            "input".into(),
            BTreeMap::from([(2, "height".to_string()), (3, "width".to_string())]),
        );
        assert!(summary.check_dynamic_axes(&axes).is_empty());

        axes.insert("output".into(), BTreeMap::from([(0, "batch".to_string())]));
        let problems = summary.check_dynamic_axes(&axes);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("fixed at 1"));
    }

    #[tokio::test]
    async fn test_verify_unreadable_path() {
        let result = OnnxVerifier::verify(Path::new("/nonexistent/model.onnx")).await;
        assert!(matches!(result, Verification::Invalid { .. }));
    }
}
