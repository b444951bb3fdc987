pub mod operators;
pub mod weights;
pub mod tensor;
pub mod node;
pub mod pytorch;
pub mod quantize;
pub mod onnx;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tensor::*;
use crate::weights::{BinOutputManager, EmbeddedOutputManager, WeightExternalOutputManager};

/// Default-domain operator set the exported graphs target.
pub const OPSET_VERSION: i64 = 17;

/// Key of the JSON metadata properties attached to the model and its inputs/outputs.
pub const METADATA_KEY: &str = "onnx_export";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Shape error: {0}")]
    InputShapeError(String),
    #[error("Mismatched dtypes {0} and {1}")]
    DTypeMismatchError(DType, DType),
    #[error("Invalid input: {0}")]
    InvalidInputError(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Unsupported dtype {0}")]
    UnsupportedDTypeError(String),
    #[error("Tensor name {0} is used twice")]
    NameConflictError(String),
    #[error("No such tensor: {0}")]
    NoSuchTensorError(String),
    #[error("Dimension {0} has no static value")]
    UnresolvedDimensionError(String),
    #[error("Invalid dtype {0}")]
    InvalidDTypeError(DType),
    #[error("Tensor data cannot be resolved while building the graph")]
    CannotResolveDataError,
    #[error("Embedded weights need {0} bytes, above the protobuf limit; use an external data file")]
    EmbeddedDataTooLargeError(usize),
    #[error(transparent)]
    SafeTensorError(#[from] safetensors::SafeTensorError),
    #[error(transparent)]
    CandleCoreError(#[from] candle_core::Error),
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

/// Where initializer bytes end up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WeightStorageStrategy {
    /// Inline `raw_data` inside `model.onnx`.
    EmbeddedData,
    /// A sidecar file referenced through `external_data`.
    BinFile(PathBuf),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelInputType {
    TokenIds,
    AttentionMask,
    TokenTypeIds,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelOutputType {
    Logits,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMetadata {
    pub model_input_type: ModelInputType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMetadata {
    pub model_output_type: ModelOutputType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationMetadata {
    pub scheme: String,
    pub min_elements: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub source: String,
    pub architecture: String,
    pub labels: BTreeMap<usize, String>,
    pub quantization: Option<QuantizationMetadata>,
    pub max_sequence_length: Option<usize>,
}

fn metadata_entry<T: Serialize>(value: &T) -> Result<onnx::StringStringEntryProto, Error> {
    Ok(onnx::StringStringEntryProto {
        key: METADATA_KEY.to_string(),
        value: serde_json::to_string(value)?,
    })
}

/// Every tensor reachable from `outputs`, each listed after all of its inputs.
fn topological_order<'a>(outputs: &'a [(String, Arc<dyn Tensor>, Option<OutputMetadata>)]) -> Vec<&'a dyn Tensor> {
    let mut order = vec![];
    let mut visited: HashSet<&'a dyn Tensor> = HashSet::new();
    let mut stack: Vec<(&'a dyn Tensor, bool)> = outputs.iter().rev().map(|(_, tensor, _)| (tensor.as_ref(), false)).collect();
    while let Some((tensor, expanded)) = stack.pop() {
        if expanded {
            order.push(tensor);
            continue;
        }
        if !visited.insert(tensor) {
            continue;
        }
        stack.push((tensor, true));
        if let Some(node) = tensor.as_node() {
            for input in node.get_input_tensors().into_iter().rev() {
                if !visited.contains(&input) {
                    stack.push((input, false));
                }
            }
        }
    }
    order
}

fn unique_name(base: String, chosen: &mut HashSet<String>) -> String {
    let mut name = base.clone();
    let mut suffix = 1;
    while chosen.contains(&name) {
        name = format!("{base}_{suffix}");
        suffix += 1;
    }
    chosen.insert(name.clone());
    name
}

pub fn build_proto(
    inputs: &[(Arc<dyn Tensor>, Option<InputMetadata>)],
    outputs: &[(String, Arc<dyn Tensor>, Option<OutputMetadata>)],
    weight_storage: &WeightStorageStrategy,
    model_metadata: Option<&ModelMetadata>,
) -> Result<onnx::ModelProto, Error> {
    let tensors = topological_order(outputs);
    log::debug!("{} tensors reachable from {} outputs", tensors.len(), outputs.len());

    // Every declared input must be a graph input that the outputs actually depend on.
    for (input, _) in inputs {
        if !input.is_input() {
            return Err(Error::InvalidInputError(format!("{:?} is not an input tensor", input.get_name())));
        }
        if !tensors.contains(&input.as_ref()) {
            return Err(Error::InvalidInputError(format!("input {:?} is not used by any output", input.get_name())));
        }
    }

    // Assign tensor names: outputs first, then requested names, then generated ones
    let mut chosen_names: HashSet<String> = HashSet::new();
    let mut tensor_names: HashMap<&dyn Tensor, String> = HashMap::new();
    for (name, tensor, _) in outputs {
        if !chosen_names.insert(name.clone()) {
            return Err(Error::NameConflictError(name.clone()));
        }
        tensor_names.insert(tensor.as_ref(), name.clone());
    }
    for tensor in &tensors {
        if tensor_names.contains_key(tensor) {
            continue;
        }
        if let Some(name) = tensor.get_name() {
            if !chosen_names.insert(name.to_string()) {
                return Err(Error::NameConflictError(name.to_string()));
            }
            tensor_names.insert(*tensor, name.to_string());
        }
    }

    // Node names double as the base of the node's output tensor name
    let mut node_names: HashSet<String> = HashSet::new();
    let mut next_node_id: HashMap<String, usize> = HashMap::new();
    let mut nodes = vec![];
    for tensor in &tensors {
        if let Some(node) = tensor.as_node() {
            let base = match node.get_name() {
                Some(name) => name.to_string(),
                None => {
                    let id = next_node_id.entry(node.get_onnx_type().to_string()).or_insert(0);
                    *id += 1;
                    format!("{}_{}", node.get_onnx_type(), *id - 1)
                }
            };
            let node_name = unique_name(base, &mut node_names);
            if !tensor_names.contains_key(tensor) {
                let tensor_name = unique_name(format!("{node_name}_output"), &mut chosen_names);
                tensor_names.insert(*tensor, tensor_name);
            }
            nodes.push((node, node_name, *tensor));
        }
        else if !tensor_names.contains_key(tensor) {
            let tensor_name = unique_name(format!("tensor_{}", tensor_names.len()), &mut chosen_names);
            tensor_names.insert(*tensor, tensor_name);
        }
    }

    let mut embedded_manager;
    let mut bin_manager;
    let data_manager: &mut dyn WeightExternalOutputManager = match weight_storage {
        WeightStorageStrategy::EmbeddedData => {
            embedded_manager = EmbeddedOutputManager::new();
            &mut embedded_manager
        }
        WeightStorageStrategy::BinFile(path) => {
            bin_manager = BinOutputManager::new(path)?;
            &mut bin_manager
        }
    };
    for tensor in &tensors {
        tensor.gather_weights(data_manager)?;
    }
    data_manager.finalize_tensor_data()?;
    log::debug!("Gathered weights with {:?}", weight_storage);

    let mut initializers = vec![];
    let mut value_info = vec![];
    for tensor in &tensors {
        let name = tensor_names[tensor].clone();
        if let Some(initializer) = tensor.get_initializer(name.clone(), data_manager)? {
            initializers.push(initializer);
        }
        else if tensor.as_node().is_some() && !outputs.iter().any(|(_, t, _)| t.as_ref() == *tensor) {
            value_info.push(tensor.to_value_info_proto(name));
        }
    }

    let mut node_protos = vec![];
    for (node, node_name, output) in nodes {
        node_protos.push(node.to_node_proto(node_name, tensor_names[&output].clone(), &tensor_names)?);
    }

    let mut input_protos = vec![];
    for (tensor, metadata) in inputs {
        let mut proto = tensor.to_value_info_proto(tensor_names[&tensor.as_ref()].clone());
        if let Some(metadata) = metadata {
            proto.metadata_props.push(metadata_entry(metadata)?);
        }
        input_protos.push(proto);
    }
    let mut output_protos = vec![];
    for (name, tensor, metadata) in outputs {
        let mut proto = tensor.to_value_info_proto(name.clone());
        if let Some(metadata) = metadata {
            proto.metadata_props.push(metadata_entry(metadata)?);
        }
        output_protos.push(proto);
    }

    let graph = onnx::GraphProto {
        name: model_metadata.map(|m| m.architecture.clone()).unwrap_or_default(),
        node: node_protos,
        initializer: initializers,
        input: input_protos,
        output: output_protos,
        value_info,
        .. Default::default()
    };

    let metadata_props = match model_metadata {
        Some(metadata) => vec![metadata_entry(metadata)?],
        None => vec![],
    };

    Ok(onnx::ModelProto {
        ir_version: onnx::Version::IrVersion2021730 as i64,
        opset_import: vec![onnx::OperatorSetIdProto {
            domain: String::new(),
            version: OPSET_VERSION,
        }],
        producer_name: "onnx-export".to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: Some(graph),
        metadata_props,
        .. Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{Add, MatMul, Tanh};
    use crate::tensor::{InitializerTensor, InputTensor};

    fn tiny_graph() -> (Vec<(Arc<dyn Tensor>, Option<InputMetadata>)>, Vec<(String, Arc<dyn Tensor>, Option<OutputMetadata>)>) {
        let batch = Dimension::symbolic("batch_size");
        let x: Arc<dyn Tensor> = InputTensor::new("x".to_string(), DType::F32, Shape::new(vec![batch, Dimension::fixed(2)]));
        let w = InitializerTensor::new(
            "w".to_string(),
            TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0].into(), Shape::from(vec![2usize, 2])).unwrap(),
        );
        let b = InitializerTensor::new("b".to_string(), TensorData::vector(vec![0.5f32, -0.5]));
        let h = MatMul::new(None, x.clone(), w).unwrap();
        let h = Add::new(Some("dense".to_string()), h, b).unwrap();
        let y: Arc<dyn Tensor> = Tanh::new(None, h);
        (
            vec![(x, Some(InputMetadata { model_input_type: ModelInputType::TokenIds }))],
            vec![("y".to_string(), y, Some(OutputMetadata { model_output_type: ModelOutputType::Logits }))],
        )
    }

    #[test]
    fn nodes_are_topologically_ordered() {
        let (inputs, outputs) = tiny_graph();
        let model = build_proto(&inputs, &outputs, &WeightStorageStrategy::EmbeddedData, None).unwrap();
        let graph = model.graph.unwrap();

        let mut defined: HashSet<String> = graph.input.iter().map(|x| x.name.clone()).collect();
        defined.extend(graph.initializer.iter().map(|x| x.name.clone()));
        for node in &graph.node {
            for input in &node.input {
                assert!(defined.contains(input), "{} used before definition", input);
            }
            defined.extend(node.output.iter().cloned());
        }
        let op_types: Vec<_> = graph.node.iter().map(|x| x.op_type.as_str()).collect();
        assert_eq!(op_types, vec!["MatMul", "Add", "Tanh"]);
        assert_eq!(graph.node[1].name, "dense");
        assert_eq!(graph.node.last().unwrap().output, vec!["y".to_string()]);
    }

    #[test]
    fn embedded_initializers_carry_raw_data() {
        let (inputs, outputs) = tiny_graph();
        let model = build_proto(&inputs, &outputs, &WeightStorageStrategy::EmbeddedData, None).unwrap();
        let graph = model.graph.unwrap();
        let w = graph.initializer.iter().find(|x| x.name == "w").unwrap();
        assert_eq!(w.dims, vec![2, 2]);
        assert_eq!(w.raw_data.len(), 16);
        assert_eq!(model.opset_import[0].version, OPSET_VERSION);
    }

    #[test]
    fn external_initializers_point_into_bin_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx_data");
        let (inputs, outputs) = tiny_graph();
        let model = build_proto(&inputs, &outputs, &WeightStorageStrategy::BinFile(path.clone()), None).unwrap();
        let file_len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(file_len, 16 + 8);
        for initializer in &model.graph.unwrap().initializer {
            assert!(initializer.raw_data.is_empty());
            let entries: HashMap<_, _> = initializer.external_data.iter().map(|x| (x.key.as_str(), x.value.as_str())).collect();
            assert_eq!(entries["location"], "model.onnx_data");
            let offset: u64 = entries["offset"].parse().unwrap();
            let length: u64 = entries["length"].parse().unwrap();
            assert!(offset + length <= file_len);
        }
    }

    #[test]
    fn repeated_builds_are_identical() {
        let (inputs, outputs) = tiny_graph();
        let a = build_proto(&inputs, &outputs, &WeightStorageStrategy::EmbeddedData, None).unwrap();
        let b = build_proto(&inputs, &outputs, &WeightStorageStrategy::EmbeddedData, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn metadata_is_attached_as_json() {
        let (inputs, outputs) = tiny_graph();
        let metadata = ModelMetadata {
            source: "local/tiny".to_string(),
            architecture: "test".to_string(),
            labels: BTreeMap::from([(0, "score".to_string())]),
            quantization: None,
            max_sequence_length: Some(16),
        };
        let model = build_proto(&inputs, &outputs, &WeightStorageStrategy::EmbeddedData, Some(&metadata)).unwrap();
        assert_eq!(model.metadata_props[0].key, METADATA_KEY);
        let parsed: ModelMetadata = serde_json::from_str(&model.metadata_props[0].value).unwrap();
        assert_eq!(parsed, metadata);
        let graph = model.graph.unwrap();
        let input_meta: InputMetadata = serde_json::from_str(&graph.input[0].metadata_props[0].value).unwrap();
        assert_eq!(input_meta.model_input_type, ModelInputType::TokenIds);
    }

    #[test]
    fn unused_input_is_rejected() {
        let (mut inputs, outputs) = tiny_graph();
        let unused: Arc<dyn Tensor> = InputTensor::new("unused".to_string(), DType::I64, Shape::from(vec![1usize]));
        inputs.push((unused, None));
        let err = build_proto(&inputs, &outputs, &WeightStorageStrategy::EmbeddedData, None);
        assert!(matches!(err, Err(Error::InvalidInputError(_))));
    }
}
