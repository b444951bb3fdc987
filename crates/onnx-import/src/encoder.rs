use std::sync::Arc;
use log::{debug, info};
use onnx_graph::operators::{Add, Constant, Equal, Gather, MatMul, Mul, Not, ShapeOp, Slice, Softmax, Sub, Tanh, Transpose};
use onnx_graph::pytorch;
use onnx_graph::quantize::QUANTIZATION_SCHEME;
use onnx_graph::tensor::{DType, Dimension, InputTensor, Shape, Tensor, TensorData};
use onnx_graph::weights::WeightManager;
use onnx_graph::{InputMetadata, ModelInputType, ModelMetadata, ModelOutputType, OutputMetadata, QuantizationMetadata};
use crate::config::{Activation, Architecture, EncoderConfig};
use crate::loader::PretrainedModel;
use crate::ConversionError;

/// Linear weights below this many elements stay float when quantizing.
pub const DEFAULT_QUANTIZE_MIN_ELEMENTS: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphOptions {
    /// Store large linear weights as per-row int8.
    pub quantize: bool,
    pub quantize_min_elements: usize,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            quantize: false,
            quantize_min_elements: DEFAULT_QUANTIZE_MIN_ELEMENTS,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WeightStorage {
    /// Weights go to `model.onnx_data` next to `model.onnx`.
    #[default]
    External,
    /// Weights are inlined into `model.onnx`.
    Embedded,
}

/// A classifier graph ready for serialization.
pub struct ClassifierGraph {
    pub(crate) inputs: Vec<(Arc<dyn Tensor>, Option<InputMetadata>)>,
    pub(crate) outputs: Vec<(String, Arc<dyn Tensor>, Option<OutputMetadata>)>,
    pub(crate) metadata: ModelMetadata,
}

impl ClassifierGraph {
    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().filter_map(|(tensor, _)| tensor.get_name()).collect()
    }

    pub fn logits(&self) -> Option<&Arc<dyn Tensor>> {
        self.outputs.first().map(|(_, tensor, _)| tensor)
    }
}

struct EncoderBuilder<'a> {
    config: &'a EncoderConfig,
    options: &'a GraphOptions,
    architecture: Architecture,
    activation: Activation,
    head_dim: usize,
}

impl EncoderBuilder<'_> {
    fn dense(&self, weight_manager: &impl WeightManager, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        if self.options.quantize {
            pytorch::quantized_linear(weight_manager, input, self.options.quantize_min_elements)
        } else {
            pytorch::linear(weight_manager, input)
        }
    }

    fn activate(&self, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        match self.activation {
            Activation::Gelu => pytorch::gelu(input),
            Activation::GeluTanh => pytorch::gelu_tanh(input),
            Activation::Relu => Ok(pytorch::relu(input)),
        }
    }

    fn embeddings(&self, weight_manager: &impl WeightManager, input_ids: Arc<dyn Tensor>, token_type_ids: Option<Arc<dyn Tensor>>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        let words = pytorch::embedding(&weight_manager.prefix("word_embeddings"), input_ids.clone())?;

        let position_manager = weight_manager.prefix("position_embeddings");
        let positions: Arc<dyn Tensor> = if self.architecture.offsets_positions() {
            // Padding keeps position `pad`, real tokens count up from `pad + 1`
            let pad = pytorch::constant(self.config.pad_token_id);
            let not_pad = pytorch::cast(Not::new(None, Equal::new(None, input_ids.clone(), pad.clone())?), DType::I64);
            let incremental = pytorch::cumsum(not_pad.clone(), 1)?;
            let incremental = Mul::new(None, incremental, not_pad)?;
            let position_ids = Add::new(None, incremental, pad)?;
            pytorch::embedding(&position_manager, position_ids)?
        } else {
            // The first `sequence_length` rows of the table, broadcast over the batch
            let table = pytorch::cast(position_manager.get_tensor("weight")?, DType::F32);
            let sequence_length = ShapeOp::new(None, input_ids.clone(), Some(1), Some(2))?;
            let output_shape = Shape::new(vec![input_ids.shape()[1].clone(), table.shape()[1].clone()]);
            let zero = Constant::new(None, TensorData::vector(vec![0i64]));
            Slice::new_with_output_shape(
                position_manager.get_prefix().map(|x| x.to_string()),
                table,
                zero.clone(),
                sequence_length,
                Some(zero),
                output_shape
            )?
        };

        let token_type_manager = weight_manager.prefix("token_type_embeddings");
        let token_types: Arc<dyn Tensor> = match token_type_ids {
            Some(token_type_ids) => pytorch::embedding(&token_type_manager, token_type_ids)?,
            None => {
                let table = pytorch::cast(token_type_manager.get_tensor("weight")?, DType::F32);
                Gather::new(token_type_manager.get_prefix().map(|x| x.to_string()), table, pytorch::constant(0i64), 0)?
            }
        };

        let x = Add::new(None, words, positions)?;
        let x = Add::new(None, x, token_types)?;
        Ok(pytorch::layer_norm(&weight_manager.prefix("LayerNorm"), x, self.config.layer_norm_eps)?)
    }

    fn self_attention(&self, weight_manager: &impl WeightManager, hidden: Arc<dyn Tensor>, mask: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        let heads = self.config.num_attention_heads as i64;
        let head_dim = self.head_dim as i64;
        let split_heads = |name: &str, perm: Vec<i64>| -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
            let x = self.dense(&weight_manager.prefix(name), hidden.clone())?;
            let x = pytorch::reshape(x, vec![0, 0, heads, head_dim])?;
            Ok(Transpose::new(None, x, Some(perm))?)
        };
        let query = split_heads("query", vec![0, 2, 1, 3])?;
        let key = split_heads("key", vec![0, 2, 3, 1])?;
        let value = split_heads("value", vec![0, 2, 1, 3])?;

        let scores = MatMul::new(None, query, key)?;
        let scores = pytorch::mul_scalar(scores, 1.0 / (self.head_dim as f32).sqrt())?;
        let scores = Add::new(None, scores, mask)?;
        let probs = Softmax::new(None, scores, -1)?;

        let context = MatMul::new(None, probs, value)?;
        let context = Transpose::new(None, context, Some(vec![0, 2, 1, 3]))?;
        Ok(pytorch::reshape(context, vec![0, 0, self.config.hidden_size as i64])?)
    }

    fn layer(&self, weight_manager: &impl WeightManager, hidden: Arc<dyn Tensor>, mask: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        let eps = self.config.layer_norm_eps;

        let attention = weight_manager.prefix("attention");
        let x = self.self_attention(&attention.prefix("self"), hidden.clone(), mask)?;
        let attention_output = attention.prefix("output");
        let x = self.dense(&attention_output.prefix("dense"), x)?;
        let x = Add::new(None, x, hidden)?;
        let attended: Arc<dyn Tensor> = pytorch::layer_norm(&attention_output.prefix("LayerNorm"), x, eps)?;

        let x = self.dense(&weight_manager.prefix("intermediate").prefix("dense"), attended.clone())?;
        let x = self.activate(x)?;
        let output = weight_manager.prefix("output");
        let x = self.dense(&output.prefix("dense"), x)?;
        let x = Add::new(None, x, attended)?;
        Ok(pytorch::layer_norm(&output.prefix("LayerNorm"), x, eps)?)
    }

    /// Dense, tanh and projection over the first token.
    fn head(&self, weight_manager: &impl WeightManager, hidden: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        let first_token = Gather::new(None, hidden, pytorch::constant(0i64), 1)?;
        match self.architecture {
            Architecture::XlmRoberta | Architecture::Roberta => {
                let classifier = weight_manager.prefix("classifier");
                let x = self.dense(&classifier.prefix("dense"), first_token)?;
                let x = Tanh::new(None, x);
                self.dense(&classifier.prefix("out_proj"), x)
            }
            Architecture::Bert => {
                let pooled = self.dense(&weight_manager.prefix("bert").prefix("pooler").prefix("dense"), first_token)?;
                let pooled = Tanh::new(None, pooled);
                self.dense(&weight_manager.prefix("classifier"), pooled)
            }
        }
    }
}

fn head_weight_names(architecture: Architecture) -> &'static [&'static str] {
    match architecture {
        Architecture::XlmRoberta | Architecture::Roberta => &["classifier.dense.weight", "classifier.out_proj.weight"],
        Architecture::Bert => &["bert.pooler.dense.weight", "classifier.weight"],
    }
}

/// Builds the `input_ids` (+ `attention_mask`, `token_type_ids`) to `logits` graph.
///
/// Nothing is written; all validation of the checkpoint against its config happens here,
/// so a failure leaves the destination untouched.
pub fn build_classifier_graph(model: &PretrainedModel, options: &GraphOptions) -> Result<ClassifierGraph, ConversionError> {
    let config = &model.config;
    let architecture = config.architecture()?;
    let activation = config.activation()?;
    if config.position_embedding_type != "absolute" {
        return Err(ConversionError::UnsupportedPositionEmbedding(config.position_embedding_type.clone()));
    }
    let head_dim = config.head_dim()?;
    for name in head_weight_names(architecture) {
        if !model.weights.has_tensor(name) {
            return Err(ConversionError::MissingClassifierHead(name.to_string()));
        }
    }
    info!("Building {} classifier with {} layers{}", architecture, config.num_hidden_layers,
        if options.quantize { ", int8 weights" } else { "" });

    let builder = EncoderBuilder {
        config,
        options,
        architecture,
        activation,
        head_dim,
    };

    let batch_size = Dimension::symbolic("batch_size");
    let sequence_length = Dimension::symbolic("sequence_length");
    let token_shape = Shape::new(vec![batch_size, sequence_length]);
    let input_ids: Arc<dyn Tensor> = InputTensor::new("input_ids".to_string(), DType::I64, token_shape.clone());
    let attention_mask: Arc<dyn Tensor> = InputTensor::new("attention_mask".to_string(), DType::I64, token_shape.clone());
    let token_type_ids: Option<Arc<dyn Tensor>> = architecture.uses_token_type_ids()
        .then(|| InputTensor::new("token_type_ids".to_string(), DType::I64, token_shape.clone()) as Arc<dyn Tensor>);

    let base = model.weights.prefix(architecture.base_prefix());
    let mut hidden = builder.embeddings(&base.prefix("embeddings"), input_ids.clone(), token_type_ids.clone())?;

    // 0 where attended, the most negative float where masked, as [batch, 1, 1, seq]
    let mask = pytorch::cast(attention_mask.clone(), DType::F32);
    let mask = Sub::new(None, pytorch::constant(1.0f32), mask)?;
    let mask = pytorch::mul_scalar(mask, f32::MIN)?;
    let mask: Arc<dyn Tensor> = pytorch::unsqueeze(mask, vec![1, 2])?;

    let layers = base.prefix("encoder").prefix("layer");
    for i in 0..config.num_hidden_layers {
        debug!("Layer {i}");
        hidden = builder.layer(&layers.prefix(&i.to_string()), hidden, mask.clone())?;
    }

    let logits = builder.head(&model.weights, hidden)?;
    if let Some(outputs) = logits.shape().dim(-1).value {
        if outputs != config.num_labels() {
            return Err(ConversionError::LabelCountMismatch {
                labels: config.num_labels(),
                outputs,
            });
        }
    }

    let mut inputs = vec![
        (input_ids, Some(InputMetadata { model_input_type: ModelInputType::TokenIds })),
        (attention_mask, Some(InputMetadata { model_input_type: ModelInputType::AttentionMask })),
    ];
    if let Some(token_type_ids) = token_type_ids {
        inputs.push((token_type_ids, Some(InputMetadata { model_input_type: ModelInputType::TokenTypeIds })));
    }

    let metadata = ModelMetadata {
        source: model.identifier.clone(),
        architecture: architecture.to_string(),
        labels: config.id2label.clone(),
        quantization: options.quantize.then(|| QuantizationMetadata {
            scheme: QUANTIZATION_SCHEME.to_string(),
            min_elements: options.quantize_min_elements,
        }),
        max_sequence_length: Some(config.max_sequence_length()),
    };

    Ok(ClassifierGraph {
        inputs,
        outputs: vec![("logits".to_string(), logits, Some(OutputMetadata { model_output_type: ModelOutputType::Logits }))],
        metadata,
    })
}
