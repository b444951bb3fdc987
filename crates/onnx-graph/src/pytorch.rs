use std::sync::Arc;
use crate::{operators, Error};
use crate::operators::{Add, Cast, Constant, CumSum, DequantizeLinear, Erf, Gather, LayerNormalization, MatMul, Mul, Reshape, Tanh, Transpose, Unsqueeze};
use crate::quantize::quantize_per_row;
use crate::tensor::{DType, InitializerTensor, Tensor, TensorData};
use crate::weights::WeightManager;

fn node_name(weight_manager: &impl WeightManager, suffix: &str) -> Option<String> {
    weight_manager.get_prefix().map(|prefix| format!("{prefix}.{suffix}"))
}

fn add_bias(weight_manager: &impl WeightManager, mat_out: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    if weight_manager.has_tensor("bias") {
        let bias = cast(weight_manager.get_tensor("bias")?, DType::F32);
        Ok(Add::new(node_name(weight_manager, "bias_add"), mat_out, bias)?)
    } else {
        Ok(mat_out)
    }
}

/// `input @ weight.T + bias`, the way `torch.nn.Linear` stores its parameters.
pub fn linear(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    let weight = cast(weight_manager.get_tensor("weight")?, DType::F32);
    let mat_out = MatMul::new(
        weight_manager.get_prefix().map(|x| x.to_string()),
        input,
        transpose(weight)?
    )?;
    add_bias(weight_manager, mat_out)
}

/// Same as [`linear`], but a weight with at least `min_elements` elements is stored as
/// per-row int8 and rebuilt by a `DequantizeLinear` node.
pub fn quantized_linear(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>, min_elements: usize) -> Result<Arc<dyn Tensor>, Error> {
    let weight = weight_manager.get_tensor("weight")?;
    if weight.rank() != 2 || weight.shape().num_elements()? < min_elements {
        return linear(weight_manager, input);
    }
    let prefix = weight_manager.get_prefix().unwrap_or("linear");
    let data = weight.load_data()?.ok_or(Error::CannotResolveDataError)?;
    let quantized = quantize_per_row(&data)?;

    let values = InitializerTensor::new(format!("{prefix}.weight_quantized"), quantized.values);
    let scales = InitializerTensor::new(format!("{prefix}.weight_scale"), quantized.scales);
    let zero_points = InitializerTensor::new(format!("{prefix}.weight_zero_point"), quantized.zero_points);
    let weight = DequantizeLinear::new(node_name(weight_manager, "dequantize"), values, scales, Some(zero_points), 0)?;

    let mat_out = MatMul::new(
        Some(prefix.to_string()),
        input,
        transpose(weight)?
    )?;
    add_bias(weight_manager, mat_out)
}

pub fn constant<T>(value: T) -> Arc<Constant>
where
    crate::tensor::TensorDataValue: From<Vec<T>>
{
    Constant::new(None, TensorData::scalar(value))
}

fn int_list(values: Vec<i64>) -> Arc<Constant> {
    Constant::new(None, TensorData::vector(values))
}

pub fn reshape(input: Arc<dyn Tensor>, dims: Vec<i64>) -> Result<Arc<Reshape>, Error> {
    Reshape::new(None, input, int_list(dims))
}

pub fn unsqueeze(input: Arc<dyn Tensor>, axes: Vec<i64>) -> Result<Arc<Unsqueeze>, Error> {
    Unsqueeze::new(None, input, int_list(axes))
}

pub fn cast(input: Arc<dyn Tensor>, dtype: DType) -> Arc<dyn Tensor> {
    if input.dtype() != dtype {
        Cast::new(None, input, dtype)
    } else {
        input
    }
}

/// Swaps the last two axes.
pub fn transpose(input: Arc<dyn Tensor>) -> Result<Arc<Transpose>, Error> {
    let rank = input.rank();
    if rank < 2 {
        return Err(Error::InputShapeError(format!("cannot transpose {}", input.shape())));
    }
    let mut dims: Vec<_> = (0..rank as i64).collect();
    dims.swap(rank - 2, rank - 1);
    Transpose::new(None, input, Some(dims))
}

pub fn layer_norm(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>, epsilon: f32) -> Result<Arc<LayerNormalization>, Error> {
    let bias = if weight_manager.has_tensor("bias") {
        Some(cast(weight_manager.get_tensor("bias")?, DType::F32))
    } else {
        None
    };
    LayerNormalization::new(
        weight_manager.get_prefix().map(|x| x.to_string()),
        input,
        cast(weight_manager.get_tensor("weight")?, DType::F32),
        bias,
        -1,
        epsilon,
        1
    )
}

/// Row lookup into an embedding table, `torch.nn.Embedding`.
pub fn embedding(weight_manager: &impl WeightManager, ids: Arc<dyn Tensor>) -> Result<Arc<Gather>, Error> {
    let table = cast(weight_manager.get_tensor("weight")?, DType::F32);
    Gather::new(weight_manager.get_prefix().map(|x| x.to_string()), table, ids, 0)
}

pub fn cumsum(input: Arc<dyn Tensor>, axis: i64) -> Result<Arc<CumSum>, Error> {
    CumSum::new(None, input, constant(axis))
}

pub fn mul_scalar(input: Arc<dyn Tensor>, scalar: f32) -> Result<Arc<Mul>, Error> {
    Mul::new(None, input, constant(scalar))
}

/// Exact GELU, `0.5 * x * (1 + erf(x / sqrt(2)))`.
pub fn gelu(input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    let x = mul_scalar(input.clone(), std::f32::consts::FRAC_1_SQRT_2)?;
    let x = Erf::new(None, x);
    let x = Add::new(None, x, constant(1.0f32))?;
    let x = Mul::new(None, input, x)?;
    Ok(mul_scalar(x, 0.5)?)
}

/// Tanh approximation of GELU used by `gelu_new` and `gelu_pytorch_tanh`.
pub fn gelu_tanh(input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    let cube = Mul::new(None, input.clone(), input.clone())?;
    let cube = Mul::new(None, cube, input.clone())?;
    let inner = Add::new(None, input.clone(), mul_scalar(cube, 0.044715)?)?;
    let inner = mul_scalar(inner, (2.0f32 / std::f32::consts::PI).sqrt())?;
    let x = Add::new(None, Tanh::new(None, inner), constant(1.0f32))?;
    let x = Mul::new(None, input, x)?;
    Ok(mul_scalar(x, 0.5)?)
}

pub fn relu(input: Arc<dyn Tensor>) -> Arc<dyn Tensor> {
    operators::Relu::new(None, input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Dimension, InputTensor, Shape};

    struct FixedWeights {
        prefix: Option<String>,
        weight: Arc<dyn Tensor>,
        bias: Option<Arc<dyn Tensor>>,
    }

    impl WeightManager for FixedWeights {
        fn prefix(&self, name: &str) -> Self {
            Self { prefix: Some(name.to_string()), weight: self.weight.clone(), bias: self.bias.clone() }
        }
        fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
            match name {
                "weight" => Ok(self.weight.clone()),
                "bias" => self.bias.clone().ok_or(Error::NoSuchTensorError(name.to_string())),
                _ => Err(Error::NoSuchTensorError(name.to_string())),
            }
        }
        fn get_prefix_tail(&self) -> Option<&str> {
            self.prefix.as_deref()
        }
        fn get_prefix(&self) -> Option<&str> {
            self.prefix.as_deref()
        }
        fn get_tensor_names(&self) -> Vec<String> {
            vec![]
        }
        fn has_tensor(&self, name: &str) -> bool {
            name == "weight" || (name == "bias" && self.bias.is_some())
        }
    }

    fn weights(out_features: usize, in_features: usize, dtype: DType) -> FixedWeights {
        let values: Vec<f32> = (0..out_features * in_features).map(|i| i as f32 / 10.0).collect();
        let data = match dtype {
            DType::F16 => TensorData::new(values.iter().map(|x| half::f16::from_f32(*x)).collect::<Vec<_>>().into(), Shape::from(vec![out_features, in_features])),
            _ => TensorData::new(values.into(), Shape::from(vec![out_features, in_features])),
        }.unwrap();
        FixedWeights {
            prefix: None,
            weight: InitializerTensor::new("dense.weight".to_string(), data),
            bias: Some(InitializerTensor::new("dense.bias".to_string(), TensorData::vector(vec![0.0f32; out_features]))),
        }
    }

    fn hidden(width: usize) -> Arc<dyn Tensor> {
        InputTensor::new("hidden".to_string(), DType::F32, Shape::new(vec![Dimension::symbolic("b"), Dimension::fixed(width)]))
    }

    #[test]
    fn linear_output_shape() {
        let out = linear(&weights(3, 8, DType::F32).prefix("dense"), hidden(8)).unwrap();
        assert_eq!(out.shape().to_string(), "[bx3]");
        assert_eq!(out.dtype(), DType::F32);
    }

    #[test]
    fn bias_node_is_not_named_like_the_bias() {
        let out = linear(&weights(3, 8, DType::F32).prefix("dense"), hidden(8)).unwrap();
        let add = out.as_node().unwrap();
        assert_eq!(add.get_onnx_type(), "Add");
        assert_eq!(add.get_name(), Some("dense.bias_add"));
        assert_eq!(add.get_input_tensors()[1].get_name(), Some("dense.bias"));
    }

    #[test]
    fn half_weights_are_cast() {
        let out = linear(&weights(3, 8, DType::F16).prefix("dense"), hidden(8)).unwrap();
        assert_eq!(out.dtype(), DType::F32);
    }

    #[test]
    fn small_weights_stay_float() {
        let out = quantized_linear(&weights(3, 8, DType::F32).prefix("dense"), hidden(8), 1024).unwrap();
        let add = out.as_node().unwrap();
        let matmul = add.get_input_tensors()[0].as_node().unwrap();
        assert_eq!(matmul.get_onnx_type(), "MatMul");
        let transpose = matmul.get_input_tensors()[1].as_node().unwrap();
        assert_eq!(transpose.get_input_tensors()[0].get_name(), Some("dense.weight"));
    }

    #[test]
    fn large_weights_are_dequantized() {
        let out = quantized_linear(&weights(4, 8, DType::F32).prefix("dense"), hidden(8), 16).unwrap();
        assert_eq!(out.shape().to_string(), "[bx4]");
        let matmul = out.as_node().unwrap().get_input_tensors()[0].as_node().unwrap();
        let transpose = matmul.get_input_tensors()[1].as_node().unwrap();
        let dequantize = transpose.get_input_tensors()[0].as_node().unwrap();
        assert_eq!(dequantize.get_onnx_type(), "DequantizeLinear");
        let inputs = dequantize.get_input_tensors();
        assert_eq!(inputs[0].dtype(), DType::I8);
        assert_eq!(inputs[0].get_name(), Some("dense.weight_quantized"));
        assert_eq!(inputs[1].shape().resolve().unwrap(), vec![4]);
    }

    #[test]
    fn gelu_keeps_shape() {
        let x = hidden(5);
        assert_eq!(gelu(x.clone()).unwrap().shape(), x.shape());
        assert_eq!(gelu_tanh(x.clone()).unwrap().shape(), x.shape());
    }
}
