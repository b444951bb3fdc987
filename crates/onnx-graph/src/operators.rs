use std::sync::Arc;
use crate::Error;
use crate::node::{attr_float, attr_int, attr_ints, attr_tensor, Node, SingleOutputNode};
use crate::onnx::AttributeProto;
use crate::tensor::{broadcast_shapes, DType, Dimension, Shape, Tensor, TensorData};

fn validate_index_dtype(dtype: DType) -> Result<(), Error> {
    if dtype != DType::I32 && dtype != DType::I64 {
        Err(Error::InvalidDTypeError(dtype))?;
    }
    Ok(())
}

fn resolve_ints(tensor: &dyn Tensor) -> Result<Vec<i64>, Error> {
    tensor.resolve_data().ok_or(Error::CannotResolveDataError)?.to_int_vec()
}

macro_rules! binary_elementwise_op {
    ($op:ident, $onnx_type:literal, $output_dtype:expr) => {
        pub struct $op {
            name: Option<String>,
            a: Arc<dyn Tensor>,
            b: Arc<dyn Tensor>,
            output_shape: Shape,
        }

        impl $op {
            pub fn new(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
                if a.dtype() != b.dtype() {
                    return Err(Error::DTypeMismatchError(a.dtype(), b.dtype()));
                }
                let output_shape = broadcast_shapes(a.shape(), b.shape())?;
                Ok(Arc::new(Self { name, a, b, output_shape }))
            }
        }

        impl Node for $op {
            fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
                vec![self.a.as_ref(), self.b.as_ref()]
            }
            fn get_name(&self) -> Option<&str> {
                self.name.as_deref()
            }
            fn get_onnx_type(&self) -> &str {
                $onnx_type
            }
        }

        impl SingleOutputNode for $op {
            fn get_output_shape(&self) -> &Shape {
                &self.output_shape
            }
            fn get_output_dtype(&self) -> DType {
                let output_dtype: fn(DType) -> DType = $output_dtype;
                output_dtype(self.a.dtype())
            }
        }
    };
}

binary_elementwise_op!(Add, "Add", |x| x);
binary_elementwise_op!(Sub, "Sub", |x| x);
binary_elementwise_op!(Mul, "Mul", |x| x);
binary_elementwise_op!(Equal, "Equal", |_| DType::Bool);

macro_rules! unary_elementwise_op {
    ($op:ident, $onnx_type:literal) => {
        pub struct $op {
            name: Option<String>,
            input: Arc<dyn Tensor>,
        }

        impl $op {
            pub fn new(name: Option<String>, input: Arc<dyn Tensor>) -> Arc<$op> {
                Arc::new($op { name, input })
            }
        }

        impl Node for $op {
            fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
                vec![self.input.as_ref()]
            }
            fn get_name(&self) -> Option<&str> {
                self.name.as_deref()
            }
            fn get_onnx_type(&self) -> &str {
                $onnx_type
            }
        }

        impl SingleOutputNode for $op {
            fn get_output_shape(&self) -> &Shape {
                self.input.shape()
            }
            fn get_output_dtype(&self) -> DType {
                self.input.dtype()
            }
        }
    };
}

unary_elementwise_op!(Tanh, "Tanh");
unary_elementwise_op!(Erf, "Erf");
unary_elementwise_op!(Relu, "Relu");
unary_elementwise_op!(Not, "Not");

pub struct Gather {
    name: Option<String>,
    data: Arc<dyn Tensor>,
    indices: Arc<dyn Tensor>,
    axis: i64,
    output_shape: Shape,
    dtype: DType
}

impl Gather {
    pub fn new(name: Option<String>, data: Arc<dyn Tensor>, indices: Arc<dyn Tensor>, axis: i64) -> Result<Arc<Self>, Error> {
        validate_index_dtype(indices.dtype())?;
        let data_shape = data.shape();
        let u_axis = data_shape.axis(axis)?;

        let mut output_dims = vec![];
        output_dims.extend_from_slice(&data_shape.dims[..u_axis]);
        output_dims.extend_from_slice(&indices.shape().dims);
        output_dims.extend_from_slice(&data_shape.dims[u_axis + 1..]);

        let dtype = data.dtype();
        Ok(Arc::new(Self {
            name,
            data,
            indices,
            axis,
            output_shape: Shape::new(output_dims),
            dtype
        }))
    }
}

impl Node for Gather {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.data.as_ref(), self.indices.as_ref()]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Gather"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_int("axis", self.axis)])
    }
}

impl SingleOutputNode for Gather {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.dtype
    }
}

pub struct LayerNormalization {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    scale: Arc<dyn Tensor>,
    bias: Option<Arc<dyn Tensor>>,
    axis: i64,
    epsilon: f32,
    stash_type: i64
}

impl LayerNormalization {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, scale: Arc<dyn Tensor>, bias: Option<Arc<dyn Tensor>>, axis: i64, epsilon: f32, stash_type: i64) -> Result<Arc<Self>, Error> {
        if input.dtype() != scale.dtype() {
            return Err(Error::DTypeMismatchError(input.dtype(), scale.dtype()));
        }
        if let Some(bias) = &bias {
            if bias.dtype() != input.dtype() {
                return Err(Error::DTypeMismatchError(input.dtype(), bias.dtype()));
            }
        }
        input.shape().axis(axis)?;
        Ok(Arc::new(Self {
            name,
            input,
            scale,
            bias,
            axis,
            epsilon,
            stash_type
        }))
    }
}

impl Node for LayerNormalization {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.scale.as_ref()];
        if let Some(bias) = &self.bias {
            inputs.push(bias.as_ref());
        }
        inputs
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "LayerNormalization"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![
            attr_int("axis", self.axis),
            attr_float("epsilon", self.epsilon),
            attr_int("stash_type", self.stash_type),
        ])
    }
}

impl SingleOutputNode for LayerNormalization {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct MatMul {
    name: Option<String>,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
    output_dtype: DType,
    output_shape: Shape
}

impl MatMul {
    pub fn new(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        if a.dtype() != b.dtype() {
            Err(Error::DTypeMismatchError(a.dtype(), b.dtype()))?
        }
        if a.rank() == 0 || b.rank() == 0 {
            Err(Error::InputShapeError("MatMul inputs must have rank >= 1".to_string()))?
        }
        let a_shape = if a.rank() == 1 {
            a.shape().unsqueeze(0)
        } else {
            a.shape().clone()
        };
        let b_shape = if b.rank() == 1 {
            b.shape().unsqueeze(1)
        } else {
            b.shape().clone()
        };

        let (k_a, k_b) = (a_shape.dim(-1), b_shape.dim(-2));
        if let (Some(x), Some(y)) = (k_a.value, k_b.value) {
            if x != y {
                Err(Error::InputShapeError(format!("MatMul {} by {}", a_shape, b_shape)))?
            }
        }

        let a_batch = Shape::new(a_shape.dims[..a_shape.rank() - 2].to_vec());
        let b_batch = Shape::new(b_shape.dims[..b_shape.rank() - 2].to_vec());
        let mut output_dims = broadcast_shapes(&a_batch, &b_batch)?.dims;
        if a.rank() != 1 {
            output_dims.push(a_shape.dim(-2).clone());
        }
        if b.rank() != 1 {
            output_dims.push(b_shape.dim(-1).clone());
        }

        let output_dtype = a.dtype();
        Ok(Arc::new(MatMul {
            name,
            a,
            b,
            output_dtype,
            output_shape: Shape::new(output_dims)
        }))
    }
}

impl Node for MatMul {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.a.as_ref(), self.b.as_ref()]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "MatMul"
    }
}

impl SingleOutputNode for MatMul {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.output_dtype
    }
}

pub struct Softmax {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axis: i64
}

impl Softmax {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axis: i64) -> Result<Arc<Softmax>, Error> {
        input.shape().axis(axis)?;
        Ok(Arc::new(Softmax { name, input, axis }))
    }
}

impl Node for Softmax {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Softmax"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_int("axis", self.axis)])
    }
}

impl SingleOutputNode for Softmax {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Constant {
    name: Option<String>,
    data: TensorData
}

impl Constant {
    pub fn new(name: Option<String>, data: TensorData) -> Arc<Constant> {
        Arc::new(Constant {
            name,
            data
        })
    }
}

impl Node for Constant {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Constant"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_tensor("value", self.data.to_tensor_data_proto(None)?)])
    }
}

impl SingleOutputNode for Constant {
    fn get_output_shape(&self) -> &Shape {
        self.data.shape()
    }
    fn get_output_dtype(&self) -> DType {
        self.data.dtype()
    }
    fn resolve_output_data(&self) -> Option<TensorData> {
        Some(self.data.clone())
    }
}

pub struct Cast {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    to: DType
}

impl Cast {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, to: DType) -> Arc<Cast> {
        Arc::new(Cast {
            name,
            input,
            to
        })
    }
}

impl Node for Cast {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Cast"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_int("to", crate::onnx::tensor_proto::DataType::from(self.to) as i64)])
    }
}

impl SingleOutputNode for Cast {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.to
    }
}

pub struct Reshape {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    shape: Arc<dyn Tensor>,
    output_shape: Shape
}

impl Reshape {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, shape: Arc<dyn Tensor>) -> Result<Arc<Reshape>, Error> {
        if shape.dtype() != DType::I64 {
            Err(Error::InvalidDTypeError(shape.dtype()))?
        }
        let target = resolve_ints(shape.as_ref())?;
        let input_dims = &input.shape().dims;

        let mut output_dims = vec![];
        let mut inferred_axis = None;
        for (i, value) in target.iter().enumerate() {
            match *value {
                0 => output_dims.push(input_dims.get(i).cloned().ok_or_else(|| {
                    Error::InvalidInputError(format!("reshape copies axis {i} of {}", input.shape()))
                })?),
                -1 => {
                    if inferred_axis.replace(i).is_some() {
                        Err(Error::InvalidInputError("reshape with more than one -1".to_string()))?
                    }
                    output_dims.push(Dimension::new(None, None, None));
                }
                v if v > 0 => output_dims.push(Dimension::fixed(v as usize)),
                v => Err(Error::InvalidInputError(format!("invalid reshape dimension {v}")))?
            }
        }

        if let Some(axis) = inferred_axis {
            let known: Result<usize, Error> = output_dims.iter().enumerate()
                .filter(|(i, _)| *i != axis)
                .map(|(_, d)| d.resolve())
                .product();
            if let (Ok(total), Ok(known)) = (input.shape().num_elements(), known) {
                if known > 0 {
                    output_dims[axis] = Dimension::fixed(total / known);
                }
            }
        }

        Ok(Arc::new(Reshape {
            name,
            input,
            shape,
            output_shape: Shape::new(output_dims)
        }))
    }
}

impl Node for Reshape {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.shape.as_ref()]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Reshape"
    }
}

impl SingleOutputNode for Reshape {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Transpose {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    perm: Vec<i64>,
    output_shape: Shape
}

impl Transpose {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, perm: Option<Vec<i64>>) -> Result<Arc<Transpose>, Error> {
        let rank = input.rank();
        let perm = perm.unwrap_or_else(|| (0..rank as i64).rev().collect());
        let mut sorted = perm.clone();
        sorted.sort_unstable();
        if sorted != (0..rank as i64).collect::<Vec<_>>() {
            Err(Error::InvalidInputError(format!("{perm:?} is not a permutation of rank {rank}")))?
        }
        let output_shape = Shape::new(perm.iter().map(|&i| input.shape().dims[i as usize].clone()).collect());
        Ok(Arc::new(Transpose {
            name,
            input,
            perm,
            output_shape
        }))
    }
}

impl Node for Transpose {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Transpose"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_ints("perm", &self.perm)])
    }
}

impl SingleOutputNode for Transpose {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Unsqueeze {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axes: Arc<dyn Tensor>,
    output_shape: Shape
}

impl Unsqueeze {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axes: Arc<dyn Tensor>) -> Result<Arc<Unsqueeze>, Error> {
        if axes.dtype() != DType::I64 {
            Err(Error::InvalidDTypeError(axes.dtype()))?
        }
        let axes_values = resolve_ints(axes.as_ref())?;
        let output_rank = (input.rank() + axes_values.len()) as i64;
        let mut normalized = vec![];
        for axis in axes_values {
            let axis = if axis < 0 { axis + output_rank } else { axis };
            if axis < 0 || axis >= output_rank {
                Err(Error::InvalidInputError(format!("unsqueeze axis {axis} out of range")))?
            }
            normalized.push(axis as usize);
        }
        normalized.sort_unstable();
        let mut output_shape = input.shape().clone();
        for axis in normalized {
            output_shape = output_shape.unsqueeze(axis);
        }
        Ok(Arc::new(Unsqueeze {
            name,
            input,
            axes,
            output_shape
        }))
    }
}

impl Node for Unsqueeze {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.axes.as_ref()]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Unsqueeze"
    }
}

impl SingleOutputNode for Unsqueeze {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct CumSum {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axis: Arc<dyn Tensor>
}

impl CumSum {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axis: Arc<dyn Tensor>) -> Result<Arc<CumSum>, Error> {
        validate_index_dtype(axis.dtype())?;
        Ok(Arc::new(CumSum { name, input, axis }))
    }
}

impl Node for CumSum {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.axis.as_ref()]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "CumSum"
    }
}

impl SingleOutputNode for CumSum {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Slice {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    starts: Arc<dyn Tensor>,
    ends: Arc<dyn Tensor>,
    axes: Option<Arc<dyn Tensor>>,
    output_shape: Shape
}

fn slice_len(start: i64, end: i64, len: usize) -> usize {
    let len = len as i64;
    let clamp = |x: i64| if x < 0 { (x + len).max(0) } else { x.min(len) };
    (clamp(end) - clamp(start)).max(0) as usize
}

impl Slice {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, starts: Arc<dyn Tensor>, ends: Arc<dyn Tensor>, axes: Option<Arc<dyn Tensor>>) -> Result<Arc<Self>, Error> {
        validate_index_dtype(starts.dtype())?;
        validate_index_dtype(ends.dtype())?;
        let count = starts.shape().num_elements()?;
        let axes_values = match &axes {
            Some(axes) => {
                validate_index_dtype(axes.dtype())?;
                resolve_ints(axes.as_ref())?
            }
            None => (0..count as i64).collect()
        };
        let starts_values = starts.resolve_data().map(|x| x.to_int_vec()).transpose()?;
        let ends_values = ends.resolve_data().map(|x| x.to_int_vec()).transpose()?;

        let mut dims = input.shape().dims.clone();
        for (i, axis) in axes_values.iter().enumerate() {
            let axis = input.shape().axis(*axis)?;
            dims[axis] = match (&starts_values, &ends_values, dims[axis].value) {
                (Some(s), Some(e), Some(len)) => Dimension::fixed(slice_len(s[i], e[i], len)),
                _ => Dimension::new(None, None, None)
            };
        }
        Self::new_with_output_shape(name, input, starts, ends, axes, Shape::new(dims))
    }

    /// Slice whose output shape is known to the caller, e.g. trimming a table to a
    /// symbolic sequence length.
    pub fn new_with_output_shape(name: Option<String>, input: Arc<dyn Tensor>, starts: Arc<dyn Tensor>, ends: Arc<dyn Tensor>, axes: Option<Arc<dyn Tensor>>, output_shape: Shape) -> Result<Arc<Self>, Error> {
        if output_shape.rank() != input.rank() {
            Err(Error::InputShapeError(format!("slice cannot turn {} into {}", input.shape(), output_shape)))?
        }
        Ok(Arc::new(Self {
            name,
            input,
            starts,
            ends,
            axes,
            output_shape
        }))
    }
}

impl Node for Slice {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.starts.as_ref(), self.ends.as_ref()];
        if let Some(axes) = &self.axes {
            inputs.push(axes.as_ref());
        }
        inputs
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Slice"
    }
}

impl SingleOutputNode for Slice {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct ShapeOp {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    start: Option<i64>,
    end: Option<i64>,
    output_shape: Shape
}

impl ShapeOp {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, start: Option<i64>, end: Option<i64>) -> Result<Arc<Self>, Error> {
        let rank = input.rank() as i64;
        let clamp = |x: i64| if x < 0 { (x + rank).max(0) } else { x.min(rank) };
        let len = (clamp(end.unwrap_or(rank)) - clamp(start.unwrap_or(0))).max(0) as usize;
        Ok(Arc::new(Self {
            name,
            input,
            start,
            end,
            output_shape: Shape::from(vec![len])
        }))
    }

    fn selected_dims(&self) -> &[Arc<Dimension>] {
        let rank = self.input.rank() as i64;
        let clamp = |x: i64| if x < 0 { (x + rank).max(0) } else { x.min(rank) };
        let start = clamp(self.start.unwrap_or(0)) as usize;
        let end = (clamp(self.end.unwrap_or(rank)) as usize).max(start);
        &self.input.shape().dims[start..end]
    }
}

impl Node for ShapeOp {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Shape"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        let mut attributes = vec![];
        if let Some(start) = self.start {
            attributes.push(attr_int("start", start));
        }
        if let Some(end) = self.end {
            attributes.push(attr_int("end", end));
        }
        Ok(attributes)
    }
}

impl SingleOutputNode for ShapeOp {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        DType::I64
    }
    fn resolve_output_data(&self) -> Option<TensorData> {
        let dims: Option<Vec<i64>> = self.selected_dims().iter().map(|d| d.value.map(|v| v as i64)).collect();
        dims.map(TensorData::vector)
    }
}

/// `y = (x - zero_point) * scale`, per tensor or along `axis`.
pub struct DequantizeLinear {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    scale: Arc<dyn Tensor>,
    zero_point: Option<Arc<dyn Tensor>>,
    axis: i64
}

impl DequantizeLinear {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, scale: Arc<dyn Tensor>, zero_point: Option<Arc<dyn Tensor>>, axis: i64) -> Result<Arc<Self>, Error> {
        if input.dtype() != DType::I8 {
            Err(Error::InvalidDTypeError(input.dtype()))?
        }
        if scale.dtype() != DType::F32 {
            Err(Error::InvalidDTypeError(scale.dtype()))?
        }
        if let Some(zero_point) = &zero_point {
            if zero_point.dtype() != input.dtype() {
                Err(Error::DTypeMismatchError(input.dtype(), zero_point.dtype()))?
            }
        }
        let u_axis = input.shape().axis(axis)?;
        if scale.rank() == 1 {
            if let (Some(n), Some(m)) = (scale.shape()[0].value, input.shape()[u_axis].value) {
                if n != m {
                    Err(Error::InputShapeError(format!("{} scales for axis of length {}", n, m)))?
                }
            }
        }
        Ok(Arc::new(Self {
            name,
            input,
            scale,
            zero_point,
            axis
        }))
    }
}

impl Node for DequantizeLinear {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.scale.as_ref()];
        if let Some(zero_point) = &self.zero_point {
            inputs.push(zero_point.as_ref());
        }
        inputs
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "DequantizeLinear"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_int("axis", self.axis)])
    }
}

impl SingleOutputNode for DequantizeLinear {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }
    fn get_output_dtype(&self) -> DType {
        DType::F32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::InputTensor;

    fn input(name: &str, dtype: DType, dims: Vec<Arc<Dimension>>) -> Arc<dyn Tensor> {
        InputTensor::new(name.to_string(), dtype, Shape::new(dims))
    }

    #[test]
    fn matmul_keeps_symbolic_batch_dims() {
        let batch = Dimension::symbolic("batch_size");
        let seq = Dimension::symbolic("sequence_length");
        let x = input("x", DType::F32, vec![batch.clone(), seq.clone(), Dimension::fixed(8)]);
        let w = input("w", DType::F32, vec![Dimension::fixed(8), Dimension::fixed(3)]);
        let y = MatMul::new(None, x, w).unwrap();
        assert_eq!(y.shape().to_string(), "[batch_sizexsequence_lengthx3]");
    }

    #[test]
    fn matmul_rejects_inner_mismatch() {
        let x = input("x", DType::F32, vec![Dimension::fixed(2), Dimension::fixed(8)]);
        let w = input("w", DType::F32, vec![Dimension::fixed(4), Dimension::fixed(3)]);
        assert!(matches!(MatMul::new(None, x, w), Err(Error::InputShapeError(_))));
    }

    #[test]
    fn reshape_copies_zero_dims() {
        let batch = Dimension::symbolic("batch_size");
        let x = input("x", DType::F32, vec![batch.clone(), Dimension::symbolic("sequence_length"), Dimension::fixed(32)]);
        let target = Constant::new(None, TensorData::vector(vec![0i64, 0, 4, 8]));
        let y = Reshape::new(None, x, target).unwrap();
        assert!(Arc::ptr_eq(&y.shape().dims[0], &batch));
        assert_eq!(y.shape().dims[3].value, Some(8));
    }

    #[test]
    fn reshape_infers_minus_one_when_static() {
        let x = input("x", DType::F32, vec![Dimension::fixed(6), Dimension::fixed(4)]);
        let target = Constant::new(None, TensorData::vector(vec![3i64, -1]));
        let y = Reshape::new(None, x, target).unwrap();
        assert_eq!(y.shape().resolve().unwrap(), vec![3, 8]);
    }

    #[test]
    fn gather_replaces_axis_with_indices() {
        let table = input("table", DType::F32, vec![Dimension::fixed(100), Dimension::fixed(16)]);
        let ids = input("ids", DType::I64, vec![Dimension::symbolic("b"), Dimension::symbolic("s")]);
        let out = Gather::new(None, table.clone(), ids, 0).unwrap();
        assert_eq!(out.shape().to_string(), "[bxsx16]");

        let row = Gather::new(None, table, Constant::new(None, TensorData::scalar(0i64)), 0).unwrap();
        assert_eq!(row.shape().to_string(), "[16]");
    }

    #[test]
    fn gather_requires_integer_indices() {
        let table = input("table", DType::F32, vec![Dimension::fixed(4), Dimension::fixed(2)]);
        let ids = input("ids", DType::F32, vec![Dimension::fixed(1)]);
        assert!(matches!(Gather::new(None, table, ids, 0), Err(Error::InvalidDTypeError(DType::F32))));
    }

    #[test]
    fn unsqueeze_inserts_in_order() {
        let x = input("mask", DType::F32, vec![Dimension::symbolic("b"), Dimension::symbolic("s")]);
        let axes = Constant::new(None, TensorData::vector(vec![1i64, 2]));
        let y = Unsqueeze::new(None, x, axes).unwrap();
        assert_eq!(y.shape().to_string(), "[bx1x1xs]");
    }

    #[test]
    fn shape_op_resolves_static_dims() {
        let x = input("x", DType::F32, vec![Dimension::fixed(2), Dimension::fixed(5)]);
        let s = ShapeOp::new(None, x.clone(), Some(1), Some(2)).unwrap();
        assert_eq!(s.resolve_data().unwrap().to_int_vec().unwrap(), vec![5]);

        let y = input("y", DType::F32, vec![Dimension::symbolic("b"), Dimension::symbolic("s")]);
        let s = ShapeOp::new(None, y, Some(1), Some(2)).unwrap();
        assert!(s.resolve_data().is_none());
        assert_eq!(s.shape().resolve().unwrap(), vec![1]);
    }

    #[test]
    fn slice_with_constant_bounds() {
        let x = input("x", DType::F32, vec![Dimension::fixed(10), Dimension::fixed(4)]);
        let starts = Constant::new(None, TensorData::vector(vec![2i64]));
        let ends = Constant::new(None, TensorData::vector(vec![-1i64]));
        let axes = Constant::new(None, TensorData::vector(vec![0i64]));
        let y = Slice::new(None, x, starts, ends, Some(axes)).unwrap();
        assert_eq!(y.shape().resolve().unwrap(), vec![7, 4]);
    }

    #[test]
    fn dequantize_checks_scale_length() {
        let q = input("q", DType::I8, vec![Dimension::fixed(4), Dimension::fixed(3)]);
        let scale = input("scale", DType::F32, vec![Dimension::fixed(3)]);
        assert!(DequantizeLinear::new(None, q.clone(), scale.clone(), None, 0).is_err());
        let y = DequantizeLinear::new(None, q, scale, None, 1).unwrap();
        assert_eq!(y.dtype(), DType::F32);
    }

    #[test]
    fn equal_produces_bool() {
        let ids = input("ids", DType::I64, vec![Dimension::symbolic("b"), Dimension::symbolic("s")]);
        let pad = Constant::new(None, TensorData::vector(vec![1i64]));
        let mask = Equal::new(None, ids, pad).unwrap();
        assert_eq!(mask.dtype(), DType::Bool);
        assert_eq!(Not::new(None, mask).dtype(), DType::Bool);
    }
}
