use std::hash::{Hash, Hasher};
use std::sync::Arc;
use core::fmt;
use crate::{onnx, Error};
use crate::node::{Node, SingleOutputNode};
use crate::onnx::{TensorProto, ValueInfoProto};
use crate::weights::WeightExternalOutputManager;

#[derive(Clone, Debug)]
pub struct Dimension {
    pub value: Option<usize>,
    pub name: Option<String>,
    pub denotation: Option<String>
}

impl Dimension {
    pub fn new(value: Option<usize>, name: Option<String>, denotation: Option<String>) -> Arc<Self> {
        Arc::new(Dimension { value, name, denotation })
    }

    /// A dimension only known by name at export time, e.g. `batch_size`.
    pub fn symbolic(name: &str) -> Arc<Self> {
        Self::new(None, Some(name.to_string()), None)
    }

    pub fn fixed(value: usize) -> Arc<Self> {
        Self::new(Some(value), None, None)
    }

    pub fn resolve(&self) -> Result<usize, Error> {
        self.value.ok_or_else(|| Error::UnresolvedDimensionError(self.to_string()))
    }
}

impl From<&Dimension> for onnx::tensor_shape_proto::Dimension {
    fn from(value: &Dimension) -> Self {
        Self {
            value: match value.value {
                Some(value) => Some(onnx::tensor_shape_proto::dimension::Value::DimValue(value as i64)),
                None => value.name.as_ref().map(|name| onnx::tensor_shape_proto::dimension::Value::DimParam(name.clone()))
            },
            denotation: value.denotation.clone().unwrap_or_default()
        }
    }
}

impl From<usize> for Dimension {
    fn from(value: usize) -> Self {
        Self { value: Some(value), name: None, denotation: None }
    }
}

impl PartialEq for &Dimension {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(*self, *other) || if let (Some(a), Some(b)) = (self.value, other.value) {a == b} else {false}
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = self.value {
            write!(f, "{}", value)
        }
        else if let Some(name) = &self.name {
            write!(f, "{}", name)
        }
        else {
            write!(f, "?")
        }
    }
}

#[derive(Clone, Debug)]
pub struct Shape {
    pub dims: Vec<Arc<Dimension>>
}

impl Shape {
    pub fn new(dims: Vec<Arc<Dimension>>) -> Self {
        Self { dims }
    }

    pub fn scalar() -> Self {
        Self { dims: vec![] }
    }

    pub fn resolve(&self) -> Result<Vec<usize>, Error> {
        self.dims.iter().map(|dim| dim.resolve()).collect()
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Normalizes a possibly negative axis against this shape's rank.
    pub fn axis(&self, axis: i64) -> Result<usize, Error> {
        let rank = self.rank() as i64;
        let normalized = if axis < 0 { rank + axis } else { axis };
        if normalized < 0 || normalized >= rank {
            return Err(Error::InvalidInputError(format!("axis {axis} out of range for shape {self}")));
        }
        Ok(normalized as usize)
    }

    pub fn dim(&self, index: isize) -> &Arc<Dimension> {
        let rank = self.rank();
        let index = if index < 0 {
            rank - (-index) as usize
        }
        else {
            index as usize
        };
        &self.dims[index]
    }

    pub fn unsqueeze(&self, axis: usize) -> Self {
        let mut new_dims = self.dims.clone();
        new_dims.insert(axis, Dimension::fixed(1));
        Self::new(new_dims)
    }

    pub fn num_elements(&self) -> Result<usize, Error> {
        let mut v = 1;
        for dim in &self.dims {
            v *= dim.resolve()?;
        }
        Ok(v)
    }
}

/// Multidirectional (numpy-style) broadcasting of two shapes.
pub fn broadcast_shapes(a: &Shape, b: &Shape) -> Result<Shape, Error> {
    let rank = a.rank().max(b.rank());
    let a_offset = rank - a.rank();
    let b_offset = rank - b.rank();
    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let a_dim = i.checked_sub(a_offset).map(|j| &a.dims[j]);
        let b_dim = i.checked_sub(b_offset).map(|j| &b.dims[j]);
        let dim = match (a_dim, b_dim) {
            (Some(x), None) => x.clone(),
            (None, Some(y)) => y.clone(),
            (Some(x), Some(y)) => {
                if x.as_ref() == y.as_ref() || y.value == Some(1) {
                    x.clone()
                } else if x.value == Some(1) {
                    y.clone()
                } else {
                    match (x.value, y.value) {
                        (None, Some(_)) => y.clone(),
                        (Some(_), None) => x.clone(),
                        // Two distinct symbolic dims; ONNX checks these at runtime.
                        (None, None) => x.clone(),
                        (Some(_), Some(_)) => {
                            return Err(Error::InputShapeError(format!("cannot broadcast {a} with {b}")));
                        }
                    }
                }
            }
            (None, None) => unreachable!("index is within the larger rank"),
        };
        dims.push(dim);
    }
    Ok(Shape::new(dims))
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.dims.iter().map(|x| x.to_string()).collect::<Vec<_>>().join("x"))
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.dims.len() == other.dims.len() && self.dims.iter().zip(other.dims.iter()).all(|(a, b)| a.as_ref() == b.as_ref())
    }
}

impl From<&Shape> for onnx::TensorShapeProto {
    fn from(value: &Shape) -> Self {
        Self {
            dim: value.dims.iter().map(|x| x.as_ref().into()).collect()
        }
    }
}

impl From<&candle_core::Shape> for Shape {
    fn from(value: &candle_core::Shape) -> Self {
        Shape { dims: value.dims().iter().map(|x| Dimension::fixed(*x)).collect() }
    }
}

impl core::ops::Index<usize> for Shape {
    type Output = Arc<Dimension>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.dims[index]
    }
}

impl <T: Clone> From<&[T]> for Shape
where
    Dimension: From<T>
{
    fn from(value: &[T]) -> Self {
        Shape { dims: value.iter().map(|x| Arc::new(Dimension::from(x.clone()))).collect() }
    }
}

impl <T> From<Vec<T>> for Shape
where
    Dimension: From<T>
{
    fn from(value: Vec<T>) -> Self {
        Shape { dims: value.into_iter().map(|x| Arc::new(Dimension::from(x))).collect() }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    BF16,
    I8,
    U16,
    I32,
    I64,
    Bool
}

impl DType {
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Result<Self, Error> {
        match dtype {
            safetensors::Dtype::F32 => Ok(DType::F32),
            safetensors::Dtype::F16 => Ok(DType::F16),
            safetensors::Dtype::BF16 => Ok(DType::BF16),
            safetensors::Dtype::I8 => Ok(DType::I8),
            safetensors::Dtype::U16 => Ok(DType::U16),
            safetensors::Dtype::I32 => Ok(DType::I32),
            safetensors::Dtype::I64 => Ok(DType::I64),
            dtype => Err(Error::UnsupportedDTypeError(format!("{dtype:?}")))
        }
    }

    pub fn from_candle(dtype: candle_core::DType) -> Result<Self, Error> {
        match dtype {
            candle_core::DType::F32 => Ok(DType::F32),
            candle_core::DType::BF16 => Ok(DType::BF16),
            candle_core::DType::F16 => Ok(DType::F16),
            candle_core::DType::I64 => Ok(DType::I64),
            dtype => Err(Error::UnsupportedDTypeError(format!("{dtype:?}")))
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::I8 | DType::Bool => 1,
            DType::F16 | DType::BF16 | DType::U16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::I64 => 8,
        }
    }
}

impl From<DType> for onnx::tensor_proto::DataType {
    fn from(value: DType) -> Self {
        match value {
            DType::F32 => onnx::tensor_proto::DataType::Float,
            DType::F16 => onnx::tensor_proto::DataType::Float16,
            DType::BF16 => onnx::tensor_proto::DataType::Bfloat16,
            DType::I8 => onnx::tensor_proto::DataType::Int8,
            DType::U16 => onnx::tensor_proto::DataType::Uint16,
            DType::I32 => onnx::tensor_proto::DataType::Int32,
            DType::I64 => onnx::tensor_proto::DataType::Int64,
            DType::Bool => onnx::tensor_proto::DataType::Bool,
        }
    }
}

impl core::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub trait Tensor {
    fn dtype(&self) -> DType;
    fn shape(&self) -> &Shape;
    fn rank(&self) -> usize {
        self.shape().rank()
    }
    fn to_value_info_proto(&self, name: String) -> ValueInfoProto {
        ValueInfoProto{
            name,
            r#type: Some(
                onnx::TypeProto{
                    value: Some(
                        onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                            elem_type: onnx::tensor_proto::DataType::from(self.dtype()) as i32,
                            shape: Some(self.shape().into())
                        })
                    ),
                    denotation: String::new()
                }
            ),
            .. Default::default()
        }
    }

    /// The node producing this tensor, if it is computed by the graph.
    fn as_node(&self) -> Option<&dyn Node> {
        None
    }

    /// Reads the backing data of a stored weight.
    fn load_data(&self) -> Result<Option<TensorData>, Error> {
        Ok(None)
    }

    fn gather_weights<'a>(&'a self, _manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<(), Error> {
        Ok(())
    }

    fn get_initializer<'a>(&'a self, _name: String, _manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<Option<TensorProto>, Error> {
        Ok(None)
    }

    fn get_name(&self) -> Option<&str> {
        None
    }

    /// Data known while building the graph (constants and shapes of static tensors).
    fn resolve_data(&self) -> Option<TensorData> {
        None
    }

    fn is_input(&self) -> bool;
}

impl<'a> PartialEq for &'a dyn Tensor{
    fn eq(&self, other:&Self) -> bool{
        std::ptr::addr_eq(*self, *other)
    }
}

impl<'a> Eq for &'a dyn Tensor{}

impl<'a> Hash for &'a dyn Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a: *const _ = *self;
        let address: *const u8 = a.cast();
        state.write_usize(address.addr());
    }
}

impl <T: SingleOutputNode> Tensor for T {
    fn dtype(&self) -> DType {
        self.get_output_dtype()
    }

    fn shape(&self) -> &Shape {
        self.get_output_shape()
    }

    fn as_node(&self) -> Option<&dyn Node> {
        Some(self as &dyn Node)
    }

    fn resolve_data(&self) -> Option<TensorData> {
        self.resolve_output_data()
    }

    fn is_input(&self) -> bool {
        false
    }
}

/// A graph input fed by the caller at inference time.
pub struct InputTensor {
    data_type: DType,
    name: String,
    shape: Shape
}

impl InputTensor {
    pub fn new(name: String, data_type: DType, shape: Shape) -> Arc<Self> {
        Arc::new(Self {name, data_type, shape })
    }
}

impl Tensor for InputTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_input(&self) -> bool {
        true
    }
}

/// A named initializer whose data was computed while building the graph.
pub struct InitializerTensor {
    name: String,
    data: TensorData
}

impl InitializerTensor {
    pub fn new(name: String, data: TensorData) -> Arc<Self> {
        Arc::new(Self { name, data })
    }
}

impl Tensor for InitializerTensor {
    fn dtype(&self) -> DType {
        self.data.dtype()
    }

    fn shape(&self) -> &Shape {
        self.data.shape()
    }

    fn load_data(&self) -> Result<Option<TensorData>, Error> {
        Ok(Some(self.data.clone()))
    }

    fn gather_weights<'a>(&'a self, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<(), Error> {
        manager.write_tensor_data(self, self.data.clone())
    }

    fn get_initializer<'a>(&'a self, name: String, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<Option<TensorProto>, Error> {
        manager.get_initializer(self, name)
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_input(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub enum TensorDataValue {
    F32(Vec<f32>),
    BF16(Vec<half::bf16>),
    F16(Vec<half::f16>),
    I8(Vec<i8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

fn decode_le<const N: usize, T>(data: &[u8], f: fn([u8; N]) -> T) -> Vec<T> {
    data.chunks_exact(N).map(|chunk| {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(chunk);
        f(bytes)
    }).collect()
}

impl TensorDataValue {
    pub fn len(&self) -> usize {
        match self {
            TensorDataValue::F32(v) => v.len(),
            TensorDataValue::BF16(v) => v.len(),
            TensorDataValue::F16(v) => v.len(),
            TensorDataValue::I8(v) => v.len(),
            TensorDataValue::I32(v) => v.len(),
            TensorDataValue::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorDataValue::F32(_) => DType::F32,
            TensorDataValue::BF16(_) => DType::BF16,
            TensorDataValue::F16(_) => DType::F16,
            TensorDataValue::I8(_) => DType::I8,
            TensorDataValue::I32(_) => DType::I32,
            TensorDataValue::I64(_) => DType::I64,
        }
    }

    pub fn get_raw_encoding(&self) -> Vec<u8> {
        match self {
            TensorDataValue::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::BF16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::F16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I8(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    pub fn from_raw_encoding(dtype: DType, data: &[u8]) -> Result<Self, Error> {
        match dtype {
            DType::F32 => Ok(TensorDataValue::F32(decode_le(data, f32::from_le_bytes))),
            DType::F16 => Ok(TensorDataValue::F16(decode_le(data, half::f16::from_le_bytes))),
            DType::BF16 => Ok(TensorDataValue::BF16(decode_le(data, half::bf16::from_le_bytes))),
            DType::I8 => Ok(TensorDataValue::I8(decode_le(data, i8::from_le_bytes))),
            DType::I32 => Ok(TensorDataValue::I32(decode_le(data, i32::from_le_bytes))),
            DType::I64 => Ok(TensorDataValue::I64(decode_le(data, i64::from_le_bytes))),
            dtype => Err(Error::UnsupportedDTypeError(dtype.to_string()))
        }
    }

    /// Widens float data to f32.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>, Error> {
        match self {
            TensorDataValue::F32(v) => Ok(v.clone()),
            TensorDataValue::F16(v) => Ok(v.iter().map(|x| x.to_f32()).collect()),
            TensorDataValue::BF16(v) => Ok(v.iter().map(|x| x.to_f32()).collect()),
            other => Err(Error::InvalidDTypeError(other.dtype()))
        }
    }
}

impl From<Vec<f32>> for TensorDataValue {
    fn from(value: Vec<f32>) -> Self {
        TensorDataValue::F32(value)
    }
}

impl From<Vec<half::bf16>> for TensorDataValue {
    fn from(value: Vec<half::bf16>) -> Self {
        TensorDataValue::BF16(value)
    }
}

impl From<Vec<half::f16>> for TensorDataValue {
    fn from(value: Vec<half::f16>) -> Self {
        TensorDataValue::F16(value)
    }
}

impl From<Vec<i8>> for TensorDataValue {
    fn from(value: Vec<i8>) -> Self {
        TensorDataValue::I8(value)
    }
}

impl From<Vec<i32>> for TensorDataValue {
    fn from(value: Vec<i32>) -> Self {
        TensorDataValue::I32(value)
    }
}

impl From<Vec<i64>> for TensorDataValue {
    fn from(value: Vec<i64>) -> Self {
        TensorDataValue::I64(value)
    }
}

#[derive(Debug, Clone)]
pub struct TensorData {
    value: TensorDataValue,
    shape: Shape
}

impl TensorData {
    pub fn new(value: TensorDataValue, shape: Shape) -> Result<Self, Error> {
        let expected = shape.num_elements()?;
        if expected != value.len() {
            return Err(Error::InvalidInputError(format!("shape {shape} needs {expected} elements, got {}", value.len())));
        }
        Ok(Self { value, shape })
    }

    pub fn fill<T>(shape: Shape, value: T) -> Result<Self, Error>
    where
        T: Copy,
        TensorDataValue: From<Vec<T>>,
    {
        let num_elements = shape.num_elements()?;
        let data = vec![value; num_elements];
        Self::new(TensorDataValue::from(data), shape)
    }

    /// A rank-0 tensor holding one value.
    pub fn scalar<T>(value: T) -> Self
    where
        TensorDataValue: From<Vec<T>>,
    {
        Self { value: TensorDataValue::from(vec![value]), shape: Shape::scalar() }
    }

    /// A rank-1 tensor holding `values`.
    pub fn vector<T>(values: Vec<T>) -> Self
    where
        TensorDataValue: From<Vec<T>>,
    {
        let shape = Shape::from(vec![values.len()]);
        Self { value: TensorDataValue::from(values), shape }
    }

    pub fn dtype(&self) -> DType {
        self.value.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn value(&self) -> &TensorDataValue {
        &self.value
    }

    pub fn to_int_vec(&self) -> Result<Vec<i64>, Error> {
        match &self.value {
            TensorDataValue::I32(x) => Ok(x.iter().map(|x| *x as i64).collect()),
            TensorDataValue::I64(x) => Ok(x.clone()),
            other => Err(Error::InvalidDTypeError(other.dtype())),
        }
    }

    pub fn to_tensor_data_proto(&self, name: Option<String>) -> Result<TensorProto, Error> {
        Ok(TensorProto{
            name: name.unwrap_or_default(),
            data_type: (onnx::tensor_proto::DataType::from(self.value.dtype()) as i32),
            dims: self.shape.resolve()?.iter().map(|x| *x as i64).collect(),
            raw_data: self.value.get_raw_encoding(),
            ..Default::default()
        })
    }

    pub fn from_candle_tensor(tensor: candle_core::Tensor) -> Result<Self, Error> {
        let shape = Shape::from(tensor.shape());
        let flat = tensor.flatten_all()?;
        let value = match tensor.dtype() {
            candle_core::DType::F32 => TensorDataValue::F32(flat.to_vec1()?),
            candle_core::DType::BF16 => TensorDataValue::BF16(flat.to_vec1()?),
            candle_core::DType::F16 => TensorDataValue::F16(flat.to_vec1()?),
            candle_core::DType::I64 => TensorDataValue::I64(flat.to_vec1()?),
            dtype => return Err(Error::UnsupportedDTypeError(format!("{dtype:?}"))),
        };
        Self::new(value, shape)
    }

    pub(crate) fn to_raw_encoding(&self) -> Vec<u8> {
        self.value.get_raw_encoding()
    }

    pub fn from_safetensors_view(tensor: safetensors::tensor::TensorView) -> Result<Self, Error> {
        let dtype = DType::from_safetensors(tensor.dtype())?;
        let shape = Shape::from(tensor.shape());
        let value = TensorDataValue::from_raw_encoding(dtype, tensor.data())?;
        Self::new(value, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_trailing_vector() {
        let batch = Dimension::symbolic("batch_size");
        let seq = Dimension::symbolic("sequence_length");
        let a = Shape::new(vec![batch.clone(), seq.clone(), Dimension::fixed(32)]);
        let b = Shape::from(vec![32usize]);
        let out = broadcast_shapes(&a, &b).unwrap();
        assert_eq!(out, a);
        assert_eq!(out.to_string(), "[batch_sizexsequence_lengthx32]");
    }

    #[test]
    fn broadcast_expands_ones() {
        let seq = Dimension::symbolic("sequence_length");
        let a = Shape::new(vec![Dimension::symbolic("batch_size"), Dimension::fixed(4), seq.clone(), seq.clone()]);
        let mask = Shape::new(vec![a.dims[0].clone(), Dimension::fixed(1), Dimension::fixed(1), seq.clone()]);
        let out = broadcast_shapes(&a, &mask).unwrap();
        assert_eq!(out.dims[1].value, Some(4));
        assert!(Arc::ptr_eq(&out.dims[2], &seq));
    }

    #[test]
    fn broadcast_rejects_incompatible() {
        let a = Shape::from(vec![3usize, 4]);
        let b = Shape::from(vec![5usize]);
        assert!(matches!(broadcast_shapes(&a, &b), Err(Error::InputShapeError(_))));
    }

    #[test]
    fn tensor_data_checks_element_count() {
        let err = TensorData::new(vec![1.0f32, 2.0].into(), Shape::from(vec![3usize]));
        assert!(matches!(err, Err(Error::InvalidInputError(_))));
    }

    #[test]
    fn half_precision_widens_to_f32() {
        let raw: Vec<u8> = [half::f16::from_f32(1.5), half::f16::from_f32(-2.0)]
            .iter()
            .flat_map(|x| x.to_le_bytes())
            .collect();
        let value = TensorDataValue::from_raw_encoding(DType::F16, &raw).unwrap();
        assert_eq!(value.to_f32_vec().unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn scalar_proto_has_no_dims() {
        let proto = TensorData::scalar(7i64).to_tensor_data_proto(Some("k".to_string())).unwrap();
        assert!(proto.dims.is_empty());
        assert_eq!(proto.raw_data, 7i64.to_le_bytes().to_vec());
        assert_eq!(proto.data_type, onnx::tensor_proto::DataType::Int64 as i32);
    }

    #[test]
    fn negative_axis_is_normalized() {
        let shape = Shape::from(vec![2usize, 3, 4]);
        assert_eq!(shape.axis(-1).unwrap(), 2);
        assert!(shape.axis(3).is_err());
    }
}
