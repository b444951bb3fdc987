use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use memmap2::Mmap;
use safetensors::SafeTensors;
use safetensors::tensor::{Metadata, TensorInfo};
use crate::{onnx, Error};
use crate::onnx::TensorProto;
use crate::tensor::{DType, Shape, Tensor, TensorData};

/// Protobuf messages cannot exceed 2 GiB; leave room for the graph itself.
pub const MAX_EMBEDDED_BYTES: usize = (1 << 31) - (64 << 20);

pub trait WeightExternalOutputManager<'a> {
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, data: TensorData) -> Result<(), Error>;
    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error>;
    fn finalize_tensor_data(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

pub struct EmbeddedOutputManager<'a> {
    tensor_data_map: HashMap<&'a dyn Tensor, TensorData>,
    total_bytes: usize,
}

impl<'a> EmbeddedOutputManager<'a> {
    pub fn new() -> Self {
        Self {
            tensor_data_map: HashMap::new(),
            total_bytes: 0,
        }
    }
}

impl<'a> Default for EmbeddedOutputManager<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl <'a> WeightExternalOutputManager<'a> for EmbeddedOutputManager<'a> {
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, tensor_data: TensorData) -> Result<(), Error> {
        self.total_bytes += tensor_data.shape().num_elements()? * tensor_data.dtype().size_in_bytes();
        if self.total_bytes > MAX_EMBEDDED_BYTES {
            return Err(Error::EmbeddedDataTooLargeError(self.total_bytes));
        }
        self.tensor_data_map.insert(graph_tensor, tensor_data);
        Ok(())
    }

    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error> {
        if let Some(tensor_data) = self.tensor_data_map.remove(&graph_tensor) {
            Ok(Some(tensor_data.to_tensor_data_proto(Some(tensor_name))?))
        }
        else {
            Ok(None)
        }
    }
}

/// Streams initializer bytes into a sidecar file as they are gathered.
pub struct BinOutputManager<'a> {
    output: BufWriter<File>,
    output_path: PathBuf,
    offset: usize,
    tensor_data_map: HashMap<&'a dyn Tensor, (usize, usize)>,
    location: Option<String>
}

impl<'a> BinOutputManager<'a> {
    pub fn new(output_location: &Path) -> Result<Self, Error> {
        let output = BufWriter::new(File::create(output_location)?);
        Ok(Self {
            output,
            output_path: output_location.to_path_buf(),
            offset: 0,
            tensor_data_map: HashMap::new(),
            location: None
        })
    }
}

impl<'a> WeightExternalOutputManager<'a> for BinOutputManager<'a> {
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, data: TensorData) -> Result<(), Error> {
        let data = data.to_raw_encoding();
        self.output.write_all(&data)?;
        self.tensor_data_map.insert(graph_tensor, (self.offset, data.len()));
        self.offset += data.len();
        Ok(())
    }

    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error> {
        let Some((byte_offset, byte_len)) = self.tensor_data_map.remove(&graph_tensor) else {
            return Ok(None);
        };
        let location = self.location.clone()
            .ok_or_else(|| Error::InvalidInputError("external data file was not finalized".to_string()))?;
        Ok(Some(TensorProto {
            name: tensor_name,
            data_type: onnx::tensor_proto::DataType::from(graph_tensor.dtype()) as i32,
            dims: graph_tensor.shape().resolve()?.iter().map(|x| *x as i64).collect(),
            data_location: onnx::tensor_proto::DataLocation::External as i32,
            external_data: vec![
                onnx::StringStringEntryProto {
                    key: "location".to_string(),
                    value: location,
                },
                onnx::StringStringEntryProto {
                    key: "offset".to_string(),
                    value: format!("{byte_offset}"),
                },
                onnx::StringStringEntryProto {
                    key: "length".to_string(),
                    value: format!("{byte_len}"),
                }
            ],
            .. Default::default()
        }))
    }

    fn finalize_tensor_data(&mut self) -> Result<(), Error> {
        self.output.flush()?;
        let file_name = self.output_path.file_name()
            .and_then(|x| x.to_str())
            .ok_or_else(|| Error::InvalidInputError(format!("{} has no file name", self.output_path.display())))?;
        self.location = Some(file_name.to_string());
        Ok(())
    }
}

pub trait WeightManager {
    fn prefix(&self, name: &str) -> Self;
    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error>;
    fn get_prefix_tail(&self) -> Option<&str>;
    fn get_prefix(&self) -> Option<&str>;
    fn get_tensor_names(&self) -> Vec<String>;
    fn has_tensor(&self, name: &str) -> bool {
        let full_name = match self.get_prefix() {
            Some(prefix) => format!("{}.{}", prefix, name),
            None => name.to_string()
        };
        self.get_tensor_names().contains(&full_name)
    }
}

fn join_prefix(prefix: &Option<String>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}.{}", prefix, name),
        None => name.to_string()
    }
}

/// A weight stored in a PyTorch pickle checkpoint.
pub struct PthTensor {
    tensor_info: candle_core::pickle::TensorInfo,
    tensors: Arc<candle_core::pickle::PthTensors>,
    data_type: DType,
    shape: Shape
}

impl PthTensor {
    pub fn new(tensor_info: candle_core::pickle::TensorInfo, tensors: Arc<candle_core::pickle::PthTensors>) -> Result<Arc<Self>, Error> {
        let data_type = match tensor_info.dtype {
            candle_core::DType::F32 => DType::F32,
            candle_core::DType::F16 => DType::F16,
            candle_core::DType::BF16 => DType::BF16,
            candle_core::DType::I64 => DType::I64,
            dtype => return Err(Error::UnsupportedDTypeError(format!("{dtype:?}")))
        };
        let shape = Shape::from(tensor_info.layout.shape());
        Ok(Arc::new(Self {
            tensors,
            shape,
            tensor_info,
            data_type
        }))
    }
}

impl Tensor for PthTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn load_data(&self) -> Result<Option<TensorData>, Error> {
        let tensor = self.tensors.get(&self.tensor_info.name)?
            .ok_or_else(|| Error::NoSuchTensorError(self.tensor_info.name.clone()))?;
        Ok(Some(TensorData::from_candle_tensor(tensor)?))
    }

    fn gather_weights<'a>(&'a self, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<(), Error> {
        if let Some(data) = self.load_data()? {
            manager.write_tensor_data(self, data)?;
        }
        Ok(())
    }

    fn get_initializer<'a>(&'a self, name: String, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<Option<TensorProto>, Error> {
        manager.get_initializer(self, name)
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.tensor_info.name)
    }

    fn is_input(&self) -> bool {
        false
    }
}

pub struct PthWeightManager {
    prefix_tail: Option<String>,
    prefix: Option<String>,
    pth_tensors: Arc<candle_core::pickle::PthTensors>
}

impl PthWeightManager {
    pub fn new(pth_tensors: Arc<candle_core::pickle::PthTensors>) -> Self {
        Self {
            prefix_tail: None,
            prefix: None,
            pth_tensors
        }
    }
}

impl WeightManager for PthWeightManager {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix_tail: Some(name.to_string()),
            prefix: Some(join_prefix(&self.prefix, name)),
            pth_tensors: self.pth_tensors.clone()
        }
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
        let name = join_prefix(&self.prefix, name);
        let tensor_infos = self.pth_tensors.tensor_infos();
        let tensor_info = tensor_infos.get(&name).ok_or(Error::NoSuchTensorError(name))?;
        Ok(PthTensor::new(tensor_info.clone(), self.pth_tensors.clone())?)
    }

    fn get_prefix_tail(&self) -> Option<&str> {
        self.prefix_tail.as_deref()
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn get_tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pth_tensors.tensor_infos().keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct SafetensorsWeightManagerInner {
    safetensors_files: Vec<Arc<Mmap>>,
    safetensors_metadata: Vec<(usize, Metadata)>
}

impl SafetensorsWeightManagerInner {
    pub fn new(safetensors_files: Vec<Arc<Mmap>>) -> Result<Self, Error> {
        let mut safetensors_metadata = vec![];
        for safetensors_mmap in &safetensors_files {
            safetensors_metadata.push(SafeTensors::read_metadata(safetensors_mmap)?);
        }
        Ok(Self {
            safetensors_files,
            safetensors_metadata
        })
    }

    pub fn get_tensor_info(&self, name: &str) -> Option<(usize, TensorInfo)> {
        for (i, metadata) in self.safetensors_metadata.iter().enumerate() {
            if let Some(tensor_info) = metadata.1.info(name) {
                return Some((i, tensor_info.clone()));
            }
        }
        None
    }

    fn get_tensor_names(&self) -> Vec<String> {
        let mut out = vec![];
        for metadata in &self.safetensors_metadata {
            out.extend(metadata.1.tensors().keys().cloned());
        }
        out.sort();
        out
    }
}

/// Memory-mapped safetensors files, possibly sharded.
pub struct SafetensorsWeightManager {
    prefix_tail: Option<String>,
    prefix: Option<String>,
    inner: Arc<SafetensorsWeightManagerInner>
}

impl SafetensorsWeightManager {
    pub fn new(safetensors_files: Vec<Arc<Mmap>>) -> Result<Self, Error> {
        Ok(Self {
            prefix_tail: None,
            prefix: None,
            inner: Arc::new(SafetensorsWeightManagerInner::new(safetensors_files)?)
        })
    }
}

impl WeightManager for SafetensorsWeightManager {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix_tail: Some(name.to_string()),
            prefix: Some(join_prefix(&self.prefix, name)),
            inner: self.inner.clone()
        }
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
        let full_name = join_prefix(&self.prefix, name);
        Ok(Arc::new(SafetensorsTensor::new(self.inner.clone(), full_name)?))
    }

    fn get_prefix_tail(&self) -> Option<&str> {
        self.prefix_tail.as_deref()
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn get_tensor_names(&self) -> Vec<String> {
        self.inner.get_tensor_names()
    }

    fn has_tensor(&self, name: &str) -> bool {
        self.inner.get_tensor_info(&join_prefix(&self.prefix, name)).is_some()
    }
}

pub struct SafetensorsTensor {
    name: String,
    inner: Arc<SafetensorsWeightManagerInner>,
    file_index: usize,
    data_type: DType,
    shape: Shape
}

impl SafetensorsTensor {
    pub fn new(inner: Arc<SafetensorsWeightManagerInner>, name: String) -> Result<Self, Error> {
        let (file_index, tensor_info) = inner.get_tensor_info(&name).ok_or(Error::NoSuchTensorError(name.to_string()))?;
        let data_type = DType::from_safetensors(tensor_info.dtype)?;
        let shape = Shape::from(tensor_info.shape.clone());
        Ok(Self {
            name,
            inner,
            file_index,
            data_type,
            shape
        })
    }
}

impl Tensor for SafetensorsTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn load_data(&self) -> Result<Option<TensorData>, Error> {
        let st = SafeTensors::deserialize(&self.inner.safetensors_files[self.file_index])?;
        let view = st.tensor(&self.name)?;
        Ok(Some(TensorData::from_safetensors_view(view)?))
    }

    fn gather_weights<'a>(&'a self, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<(), Error> {
        if let Some(data) = self.load_data()? {
            manager.write_tensor_data(self, data)?;
        }
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    fn write_safetensors(path: &Path) {
        let a: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0].iter().flat_map(|x| x.to_le_bytes()).collect();
        let b: Vec<u8> = [7.0f32, 8.0].iter().flat_map(|x| x.to_le_bytes()).collect();
        let views = vec![
            ("layer.dense.weight", safetensors::tensor::TensorView::new(safetensors::Dtype::F32, vec![2, 3], &a).unwrap()),
            ("layer.dense.bias", safetensors::tensor::TensorView::new(safetensors::Dtype::F32, vec![2], &b).unwrap()),
        ];
        safetensors::serialize_to_file(views, &None, path).unwrap();
    }

    fn open(path: &Path) -> SafetensorsWeightManager {
        let file = File::open(path).unwrap();
        let mmap = unsafe { Mmap::map(&file) }.unwrap();
        SafetensorsWeightManager::new(vec![Arc::new(mmap)]).unwrap()
    }

    #[test]
    fn prefixes_compose() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_safetensors(&path);
        let manager = open(&path);

        let dense = manager.prefix("layer").prefix("dense");
        assert_eq!(dense.get_prefix(), Some("layer.dense"));
        assert_eq!(dense.get_prefix_tail(), Some("dense"));
        assert!(dense.has_tensor("bias"));
        assert!(!dense.has_tensor("scale"));

        let weight = dense.get_tensor("weight").unwrap();
        assert_eq!(weight.get_name(), Some("layer.dense.weight"));
        assert_eq!(weight.shape().resolve().unwrap(), vec![2, 3]);
        assert!(matches!(dense.get_tensor("scale"), Err(Error::NoSuchTensorError(_))));
    }

    #[test]
    fn safetensors_data_loads_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_safetensors(&path);
        let manager = open(&path);

        let bias = manager.get_tensor("layer.dense.bias").unwrap();
        let data = bias.load_data().unwrap().unwrap();
        assert_eq!(data.value().to_f32_vec().unwrap(), vec![7.0, 8.0]);
    }

    #[test]
    fn embedded_manager_enforces_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_safetensors(&path);
        let manager = open(&path);
        let bias = manager.get_tensor("layer.dense.bias").unwrap();

        let mut output = EmbeddedOutputManager::new();
        output.total_bytes = MAX_EMBEDDED_BYTES;
        let err = bias.gather_weights(&mut output);
        assert!(matches!(err, Err(Error::EmbeddedDataTooLargeError(_))));
    }
}
