use std::fs;
use std::path::{Path, PathBuf};
use log::info;
use prost::Message;
use onnx_graph::{build_proto, onnx, WeightStorageStrategy};
use crate::encoder::{ClassifierGraph, WeightStorage};
use crate::loader::{PretrainedModel, CONFIG_FILE};
use crate::{ConversionError, WriteError};

pub const MODEL_FILE: &str = "model.onnx";
pub const EXTERNAL_DATA_FILE: &str = "model.onnx_data";

impl ClassifierGraph {
    pub fn to_model_proto(&self, weight_storage: &WeightStorageStrategy) -> Result<onnx::ModelProto, ConversionError> {
        Ok(build_proto(&self.inputs, &self.outputs, weight_storage, Some(&self.metadata))?)
    }

    /// Writes `model.onnx`, and `model.onnx_data` unless weights are embedded.
    pub fn export(&self, output_dir: &Path, weight_storage: WeightStorage) -> Result<Vec<PathBuf>, ConversionError> {
        fs::create_dir_all(output_dir)?;
        let model_path = output_dir.join(MODEL_FILE);
        let (strategy, data_path) = match weight_storage {
            WeightStorage::External => {
                let data_path = output_dir.join(EXTERNAL_DATA_FILE);
                (WeightStorageStrategy::BinFile(data_path.clone()), Some(data_path))
            }
            WeightStorage::Embedded => (WeightStorageStrategy::EmbeddedData, None),
        };

        let proto = self.to_model_proto(&strategy)?;
        let bytes = proto.encode_to_vec();
        info!("Writing {} ({} bytes, {} nodes)", model_path.display(), bytes.len(),
            proto.graph.as_ref().map_or(0, |graph| graph.node.len()));
        fs::write(&model_path, bytes)?;

        let mut written = vec![model_path];
        written.extend(data_path);
        Ok(written)
    }
}

impl PretrainedModel {
    /// Writes `config.json` from the bytes read at load time.
    pub fn save_config(&self, output_dir: &Path) -> Result<PathBuf, WriteError> {
        fs::create_dir_all(output_dir)?;
        let path = output_dir.join(CONFIG_FILE);
        fs::write(&path, &self.config_json)?;
        Ok(path)
    }
}
