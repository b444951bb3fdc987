use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use log::{debug, info};
use memmap2::Mmap;
use serde::Deserialize;
use onnx_graph::tensor::Tensor;
use onnx_graph::weights::{PthWeightManager, SafetensorsWeightManager, WeightManager};
use crate::config::EncoderConfig;
use crate::source::{FileFetcher, ModelSource, RetrievalSettings};
use crate::tokenizer::TokenizerArtifacts;
use crate::RetrievalError;

pub const CONFIG_FILE: &str = "config.json";
const SAFETENSORS_FILE: &str = "model.safetensors";
const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";
const PYTORCH_FILE: &str = "pytorch_model.bin";

/// Checkpoint weights in whichever format the model was published in.
pub enum AnyWeightManager {
    Safetensors(SafetensorsWeightManager),
    Pth(PthWeightManager),
}

impl WeightManager for AnyWeightManager {
    fn prefix(&self, name: &str) -> Self {
        match self {
            AnyWeightManager::Safetensors(x) => AnyWeightManager::Safetensors(x.prefix(name)),
            AnyWeightManager::Pth(x) => AnyWeightManager::Pth(x.prefix(name)),
        }
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        match self {
            AnyWeightManager::Safetensors(x) => x.get_tensor(name),
            AnyWeightManager::Pth(x) => x.get_tensor(name),
        }
    }

    fn get_prefix_tail(&self) -> Option<&str> {
        match self {
            AnyWeightManager::Safetensors(x) => x.get_prefix_tail(),
            AnyWeightManager::Pth(x) => x.get_prefix_tail(),
        }
    }

    fn get_prefix(&self) -> Option<&str> {
        match self {
            AnyWeightManager::Safetensors(x) => x.get_prefix(),
            AnyWeightManager::Pth(x) => x.get_prefix(),
        }
    }

    fn get_tensor_names(&self) -> Vec<String> {
        match self {
            AnyWeightManager::Safetensors(x) => x.get_tensor_names(),
            AnyWeightManager::Pth(x) => x.get_tensor_names(),
        }
    }

    fn has_tensor(&self, name: &str) -> bool {
        match self {
            AnyWeightManager::Safetensors(x) => x.has_tensor(name),
            AnyWeightManager::Pth(x) => x.has_tensor(name),
        }
    }
}

/// `model.safetensors.index.json`, mapping each tensor to its shard.
#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: BTreeMap<String, String>,
}

/// A model and its tokenizer, both resolved from the same identifier.
pub struct PretrainedModel {
    pub identifier: String,
    pub source: ModelSource,
    pub config: EncoderConfig,
    /// `config.json` exactly as read, written back unchanged.
    pub config_json: Vec<u8>,
    pub weights: AnyWeightManager,
    pub tokenizer: TokenizerArtifacts,
}

fn map_file(path: &Path) -> Result<Arc<Mmap>, RetrievalError> {
    debug!("Mapping {}", path.display());
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file) }?;
    Ok(Arc::new(mmap))
}

fn load_weights(fetcher: &dyn FileFetcher) -> Result<AnyWeightManager, RetrievalError> {
    if let Some(path) = fetcher.get_optional(SAFETENSORS_FILE)? {
        return Ok(AnyWeightManager::Safetensors(SafetensorsWeightManager::new(vec![map_file(&path)?])?));
    }

    if let Some(index_path) = fetcher.get_optional(SAFETENSORS_INDEX_FILE)? {
        let index: SafetensorsIndex = serde_json::from_slice(&fs::read(&index_path)?)?;
        let shards: BTreeSet<&str> = index.weight_map.values().map(String::as_str).collect();
        info!("Loading {} safetensors shards", shards.len());
        let mut mmaps = vec![];
        for shard in shards {
            mmaps.push(map_file(&fetcher.get(shard)?)?);
        }
        return Ok(AnyWeightManager::Safetensors(SafetensorsWeightManager::new(mmaps)?));
    }

    if let Some(path) = fetcher.get_optional(PYTORCH_FILE)? {
        debug!("Reading pickle checkpoint {}", path.display());
        let tensors = candle_core::pickle::PthTensors::new(&path, None).map_err(onnx_graph::Error::from)?;
        return Ok(AnyWeightManager::Pth(PthWeightManager::new(Arc::new(tensors))));
    }

    Err(RetrievalError::MissingWeights(fetcher.identifier().to_string()))
}

/// Resolves `identifier` and loads the classifier and its tokenizer from it.
pub fn load_pretrained(identifier: &str, settings: &RetrievalSettings) -> Result<PretrainedModel, RetrievalError> {
    let source = ModelSource::resolve(identifier, settings)?;
    info!("Loading {} from {:?}", identifier, source);
    let fetcher = source.fetcher(settings)?;

    let config_json = fs::read(fetcher.get(CONFIG_FILE)?)?;
    let config = EncoderConfig::from_huggingface_transformers_json(&serde_json::from_slice(&config_json)?)?;
    debug!("{} with {} layers, hidden size {}", config.model_type, config.num_hidden_layers, config.hidden_size);

    let mut tokenizer = TokenizerArtifacts::load(fetcher.as_ref())?;
    tokenizer.model_max_length = Some(config.max_sequence_length());

    let weights = load_weights(fetcher.as_ref())?;
    info!("Found {} weight tensors", weights.get_tensor_names().len());

    Ok(PretrainedModel {
        identifier: identifier.to_string(),
        source,
        config,
        config_json,
        weights,
        tokenizer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TinyCheckpoint;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn loads_a_local_checkpoint() {
        init();
        let dir = tempfile::tempdir().unwrap();
        TinyCheckpoint::xlm_roberta().write(dir.path()).unwrap();
        let identifier = dir.path().to_str().unwrap();

        let model = load_pretrained(identifier, &RetrievalSettings::default()).unwrap();
        assert_eq!(model.identifier, identifier);
        assert_eq!(model.source, ModelSource::Local(dir.path().to_path_buf()));
        assert_eq!(model.config.model_type, "xlm-roberta");
        assert_eq!(model.config_json, fs::read(dir.path().join(CONFIG_FILE)).unwrap());
        assert!(model.weights.has_tensor("classifier.out_proj.weight"));
        assert!(model.tokenizer.sentencepiece_model.is_some());
        assert_eq!(model.tokenizer.model_max_length, Some(model.config.max_sequence_length()));
    }

    #[test]
    fn loads_sharded_weights() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoint = TinyCheckpoint::bert();
        checkpoint.sharded = true;
        checkpoint.write(dir.path()).unwrap();
        assert!(!dir.path().join(SAFETENSORS_FILE).exists());

        let model = load_pretrained(dir.path().to_str().unwrap(), &RetrievalSettings::default()).unwrap();
        let weights = model.weights.prefix("bert").prefix("embeddings");
        assert!(weights.has_tensor("word_embeddings.weight"));
        assert!(model.weights.has_tensor("classifier.weight"));
    }

    #[test]
    fn missing_weights_are_reported() {
        init();
        let dir = tempfile::tempdir().unwrap();
        TinyCheckpoint::xlm_roberta().write(dir.path()).unwrap();
        fs::remove_file(dir.path().join(SAFETENSORS_FILE)).unwrap();

        let result = load_pretrained(dir.path().to_str().unwrap(), &RetrievalSettings::default());
        assert!(matches!(result, Err(RetrievalError::MissingWeights(_))));
    }

    #[test]
    fn offline_unknown_model_fails() {
        init();
        let cache = tempfile::tempdir().unwrap();
        let settings = RetrievalSettings {
            cache_dir: Some(cache.path().to_path_buf()),
            offline: true,
            ..Default::default()
        };
        let result = load_pretrained("does-not-exist/model", &settings);
        assert!(matches!(result, Err(RetrievalError::NotCached { .. })));
    }
}
