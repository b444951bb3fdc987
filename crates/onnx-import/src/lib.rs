pub mod config;
pub mod encoder;
pub mod export;
pub mod loader;
pub mod source;
pub mod tokenizer;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{Activation, Architecture, EncoderConfig};
pub use encoder::{build_classifier_graph, ClassifierGraph, GraphOptions, WeightStorage};
pub use loader::{load_pretrained, PretrainedModel};
pub use source::{ModelSource, RetrievalSettings};
pub use tokenizer::TokenizerArtifacts;

/// Failures while resolving an identifier and reading the model files.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Model \"{0}\" contains invalid characters, expected only alphanumeric or '-', '_', '.', '/'")]
    InvalidIdentifier(String),
    #[error("Revision \"{0}\" contains invalid characters, expected only alphanumeric or '-', '_', '.', '/'")]
    InvalidRevision(String),
    #[error("Registry request for {identifier} failed: {source}")]
    RegistryError {
        identifier: String,
        #[source]
        source: hf_hub::api::sync::ApiError,
    },
    #[error("{identifier} is not in the local registry cache")]
    NotCached { identifier: String },
    #[error("{identifier} has no {file}")]
    MissingFile { identifier: String, file: String },
    #[error("{0} has no model.safetensors, model.safetensors.index.json or pytorch_model.bin")]
    MissingWeights(String),
    #[error("Read error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Config file parse error: {0}")]
    ConfigFileParseError(#[from] serde_json::Error),
    #[error("Missing config entry: {0}")]
    MissingConfigEntryError(String),
    #[error("Config entry {key} = {value} is out of range")]
    InvalidConfigEntryError { key: String, value: i64 },
    #[error("Weight load error: {0}")]
    WeightLoadError(#[from] onnx_graph::Error),
    #[error("Tokenizer load error: {0}")]
    TokenizerLoadError(String),
}

/// Failures while building or serializing the ONNX graph.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Unsupported model type: {0}")]
    UnsupportedModelType(String),
    #[error("Unsupported activation: {0}")]
    UnsupportedActivation(String),
    #[error("Unsupported position embedding type: {0}")]
    UnsupportedPositionEmbedding(String),
    #[error("Not a sequence classification checkpoint, missing {0}")]
    MissingClassifierHead(String),
    #[error("Hidden size {hidden_size} is not divisible by {num_attention_heads} attention heads")]
    InvalidAttentionHeads { hidden_size: usize, num_attention_heads: usize },
    #[error("Config lists {labels} labels but the classifier produces {outputs}")]
    LabelCountMismatch { labels: usize, outputs: usize },
    #[error("Graph error: {0}")]
    GraphError(#[from] onnx_graph::Error),
    #[error("Write error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failures while writing the tokenizer and config artifacts.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("Write error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Tokenizer serialization error: {0}")]
    TokenizerSaveError(String),
    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}
