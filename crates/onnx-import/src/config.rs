use std::collections::BTreeMap;
use std::str::FromStr;
use crate::{ConversionError, RetrievalError};

/// Encoder families with a sequence-classification head.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::EnumString, strum_macros::Display, strum_macros::EnumIter)]
pub enum Architecture {
    #[strum(serialize = "xlm-roberta")]
    XlmRoberta,
    #[strum(serialize = "roberta")]
    Roberta,
    #[strum(serialize = "bert")]
    Bert,
}

impl Architecture {
    /// Prefix of the encoder weights inside a `*ForSequenceClassification` checkpoint.
    pub fn base_prefix(&self) -> &'static str {
        match self {
            Architecture::XlmRoberta | Architecture::Roberta => "roberta",
            Architecture::Bert => "bert",
        }
    }

    /// RoBERTa counts positions from `pad_token_id + 1`.
    pub fn offsets_positions(&self) -> bool {
        !matches!(self, Architecture::Bert)
    }

    pub fn uses_token_type_ids(&self) -> bool {
        matches!(self, Architecture::Bert)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::EnumString, strum_macros::Display)]
pub enum Activation {
    #[strum(serialize = "gelu")]
    Gelu,
    #[strum(serialize = "gelu_new", serialize = "gelu_pytorch_tanh")]
    GeluTanh,
    #[strum(serialize = "relu")]
    Relu,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EncoderConfig {
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: String,
    pub layer_norm_eps: f32,
    pub pad_token_id: i64,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    pub position_embedding_type: String,
    pub id2label: BTreeMap<usize, String>,
}

impl EncoderConfig {
    pub fn from_huggingface_transformers_json(config: &serde_json::Value) -> Result<Self, RetrievalError> {
        fn get_int(config: &serde_json::Value, key: &str) -> Result<i64, RetrievalError> {
            config
                .get(key)
                .ok_or(RetrievalError::MissingConfigEntryError(key.to_string()))?
                .as_i64()
                .ok_or(RetrievalError::MissingConfigEntryError(key.to_string()))
        }
        fn to_usize(key: &str, value: i64) -> Result<usize, RetrievalError> {
            usize::try_from(value).map_err(|_| RetrievalError::InvalidConfigEntryError { key: key.to_string(), value })
        }
        fn get_usize(config: &serde_json::Value, key: &str) -> Result<usize, RetrievalError> {
            to_usize(key, get_int(config, key)?)
        }
        fn get_usize_or(config: &serde_json::Value, key: &str, default: usize) -> Result<usize, RetrievalError> {
            match config.get(key).and_then(|x| x.as_i64()) {
                Some(value) => to_usize(key, value),
                None => Ok(default),
            }
        }
        fn get_str_or(config: &serde_json::Value, key: &str, default: &str) -> String {
            config.get(key).and_then(|x| x.as_str()).unwrap_or(default).to_string()
        }

        let model_type = config
            .get("model_type")
            .and_then(|x| x.as_str())
            .ok_or(RetrievalError::MissingConfigEntryError("model_type".to_string()))?
            .to_string();

        let id2label = match config.get("id2label").and_then(|x| x.as_object()) {
            Some(labels) => {
                let mut out = BTreeMap::new();
                for (id, label) in labels {
                    let id = id.parse::<usize>()
                        .map_err(|_| RetrievalError::MissingConfigEntryError(format!("id2label.{id}")))?;
                    out.insert(id, label.as_str().unwrap_or_default().to_string());
                }
                out
            }
            None => {
                let num_labels = get_usize_or(config, "num_labels", 2)?;
                (0..num_labels).map(|i| (i, format!("LABEL_{i}"))).collect()
            }
        };

        Ok(Self {
            model_type,
            vocab_size: get_usize(config, "vocab_size")?,
            hidden_size: get_usize(config, "hidden_size")?,
            num_hidden_layers: get_usize(config, "num_hidden_layers")?,
            num_attention_heads: get_usize(config, "num_attention_heads")?,
            intermediate_size: get_usize(config, "intermediate_size")?,
            hidden_act: get_str_or(config, "hidden_act", "gelu"),
            layer_norm_eps: config.get("layer_norm_eps").and_then(|x| x.as_f64()).unwrap_or(1e-12) as f32,
            pad_token_id: get_usize_or(config, "pad_token_id", 0)? as i64,
            max_position_embeddings: get_usize(config, "max_position_embeddings")?,
            type_vocab_size: get_usize_or(config, "type_vocab_size", 2)?,
            position_embedding_type: get_str_or(config, "position_embedding_type", "absolute"),
            id2label,
        })
    }

    pub fn architecture(&self) -> Result<Architecture, ConversionError> {
        Architecture::from_str(&self.model_type)
            .map_err(|_| ConversionError::UnsupportedModelType(self.model_type.clone()))
    }

    pub fn activation(&self) -> Result<Activation, ConversionError> {
        Activation::from_str(&self.hidden_act)
            .map_err(|_| ConversionError::UnsupportedActivation(self.hidden_act.clone()))
    }

    pub fn num_labels(&self) -> usize {
        self.id2label.len()
    }

    pub fn head_dim(&self) -> Result<usize, ConversionError> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(ConversionError::InvalidAttentionHeads {
                hidden_size: self.hidden_size,
                num_attention_heads: self.num_attention_heads,
            });
        }
        Ok(self.hidden_size / self.num_attention_heads)
    }

    /// Longest input the position table can address.
    pub fn max_sequence_length(&self) -> usize {
        match self.architecture() {
            Ok(architecture) if architecture.offsets_positions() => {
                self.max_position_embeddings.saturating_sub(self.pad_token_id.max(0) as usize + 1)
            }
            _ => self.max_position_embeddings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reranker_config() -> serde_json::Value {
        serde_json::json!({
            "architectures": ["XLMRobertaForSequenceClassification"],
            "model_type": "xlm-roberta",
            "vocab_size": 250002,
            "hidden_size": 1024,
            "num_hidden_layers": 24,
            "num_attention_heads": 16,
            "intermediate_size": 4096,
            "hidden_act": "gelu",
            "layer_norm_eps": 1e-05,
            "pad_token_id": 1,
            "max_position_embeddings": 8194,
            "type_vocab_size": 1,
            "position_embedding_type": "absolute",
            "id2label": {"0": "LABEL_0"},
            "label2id": {"LABEL_0": 0}
        })
    }

    #[test]
    fn parses_reranker_config() {
        let config = EncoderConfig::from_huggingface_transformers_json(&reranker_config()).unwrap();
        assert_eq!(config.architecture().unwrap(), Architecture::XlmRoberta);
        assert_eq!(config.activation().unwrap(), Activation::Gelu);
        assert_eq!(config.num_labels(), 1);
        assert_eq!(config.head_dim().unwrap(), 64);
        assert_eq!(config.max_sequence_length(), 8192);
        assert!((config.layer_norm_eps - 1e-5).abs() < 1e-9);
    }

    #[test]
    fn missing_entries_are_reported() {
        let mut json = reranker_config();
        json.as_object_mut().unwrap().remove("hidden_size");
        let err = EncoderConfig::from_huggingface_transformers_json(&json).unwrap_err();
        assert!(matches!(err, RetrievalError::MissingConfigEntryError(key) if key == "hidden_size"));
    }

    #[test]
    fn negative_sizes_are_rejected() {
        for key in ["max_position_embeddings", "pad_token_id"] {
            let mut json = reranker_config();
            json[key] = serde_json::json!(-1);
            let err = EncoderConfig::from_huggingface_transformers_json(&json).unwrap_err();
            assert!(matches!(err, RetrievalError::InvalidConfigEntryError { key: k, value: -1 } if k == key), "{key}");
        }

        let mut json = reranker_config();
        let object = json.as_object_mut().unwrap();
        object.remove("id2label");
        object.insert("num_labels".to_string(), serde_json::json!(-3));
        let err = EncoderConfig::from_huggingface_transformers_json(&json).unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidConfigEntryError { value: -3, .. }));
    }

    #[test]
    fn labels_default_from_num_labels() {
        let mut json = reranker_config();
        let object = json.as_object_mut().unwrap();
        object.remove("id2label");
        object.insert("num_labels".to_string(), serde_json::json!(3));
        let config = EncoderConfig::from_huggingface_transformers_json(&json).unwrap();
        assert_eq!(config.id2label.get(&2).map(String::as_str), Some("LABEL_2"));
    }

    #[test]
    fn unknown_model_type_is_a_conversion_error() {
        let mut json = reranker_config();
        json["model_type"] = serde_json::json!("gpt2");
        let config = EncoderConfig::from_huggingface_transformers_json(&json).unwrap();
        assert!(matches!(config.architecture(), Err(ConversionError::UnsupportedModelType(_))));
    }

    #[test]
    fn tanh_gelu_aliases() {
        assert_eq!(Activation::from_str("gelu_pytorch_tanh").unwrap(), Activation::GeluTanh);
        assert_eq!(Activation::from_str("gelu_new").unwrap(), Activation::GeluTanh);
        assert!(Activation::from_str("silu").is_err());
    }

    #[test]
    fn architecture_names_round_trip_through_display() {
        use strum::IntoEnumIterator;
        for architecture in Architecture::iter() {
            assert_eq!(Architecture::from_str(&architecture.to_string()).unwrap(), architecture);
        }
    }
}
