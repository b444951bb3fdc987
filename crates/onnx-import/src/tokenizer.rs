use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, warn};
use serde_json::{Map, Value};
use tokenizers::Tokenizer;
use crate::source::FileFetcher;
use crate::{RetrievalError, WriteError};

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
pub const SPECIAL_TOKENS_MAP_FILE: &str = "special_tokens_map.json";
pub const SENTENCEPIECE_FILE: &str = "sentencepiece.bpe.model";

/// Special-token roles and the token spellings that fill them, RoBERTa style first.
const SPECIAL_TOKEN_KEYS: [(&str, [&str; 2]); 7] = [
    ("bos_token", ["<s>", "[CLS]"]),
    ("eos_token", ["</s>", "[SEP]"]),
    ("unk_token", ["<unk>", "[UNK]"]),
    ("sep_token", ["</s>", "[SEP]"]),
    ("pad_token", ["<pad>", "[PAD]"]),
    ("cls_token", ["<s>", "[CLS]"]),
    ("mask_token", ["<mask>", "[MASK]"]),
];

/// Everything a consumer needs to reproduce the model's tokenization.
pub struct TokenizerArtifacts {
    pub tokenizer: Tokenizer,
    pub tokenizer_config: Option<Value>,
    pub special_tokens_map: Option<Vec<u8>>,
    pub sentencepiece_model: Option<Vec<u8>>,
    /// Used when `tokenizer_config.json` has to be synthesized.
    pub model_max_length: Option<usize>,
}

impl TokenizerArtifacts {
    pub fn load(fetcher: &dyn FileFetcher) -> Result<Self, RetrievalError> {
        let tokenizer_path = fetcher.get(TOKENIZER_FILE)?;
        debug!("Loading tokenizer from {}", tokenizer_path.display());
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| RetrievalError::TokenizerLoadError(e.to_string()))?;

        let tokenizer_config = match fetcher.get_optional(TOKENIZER_CONFIG_FILE)? {
            Some(path) => Some(serde_json::from_slice(&fs::read(path)?)?),
            None => {
                warn!("{} has no {}, it will be synthesized", fetcher.identifier(), TOKENIZER_CONFIG_FILE);
                None
            }
        };
        let special_tokens_map = fetcher.get_optional(SPECIAL_TOKENS_MAP_FILE)?
            .map(fs::read)
            .transpose()?;
        let sentencepiece_model = fetcher.get_optional(SENTENCEPIECE_FILE)?
            .map(fs::read)
            .transpose()?;

        Ok(Self {
            tokenizer,
            tokenizer_config,
            special_tokens_map,
            sentencepiece_model,
            model_max_length: None,
        })
    }

    /// The special tokens of the tokenizer, ordered by id.
    fn special_tokens(&self) -> Vec<(u32, tokenizers::AddedToken)> {
        let mut tokens: Vec<_> = self.tokenizer.get_added_tokens_decoder()
            .into_iter()
            .filter(|(_, token)| token.special)
            .collect();
        tokens.sort_by_key(|(id, _)| *id);
        tokens
    }

    fn synthesize_tokenizer_config(&self) -> Value {
        let special_tokens = self.special_tokens();
        let mut config = Map::new();

        let mut decoder = Map::new();
        for (id, token) in &special_tokens {
            decoder.insert(id.to_string(), serde_json::json!({
                "content": token.content,
                "lstrip": token.lstrip,
                "normalized": token.normalized,
                "rstrip": token.rstrip,
                "single_word": token.single_word,
                "special": token.special,
            }));
        }
        config.insert("added_tokens_decoder".to_string(), Value::Object(decoder));

        for (key, spellings) in SPECIAL_TOKEN_KEYS {
            if let Some((_, token)) = special_tokens.iter().find(|(_, token)| spellings.contains(&token.content.as_str())) {
                config.insert(key.to_string(), Value::String(token.content.clone()));
            }
        }
        if let Some(model_max_length) = self.model_max_length {
            config.insert("model_max_length".to_string(), Value::from(model_max_length));
        }
        config.insert("tokenizer_class".to_string(), Value::String("PreTrainedTokenizerFast".to_string()));
        Value::Object(config)
    }

    fn derive_special_tokens_map(tokenizer_config: &Value) -> Value {
        let mut map = Map::new();
        for (key, _) in SPECIAL_TOKEN_KEYS {
            if let Some(value) = tokenizer_config.get(key).filter(|x| !x.is_null()) {
                map.insert(key.to_string(), value.clone());
            }
        }
        Value::Object(map)
    }

    /// Writes the tokenizer files into `dir`, returning the paths written.
    pub fn save_pretrained(&self, dir: &Path) -> Result<Vec<PathBuf>, WriteError> {
        fs::create_dir_all(dir)?;
        let mut written = vec![];

        let tokenizer_path = dir.join(TOKENIZER_FILE);
        self.tokenizer.save(&tokenizer_path, true)
            .map_err(|e| WriteError::TokenizerSaveError(e.to_string()))?;
        written.push(tokenizer_path);

        let tokenizer_config = match &self.tokenizer_config {
            Some(config) => config.clone(),
            None => self.synthesize_tokenizer_config(),
        };
        let config_path = dir.join(TOKENIZER_CONFIG_FILE);
        fs::write(&config_path, serde_json::to_vec_pretty(&tokenizer_config)?)?;
        written.push(config_path);

        let special_tokens_map = match &self.special_tokens_map {
            Some(bytes) => bytes.clone(),
            None => serde_json::to_vec_pretty(&Self::derive_special_tokens_map(&tokenizer_config))?,
        };
        let map_path = dir.join(SPECIAL_TOKENS_MAP_FILE);
        fs::write(&map_path, special_tokens_map)?;
        written.push(map_path);

        if let Some(model) = &self.sentencepiece_model {
            let path = dir.join(SENTENCEPIECE_FILE);
            fs::write(&path, model)?;
            written.push(path);
        }

        for path in &written {
            debug!("Wrote {}", path.display());
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LocalDirFetcher;
    use crate::testing::TinyCheckpoint;

    fn load(checkpoint: &TinyCheckpoint) -> (tempfile::TempDir, TokenizerArtifacts) {
        let dir = tempfile::tempdir().unwrap();
        checkpoint.write(dir.path()).unwrap();
        let artifacts = TokenizerArtifacts::load(&LocalDirFetcher::new(dir.path().to_path_buf())).unwrap();
        (dir, artifacts)
    }

    #[test]
    fn source_files_are_kept() {
        let (_src, artifacts) = load(&TinyCheckpoint::xlm_roberta());
        let out = tempfile::tempdir().unwrap();
        let written = artifacts.save_pretrained(out.path()).unwrap();
        assert_eq!(written.len(), 4);

        let sentencepiece = fs::read(out.path().join(SENTENCEPIECE_FILE)).unwrap();
        assert_eq!(Some(sentencepiece), artifacts.sentencepiece_model);
        let config: Value = serde_json::from_slice(&fs::read(out.path().join(TOKENIZER_CONFIG_FILE)).unwrap()).unwrap();
        assert_eq!(config["tokenizer_class"], "XLMRobertaTokenizer");
    }

    #[test]
    fn missing_configs_are_synthesized() {
        let mut checkpoint = TinyCheckpoint::bert();
        checkpoint.with_tokenizer_config = false;
        checkpoint.with_special_tokens_map = false;
        let (_src, mut artifacts) = load(&checkpoint);
        artifacts.model_max_length = Some(64);

        let out = tempfile::tempdir().unwrap();
        let written = artifacts.save_pretrained(out.path()).unwrap();
        assert_eq!(written.len(), 3);

        let config: Value = serde_json::from_slice(&fs::read(out.path().join(TOKENIZER_CONFIG_FILE)).unwrap()).unwrap();
        assert_eq!(config["model_max_length"], 64);
        assert_eq!(config["cls_token"], "[CLS]");
        assert_eq!(config["added_tokens_decoder"]["0"]["content"], "[PAD]");

        let map: Value = serde_json::from_slice(&fs::read(out.path().join(SPECIAL_TOKENS_MAP_FILE)).unwrap()).unwrap();
        assert_eq!(map["sep_token"], "[SEP]");
        assert_eq!(map["mask_token"], "[MASK]");
        assert!(map.get("model_max_length").is_none());
    }

    #[test]
    fn saving_twice_is_byte_identical() {
        let (_src, artifacts) = load(&TinyCheckpoint::xlm_roberta());
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        artifacts.save_pretrained(a.path()).unwrap();
        artifacts.save_pretrained(b.path()).unwrap();
        for file in [TOKENIZER_FILE, TOKENIZER_CONFIG_FILE, SPECIAL_TOKENS_MAP_FILE] {
            assert_eq!(fs::read(a.path().join(file)).unwrap(), fs::read(b.path().join(file)).unwrap(), "{file}");
        }
    }

    #[test]
    fn saved_tokenizer_still_encodes() {
        let (_src, artifacts) = load(&TinyCheckpoint::xlm_roberta());
        let out = tempfile::tempdir().unwrap();
        artifacts.save_pretrained(out.path()).unwrap();
        let reloaded = Tokenizer::from_file(out.path().join(TOKENIZER_FILE)).unwrap();
        let before = artifacts.tokenizer.encode("hello world", false).unwrap();
        let after = reloaded.encode("hello world", false).unwrap();
        assert_eq!(before.get_ids(), after.get_ids());
    }

    #[test]
    fn missing_tokenizer_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = TokenizerArtifacts::load(&LocalDirFetcher::new(dir.path().to_path_buf()));
        assert!(matches!(result, Err(RetrievalError::MissingFile { .. })));
    }
}
