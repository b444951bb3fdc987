//! A tiny, randomly initialized sequence-classification checkpoint on disk.
//!
//! The layout mirrors what the registry serves for `*ForSequenceClassification`
//! models: `config.json`, `model.safetensors` (or an index plus shards),
//! `tokenizer.json` and the optional tokenizer side files.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use anyhow::Context;
use serde_json::json;

struct Lcg(u64);

impl Lcg {
    /// Uniform in `[-scale, scale)`.
    fn next(&mut self, scale: f32) -> f32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let unit = (self.0 >> 40) as f32 / (1u64 << 24) as f32;
        (unit * 2.0 - 1.0) * scale
    }
}

#[derive(Clone, Debug)]
pub struct TinyCheckpoint {
    pub model_type: String,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_labels: usize,
    pub hidden_act: String,
    pub pad_token_id: usize,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    pub special_tokens: Vec<&'static str>,
    pub words: Vec<&'static str>,
    pub with_head: bool,
    pub sharded: bool,
    pub with_tokenizer_config: bool,
    pub with_special_tokens_map: bool,
    pub with_sentencepiece: bool,
    pub seed: u64,
}

const LAYER_NORM_EPS: f32 = 1e-5;

const WORDS: [&str; 8] = ["hello", "world", "what", "is", "rust", "onnx", "a", "model"];

impl TinyCheckpoint {
    pub fn xlm_roberta() -> Self {
        Self {
            model_type: "xlm-roberta".to_string(),
            hidden_size: 32,
            num_attention_heads: 4,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_labels: 2,
            hidden_act: "gelu".to_string(),
            pad_token_id: 1,
            max_position_embeddings: 40,
            type_vocab_size: 1,
            special_tokens: vec!["<s>", "<pad>", "</s>", "<unk>", "<mask>"],
            words: WORDS.to_vec(),
            with_head: true,
            sharded: false,
            with_tokenizer_config: true,
            with_special_tokens_map: true,
            with_sentencepiece: true,
            seed: 7,
        }
    }

    pub fn bert() -> Self {
        Self {
            model_type: "bert".to_string(),
            pad_token_id: 0,
            max_position_embeddings: 32,
            type_vocab_size: 2,
            special_tokens: vec!["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]"],
            with_sentencepiece: false,
            seed: 11,
            ..Self::xlm_roberta()
        }
    }

    pub fn with_model_type(mut self, model_type: &str) -> Self {
        self.model_type = model_type.to_string();
        self
    }

    fn vocab_size(&self) -> usize {
        self.special_tokens.len() + self.words.len()
    }

    fn base_prefix(&self) -> &'static str {
        if self.model_type == "bert" { "bert" } else { "roberta" }
    }

    fn tensor_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let h = self.hidden_size;
        let base = self.base_prefix();
        let mut shapes = vec![];
        let linear = |shapes: &mut Vec<(String, Vec<usize>)>, prefix: String, out: usize, inp: usize| {
            shapes.push((format!("{prefix}.weight"), vec![out, inp]));
            shapes.push((format!("{prefix}.bias"), vec![out]));
        };
        let layer_norm = |shapes: &mut Vec<(String, Vec<usize>)>, prefix: String| {
            shapes.push((format!("{prefix}.weight"), vec![h]));
            shapes.push((format!("{prefix}.bias"), vec![h]));
        };

        shapes.push((format!("{base}.embeddings.word_embeddings.weight"), vec![self.vocab_size(), h]));
        shapes.push((format!("{base}.embeddings.position_embeddings.weight"), vec![self.max_position_embeddings, h]));
        shapes.push((format!("{base}.embeddings.token_type_embeddings.weight"), vec![self.type_vocab_size, h]));
        layer_norm(&mut shapes, format!("{base}.embeddings.LayerNorm"));
        for i in 0..self.num_hidden_layers {
            let layer = format!("{base}.encoder.layer.{i}");
            for name in ["query", "key", "value"] {
                linear(&mut shapes, format!("{layer}.attention.self.{name}"), h, h);
            }
            linear(&mut shapes, format!("{layer}.attention.output.dense"), h, h);
            layer_norm(&mut shapes, format!("{layer}.attention.output.LayerNorm"));
            linear(&mut shapes, format!("{layer}.intermediate.dense"), self.intermediate_size, h);
            linear(&mut shapes, format!("{layer}.output.dense"), h, self.intermediate_size);
            layer_norm(&mut shapes, format!("{layer}.output.LayerNorm"));
        }
        if self.with_head {
            if base == "bert" {
                linear(&mut shapes, "bert.pooler.dense".to_string(), h, h);
                linear(&mut shapes, "classifier".to_string(), self.num_labels, h);
            } else {
                linear(&mut shapes, "classifier.dense".to_string(), h, h);
                linear(&mut shapes, "classifier.out_proj".to_string(), self.num_labels, h);
            }
        }
        shapes
    }

    /// Every weight as `(shape, values)`, generated from `seed`.
    pub fn weights(&self) -> BTreeMap<String, (Vec<usize>, Vec<f32>)> {
        let mut rng = Lcg(self.seed);
        self.tensor_shapes().into_iter().map(|(name, shape)| {
            let count: usize = shape.iter().product();
            let is_norm_scale = name.contains("LayerNorm") && name.ends_with(".weight");
            let values: Vec<f32> = (0..count)
                .map(|_| if is_norm_scale { 1.0 + rng.next(0.05) } else { rng.next(0.1) })
                .collect();
            (name, (shape, values))
        }).collect()
    }

    fn tensors(&self) -> Vec<(String, Vec<usize>, Vec<u8>)> {
        let mut weights = self.weights();
        self.tensor_shapes().into_iter().filter_map(|(name, _)| {
            let (shape, values) = weights.remove(&name)?;
            let bytes = values.iter().flat_map(|x| x.to_le_bytes()).collect();
            Some((name, shape, bytes))
        }).collect()
    }

    fn write_safetensors(tensors: &[(String, Vec<usize>, Vec<u8>)], path: &Path) -> anyhow::Result<()> {
        let mut views = vec![];
        for (name, shape, bytes) in tensors {
            views.push((name.as_str(), safetensors::tensor::TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes)?));
        }
        safetensors::serialize_to_file(views, &None, path)?;
        Ok(())
    }

    fn config_json(&self) -> serde_json::Value {
        let architecture = match self.model_type.as_str() {
            "bert" => "BertForSequenceClassification",
            "roberta" => "RobertaForSequenceClassification",
            _ => "XLMRobertaForSequenceClassification",
        };
        let id2label: BTreeMap<String, String> = (0..self.num_labels).map(|i| (i.to_string(), format!("LABEL_{i}"))).collect();
        let label2id: BTreeMap<String, usize> = (0..self.num_labels).map(|i| (format!("LABEL_{i}"), i)).collect();
        json!({
            "architectures": [architecture],
            "model_type": self.model_type,
            "vocab_size": self.vocab_size(),
            "hidden_size": self.hidden_size,
            "num_hidden_layers": self.num_hidden_layers,
            "num_attention_heads": self.num_attention_heads,
            "intermediate_size": self.intermediate_size,
            "hidden_act": self.hidden_act,
            "layer_norm_eps": LAYER_NORM_EPS,
            "pad_token_id": self.pad_token_id,
            "max_position_embeddings": self.max_position_embeddings,
            "type_vocab_size": self.type_vocab_size,
            "position_embedding_type": "absolute",
            "id2label": id2label,
            "label2id": label2id,
        })
    }

    fn unk_token(&self) -> &'static str {
        self.special_tokens.iter().copied().find(|x| x.contains("unk") || x.contains("UNK")).unwrap_or("<unk>")
    }

    /// A word-level tokenizer, split on whitespace, with the special tokens registered.
    pub fn tokenizer_json(&self) -> serde_json::Value {
        let added_tokens: Vec<_> = self.special_tokens.iter().enumerate().map(|(id, content)| json!({
            "id": id,
            "content": content,
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true,
        })).collect();
        let vocab: serde_json::Map<String, serde_json::Value> = self.special_tokens.iter()
            .chain(self.words.iter())
            .enumerate()
            .map(|(id, token)| (token.to_string(), json!(id)))
            .collect();
        json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": added_tokens,
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": vocab,
                "unk_token": self.unk_token(),
            }
        })
    }

    fn special_tokens_map(&self) -> serde_json::Value {
        let [first, second, third] = [self.special_tokens[0], self.special_tokens[1], self.special_tokens[2]];
        if self.model_type == "bert" {
            json!({"pad_token": first, "unk_token": second, "cls_token": third, "sep_token": self.special_tokens[3], "mask_token": self.special_tokens[4]})
        } else {
            json!({"bos_token": first, "pad_token": second, "eos_token": third, "unk_token": self.special_tokens[3], "mask_token": self.special_tokens[4]})
        }
    }

    /// Logits `[batch, num_labels]` computed directly from the weights, without any graph.
    ///
    /// `weight` returns a tensor's values by name, which lets a caller substitute
    /// e.g. dequantized weights for the originals.
    pub fn reference_logits(
        &self,
        weight: &dyn Fn(&str) -> Vec<f32>,
        input_ids: &[i64],
        attention_mask: &[i64],
        token_type_ids: Option<&[i64]>,
        sequence_length: usize,
    ) -> Vec<f32> {
        let h = self.hidden_size;
        let heads = self.num_attention_heads;
        let head_dim = h / heads;
        let batch = input_ids.len() / sequence_length;
        let base = self.base_prefix();
        let pad = self.pad_token_id as i64;
        let dense = |x: &[f32], prefix: &str| linear(x, &weight(&format!("{prefix}.weight")), &weight(&format!("{prefix}.bias")));
        let norm = |x: &[f32], prefix: &str| layer_norm(x, &weight(&format!("{prefix}.weight")), &weight(&format!("{prefix}.bias")));

        let words = weight(&format!("{base}.embeddings.word_embeddings.weight"));
        let positions = weight(&format!("{base}.embeddings.position_embeddings.weight"));
        let token_types = weight(&format!("{base}.embeddings.token_type_embeddings.weight"));
        let mut hidden = Vec::with_capacity(input_ids.len() * h);
        for b in 0..batch {
            let mut seen = 0;
            for s in 0..sequence_length {
                let i = b * sequence_length + s;
                let id = input_ids[i] as usize;
                let position = if base == "bert" {
                    s
                } else if input_ids[i] != pad {
                    seen += 1;
                    (seen + pad) as usize
                } else {
                    pad as usize
                };
                let token_type = token_type_ids.map_or(0, |x| x[i] as usize);
                hidden.extend((0..h).map(|d| words[id * h + d] + positions[position * h + d] + token_types[token_type * h + d]));
            }
        }
        hidden = norm(&hidden, &format!("{base}.embeddings.LayerNorm"));

        for l in 0..self.num_hidden_layers {
            let layer = format!("{base}.encoder.layer.{l}");
            let query = dense(&hidden, &format!("{layer}.attention.self.query"));
            let key = dense(&hidden, &format!("{layer}.attention.self.key"));
            let value = dense(&hidden, &format!("{layer}.attention.self.value"));

            let mut context = vec![0.0f32; hidden.len()];
            for b in 0..batch {
                let offset = |t: usize, head: usize| (b * sequence_length + t) * h + head * head_dim;
                for head in 0..heads {
                    for i in 0..sequence_length {
                        let scores: Vec<f32> = (0..sequence_length).map(|j| {
                            let dot: f32 = (0..head_dim).map(|d| query[offset(i, head) + d] * key[offset(j, head) + d]).sum();
                            let masked = (1.0 - attention_mask[b * sequence_length + j] as f32) * f32::MIN;
                            dot / (head_dim as f32).sqrt() + masked
                        }).collect();
                        let probs = softmax(&scores);
                        for d in 0..head_dim {
                            context[offset(i, head) + d] = (0..sequence_length).map(|j| probs[j] * value[offset(j, head) + d]).sum();
                        }
                    }
                }
            }

            let x = dense(&context, &format!("{layer}.attention.output.dense"));
            let attended = norm(&add(&x, &hidden), &format!("{layer}.attention.output.LayerNorm"));
            let x = dense(&attended, &format!("{layer}.intermediate.dense"));
            let x: Vec<f32> = x.into_iter().map(|x| activate(&self.hidden_act, x)).collect();
            let x = dense(&x, &format!("{layer}.output.dense"));
            hidden = norm(&add(&x, &attended), &format!("{layer}.output.LayerNorm"));
        }

        let first_tokens: Vec<f32> = (0..batch)
            .flat_map(|b| hidden[b * sequence_length * h..][..h].iter().copied())
            .collect();
        let (pooler, classifier) = if base == "bert" {
            ("bert.pooler.dense", "classifier")
        } else {
            ("classifier.dense", "classifier.out_proj")
        };
        let pooled: Vec<f32> = dense(&first_tokens, pooler).into_iter().map(f32::tanh).collect();
        dense(&pooled, classifier)
    }

    pub fn write(&self, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join("config.json"), serde_json::to_vec_pretty(&self.config_json())?)?;

        let tensors = self.tensors();
        if self.sharded {
            let (first, second) = tensors.split_at(tensors.len() / 2);
            let shards = [("model-00001-of-00002.safetensors", first), ("model-00002-of-00002.safetensors", second)];
            let mut weight_map = BTreeMap::new();
            for (file, shard) in shards {
                Self::write_safetensors(shard, &dir.join(file)).with_context(|| format!("writing {file}"))?;
                for (name, _, _) in shard {
                    weight_map.insert(name.clone(), file);
                }
            }
            let index = json!({"metadata": {"total_size": 0}, "weight_map": weight_map});
            fs::write(dir.join("model.safetensors.index.json"), serde_json::to_vec_pretty(&index)?)?;
        } else {
            Self::write_safetensors(&tensors, &dir.join("model.safetensors")).context("writing model.safetensors")?;
        }

        fs::write(dir.join("tokenizer.json"), serde_json::to_vec_pretty(&self.tokenizer_json())?)?;
        if self.with_tokenizer_config {
            let class = if self.model_type == "bert" { "BertTokenizer" } else { "XLMRobertaTokenizer" };
            let mut config = self.special_tokens_map();
            config["model_max_length"] = json!(self.max_position_embeddings);
            config["tokenizer_class"] = json!(class);
            fs::write(dir.join("tokenizer_config.json"), serde_json::to_vec_pretty(&config)?)?;
        }
        if self.with_special_tokens_map {
            fs::write(dir.join("special_tokens_map.json"), serde_json::to_vec_pretty(&self.special_tokens_map())?)?;
        }
        if self.with_sentencepiece {
            fs::write(dir.join("sentencepiece.bpe.model"), b"\x0a\x0dtiny-fixture\x10\x01")?;
        }
        Ok(())
    }
}

/// `x @ weight.T + bias` over rows of `x`, with `weight` as `[out, in]`.
fn linear(x: &[f32], weight: &[f32], bias: &[f32]) -> Vec<f32> {
    let outputs = bias.len();
    let inputs = weight.len() / outputs;
    x.chunks_exact(inputs)
        .flat_map(|row| (0..outputs).map(move |o| {
            bias[o] + row.iter().zip(&weight[o * inputs..][..inputs]).map(|(a, b)| a * b).sum::<f32>()
        }))
        .collect()
}

fn layer_norm(x: &[f32], scale: &[f32], bias: &[f32]) -> Vec<f32> {
    let width = scale.len();
    x.chunks_exact(width)
        .flat_map(|row| {
            let mean = row.iter().sum::<f32>() / width as f32;
            let variance = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / width as f32;
            let inv_std = 1.0 / (variance + LAYER_NORM_EPS).sqrt();
            row.iter().enumerate().map(move |(i, v)| (v - mean) * inv_std * scale[i] + bias[i])
        })
        .collect()
}

fn softmax(x: &[f32]) -> Vec<f32> {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = x.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|v| v / sum).collect()
}

fn add(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.iter().zip(b).map(|(a, b)| a + b).collect()
}

/// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.3275911 * x.abs());
    let poly = ((((1.061405429 * t - 1.453152027) * t + 1.421413741) * t - 0.284496736) * t + 0.254829592) * t;
    (1.0 - poly * (-x * x).exp()).copysign(x)
}

fn activate(name: &str, x: f32) -> f32 {
    match name {
        "relu" => x.max(0.0),
        "gelu_new" | "gelu_pytorch_tanh" => {
            let inner = (2.0f32 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x * x * x);
            0.5 * x * (1.0 + inner.tanh())
        }
        _ => 0.5 * x * (1.0 + erf(x as f64 / std::f64::consts::SQRT_2) as f32),
    }
}
