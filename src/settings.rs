use std::path::{Path, PathBuf};
use clap::Parser;
use onnx_import::encoder::DEFAULT_QUANTIZE_MIN_ELEMENTS;
use onnx_import::{GraphOptions, RetrievalSettings, WeightStorage};

/// The model exported when none is named on the command line.
pub const DEFAULT_MODEL: &str = "BAAI/bge-reranker-v2-m3";

/// Export a sequence-classification model and its tokenizer to ONNX.
#[derive(Parser, Debug, Clone)]
#[command(name = "onnx-export", author, version, about)]
pub struct ExportArgs {
    /// Local model directory or registry repo id
    #[arg(default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Output directory [default: MODEL when it is a directory, otherwise models/<name>]
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Store large linear weights as per-row int8
    #[arg(short, long)]
    pub quantize: bool,

    /// Registry branch, tag or commit
    #[arg(long)]
    pub revision: Option<String>,

    /// Registry cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Registry access token
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Only use files already in the registry cache
    #[arg(long)]
    pub offline: bool,

    /// Inline weights into model.onnx instead of model.onnx_data
    #[arg(long)]
    pub embed_weights: bool,

    /// Smallest linear weight, in elements, that gets quantized
    #[arg(long, default_value_t = DEFAULT_QUANTIZE_MIN_ELEMENTS)]
    pub quantize_min_elements: usize,

    /// More logging; repeat for trace output. RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl ExportArgs {
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// A resolved export job.
#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub model: String,
    pub output_dir: PathBuf,
    pub retrieval: RetrievalSettings,
    pub graph: GraphOptions,
    pub weight_storage: WeightStorage,
}

impl ExportSettings {
    /// Settings for exporting `model` into `output_dir` with every option at its default.
    pub fn new(model: &str, output_dir: &Path) -> Self {
        Self {
            model: model.to_string(),
            output_dir: output_dir.to_path_buf(),
            retrieval: RetrievalSettings::default(),
            graph: GraphOptions::default(),
            weight_storage: WeightStorage::default(),
        }
    }
}

impl From<ExportArgs> for ExportSettings {
    fn from(args: ExportArgs) -> Self {
        let output_dir = args.output.unwrap_or_else(|| default_output_dir(&args.model));
        Self {
            output_dir,
            retrieval: RetrievalSettings {
                revision: args.revision,
                cache_dir: args.cache_dir,
                token: args.token,
                offline: args.offline,
            },
            graph: GraphOptions {
                quantize: args.quantize,
                quantize_min_elements: args.quantize_min_elements,
            },
            weight_storage: if args.embed_weights { WeightStorage::Embedded } else { WeightStorage::External },
            model: args.model,
        }
    }
}

/// A local model is exported in place, a registry model into `models/<name>`.
pub fn default_output_dir(model: &str) -> PathBuf {
    let path = Path::new(model);
    if path.is_dir() {
        return path.to_path_buf();
    }
    let trimmed = model.trim_end_matches('/');
    let name = trimmed.rsplit('/').next().filter(|x| !x.is_empty()).unwrap_or("model");
    Path::new("models").join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ExportArgs {
        ExportArgs::try_parse_from(std::iter::once("onnx-export").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_to_the_reranker() {
        let settings = ExportSettings::from(parse(&[]));
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert_eq!(settings.output_dir, PathBuf::from("models/bge-reranker-v2-m3"));
        assert!(!settings.graph.quantize);
        assert_eq!(settings.weight_storage, WeightStorage::External);
        assert_eq!(settings.retrieval.revision(), "main");
    }

    #[test]
    fn flags_reach_the_settings() {
        let settings = ExportSettings::from(parse(&[
            "org/model", "-q", "-o", "out", "--revision", "v2", "--offline",
            "--embed-weights", "--quantize-min-elements", "16", "--token", "secret",
        ]));
        assert_eq!(settings.model, "org/model");
        assert_eq!(settings.output_dir, PathBuf::from("out"));
        assert!(settings.graph.quantize);
        assert_eq!(settings.graph.quantize_min_elements, 16);
        assert_eq!(settings.weight_storage, WeightStorage::Embedded);
        assert_eq!(settings.retrieval.revision(), "v2");
        assert!(settings.retrieval.offline);
        assert_eq!(settings.retrieval.token.as_deref(), Some("secret"));
    }

    #[test]
    fn local_directories_export_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().to_str().unwrap();
        assert_eq!(default_output_dir(model), dir.path());
        assert_eq!(default_output_dir("org/name/"), PathBuf::from("models/name"));
    }

    #[test]
    fn verbosity_counts() {
        assert_eq!(parse(&[]).log_level(), "info");
        assert_eq!(parse(&["-v"]).log_level(), "debug");
        assert_eq!(parse(&["-vvv"]).log_level(), "trace");
    }
}
