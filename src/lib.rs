pub mod settings;

use std::fs;
use std::path::PathBuf;
use log::info;
use onnx_graph::ModelMetadata;
use onnx_import::{build_classifier_graph, load_pretrained, ConversionError, RetrievalError, WriteError};

pub use settings::{default_output_dir, ExportArgs, ExportSettings, DEFAULT_MODEL};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to load model: {0}")]
    Retrieval(#[from] RetrievalError),
    #[error("Failed to convert model: {0}")]
    Conversion(#[from] ConversionError),
    #[error("Cannot create output directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write artifacts: {0}")]
    Write(#[from] WriteError),
}

/// What a successful export produced.
#[derive(Debug, Clone)]
pub struct ExportReport {
    /// The identifier both the model and the tokenizer were loaded from.
    pub identifier: String,
    pub output_dir: PathBuf,
    pub files: Vec<PathBuf>,
    pub metadata: ModelMetadata,
}

/// Loads, converts and writes one model.
///
/// Loading and graph construction both finish before the output directory is touched.
pub fn run(settings: &ExportSettings) -> Result<ExportReport, PipelineError> {
    let model = load_pretrained(&settings.model, &settings.retrieval)?;
    let graph = build_classifier_graph(&model, &settings.graph)?;

    fs::create_dir_all(&settings.output_dir).map_err(|source| PipelineError::Io {
        path: settings.output_dir.clone(),
        source,
    })?;
    let mut files = graph.export(&settings.output_dir, settings.weight_storage)?;
    files.push(model.save_config(&settings.output_dir)?);
    files.extend(model.tokenizer.save_pretrained(&settings.output_dir)?);
    info!("Exported {} to {} ({} files)", model.identifier, settings.output_dir.display(), files.len());

    Ok(ExportReport {
        identifier: model.identifier.clone(),
        output_dir: settings.output_dir.clone(),
        files,
        metadata: graph.metadata().clone(),
    })
}
