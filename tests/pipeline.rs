use std::fs;
use std::path::Path;
use onnx_export::{run, ExportSettings, PipelineError};
use onnx_import::testing::TinyCheckpoint;
use onnx_import::{ConversionError, RetrievalError, RetrievalSettings};

const ARTIFACTS: [&str; 7] = [
    "model.onnx",
    "model.onnx_data",
    "config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "sentencepiece.bpe.model",
];

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn checkpoint_dir(checkpoint: &TinyCheckpoint) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    checkpoint.write(dir.path()).unwrap();
    dir
}

fn identifier(dir: &Path) -> &str {
    dir.to_str().unwrap()
}

#[test]
fn exports_every_artifact_into_a_new_directory() {
    init();
    let src = checkpoint_dir(&TinyCheckpoint::xlm_roberta());
    let out = tempfile::tempdir().unwrap();
    let output_dir = out.path().join("nested").join("bge");
    assert!(!output_dir.exists());

    let report = run(&ExportSettings::new(identifier(src.path()), &output_dir)).unwrap();
    for file in ARTIFACTS {
        assert!(output_dir.join(file).is_file(), "{file} missing");
    }
    assert_eq!(report.files.len(), ARTIFACTS.len());
    assert_eq!(report.identifier, identifier(src.path()));
    assert_eq!(report.metadata.source, identifier(src.path()));
    assert_eq!(
        fs::read(output_dir.join("sentencepiece.bpe.model")).unwrap(),
        fs::read(src.path().join("sentencepiece.bpe.model")).unwrap()
    );
}

#[test]
fn repeated_exports_are_byte_identical() {
    init();
    let src = checkpoint_dir(&TinyCheckpoint::xlm_roberta());
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    run(&ExportSettings::new(identifier(src.path()), a.path())).unwrap();
    run(&ExportSettings::new(identifier(src.path()), b.path())).unwrap();
    for file in ARTIFACTS {
        assert_eq!(fs::read(a.path().join(file)).unwrap(), fs::read(b.path().join(file)).unwrap(), "{file} differs");
    }
}

#[test]
fn quantized_export_is_smaller() {
    init();
    let src = checkpoint_dir(&TinyCheckpoint::bert());
    let float_out = tempfile::tempdir().unwrap();
    let quant_out = tempfile::tempdir().unwrap();

    run(&ExportSettings::new(identifier(src.path()), float_out.path())).unwrap();
    let mut settings = ExportSettings::new(identifier(src.path()), quant_out.path());
    settings.graph.quantize = true;
    let report = run(&settings).unwrap();

    assert!(report.metadata.quantization.is_some());
    let float_len = fs::metadata(float_out.path().join("model.onnx_data")).unwrap().len();
    let quant_len = fs::metadata(quant_out.path().join("model.onnx_data")).unwrap().len();
    assert!(quant_len < float_len);
}

#[test]
fn exporting_in_place_keeps_the_config() {
    init();
    let src = checkpoint_dir(&TinyCheckpoint::xlm_roberta());
    let config = fs::read(src.path().join("config.json")).unwrap();
    run(&ExportSettings::new(identifier(src.path()), src.path())).unwrap();
    assert_eq!(fs::read(src.path().join("config.json")).unwrap(), config);
    assert!(src.path().join("model.onnx").is_file());
}

#[test]
fn unknown_model_writes_nothing() {
    init();
    let cache = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let output_dir = out.path().join("model");
    let mut settings = ExportSettings::new("does-not-exist/model", &output_dir);
    settings.retrieval = RetrievalSettings {
        cache_dir: Some(cache.path().to_path_buf()),
        offline: true,
        ..Default::default()
    };

    let result = run(&settings);
    assert!(matches!(result, Err(PipelineError::Retrieval(RetrievalError::NotCached { .. }))));
    assert!(!output_dir.exists());
}

#[test]
fn unsupported_architecture_writes_nothing() {
    init();
    let src = checkpoint_dir(&TinyCheckpoint::xlm_roberta().with_model_type("t5"));
    let out = tempfile::tempdir().unwrap();
    let output_dir = out.path().join("model");

    let result = run(&ExportSettings::new(identifier(src.path()), &output_dir));
    assert!(matches!(result, Err(PipelineError::Conversion(ConversionError::UnsupportedModelType(_)))));
    assert!(!output_dir.exists());
}

#[test]
fn invalid_identifier_is_rejected() {
    init();
    let out = tempfile::tempdir().unwrap();
    let result = run(&ExportSettings::new("not a/valid id", out.path()));
    assert!(matches!(result, Err(PipelineError::Retrieval(RetrievalError::InvalidIdentifier(_)))));
    assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
}
