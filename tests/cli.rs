use std::collections::HashSet;
use std::fs;
use std::process::Command;
use prost::Message;
use onnx_graph::onnx;
use onnx_import::testing::TinyCheckpoint;

fn onnx_export() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_onnx-export"));
    command.env_remove("HF_TOKEN").env("RUST_LOG", "warn");
    command
}

fn op_types(path: &std::path::Path) -> HashSet<String> {
    let proto = onnx::ModelProto::decode(fs::read(path).unwrap().as_slice()).unwrap();
    proto.graph.unwrap().node.into_iter().map(|x| x.op_type).collect()
}

#[test]
fn local_model_exports_in_place() {
    let work = tempfile::tempdir().unwrap();
    TinyCheckpoint::xlm_roberta().write(&work.path().join("local-model")).unwrap();

    let status = onnx_export()
        .current_dir(work.path())
        .arg("./local-model")
        .status()
        .unwrap();
    assert!(status.success());
    assert!(work.path().join("local-model/model.onnx").is_file());
    assert!(work.path().join("local-model/tokenizer.json").is_file());
}

#[test]
fn missing_model_fails() {
    let work = tempfile::tempdir().unwrap();
    let cache = work.path().join("cache");
    fs::create_dir_all(&cache).unwrap();
    let out = work.path().join("out");

    let output = onnx_export()
        .arg("does-not-exist/model")
        .arg("--offline")
        .arg("--cache-dir").arg(&cache)
        .arg("-o").arg(&out)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(!out.join("model.onnx").exists());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does-not-exist/model"), "{stderr}");
}

#[test]
fn quantize_flag_changes_the_graph() {
    let work = tempfile::tempdir().unwrap();
    let src = work.path().join("src");
    TinyCheckpoint::bert().write(&src).unwrap();

    let float_out = work.path().join("float");
    let quant_out = work.path().join("quant");
    assert!(onnx_export().arg(&src).arg("-o").arg(&float_out).status().unwrap().success());
    assert!(onnx_export().arg(&src).arg("-o").arg(&quant_out).arg("--quantize").status().unwrap().success());

    assert!(!op_types(&float_out.join("model.onnx")).contains("DequantizeLinear"));
    assert!(op_types(&quant_out.join("model.onnx")).contains("DequantizeLinear"));
}

#[test]
fn embedded_weights_skip_the_data_file() {
    let work = tempfile::tempdir().unwrap();
    let src = work.path().join("src");
    TinyCheckpoint::xlm_roberta().write(&src).unwrap();
    let out = work.path().join("out");

    let output = onnx_export().arg(&src).arg("-o").arg(&out).arg("--embed-weights").output().unwrap();
    assert!(output.status.success());
    assert!(out.join("model.onnx").is_file());
    assert!(!out.join("model.onnx_data").exists());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.lines().any(|line| line.ends_with("model.onnx")), "{stdout}");
}
