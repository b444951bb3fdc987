use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use onnx_export::{run, ExportArgs, ExportSettings};

fn main() -> anyhow::Result<()> {
    let args = ExportArgs::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level()));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let settings = ExportSettings::from(args);
    let report = run(&settings).with_context(|| format!("exporting {}", settings.model))?;
    for file in &report.files {
        println!("{}", file.display());
    }
    Ok(())
}
