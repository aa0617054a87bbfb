use clap::Parser;
use graph_convert::{
    ConversionError, ConversionReport, ConvertOptions, Converter, Quantization, DEFAULT_INTERMEDIATE_DIR,
    DEFAULT_SHARD_SIZE_BYTES,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const MODEL_DIR: &str = "asl_model_output";
const MODEL_FILE: &str = "best_model.keras";
const OUTPUT_DIR: &str = "tfjs_graph_model";
const DEPLOY_DIR: &str = "public/models/alphabet_tfjs/";

#[derive(Parser, Debug)]
#[command(
    name = "convert-model-to-graph",
    version,
    about = "Convert a Keras model into a TensorFlow.js graph model"
)]
struct Args {
    /// Directory the default model and output paths are resolved against.
    /// Defaults to the current working directory, not the directory of the
    /// executable; pass the project root when running from elsewhere.
    #[arg(long, default_value = ".")]
    base_dir: PathBuf,

    /// Keras model file [default: <base-dir>/asl_model_output/best_model.keras]
    #[arg(long)]
    model: Option<PathBuf>,

    /// Output directory [default: <base-dir>/asl_model_output/tfjs_graph_model]
    #[arg(long)]
    output: Option<PathBuf>,

    /// Maximum size of one weight shard in bytes
    #[arg(long, default_value_t = DEFAULT_SHARD_SIZE_BYTES)]
    shard_size_bytes: usize,

    /// Store float weights quantized to this type
    #[arg(long, value_enum, default_value_t = Quantization::None)]
    quantize: Quantization,

    /// Leave the intermediate SavedModel directory in place
    #[arg(long)]
    keep_intermediate: bool,

    /// Log filter (RUST_LOG syntax)
    #[arg(long, default_value = "warn")]
    log: String,
}

fn print_next_steps(output: &Path) {
    let rule = "=".repeat(60);
    println!("\n{rule}");
    println!("NEXT STEPS:");
    println!("{rule}");
    println!("1. Copy the converted files to {DEPLOY_DIR}:");
    println!("   cp {}/* {DEPLOY_DIR}", output.display());
    println!("\n2. Update src/components/LiveDemo.tsx to use tf.loadGraphModel()");
    println!("\n3. Test the application in the browser");
    println!("{rule}");
}

fn run(converter: &Converter) -> anyhow::Result<ConversionReport> {
    Ok(converter.run(&mut std::io::stdout())?)
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .with_writer(std::io::stderr)
        .init();

    let model = args
        .model
        .unwrap_or_else(|| args.base_dir.join(MODEL_DIR).join(MODEL_FILE));
    let output = args
        .output
        .unwrap_or_else(|| args.base_dir.join(MODEL_DIR).join(OUTPUT_DIR));
    let options = ConvertOptions {
        shard_size_bytes: args.shard_size_bytes,
        quantization: args.quantize,
        intermediate_name: DEFAULT_INTERMEDIATE_DIR.to_string(),
        keep_intermediate: args.keep_intermediate,
    };
    let converter = Converter::new(&model, &output).with_options(options);

    match run(&converter) {
        Ok(report) => {
            print_next_steps(&report.output_dir);
            ExitCode::SUCCESS
        }
        Err(err) => {
            if let Some(ConversionError::ModelNotFound(path)) = err.downcast_ref::<ConversionError>() {
                eprintln!("❌ Error: Keras model not found at {}", path.display());
            } else {
                eprintln!("\n❌ Conversion failed: {err}");
                eprintln!("\n{err:?}");
            }
            ExitCode::from(1)
        }
    }
}
