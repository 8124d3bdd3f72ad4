//! Command-line entry point: parse arguments, set up logging, run the
//! batch, and print the summary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use epub2mp3::convert::{Config, Converter};
use epub2mp3::tts::EdgeTtsBackend;

#[derive(Parser, Debug)]
#[command(
    name = "epub2mp3",
    version,
    about = "Convert an EPUB ebook into MP3 audio files, one per chapter"
)]
struct Args {
    /// Path to the EPUB file to convert
    epub_path: PathBuf,

    /// Edge TTS voice used for synthesis (see `edge-tts --list-voices`)
    #[arg(short, long, default_value = "zh-CN-YunxiaNeural")]
    voice: String,

    /// Directory the generated MP3 files are written to
    #[arg(short, long, default_value = "output_audio")]
    output_dir: PathBuf,

    /// Maximum number of simultaneous synthesis calls
    #[arg(short = 'c', long = "concurrent", default_value_t = 3)]
    concurrent: usize,

    /// Maximum attempts per chapter before it is reported as failed
    #[arg(short = 'r', long = "retries", default_value_t = 3)]
    retries: u32,

    /// Directory of .mp3 files to mix in as background music
    #[arg(short = 'b', long = "bg-dir")]
    bg_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\n❌ Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(EdgeTtsBackend::detect()?);
    let config = Config {
        voice: args.voice,
        output_dir: args.output_dir.clone(),
        max_concurrent: args.concurrent,
        max_retries: args.retries,
        bgm_dir: args.bg_dir,
    };

    println!("🔄 Converting {} ...", args.epub_path.display());
    let converter = Converter::new(config, backend)?;
    let report = converter.run(&args.epub_path).await?;

    let failed = report.failed_indices();
    if !failed.is_empty() {
        println!("\nThe following chapters failed to convert:");
        for index in &failed {
            println!("- Chapter {index}");
        }
    }

    println!(
        "\n✅ Conversion complete! {} converted, {} skipped, {} failed",
        report.completed(),
        report.skipped(),
        failed.len()
    );
    println!(
        "📁 All audio files saved to: {}",
        std::fs::canonicalize(&args.output_dir)?.display()
    );
    Ok(())
}
