use blockzip::{
    ChunkStrategy, CodecId, Completion, CompletionStatus, Compressor, Decompressor, Engine,
    EngineError, EngineOptions,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "blockzip", version, about = "Parallel block compression for large files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress INPUT into a stream of independently decodable members
    Compress {
        input:  PathBuf,
        output: PathBuf,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Restore a file written by `compress`
    Decompress {
        input:  PathBuf,
        output: PathBuf,
        #[command(flatten)]
        tuning: Tuning,
    },
}

#[derive(Args)]
struct Tuning {
    /// Chunk size in KiB (default 10240 = 10 MiB)
    #[arg(long)]
    chunk_size: Option<usize>,
    /// Concurrent transform workers (default: number of CPUs)
    #[arg(short, long)]
    workers: Option<usize>,
    /// Transformed chunks allowed to wait for the writer
    #[arg(long)]
    queue_depth: Option<usize>,
    /// Codec: zstd (default), lz4, brotli, lzma, gzip, none
    #[arg(short, long, value_parser = parse_codec)]
    codec: Option<CodecId>,
    /// Compression level (zstd 1-22; brotli 0-11; gzip 0-9; ignored for lz4/lzma)
    #[arg(short, long)]
    level: Option<i32>,
    /// Decompressed output slice in KiB (default 1024)
    #[arg(long)]
    slice_size: Option<usize>,
    /// JSON options file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
    /// No progress output
    #[arg(short, long)]
    quiet: bool,
}

impl Tuning {
    fn options(&self) -> Result<EngineOptions, EngineError> {
        let mut opts = match &self.config {
            Some(path) => EngineOptions::from_json_file(path)?,
            None       => EngineOptions::default(),
        };
        if let Some(kib) = self.chunk_size  { opts.chunk_size = kib.saturating_mul(1024); }
        if let Some(n)   = self.workers     { opts.workers = n; }
        if let Some(n)   = self.queue_depth { opts.max_queue_depth = n; }
        if let Some(c)   = self.codec       { opts.codec = c; }
        if let Some(l)   = self.level       { opts.level = l; }
        if let Some(kib) = self.slice_size  { opts.output_slice_size = kib.saturating_mul(1024); }
        Ok(opts)
    }
}

fn parse_codec(s: &str) -> Result<CodecId, String> {
    CodecId::from_name(s).ok_or_else(|| {
        let known: Vec<_> = CodecId::ALL.iter().map(|c| c.name()).collect();
        format!("unknown codec '{s}' (expected one of: {})", known.join(", "))
    })
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, EngineError> {
    let completion = match cli.command {

        // ── Compress ─────────────────────────────────────────────────────────
        Commands::Compress { input, output, tuning } => {
            let engine = Compressor::new(tuning.options()?)?;
            drive(engine, &input, &output, tuning.quiet)?
        }

        // ── Decompress ───────────────────────────────────────────────────────
        Commands::Decompress { input, output, tuning } => {
            let engine = Decompressor::new(tuning.options()?)?;
            drive(engine, &input, &output, tuning.quiet)?
        }
    };
    Ok(summarise(&completion))
}

fn drive<S: ChunkStrategy>(
    engine: Engine<S>,
    input:  &Path,
    output: &Path,
    quiet:  bool,
) -> Result<Completion, EngineError> {
    let engine = if quiet {
        engine
    } else {
        engine.on_progress(|e| eprint!("\r  {:5.1}%", e.percentage * 100.0))
    };
    let completion = engine.run(input, output)?;
    if !quiet {
        eprintln!();
    }
    if completion.is_success() {
        println!("{} -> {}", input.display(), output.display());
    }
    Ok(completion)
}

fn summarise(completion: &Completion) -> ExitCode {
    match completion.status {
        CompletionStatus::Succeeded => {
            let ratio = if completion.input_bytes == 0 {
                100.0
            } else {
                completion.output_bytes as f64 / completion.input_bytes as f64 * 100.0
            };
            println!(
                "  {} bytes in, {} bytes out ({:.1}%)",
                completion.input_bytes, completion.output_bytes, ratio
            );
            ExitCode::SUCCESS
        }
        CompletionStatus::Cancelled => {
            eprintln!("cancelled; partial output removed");
            ExitCode::from(130)
        }
        CompletionStatus::Faulted => {
            eprintln!("failed with {} error(s):", completion.errors.len());
            for err in &completion.errors {
                eprintln!("  {err}");
            }
            ExitCode::from(1)
        }
    }
}
