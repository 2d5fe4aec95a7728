use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lm_session::core::snapshot::{ImageHeader, HEADER_LEN};
use lm_session::{Result, SessionImage, SessionParams};

#[derive(Parser, Debug)]
#[command(name = "lm-session")]
#[command(about = "Inspect lm-session files and parameters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the header of a serialized session
    Inspect {
        /// Serialized session file
        file: PathBuf,

        /// Check the file against this context size
        #[arg(long)]
        ctx: Option<usize>,
    },
    /// Print the effective session parameters as JSON
    Params {
        /// JSON parameter file (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Inspect { file, ctx } => inspect(&file, ctx),
        Commands::Params { config } => params(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn inspect(path: &Path, ctx: Option<usize>) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = ImageHeader::read_from(&mut reader)?;

    println!("file:             {}", path.display());
    println!("context capacity: {}", header.context_capacity);
    println!("tokens:           {}", header.token_count);
    println!("prompt bytes:     {}", header.prompt_len);
    println!("state bytes:      {}", header.state_size);
    println!(
        "expected size:    {} bytes",
        HEADER_LEN as u64 + header.payload_len()
    );

    if let Some(ctx) = ctx {
        let mut reader = BufReader::new(File::open(path)?);
        match SessionImage::read_from(&mut reader, ctx) {
            Ok(image) => println!(
                "restorable into a {ctx}-token context ({} tokens, {} prompt bytes)",
                image.tokens.len(),
                image.prompt.len()
            ),
            Err(e) => println!("not restorable into a {ctx}-token context: {e}"),
        }
    }
    Ok(())
}

fn params(config: Option<PathBuf>) -> Result<()> {
    let params = match config {
        Some(path) => SessionParams::from_json_file(path)?,
        None => SessionParams::default(),
    };
    let params = params.resolved();
    params.validate()?;

    println!("{}", serde_json::to_string_pretty(&params)?);
    Ok(())
}
