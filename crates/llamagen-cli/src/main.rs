use std::path::PathBuf;

use clap::Parser;
use llamagen_cli::{generate, init_tracing, stop_tokens, GenerateArgs};

/// llamagen: autoregressive text generation over the reference backend
#[derive(Parser)]
#[command(name = "llamagen", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Generate text from a prompt.
    Generate {
        /// Input prompt text.
        #[arg(short, long)]
        prompt: String,

        /// Reference model file (JSON vocabulary). Uses the demo vocabulary if omitted.
        #[arg(long)]
        model: Option<PathBuf>,

        /// Maximum number of tokens to generate.
        #[arg(short, long, default_value_t = 64)]
        max_tokens: usize,

        /// Backend thread hint; 0 picks the hardware concurrency.
        #[arg(short, long, default_value_t = 0)]
        threads: i32,

        /// Generation config file (JSON).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Random seed for reproducible sampling.
        #[arg(short, long)]
        seed: Option<u64>,

        /// Pick the most likely token instead of sampling.
        #[arg(long)]
        greedy: bool,

        /// Print raw fragments as they are produced.
        #[arg(long)]
        stream: bool,
    },
    /// List the terminal tokens resolved for a model.
    StopTokens {
        /// Reference model file (JSON vocabulary). Uses the demo vocabulary if omitted.
        #[arg(long)]
        model: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Generate {
            prompt,
            model,
            max_tokens,
            threads,
            config,
            seed,
            greedy,
            stream,
        } => {
            let args = GenerateArgs {
                prompt,
                model,
                max_tokens,
                threads,
                config,
                seed,
                greedy,
                stream,
            };
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            generate(&args, &mut out).map(|report| {
                if let Some(finish) = report.finish {
                    tracing::info!(%finish, "stream finished");
                }
            })
        }
        Command::StopTokens { model } => stop_tokens(model.as_deref()).map(|tokens| {
            for (id, text) in tokens {
                println!("{id}\t{text}");
            }
        }),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
