mod config;
mod run_cmd;
mod serve_cmd;
mod service;
#[cfg(test)]
mod test_util;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use sdjobs_core::{ConvertParams, GenerateParams, Job, JobStatus};

use config::{Overrides, SdConfig};
use service::JobService;

#[derive(Parser)]
#[command(name = "sdjobs", about = "Run and stream stable-diffusion jobs")]
struct Cli {
    /// Installation root containing sd-cli (overrides SDJOBS_ROOT)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Model directory (overrides SDJOBS_MODELS_DIR)
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    /// Image output directory (overrides SDJOBS_OUTPUT_DIR)
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default sdjobs config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Start the HTTP job server
    Serve {
        /// Address to bind (overrides SDJOBS_BIND)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides SDJOBS_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Convert a model's weights and follow the job
    Convert {
        /// Source model, relative to the models directory
        model: String,
        /// Output file, relative to the models directory
        #[arg(long, short)]
        output: String,
        /// Target weight type (e.g. q8_0)
        #[arg(long = "type", short = 't')]
        quant_type: String,
    },
    /// Generate an image and follow the job
    Generate(GenerateArgs),
}

#[derive(Args)]
struct GenerateArgs {
    /// Checkpoint, relative to the models directory
    #[arg(long, short)]
    model: String,
    /// Prompt text
    prompt: String,
    /// Negative prompt
    #[arg(long, short)]
    negative_prompt: Option<String>,
    #[arg(long, short = 'W')]
    width: Option<i64>,
    #[arg(long, short = 'H')]
    height: Option<i64>,
    #[arg(long)]
    steps: Option<i64>,
    #[arg(long)]
    cfg_scale: Option<f64>,
    /// RNG seed (-1 for random)
    #[arg(long, short, allow_negative_numbers = true)]
    seed: Option<i64>,
    #[arg(long)]
    sampling_method: Option<String>,
    /// Number of images to generate
    #[arg(long, short)]
    batch_count: Option<i64>,
    /// Pass --verbose to sd-cli
    #[arg(long, short)]
    verbose: bool,
}

impl From<GenerateArgs> for GenerateParams {
    fn from(args: GenerateArgs) -> Self {
        Self {
            model: args.model,
            prompt: args.prompt,
            negative_prompt: args.negative_prompt,
            width: args.width,
            height: args.height,
            steps: args.steps,
            cfg_scale: args.cfg_scale,
            seed: args.seed,
            sampling_method: args.sampling_method,
            batch_count: args.batch_count,
            verbose: args.verbose,
        }
    }
}

/// Execute the `sdjobs init` command: write config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let mut cfg = config::ConfigFile::default();
    cfg.paths.root = Some(std::env::current_dir()?);
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    if let Some(root) = &cfg.paths.root {
        println!("  paths.root = {}", root.display());
    }
    println!("  server = {}:{}", cfg.server.bind, cfg.server.port);
    println!();
    println!("Next: run `sdjobs serve` to start the job server.");

    Ok(())
}

/// Run one job locally and exit non-zero unless it completed.
async fn cmd_run<F>(config: &SdConfig, submit: F) -> anyhow::Result<()>
where
    F: FnOnce(&JobService) -> anyhow::Result<Job>,
{
    let service = JobService::new(config)?;
    let job = submit(&service)?;
    let status = run_cmd::tail_job(&service, &job).await?;
    if status != JobStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut overrides = Overrides {
        root: cli.root,
        models_dir: cli.models_dir,
        output_dir: cli.output_dir,
        ..Overrides::default()
    };

    match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
        }
        Commands::Serve { bind, port } => {
            overrides.bind = bind;
            overrides.port = port;
            let config = SdConfig::resolve(&overrides)?;
            serve_cmd::run_serve(&config).await?;
        }
        Commands::Convert {
            model,
            output,
            quant_type,
        } => {
            let config = SdConfig::resolve(&overrides)?;
            let params = ConvertParams {
                model,
                output,
                quant_type,
            };
            cmd_run(&config, |service| Ok(service.submit_convert(&params)?)).await?;
        }
        Commands::Generate(args) => {
            let config = SdConfig::resolve(&overrides)?;
            let params = GenerateParams::from(args);
            cmd_run(&config, |service| Ok(service.submit_generate(&params)?)).await?;
        }
    }

    Ok(())
}
