//! Visual AI command-line entry point.

use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde::Serialize;

use visual_ai::{ModelRouter, ProviderId, RouteRequest, TaskType};
use visual_ai_cli::config::{ServiceConfig, SettingsArgs};
use visual_ai_cli::server::{dispatch, serve, ErrorBody, PairEntry, Request};
use visual_ai_cli::{CliError, CliResult, ValidationService};

#[derive(Parser)]
#[command(
    name = "visual-ai",
    about = "Routed visual comparison, stability detection, and self-healing validation",
    version
)]
struct Cli {
    /// Comma-separated providers to load (dinov2, vjepa2, siglip).
    /// Also reads VISUAL_AI_MODELS.
    #[arg(long, global = true)]
    models: Option<String>,

    /// Directory holding <provider>.onnx model files.
    /// Also reads VISUAL_AI_MODEL_DIR.
    #[arg(long, global = true)]
    model_dir: Option<String>,

    /// Maximum concurrent encoder jobs. Also reads VISUAL_AI_WORKERS.
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare two frames.
    Compare {
        /// Baseline image (path or data URI).
        baseline: String,
        /// Actual image (path or data URI).
        actual: String,
        /// Force a provider.
        #[arg(long)]
        model: Option<ProviderId>,
        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Compare two frame sequences as wholes.
    CompareSequences {
        /// Frames of the first sequence, in order.
        #[arg(long, num_args = 1.., required = true)]
        first: Vec<String>,
        /// Frames of the second sequence, in order.
        #[arg(long, num_args = 1.., required = true)]
        second: Vec<String>,
        #[arg(long)]
        model: Option<ProviderId>,
        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Detect whether a frame sequence has settled.
    Stability {
        /// Frames in capture order.
        #[arg(required = true)]
        frames: Vec<String>,
        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Validate a self-healing fix from a recorded frame sequence.
    Heal {
        /// Frames in capture order; split at the midpoint into before/after.
        #[arg(required = true)]
        frames: Vec<String>,
        /// Expected final state (defaults to the after half).
        #[arg(long)]
        expected: Option<String>,
        /// Prefer the sequence model even when it is slower.
        #[arg(long)]
        high_accuracy: bool,
        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Find screen regions matching a text description.
    Find {
        image: String,
        description: String,
        #[arg(long)]
        model: Option<ProviderId>,
        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Check how well an image matches a text description.
    Describe {
        image: String,
        description: String,
        #[arg(long)]
        model: Option<ProviderId>,
    },

    /// Print the embedding of an image.
    Embed {
        image: String,
        #[arg(long)]
        model: Option<ProviderId>,
    },

    /// Compare the pairs listed in a JSON file.
    ///
    /// The file holds `[{"pair_id": "...", "baseline": "...", "actual": "..."}]`;
    /// `pair_id` is optional.
    Batch {
        pairs: PathBuf,
        #[arg(long)]
        model: Option<ProviderId>,
        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Describe the change between two frames.
    Change {
        before: String,
        after: String,
        /// The action performed between the frames (e.g. "click submit").
        #[arg(long)]
        action: Option<String>,
        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Report loaded providers and their recent latency.
    Health,

    /// Explain which provider a task would be routed to.
    Route {
        task: TaskType,
        #[arg(long)]
        model: Option<ProviderId>,
        #[arg(long, default_value_t = 1)]
        frames: usize,
        #[arg(long)]
        high_accuracy: bool,
    },

    /// Answer JSON requests, one per line, on stdin until EOF.
    ///
    /// Each line is an object tagged by `op` (e.g. `{"id": 1, "op": "compare",
    /// "baseline": "a.png", "actual": "b.png"}`); each answer is one line of
    /// `{"id", "ok", "result"}` or `{"id", "ok", "error", "message"}` on stdout.
    /// Models load once and the latency window spans the whole session.
    Serve,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   visual-ai completions bash > ~/.local/share/bash-completion/completions/visual-ai
    ///   visual-ai completions zsh > ~/.zfunc/_visual-ai
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_pairs(path: &Path) -> CliResult<Vec<PairEntry>> {
    Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
}

fn into_request(command: Commands) -> CliResult<Request> {
    let request = match command {
        Commands::Compare {
            baseline,
            actual,
            model,
            settings,
        } => Request::Compare {
            baseline,
            actual,
            model,
            settings: settings.apply(),
        },
        Commands::CompareSequences {
            first,
            second,
            model,
            settings,
        } => Request::CompareSequences {
            first,
            second,
            model,
            settings: settings.apply(),
        },
        Commands::Stability { frames, settings } => Request::Stability {
            frames,
            settings: settings.apply(),
        },
        Commands::Heal {
            frames,
            expected,
            high_accuracy,
            settings,
        } => Request::Heal {
            frames,
            expected,
            high_accuracy,
            settings: settings.apply(),
        },
        Commands::Find {
            image,
            description,
            model,
            settings,
        } => Request::Find {
            image,
            description,
            model,
            settings: settings.apply(),
        },
        Commands::Describe {
            image,
            description,
            model,
        } => Request::Describe {
            image,
            description,
            model,
        },
        Commands::Embed { image, model } => Request::Embed { image, model },
        Commands::Batch {
            pairs,
            model,
            settings,
        } => Request::Batch {
            pairs: read_pairs(&pairs)?,
            model,
            settings: settings.apply(),
        },
        Commands::Change {
            before,
            after,
            action,
            settings,
        } => Request::Change {
            before,
            after,
            action,
            settings: settings.apply(),
        },
        Commands::Health => Request::Health,
        Commands::Route {
            task,
            model,
            frames,
            high_accuracy,
        } => Request::Route {
            task,
            model,
            frames,
            high_accuracy,
        },
        Commands::Serve | Commands::Completions { .. } => {
            return Err(CliError::Config("not a one-shot request".into()))
        }
    };
    Ok(request)
}

async fn execute(command: Commands, config: ServiceConfig) -> CliResult<()> {
    // Routing needs only the installed model list, not loaded sessions.
    if let Commands::Route {
        task,
        model,
        frames,
        high_accuracy,
    } = command
    {
        let router = ModelRouter::new(config.installed_models());
        let req = RouteRequest::new(task)
            .with_override(model)
            .with_frames(frames)
            .high_accuracy(high_accuracy);
        let decision = router.route(&req)?;
        return print_json(&serde_json::json!({
            "decision": decision,
            "explanation": router.explain(task),
        }));
    }

    let service = ValidationService::from_config(&config)?;

    if let Commands::Serve = command {
        let reader = tokio::io::BufReader::new(tokio::io::stdin());
        serve(&service, reader, tokio::io::stdout()).await?;
        return Ok(());
    }

    let result = dispatch(&service, into_request(command)?).await?;
    print_json(&result)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "visual-ai", &mut std::io::stdout());
        return Ok(());
    }

    let config = ServiceConfig::resolve(
        cli.models.as_deref(),
        cli.model_dir.as_deref(),
        cli.workers,
    )?;

    if let Err(e) = execute(cli.command, config).await {
        print_json(&ErrorBody::from(&e))?;
        std::process::exit(1);
    }

    Ok(())
}
