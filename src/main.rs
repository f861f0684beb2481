//! Shoal: GRPO fine-tuning for language policies
//!
//! Subcommands:
//!
//! - `train`    -- Run the GRPO training loop
//! - `config`   -- Print the effective (validated) configuration
//! - `inspect`  -- List saved checkpoints

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use shoal::config::TrainerConfig;
use shoal::data::{ConversationDataset, InMemorySource, PromptSource};
use shoal::model::{PolicyModel, Prompt, RemotePolicy, TabularPolicy};
use shoal::reward::{AnyReward, RemoteReward, RewardModel, RuleReward, WeightedRule, WeightedSum};
use shoal::training::{
    Checkpoint, JsonCheckpointSink, JsonlObserver, TracingObserver, UpdateController,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Shoal: group-relative policy optimization for language policies
#[derive(Parser)]
#[command(name = "shoal", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the GRPO training loop.
    Train(TrainArgs),

    /// Print the effective configuration as JSON.
    Config,

    /// List checkpoints in a directory.
    Inspect {
        /// Checkpoint directory (defaults to `schedule.checkpoint_dir`).
        dir: Option<PathBuf>,
    },
}

#[derive(Args)]
struct TrainArgs {
    /// Conversation dataset (JSON array or JSONL).
    #[arg(long)]
    data: Option<PathBuf>,

    /// Train the in-process tabular policy against a keyword reward instead
    /// of connecting to a policy server.
    #[arg(long)]
    mock: bool,

    /// Resume from the latest checkpoint in the checkpoint directory.
    #[arg(long)]
    resume: bool,

    /// Append step records as JSON lines to this file.
    #[arg(long)]
    metrics: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TrainerConfig::from_file(path)?,
        None => TrainerConfig::default(),
    };

    // Fill in API keys from environment variables when not set in the config file.
    if config.model.policy_api_key.is_empty() {
        if let Ok(key) = std::env::var("POLICY_API_KEY") {
            config.model.policy_api_key = key;
        }
    }
    if config.reward.api_key.is_empty() {
        if let Ok(key) = std::env::var("REWARD_API_KEY") {
            config.reward.api_key = key;
        }
    }

    match cli.command {
        Commands::Train(args) => cmd_train(config, &args).await,
        Commands::Config => cmd_config(&config),
        Commands::Inspect { dir } => {
            let dir = dir.unwrap_or_else(|| config.schedule.checkpoint_dir.clone());
            cmd_inspect(&dir)
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_train(config: TrainerConfig, args: &TrainArgs) -> Result<()> {
    if args.mock {
        tracing::info!("Using in-process tabular policy with keyword reward");
        let policy = TabularPolicy::new(
            MOCK_VOCAB.iter().map(|t| t.to_string()).collect(),
            config.rl.learning_rate,
            config.model.seed,
        )?;
        let reward = WeightedSum::new(vec![WeightedRule {
            weight: 1.0,
            rule: RuleReward::contains(MOCK_KEYWORD),
        }]);

        return match &args.data {
            Some(path) => {
                let mut data = load_dataset(path, config.model.seed)?;
                train(config, policy, reward, &mut data, args).await
            }
            None => {
                let mut data = InMemorySource::new(demo_prompts()).shuffled(config.model.seed);
                train(config, policy, reward, &mut data, args).await
            }
        };
    }

    let Some(path) = &args.data else {
        bail!("--data is required unless --mock is set");
    };
    let mut data = load_dataset(path, config.model.seed)?;

    tracing::info!(
        api_base = %config.model.policy_api_base,
        model = %config.model.policy_model_id,
        "Using remote policy server"
    );
    let policy = RemotePolicy::new(&config.model, config.rl.learning_rate)?;
    let reward = if config.reward.api_base.is_empty() {
        tracing::info!(rules = config.reward.rules.len(), "Using rule-based reward");
        AnyReward::Rules(WeightedSum::new(config.reward.rules.clone()))
    } else {
        tracing::info!(api_base = %config.reward.api_base, "Using remote reward model");
        AnyReward::Remote(RemoteReward::new(&config.reward)?)
    };

    train(config, policy, reward, &mut data, args).await
}

async fn train<P, R, D>(
    config: TrainerConfig,
    mut policy: P,
    reward: R,
    data: &mut D,
    args: &TrainArgs,
) -> Result<()>
where
    P: PolicyModel,
    P::Snapshot: Serialize + DeserializeOwned,
    R: RewardModel,
    D: PromptSource,
{
    let sink = JsonCheckpointSink::new(&config.schedule.checkpoint_dir)
        .keep_last(config.schedule.keep_last_checkpoints);

    let mut start_step = 0;
    if args.resume {
        match sink.latest::<P::Snapshot>()? {
            Some(checkpoint) => {
                tracing::info!(
                    step = checkpoint.step,
                    saved_at = %checkpoint.saved_at,
                    "Resuming from checkpoint"
                );
                start_step = checkpoint.step;
                policy.restore(checkpoint.snapshot).await?;
            }
            None => tracing::info!(
                dir = %sink.dir().display(),
                "No checkpoint found, starting from step 0"
            ),
        }
    }

    let metrics = args.metrics.as_deref().map(JsonlObserver::create).transpose()?;
    let observer = (TracingObserver, metrics);

    let mut controller = UpdateController::new(config, policy, reward, sink, observer)
        .await?
        .with_start_step(start_step);

    let stop = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current step");
            stop.request_stop();
        }
    });

    let summary = controller.run(data).await?;
    tracing::info!(
        final_step = summary.final_step,
        steps_run = summary.steps_run,
        skipped = summary.skipped_steps,
        last_loss = ?summary.last_loss,
        stopped = summary.stopped,
        "Training finished"
    );
    Ok(())
}

fn cmd_config(config: &TrainerConfig) -> Result<()> {
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn cmd_inspect(dir: &Path) -> Result<()> {
    let sink = JsonCheckpointSink::new(dir);
    let checkpoints = sink.list()?;

    println!("Checkpoints: {}", dir.display());
    println!("  Total: {}", checkpoints.len());
    if checkpoints.is_empty() {
        return Ok(());
    }
    println!();

    for (step, path) in &checkpoints {
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        match JsonCheckpointSink::load::<serde_json::Value>(path) {
            Ok(Checkpoint { saved_at, .. }) => println!(
                "  step {step:>8}  {}  {size:>10} bytes  {}",
                saved_at.format("%Y-%m-%d %H:%M:%S UTC"),
                path.display()
            ),
            Err(e) => println!("  step {step:>8}  unreadable ({e:#})  {}", path.display()),
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

const MOCK_KEYWORD: &str = "yes";
const MOCK_VOCAB: &[&str] = &["yes", "no", "maybe", "sure", "never"];

fn load_dataset(path: &Path, seed: u64) -> Result<ConversationDataset> {
    let dataset = ConversationDataset::load_from_file(path)?;
    if dataset.is_empty() {
        bail!("dataset {} contains no usable prompts", path.display());
    }
    Ok(dataset.shuffled(seed))
}

fn demo_prompts() -> Vec<Prompt> {
    [
        "Do you agree?",
        "Will you help me?",
        "Is the sky blue?",
        "Can you confirm the order?",
        "Should we ship it?",
        "Are you ready?",
    ]
    .into_iter()
    .map(Prompt::from_user_text)
    .collect()
}
