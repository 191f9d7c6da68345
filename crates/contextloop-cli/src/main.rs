use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use contextloop::{
    AdaptivePlanner, CharEstimator, ChatLog, ContextloopConfig, Contextualizer, EmbeddingProvider,
    ExecutionLoop, LoopEvent, OnEvent, OpenAiEmbedding, OpenAiProvider, Tokenizer, Workspace,
    seed_session,
};

/// Names shown in the seeded directory preview.
const PREVIEW_ENTRIES: usize = 20;

#[derive(Parser)]
#[command(name = "contextloop", about = "Run a goal through the contextloop agent loop")]
struct Args {
    /// Path to contextloop.toml
    #[arg(long, default_value = "contextloop.toml")]
    config: PathBuf,

    /// Session workspace directory; created if missing
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Print loop events to stderr as JSON lines
    #[arg(long)]
    events: bool,

    /// The goal to achieve
    #[arg(trailing_var_arg = true, required = true)]
    goal: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let goal = args.goal.join(" ");
    if goal.trim().is_empty() {
        bail!("Usage: contextloop [--config PATH] [--workspace DIR] <goal>");
    }

    let config = ContextloopConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    let api_key = std::env::var(&config.provider.api_key_env)
        .with_context(|| format!("{} env var required", config.provider.api_key_env))?;

    let mut provider = OpenAiProvider::new(api_key.clone(), &config.provider.model);
    let mut embedder = OpenAiEmbedding::new(api_key, &config.provider.embedding_model);
    if let Some(base_url) = &config.provider.base_url {
        provider = provider.with_base_url(base_url);
        embedder = embedder.with_base_url(base_url);
    }
    if let Some(dimension) = config.provider.embedding_dimension {
        embedder = embedder.with_dimension(dimension);
    }
    let llm = Arc::new(provider);
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(embedder);

    let workspace = Arc::new(
        Workspace::open(&args.workspace)
            .with_context(|| format!("failed to open workspace {}", args.workspace.display()))?,
    );

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current iteration");
            on_ctrl_c.cancel();
        }
    });
    let print: Option<Arc<OnEvent>> = args.events.then(|| {
        Arc::new(|event: LoopEvent| {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{line}");
            }
        }) as Arc<OnEvent>
    });

    let tokenizer: Arc<dyn Tokenizer> = Arc::new(CharEstimator);
    let agents = config.build_agents(
        &llm,
        Arc::clone(&embedder),
        &workspace,
        Arc::clone(&tokenizer),
        &cancel,
        print.as_ref(),
    );

    let contextualizer = Contextualizer::new(
        Arc::clone(&llm),
        embedder,
        config.context.limits(),
        config.context.settings(),
    );
    let mut planner = AdaptivePlanner::new(Arc::clone(&llm), contextualizer, agents, &goal)
        .context("failed to set up agents")?;

    let mut chat = ChatLog::new(tokenizer);
    let preview = workspace
        .preview(PREVIEW_ENTRIES)
        .await
        .context("failed to list workspace")?;
    seed_session(&mut chat, &preview, &goal);

    let mut builder = ExecutionLoop::builder(Arc::clone(&llm))
        .name("main")
        .config(config.loop_config())
        .cancel_token(cancel);
    if let Some(print) = print {
        builder = builder.on_event(print);
    }

    match builder.build().run(&goal, &mut chat, &mut planner).await {
        Ok(output) => {
            println!("{}", output.result);
            eprintln!(
                "\n---\nTokens used: {} in / {} out | Iterations: {} | Function calls: {}",
                output.state.usage.input_tokens,
                output.state.usage.output_tokens,
                output.state.iteration,
                output.state.function_calls_made,
            );
            Ok(())
        }
        Err(failure) => {
            eprintln!(
                "\n---\nTokens used: {} in / {} out | Function calls: {}",
                failure.state.usage.input_tokens,
                failure.state.usage.output_tokens,
                failure.state.function_calls_made,
            );
            bail!("{failure}")
        }
    }
}
