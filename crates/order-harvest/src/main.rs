use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use order_harvest::checkpoint::CheckpointStore;
use order_harvest::config::Overrides;
use order_harvest::output::write_outputs;
use order_harvest::{
    AnthropicClient, CrmStats, FormattedOrder, HarvestConfig, Pipeline, ProfileKind,
    UltraMsgSource,
};

/// Lines shown per order in the closing preview.
const PREVIEW_LINES: usize = 5;
const PREVIEW_ORDERS: usize = 3;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML file with settings; flags and environment win over it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pacing and retry profile
    #[arg(long, value_enum)]
    profile: Option<ProfileKind>,

    /// Maximum number of messages to fetch
    #[arg(long)]
    limit: Option<usize>,

    /// Skip this many leading messages of the batch
    #[arg(long, default_value_t = 0)]
    start_from: usize,

    /// Directory for the final files and the default checkpoint
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Checkpoint file path
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Chat to read, e.g. 573000000000-1600000000@g.us
    #[arg(long)]
    chat_id: Option<String>,

    /// Stop after formatting; no CRM extraction, no final files
    #[arg(long, default_value_t = false)]
    skip_crm: bool,
}

fn log_preview(orders: &[FormattedOrder]) {
    for (i, order) in orders.iter().take(PREVIEW_ORDERS).enumerate() {
        let (lines, hidden) = order.preview(PREVIEW_LINES);
        info!(n = i + 1, hidden_lines = hidden, "order preview:\n{}", lines.join("\n"));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let overrides = Overrides {
        profile: cli.profile,
        batch_limit: cli.limit,
        chat_id: cli.chat_id,
        out_dir: cli.out_dir,
        checkpoint: cli.checkpoint,
    };
    let config = HarvestConfig::load(overrides, cli.config.as_deref())
        .context("failed to load configuration")?;

    info!(
        profile = %config.profile.kind,
        model = %config.llm.model,
        limit = config.batch_limit,
        checkpoint = %config.checkpoint_path.display(),
        "order harvest starting"
    );

    let source = UltraMsgSource::new(
        config.gateway.base_url.clone(),
        config.gateway.instance_id.clone(),
        config.gateway.token.clone(),
        config.profile.fetch,
    )
    .context("failed to build gateway client")?;
    let llm = AnthropicClient::new(
        config.llm.base_url.clone(),
        config.llm.api_key.clone(),
        config.llm.model.clone(),
    )
    .context("failed to build LLM client")?;

    let mut pipeline = Pipeline::new(
        Arc::new(source),
        Arc::new(llm),
        config.profile.clone(),
        CheckpointStore::new(&config.checkpoint_path),
        config.pricing,
    );

    let batch = pipeline
        .run_batch(&config.chat_id, config.batch_limit, cli.start_from)
        .await
        .context("batch failed to start")?;

    if batch.orders.is_empty() {
        info!("no orders found");
        pipeline.ledger().summary().log();
        return Ok(());
    }

    if cli.skip_crm {
        info!(orders = batch.orders.len(), "CRM extraction skipped");
        pipeline.ledger().summary().log();
        log_preview(&batch.orders);
        return Ok(());
    }

    let records = pipeline.finish(&batch.orders).await;
    let paths = write_outputs(
        &config.out_dir,
        config.profile.kind,
        &batch.orders,
        &records,
        &pipeline.ledger().cost(),
    )
    .with_context(|| format!("failed to write output files to {}", config.out_dir.display()))?;

    info!(
        catalogue = %paths.catalogue.display(),
        crm = %paths.crm.display(),
        orders = batch.orders.len(),
        clients = records.len(),
        "harvest complete"
    );
    CrmStats::from_records(&records).log();
    pipeline.ledger().summary().log();
    log_preview(&batch.orders);

    Ok(())
}
