use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use fammail::channels::{ImapMailbox, MailboxWatcher};
use fammail::config::AppConfig;
use fammail::llm::create_provider;
use fammail::orders::OrderSubmitter;
use fammail::pipeline::extractor::LlmExtractor;
use fammail::pipeline::{ContentParser, Orchestrator, PostcardRenderer};
use fammail::store::LibSqlBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing();

    let config = AppConfig::from_env().context("Failed to load configuration")?;

    // ── Database ─────────────────────────────────────────────────────────
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Parser (generative fallback is optional) ─────────────────────────
    let mut parser = ContentParser::new(config.pipeline.default_country.clone());
    match &config.llm {
        Some(llm_config) => {
            let llm = create_provider(llm_config).context("Failed to create LLM provider")?;
            info!(model = llm.model_name(), "Generative address extraction enabled");
            parser = parser.with_extractor(Arc::new(LlmExtractor::new(
                llm,
                config.pipeline.default_country.clone(),
            )));
        }
        None => warn!("No LLM key configured; only pattern-based address parsing is available"),
    }

    // ── Orders ───────────────────────────────────────────────────────────
    let submitter =
        Arc::new(OrderSubmitter::new(&config.provider).context("Failed to create order client")?);

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        parser,
        PostcardRenderer::new(),
        submitter,
        config.pipeline.clone(),
    ));

    // ── Mailbox ──────────────────────────────────────────────────────────
    info!(
        host = %config.mailbox.host,
        mailbox = %config.mailbox.mailbox,
        "Connecting to mailbox"
    );
    let mut watcher = MailboxWatcher::new(
        Box::new(ImapMailbox::new(config.mailbox.clone())),
        orchestrator,
        config.watch.clone(),
    );
    watcher.start().await.context("Failed to start mailbox watcher")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    watcher.stop().await;
    Ok(())
}

/// Log to stderr, and to a daily file under `FAMMAIL_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match std::env::var("FAMMAIL_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "fammail.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
