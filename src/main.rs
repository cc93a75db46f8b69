use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mail_director::api::{self, ApiState};
use mail_director::clock::{Clock, SystemClock};
use mail_director::config::AppConfig;
use mail_director::diagnostics::Diagnostics;
use mail_director::fetcher::FetcherManager;
use mail_director::llm::{LlmRegistry, OpenAiCompatibleProvider};
use mail_director::mail::{GmailProvider, ProviderRegistry, TokenManager};
use mail_director::orchestrator::{ConversationEngine, EngineDeps};
use mail_director::pipeline::EmailPipeline;
use mail_director::store::{CollectionStore, LibSqlStore};
use mail_director::tenant::ResourceRegistry;
use mail_director::tools::ToolRegistry;
use mail_director::tools::builtin::register_builtins;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;

    // Stderr always; a daily-rolling file too when a log dir is configured.
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-director.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                ),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    eprintln!("📬 Mail Director v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.data_path.display());
    eprintln!("   Listening: http://{}", config.listen_addr);

    // ── Storage & tenants ───────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn CollectionStore> = Arc::new(
        LibSqlStore::new_local(&config.data_path)
            .await
            .with_context(|| format!("failed to open {}", config.data_path.display()))?,
    );
    let registry = Arc::new(ResourceRegistry::new(
        store,
        Arc::clone(&clock),
        config.registry.clone(),
    ));
    let _registry_sweep = registry.spawn_sweep_task();

    let diagnostics = Arc::new(Diagnostics::new(Arc::clone(&clock), &config.diagnostics));

    // ── Providers ───────────────────────────────────────────────────────
    let mail_providers =
        Arc::new(ProviderRegistry::new().with_provider(Arc::new(GmailProvider::new(config.gmail.clone()))));
    let mut openai = OpenAiCompatibleProvider::new(reqwest::Client::new());
    if let Some(base_url) = &config.openai_base_url {
        openai = openai.with_base_url(base_url.clone());
    }
    let llm = Arc::new(LlmRegistry::new().with_provider(Arc::new(openai)));

    // ── Tools & engine ──────────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::new());
    register_builtins(&tools, Arc::clone(&clock), Arc::clone(&diagnostics));
    eprintln!("   Tools: {} registered", tools.count());

    let engine = Arc::new(ConversationEngine::new(
        EngineDeps::new(llm, tools, Arc::clone(&diagnostics), Arc::clone(&clock)),
        config.engine.clone(),
    ));

    let tokens = Arc::new(
        TokenManager::new(
            Arc::clone(&mail_providers),
            Arc::clone(&clock),
            Arc::clone(&diagnostics),
        )
        .with_refresh_timeout(config.token_refresh_timeout),
    );
    let pipeline = Arc::new(EmailPipeline::new(
        tokens,
        mail_providers,
        Arc::clone(&engine),
        Arc::clone(&diagnostics),
        Arc::clone(&clock),
        config.pipeline.clone(),
    ));

    // ── Fetchers ────────────────────────────────────────────────────────
    let manager = Arc::new(FetcherManager::new(
        Arc::clone(&registry),
        pipeline,
        Arc::clone(&diagnostics),
        Arc::clone(&clock),
        config.manager.clone(),
        config.fetcher.clone(),
    ));
    let _manager_sweep = manager.spawn_sweep_task();
    let report = manager.bootstrap().await.context("fetcher bootstrap failed")?;
    eprintln!(
        "   Fetchers: {} started, {} failed\n",
        report.started.len(),
        report.failed.len()
    );

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = api::router(ApiState {
        manager: Arc::clone(&manager),
        registry,
        engine,
        diagnostics,
    });
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "Control API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("server error")?;

    manager.shutdown().await;
    Ok(())
}
