//! Gatekeeper: a multi-tenant reverse proxy fronting a pool of upstream
//! generative-AI API keys. See `config`, `dispatch`, and `proxy` for the
//! pieces this wires together.

mod cache_index;
mod cli;
mod config;
mod context_store;
mod dispatch;
mod key_pool;
mod model_limits;
mod proxy;
mod scheduler;
mod storage;
mod translate;
mod types;
mod usage;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use config::{Config, ContextStorageMode, KeyStorageMode};
use key_pool::{score_weights_default, KeyPool, UpstreamKey};
use model_limits::ModelLimitsRegistry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if cli::handle_cli() {
        return Ok(());
    }

    let config = Config::load();
    config.ensure_config_exists();

    init_tracing(&config);

    tracing::info!(addr = %config.bind_addr, "starting gatekeeper");

    let model_limits = Arc::new(ModelLimitsRegistry::new(
        config.model_limit_overrides.clone(),
        config.context.default_max_tokens,
    ));
    let usage = Arc::new(usage::UsageTracker::new(config.scheduler.timezone()));

    let context_store = Arc::new(match config.context.storage_mode {
        ContextStorageMode::Memory => context_store::ContextStore::memory(
            config.context.memory_max_records,
            (config.context.default_ttl_days as u64) * 86_400,
        ),
        ContextStorageMode::Database => {
            let pool = storage::sqlite::build_pool(&config.context.db_path)?;
            context_store::ContextStore::sqlite(pool, (config.context.default_ttl_days as u64) * 86_400)
        }
    });

    let cache_index = Arc::new(match config.upstream.key_storage_mode {
        KeyStorageMode::Database => {
            let pool = storage::sqlite::build_pool(&config.upstream.database_path)?;
            cache_index::CacheIndex::sqlite(pool)
        }
        KeyStorageMode::Memory => cache_index::CacheIndex::memory(),
    });

    let key_pool_backend = match config.upstream.key_storage_mode {
        KeyStorageMode::Database => Some(storage::sqlite::build_pool(&config.upstream.database_path)?),
        KeyStorageMode::Memory => None,
    };

    let key_pool = Arc::new(KeyPool::new(
        usage.clone(),
        model_limits.clone(),
        score_weights_default(),
        config.scheduler.key_cooldown_seconds,
        config.scheduler.sticky_session_ttl_seconds,
        config.scheduler.score_refresh_interval_seconds,
        key_pool_backend,
    )?);

    if matches!(config.upstream.key_storage_mode, KeyStorageMode::Memory) {
        for (i, secret) in config.upstream.memory_keys.iter().enumerate() {
            key_pool.add_key(UpstreamKey {
                id: format!("memory-key-{i}"),
                secret: secret.clone(),
                description: String::new(),
                enabled: true,
                created_at: Utc::now(),
                expires_at: None,
                context_completion_enabled: true,
                last_used_at: None,
            })?;
        }
    }

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .pool_max_idle_per_host(10)
        .build()?;

    let dispatcher = Arc::new(dispatch::Dispatcher {
        credentials: config.auth.credentials.clone(),
        model_limits: model_limits.clone(),
        usage: usage.clone(),
        context_store: context_store.clone(),
        cache_index: cache_index.clone(),
        key_pool: key_pool.clone(),
        http,
        upstream_base_url: config.upstream.base_url.clone(),
        safety_margin: config.context.safety_margin,
        stream_save_reply: true,
    });

    let shutdown = tokio_util::sync::CancellationToken::new();

    let scheduler = scheduler::Scheduler::start(
        &config.scheduler,
        usage.clone(),
        context_store.clone(),
        cache_index.clone(),
        key_pool.clone(),
        model_limits.clone(),
        std::time::Duration::from_secs(config.context.memory_cleanup_interval_seconds),
        shutdown.clone(),
    );

    let app_state = proxy::AppState {
        dispatcher,
        admin_credential: config.auth.admin_credential.clone(),
    };

    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(proxy::server::start_proxy(
        config.bind_addr,
        app_state,
        server_shutdown,
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("ctrl-c received, shutting down");
        }
    }

    shutdown.cancel();
    if let Err(e) = server_handle.await? {
        tracing::error!(error = %e, "server exited with error");
    }
    scheduler.shutdown().await;

    tracing::info!("shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let default_filter = if config.logging.debug {
        "gatekeeper=debug,tower_http=debug,axum=debug"
    } else {
        "gatekeeper=info,axum=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let file_appender = match config.logging.rotation {
        config::LogRotation::Hourly => tracing_appender::rolling::hourly(&config.log_dir, "gatekeeper.log"),
        config::LogRotation::Daily => tracing_appender::rolling::daily(&config.log_dir, "gatekeeper.log"),
        config::LogRotation::Never => tracing_appender::rolling::never(&config.log_dir, "gatekeeper.log"),
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Leaked deliberately: the guard must outlive `main` to flush on exit,
    // and there is no later point to drop it explicitly.
    Box::leak(Box::new(guard));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();
}
