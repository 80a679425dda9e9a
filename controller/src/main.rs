#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use haproxy_canary_controller::{
    events::{self, Intake},
    marathon,
    reload::{self, Reload},
    Health, MemoryStore, Pipeline, PipelineConfig, Scheduler, Trigger, Update, WeightStore,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::Instrument;

#[derive(Clone, Debug, clap::ValueEnum)]
enum ReloadStrategy {
    /// Notify the HTTP sidecar running beside HAProxy
    Sidecar,
    /// Run `--reload-command` locally
    Command,
}

/// Keeps HAProxy's configuration in sync with Marathon.
#[derive(Parser)]
#[command(version)]
struct Args {
    #[arg(
        long,
        env = "HAPROXY_CANARY_LOG_LEVEL",
        default_value = "haproxy_canary=info,warn"
    )]
    log_level: kubert::LogFilter,

    #[arg(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[command(flatten)]
    admin: kubert::AdminArgs,

    /// Marathon endpoints, tried in order
    #[arg(
        long,
        env = "MARATHON_ENDPOINTS",
        value_delimiter = ',',
        required = true
    )]
    marathon_endpoints: Vec<String>,

    #[arg(long, env = "MARATHON_USER")]
    marathon_user: Option<String>,

    #[arg(long, env = "MARATHON_PASSWORD", hide_env_values = true)]
    marathon_password: Option<String>,

    /// Address on which Marathon event callbacks are accepted
    #[arg(long, env = "HAPROXY_CANARY_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    listen_addr: SocketAddr,

    /// Externally reachable URL of the event callback to register with Marathon
    #[arg(long, env = "HAPROXY_CANARY_CALLBACK_URL")]
    callback_url: Option<String>,

    #[arg(long, env = "HAPROXY_TEMPLATE_PATH", default_value = "haproxy_template.cfg")]
    template_path: PathBuf,

    #[arg(long, env = "HAPROXY_OUTPUT_PATH", default_value = "/etc/haproxy/haproxy.cfg")]
    output_path: PathBuf,

    /// JSON array of weight records, re-read whenever it changes
    #[arg(long, env = "HAPROXY_CANARY_WEIGHTS_FILE")]
    weights_file: Option<PathBuf>,

    /// Seconds between checks of `--weights-file` for changes
    #[arg(
        long,
        env = "HAPROXY_CANARY_WEIGHTS_POLL_SECS",
        default_value = "5",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    weights_poll_secs: u64,

    #[arg(long, value_enum, env = "HAPROXY_RELOAD_STRATEGY", default_value = "sidecar")]
    reload_strategy: ReloadStrategy,

    /// Base URL of the reload sidecar
    #[arg(long, env = "HAPROXY_PROXY_URL", default_value = "http://127.0.0.1:5004")]
    proxy_url: String,

    #[arg(long, env = "HAPROXY_RELOAD_COMMAND")]
    reload_command: Option<String>,

    #[arg(long, env = "HAPROXY_VALIDATE_COMMAND")]
    validate_command: Option<String>,

    #[arg(long, env = "HAPROXY_CLEANUP_COMMAND")]
    cleanup_command: Option<String>,

    /// Treat a failing reload command as a failed update
    #[arg(long, env = "HAPROXY_STRICT_RELOAD")]
    strict_reload: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        admin,
        marathon_endpoints,
        marathon_user,
        marathon_password,
        listen_addr,
        callback_url,
        template_path,
        output_path,
        weights_file,
        weights_poll_secs,
        reload_strategy,
        proxy_url,
        reload_command,
        validate_command,
        cleanup_command,
        strict_reload,
    } = Args::parse();

    log_format
        .try_init(log_level)
        .context("failed to initialize logging")?;

    let admin = admin
        .into_builder()
        .bind()
        .context("failed to bind admin server")?;
    let health = Health::with_readiness(admin.readiness());
    let _admin = admin.spawn();

    let marathon =
        marathon::Client::new(marathon_endpoints).with_credentials(marathon_user, marathon_password);

    let store = match &weights_file {
        Some(path) => MemoryStore::load(path)
            .await
            .with_context(|| format!("failed to load weights from {}", path.display()))?,
        None => MemoryStore::default(),
    };
    let store: Arc<dyn WeightStore> = Arc::new(store);

    let reloader: Arc<dyn Reload> = match reload_strategy {
        ReloadStrategy::Sidecar => Arc::new(reload::Sidecar::new(proxy_url)),
        ReloadStrategy::Command => {
            let command = reload_command.context("--reload-command is required by the command strategy")?;
            Arc::new(reload::Command::new(command, strict_reload))
        }
    };

    let config = PipelineConfig {
        template_path,
        output_path,
        validate_command,
        cleanup_command,
    };
    let pipeline = Pipeline::new(config, marathon.clone(), store.clone(), reloader, health);

    // All configuration writes and reloads happen on this one task; producers only enqueue.
    let scheduler = Scheduler::new();
    tokio::spawn(
        scheduler
            .clone()
            .run(pipeline)
            .instrument(tracing::info_span!("update")),
    );
    tokio::spawn(
        events::watch_weights(store.subscribe(), scheduler.clone())
            .instrument(tracing::info_span!("weights")),
    );
    if let Some(path) = weights_file {
        tokio::spawn(
            events::watch_weights_file(path, store, Duration::from_secs(weights_poll_secs))
                .instrument(tracing::info_span!("weights_file")),
        );
    }

    if let Some(url) = &callback_url {
        if let Err(error) = marathon.ensure_subscribed(url).await {
            tracing::warn!(%error, "failed to register marathon event subscription");
        }
    }
    scheduler.schedule(Update::full(Trigger::Startup));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    tracing::info!(addr = %listen_addr, "accepting marathon events");
    let router = Intake::new(scheduler, marathon, callback_url).router();
    let server = async move { axum::serve(listener, router).await };

    tokio::select! {
        res = server => {
            res.context("event server failed")?;
        }
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for shutdown signal")?;
            tracing::info!("shutting down");
        }
    }

    Ok(())
}
