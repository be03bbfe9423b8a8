//! pushbuild server: notification ingestion plus one build worker.

use anyhow::Context;
use clap::Parser;
use pushbuild_api::{AppState, routes};
use pushbuild_config::{LogFormat, load_worker_config};
use pushbuild_core::push::BranchCursor;
use pushbuild_executor::{ProcessRunner, TreeBuilder};
use pushbuild_scheduler::{FsArtifactStore, TracingReporter, Worker, WorkerOptions};
use pushbuild_sync::{BroadcastBus, ChangesetFeed, ListenerConfig, PushSynchronizer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pushbuild-server")]
#[command(about = "Build every push to the tracked branches", long_about = None)]
struct Args {
    /// Worker configuration file
    #[arg(short, long, env = "PUSHBUILD_CONFIG", default_value = "pushbuild.kdl")]
    config: PathBuf,

    /// Emit logs as JSON regardless of the configured format
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_worker_config(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    init_tracing(args.log_json || config.log_format == LogFormat::Json);

    let bus = BroadcastBus::default();
    let feed = ChangesetFeed::new(&config.feed).context("Failed to create pushlog client")?;
    let feed = Arc::new(feed);
    let cursors = config
        .branches
        .iter()
        .map(|b| BranchCursor::new(b.name.clone(), b.after.clone()));

    let mut sync = PushSynchronizer::new(feed, cursors);
    if let Some(notifications) = &config.notifications {
        sync = sync.listen(Arc::new(bus.clone()), ListenerConfig::from(notifications));
    } else {
        info!("No notifications configured, running catch-up only");
    }

    let options = WorkerOptions::from_config(&config).context("Failed to read build inputs")?;
    let builder = TreeBuilder::new(&config.build, Arc::new(ProcessRunner));
    let store = FsArtifactStore::from_config(&config.store);
    let worker = Worker::new(
        Box::new(sync),
        Arc::new(builder),
        Arc::new(store),
        Arc::new(TracingReporter),
        options,
    );

    let handle = worker.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current build");
            handle.shutdown();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt, exiting immediately");
            std::process::exit(130);
        }
    });

    let listen = config.notifications.as_ref().map(|n| n.listen);
    let server = match listen {
        Some(addr) => {
            let state = AppState::new(
                bus.clone(),
                config.notifications.as_ref().and_then(|n| n.secret.clone()),
            );
            let app = routes::router(state).layer(TraceLayer::new_for_http());
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            info!("Accepting notifications on {}", addr);
            Some(tokio::spawn(async move { axum::serve(listener, app).await }))
        }
        None => None,
    };

    let reason = worker.run().await;
    if let Some(server) = server {
        server.abort();
    }

    info!(reason = %reason, "Exiting");
    Ok(())
}
