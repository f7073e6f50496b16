//! DUET Agent - headless simulation result sync
//!
//! Loads a viewer configuration, subscribes to the region's result topics
//! over STOMP/WebSocket and keeps result layers in sync until Ctrl-C:
//! - Topic tables resolved per region (with sub-regions)
//! - Optional scenario requests published at startup, POSTed to the
//!   app-receiver gateway when one is configured
//! - Layer registry and notifications summarized on exit

use anyhow::{bail, Context, Result};
use clap::Parser;
mod gateway;

use duet_core::{
    ConnectionState, DuetConfig, InMemoryLayerRegistry, Level, MemoryTileSourceFactory, RequestPublisher,
    RequestTarget, ResultDispatcher, Session, SubscriptionManager, TopicCatalog, TopicClass,
};
use gateway::HttpRequestPublisher;
use duet_env::{ClientId, StompWsTransport, TokioContext};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// DUET result-sync agent
#[derive(Parser, Debug)]
#[command(name = "duet-agent")]
#[command(about = "Keep DUET simulation result layers in sync with the message broker", long_about = None)]
struct Args {
    /// Viewer configuration file (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Region whose topics are subscribed
    #[arg(short, long, default_value = "flanders")]
    region: String,

    /// STOMP virtual host (defaults to the host of baseURL)
    #[arg(long)]
    host: Option<String>,

    /// Scenario request payload (JSON file) to publish once connected; repeatable
    #[arg(long = "request")]
    requests: Vec<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Host part of a URL, without scheme, port or path.
fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = rest.split('/').next().unwrap_or_default();
    authority.split(':').next().unwrap_or_default().to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = DuetConfig::load(&args.config)
        .with_context(|| format!("loading configuration {}", args.config.display()))?;
    let routes = TopicCatalog::from_config(&config)?.routes(&args.region, config.mode());
    if routes.is_empty() {
        bail!("no topics configured for region `{}`", args.region);
    }
    let control_destination = routes
        .iter()
        .find(|r| r.descriptor.class == TopicClass::Control)
        .map(|r| r.destination.clone());

    let broker_url = config.broker_url();
    let host = args.host.clone().unwrap_or_else(|| host_of(&config.base_url));
    let client_id = ClientId::new();
    info!(%broker_url, %client_id, region = %args.region, topics = routes.len(), "starting DUET agent");

    let registry = Arc::new(InMemoryLayerRegistry::new());
    let session = Arc::new(Session::new(
        config.clone(),
        registry.clone(),
        Arc::new(MemoryTileSourceFactory::new()),
    ));
    let manager = Arc::new(SubscriptionManager::new(
        TokioContext::shared(),
        Arc::new(StompWsTransport::new(broker_url, host, client_id)),
        routes,
        config.topic_prefix.clone(),
        config.reconnect.clone(),
        Arc::clone(session.notifications()),
    ));
    let dispatcher = Arc::new(ResultDispatcher::new(Arc::clone(&session)));

    let mut run = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run(dispatcher.as_ref()).await })
    };

    if !args.requests.is_empty() {
        let target = config
            .request_target(control_destination.as_deref())
            .context("no request destination: set appReceiverURL or configure a control topic")?;
        let gateway;
        let (publisher, destination): (&dyn RequestPublisher, String) = match target {
            RequestTarget::Gateway(url) => {
                gateway = HttpRequestPublisher::new()?;
                (&gateway, url)
            }
            RequestTarget::Broker(destination) => (manager.as_ref(), destination),
        };

        loop {
            match manager.state() {
                ConnectionState::Connected => break,
                ConnectionState::Failed => bail!("broker connection failed before requests were sent"),
                _ => sleep(Duration::from_millis(100)).await,
            }
        }

        for path in &args.requests {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let payload: Value =
                serde_json::from_str(&text).with_context(|| format!("parsing request {}", path.display()))?;
            let scenario = session.request_scenario(publisher, &destination, &payload).await?;
            info!(%scenario, %destination, "scenario requested");
        }
    }

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            manager.shutdown();
            (&mut run).await?
        }
        joined = &mut run => joined?,
    };

    for scenario in session.active_scenarios() {
        info!(
            scenario = %scenario.scenario_id,
            class = %scenario.class,
            phase = ?scenario.phase,
            layers = scenario.layers.len(),
            "scenario loaded"
        );
    }
    info!(active = ?registry.active_names(), pending = session.pending().len(), "final layer state");
    for note in session.notifications().at_least(Level::Warning) {
        warn!(source = %note.source, count = note.count, "{}", note.message);
    }

    outcome?;
    Ok(())
}
