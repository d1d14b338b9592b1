//! nx-proxy node driver
//!
//! Loads the local config, acquires the single-instance lock, then runs two
//! periodic loops against the backend: a config pull that reconciles the
//! service hub, and a status push that drains accumulated byte deltas and
//! slot health. Deltas from failed pushes are retried on the next one.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nx_proxy::config;
use nx_proxy::hub::ServiceHub;
use nx_proxy::peer::PeerDelta;
use nx_proxy::rest::model::{ServiceInfo, Status};
use nx_proxy::rest::Client;
use nx_proxy::token::ServerToken;

const CONFIG_PULL_INTERVAL: Duration = Duration::from_secs(15);
const STATUS_PUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Multi-tenant forwarding proxy node
#[derive(Parser, Debug)]
#[command(name = "nx-proxy")]
#[command(about = "Multi-tenant forwarding proxy node")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let file_entries = config::load_config_file();
    let entries = file_entries.as_ref().map(|(entries, _)| entries);

    let debug_enabled = config::get_opt(entries, "DEBUG")
        .map(|val| config::is_true(&val))
        .unwrap_or(false);

    let log_level = if debug_enabled {
        "debug".to_string()
    } else {
        args.log_level.clone()
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&log_level))
        .init();

    match &file_entries {
        Some((_, path)) => info!("Loaded config from {}", path.display()),
        None => warn!("No config files found"),
    }

    let _lock = nx_proxy::lock::InstanceLock::acquire()
        .map_err(|err| anyhow!("another instance appears to be running: {err}"))?;

    let token = match config::get_opt(entries, "SECRET_TOKEN") {
        Some(val) => Some(ServerToken::from_str(&val).context("parse secret token")?),
        None => {
            warn!("Startup: secret token not provided");
            None
        }
    };

    let auth_url = config::get_opt(entries, "AUTH_URL")
        .ok_or_else(|| anyhow!("auth server url not provided"))?;
    let auth_url = config::parse_auth_url(&auth_url).context("parse auth server url")?;

    let client = Arc::new(Client::new(auth_url, token).context("create api client")?);

    let skip_ping = config::get_opt(entries, "SKIP_STARTUP_PING")
        .map(|val| config::is_true(&val))
        .unwrap_or(false);

    if !skip_ping {
        match client.ping().await {
            Ok(()) => debug!("Startup: backend reachable"),
            Err(err) => warn!("Startup: backend ping failed: {err}"),
        }
    }

    let hub = Arc::new(ServiceHub::new());

    let run_id = Uuid::new_v4();
    let started = tokio::time::Instant::now();
    let done = CancellationToken::new();

    let status_task = tokio::spawn(status_loop(
        client.clone(),
        hub.clone(),
        run_id,
        started,
        done.clone(),
    ));

    let config_task = tokio::spawn(config_loop(client.clone(), hub.clone(), done.clone()));

    wait_for_shutdown().await;
    warn!("Received an exit signal");

    done.cancel();

    let mut retry_queue = status_task.await.unwrap_or_default();
    let _ = config_task.await;

    hub.close_slots().await;

    // one last push carries whatever the closed slots still held
    push_status(&client, &hub, run_id, started, &mut retry_queue).await;
    if !retry_queue.is_empty() {
        warn!("Exiting with {} unreported deltas", retry_queue.len());
    }

    warn!("Service stopped. Bye-bye...");
    Ok(())
}

async fn config_loop(client: Arc<Client>, hub: Arc<ServiceHub>, done: CancellationToken) {
    loop {
        match client.pull_config().await {
            Ok(cfg) => {
                debug!("API: updating config: remote={}", client.remote_host());

                hub.set_dns(&cfg.dns);
                hub.set_services(cfg.services).await;

                debug!("API: config updated");
            }
            Err(err) => {
                error!(
                    "API: pulling config: remote={} err={}",
                    client.remote_host(),
                    err,
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(CONFIG_PULL_INTERVAL) => {}
            _ = done.cancelled() => return,
        }
    }
}

/// Returns the deltas still awaiting a successful push
async fn status_loop(
    client: Arc<Client>,
    hub: Arc<ServiceHub>,
    run_id: Uuid,
    started: tokio::time::Instant,
    done: CancellationToken,
) -> Vec<PeerDelta> {
    let mut retry_queue: Vec<PeerDelta> = Vec::new();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(STATUS_PUSH_INTERVAL) => {
                push_status(&client, &hub, run_id, started, &mut retry_queue).await;
            }
            _ = done.cancelled() => return retry_queue,
        }
    }
}

async fn push_status(
    client: &Client,
    hub: &ServiceHub,
    run_id: Uuid,
    started: tokio::time::Instant,
    retry_queue: &mut Vec<PeerDelta>,
) {
    let mut deltas = std::mem::take(retry_queue);
    deltas.extend(hub.deltas().await);

    let status = Status {
        service: ServiceInfo {
            run_id,
            uptime: started.elapsed().as_secs() as i64,
        },
        slots: hub.slot_infos().await,
        deltas,
    };

    if let Err(err) = client.push_status(&status).await {
        error!("API: push status: err={err}");
        // keep the byte counts for the next attempt
        *retry_queue = status.deltas;
        return;
    }

    debug!(
        "API: status sent: remote={} deltas={}",
        client.remote_host(),
        status.deltas.len(),
    );
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(val) => val,
        Err(err) => {
            error!("Install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
