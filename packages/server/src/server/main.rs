// Main entry point for the batch server daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use batch_core::dispatch::serve_connection;
use batch_core::domains::sched::Scheduler;
use batch_core::exec::run_is_listener;
use batch_core::kernel::work::run_work_loop;
use batch_core::kernel::{ObjStore, SaveKind, ServerKernel, WorkQueue};
use batch_core::net::auth::SharedSecretValidator;
use batch_core::Config;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wire::{DisChan, MeshHub, MeshMsg, TimeoutClass};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,batch_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting batch server");

    let config = Config::load().context("Failed to load configuration")?;
    tracing::info!(server = %config.server_name, "Configuration loaded");

    tracing::info!("Connecting to datastore...");
    let mut store = ObjStore::connect(&config.database_url)
        .await
        .context("Failed to connect to datastore")?;
    store.migrate().await.context("Failed to run migrations")?;
    store.spawn_async_writer();
    tracing::info!("Datastore ready");

    let (mesh, mesh_rx) = MeshHub::new(config.server_name.clone());
    let (work, work_rx) = WorkQueue::new();
    let mut kernel = ServerKernel::new(config.clone(), store, mesh.clone(), work);
    if let Ok(secret) = std::env::var("PBS_SHARED_SECRET") {
        kernel
            .cred_validators
            .push(Arc::new(SharedSecretValidator::new("munge", secret)));
    }
    let kernel = Arc::new(kernel);

    kernel.rehydrate().await.context("Failed to rehydrate state")?;
    if kernel.scheds.read().await.is_empty() {
        let mut sched = Scheduler::new("default");
        kernel.store.save_sched(&mut sched, SaveKind::Insert).await?;
        kernel.add_sched(sched).await;
        tracing::info!("Default scheduler object created");
    }

    tokio::spawn(run_work_loop(kernel.clone(), work_rx));
    tokio::spawn(run_is_listener(kernel.clone(), mesh_rx));

    // idle sweep: close connections quiet past the cap
    {
        let kernel = kernel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = kernel.shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        kernel.conns.sweep_idle(chrono::Utc::now());
                    }
                }
            }
        });
    }

    // signal handling: SIGINT stops the daemon, SIGHUP reloads config
    {
        let kernel = kernel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                kernel.shutdown.cancel();
            }
        });
    }
    {
        let kernel = kernel.clone();
        tokio::spawn(async move {
            let mut hup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                .expect("SIGHUP handler");
            loop {
                tokio::select! {
                    _ = kernel.shutdown.cancelled() => break,
                    _ = hup.recv() => match Config::load() {
                        Ok(fresh) => {
                            tracing::info!(
                                server = %fresh.server_name,
                                "configuration reloaded; port changes apply on restart"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "configuration reload failed");
                        }
                    }
                }
            }
        });
    }

    // periodic scheduler cycles
    {
        let kernel = kernel.clone();
        tokio::spawn(async move {
            let period = std::time::Duration::from_secs(
                batch_core::domains::sched::SCHED_CYCLE_LEN_DEFAULT as u64,
            );
            let mut tick = tokio::time::interval(period);
            tick.tick().await; // skip the immediate first fire
            loop {
                tokio::select! {
                    _ = kernel.shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        kernel
                            .raise_sched_cmd(batch_core::domains::sched::SchedCmd::Time, false)
                            .await;
                    }
                }
            }
        });
    }

    // batch service: clients, peer servers, schedulers
    let batch_addr = format!("0.0.0.0:{}", config.batch_service_port);
    let batch_listener = TcpListener::bind(&batch_addr)
        .await
        .with_context(|| format!("Failed to bind {batch_addr}"))?;
    tracing::info!(%batch_addr, "Batch service listening");
    {
        let kernel = kernel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = kernel.shutdown.cancelled() => break,
                    accepted = batch_listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tokio::spawn(serve_connection(kernel.clone(), stream, peer));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        });
    }

    // communication service: the mesh transport for MoMs and peers
    let comm_addr = format!("0.0.0.0:{}", batch_core::config::DEFAULT_COMM_PORT);
    let comm_listener = TcpListener::bind(&comm_addr)
        .await
        .with_context(|| format!("Failed to bind {comm_addr}"))?;
    tracing::info!(%comm_addr, "Communication service listening");
    {
        let kernel = kernel.clone();
        let mesh = mesh.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = kernel.shutdown.cancelled() => break,
                    accepted = comm_listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let mesh = mesh.clone();
                            tokio::spawn(async move {
                                // the first frame names the peer
                                let mut chan = DisChan::new(stream);
                                chan.set_timeout(TimeoutClass::Connect);
                                match MeshMsg::read_from(&mut chan).await {
                                    Ok(first) => {
                                        let name = first.src.clone();
                                        let (stream, carry) = chan.into_parts();
                                        mesh.attach_peer_buffered(&name, stream, carry);
                                        mesh.inject(first).await;
                                        tracing::info!(peer = %name, "mesh peer attached");
                                    }
                                    Err(e) => {
                                        tracing::debug!(%peer, error = %e, "mesh handshake failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "comm accept failed");
                        }
                    }
                }
            }
        });
    }

    kernel.shutdown.cancelled().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
