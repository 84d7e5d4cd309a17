//! TCP Listener — binds the routing engine and admin API, accepts client
//! connections, and spawns one task per connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use crate::client::{Client, Quorum};
use crate::config::{Config, SchedulerKind};
use crate::connection;
use crate::hash;
use crate::host::HostTimeouts;
use crate::log::LogRegistry;
use crate::metrics::Metrics;
use crate::scheduler::{AutoScheduler, ConsistentHashScheduler, ManualScheduler, ModScheduler, Scheduler};

static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// Start the cachequorum proxy server: build the scheduler and client from
/// config, open log sinks, spawn the admin API (if configured) and the
/// background recovery/probe loops, then accept client connections until
/// shutdown.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.listen_host, config.listen_port);
    let listener = TcpListener::bind(&addr).await?;

    let metrics = Arc::new(Metrics::new());
    let log = Arc::new(LogRegistry::open(config.access_log.clone(), config.error_log.clone()).await?);

    let hash_fn = hash::by_name(&config.hash_name)
        .ok_or_else(|| format!("unknown hash function: {}", config.hash_name))?;
    let timeouts = HostTimeouts::default();

    let scheduler: Arc<dyn Scheduler> = match config.scheduler_kind {
        SchedulerKind::Manual => {
            let sched = ManualScheduler::new(
                config.servers.clone(),
                config.num_buckets,
                config.n,
                hash_fn,
                timeouts,
                Arc::clone(&metrics),
            )?;
            sched.spawn_recovery_loop(Arc::clone(&log));
            sched
        }
        SchedulerKind::Auto => {
            let addrs: Vec<String> = config.servers.iter().map(|(addr, _)| addr.clone()).collect();
            let sched = AutoScheduler::new(addrs, config.num_buckets, hash_fn, timeouts, Arc::clone(&metrics))?;
            sched.spawn_directory_check_loop();
            sched
        }
        SchedulerKind::Mod => {
            let addrs: Vec<String> = config.servers.iter().map(|(addr, _)| addr.clone()).collect();
            ModScheduler::new(addrs, hash_fn, timeouts, Arc::clone(&metrics))
        }
        SchedulerKind::ConsistentHash => {
            let addrs: Vec<String> = config.servers.iter().map(|(addr, _)| addr.clone()).collect();
            ConsistentHashScheduler::new(addrs, hash_fn, timeouts, Arc::clone(&metrics))
        }
    };

    let quorum = Quorum { n: config.n, w: config.w, r: config.r };
    let client = Arc::new(Client::new(
        Arc::clone(&scheduler),
        quorum,
        config.readonly,
        config.async_tail_replication,
        Arc::clone(&metrics),
    ));

    info!(
        addr = %addr,
        scheduler = %config.scheduler_kind,
        hash = %config.hash_name,
        buckets = config.num_buckets,
        n = config.n,
        w = config.w,
        r = config.r,
        servers = config.servers.len(),
        readonly = config.readonly,
        "cachequorum listening"
    );

    if let Some(admin_port) = config.admin_port {
        let scheduler = Arc::clone(&scheduler);
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            if let Err(e) = crate::admin::run(admin_port, scheduler, metrics).await {
                tracing::error!(error = %e, "admin API exited");
            }
        });
    }

    spawn_sighup_handler(Arc::clone(&log));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown_tx_ctrlc = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested, draining connections");
        let _ = shutdown_tx_ctrlc.send(());
    });

    let active = Arc::new(AtomicU64::new(0));
    let mut shutdown_rx_accept = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let client = Arc::clone(&client);
                let log = Arc::clone(&log);
                let metrics = Arc::clone(&metrics);
                let conn_id = CONN_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
                let mut shutdown_rx = shutdown_tx.subscribe();
                let active = Arc::clone(&active);

                metrics.connections_total.fetch_add(1, Ordering::Relaxed);
                metrics.connections_active.fetch_add(1, Ordering::Relaxed);
                active.fetch_add(1, Ordering::Relaxed);

                tokio::spawn(async move {
                    connection::handle_connection(socket, peer, client, log, Arc::clone(&metrics), conn_id, &mut shutdown_rx).await;
                    metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
                    active.fetch_sub(1, Ordering::Relaxed);
                });
            }
            _ = shutdown_rx_accept.recv() => {
                break;
            }
        }
    }

    let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
    while active.load(Ordering::Relaxed) > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    scheduler.hosts().close_all().await;
    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
fn spawn_sighup_handler(log: Arc<LogRegistry>) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let Ok(mut hangup) = signal(SignalKind::hangup()) else { return };
        loop {
            hangup.recv().await;
            if let Err(e) = log.reopen().await {
                tracing::warn!(error = %e, "failed to reopen logs on SIGHUP");
            } else {
                tracing::info!("reopened access/error logs");
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_sighup_handler(_log: Arc<LogRegistry>) {}
