use std::{path::PathBuf, sync::Arc, time::Instant};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::skein::{config, logging, net, relay, server, telemetry};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        listen_addr = %cfg.listen_addr,
        relay_path = %cfg.relay.path,
        allow_udp_streams = cfg.relay.allow_udp_streams,
        blacklist_patterns = cfg.relay.hostname_blacklist.len(),
        max_sessions = cfg.relay.max_sessions,
        "skein: starting"
    );

    let dialer = Arc::new(relay::dialer::Dialer::new(relay::dialer::DialerOptions {
        hostname_blacklist: cfg.relay.hostname_blacklist.clone(),
        dns_servers: cfg.relay.dns_servers.clone(),
        allow_udp: cfg.relay.allow_udp_streams,
        dial_timeout: cfg.timeouts.dial_timeout,
    })?);
    let registry = Arc::new(relay::lifecycle::SessionRegistry::new(
        cfg.relay.max_sessions,
    ));
    let prom = Arc::new(telemetry::init_prometheus()?);

    let addr = net::parse_listen_addr(&cfg.listen_addr)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let shutdown_grace = cfg.timeouts.shutdown_grace;

    let state = server::AppState {
        cfg: Arc::new(cfg),
        dialer,
        registry,
        prom,
        shutdown: shutdown_rx.clone(),
        started: Instant::now(),
    };

    let mut tasks = JoinSet::new();
    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server::serve(listener, state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks: live sessions observe the shutdown signal and tear their
    // streams down within the grace period; only force-abort if something
    // hangs past that.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(shutdown_grace.max(std::time::Duration::from_secs(1)), drain)
        .await
        .is_err()
    {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
