use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backhaul::{admin, config, logging, net, telemetry, tunnel};

/// Which side of the tunnel to run, with command-line overrides for the config file.
#[derive(Debug, Clone)]
pub enum Mode {
    Server {
        bind: Option<String>,
    },
    Client {
        host: Option<String>,
        expose: Option<u16>,
        target: Option<String>,
        name: Option<String>,
    },
}

impl Mode {
    fn apply(&self, cfg: &mut config::Config) {
        match self {
            Mode::Server { bind } => {
                if let Some(v) = bind {
                    cfg.server.bind = v.clone();
                }
            }
            Mode::Client {
                host,
                expose,
                target,
                name,
            } => {
                if let Some(v) = host {
                    cfg.client.host = v.clone();
                }
                if let Some(v) = expose {
                    cfg.client.expose = *v;
                }
                if let Some(v) = target {
                    cfg.client.target = v.clone();
                }
                if let Some(v) = name {
                    cfg.client.name = v.clone();
                }
            }
        }
    }
}

/// Top-level actor owned by the process.
enum Actor {
    Server(Arc<tunnel::server::Server>),
    Client(Arc<tunnel::client::Client>),
}

impl Actor {
    async fn close(&self) {
        match self {
            Actor::Server(s) => s.close().await,
            Actor::Client(c) => c.close().await,
        }
    }
}

pub async fn run(config_path: Option<PathBuf>, mode: Mode) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let mut cfg = config::load_resolved(&resolved)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    mode.apply(&mut cfg);

    let _logrt = logging::init(&cfg.logging)?;

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        admin_addr = %cfg.admin_addr,
        call_timeout = %humantime::format_duration(cfg.timeouts.call),
        rendezvous_timeout = %humantime::format_duration(cfg.timeouts.rendezvous),
        "backhaul: starting"
    );

    let registry = Arc::new(tunnel::protocol::MessageRegistry::standard());
    let shutdown = CancellationToken::new();
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let actor = match &mode {
        Mode::Server { .. } => {
            let server = Arc::new(
                tunnel::server::Server::bind(tunnel::server::ServerOptions {
                    listen_addr: cfg.server.bind.clone(),
                    public_host: cfg.server.public_host.clone(),
                    advertise_host: cfg.server.advertise_host.clone(),
                    call_timeout: cfg.timeouts.call,
                    rendezvous_timeout: cfg.timeouts.rendezvous,
                    registry,
                })
                .await?,
            );

            if !cfg.admin_addr.trim().is_empty() {
                let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
                let addr: SocketAddr = admin_addr
                    .parse()
                    .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
                let state = admin::AdminState {
                    prom: Arc::new(telemetry::init_prometheus()?),
                    channels: server.channels(),
                };
                let shutdown = shutdown.clone();
                tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
            }

            let s = server.clone();
            tasks.spawn(async move { s.run().await });
            Actor::Server(server)
        }
        Mode::Client { .. } => {
            let target = net::resolve_target(&cfg.client.target)
                .await
                .with_context(|| format!("resolve target {:?}", cfg.client.target))?;
            tracing::info!(target = %cfg.client.target, resolved = %target, "client: target resolved");

            let client = Arc::new(tunnel::client::Client::new(tunnel::client::ClientOptions {
                server_addr: cfg.client.host.clone(),
                name: cfg.client.name.clone(),
                expose: cfg.client.expose,
                target,
                dial_timeout: cfg.timeouts.dial,
                reconnect: cfg.client.reconnect,
                registry,
            })?);

            let c = client.clone();
            tasks.spawn(async move { c.run().await.context("client session") });
            Actor::Client(client)
        }
    };

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or the actor ending on its own.
    let mut result = Ok(());
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            match res {
                Some(Ok(Ok(()))) | None => tracing::info!("shutdown: session ended"),
                Some(Ok(Err(err))) => result = Err(err),
                Some(Err(join_err)) => result = Err(join_err.into()),
            }
        }
    }

    actor.close().await;
    shutdown.cancel();

    // Hard cap so `docker stop` doesn't stall indefinitely.
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out; aborting tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let mut cfg = config::Config::default();
        Mode::Client {
            host: Some("broker:9201".into()),
            expose: Some(18080),
            target: None,
            name: Some("c1".into()),
        }
        .apply(&mut cfg);
        assert_eq!(cfg.client.host, "broker:9201");
        assert_eq!(cfg.client.expose, 18080);
        assert_eq!(cfg.client.target, "google.de");
        assert_eq!(cfg.client.name, "c1");

        Mode::Server { bind: Some(":9300".into()) }.apply(&mut cfg);
        assert_eq!(cfg.server.bind, ":9300");
    }
}
