use std::{net::SocketAddr, sync::{Arc, Mutex}, time::Duration};

use anyhow::Context;
use tokio::net::TcpListener;

use crate::backhaul::net;
use crate::backhaul::tunnel::{
    channel::{Channel, ChannelOptions},
    lifecycle::Lifecycle,
    protocol::MessageRegistry,
    registry::Registry,
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Control listener address; `:PORT` binds all interfaces.
    pub listen_addr: String,
    /// Host for public and rendezvous listeners; defaults to the host of `listen_addr`.
    pub public_host: Option<String>,
    /// Host announced to clients in `wire-to`.
    pub advertise_host: Option<String>,
    pub call_timeout: Duration,
    pub rendezvous_timeout: Duration,
    pub registry: Arc<MessageRegistry>,
}

/// Broker supervisor: accepts control connections and owns their channels.
pub struct Server {
    ln: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    channel_opts: ChannelOptions,
    channels: Arc<Registry<Channel>>,
    lifecycle: Lifecycle,
}

impl Server {
    pub async fn bind(opts: ServerOptions) -> anyhow::Result<Self> {
        let listen = net::normalize_bind_addr(&opts.listen_addr).into_owned();
        let bind_host = match opts.public_host.as_deref().map(str::trim) {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => net::host_of(&listen)?,
        };

        let ln = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("tunnel: listen on {listen}"))?;
        let local_addr = ln.local_addr()?;

        let mut channel_opts = ChannelOptions::new(bind_host, opts.registry);
        channel_opts.advertise_host = opts.advertise_host;
        if !opts.call_timeout.is_zero() {
            channel_opts.call_timeout = opts.call_timeout;
        }
        if !opts.rendezvous_timeout.is_zero() {
            channel_opts.rendezvous_timeout = opts.rendezvous_timeout;
        }

        Ok(Self {
            ln: Mutex::new(Some(ln)),
            local_addr,
            channel_opts,
            channels: Arc::new(Registry::new()),
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn channels(&self) -> Arc<Registry<Channel>> {
        self.channels.clone()
    }

    /// Accepts control connections until [`Server::close`], then closes every live channel.
    pub async fn run(&self) -> anyhow::Result<()> {
        let _done = self.lifecycle.guard();
        let ln = match self.ln.lock() {
            Ok(mut l) => l.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(ln) = ln else {
            anyhow::bail!("tunnel: server already ran");
        };
        let stop = self.lifecycle.stop_token();

        tracing::info!(
            addr=%self.local_addr,
            public_host=%self.channel_opts.bind_host,
            "server: listening"
        );

        let res = loop {
            let (conn, peer) = tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                res = ln.accept() => match res {
                    Ok(v) => v,
                    Err(err) => break Err(anyhow::Error::new(err).context("tunnel: accept")),
                },
            };
            tracing::info!(peer=%peer, "server: new control connection");

            let ch = Arc::new(Channel::new(conn, self.channel_opts.clone()));
            // Registered before spawning so close_all always sees it.
            let id = self.channels.add(ch.clone()).await;
            let channels = self.channels.clone();
            tokio::spawn(async move {
                if let Err(err) = ch.run().await {
                    tracing::warn!(id, peer=%peer, err=%err, "server: channel ended with error");
                }
                channels.remove(id).await;
            });
        };

        drop(ln);
        self.channels.close_all().await;
        tracing::info!(addr=%self.local_addr, "server: stopped");
        res
    }

    /// Stops accepting and waits until every channel has been torn down.
    pub async fn close(&self) {
        self.lifecycle.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(listen_addr: &str) -> ServerOptions {
        ServerOptions {
            listen_addr: listen_addr.into(),
            public_host: None,
            advertise_host: None,
            call_timeout: Duration::ZERO,
            rendezvous_timeout: Duration::ZERO,
            registry: Arc::new(MessageRegistry::standard()),
        }
    }

    #[tokio::test]
    async fn bind_derives_public_host_and_defaults() {
        let srv = Server::bind(opts("127.0.0.1:0")).await.unwrap();
        assert_ne!(srv.local_addr().port(), 0);
        assert_eq!(srv.channel_opts.bind_host, "127.0.0.1");
        assert_eq!(srv.channel_opts.call_timeout, crate::backhaul::tunnel::channel::DEFAULT_CALL_TIMEOUT);

        let mut o = opts("127.0.0.1:0");
        o.public_host = Some("0.0.0.0".into());
        let srv = Server::bind(o).await.unwrap();
        assert_eq!(srv.channel_opts.bind_host, "0.0.0.0");
    }

    #[tokio::test]
    async fn close_stops_idle_server() {
        let srv = Arc::new(Server::bind(opts("127.0.0.1:0")).await.unwrap());
        let addr = srv.local_addr();
        let run = {
            let s = srv.clone();
            tokio::spawn(async move { s.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), srv.close())
            .await
            .expect("close must not hang");
        assert!(run.await.unwrap().is_ok());
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
        assert!(srv.run().await.is_err());
    }
}
