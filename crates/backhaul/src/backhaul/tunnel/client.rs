use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::backhaul::net;
use crate::backhaul::tunnel::{
    channel::{ChannelError, ControlReader, ControlWriter},
    lifecycle::Lifecycle,
    protocol::{InitResponse, Message, MessageRegistry},
    wire::{DEFAULT_DIAL_TIMEOUT, Wire},
};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Broker control address.
    pub server_addr: String,
    pub name: String,
    /// Port the broker should expose on our behalf.
    pub expose: u16,
    /// Dialable local target every wire is bridged to.
    pub target: String,
    pub dial_timeout: Duration,
    /// Redial the broker after a session ends.
    pub reconnect: bool,
    pub registry: Arc<MessageRegistry>,
}

/// Client side of the tunnel: one control session at a time.
pub struct Client {
    opts: ClientOptions,
    lifecycle: Lifecycle,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server address is required");
        }
        if opts.target.trim().is_empty() {
            anyhow::bail!("tunnel: client target is required");
        }
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = DEFAULT_DIAL_TIMEOUT;
        }
        Ok(Self {
            opts,
            lifecycle: Lifecycle::new(),
        })
    }

    /// Runs sessions until one ends (or, with `reconnect`, until [`Client::close`]).
    pub async fn run(&self) -> Result<(), ChannelError> {
        let _done = self.lifecycle.guard();
        let stop = self.lifecycle.stop_token();

        let mut backoff = MIN_BACKOFF;
        loop {
            let res = self.run_once(stop).await;
            if stop.is_cancelled() {
                return Ok(());
            }
            if !self.opts.reconnect {
                return res;
            }

            match &res {
                Ok(()) => tracing::info!(
                    server=%self.opts.server_addr,
                    backoff=%humantime::format_duration(backoff),
                    "client: session ended; reconnecting"
                ),
                Err(err) => tracing::warn!(
                    server=%self.opts.server_addr,
                    err=%err,
                    backoff=%humantime::format_duration(backoff),
                    "client: session failed; retrying"
                ),
            }

            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn run_once(&self, stop: &CancellationToken) -> Result<(), ChannelError> {
        let conn = tokio::select! {
            _ = stop.cancelled() => return Err(ChannelError::Stopped),
            res = net::dial(&self.opts.server_addr, self.opts.dial_timeout) => res?,
        };
        tracing::info!(server=%self.opts.server_addr, name=%self.opts.name, "client: connected");

        let registry = self.opts.registry.clone();
        let (rd, wr) = conn.into_split();
        let writer = ControlWriter::new(wr, registry.clone());
        let mut reader = ControlReader::spawn(rd, registry);

        let res = loop {
            let m = tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                m = reader.recv() => m,
            };
            let Some(m) = m else {
                tracing::info!(server=%self.opts.server_addr, "client: broker closed the connection");
                break Ok(());
            };
            if let Err(err) = self.dispatch(&writer, m).await {
                break Err(err);
            }
        };

        writer.shutdown().await;
        let read_res = reader.shutdown().await;
        res.and(read_res.map_err(ChannelError::from))
    }

    async fn dispatch(&self, writer: &ControlWriter, m: Message) -> Result<(), ChannelError> {
        match m {
            Message::InitRequest => {
                tracing::info!(name=%self.opts.name, port=self.opts.expose, "client: answering init-request");
                let hello = InitResponse {
                    name: self.opts.name.clone(),
                    port: self.opts.expose,
                };
                writer.send(&Message::InitResponse(hello)).await?;
            }
            Message::WireTo(w) => {
                tracing::info!(rendezvous=%w.addr, target=%self.opts.target, "client: spawn wire");
                let wire = Wire::new(w.addr, self.opts.target.clone()).with_dial_timeout(self.opts.dial_timeout);
                tokio::spawn(wire.run());
            }
            Message::ReportError(r) => {
                tracing::error!(err=%r.error, "client: broker reported an error");
                if let Err(err) = writer.send(&Message::Ack).await {
                    tracing::warn!(err=%err, "client: send ack");
                }
                return Err(ChannelError::Reported(r.error));
            }
            other => {
                tracing::warn!(kind=%other.kind(), "client: unexpected message; ignoring");
            }
        }
        Ok(())
    }

    /// Stops the client and waits until `run` has returned.
    pub async fn close(&self) {
        self.lifecycle.close().await
    }
}
