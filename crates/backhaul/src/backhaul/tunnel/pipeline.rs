use std::{io, net::SocketAddr, sync::Mutex, time::Duration};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::backhaul::net;
use crate::backhaul::tunnel::{
    lifecycle::Lifecycle,
    registry::Closer,
    relay::{self, Finish, RelayStats},
};

pub const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(10);

/// How a pipeline's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Closed from outside before a rendezvous arrived.
    Stopped,
    /// No rendezvous connection within the accept timeout.
    Expired,
    /// The rendezvous listener failed while accepting.
    AcceptFailed,
    /// Bytes were relayed until one side (or a stop) ended the session.
    Relayed(RelayStats),
    /// `run` was invoked a second time.
    AlreadyRan,
}

/// Broker-side rendezvous for one forwarded public connection.
///
/// Binds an ephemeral listener at construction; the client's wire is expected
/// to dial [`Pipeline::addr`] within the accept timeout.
pub struct Pipeline {
    addr: SocketAddr,
    peer: Option<SocketAddr>,
    parts: Mutex<Option<(TcpStream, TcpListener)>>,
    accept_timeout: Duration,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("addr", &self.addr)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub async fn bind(inbound: TcpStream, host: &str, accept_timeout: Duration) -> io::Result<Self> {
        let ln = TcpListener::bind(net::join_host_port(host, 0)).await?;
        let addr = ln.local_addr()?;
        let peer = inbound.peer_addr().ok();
        Ok(Self {
            addr,
            peer,
            parts: Mutex::new(Some((inbound, ln))),
            accept_timeout,
            lifecycle: Lifecycle::new(),
        })
    }

    /// Local address of the rendezvous listener.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn run(&self) -> PipelineOutcome {
        let _done = self.lifecycle.guard();
        metrics::gauge!("backhaul_active_pipelines").increment(1.0);
        let outcome = self.run_inner().await;
        metrics::gauge!("backhaul_active_pipelines").decrement(1.0);
        outcome
    }

    async fn run_inner(&self) -> PipelineOutcome {
        let parts = match self.parts.lock() {
            Ok(mut p) => p.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some((inbound, ln)) = parts else {
            tracing::warn!(addr=%self.addr, "pipeline: run called twice");
            return PipelineOutcome::AlreadyRan;
        };

        let stop = self.lifecycle.stop_token();
        // Dropping `ln` and `inbound` on the early returns closes both sockets.
        let rendezvous = tokio::select! {
            _ = stop.cancelled() => {
                tracing::debug!(addr=%self.addr, "pipeline: stopped before rendezvous");
                return PipelineOutcome::Stopped;
            }
            _ = tokio::time::sleep(self.accept_timeout) => {
                metrics::counter!("backhaul_pipeline_timeouts_total").increment(1);
                tracing::info!(
                    addr=%self.addr,
                    peer=?self.peer,
                    timeout=%humantime::format_duration(self.accept_timeout),
                    "pipeline: no rendezvous; dropping public connection"
                );
                return PipelineOutcome::Expired;
            }
            res = ln.accept() => match res {
                Ok((conn, from)) => {
                    tracing::debug!(addr=%self.addr, from=%from, "pipeline: rendezvous connected");
                    conn
                }
                Err(err) => {
                    tracing::info!(addr=%self.addr, err=%err, "pipeline: accept error");
                    return PipelineOutcome::AcceptFailed;
                }
            }
        };
        drop(ln);

        tracing::info!(addr=%self.addr, peer=?self.peer, "pipeline: start copying");
        let stats = relay::splice(inbound, rendezvous, stop, Finish::Either, "pipeline").await;
        tracing::info!(
            addr=%self.addr,
            inbound_bytes = stats.a_to_b,
            outbound_bytes = stats.b_to_a,
            "pipeline: stop copying"
        );
        PipelineOutcome::Relayed(stats)
    }

    /// Stops the pipeline and waits until its run loop has exited.
    pub async fn close(&self) {
        self.lifecycle.close().await
    }
}

#[async_trait]
impl Closer for Pipeline {
    async fn close(&self) {
        self.lifecycle.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn public_pair() -> (TcpStream, TcpStream) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (c, s) = tokio::join!(TcpStream::connect(addr), ln.accept());
        (c.unwrap(), s.unwrap().0)
    }

    #[tokio::test]
    async fn abandoned_rendezvous_closes_everything() {
        let (mut dialer, inbound) = public_pair().await;
        let pl = Arc::new(
            Pipeline::bind(inbound, "127.0.0.1", Duration::from_millis(100))
                .await
                .unwrap(),
        );
        let addr = pl.addr();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);

        let outcome = pl.run().await;
        assert_eq!(outcome, PipelineOutcome::Expired);

        // Public side observes the close.
        let mut buf = [0u8; 4];
        assert_eq!(dialer.read(&mut buf).await.unwrap_or(0), 0);
        // Rendezvous listener is gone.
        assert!(TcpStream::connect(addr).await.is_err());

        // Completion already fired; close returns without blocking.
        tokio::time::timeout(Duration::from_millis(100), pl.close())
            .await
            .unwrap();
        assert_eq!(pl.run().await, PipelineOutcome::AlreadyRan);
    }

    #[tokio::test]
    async fn close_before_rendezvous_stops_promptly() {
        let (mut dialer, inbound) = public_pair().await;
        let pl = Arc::new(
            Pipeline::bind(inbound, "127.0.0.1", DEFAULT_RENDEZVOUS_TIMEOUT)
                .await
                .unwrap(),
        );
        let run = {
            let pl = pl.clone();
            tokio::spawn(async move { pl.run().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::time::timeout(Duration::from_secs(2), pl.close())
            .await
            .expect("close must not wait for the accept timeout");
        assert_eq!(run.await.unwrap(), PipelineOutcome::Stopped);

        let mut buf = [0u8; 4];
        assert_eq!(dialer.read(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn relays_between_public_side_and_rendezvous() {
        let (mut dialer, inbound) = public_pair().await;
        let pl = Arc::new(
            Pipeline::bind(inbound, "127.0.0.1", Duration::from_secs(5))
                .await
                .unwrap(),
        );
        let addr = pl.addr();
        let run = {
            let pl = pl.clone();
            tokio::spawn(async move { pl.run().await })
        };

        let mut wire = TcpStream::connect(addr).await.unwrap();
        dialer.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        wire.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        wire.write_all(b"PONG").await.unwrap();
        dialer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG");

        // Rendezvous side hangs up: the pipeline ends and closes the public side.
        drop(wire);
        let outcome = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap();
        match outcome {
            PipelineOutcome::Relayed(stats) => {
                assert_eq!(stats.a_to_b, 4);
                assert_eq!(stats.b_to_a, 4);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(dialer.read(&mut buf).await.unwrap_or(0), 0);
    }
}
