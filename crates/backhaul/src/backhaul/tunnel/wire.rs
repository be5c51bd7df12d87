use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backhaul::net::dial;
use crate::backhaul::tunnel::relay::{self, Finish, RelayStats};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-side bridge between a broker rendezvous address and the local target.
#[derive(Debug, Clone)]
pub struct Wire {
    rendezvous: String,
    target: String,
    dial_timeout: Duration,
}

impl Wire {
    pub fn new(rendezvous: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            rendezvous: rendezvous.into(),
            target: target.into(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        if timeout > Duration::ZERO {
            self.dial_timeout = timeout;
        }
        self
    }

    /// Dials the target, then the rendezvous address, and relays until both
    /// directions are done. Returns `None` when either dial failed.
    pub async fn run(self) -> Option<RelayStats> {
        metrics::counter!("backhaul_wires_total").increment(1);

        // Target first: no point holding the broker's rendezvous slot for an unreachable target.
        let target = match dial(&self.target, self.dial_timeout).await {
            Ok(c) => c,
            Err(err) => {
                tracing::error!(target=%self.target, err=%err, "wire: connect to local target failed");
                return None;
            }
        };
        let rendezvous = match dial(&self.rendezvous, self.dial_timeout).await {
            Ok(c) => c,
            Err(err) => {
                tracing::error!(rendezvous=%self.rendezvous, err=%err, "wire: connect to rendezvous failed");
                return None;
            }
        };

        tracing::info!(rendezvous=%self.rendezvous, target=%self.target, "wire: start copy");
        // Wires are not tracked anywhere, so nothing ever cancels this token.
        let never = CancellationToken::new();
        let stats = relay::splice(rendezvous, target, &never, Finish::Both, "wire").await;
        tracing::info!(
            rendezvous=%self.rendezvous,
            target=%self.target,
            to_target = stats.a_to_b,
            from_target = stats.b_to_a,
            "wire: copy done"
        );
        Some(stats)
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    async fn unused_addr() -> String {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ln.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn unreachable_target_never_dials_rendezvous() {
        let rendezvous = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rendezvous_addr = rendezvous.local_addr().unwrap().to_string();

        let w = Wire::new(rendezvous_addr, unused_addr().await);
        assert!(w.run().await.is_none());

        let accepted =
            tokio::time::timeout(Duration::from_millis(100), rendezvous.accept()).await;
        assert!(accepted.is_err(), "rendezvous must not be dialed");
    }

    #[tokio::test]
    async fn unreachable_rendezvous_releases_target() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap().to_string();

        let w = Wire::new(unused_addr().await, target_addr);
        let run = tokio::spawn(w.run());

        let (mut conn, _) = target.accept().await.unwrap();
        assert!(run.await.unwrap().is_none());

        let mut buf = [0u8; 1];
        assert_eq!(conn.read(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn bridges_rendezvous_to_target() {
        // Echo target.
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut c, _) = target.accept().await.unwrap();
            let (mut r, mut w) = c.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let rendezvous = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rendezvous_addr = rendezvous.local_addr().unwrap().to_string();

        let run = tokio::spawn(Wire::new(rendezvous_addr, target_addr).run());
        let (mut broker_side, _) = rendezvous.accept().await.unwrap();

        broker_side.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        broker_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        broker_side.shutdown().await.unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .expect("both dials succeed");
        assert_eq!(stats.a_to_b, 4);
        assert_eq!(stats.b_to_a, 4);
    }
}
