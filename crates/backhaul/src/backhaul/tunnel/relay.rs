use std::io;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tokio_util::sync::CancellationToken;

/// When a [`splice`] is considered finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// Tear down both directions as soon as one of them ends.
    Either,
    /// Wait until both directions have ended on their own.
    Both,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from `a` to `b`.
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`.
    pub b_to_a: u64,
}

/// Copies bytes between `a` and `b` on two spawned tasks.
///
/// `stop` interrupts both directions. Whatever the exit path, both copy tasks
/// are joined and both sockets are closed before this returns.
pub async fn splice(
    a: TcpStream,
    b: TcpStream,
    stop: &CancellationToken,
    finish: Finish,
    label: &'static str,
) -> RelayStats {
    let (ar, aw) = a.into_split();
    let (br, bw) = b.into_split();

    // Child token: cancelled by `stop` or by us once the relay should end.
    let halt = stop.child_token();
    let mut a_to_b = tokio::spawn(copy_half(ar, bw, halt.clone(), label, "a->b"));
    let mut b_to_a = tokio::spawn(copy_half(br, aw, halt.clone(), label, "b->a"));

    let mut stats = RelayStats::default();
    match finish {
        Finish::Either => {
            tokio::select! {
                _ = halt.cancelled() => {
                    stats.a_to_b = joined(a_to_b.await, label, "a->b");
                    stats.b_to_a = joined(b_to_a.await, label, "b->a");
                }
                res = &mut a_to_b => {
                    halt.cancel();
                    stats.a_to_b = joined(res, label, "a->b");
                    stats.b_to_a = joined(b_to_a.await, label, "b->a");
                }
                res = &mut b_to_a => {
                    halt.cancel();
                    stats.b_to_a = joined(res, label, "b->a");
                    stats.a_to_b = joined(a_to_b.await, label, "a->b");
                }
            }
        }
        Finish::Both => {
            stats.a_to_b = joined(a_to_b.await, label, "a->b");
            stats.b_to_a = joined(b_to_a.await, label, "b->a");
        }
    }

    metrics::counter!("backhaul_bytes_relayed_total", "relay" => label).increment(stats.a_to_b + stats.b_to_a);
    stats
}

/// Bytes copied by a finished copy task; a panicked task counts as zero.
fn joined(res: Result<u64, tokio::task::JoinError>, label: &'static str, dir: &'static str) -> u64 {
    match res {
        Ok(n) => n,
        Err(err) => {
            tracing::warn!(relay = label, dir, err = %err, "relay: copy task failed");
            0
        }
    }
}

async fn copy_half(
    mut r: OwnedReadHalf,
    mut w: OwnedWriteHalf,
    halt: CancellationToken,
    label: &'static str,
    dir: &'static str,
) -> u64 {
    tracing::debug!(relay = label, dir, "relay: start copy");
    let mut copied = 0u64;
    let res = tokio::select! {
        _ = halt.cancelled() => Ok::<(), io::Error>(()),
        res = copy_counting(&mut r, &mut w, &mut copied) => res,
    };
    // Propagate EOF to the peer; the socket itself closes once both halves drop.
    let _ = w.shutdown().await;
    match res {
        Ok(()) => tracing::debug!(relay = label, dir, bytes = copied, "relay: copy ended"),
        Err(err) => tracing::debug!(relay = label, dir, bytes = copied, err = %err, "relay: copy ended"),
    }
    copied
}

async fn copy_counting(
    r: &mut OwnedReadHalf,
    w: &mut OwnedWriteHalf,
    copied: &mut u64,
) -> io::Result<()> {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        w.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}
