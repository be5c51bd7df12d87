use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::{codec::FramedRead, sync::CancellationToken};

use crate::backhaul::{net, telemetry};
use crate::backhaul::tunnel::{
    lifecycle::Lifecycle,
    pipeline::{DEFAULT_RENDEZVOUS_TIMEOUT, Pipeline},
    protocol::{
        InitResponse, Message, MessageCodec, MessageKind, MessageRegistry, ProtocolError,
        ReportError, WireTo,
    },
    registry::{Closer, Registry},
};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Decoded messages buffered between the reader task and the dispatch loop.
const READ_QUEUE: usize = 16;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("timeout in call")]
    CallTimeout,
    #[error("reply to {request} is {got}, expected {expected}")]
    UnexpectedReply {
        request: MessageKind,
        expected: MessageKind,
        got: MessageKind,
    },
    #[error("connection closed by peer")]
    Disconnected,
    #[error("stop requested")]
    Stopped,
    #[error("channel already ran")]
    AlreadyRan,
    #[error("listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("error reported by broker: {0}")]
    Reported(String),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Serialized writer for one control connection.
///
/// Shared between the dispatch loop and the accept loop, so whole records are
/// written under a lock and never interleave.
pub struct ControlWriter {
    half: tokio::sync::Mutex<OwnedWriteHalf>,
    registry: Arc<MessageRegistry>,
}

impl ControlWriter {
    pub fn new(half: OwnedWriteHalf, registry: Arc<MessageRegistry>) -> Self {
        Self {
            half: tokio::sync::Mutex::new(half),
            registry,
        }
    }

    pub async fn send(&self, m: &Message) -> Result<(), ProtocolError> {
        let frame = self.registry.encode_frame(m)?;
        let mut w = self.half.lock().await;
        w.write_all(&frame).await?;
        Ok(())
    }

    /// Half-closes the connection; the peer reads EOF.
    pub async fn shutdown(&self) {
        let _ = self.half.lock().await.shutdown().await;
    }
}

/// Background task turning the inbound byte stream into a message queue.
pub struct ControlReader {
    rx: mpsc::Receiver<Message>,
    stop: CancellationToken,
    task: JoinHandle<Result<(), ProtocolError>>,
}

impl ControlReader {
    pub fn spawn(half: OwnedReadHalf, registry: Arc<MessageRegistry>) -> Self {
        let (tx, rx) = mpsc::channel(READ_QUEUE);
        let stop = CancellationToken::new();
        let task = tokio::spawn(read_loop(half, registry, tx, stop.clone()));
        Self { rx, stop, task }
    }

    /// Next decoded message; `None` once the reader has finished.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Stops the reader, drains its queue until it closes and returns how it ended.
    pub async fn shutdown(mut self) -> Result<(), ProtocolError> {
        self.stop.cancel();
        while self.rx.recv().await.is_some() {}
        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(ProtocolError::Io(io::Error::other(err))),
        }
    }
}

async fn read_loop(
    half: OwnedReadHalf,
    registry: Arc<MessageRegistry>,
    tx: mpsc::Sender<Message>,
    stop: CancellationToken,
) -> Result<(), ProtocolError> {
    let mut frames = FramedRead::new(half, MessageCodec::new(registry));
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            next = frames.next() => next,
        };
        let m = match next {
            None => {
                tracing::info!("channel: reader finished gracefully");
                return Ok(());
            }
            Some(Err(err)) => {
                tracing::error!(err=%err, "channel: decode message");
                return Err(err);
            }
            Some(Ok(m)) => m,
        };
        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            res = tx.send(m) => {
                if res.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Writes `out` and waits for the next inbound message.
///
/// Only one call may be outstanding per connection: the reply is simply the
/// next message read, there is no request correlation. `timeout` bounds the
/// write as well as the wait for the reply.
pub async fn call(
    writer: &ControlWriter,
    reader: &mut ControlReader,
    out: Message,
    timeout: Duration,
    stop: &CancellationToken,
) -> Result<Message, ChannelError> {
    let exchange = async {
        writer.send(&out).await?;
        reader.recv().await.ok_or(ChannelError::Disconnected)
    };
    tokio::select! {
        _ = stop.cancelled() => Err(ChannelError::Stopped),
        res = tokio::time::timeout(timeout, exchange) => match res {
            Ok(res) => res,
            Err(_) => Err(ChannelError::CallTimeout),
        },
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Host the public and rendezvous listeners bind on.
    pub bind_host: String,
    /// Host announced in `wire-to` instead of the rendezvous listener's local IP.
    pub advertise_host: Option<String>,
    pub call_timeout: Duration,
    pub rendezvous_timeout: Duration,
    pub registry: Arc<MessageRegistry>,
}

impl ChannelOptions {
    pub fn new(bind_host: impl Into<String>, registry: Arc<MessageRegistry>) -> Self {
        Self {
            bind_host: bind_host.into(),
            advertise_host: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            rendezvous_timeout: DEFAULT_RENDEZVOUS_TIMEOUT,
            registry,
        }
    }

    fn rendezvous_addr(&self, local: SocketAddr) -> String {
        match self.advertise_host.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => net::join_host_port(host, local.port()),
            _ => local.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    hello: Option<InitResponse>,
    public_addr: Option<SocketAddr>,
}

/// Snapshot of a live channel for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub peer: String,
    pub name: Option<String>,
    pub exposed_port: Option<u16>,
    pub public_addr: Option<String>,
    pub pipelines: usize,
    pub closing: bool,
    pub started_at_unix_ms: u64,
}

/// Broker side of one control connection.
///
/// Performs the handshake, exposes the requested port and spawns a
/// [`Pipeline`] for every public connection, telling the client where to
/// wire it up.
pub struct Channel {
    conn: Mutex<Option<TcpStream>>,
    peer: Option<SocketAddr>,
    opts: ChannelOptions,
    pipelines: Arc<Registry<Pipeline>>,
    state: Mutex<SessionState>,
    started_at_unix_ms: u64,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new(conn: TcpStream, opts: ChannelOptions) -> Self {
        let peer = conn.peer_addr().ok();
        Self {
            conn: Mutex::new(Some(conn)),
            peer,
            opts,
            pipelines: Arc::new(Registry::new()),
            state: Mutex::new(SessionState::default()),
            started_at_unix_ms: telemetry::now_unix_ms(),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Address of the public listener once the handshake has succeeded.
    pub fn public_addr(&self) -> Option<SocketAddr> {
        self.with_state(|st| st.public_addr)
    }

    pub fn pipelines(&self) -> Arc<Registry<Pipeline>> {
        self.pipelines.clone()
    }

    pub async fn info(&self) -> ChannelInfo {
        let st = self.with_state(|st| st.clone());
        ChannelInfo {
            peer: self.peer.map(|p| p.to_string()).unwrap_or_default(),
            name: st.hello.as_ref().map(|h| h.name.clone()),
            exposed_port: st.hello.as_ref().map(|h| h.port),
            public_addr: st.public_addr.map(|a| a.to_string()),
            pipelines: self.pipelines.len().await,
            closing: self.lifecycle.is_stopping(),
            started_at_unix_ms: self.started_at_unix_ms,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        match self.state.lock() {
            Ok(mut st) => f(&mut st),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Drives the session until the peer disconnects, a protocol error occurs
    /// or [`Channel::close`] is called. Returns only after full teardown.
    pub async fn run(&self) -> Result<(), ChannelError> {
        let _done = self.lifecycle.guard();
        metrics::counter!("backhaul_channels_total").increment(1);
        metrics::gauge!("backhaul_active_channels").increment(1.0);

        let res = self.run_inner().await;

        metrics::gauge!("backhaul_active_channels").decrement(1.0);
        match &res {
            Ok(()) => tracing::info!(peer=?self.peer, "channel: done"),
            Err(err) => tracing::warn!(peer=?self.peer, err=%err, "channel: done with error"),
        }
        res
    }

    async fn run_inner(&self) -> Result<(), ChannelError> {
        let conn = match self.conn.lock() {
            Ok(mut c) => c.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(conn) = conn else {
            return Err(ChannelError::AlreadyRan);
        };

        let registry = self.opts.registry.clone();
        let (rd, wr) = conn.into_split();
        let writer = Arc::new(ControlWriter::new(wr, registry.clone()));
        let mut reader = ControlReader::spawn(rd, registry);
        let stop = self.lifecycle.stop_token();

        let hello = match self.request_init(&writer, &mut reader).await {
            Ok(h) => h,
            Err(err) => {
                tracing::error!(peer=?self.peer, err=%err, "channel: call init-request");
                return Err(abort(&writer, reader, err).await);
            }
        };
        tracing::info!(
            peer=?self.peer,
            name=%hello.name,
            port=hello.port,
            "channel: got init-response; spawn listener"
        );
        let port = hello.port;
        self.with_state(|st| st.hello = Some(hello));

        let bind = net::join_host_port(&self.opts.bind_host, port);
        let ln = match TcpListener::bind(&bind).await {
            Ok(ln) => ln,
            Err(source) => {
                tracing::error!(bind=%bind, err=%source, "channel: listen failed");
                self.report_error(&writer, &mut reader, format!("listen on {bind:?} failed: {source}"))
                    .await;
                let err = ChannelError::Bind { addr: bind, source };
                return Err(abort(&writer, reader, err).await);
            }
        };
        self.with_state(|st| st.public_addr = ln.local_addr().ok());

        let accept_stop = stop.child_token();
        let accept_task = tokio::spawn(accept_loop(
            ln,
            writer.clone(),
            self.pipelines.clone(),
            self.opts.clone(),
            accept_stop.clone(),
        ));

        let res = loop {
            tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                m = reader.recv() => match m {
                    // Reader is done; how it ended is collected below.
                    None => break Ok(()),
                    Some(m) => tracing::warn!(peer=?self.peer, kind=%m.kind(), "channel: message without request"),
                },
            }
        };

        accept_stop.cancel();
        if let Err(err) = accept_task.await {
            tracing::warn!(err=%err, "channel: accept loop panicked");
        }
        self.pipelines.close_all().await;
        writer.shutdown().await;
        let read_res = reader.shutdown().await;
        res.and(read_res.map_err(ChannelError::from))
    }

    async fn request_init(
        &self,
        writer: &ControlWriter,
        reader: &mut ControlReader,
    ) -> Result<InitResponse, ChannelError> {
        let stop = self.lifecycle.stop_token();
        let reply = call(writer, reader, Message::InitRequest, self.opts.call_timeout, stop).await?;
        match reply {
            Message::InitResponse(r) => Ok(r),
            other => Err(ChannelError::UnexpectedReply {
                request: MessageKind::InitRequest,
                expected: MessageKind::InitResponse,
                got: other.kind(),
            }),
        }
    }

    /// Best-effort `report-error` call; the client acknowledges before hanging up.
    async fn report_error(&self, writer: &ControlWriter, reader: &mut ControlReader, error: String) {
        let stop = self.lifecycle.stop_token();
        let out = Message::ReportError(ReportError { error });
        match call(writer, reader, out, self.opts.call_timeout, stop).await {
            Ok(Message::Ack) => tracing::debug!(peer=?self.peer, "channel: report-error acknowledged"),
            Ok(other) => {
                tracing::warn!(peer=?self.peer, kind=%other.kind(), "channel: unexpected reply to report-error")
            }
            Err(err) => tracing::warn!(peer=?self.peer, err=%err, "channel: report-error not acknowledged"),
        }
    }

    /// Stops the channel and waits until `run` has fully unwound.
    pub async fn close(&self) {
        self.lifecycle.close().await
    }
}

#[async_trait]
impl Closer for Channel {
    async fn close(&self) {
        self.lifecycle.close().await
    }
}

/// Closes the connection after a failed handshake and prefers the reader's
/// protocol error over a plain disconnect.
async fn abort(writer: &ControlWriter, reader: ControlReader, err: ChannelError) -> ChannelError {
    writer.shutdown().await;
    match (err, reader.shutdown().await) {
        (ChannelError::Disconnected, Err(perr)) => ChannelError::Protocol(perr),
        (err, _) => err,
    }
}

async fn accept_loop(
    ln: TcpListener,
    writer: Arc<ControlWriter>,
    pipelines: Arc<Registry<Pipeline>>,
    opts: ChannelOptions,
    stop: CancellationToken,
) {
    let local = ln.local_addr().ok();
    tracing::info!(addr=?local, "channel: accept connections");
    loop {
        let (conn, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            res = ln.accept() => match res {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(addr=?local, err=%err, "channel: accept failed");
                    break;
                }
            },
        };
        tracing::info!(peer=%peer, "channel: new connection");

        let pl = match Pipeline::bind(conn, &opts.bind_host, opts.rendezvous_timeout).await {
            Ok(pl) => Arc::new(pl),
            Err(err) => {
                tracing::error!(peer=%peer, err=%err, "channel: new pipeline");
                continue;
            }
        };
        metrics::counter!("backhaul_pipelines_total").increment(1);
        let addr = opts.rendezvous_addr(pl.addr());

        // Registered before spawning: once this loop is joined no add can race close_all.
        let id = pipelines.add(pl.clone()).await;
        {
            let pipelines = pipelines.clone();
            tokio::spawn(async move {
                let outcome = pl.run().await;
                tracing::debug!(id, outcome=?outcome, "channel: pipeline finished");
                pipelines.remove(id).await;
            });
        }

        // The rendezvous listener is already accepting at this point.
        tracing::info!(addr=%addr, "channel: spawn pipeline");
        // A client that stopped reading can block this write indefinitely.
        let msg = Message::WireTo(WireTo { addr });
        tokio::select! {
            _ = stop.cancelled() => break,
            res = writer.send(&msg) => {
                if let Err(err) = res {
                    tracing::warn!(err=%err, "channel: send wire-to");
                }
            }
        }
    }
    tracing::info!(addr=?local, "channel: listener: stop");
}
