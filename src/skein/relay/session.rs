//! Per-session protocol state machine.
//!
//! One control task per session decodes frames from the relay connection and
//! drives the stream table; one pump task per stream owns the destination
//! socket and moves bytes both ways. All outbound frames funnel through a
//! single writer task so concurrent streams can never interleave partial
//! frames on the shared connection.

use std::{
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::{mpsc, oneshot, watch},
};

use crate::skein::relay::{
    dialer::{DialError, Dialer},
    frame::{
        CloseReason, Frame, FrameCodec, FrameType, OpenRequest, ProtocolError, StreamProtocol,
        SESSION_STREAM_ID,
    },
    table::{StreamEntry, StreamInfo, StreamTable},
};

/// Depth of the shared outbound frame queue. When the client transport is
/// slow this fills up and pump sends block, which is the backpressure signal
/// that stops destination-socket reads.
const FRAME_QUEUE_DEPTH: usize = 64;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("relay transport: {0}")]
    Transport(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub session_id: u64,
    /// Per-stream inbound buffer depth, counted in DATA frames. Advertised to
    /// the client at session start and replenished via CONTINUE.
    pub stream_credit: u32,
    pub max_payload: usize,
    pub idle_timeout: Duration,
    pub shutdown_grace: Duration,
}

/// Runs one relay session over `transport` until the client disconnects, the
/// session is evicted, or a protocol violation makes the framing unusable.
/// Every remaining stream is torn down before this returns.
pub async fn run<S>(
    transport: S,
    table: Arc<StreamTable>,
    dialer: Arc<Dialer>,
    opts: SessionOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (rd, wr) = tokio::io::split(transport);
    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(FRAME_QUEUE_DEPTH);
    let writer = tokio::spawn(write_frames(wr, frame_rx));

    metrics::counter!("skein_sessions_total").increment(1);
    metrics::gauge!("skein_sessions_active").increment(1.0);

    let session = Session {
        table: table.clone(),
        dialer,
        frame_tx: frame_tx.clone(),
        opts: opts.clone(),
    };

    // Advertise the per-stream buffer depth before anything else.
    let result = if session
        .frame_tx
        .send(Frame::credit(SESSION_STREAM_ID, opts.stream_credit))
        .await
        .is_err()
    {
        Err(SessionError::Transport(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "relay writer closed",
        )))
    } else {
        session.read_loop(rd, &mut shutdown).await
    };

    // Teardown: session-fatal or not, no stream may outlive the session.
    table.shutdown(opts.shutdown_grace).await;
    drop(session);
    drop(frame_tx);
    let _ = writer.await;

    metrics::gauge!("skein_sessions_active").decrement(1.0);
    result
}

async fn write_frames<W>(mut wr: W, mut rx: mpsc::Receiver<Frame>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BytesMut::with_capacity(32 * 1024);
    while let Some(frame) = rx.recv().await {
        out.clear();
        frame.encode_into(&mut out);
        // Opportunistically batch whatever else is already queued.
        while let Ok(next) = rx.try_recv() {
            next.encode_into(&mut out);
        }
        wr.write_all(&out).await?;
        wr.flush().await?;
    }
    wr.shutdown().await
}

struct Session {
    table: Arc<StreamTable>,
    dialer: Arc<Dialer>,
    frame_tx: mpsc::Sender<Frame>,
    opts: SessionOptions,
}

impl Session {
    async fn read_loop<R>(
        &self,
        mut rd: R,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut codec = FrameCodec::new(self.opts.max_payload);
        let mut chunk = vec![0u8; READ_CHUNK];
        let idle = tokio::time::sleep(self.opts.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!(session = self.opts.session_id, "relay: shutdown signal");
                        return Ok(());
                    }
                }
                _ = idle.as_mut() => {
                    if self.table.is_empty() {
                        tracing::info!(session = self.opts.session_id, "relay: evicting idle session");
                        return Ok(());
                    }
                    idle.as_mut().reset(tokio::time::Instant::now() + self.opts.idle_timeout);
                }
                res = rd.read(&mut chunk) => {
                    let n = res?;
                    if n == 0 {
                        tracing::debug!(session = self.opts.session_id, "relay: client disconnected");
                        return Ok(());
                    }
                    idle.as_mut().reset(tokio::time::Instant::now() + self.opts.idle_timeout);
                    codec.extend(&chunk[..n]);
                    while let Some(frame) = codec.decode()? {
                        self.handle_frame(frame).await?;
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, frame: Frame) -> Result<(), SessionError> {
        match frame.frame_type {
            FrameType::Open => self.handle_open(frame).await,
            FrameType::Data => self.handle_data(frame),
            FrameType::Continue => {
                // Client-side drain signal. Outbound flow control rides on the
                // bounded frame queue and transport backpressure instead, so
                // this is informational. The payload still has to parse.
                let credit = frame.parse_credit()?;
                tracing::trace!(
                    session = self.opts.session_id,
                    stream = frame.stream_id,
                    credit,
                    "relay: client continue"
                );
                Ok(())
            }
            FrameType::Close => self.handle_close(frame),
        }
    }

    async fn handle_open(&self, frame: Frame) -> Result<(), SessionError> {
        let id = frame.stream_id;
        let req = frame.parse_open()?;

        if id == SESSION_STREAM_ID {
            return Err(ProtocolError::MalformedPayload("open").into());
        }
        if self.table.contains(id) {
            // A client reusing a live id has lost track of its own streams;
            // nothing it sends can be trusted after this.
            return Err(ProtocolError::DuplicateStream(id).into());
        }
        if req.protocol == StreamProtocol::Udp && !self.dialer.allow_udp() {
            return Err(ProtocolError::UdpDisabled.into());
        }
        if self.table.at_capacity() {
            tracing::warn!(
                session = self.opts.session_id,
                stream = id,
                "relay: stream limit reached"
            );
            metrics::counter!("skein_streams_rejected_total").increment(1);
            self.send(Frame::close(id, CloseReason::StreamLimit)).await?;
            return Ok(());
        }

        let (data_tx, data_rx) = mpsc::channel::<Bytes>(self.opts.stream_credit as usize);
        let credit = Arc::new(AtomicU32::new(self.opts.stream_credit));
        let bytes_in = Arc::new(AtomicU64::new(0));
        let bytes_out = Arc::new(AtomicU64::new(0));
        let info = StreamInfo {
            host: req.host.clone(),
            port: req.port,
            protocol: req.protocol,
        };

        tracing::debug!(
            session = self.opts.session_id,
            stream = id,
            host = %req.host,
            port = req.port,
            protocol = %req.protocol,
            "relay: opening stream"
        );
        metrics::counter!("skein_streams_total").increment(1);

        // The pump must not run (in particular must not remove itself from
        // the table) before the entry is registered.
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let ctx = PumpContext {
            session_id: self.opts.session_id,
            stream_id: id,
            dialer: self.dialer.clone(),
            table: self.table.clone(),
            frame_tx: self.frame_tx.clone(),
            credit: credit.clone(),
            replenish_at: (self.opts.stream_credit / 2).max(1),
            bytes_in: bytes_in.clone(),
            bytes_out: bytes_out.clone(),
            max_payload: self.opts.max_payload,
        };
        let pump = tokio::spawn(async move {
            if ready_rx.await.is_err() {
                return;
            }
            run_pump(ctx, req, data_rx).await;
        });

        self.table
            .create(id, StreamEntry::new(data_tx, credit, bytes_in, bytes_out, pump, info))?;
        let _ = ready_tx.send(());
        Ok(())
    }

    fn handle_data(&self, frame: Frame) -> Result<(), SessionError> {
        let id = frame.stream_id;
        let (tx, credit) = self.table.for_data(id)?;

        let has_credit = credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .is_ok();
        if !has_credit {
            return Err(ProtocolError::FlowControl(id).into());
        }

        match tx.try_send(frame.payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ProtocolError::FlowControl(id).into()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Pump already exited (destination died); its CLOSE frame is
                // in flight. The stray payload is dropped.
                tracing::trace!(
                    session = self.opts.session_id,
                    stream = id,
                    "relay: payload for dead stream dropped"
                );
                Ok(())
            }
        }
    }

    fn handle_close(&self, frame: Frame) -> Result<(), SessionError> {
        let reason = frame.parse_close()?;
        if self.table.begin_close(frame.stream_id) {
            tracing::debug!(
                session = self.opts.session_id,
                stream = frame.stream_id,
                reason = ?reason,
                "relay: client closed stream"
            );
        } else {
            // Already torn down (or never opened). Close is idempotent.
            tracing::trace!(
                session = self.opts.session_id,
                stream = frame.stream_id,
                "relay: close for unknown stream ignored"
            );
        }
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<(), SessionError> {
        self.frame_tx.send(frame).await.map_err(|_| {
            SessionError::Transport(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "relay writer closed",
            ))
        })
    }
}

struct PumpContext {
    session_id: u64,
    stream_id: u32,
    dialer: Arc<Dialer>,
    table: Arc<StreamTable>,
    frame_tx: mpsc::Sender<Frame>,
    credit: Arc<AtomicU32>,
    replenish_at: u32,
    bytes_in: Arc<AtomicU64>,
    bytes_out: Arc<AtomicU64>,
    max_payload: usize,
}

impl PumpContext {
    /// Returns credit to the client after `drained` payloads were written to
    /// the destination. Batched to roughly half the window.
    async fn replenish(&self, drained: &mut u32) -> bool {
        self.credit.fetch_add(*drained, Ordering::AcqRel);
        let ok = self
            .frame_tx
            .send(Frame::credit(self.stream_id, *drained))
            .await
            .is_ok();
        *drained = 0;
        ok
    }
}

async fn run_pump(ctx: PumpContext, req: OpenRequest, data_rx: mpsc::Receiver<Bytes>) {
    let close = match req.protocol {
        StreamProtocol::Tcp => match ctx.dialer.dial_tcp(&req.host, req.port).await {
            Ok(stream) => pump_tcp(&ctx, stream, data_rx).await,
            Err(err) => dial_failed(&ctx, &req, err),
        },
        StreamProtocol::Udp => match ctx.dialer.dial_udp(&req.host, req.port).await {
            Ok(socket) => pump_udp(&ctx, socket, data_rx).await,
            Err(err) => dial_failed(&ctx, &req, err),
        },
    };

    if let Some(reason) = close {
        let _ = ctx
            .frame_tx
            .send(Frame::close(ctx.stream_id, reason))
            .await;
    }
    ctx.table.remove(ctx.stream_id);
    tracing::debug!(
        session = ctx.session_id,
        stream = ctx.stream_id,
        bytes_in = ctx.bytes_in.load(Ordering::Relaxed),
        bytes_out = ctx.bytes_out.load(Ordering::Relaxed),
        "relay: stream closed"
    );
}

fn dial_failed(ctx: &PumpContext, req: &OpenRequest, err: DialError) -> Option<CloseReason> {
    tracing::debug!(
        session = ctx.session_id,
        stream = ctx.stream_id,
        host = %req.host,
        port = req.port,
        err = %err,
        "relay: dial failed"
    );
    metrics::counter!("skein_dial_errors_total", "kind" => err.kind()).increment(1);
    Some(err.close_reason())
}

async fn pump_tcp(
    ctx: &PumpContext,
    stream: TcpStream,
    mut data_rx: mpsc::Receiver<Bytes>,
) -> Option<CloseReason> {
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = vec![0u8; ctx.max_payload.min(READ_CHUNK)];
    let mut drained: u32 = 0;

    loop {
        tokio::select! {
            item = data_rx.recv() => match item {
                Some(payload) => {
                    let len = payload.len() as u64;
                    if wr.write_all(&payload).await.is_err() {
                        return Some(CloseReason::NetworkError);
                    }
                    ctx.bytes_in.fetch_add(len, Ordering::Relaxed);
                    drained += 1;
                    if drained >= ctx.replenish_at && !ctx.replenish(&mut drained).await {
                        return None;
                    }
                }
                None => {
                    // CLOSING: the client closed this stream and everything
                    // buffered has been written out above.
                    let _ = wr.shutdown().await;
                    return None;
                }
            },
            res = rd.read(&mut buf) => match res {
                Ok(0) => return Some(CloseReason::Eof),
                Ok(n) => {
                    ctx.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                    let frame = Frame::data(ctx.stream_id, Bytes::copy_from_slice(&buf[..n]));
                    if ctx.frame_tx.send(frame).await.is_err() {
                        return None;
                    }
                }
                Err(_) => return Some(CloseReason::NetworkError),
            },
        }
    }
}

async fn pump_udp(
    ctx: &PumpContext,
    socket: UdpSocket,
    mut data_rx: mpsc::Receiver<Bytes>,
) -> Option<CloseReason> {
    let mut buf = vec![0u8; ctx.max_payload];
    let mut drained: u32 = 0;

    loop {
        tokio::select! {
            item = data_rx.recv() => match item {
                Some(payload) => {
                    let len = payload.len() as u64;
                    if socket.send(&payload).await.is_err() {
                        return Some(CloseReason::NetworkError);
                    }
                    ctx.bytes_in.fetch_add(len, Ordering::Relaxed);
                    drained += 1;
                    if drained >= ctx.replenish_at && !ctx.replenish(&mut drained).await {
                        return None;
                    }
                }
                None => return None,
            },
            res = socket.recv(&mut buf) => match res {
                // One datagram maps to one DATA frame; anything beyond the
                // payload limit would have been truncated by the buffer size.
                Ok(n) => {
                    ctx.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                    let frame = Frame::data(ctx.stream_id, Bytes::copy_from_slice(&buf[..n]));
                    if ctx.frame_tx.send(frame).await.is_err() {
                        return None;
                    }
                }
                Err(_) => return Some(CloseReason::NetworkError),
            },
        }
    }
}
