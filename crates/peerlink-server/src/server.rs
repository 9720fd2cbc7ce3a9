//! Control gateway: owns the listener, the accept loop and the read loop of
//! the single active control connection.

use crate::context::RelayContext;
use crate::notifier::Claim;
use crate::router::MessageRouter;
use peerlink_core::{EnvelopeDecoder, RelayError, RelayResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct ControlGateway {
    ctx: Arc<RelayContext>,
    router: MessageRouter,
}

impl ControlGateway {
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        let router = MessageRouter::new(&ctx);
        Self { ctx, router }
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(self) -> RelayResult<()> {
        let addr = self.ctx.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayError::Transport(format!("bind {addr} failed: {e}")))?;
        info!(addr = %addr, "control listener started");
        self.serve(listener).await
    }

    /// Accept control connections on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> RelayResult<()> {
        let gateway = Arc::new(self);
        gateway.spawn_sweeper();

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                    continue;
                }
            };

            let Some(claim) = gateway.ctx.notifier.claim(remote).await else {
                info!(remote = %remote, "rejected control connection, another client is active");
                drop(stream);
                continue;
            };

            info!(remote = %remote, conn_id = claim.id, "control client connected");
            let gateway = gateway.clone();
            tokio::spawn(async move {
                gateway.handle_connection(stream, remote, claim).await;
            });
        }
    }

    /// Periodically close sessions older than the configured TTL.
    fn spawn_sweeper(&self) {
        let Some(ttl) = self.ctx.config.session_ttl else {
            return;
        };
        let registry = self.ctx.registry.clone();
        let every = self.ctx.config.gc_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                registry.sweep(ttl).await;
            }
        });
    }

    async fn handle_connection(&self, stream: TcpStream, remote: SocketAddr, claim: Claim) {
        let (mut reader, writer) = stream.into_split();
        let writer_task = tokio::spawn(write_loop(writer, claim.frames, remote));

        let result = self.read_loop(&mut reader).await;

        // Cleanup runs on every exit path of the read loop.
        match result {
            Ok(()) => info!(remote = %remote, "control client disconnected"),
            Err(e) => warn!(remote = %remote, error = %e, "control connection closed"),
        }

        // Evict while the slot is still held, so a client accepted after the
        // release never loses sessions to this cleanup.
        if self.ctx.config.evict_on_disconnect {
            self.ctx.registry.evict_all().await;
        } else {
            let sessions = self.ctx.registry.count().await;
            debug!(sessions, "sessions kept after disconnect");
        }
        self.ctx.notifier.release(claim.id).await;

        // The writer drains what is already queued, then shuts the socket.
        if let Err(e) = writer_task.await {
            warn!(remote = %remote, error = %e, "writer task failed");
        }
    }

    async fn read_loop(&self, reader: &mut OwnedReadHalf) -> RelayResult<()> {
        let mut decoder = EnvelopeDecoder::new(self.ctx.config.max_frame_size);
        let mut buf = vec![0u8; self.ctx.config.read_chunk_size];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                if decoder.pending() > 0 {
                    debug!(bytes = decoder.pending(), "discarding incomplete message");
                }
                return Ok(());
            }
            for decoded in decoder.feed(&buf[..n]) {
                self.router.route(decoded).await;
            }
        }
    }
}

/// Single writer for the control socket: frames go out whole and in order.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Vec<u8>>,
    remote: SocketAddr,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            warn!(remote = %remote, error = %e, "error sending message to control client");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
